//! Packet-line codec and wire-level types for the VCS mirror transport
//! engine.
//!
//! This crate has no I/O and no async: it is the pure, allocation-frugal
//! bottom layer that every connection state machine in `gitmirror-core`
//! builds on. Keeping it free of transport concerns is what lets the same
//! framing and ref/capability types be shared across the child-process,
//! SSH, and HTTP substrates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod capability;
mod error;
mod packet;
mod refs;

pub use capability::CapabilitySet;
pub use error::WireError;
pub use packet::{
    decode_header_bytes, encode_data, encode_marker, parse_one, sniff, HeaderValue, Marker, PacketKind,
    PacketLine, Sniff, MAX_DATA_LEN,
};
pub use refs::{Ref, RefChange, RefChangeKind, NULL_OBJECT_ID};
