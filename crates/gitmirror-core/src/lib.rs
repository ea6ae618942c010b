//! Connection state machines for mirroring one VCS repository into another
//! over the native wire protocol.
//!
//! This crate is transport-agnostic: it drives packet-line exchanges
//! through the [`transport::PacketTransport`] seam, and knows nothing about
//! child processes, SSH, or HTTP. The `gitmirror-transport-*` crates supply
//! those; `gitmirror-registry` picks one by URL scheme.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod credentials;
mod error;
mod fetch;
mod filter;
mod push;
mod refchange;
mod transport;

pub use config::{Config, HTTP_TIMEOUT_ENV};
pub use connection::{ConnectionCore, HelloOutcome, ProtocolVersion, AGENT};
pub use credentials::{Credential, Credentials, NoCredentials};
pub use error::ConnectionError;
pub use fetch::FetchConnection;
pub use filter::{FilterError, RefFilter};
pub use push::{PushConnection, PushReport};
pub use refchange::calculate_mirror_updates;
pub use transport::{
    read_exact_or_eof, read_packet_from, Duplex, FramedStream, OwnedPacket, PacketTransport, SectionTerminator,
    ServiceTransport,
};
