//! Property-based tests for the packet-line codec and ref parsing.
//!
//! These check the invariants listed in the design doc's testable-properties
//! section for all valid inputs, not just hand-picked examples.

use gitmirror_wire::{encode_data, encode_marker, parse_one, Marker, PacketLine, Ref, WireError};
use proptest::prelude::*;

#[test]
fn prop_data_round_trip_is_identity() {
    proptest!(|(payload in prop::collection::vec(any::<u8>(), 0..4096))| {
        let encoded = encode_data(&payload).expect("within size limit");
        let (parsed, consumed) = parse_one(&encoded, 0).expect("well-formed packet");
        prop_assert_eq!(parsed, PacketLine::Data(payload.as_slice()));
        prop_assert_eq!(consumed, encoded.len());
    });
}

#[test]
fn prop_markers_round_trip_to_four_bytes() {
    for (marker, expected) in
        [(Marker::Flush, PacketLine::Flush), (Marker::Delimiter, PacketLine::Delimiter), (Marker::ResponseEnd, PacketLine::ResponseEnd)]
    {
        let encoded = encode_marker(marker);
        let (parsed, consumed) = parse_one(&encoded, 0).unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(consumed, 4);
    }
}

#[test]
fn prop_short_buffer_iff_under_four_bytes() {
    proptest!(|(len in 0usize..16)| {
        let buf = vec![b'a'; len];
        let result = parse_one(&buf, 0);
        if len < 4 {
            prop_assert_eq!(result, Err(WireError::ShortBuffer { actual: len }));
        }
    });
}

#[test]
fn prop_truncated_iff_declared_exceeds_available() {
    proptest!(|(declared in 1usize..200, available in 0usize..200)| {
        let header_value = declared + 4;
        if header_value > 0xffff {
            return Ok(());
        }
        let header = format!("{header_value:04x}");
        let mut buf = header.into_bytes();
        buf.extend(std::iter::repeat(b'x').take(available.min(declared)));

        let result = parse_one(&buf, 0);
        if available < declared {
            prop_assert_eq!(result, Err(WireError::TruncatedPayload { expected: declared, actual: available.min(declared) }));
        } else {
            prop_assert!(result.is_ok());
        }
    });
}

#[test]
fn ref_line_parses_name_and_object_id() {
    let line = "f8355e1c2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c refs/heads/main";
    let parsed = Ref::parse_line(line).unwrap();
    assert_eq!(parsed.name, "refs/heads/main");
    assert_eq!(parsed.object_id, "f8355e1c2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c");
}
