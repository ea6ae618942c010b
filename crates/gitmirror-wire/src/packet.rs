//! Packet-line framing: the VCS's length-prefixed wire format.
//!
//! A packet-line is a 4-byte ASCII-hex length header, optionally followed by
//! a payload. Three small header values are reserved as section markers
//! (flush, delimiter, response-end); everything else is either a payload
//! length (header value minus 4) or, for the one remaining reserved value,
//! an opaque marker we pass through without interpreting.
//!
//! This module is pure: no allocation on the decode path (payloads are
//! returned as views into the caller's buffer), no I/O, nothing async. The
//! framed byte stream in `gitmirror-core` is what turns this into something
//! that reads/writes a real transport.

use crate::error::WireError;

/// Largest payload `encode_data` / `parse_one` will accept, in bytes.
pub const MAX_DATA_LEN: usize = 65_515;

const HEADER_LEN: usize = 4;

const FLUSH_HEADER: u16 = 0x0000;
const DELIM_HEADER: u16 = 0x0001;
const RESPONSE_END_HEADER: u16 = 0x0002;
const UNKNOWN_HEADER: u16 = 0x0003;

/// A single parsed packet-line.
///
/// Borrows its payload from the buffer it was parsed out of — callers that
/// need to hold onto a `Data` packet past the buffer's lifetime must copy it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLine<'a> {
    /// A regular payload-bearing packet.
    Data(&'a [u8]),
    /// End of section (header `0000`).
    Flush,
    /// Intra-section separator (header `0001`).
    Delimiter,
    /// End of response (header `0002`).
    ResponseEnd,
    /// Reserved header value `0003`, not otherwise assigned meaning.
    Unknown,
}

/// The kind of packet-line, independent of any borrowed payload.
///
/// Used by [`sniff`], which reports what *would* be parsed without borrowing
/// from (or requiring the full contents of) the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// A regular payload-bearing packet.
    Data,
    /// End of section.
    Flush,
    /// Intra-section separator.
    Delimiter,
    /// End of response.
    ResponseEnd,
    /// Reserved header value with no assigned meaning.
    Unknown,
}

impl PacketLine<'_> {
    /// This packet-line's kind, discarding any borrowed payload.
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Data(_) => PacketKind::Data,
            Self::Flush => PacketKind::Flush,
            Self::Delimiter => PacketKind::Delimiter,
            Self::ResponseEnd => PacketKind::ResponseEnd,
            Self::Unknown => PacketKind::Unknown,
        }
    }

    /// The payload, if this is a `Data` packet.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Marker packet kinds that `encode_marker` knows how to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// End of section.
    Flush,
    /// Intra-section separator.
    Delimiter,
    /// End of response.
    ResponseEnd,
}

/// Encode a data payload as a length-prefixed packet-line.
///
/// # Errors
///
/// Returns [`WireError::PayloadTooLarge`] if `payload.len() > MAX_DATA_LEN`.
pub fn encode_data(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_DATA_LEN {
        return Err(WireError::PayloadTooLarge { len: payload.len(), max: MAX_DATA_LEN });
    }

    let header_value = payload.len() + HEADER_LEN;
    let mut out = Vec::with_capacity(header_value);
    out.extend_from_slice(&encode_header(header_value as u16));
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode one of the three reserved zero-payload markers.
#[must_use]
pub fn encode_marker(marker: Marker) -> [u8; HEADER_LEN] {
    let value = match marker {
        Marker::Flush => FLUSH_HEADER,
        Marker::Delimiter => DELIM_HEADER,
        Marker::ResponseEnd => RESPONSE_END_HEADER,
    };
    encode_header(value)
}

fn encode_header(value: u16) -> [u8; HEADER_LEN] {
    let hex = format!("{value:04x}");
    let bytes = hex.as_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn decode_header(header: &[u8; HEADER_LEN]) -> Result<u16, WireError> {
    let text = std::str::from_utf8(header).map_err(|_| WireError::InvalidHeader(*header))?;
    u16::from_str_radix(text, 16).map_err(|_| WireError::InvalidHeader(*header))
}

/// What a decoded 4-byte header means, without requiring the payload bytes
/// to already be in hand.
///
/// This is the primitive a streaming reader needs: read 4 bytes, decode the
/// header, and only then know how many more bytes (if any) to read for the
/// payload. [`parse_one`] is built on top of this for the in-memory case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderValue {
    /// A `Data` packet follows with this many payload bytes.
    Data(usize),
    /// End of section.
    Flush,
    /// Intra-section separator.
    Delimiter,
    /// End of response.
    ResponseEnd,
    /// Reserved header value with no assigned meaning.
    Unknown,
}

/// Decode a raw 4-byte packet-line header read off the wire.
///
/// # Errors
///
/// [`WireError::InvalidHeader`] if the bytes are not valid ASCII hex.
pub fn decode_header_bytes(header: &[u8; HEADER_LEN]) -> Result<HeaderValue, WireError> {
    let value = decode_header(header)?;
    Ok(match value {
        FLUSH_HEADER => HeaderValue::Flush,
        DELIM_HEADER => HeaderValue::Delimiter,
        RESPONSE_END_HEADER => HeaderValue::ResponseEnd,
        UNKNOWN_HEADER => HeaderValue::Unknown,
        _ => HeaderValue::Data((value as usize) - HEADER_LEN),
    })
}

/// Parse a single packet-line starting at `offset` in `buffer`.
///
/// Returns the parsed [`PacketLine`] (borrowing any payload from `buffer`)
/// together with the number of bytes consumed.
///
/// # Errors
///
/// - [`WireError::ShortBuffer`] if fewer than 4 bytes remain from `offset`.
/// - [`WireError::InvalidHeader`] if those 4 bytes are not ASCII hex.
/// - [`WireError::TruncatedPayload`] if the declared payload is not fully
///   present.
pub fn parse_one(buffer: &[u8], offset: usize) -> Result<(PacketLine<'_>, usize), WireError> {
    let remaining = buffer.len().saturating_sub(offset);
    if remaining < HEADER_LEN {
        return Err(WireError::ShortBuffer { actual: remaining });
    }

    let header: [u8; HEADER_LEN] =
        buffer[offset..offset + HEADER_LEN].try_into().expect("slice is exactly HEADER_LEN");

    match decode_header_bytes(&header)? {
        HeaderValue::Flush => Ok((PacketLine::Flush, HEADER_LEN)),
        HeaderValue::Delimiter => Ok((PacketLine::Delimiter, HEADER_LEN)),
        HeaderValue::ResponseEnd => Ok((PacketLine::ResponseEnd, HEADER_LEN)),
        HeaderValue::Unknown => Ok((PacketLine::Unknown, HEADER_LEN)),
        HeaderValue::Data(payload_len) => {
            let available = remaining - HEADER_LEN;
            if available < payload_len {
                return Err(WireError::TruncatedPayload { expected: payload_len, actual: available });
            }
            let start = offset + HEADER_LEN;
            let payload = &buffer[start..start + payload_len];
            Ok((PacketLine::Data(payload), HEADER_LEN + payload_len))
        },
    }
}

/// Outcome of probing a buffer for a complete packet-line without consuming
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff<'a> {
    /// Not enough bytes yet; `more` additional bytes are needed before
    /// [`parse_one`] can succeed.
    NeedMore {
        /// Additional bytes required.
        more: usize,
    },
    /// A full packet-line is present.
    Ready {
        /// The packet's kind.
        kind: PacketKind,
        /// Total bytes it occupies, header included.
        consumed: usize,
        /// Its payload, if `kind == Data`.
        payload: Option<&'a [u8]>,
    },
}

/// Non-consuming probe: how many more bytes does `buffer` need before
/// [`parse_one`] would succeed, and if it already has enough, what would it
/// parse?
///
/// Used by the HTTP transport to decide how to chunk an outbound request
/// body around packet-line boundaries without fully materializing it.
#[must_use]
pub fn sniff(buffer: &[u8]) -> Sniff<'_> {
    if buffer.len() < HEADER_LEN {
        return Sniff::NeedMore { more: HEADER_LEN - buffer.len() };
    }

    let header: [u8; HEADER_LEN] =
        buffer[..HEADER_LEN].try_into().expect("slice is exactly HEADER_LEN");
    let Ok(value) = decode_header(&header) else {
        // An invalid header can never become valid with more bytes; report
        // it as "ready" with zero payload so the caller's parse_one call
        // surfaces the real error.
        return Sniff::Ready { kind: PacketKind::Unknown, consumed: HEADER_LEN, payload: None };
    };

    let kind = match value {
        FLUSH_HEADER => PacketKind::Flush,
        DELIM_HEADER => PacketKind::Delimiter,
        RESPONSE_END_HEADER => PacketKind::ResponseEnd,
        UNKNOWN_HEADER => PacketKind::Unknown,
        _ => PacketKind::Data,
    };

    if kind != PacketKind::Data {
        return Sniff::Ready { kind, consumed: HEADER_LEN, payload: None };
    }

    let payload_len = (value as usize) - HEADER_LEN;
    let total = HEADER_LEN + payload_len;
    if buffer.len() < total {
        return Sniff::NeedMore { more: total - buffer.len() };
    }

    Sniff::Ready { kind, consumed: total, payload: Some(&buffer[HEADER_LEN..total]) }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encode_marker_values() {
        assert_eq!(&encode_marker(Marker::Flush), b"0000");
        assert_eq!(&encode_marker(Marker::Delimiter), b"0001");
        assert_eq!(&encode_marker(Marker::ResponseEnd), b"0002");
    }

    #[test]
    fn parse_markers() {
        for (bytes, expected) in [
            (b"0000".as_slice(), PacketLine::Flush),
            (b"0001".as_slice(), PacketLine::Delimiter),
            (b"0002".as_slice(), PacketLine::ResponseEnd),
            (b"0003".as_slice(), PacketLine::Unknown),
        ] {
            let (pkt, consumed) = parse_one(bytes, 0).unwrap();
            assert_eq!(pkt, expected);
            assert_eq!(consumed, 4);
        }
    }

    #[test]
    fn encode_then_parse_data() {
        let payload = b"version 2\n";
        let encoded = encode_data(payload).unwrap();
        assert_eq!(&encoded[..4], b"000e");

        let (pkt, consumed) = parse_one(&encoded, 0).unwrap();
        assert_eq!(pkt, PacketLine::Data(payload.as_slice()));
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = vec![0u8; MAX_DATA_LEN + 1];
        assert_eq!(
            encode_data(&payload),
            Err(WireError::PayloadTooLarge { len: MAX_DATA_LEN + 1, max: MAX_DATA_LEN })
        );
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert_eq!(parse_one(b"001", 0), Err(WireError::ShortBuffer { actual: 3 }));
        assert_eq!(parse_one(b"", 0), Err(WireError::ShortBuffer { actual: 0 }));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        // header claims 10 bytes of payload (0x000e = 14, minus 4 = 10), only 3 present
        let buf = b"000eabc";
        assert_eq!(
            parse_one(buf, 0),
            Err(WireError::TruncatedPayload { expected: 10, actual: 3 })
        );
    }

    #[test]
    fn sniff_reports_needed_bytes() {
        assert_eq!(sniff(b"00"), Sniff::NeedMore { more: 2 });
        assert_eq!(sniff(b"000e"), Sniff::NeedMore { more: 10 });
        match sniff(b"000eabcdefghij") {
            Sniff::Ready { kind: PacketKind::Data, consumed: 14, payload: Some(p) } => {
                assert_eq!(p, b"abcdefghij");
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_one_at_offset() {
        let mut buf = encode_data(b"first").unwrap();
        buf.extend(encode_marker(Marker::Flush));
        let (first, consumed) = parse_one(&buf, 0).unwrap();
        assert_eq!(first, PacketLine::Data(b"first".as_slice()));
        let (second, _) = parse_one(&buf, consumed).unwrap();
        assert_eq!(second, PacketLine::Flush);
    }

    proptest! {
        #[test]
        fn data_round_trips(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let encoded = encode_data(&payload).unwrap();
            let (pkt, consumed) = parse_one(&encoded, 0).unwrap();
            prop_assert_eq!(pkt, PacketLine::Data(payload.as_slice()));
            prop_assert_eq!(consumed, encoded.len());
        }

        #[test]
        fn short_buffer_iff_fewer_than_four_bytes(len in 0usize..4) {
            let buf = vec![b'0'; len];
            prop_assert_eq!(parse_one(&buf, 0), Err(WireError::ShortBuffer { actual: len }));
        }
    }
}
