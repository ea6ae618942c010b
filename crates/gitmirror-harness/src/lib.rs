//! Shared test fixtures for the mirror engine's crates.
//!
//! Plays the same role `lockframe-harness` plays for its own workspace,
//! minus the turmoil/MLS-specific simulation pieces that have no
//! counterpart here: this crate gives every other crate's integration
//! tests a single [`ScriptedTransport`] fake and a set of canonical
//! hello-body byte sequences instead of each crate hand-rolling its own.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;

use async_trait::async_trait;
use gitmirror_core::{ConnectionError, OwnedPacket, PacketTransport};
use gitmirror_wire::{encode_data, encode_marker, Marker, PacketLine};

/// A scripted [`PacketTransport`] fake: inbound packets and raw bytes are
/// queued up front, everything written is captured for assertions.
#[derive(Default)]
pub struct ScriptedTransport {
    inbound: VecDeque<OwnedPacket>,
    inbound_raw: VecDeque<u8>,
    written: Vec<OwnedPacket>,
    written_raw: Vec<u8>,
    end_transaction_calls: usize,
}

impl ScriptedTransport {
    /// An empty transport with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue packets to be handed back in order by `read_packet`.
    #[must_use]
    pub fn with_inbound_packets(mut self, packets: impl IntoIterator<Item = OwnedPacket>) -> Self {
        self.inbound.extend(packets);
        self
    }

    /// Decode a fully-framed byte sequence (e.g. a recorded hello response
    /// body) into packets and queue them, panicking on malformed input —
    /// fixtures are expected to already be valid.
    #[must_use]
    pub fn with_inbound_bytes(mut self, bytes: &[u8]) -> Self {
        self.inbound.extend(decode_all(bytes));
        self
    }

    /// Queue raw, unframed bytes to be handed back by `read_raw` (used for
    /// v1 fetch's unframed packfile tail).
    #[must_use]
    pub fn with_inbound_raw(mut self, bytes: &[u8]) -> Self {
        self.inbound_raw.extend(bytes.iter().copied());
        self
    }

    /// Every packet written so far, in write order.
    #[must_use]
    pub fn written_packets(&self) -> &[OwnedPacket] {
        &self.written
    }

    /// Every raw byte written so far (packfile bytes streamed via
    /// `write_raw`).
    #[must_use]
    pub fn written_raw(&self) -> &[u8] {
        &self.written_raw
    }

    /// How many times `end_transaction` was called.
    #[must_use]
    pub fn end_transaction_calls(&self) -> usize {
        self.end_transaction_calls
    }
}

/// Decode a byte buffer containing consecutive packet-lines into owned
/// packets.
///
/// # Panics
///
/// Panics if `bytes` contains a malformed packet-line; this is a test
/// fixture helper, not a production decoder.
#[must_use]
pub fn decode_all(bytes: &[u8]) -> Vec<OwnedPacket> {
    let mut packets = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (packet, consumed) = gitmirror_wire::parse_one(bytes, offset).expect("fixture bytes are well-formed");
        packets.push(match packet {
            PacketLine::Data(payload) => OwnedPacket::Data(payload.to_vec()),
            PacketLine::Flush => OwnedPacket::Flush,
            PacketLine::Delimiter => OwnedPacket::Delimiter,
            PacketLine::ResponseEnd => OwnedPacket::ResponseEnd,
            PacketLine::Unknown => OwnedPacket::Unknown,
        });
        offset += consumed;
    }
    packets
}

#[async_trait]
impl PacketTransport for ScriptedTransport {
    async fn write_packet(&mut self, packet: &OwnedPacket) -> Result<(), ConnectionError> {
        self.written.push(packet.clone());
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.written_raw.extend_from_slice(bytes);
        Ok(())
    }

    async fn end_transaction(&mut self) -> Result<(), ConnectionError> {
        self.end_transaction_calls += 1;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Option<OwnedPacket>, ConnectionError> {
        Ok(self.inbound.pop_front())
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = self.inbound_raw.pop_front() else { break };
            buf[n] = byte;
            n += 1;
        }
        Ok(n)
    }
}

/// Canonical byte sequences for the end-to-end seed scenarios, built with
/// the real codec rather than transcribed by hand so they are guaranteed
/// well-formed. Grounded on `test_transport_http.py`'s `GITHUB_UPLOAD_HELLO`
/// / `GERRIT_RECEIVE_HELLO` fixtures in `original_source/`, trimmed to the
/// single-capability shape the design doc's seed scenarios describe.
pub mod fixtures {
    use super::{encode_data, encode_marker, Marker};

    /// Scenario 1: a canonical v2 fetch hello with one capability.
    #[must_use]
    pub fn v2_fetch_hello() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(encode_data(b"# service=git-upload-pack\n").unwrap());
        body.extend(encode_marker(Marker::Flush));
        body.extend(encode_data(b"version 2\n").unwrap());
        body.extend(encode_data(b"agent=git/x.y\n").unwrap());
        body.extend(encode_marker(Marker::Flush));
        body
    }

    /// Scenario 2: a v1 receive-pack hello from a server that omits the
    /// `version 1` line, with two refs and delete-refs/report-status
    /// capabilities.
    #[must_use]
    pub fn v1_push_hello() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(encode_data(b"# service=git-receive-pack\n").unwrap());
        body.extend(encode_marker(Marker::Flush));
        body.extend(encode_data(
            b"f8355e1c8022fb6825c0d901c5d8617297ff626e refs/heads/main\0 side-band-64k delete-refs report-status\n",
        )
        .unwrap());
        body.extend(encode_data(b"28d140655d50e594417908cf4193e4387d05f6ff refs/meta/config\n").unwrap());
        body.extend(encode_marker(Marker::Flush));
        body
    }

    /// Scenario 3: a v2 fetch `acknowledgments` section reporting nothing
    /// but `NAK`, triggering a negotiation failure.
    #[must_use]
    pub fn v2_negotiation_failure() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(encode_data(b"acknowledgments\n").unwrap());
        body.extend(encode_data(b"NAK\n").unwrap());
        body.extend(encode_marker(Marker::Flush));
        body
    }

    /// Scenario 4: a `packfile` section multiplexing pack data (band 1),
    /// progress (band 2), and an error line (band 3).
    #[must_use]
    pub fn packfile_sideband(pack_bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(encode_data(b"packfile\n").unwrap());

        let mut band1 = vec![1u8];
        band1.extend_from_slice(pack_bytes);
        body.extend(encode_data(&band1).unwrap());

        let mut band2 = vec![2u8];
        band2.extend_from_slice(b"progress\n");
        body.extend(encode_data(&band2).unwrap());

        let mut band3 = vec![3u8];
        band3.extend_from_slice(b"err\n");
        body.extend(encode_data(&band3).unwrap());

        body.extend(encode_marker(Marker::Flush));
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_transport_replays_queued_packets_in_order() {
        let mut transport = ScriptedTransport::new()
            .with_inbound_packets([OwnedPacket::Data(b"a".to_vec()), OwnedPacket::Flush]);
        assert_eq!(transport.read_packet().await.unwrap(), Some(OwnedPacket::Data(b"a".to_vec())));
        assert_eq!(transport.read_packet().await.unwrap(), Some(OwnedPacket::Flush));
        assert_eq!(transport.read_packet().await.unwrap(), None);
    }

    #[tokio::test]
    async fn scripted_transport_records_writes() {
        let mut transport = ScriptedTransport::new();
        transport.write_packet(&OwnedPacket::Data(b"cmd\n".to_vec())).await.unwrap();
        transport.end_transaction().await.unwrap();
        assert_eq!(transport.written_packets(), &[OwnedPacket::Data(b"cmd\n".to_vec())]);
        assert_eq!(transport.end_transaction_calls(), 1);
    }

    #[test]
    fn v2_fetch_hello_fixture_decodes_to_expected_packets() {
        let decoded = decode_all(&fixtures::v2_fetch_hello());
        assert_eq!(
            decoded,
            vec![
                OwnedPacket::Data(b"# service=git-upload-pack\n".to_vec()),
                OwnedPacket::Flush,
                OwnedPacket::Data(b"version 2\n".to_vec()),
                OwnedPacket::Data(b"agent=git/x.y\n".to_vec()),
                OwnedPacket::Flush,
            ]
        );
    }
}
