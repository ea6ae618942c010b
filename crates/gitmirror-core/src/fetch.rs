//! The fetch state machine: ref listing and object negotiation, v2 with a
//! v1 fallback.

use std::collections::{BTreeMap, BTreeSet};

use gitmirror_wire::{CapabilitySet, Ref, NULL_OBJECT_ID};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::connection::{ConnectionCore, HelloOutcome, ProtocolVersion, AGENT};
use crate::error::ConnectionError;
use crate::transport::{OwnedPacket, PacketTransport, SectionTerminator};

/// An open connection specialized for reading refs and fetching objects.
///
/// Prefers protocol v2 (`ls-refs`/`fetch` commands) and transparently falls
/// back to v1's combined ref-advertisement-and-negotiation dance when the
/// peer doesn't advertise `version 2`.
pub struct FetchConnection<T: PacketTransport> {
    core: ConnectionCore<T>,
    protocol: ProtocolVersion,
    advertised: CapabilitySet,
    v1_refs: BTreeMap<String, String>,
}

impl<T: PacketTransport> FetchConnection<T> {
    /// Open a fetch connection, performing the hello exchange and
    /// determining the negotiated protocol version.
    pub async fn open(transport: T) -> Result<Self, ConnectionError> {
        let mut core = ConnectionCore::new(transport);
        let (protocol, advertised, v1_refs) = match core.negotiate_hello().await? {
            HelloOutcome::V2 { capabilities } => (ProtocolVersion::V2, capabilities, BTreeMap::new()),
            HelloOutcome::V1 { refs, capabilities } => (ProtocolVersion::V1, capabilities, refs),
        };
        Ok(Self { core, protocol, advertised, v1_refs })
    }

    /// Which protocol version this connection negotiated.
    #[must_use]
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// List refs under `prefix` (or all refs, if `prefix` is empty).
    pub async fn ls_refs(&mut self, prefix: &str) -> Result<Vec<Ref>, ConnectionError> {
        match self.protocol {
            ProtocolVersion::V2 => self.ls_refs_v2(prefix).await,
            ProtocolVersion::V1 => Ok(self
                .v1_refs
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(name, object_id)| Ref { name: name.clone(), object_id: object_id.clone() })
                .collect()),
        }
    }

    async fn ls_refs_v2(&mut self, prefix: &str) -> Result<Vec<Ref>, ConnectionError> {
        let mut args = Vec::new();
        if !prefix.is_empty() {
            args.push(format!("ref-prefix {prefix}"));
        }
        self.core.send_command_v2("ls-refs", &args, &CapabilitySet::new()).await?;

        let lines = self.core.read_section_until_flush().await?;
        lines
            .iter()
            .map(|line| {
                let text = std::str::from_utf8(line).unwrap_or_default().trim_end_matches(['\n', '\r']);
                Ref::parse_line(text).map_err(ConnectionError::from)
            })
            .collect()
    }

    /// Negotiate and fetch the objects reachable from `wants` but not from
    /// `haves`, writing the resulting packfile to `sink`.
    pub async fn fetch_objects(
        &mut self,
        wants: &BTreeSet<String>,
        haves: &BTreeSet<String>,
        sink: &mut (impl AsyncWrite + Unpin + Send),
    ) -> Result<(), ConnectionError> {
        match self.protocol {
            ProtocolVersion::V2 => self.fetch_objects_v2(wants, haves, sink).await,
            ProtocolVersion::V1 => self.fetch_objects_v1(wants, haves, sink).await,
        }
    }

    async fn fetch_objects_v2(
        &mut self,
        wants: &BTreeSet<String>,
        haves: &BTreeSet<String>,
        sink: &mut (impl AsyncWrite + Unpin + Send),
    ) -> Result<(), ConnectionError> {
        let mut args = Vec::new();
        if self.advertised.contains("wait-for-done") {
            args.push("wait-for-done".to_string());
        }
        for have in haves.iter().filter(|oid| oid.as_str() != NULL_OBJECT_ID) {
            args.push(format!("have {have}"));
        }
        for want in wants {
            args.push(format!("want {want}"));
        }
        args.push("done".to_string());

        self.core.send_command_v2("fetch", &args, &CapabilitySet::new()).await?;

        let header = self.core.read_section_header().await?;
        let mut section = section_name(&header);

        if section == "acknowledgments" {
            let (lines, terminator) = self.core.read_section_until_delim_or_flush().await?;
            let mut acked = BTreeSet::new();
            for line in &lines {
                let text = std::str::from_utf8(line).unwrap_or_default().trim_end();
                if let Some(oid) = text.strip_prefix("ACK ") {
                    acked.insert(oid.to_string());
                }
            }

            if terminator == SectionTerminator::Flush {
                let missing: BTreeSet<String> = wants.difference(&acked).cloned().collect();
                return Err(ConnectionError::NegotiationFailed { missing_oids: missing });
            }

            let next_header = self.core.read_section_header().await?;
            section = section_name(&next_header);
        }

        if section != "packfile" {
            return Err(ConnectionError::ProtocolViolation(format!(
                "expected a packfile section in the fetch response, got {section:?}"
            )));
        }

        demux_sideband(&mut self.core, sink).await
    }

    async fn fetch_objects_v1(
        &mut self,
        wants: &BTreeSet<String>,
        haves: &BTreeSet<String>,
        sink: &mut (impl AsyncWrite + Unpin + Send),
    ) -> Result<(), ConnectionError> {
        let mut capabilities = Vec::new();
        if self.advertised.contains("multi_ack_detailed") {
            capabilities.push("multi_ack_detailed".to_string());
        }
        capabilities.push(format!("agent={AGENT}"));
        capabilities.sort();

        let mut wants_iter = wants.iter();
        let first_want = wants_iter
            .next()
            .ok_or_else(|| ConnectionError::ProtocolViolation("fetch_objects requires at least one want".to_string()))?;

        let first_line = format!("want {first_want} {}\n", capabilities.join(" "));
        self.core.transport.write_packet(&OwnedPacket::Data(first_line.into_bytes())).await?;
        for want in wants_iter {
            self.core.transport.write_packet(&OwnedPacket::Data(format!("want {want}\n").into_bytes())).await?;
        }
        for have in haves.iter().filter(|oid| oid.as_str() != NULL_OBJECT_ID) {
            self.core.transport.write_packet(&OwnedPacket::Data(format!("have {have}\n").into_bytes())).await?;
        }
        self.core.transport.write_packet(&OwnedPacket::Flush).await?;
        self.core.transport.write_packet(&OwnedPacket::Data(b"done\n".to_vec())).await?;
        self.core.transport.end_transaction().await?;

        loop {
            match self.core.read_packet().await? {
                Some(OwnedPacket::Data(payload)) => {
                    let text = std::str::from_utf8(&payload).unwrap_or_default().trim_end();
                    if text.starts_with("ACK") {
                        continue;
                    }
                    if text == "NAK" {
                        break;
                    }
                    return Err(ConnectionError::ProtocolViolation(format!(
                        "unexpected line during v1 negotiation: {text}"
                    )));
                },
                other => {
                    return Err(ConnectionError::ProtocolViolation(format!(
                        "expected ACK/NAK during v1 negotiation, got {other:?}"
                    )))
                },
            }
        }

        // v1 fetch never requests side-band-64k, so the packfile tail is
        // always unframed raw bytes, never sideband-demultiplexed.
        self.core.copy_raw_until_eof(sink).await
    }
}

fn section_name(header: &[u8]) -> String {
    std::str::from_utf8(header).unwrap_or_default().trim().to_string()
}

/// Demultiplex sideband-framed `Data` packets: band 1 is packfile bytes
/// (written to `sink`), band 2 is progress text (logged), band 3 is a
/// server-side error message (logged; the flush that follows still ends the
/// loop normally — a fetch isn't failed by a progress-channel error the way
/// a push is by one in `report-status`).
async fn demux_sideband<T: PacketTransport>(
    core: &mut ConnectionCore<T>,
    sink: &mut (impl AsyncWrite + Unpin + Send),
) -> Result<(), ConnectionError> {
    loop {
        match core.read_packet().await? {
            Some(OwnedPacket::Data(payload)) => {
                let Some((&band, rest)) = payload.split_first() else { continue };
                match band {
                    1 => sink.write_all(rest).await?,
                    2 => tracing::info!(progress = %String::from_utf8_lossy(rest), "fetch progress"),
                    3 => tracing::error!(message = %String::from_utf8_lossy(rest), "server reported an error during fetch"),
                    other => tracing::debug!(band = other, "ignoring unrecognized sideband channel"),
                }
            },
            Some(OwnedPacket::Flush) => break,
            Some(other) => {
                return Err(ConnectionError::ProtocolViolation(format!(
                    "unexpected packet in packfile section: {other:?}"
                )))
            },
            None => {
                return Err(ConnectionError::ServerClosedConnection {
                    context: "eof mid packfile section".to_string(),
                })
            },
        }
    }
    sink.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    /// A scripted `PacketTransport` that replays a fixed sequence of
    /// inbound packets and records every outbound one, for testing the
    /// fetch machine without a real transport substrate.
    struct ScriptedTransport {
        inbound: VecDeque<OwnedPacket>,
        inbound_raw: VecDeque<u8>,
        outbound: Arc<Mutex<Vec<OwnedPacket>>>,
    }

    impl ScriptedTransport {
        fn new(inbound: Vec<OwnedPacket>) -> Self {
            Self { inbound: inbound.into(), inbound_raw: VecDeque::new(), outbound: Arc::new(Mutex::new(Vec::new())) }
        }

        fn with_inbound_raw(mut self, bytes: &[u8]) -> Self {
            self.inbound_raw.extend(bytes.iter().copied());
            self
        }

        fn outbound_handle(&self) -> Arc<Mutex<Vec<OwnedPacket>>> {
            Arc::clone(&self.outbound)
        }
    }

    #[async_trait]
    impl PacketTransport for ScriptedTransport {
        async fn write_packet(&mut self, packet: &OwnedPacket) -> Result<(), ConnectionError> {
            self.outbound.lock().unwrap().push(packet.clone());
            Ok(())
        }

        async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
            self.outbound.lock().unwrap().push(OwnedPacket::Data(bytes.to_vec()));
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

    fn data(s: &str) -> OwnedPacket {
        OwnedPacket::Data(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn v2_hello_then_ls_refs() {
        let transport = ScriptedTransport::new(vec![
            data("version 2\n"),
            data("ls-refs\n"),
            data("fetch\n"),
            OwnedPacket::Flush,
        ]);
        let conn = FetchConnection::open(transport).await.unwrap();
        assert_eq!(conn.protocol(), ProtocolVersion::V2);
        assert!(conn.advertised.contains("ls-refs"));
        assert!(conn.advertised.contains("fetch"));
    }

    #[tokio::test]
    async fn v1_hello_with_empty_repository() {
        let transport = ScriptedTransport::new(vec![OwnedPacket::Flush]);
        let mut conn = FetchConnection::open(transport).await.unwrap();
        assert_eq!(conn.protocol(), ProtocolVersion::V1);
        assert!(conn.ls_refs("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn v2_fetch_negotiation_failure_reports_missing_wants() {
        let transport = ScriptedTransport::new(vec![
            data("version 2\n"),
            data("fetch\n"),
            OwnedPacket::Flush,
            data("acknowledgments\n"),
            OwnedPacket::Flush,
        ]);
        let mut conn = FetchConnection::open(transport).await.unwrap();
        let mut sink = Vec::new();
        let want = "a".repeat(40);
        let err = conn
            .fetch_objects(&BTreeSet::from([want.clone()]), &BTreeSet::new(), &mut sink)
            .await
            .unwrap_err();
        match err {
            ConnectionError::NegotiationFailed { missing_oids } => {
                assert!(missing_oids.contains(&want));
            },
            other => panic!("expected NegotiationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn v2_fetch_demuxes_packfile_sideband() {
        let transport = ScriptedTransport::new(vec![
            data("version 2\n"),
            data("fetch\n"),
            OwnedPacket::Flush,
            data("packfile\n"),
            OwnedPacket::Data(vec![1, b'P', b'A', b'C', b'K']),
            OwnedPacket::Data(vec![2, b'p', b'r', b'o', b'g']),
            OwnedPacket::Flush,
        ]);
        let mut conn = FetchConnection::open(transport).await.unwrap();
        let mut sink = Vec::new();
        conn.fetch_objects(&BTreeSet::new(), &BTreeSet::new(), &mut sink).await.unwrap();
        assert_eq!(sink, b"PACK");
    }

    #[tokio::test]
    async fn v1_fetch_never_requests_or_demuxes_side_band() {
        let hello = format!("{} refs/heads/main\0multi_ack_detailed side-band-64k\n", "a".repeat(40));
        let transport = ScriptedTransport::new(vec![data(&hello), OwnedPacket::Flush, data("NAK")])
            .with_inbound_raw(&[1, b'P', b'A', b'C', b'K']);
        let outbound = transport.outbound_handle();

        let mut conn = FetchConnection::open(transport).await.unwrap();
        let want = "a".repeat(40);
        let mut sink = Vec::new();
        conn.fetch_objects(&BTreeSet::from([want]), &BTreeSet::new(), &mut sink).await.unwrap();

        let written = outbound.lock().unwrap();
        let OwnedPacket::Data(first_line) = written.first().expect("first want line written") else {
            panic!("expected a data packet")
        };
        let first_line = String::from_utf8_lossy(first_line);
        assert!(!first_line.contains("side-band-64k"), "v1 fetch must never request side-band-64k");

        // Even though the first raw byte looks like a sideband marker, v1 never
        // demultiplexes it: it must reach the sink untouched.
        assert_eq!(sink, vec![1, b'P', b'A', b'C', b'K']);
    }
}
