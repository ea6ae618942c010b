//! The push state machine: ref-update commands and packfile upload against
//! a v1-only `receive-pack` peer.

use gitmirror_wire::{CapabilitySet, RefChange, RefChangeKind};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::connection::{ConnectionCore, AGENT};
use crate::error::ConnectionError;
use crate::transport::{OwnedPacket, PacketTransport};

/// How large a chunk of packfile bytes to read before checking whether it's
/// time to force a drain.
const PACK_CHUNK: usize = 64 * 1024;

/// How much packfile data to buffer between explicit drains, so a very
/// large push doesn't hold arbitrarily much of it unflushed.
const DRAIN_EVERY: u64 = 10 * 1024 * 1024;

/// The outcome of a push, as reported by the peer's `report-status`
/// extension (or left empty if the peer didn't advertise it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// True if the peer successfully unpacked the pushed objects.
    pub unpack_ok: bool,
    /// The peer's `unpack` failure message, if unpacking failed.
    pub unpack_error: Option<String>,
    /// Ref names the peer accepted and updated.
    pub ok: Vec<String>,
    /// Ref names the peer rejected, with its stated reason.
    pub rejected: Vec<(String, String)>,
}

/// An open connection specialized for pushing ref updates and a packfile.
///
/// Always speaks protocol v1: `receive-pack` has no v2 form in this engine's
/// target deployments, so push never attempts the v2 sniff `fetch` does.
pub struct PushConnection<T: PacketTransport> {
    core: ConnectionCore<T>,
    advertised: CapabilitySet,
}

impl<T: PacketTransport> PushConnection<T> {
    /// Open a push connection and read its (always-v1) hello.
    pub async fn open(transport: T) -> Result<Self, ConnectionError> {
        let mut core = ConnectionCore::new(transport);
        let (_refs, advertised) = core.read_v1_hello().await?;
        Ok(Self { core, advertised })
    }

    /// Capabilities the peer advertised in its hello.
    #[must_use]
    pub fn advertised_capabilities(&self) -> &CapabilitySet {
        &self.advertised
    }

    /// Send `changes` as ref-update commands, followed by `packfile`'s
    /// bytes (if any changes are creates or updates), and read back the
    /// peer's report if it advertised `report-status`.
    ///
    /// Deletes are silently dropped (with a warning logged) when the peer
    /// doesn't advertise `delete-refs`, since sending one anyway is simply
    /// rejected by the peer and there is nothing useful to retry.
    pub async fn push_changes(
        &mut self,
        changes: &[RefChange],
        packfile: Option<&mut (impl AsyncRead + Unpin + Send)>,
    ) -> Result<PushReport, ConnectionError> {
        let supports_delete = self.advertised.contains("delete-refs");
        let mut selected = CapabilitySet::new();
        for cap in ["report-status", "side-band-64k"] {
            if self.advertised.contains(cap) {
                selected.insert_token(cap);
            }
        }
        if let Some(format) = self.advertised.value_of("object-format") {
            selected.insert_token(&format!("object-format={format}"));
        }
        selected.insert_token(&format!("agent={AGENT}"));

        let surviving: Vec<&RefChange> = changes
            .iter()
            .filter(|change| {
                let keep = supports_delete || !matches!(change.kind(), RefChangeKind::Delete);
                if !keep {
                    tracing::warn!(ref_name = %change.ref_name, "peer lacks delete-refs; dropping delete");
                }
                keep
            })
            .collect();

        for (i, change) in surviving.iter().enumerate() {
            let mut line = change.to_command_line();
            if i == 0 {
                line.push('\0');
                line.push(' ');
                line.push_str(&selected.to_tokens().join(" "));
            }
            self.core.transport.write_packet(&OwnedPacket::Data(line.into_bytes())).await?;
        }
        self.core.transport.write_packet(&OwnedPacket::Flush).await?;

        let needs_pack = surviving.iter().any(|c| !matches!(c.kind(), RefChangeKind::Delete));
        if needs_pack {
            if let Some(pack) = packfile {
                self.stream_pack(pack).await?;
            }
        }
        self.core.transport.end_transaction().await?;

        if surviving.is_empty() {
            return Ok(PushReport::default());
        }

        if selected.contains("report-status") {
            self.read_report_status().await
        } else {
            Ok(PushReport::default())
        }
    }

    async fn stream_pack(&mut self, pack: &mut (impl AsyncRead + Unpin + Send)) -> Result<(), ConnectionError> {
        let mut buf = vec![0u8; PACK_CHUNK];
        let mut since_drain: u64 = 0;
        loop {
            let n = pack.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.core.transport.write_raw(&buf[..n]).await?;
            since_drain += n as u64;
            if since_drain >= DRAIN_EVERY {
                self.core.transport.flush().await?;
                since_drain = 0;
            }
        }
        self.core.transport.flush().await?;
        Ok(())
    }

    async fn read_report_status(&mut self) -> Result<PushReport, ConnectionError> {
        let mut report = PushReport::default();
        loop {
            match self.core.read_packet().await? {
                Some(OwnedPacket::Data(payload)) => {
                    let Some((&band, rest)) = payload.split_first() else { continue };
                    match band {
                        1 => self.apply_report_line(rest, &mut report),
                        2 => tracing::info!(progress = %String::from_utf8_lossy(rest), "push progress"),
                        3 => {
                            let message = String::from_utf8_lossy(rest).trim_end().to_string();
                            tracing::error!(%message, "peer reported an error during push");
                            return Err(ConnectionError::PushRejected(message));
                        },
                        other => tracing::debug!(band = other, "ignoring unrecognized sideband channel"),
                    }
                },
                Some(OwnedPacket::Flush) => break,
                Some(other) => {
                    return Err(ConnectionError::ProtocolViolation(format!(
                        "unexpected packet in report-status: {other:?}"
                    )))
                },
                None => {
                    return Err(ConnectionError::ServerClosedConnection {
                        context: "eof while reading report-status".to_string(),
                    })
                },
            }
        }
        Ok(report)
    }

    /// Band-1 report-status payloads are themselves packet-line framed, one
    /// level of nesting deep: each status line ("ok <ref>", "ng <ref>
    /// <reason>", "unpack ok"/"unpack <error>") is its own nested DATA
    /// packet, terminated by a nested flush.
    fn apply_report_line(&self, band_payload: &[u8], report: &mut PushReport) {
        let mut offset = 0;
        while offset < band_payload.len() {
            let (packet, consumed) = match gitmirror_wire::parse_one(band_payload, offset) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!(%err, "malformed nested packet-line in report-status band");
                    break;
                },
            };
            offset += consumed;

            let gitmirror_wire::PacketLine::Data(line) = packet else { continue };
            let text = std::str::from_utf8(line).unwrap_or_default().trim_end_matches(['\n', '\r']);
            tracing::info!(%text, "push report-status line");
            if let Some(rest) = text.strip_prefix("ok ") {
                report.ok.push(rest.to_string());
            } else if let Some(rest) = text.strip_prefix("ng ") {
                if let Some((name, reason)) = rest.split_once(' ') {
                    report.rejected.push((name.to_string(), reason.to_string()));
                } else {
                    report.rejected.push((rest.to_string(), String::new()));
                }
            } else if text == "unpack ok" {
                report.unpack_ok = true;
            } else if let Some(rest) = text.strip_prefix("unpack ") {
                report.unpack_error = Some(rest.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;

    struct ScriptedTransport {
        inbound: VecDeque<OwnedPacket>,
        outbound: Vec<OwnedPacket>,
    }

    impl ScriptedTransport {
        fn new(inbound: Vec<OwnedPacket>) -> Self {
            Self { inbound: inbound.into(), outbound: Vec::new() }
        }
    }

    #[async_trait]
    impl PacketTransport for ScriptedTransport {
        async fn write_packet(&mut self, packet: &OwnedPacket) -> Result<(), ConnectionError> {
            self.outbound.push(packet.clone());
            Ok(())
        }

        async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
            self.outbound.push(OwnedPacket::Data(bytes.to_vec()));
            Ok(())
        }

        async fn read_packet(&mut self) -> Result<Option<OwnedPacket>, ConnectionError> {
            Ok(self.inbound.pop_front())
        }

        async fn read_raw(&mut self, _buf: &mut [u8]) -> Result<usize, ConnectionError> {
            Ok(0)
        }
    }

    fn data(s: &str) -> OwnedPacket {
        OwnedPacket::Data(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn push_drops_delete_when_peer_lacks_delete_refs() {
        let transport = ScriptedTransport::new(vec![
            data(&format!("{} refs/heads/main\0report-status\n", "a".repeat(40))),
            OwnedPacket::Flush,
        ]);
        let mut conn = PushConnection::open(transport).await.unwrap();
        assert!(!conn.advertised_capabilities().contains("delete-refs"));

        let delete = RefChange::new("refs/heads/gone", "a".repeat(40), gitmirror_wire::NULL_OBJECT_ID);
        let report = conn.push_changes(&[delete], None::<&mut &[u8]>).await.unwrap();
        assert_eq!(report, PushReport::default());
    }

    #[tokio::test]
    async fn push_reads_report_status() {
        let transport = ScriptedTransport::new(vec![
            data(&format!("{} refs/heads/main\0report-status delete-refs\n", "a".repeat(40))),
            OwnedPacket::Flush,
            OwnedPacket::Data({
                let mut v = vec![1u8];
                v.extend_from_slice(&gitmirror_wire::encode_data(b"unpack ok\n").unwrap());
                v.extend_from_slice(&gitmirror_wire::encode_data(b"ok refs/heads/main\n").unwrap());
                v
            }),
            OwnedPacket::Flush,
        ]);
        let mut conn = PushConnection::open(transport).await.unwrap();
        let update = RefChange::new("refs/heads/main", "a".repeat(40), "b".repeat(40));
        let report = conn.push_changes(&[update], None::<&mut &[u8]>).await.unwrap();
        assert!(report.unpack_ok);
        assert_eq!(report.ok, vec!["refs/heads/main".to_string()]);
    }
}
