//! The shared connection core: hello negotiation, section framing, and v2
//! command dispatch common to both fetch and push.
//!
//! Grounded on `lockframe_core::connection::Connection`'s split between
//! "things every connection does regardless of which frames it carries" and
//! the state-specific handling layered on top of it; here the split is
//! between this module (hello, sections, command envelopes) and
//! `fetch`/`push` (what the sections mean).

use std::collections::BTreeMap;

use gitmirror_wire::{CapabilitySet, Ref};

use crate::error::ConnectionError;
use crate::transport::{OwnedPacket, PacketTransport, SectionTerminator};

/// Which protocol version a connection ended up negotiating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// The legacy line-oriented protocol.
    V1,
    /// The command/capability protocol.
    V2,
}

/// The result of reading a connection's opening hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloOutcome {
    /// A v2 peer: only a capability set, refs are fetched separately via
    /// `ls-refs`.
    V2 {
        /// Capabilities the server advertised.
        capabilities: CapabilitySet,
    },
    /// A v1 peer: the full ref advertisement and capability set arrive
    /// together, in the first line's trailing NUL-separated section.
    V1 {
        /// Advertised refs, name to object id.
        refs: BTreeMap<String, String>,
        /// Capabilities advertised after the first ref line's NUL byte.
        capabilities: CapabilitySet,
    },
}

/// Identifies this engine to peers in the `agent=` capability.
pub const AGENT: &str = "gitmirror/0.1";

/// The connection state shared by fetch and push: a transport plus whatever
/// the hello exchange produced.
pub struct ConnectionCore<T: PacketTransport> {
    pub(crate) transport: T,
    pending_unshift: Option<OwnedPacket>,
}

impl<T: PacketTransport> ConnectionCore<T> {
    /// Wrap a transport with no hello performed yet.
    pub fn new(transport: T) -> Self {
        Self { transport, pending_unshift: None }
    }

    /// Read and classify the opening hello, auto-detecting v1 vs v2 by
    /// sniffing the first packet's payload.
    ///
    /// Used by fetch, which prefers v2 and falls back to v1. Push is
    /// hard-wired to v1 and calls [`Self::read_v1_hello`] directly instead,
    /// since `receive-pack` never speaks v2.
    pub async fn negotiate_hello(&mut self) -> Result<HelloOutcome, ConnectionError> {
        let Some(first) = self.transport.read_packet().await? else {
            return Ok(HelloOutcome::V1 { refs: BTreeMap::new(), capabilities: CapabilitySet::new() });
        };

        let is_v2 = matches!(&first, OwnedPacket::Data(payload) if trimmed(payload) == "version 2");

        self.unshift(first);
        if is_v2 {
            let capabilities = self.read_v2_hello().await?;
            Ok(HelloOutcome::V2 { capabilities })
        } else {
            let (refs, capabilities) = self.read_v1_hello().await?;
            Ok(HelloOutcome::V1 { refs, capabilities })
        }
    }

    /// Put a packet back so the next `read_packet` (or any of the section
    /// readers) returns it again, rather than reading a fresh one off the
    /// transport. Used to sniff the first hello packet without consuming
    /// it.
    fn unshift(&mut self, packet: OwnedPacket) {
        self.pending_unshift = Some(packet);
    }

    async fn next_packet(&mut self) -> Result<Option<OwnedPacket>, ConnectionError> {
        if let Some(packet) = self.pending_unshift.take() {
            return Ok(Some(packet));
        }
        self.transport.read_packet().await
    }

    /// Read a v1-style hello: an optional `version 1` line, then a ref
    /// advertisement whose first line carries capabilities after a NUL
    /// byte, terminated by a flush.
    ///
    /// A server with no refs at all (freshly initialized, empty repository)
    /// may send a flush immediately with no ref lines and no capabilities —
    /// this is treated as a valid hello with zero refs rather than a
    /// protocol violation.
    pub async fn read_v1_hello(&mut self) -> Result<(BTreeMap<String, String>, CapabilitySet), ConnectionError> {
        let mut refs = BTreeMap::new();

        let Some(first) = self.next_packet().await? else {
            return Ok((refs, CapabilitySet::new()));
        };

        let first = match first {
            OwnedPacket::Flush => return Ok((refs, CapabilitySet::new())),
            OwnedPacket::Data(payload) => payload,
            other => return Err(unexpected("v1 hello", &other)),
        };

        let first = if trimmed(&first) == "version 1" {
            match self.next_packet().await? {
                Some(OwnedPacket::Flush) | None => return Ok((refs, CapabilitySet::new())),
                Some(OwnedPacket::Data(payload)) => payload,
                Some(other) => return Err(unexpected("v1 hello after version line", &other)),
            }
        } else {
            first
        };

        let line = String::from_utf8_lossy(&first);
        let (ref_part, cap_part) = line.split_once('\0').unwrap_or((line.trim_end(), ""));
        let capabilities = CapabilitySet::parse(cap_part);
        let first_ref = Ref::parse_line(ref_part)?;
        refs.insert(first_ref.name, first_ref.object_id);

        loop {
            match self.next_packet().await? {
                Some(OwnedPacket::Flush) => break,
                Some(OwnedPacket::Data(payload)) => {
                    let r = Ref::parse_line(trimmed(&payload))?;
                    refs.insert(r.name, r.object_id);
                },
                Some(other) => return Err(unexpected("v1 ref advertisement", &other)),
                None => {
                    return Err(ConnectionError::ServerClosedConnection {
                        context: "eof mid v1 ref advertisement".to_string(),
                    })
                },
            }
        }

        Ok((refs, capabilities))
    }

    /// Read a v2-style hello: a literal `version 2` line, then a flat list
    /// of capability tokens terminated by a flush.
    pub async fn read_v2_hello(&mut self) -> Result<CapabilitySet, ConnectionError> {
        match self.next_packet().await? {
            Some(OwnedPacket::Data(payload)) if trimmed(&payload) == "version 2" => {},
            Some(other) => return Err(unexpected("v2 hello", &other)),
            None => {
                return Err(ConnectionError::ServerClosedConnection {
                    context: "eof before v2 hello".to_string(),
                })
            },
        }

        let mut capabilities = CapabilitySet::new();
        loop {
            match self.next_packet().await? {
                Some(OwnedPacket::Flush) => break,
                Some(OwnedPacket::Data(payload)) => capabilities.insert_token(trimmed(&payload)),
                Some(other) => return Err(unexpected("v2 capability advertisement", &other)),
                None => {
                    return Err(ConnectionError::ServerClosedConnection {
                        context: "eof mid v2 capability advertisement".to_string(),
                    })
                },
            }
        }
        Ok(capabilities)
    }

    /// Read a section header: the single `Data` packet naming the section
    /// that follows (e.g. `"acknowledgments"` or `"packfile"` in a v2
    /// `fetch` response).
    pub async fn read_section_header(&mut self) -> Result<Vec<u8>, ConnectionError> {
        match self.next_packet().await? {
            Some(OwnedPacket::Data(payload)) => Ok(payload),
            Some(other) => Err(unexpected("section header", &other)),
            None => {
                Err(ConnectionError::ServerClosedConnection { context: "eof reading section header".to_string() })
            },
        }
    }

    /// Read `Data` packets until a flush, returning them and failing on any
    /// other packet kind in between.
    pub async fn read_section_until_flush(&mut self) -> Result<Vec<Vec<u8>>, ConnectionError> {
        let mut lines = Vec::new();
        loop {
            match self.next_packet().await? {
                Some(OwnedPacket::Flush) => break,
                Some(OwnedPacket::Data(payload)) => lines.push(payload),
                Some(other) => return Err(unexpected("section body", &other)),
                None => {
                    return Err(ConnectionError::ServerClosedConnection {
                        context: "eof mid section".to_string(),
                    })
                },
            }
        }
        Ok(lines)
    }

    /// Read `Data` packets until either a delimiter or a flush, returning
    /// them along with which one ended the section.
    pub async fn read_section_until_delim_or_flush(
        &mut self,
    ) -> Result<(Vec<Vec<u8>>, SectionTerminator), ConnectionError> {
        let mut lines = Vec::new();
        loop {
            match self.next_packet().await? {
                Some(OwnedPacket::Flush) => return Ok((lines, SectionTerminator::Flush)),
                Some(OwnedPacket::Delimiter) => return Ok((lines, SectionTerminator::Delimiter)),
                Some(OwnedPacket::Data(payload)) => lines.push(payload),
                Some(other) => return Err(unexpected("section body", &other)),
                None => {
                    return Err(ConnectionError::ServerClosedConnection {
                        context: "eof mid section".to_string(),
                    })
                },
            }
        }
    }

    /// Read the next raw packet, bypassing section bookkeeping. Used by
    /// fetch/push for the packfile and report-status demux loops, which
    /// need to inspect the sideband byte of each `Data` packet themselves.
    pub async fn read_packet(&mut self) -> Result<Option<OwnedPacket>, ConnectionError> {
        self.next_packet().await
    }

    /// Issue a v2 command envelope: `command=<name>`, the selected
    /// capability tokens, a delimiter, the command's arguments, and a final
    /// flush — then close out the transaction so batching substrates
    /// actually send it.
    pub async fn send_command_v2(
        &mut self,
        name: &str,
        args: &[String],
        capabilities: &CapabilitySet,
    ) -> Result<(), ConnectionError> {
        self.transport.write_packet(&OwnedPacket::Data(format!("command={name}\n").into_bytes())).await?;
        for token in capabilities.to_tokens() {
            self.transport.write_packet(&OwnedPacket::Data(format!("{token}\n").into_bytes())).await?;
        }
        self.transport.write_packet(&OwnedPacket::Delimiter).await?;
        for arg in args {
            self.transport.write_packet(&OwnedPacket::Data(format!("{arg}\n").into_bytes())).await?;
        }
        self.transport.write_packet(&OwnedPacket::Flush).await?;
        self.transport.end_transaction().await
    }

    /// Copy raw, unframed bytes from the transport to `sink` until
    /// end-of-stream. Used for the v1 fetch fallback, where the packfile
    /// follows the negotiation with no pkt-line framing at all.
    pub async fn copy_raw_until_eof(
        &mut self,
        sink: &mut (impl tokio::io::AsyncWrite + Unpin + Send),
    ) -> Result<(), ConnectionError> {
        use tokio::io::AsyncWriteExt;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.transport.read_raw(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).await?;
        }
        sink.flush().await?;
        Ok(())
    }
}

fn trimmed(bytes: &[u8]) -> &str {
    let text = std::str::from_utf8(bytes).unwrap_or_default();
    text.trim_end_matches(['\n', '\r'])
}

fn unexpected(context: &str, packet: &OwnedPacket) -> ConnectionError {
    ConnectionError::ProtocolViolation(format!("unexpected packet in {context}: {packet:?}"))
}
