//! SSH transport substrate: runs `git-upload-pack` / `git-receive-pack` as a
//! single remote command over one SSH channel.
//!
//! Follows `lockframe_client::transport`'s bridging shape of wrapping a
//! non-tokio async stream into something the connection core can drive,
//! here bridging an `russh` channel instead of a QUIC stream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use gitmirror_core::{Credential, ConnectionError, OwnedPacket, PacketTransport, ServiceTransport};
use gitmirror_wire::{decode_header_bytes, encode_data, encode_marker, HeaderValue, Marker};
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg};
use thiserror::Error;

/// Which git service to invoke remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceName {
    /// The fetch-side service.
    UploadPack,
    /// The push-side service.
    ReceivePack,
}

impl ServiceName {
    fn binary(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    fn preferred_protocol_version(self) -> u8 {
        match self {
            Self::UploadPack => 2,
            Self::ReceivePack => 1,
        }
    }
}

/// Errors specific to establishing or authenticating an SSH session.
#[derive(Error, Debug)]
pub enum SshTransportError {
    /// The URL was not a well-formed `ssh://` endpoint.
    #[error("not a valid ssh:// URL: {0}")]
    InvalidUrl(String),

    /// The TCP/SSH handshake to the remote host failed.
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
        /// Underlying error.
        #[source]
        source: russh::Error,
    },

    /// No offered credential was accepted by the server.
    #[error("ssh authentication to {user}@{host} was rejected")]
    AuthenticationRejected {
        /// SSH username attempted.
        user: String,
        /// Remote host.
        host: String,
    },

    /// A channel-level SSH operation failed.
    #[error("ssh channel error: {0}")]
    Channel(#[from] russh::Error),

    /// The remote command exited non-zero. `stderr` is whatever it wrote to
    /// its extended-data (stderr) stream before the channel closed, or empty
    /// if it wrote nothing.
    #[error("remote command exited with status {exit_status}: {stderr:?}")]
    RemoteCommandFailed {
        /// Non-zero exit status reported by the remote over the channel.
        exit_status: u32,
        /// Captured stderr text, trimmed of surrounding whitespace.
        stderr: String,
    },
}

impl From<SshTransportError> for ConnectionError {
    fn from(err: SshTransportError) -> Self {
        ConnectionError::TransportOpenError(err.to_string())
    }
}

/// Turn a closed channel's exit status and captured stderr into a result: a
/// non-zero status is a failure carrying the stderr text, anything else
/// (including no exit status at all, e.g. the peer hung up first) is fine.
fn classify_exit(exit_status: Option<u32>, stderr: &[u8]) -> Result<(), SshTransportError> {
    match exit_status {
        Some(status) if status != 0 => Err(SshTransportError::RemoteCommandFailed {
            exit_status: status,
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }),
        _ => Ok(()),
    }
}

struct NoopHandler;

impl client::Handler for NoopHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &russh::keys::PublicKey) -> Result<bool, Self::Error> {
        // Host key verification is left to a caller-supplied policy in a
        // fuller deployment; accepting unconditionally here matches this
        // engine's scope of driving the wire protocol, not vetting hosts.
        Ok(true)
    }
}

/// A `PacketTransport` driven directly off an SSH channel's message stream
/// rather than through a generic byte-duplex adapter, so it can see
/// `ChannelMsg::ExtendedData` (the remote's stderr) and `ChannelMsg::ExitStatus`
/// alongside the ordinary data frames a plain `AsyncRead` bridge would
/// otherwise consume blindly.
pub struct SshChannelTransport {
    channel: Channel<client::Msg>,
    inbound: VecDeque<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    eof: bool,
}

impl SshChannelTransport {
    fn new(channel: Channel<client::Msg>) -> Self {
        Self { channel, inbound: VecDeque::new(), stderr: Vec::new(), exit_status: None, eof: false }
    }

    /// Pull one message off the channel, routing it to `inbound`, `stderr`,
    /// or session end-state. Returns `false` once the channel has nothing
    /// more to offer.
    async fn pump(&mut self) -> bool {
        let Some(msg) = self.channel.wait().await else {
            self.eof = true;
            return false;
        };
        match msg {
            ChannelMsg::Data { data } => self.inbound.extend(data.iter().copied()),
            ChannelMsg::ExtendedData { data, .. } => self.stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => self.exit_status = Some(exit_status),
            ChannelMsg::Eof | ChannelMsg::Close => self.eof = true,
            _ => {},
        }
        true
    }

    /// Pump messages until there's inbound data to hand back or the channel
    /// has gone quiet, then check whether it went quiet because the remote
    /// command failed.
    async fn fill(&mut self) -> Result<(), ConnectionError> {
        while self.inbound.is_empty() && !self.eof {
            if !self.pump().await {
                break;
            }
        }
        self.check_failure()
    }

    fn check_failure(&self) -> Result<(), ConnectionError> {
        if !self.inbound.is_empty() || !self.eof {
            return Ok(());
        }
        classify_exit(self.exit_status, &self.stderr).map_err(ConnectionError::from)
    }

    async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, ConnectionError> {
        let mut filled = 0;
        while filled < buf.len() {
            self.fill().await?;
            if self.inbound.is_empty() {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(ConnectionError::ServerClosedConnection {
                    context: "ssh channel closed mid packet-line".to_string(),
                });
            }
            let n = self.inbound.len().min(buf.len() - filled);
            for slot in &mut buf[filled..filled + n] {
                *slot = self.inbound.pop_front().expect("checked non-empty above");
            }
            filled += n;
        }
        Ok(true)
    }
}

#[async_trait]
impl PacketTransport for SshChannelTransport {
    async fn write_packet(&mut self, packet: &OwnedPacket) -> Result<(), ConnectionError> {
        let bytes = match packet {
            OwnedPacket::Data(payload) => encode_data(payload)?,
            OwnedPacket::Flush => encode_marker(Marker::Flush).to_vec(),
            OwnedPacket::Delimiter => encode_marker(Marker::Delimiter).to_vec(),
            OwnedPacket::ResponseEnd => encode_marker(Marker::ResponseEnd).to_vec(),
            OwnedPacket::Unknown => {
                return Err(ConnectionError::Protocol("cannot write an Unknown marker packet".to_string()))
            },
        };
        self.channel.data(bytes.as_slice()).await.map_err(SshTransportError::from)?;
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.channel.data(bytes).await.map_err(SshTransportError::from)?;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Option<OwnedPacket>, ConnectionError> {
        let mut header = [0u8; 4];
        if !self.read_exact_or_eof(&mut header).await? {
            return Ok(None);
        }

        match decode_header_bytes(&header)? {
            HeaderValue::Flush => Ok(Some(OwnedPacket::Flush)),
            HeaderValue::Delimiter => Ok(Some(OwnedPacket::Delimiter)),
            HeaderValue::ResponseEnd => Ok(Some(OwnedPacket::ResponseEnd)),
            HeaderValue::Unknown => Ok(Some(OwnedPacket::Unknown)),
            HeaderValue::Data(len) => {
                let mut payload = vec![0u8; len];
                if !self.read_exact_or_eof(&mut payload).await? {
                    return Err(ConnectionError::ServerClosedConnection {
                        context: "truncated packet-line payload".to_string(),
                    });
                }
                Ok(Some(OwnedPacket::Data(payload)))
            },
        }
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        self.fill().await?;
        let n = self.inbound.len().min(buf.len());
        for slot in &mut buf[..n] {
            *slot = self.inbound.pop_front().expect("checked non-empty above");
        }
        Ok(n)
    }
}

/// The SSH transport substrate, scoped to one `(user, host, port, path)`
/// endpoint.
#[derive(Debug)]
pub struct SshTransport {
    user: String,
    host: String,
    port: u16,
    repo_path: String,
    credential: Option<Credential>,
}

impl SshTransport {
    /// True if `url` uses the `ssh://` scheme this transport handles.
    #[must_use]
    pub fn can_handle(url: &url::Url) -> bool {
        url.scheme() == "ssh"
    }

    /// Build a transport from an `ssh://user@host[:port]/path` URL and an
    /// optional pre-resolved credential.
    ///
    /// # Errors
    ///
    /// [`SshTransportError::InvalidUrl`] if the URL has no host.
    pub fn new(url: &url::Url, credential: Option<Credential>) -> Result<Self, SshTransportError> {
        let host = url.host_str().ok_or_else(|| SshTransportError::InvalidUrl(url.to_string()))?.to_string();
        let user = if url.username().is_empty() { "git".to_string() } else { url.username().to_string() };
        let port = url.port().unwrap_or(22);
        let repo_path = url.path().to_string();
        Ok(Self { user, host, port, repo_path, credential })
    }

    async fn connect(&self) -> Result<Handle<NoopHandler>, SshTransportError> {
        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, (self.host.as_str(), self.port), NoopHandler)
            .await
            .map_err(|source| SshTransportError::Connect { host: self.host.clone(), port: self.port, source })?;

        let authenticated = match &self.credential {
            Some(Credential::Basic { username, secret }) => {
                session.authenticate_password(username, secret).await?
            },
            _ => session.authenticate_none(&self.user).await?,
        };

        if !authenticated.success() {
            return Err(SshTransportError::AuthenticationRejected { user: self.user.clone(), host: self.host.clone() });
        }
        Ok(session)
    }

    /// Open a channel, exec the requested service against this transport's
    /// repository path, and return a transport driven off its message
    /// stream directly (so failures can carry the remote's stderr).
    pub async fn open_service(&self, service: ServiceName) -> Result<SshChannelTransport, SshTransportError> {
        let session = self.connect().await?;
        let channel = session.channel_open_session().await?;

        let command = format!(
            "GIT_PROTOCOL=version={} {} '{}'",
            service.preferred_protocol_version(),
            service.binary(),
            self.repo_path.replace('\'', "'\\''"),
        );
        channel.exec(true, command).await?;

        Ok(SshChannelTransport::new(channel))
    }
}

#[async_trait]
impl ServiceTransport for SshTransport {
    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| Self::can_handle(&u))
    }

    async fn open_fetch(&self) -> Result<Box<dyn PacketTransport>, ConnectionError> {
        Ok(Box::new(self.open_service(ServiceName::UploadPack).await?))
    }

    async fn open_push(&self) -> Result<Box<dyn PacketTransport>, ConnectionError> {
        Ok(Box::new(self.open_service(ServiceName::ReceivePack).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_host_port_path() {
        let url = url::Url::parse("ssh://deploy@git.example.com:2222/srv/repo.git").unwrap();
        let transport = SshTransport::new(&url, None).unwrap();
        assert_eq!(transport.user, "deploy");
        assert_eq!(transport.host, "git.example.com");
        assert_eq!(transport.port, 2222);
        assert_eq!(transport.repo_path, "/srv/repo.git");
    }

    #[test]
    fn defaults_user_to_git_and_port_to_22() {
        let url = url::Url::parse("ssh://git.example.com/srv/repo.git").unwrap();
        let transport = SshTransport::new(&url, None).unwrap();
        assert_eq!(transport.user, "git");
        assert_eq!(transport.port, 22);
    }

    #[test]
    fn protocol_versions_match_design() {
        assert_eq!(ServiceName::UploadPack.preferred_protocol_version(), 2);
        assert_eq!(ServiceName::ReceivePack.preferred_protocol_version(), 1);
    }

    #[test]
    fn classify_exit_zero_status_is_ok() {
        assert!(classify_exit(Some(0), b"warning: noisy but harmless").is_ok());
    }

    #[test]
    fn classify_exit_no_status_is_ok() {
        assert!(classify_exit(None, b"").is_ok());
    }

    #[test]
    fn classify_exit_nonzero_status_carries_stderr() {
        let err = classify_exit(Some(128), b"  fatal: repository not found  \n").unwrap_err();
        match err {
            SshTransportError::RemoteCommandFailed { exit_status, stderr } => {
                assert_eq!(exit_status, 128);
                assert_eq!(stderr, "fatal: repository not found");
            },
            other => panic!("expected RemoteCommandFailed, got {other:?}"),
        }
    }
}
