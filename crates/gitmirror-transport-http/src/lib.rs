//! HTTP smart-protocol transport substrate.
//!
//! The hardest substrate: the wire protocol wants one long bidirectional
//! byte stream, HTTP gives request/response pairs. The mapping batches a
//! whole command's outbound packets into one POST instead of forwarding
//! them as they're written (the same batching seam `lockframe_client`'s
//! transport bridge exposes for a non-duplex substrate): one GET for the
//! hello/advertisement, then one POST per command, with the POST's
//! response body becoming the new read side once the request completes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use gitmirror_core::{
    read_packet_from, Config, Credential, Credentials, ConnectionError, OwnedPacket,
    PacketTransport, ServiceTransport,
};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

/// Errors specific to the HTTP substrate.
#[derive(Error, Debug)]
pub enum HttpTransportError {
    /// The configured base URL isn't `http(s)://`.
    #[error("not a valid http(s):// URL: {0}")]
    InvalidUrl(String),

    /// A non-200 status on the hello GET, or repeated 401/403 after a
    /// credential retry.
    #[error("hello request to {url} failed: {status}")]
    HelloRejected {
        /// The GET URL that failed.
        url: String,
        /// The status returned.
        status: StatusCode,
    },

    /// The hello response's `Content-Type` didn't match the expected
    /// `application/x-<svc>-advertisement`.
    #[error("unexpected content-type {actual:?} for {svc} hello, expected {expected}")]
    ContentTypeMismatch {
        /// Which service was being advertised.
        svc: &'static str,
        /// The header value the server actually sent, if any.
        actual: Option<String>,
        /// The header value this transport required.
        expected: String,
    },

    /// A non-200 status on a command POST.
    #[error("command POST to {url} failed: {status}")]
    CommandRejected {
        /// The POST URL that failed.
        url: String,
        /// The status returned.
        status: StatusCode,
    },

    /// The hello body didn't start with a recognized service line or
    /// version line.
    #[error("malformed hello body: {0}")]
    MalformedHello(String),

    /// A network-level failure from the HTTP client itself.
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl From<HttpTransportError> for ConnectionError {
    fn from(err: HttpTransportError) -> Self {
        match err {
            HttpTransportError::CommandRejected { status, .. } if status == StatusCode::UNAUTHORIZED
                || status == StatusCode::FORBIDDEN =>
            {
                ConnectionError::TransportOpenError(err.to_string())
            },
            HttpTransportError::CommandRejected { .. } => ConnectionError::PushRejected(err.to_string()),
            _ => ConnectionError::TransportOpenError(err.to_string()),
        }
    }
}

/// Which git service an HTTP request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceName {
    /// The fetch-side service.
    UploadPack,
    /// The push-side service.
    ReceivePack,
}

impl ServiceName {
    /// The `service=<name>` / path segment value, e.g. `git-upload-pack`.
    #[must_use]
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// The `GIT_PROTOCOL=version=<n>` value this service is requested with:
    /// v2 for fetch, v1 for push, matching the other two substrates.
    #[must_use]
    pub fn preferred_protocol_version(self) -> u8 {
        match self {
            Self::UploadPack => 2,
            Self::ReceivePack => 1,
        }
    }
}

/// The HTTP transport substrate, scoped to one repository's base URL.
pub struct HttpTransport {
    base_url: reqwest::Url,
    client: Client,
    credentials: std::sync::Arc<dyn Credentials>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").field("base_url", &self.base_url).field("client", &self.client).finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// True if `url` uses the `http://` or `https://` scheme this transport
    /// handles.
    #[must_use]
    pub fn can_handle(url: &reqwest::Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    /// Build a transport for the repository at `url`, using `credentials`
    /// to resolve auth for this origin and `config` for timeouts.
    ///
    /// # Errors
    ///
    /// [`HttpTransportError::InvalidUrl`] if `url` isn't `http(s)://`.
    pub fn new(
        url: &reqwest::Url,
        credentials: std::sync::Arc<dyn Credentials>,
        config: Config,
    ) -> Result<Self, HttpTransportError> {
        if !Self::can_handle(url) {
            return Err(HttpTransportError::InvalidUrl(url.to_string()));
        }
        let client = Client::builder().connect_timeout(Duration::from_secs(60)).timeout(config.http_timeout).build()?;
        Ok(Self { base_url: url.clone(), client, credentials })
    }

    fn origin(&self) -> String {
        let mut origin = format!("{}://{}", self.base_url.scheme(), self.base_url.host_str().unwrap_or_default());
        if let Some(port) = self.base_url.port() {
            origin.push(':');
            origin.push_str(&port.to_string());
        }
        origin
    }

    async fn resolve_credential(&self) -> Option<Credential> {
        self.credentials.get_credentials(&self.origin()).await
    }

    fn command_url(&self, service: ServiceName) -> reqwest::Url {
        let mut url = self.base_url.clone();
        let path = format!("{}/{}", url.path().trim_end_matches('/'), service.wire_name());
        url.set_path(&path);
        url
    }

    fn info_refs_url(&self, service: ServiceName) -> reqwest::Url {
        let mut url = self.base_url.clone();
        let path = format!("{}/info/refs", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut().append_pair("service", service.wire_name());
        url
    }

    /// Perform the hello GET, disambiguate its body, and return a
    /// [`PacketTransport`] ready for the connection core to negotiate a
    /// hello over, plus post commands against.
    ///
    /// # Errors
    ///
    /// Any [`HttpTransportError`] converted to a [`ConnectionError`]: a
    /// non-200 status (after one credential retry on 401/403), a
    /// content-type mismatch, or a malformed hello body.
    pub async fn open_service(&self, service: ServiceName) -> Result<HttpCommandStream, ConnectionError> {
        let url = self.info_refs_url(service);
        let mut credential = self.resolve_credential().await;

        let mut response = self.send_hello(&url, service, credential.as_ref()).await?;
        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            credential = self.resolve_credential().await;
            response = self.send_hello(&url, service, credential.as_ref()).await?;
        }

        if response.status() != StatusCode::OK {
            return Err(HttpTransportError::HelloRejected { url: url.to_string(), status: response.status() }.into());
        }

        let expected_content_type = format!("application/x-{}-advertisement", service.wire_name());
        let actual_content_type = response.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
        if actual_content_type != Some(expected_content_type.as_str()) {
            return Err(HttpTransportError::ContentTypeMismatch {
                svc: service.wire_name(),
                actual: actual_content_type.map(str::to_string),
                expected: expected_content_type,
            }
            .into());
        }

        let body = response.bytes_stream().map_err(|err| std::io::Error::other(err));
        let mut reader: Box<dyn AsyncRead + Unpin + Send> = Box::new(StreamReader::new(body));

        let (protocol_version, pushback) = disambiguate_hello_body(&mut reader, service).await?;

        Ok(HttpCommandStream {
            client: self.client.clone(),
            command_url: self.command_url(service),
            service,
            credential,
            protocol_version,
            pushback,
            reader,
            outbound: None,
        })
    }

    async fn send_hello(
        &self,
        url: &reqwest::Url,
        service: ServiceName,
        credential: Option<&Credential>,
    ) -> Result<reqwest::Response, HttpTransportError> {
        let mut request = self
            .client
            .get(url.clone())
            .header("Git-Protocol", format!("version={}", service.preferred_protocol_version()))
            .header(reqwest::header::ACCEPT, format!("application/x-{}-advertisement", service.wire_name()))
            .header(reqwest::header::USER_AGENT, gitmirror_core::AGENT);
        request = apply_credential(request, credential);
        Ok(request.send().await?)
    }
}

fn apply_credential(request: reqwest::RequestBuilder, credential: Option<&Credential>) -> reqwest::RequestBuilder {
    match credential {
        Some(Credential::Basic { username, secret }) => request.basic_auth(username, Some(secret)),
        Some(Credential::Header(value)) => request.header(reqwest::header::AUTHORIZATION, value),
        None => request,
    }
}

/// Read the first packet(s) of a hello body and decide the negotiated
/// protocol version: strip an optional `# service=<svc>\n` line and its
/// flush, then look at
/// whatever packet follows (or the first packet directly, for servers that
/// omit the service line) to tell v1 from v2.
async fn disambiguate_hello_body(
    reader: &mut (impl AsyncRead + Unpin + Send),
    service: ServiceName,
) -> Result<(u8, Option<OwnedPacket>), ConnectionError> {
    let mut pushback = None;
    let Some(first) = read_packet_from(reader, &mut pushback).await? else {
        return Err(HttpTransportError::MalformedHello("empty hello body".to_string()).into());
    };

    let expected_service_line = format!("# service={}\n", service.wire_name());
    let first_is_service_line =
        matches!(&first, OwnedPacket::Data(payload) if payload.as_slice() == expected_service_line.as_bytes());

    let version_line = if first_is_service_line {
        match read_packet_from(reader, &mut pushback).await? {
            Some(OwnedPacket::Flush) => {},
            other => {
                return Err(HttpTransportError::MalformedHello(format!(
                    "expected flush after service line, got {other:?}"
                ))
                .into())
            },
        }
        read_packet_from(reader, &mut pushback).await?
    } else {
        Some(first)
    };

    let Some(version_line) = version_line else {
        return Err(HttpTransportError::MalformedHello("eof after service line".to_string()).into());
    };

    let is_v2 = matches!(&version_line, OwnedPacket::Data(payload)
        if trimmed(payload) == "version 2");

    Ok((if is_v2 { 2 } else { 1 }, Some(version_line)))
}

fn trimmed(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).unwrap_or_default().trim_end_matches(['\n', '\r'])
}

/// One logical HTTP connection: a GET-produced read side that subsequent
/// POSTs replace in place.
///
/// Unlike [`gitmirror_core::FramedStream`], this cannot be built over a
/// single `Duplex` stream: the GET/POST response body (read-only) and the
/// outbound command body (write-only, streamed into the next POST) are
/// unrelated types. Writes between transactions are buffered into an
/// outbound channel; [`PacketTransport::end_transaction`] is where the
/// batched POST actually goes out, exactly the
/// `_send_packet_transaction` hook the design doc describes.
pub struct HttpCommandStream {
    client: Client,
    command_url: reqwest::Url,
    service: ServiceName,
    credential: Option<Credential>,
    protocol_version: u8,
    pushback: Option<OwnedPacket>,
    reader: Box<dyn AsyncRead + Unpin + Send>,
    outbound: Option<PendingRequest>,
}

struct PendingRequest {
    sender: mpsc::Sender<std::io::Result<Bytes>>,
    handle: JoinHandle<Result<reqwest::Response, reqwest::Error>>,
}

impl HttpCommandStream {
    fn ensure_request_started(&mut self) {
        if self.outbound.is_some() {
            return;
        }
        let (sender, receiver) = mpsc::channel::<std::io::Result<Bytes>>(32);
        let body_stream = ReceiverStream::new(receiver);
        let body = reqwest::Body::wrap_stream(body_stream);

        let mut request = self
            .client
            .post(self.command_url.clone())
            .header(reqwest::header::CONTENT_TYPE, format!("application/x-{}-request", self.service.wire_name()))
            .header(reqwest::header::ACCEPT, format!("application/x-{}-result", self.service.wire_name()))
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header("Git-Protocol", format!("version={}", self.protocol_version))
            .body(body);
        request = apply_credential(request, self.credential.as_ref());

        let handle = tokio::spawn(async move { request.send().await });
        self.outbound = Some(PendingRequest { sender, handle });
    }

    async fn write_bytes(&mut self, bytes: Bytes) -> Result<(), ConnectionError> {
        self.ensure_request_started();
        let sender = self.outbound.as_ref().map(|pending| pending.sender.clone()).expect("just started");
        sender
            .send(Ok(bytes))
            .await
            .map_err(|_| ConnectionError::Transport("http request task ended before body finished".to_string()))
    }
}

#[async_trait]
impl PacketTransport for HttpCommandStream {
    async fn write_packet(&mut self, packet: &OwnedPacket) -> Result<(), ConnectionError> {
        let bytes = match packet {
            OwnedPacket::Data(payload) => Bytes::from(gitmirror_wire::encode_data(payload)?),
            OwnedPacket::Flush => Bytes::copy_from_slice(&gitmirror_wire::encode_marker(gitmirror_wire::Marker::Flush)),
            OwnedPacket::Delimiter => {
                Bytes::copy_from_slice(&gitmirror_wire::encode_marker(gitmirror_wire::Marker::Delimiter))
            },
            OwnedPacket::ResponseEnd => {
                Bytes::copy_from_slice(&gitmirror_wire::encode_marker(gitmirror_wire::Marker::ResponseEnd))
            },
            OwnedPacket::Unknown => {
                return Err(ConnectionError::Protocol("cannot write an Unknown marker packet".to_string()))
            },
        };
        self.write_bytes(bytes).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.write_bytes(Bytes::copy_from_slice(bytes)).await
    }

    async fn end_transaction(&mut self) -> Result<(), ConnectionError> {
        let Some(pending) = self.outbound.take() else {
            return Ok(());
        };
        drop(pending.sender);

        let response = pending
            .handle
            .await
            .map_err(|err| ConnectionError::Transport(format!("http request task panicked: {err}")))?
            .map_err(HttpTransportError::from)?;

        if response.status() != StatusCode::OK {
            return Err(HttpTransportError::CommandRejected {
                url: self.command_url.to_string(),
                status: response.status(),
            }
            .into());
        }

        let body = response.bytes_stream().map_err(|err| std::io::Error::other(err));
        self.reader = Box::new(StreamReader::new(body));
        self.pushback = None;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Option<OwnedPacket>, ConnectionError> {
        read_packet_from(&mut self.reader, &mut self.pushback).await
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        if let Some(packet) = self.pushback.take() {
            match packet {
                OwnedPacket::Data(payload) if payload.len() <= buf.len() => {
                    buf[..payload.len()].copy_from_slice(&payload);
                    return Ok(payload.len());
                },
                other => self.pushback = Some(other),
            }
        }
        let n = self.reader.read(buf).await?;
        Ok(n)
    }
}

#[async_trait]
impl ServiceTransport for HttpTransport {
    fn can_handle(&self, url: &str) -> bool {
        reqwest::Url::parse(url).is_ok_and(|u| Self::can_handle(&u))
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
    fn wire_names_and_versions_match_design() {
        assert_eq!(ServiceName::UploadPack.wire_name(), "git-upload-pack");
        assert_eq!(ServiceName::ReceivePack.wire_name(), "git-receive-pack");
        assert_eq!(ServiceName::UploadPack.preferred_protocol_version(), 2);
        assert_eq!(ServiceName::ReceivePack.preferred_protocol_version(), 1);
    }

    #[test]
    fn can_handle_only_http_schemes() {
        assert!(HttpTransport::can_handle(&reqwest::Url::parse("https://example.com/repo.git").unwrap()));
        assert!(HttpTransport::can_handle(&reqwest::Url::parse("http://example.com/repo.git").unwrap()));
        assert!(!HttpTransport::can_handle(&reqwest::Url::parse("ssh://example.com/repo.git").unwrap()));
    }

    #[tokio::test]
    async fn disambiguates_hello_with_service_line() {
        let mut body = Vec::new();
        body.extend(gitmirror_wire::encode_data(b"# service=git-upload-pack\n").unwrap());
        body.extend(gitmirror_wire::encode_marker(gitmirror_wire::Marker::Flush));
        body.extend(gitmirror_wire::encode_data(b"version 2\n").unwrap());
        body.extend(gitmirror_wire::encode_marker(gitmirror_wire::Marker::Flush));

        let mut reader: &[u8] = &body;
        let (version, pushback) = disambiguate_hello_body(&mut reader, ServiceName::UploadPack).await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(pushback, Some(OwnedPacket::Data(b"version 2\n".to_vec())));
    }

    #[tokio::test]
    async fn disambiguates_hello_without_service_line() {
        let mut body = Vec::new();
        body.extend(gitmirror_wire::encode_data(b"version 2\n").unwrap());
        body.extend(gitmirror_wire::encode_marker(gitmirror_wire::Marker::Flush));

        let mut reader: &[u8] = &body;
        let (version, pushback) = disambiguate_hello_body(&mut reader, ServiceName::UploadPack).await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(pushback, Some(OwnedPacket::Data(b"version 2\n".to_vec())));
    }

    #[tokio::test]
    async fn disambiguates_v1_hello() {
        let mut body = Vec::new();
        body.extend(gitmirror_wire::encode_data(b"# service=git-receive-pack\n").unwrap());
        body.extend(gitmirror_wire::encode_marker(gitmirror_wire::Marker::Flush));
        body.extend(gitmirror_wire::encode_data(&b"0".repeat(40)).unwrap());
        body.extend(gitmirror_wire::encode_marker(gitmirror_wire::Marker::Flush));

        let mut reader: &[u8] = &body;
        let (version, _pushback) = disambiguate_hello_body(&mut reader, ServiceName::ReceivePack).await.unwrap();
        assert_eq!(version, 1);
    }
}
