//! Picks a [`gitmirror_core::ServiceTransport`] by URL scheme.
//!
//! A short ordered list of factories, each asked "can you handle this?"
//! before the next is tried — the same pattern `lockframe_server` uses to
//! pick a session transport by ALPN.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use gitmirror_core::{Config, Credentials, ConnectionError, ServiceTransport};
use gitmirror_transport_file::FileTransport;
use gitmirror_transport_http::HttpTransport;
use gitmirror_transport_ssh::SshTransport;

/// Something that can build a [`ServiceTransport`] for URLs it recognizes.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// True if this factory's transport should handle `url`.
    fn can_handle(&self, url: &str) -> bool;

    /// Build a transport for `url`, resolving whatever credential it needs
    /// from `credentials`.
    async fn build(&self, url: &str, credentials: Arc<dyn Credentials>) -> Result<Box<dyn ServiceTransport>, ConnectionError>;
}

fn parse_url(url: &str) -> Result<url::Url, ConnectionError> {
    url::Url::parse(url).map_err(|_| ConnectionError::UnsupportedScheme(url.to_string()))
}

fn origin_of(url: &url::Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

/// Builds [`gitmirror_transport_file::FileTransport`]s for `file://` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTransportFactory;

#[async_trait]
impl TransportFactory for FileTransportFactory {
    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| FileTransport::can_handle(&u))
    }

    async fn build(&self, url: &str, _credentials: Arc<dyn Credentials>) -> Result<Box<dyn ServiceTransport>, ConnectionError> {
        let parsed = parse_url(url)?;
        Ok(Box::new(FileTransport::new(&parsed).map_err(|err| ConnectionError::TransportOpenError(err.to_string()))?))
    }
}

/// Builds [`gitmirror_transport_ssh::SshTransport`]s for `ssh://` URLs.
///
/// Unlike the HTTP substrate, SSH authenticates once at session setup, so
/// the credential is resolved eagerly here rather than carried as a
/// provider the transport re-consults.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshTransportFactory;

#[async_trait]
impl TransportFactory for SshTransportFactory {
    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| SshTransport::can_handle(&u))
    }

    async fn build(&self, url: &str, credentials: Arc<dyn Credentials>) -> Result<Box<dyn ServiceTransport>, ConnectionError> {
        let parsed = parse_url(url)?;
        let credential = credentials.get_credentials(&origin_of(&parsed)).await;
        Ok(Box::new(
            SshTransport::new(&parsed, credential).map_err(|err| ConnectionError::TransportOpenError(err.to_string()))?,
        ))
    }
}

/// Builds [`gitmirror_transport_http::HttpTransport`]s for `http(s)://` URLs.
pub struct HttpTransportFactory {
    config: Config,
}

impl HttpTransportFactory {
    /// Build a factory with an explicit HTTP configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Default for HttpTransportFactory {
    fn default() -> Self {
        Self::new(Config::from_env())
    }
}

#[async_trait]
impl TransportFactory for HttpTransportFactory {
    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| HttpTransport::can_handle(&u))
    }

    async fn build(&self, url: &str, credentials: Arc<dyn Credentials>) -> Result<Box<dyn ServiceTransport>, ConnectionError> {
        let parsed = parse_url(url)?;
        Ok(Box::new(
            HttpTransport::new(&parsed, credentials, self.config.clone())
                .map_err(|err| ConnectionError::TransportOpenError(err.to_string()))?,
        ))
    }
}

/// An ordered list of [`TransportFactory`]s, tried in registration order.
pub struct TransportRegistry {
    factories: Vec<Box<dyn TransportFactory>>,
}

impl TransportRegistry {
    /// An empty registry with no adapters registered.
    #[must_use]
    pub fn empty() -> Self {
        Self { factories: Vec::new() }
    }

    /// A registry with the three built-in substrates registered in the
    /// order file, ssh, http.
    #[must_use]
    pub fn with_default_adapters() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(FileTransportFactory));
        registry.register(Box::new(SshTransportFactory));
        registry.register(Box::new(HttpTransportFactory::default()));
        registry
    }

    /// Add a factory to the end of the registration order.
    pub fn register(&mut self, factory: Box<dyn TransportFactory>) {
        self.factories.push(factory);
    }

    /// Build a transport for `url` by trying each registered factory in
    /// order.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::UnsupportedScheme`] if no factory recognizes
    /// `url`, or whatever error the matching factory's construction fails
    /// with.
    pub async fn from_url(
        &self,
        url: &str,
        credentials: Arc<dyn Credentials>,
    ) -> Result<Box<dyn ServiceTransport>, ConnectionError> {
        for factory in &self.factories {
            if factory.can_handle(url) {
                return factory.build(url, credentials).await;
            }
        }
        Err(ConnectionError::UnsupportedScheme(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use gitmirror_core::NoCredentials;

    use super::*;

    #[tokio::test]
    async fn unrecognized_scheme_is_rejected() {
        let registry = TransportRegistry::with_default_adapters();
        let err = registry.from_url("ftp://example.com/repo.git", Arc::new(NoCredentials)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn file_scheme_is_tried_before_falling_through() {
        let dir = std::env::temp_dir().join("gitmirror-registry-test-repo");
        let _ = std::fs::create_dir_all(dir.join("objects"));
        let url = format!("file://{}", dir.display());

        let registry = TransportRegistry::with_default_adapters();
        let transport = registry.from_url(&url, Arc::new(NoCredentials)).await;
        assert!(transport.is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn empty_registry_rejects_everything() {
        let registry = TransportRegistry::empty();
        let err = registry.from_url("file:///tmp", Arc::new(NoCredentials)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::UnsupportedScheme(_)));
    }
}
