//! Credential lookup, abstracted away from where secrets actually live.
//!
//! Transports ask a `Credentials` implementation for a secret scoped to an
//! origin string (e.g. `https://github.com`) rather than reading environment
//! variables or config files themselves, so the engine never has an opinion
//! on secret storage.

use async_trait::async_trait;

/// A credential a transport can present to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// HTTP Basic auth: username and password/token.
    Basic {
        /// Basic auth username.
        username: String,
        /// Basic auth password or personal access token.
        secret: String,
    },
    /// A complete `Authorization` header value, e.g. `Bearer <token>`.
    Header(String),
}

/// Looks up credentials for a given origin.
#[async_trait]
pub trait Credentials: Send + Sync {
    /// Return a credential to present for `origin`, or `None` for anonymous
    /// access.
    async fn get_credentials(&self, origin: &str) -> Option<Credential>;
}

/// A `Credentials` provider that always returns `None` (anonymous access).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl Credentials for NoCredentials {
    async fn get_credentials(&self, _origin: &str) -> Option<Credential> {
        None
    }
}
