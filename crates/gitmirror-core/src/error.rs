//! Connection-level error taxonomy.
//!
//! Wire-level parsing failures (`gitmirror_wire::WireError`) and transport
//! I/O failures both fold into this one enum at the connection boundary, the
//! same shape `lockframe_core::ConnectionError` uses for its own proto/io
//! split.

use std::collections::BTreeSet;

use thiserror::Error;

/// Everything that can go wrong while a connection negotiates or carries out
/// a fetch or push.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// No registered transport recognizes the URL's scheme.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The transport substrate failed before a connection could even be
    /// opened (process spawn failure, DNS failure, TLS handshake failure).
    #[error("failed to open transport: {0}")]
    TransportOpenError(String),

    /// The peer sent something that does not fit the expected grammar at
    /// this point in the state machine (wrong packet kind, malformed hello,
    /// disallowed response section).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A v2 `fetch` negotiation ended in a flush with one or more `want`s
    /// never acknowledged.
    #[error("negotiation failed: server never acknowledged {missing_oids:?}")]
    NegotiationFailed {
        /// Wanted object ids the server did not acknowledge.
        missing_oids: BTreeSet<String>,
    },

    /// The peer closed the connection mid-section, with a framing-level
    /// explanation of where.
    #[error("server closed connection: {context}")]
    ServerClosedConnection {
        /// What the reader was in the middle of doing.
        context: String,
    },

    /// A non-200 HTTP status on a push POST, or a sideband-3 error line
    /// received while reading `report-status`.
    #[error("push rejected: {0}")]
    PushRejected(String),

    /// The operation was cancelled by its caller (e.g. an external timeout).
    /// Never synthesized internally; substrates may surface their own
    /// cancellation this way.
    #[error("operation cancelled")]
    Cancelled,

    /// A packet-line failed to decode or encode.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An I/O failure at the transport substrate, not otherwise classified.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// True for failures worth a caller retrying the whole mirror operation
    /// (transient transport hiccups), false for failures that will recur
    /// given the same inputs (protocol violations, rejected pushes).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransportOpenError(_) | Self::ServerClosedConnection { .. } | Self::Transport(_)
        )
    }
}

impl From<gitmirror_wire::WireError> for ConnectionError {
    fn from(err: gitmirror_wire::WireError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::ServerClosedConnection { context: err.to_string() }
        } else {
            Self::Transport(err.to_string())
        }
    }
}
