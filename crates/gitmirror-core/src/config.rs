//! Runtime configuration read from the process environment.

use std::time::Duration;

/// Environment variable overriding the HTTP transport's per-request
/// timeout, in whole seconds.
pub const HTTP_TIMEOUT_ENV: &str = "GITMIRROR_HTTP_TIMEOUT";

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 1200;

/// Engine-wide configuration. Constructed once per run by whatever embeds
/// this crate; nothing here is mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How long the HTTP transport waits for a single command's response
    /// before treating the connection as dead.
    pub http_timeout: Duration,
}

impl Config {
    /// Read configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let secs = std::env::var(HTTP_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        Self { http_timeout: Duration::from_secs(secs) }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_matches_documented_value() {
        assert_eq!(Config::default().http_timeout, Duration::from_secs(1200));
    }
}
