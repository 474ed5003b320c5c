// Console configuration.

use std::path::PathBuf;
use std::time::Duration;

use roomcast_api::{ReconnectConfig, TlsMode, TransportConfig};
use url::Url;

use crate::error::CoreError;

/// TLS verification policy for the platform connection.
///
/// Properties with managed hardware frequently run the platform behind a
/// private CA, hence the `CustomCa` variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// Verify against the system trust store.
    #[default]
    SystemDefaults,
    /// Verify against a PEM bundle on disk in addition to the system
    /// store.
    CustomCa(PathBuf),
    /// Skip verification entirely. Lab use only.
    DangerAcceptInvalid,
}

impl TlsVerification {
    fn to_tls_mode(&self) -> TlsMode {
        match self {
            TlsVerification::SystemDefaults => TlsMode::System,
            TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
            TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
        }
    }
}

/// Everything needed to stand up a [`Console`](crate::Console).
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// HTTP base URL of the platform, e.g. `https://panel.hotel.test/`.
    pub url: Url,

    /// Override for the realtime endpoint. When `None`, the endpoint is
    /// derived from `url` (`wss://…/ws/events`).
    pub events_url: Option<Url>,

    pub tls: TlsVerification,

    /// Per-request HTTP timeout.
    pub timeout: Duration,

    /// Bound on a single token refresh exchange.
    pub refresh_timeout: Duration,

    pub reconnect: ReconnectConfig,
}

impl ConsoleConfig {
    /// Config for `url` with every other knob at its default.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            events_url: None,
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Parse `url` and build a default config, rejecting non-HTTP
    /// schemes up front so the failure names the config rather than
    /// surfacing later as a transport error.
    pub fn parse(url: &str) -> Result<Self, CoreError> {
        let url = Url::parse(url).map_err(|e| CoreError::Config {
            message: format!("invalid platform URL {url:?}: {e}"),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoreError::Config {
                message: format!("platform URL must be http(s), got {:?}", url.scheme()),
            });
        }
        Ok(Self::new(url))
    }

    pub(crate) fn transport(&self) -> TransportConfig {
        TransportConfig {
            tls: self.tls.to_tls_mode(),
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_http_and_https() {
        assert!(ConsoleConfig::parse("https://panel.hotel.test/").is_ok());
        assert!(ConsoleConfig::parse("http://127.0.0.1:8080/").is_ok());
    }

    #[test]
    fn parse_rejects_other_schemes() {
        let err = ConsoleConfig::parse("ftp://panel.hotel.test/").unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ConsoleConfig::parse("not a url").is_err());
    }

    #[test]
    fn defaults() {
        let config = ConsoleConfig::parse("https://panel.hotel.test/").unwrap();
        assert_eq!(config.tls, TlsVerification::SystemDefaults);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.refresh_timeout, Duration::from_secs(10));
        assert!(config.events_url.is_none());
    }
}
