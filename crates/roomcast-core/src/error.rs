// ── Core error types ──
//
// User-facing errors from roomcast-core. These are NOT transport-
// specific -- consumers never see raw HTTP or WebSocket failures
// directly. The `From<roomcast_api::Error>` impl translates transport-
// layer errors into domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach the platform at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Session expired -- log in again")]
    SessionExpired,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Realtime channel ─────────────────────────────────────────────
    #[error("Realtime channel unavailable: {reason}")]
    ChannelUnavailable { reason: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// The platform error code (e.g., "app.duplicate").
        code: Option<String>,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<roomcast_api::Error> for CoreError {
    fn from(err: roomcast_api::Error) -> Self {
        match err {
            roomcast_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            roomcast_api::Error::NotAuthenticated => CoreError::NotLoggedIn,
            roomcast_api::Error::SessionExpired => CoreError::SessionExpired,
            roomcast_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map(|u| u.to_string())
                            .unwrap_or_else(|| "<unknown>".into()),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        code: None,
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            roomcast_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            roomcast_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            roomcast_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            roomcast_api::Error::Api {
                message,
                code,
                status,
            } => CoreError::Api {
                message,
                code,
                status: Some(status),
            },
            roomcast_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            roomcast_api::Error::WebSocketConnect(reason) => {
                CoreError::ChannelUnavailable { reason }
            }
        }
    }
}
