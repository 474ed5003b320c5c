use thiserror::Error;

/// Top-level error type for the `roomcast-api` crate.
///
/// Covers every failure mode across both API surfaces: the REST session
/// (login, refresh, authorized requests) and the realtime WebSocket
/// channel. `roomcast-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login or token validation failed (wrong credentials, revoked
    /// token, account disabled, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// A request was issued with no active session.
    #[error("Not authenticated -- log in first")]
    NotAuthenticated,

    /// The session's token could not be refreshed; explicit re-login
    /// is required.
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── REST API ────────────────────────────────────────────────────
    /// Structured error response from the platform API.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        message: String,
        code: Option<String>,
        status: u16,
    },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Realtime channel ────────────────────────────────────────────
    /// The realtime endpoint could not be derived or dialed. Runtime
    /// channel failures are reported through the phase watch instead.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),
}

impl Error {
    /// Returns `true` if this error indicates auth has expired
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::NotAuthenticated)
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::WebSocketConnect(_) => true,
            _ => false,
        }
    }
}
