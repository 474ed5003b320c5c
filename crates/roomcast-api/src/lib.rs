// roomcast-api: transport layer for the Roomcast admin console.
//
// Owns the authenticated session (login, single-flight token refresh,
// authorized request helpers) and the realtime WebSocket channel
// (auto-reconnect, room subscriptions, event fan-out). Higher layers
// consume these through `roomcast-core`.

pub mod channel;
pub mod error;
pub mod session;
pub mod token;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use channel::{
    ChannelFailure, ChannelPhase, PushEvent, RealtimeChannel, ReconnectConfig,
};
pub use error::Error;
pub use session::{AuthSession, Principal, Role, SessionStatus};
pub use token::{Token, TokenStore};
pub use transport::{TlsMode, TransportConfig};
