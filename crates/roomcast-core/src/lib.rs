// roomcast-core: session lifecycle and realtime plumbing between
// roomcast-api and UI consumers.

pub mod bridge;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod event;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::SessionChannelBridge;
pub use config::{ConsoleConfig, TlsVerification};
pub use console::Console;
pub use dispatch::{EventDispatcher, HandlerError, HandlerId};
pub use error::CoreError;
pub use event::{EventCategory, EventKind, names};

// Re-export the api-layer types consumers interact with directly.
pub use roomcast_api::{
    ChannelFailure, ChannelPhase, Principal, PushEvent, ReconnectConfig, Role, SessionStatus,
    Token,
};
