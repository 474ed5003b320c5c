// Session/channel bridge.
//
// The realtime channel never reads the token store itself; this task
// watches session status transitions and drives the channel to match:
// Authenticated opens (or re-keys) the channel with the current token,
// Unauthenticated and Expired tear it down. A successful token refresh
// re-announces Authenticated, which the watch delivers even when the
// status value is unchanged, so the channel is re-keyed with the fresh
// token rather than left running on the revoked one.

use roomcast_api::{AuthSession, RealtimeChannel, SessionStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Background task keeping the realtime channel in lockstep with the
/// session lifecycle.
pub struct SessionChannelBridge {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SessionChannelBridge {
    /// Start the bridge. The session's state at spawn time is applied
    /// immediately, so a bridge spawned after a successful resume
    /// connects the channel right away.
    pub fn spawn(session: AuthSession, channel: RealtimeChannel) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge_loop(session, channel, cancel.clone()));
        Self { cancel, handle }
    }

    /// Stop the bridge task. The channel is left in whatever state it
    /// was in; callers that want it closed disconnect it themselves.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn bridge_loop(session: AuthSession, channel: RealtimeChannel, cancel: CancellationToken) {
    let mut status = session.status();

    let initial = *status.borrow_and_update();
    apply(&session, &channel, initial).await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                debug!(?current, "session status changed");
                apply(&session, &channel, current).await;
            }
        }
    }
    debug!("session/channel bridge exiting");
}

async fn apply(session: &AuthSession, channel: &RealtimeChannel, status: SessionStatus) {
    match status {
        SessionStatus::Authenticated => {
            // Token may already be gone if a logout raced the watch
            // wakeup; the next transition will tear the channel down.
            if let Some(token) = session.token() {
                channel.connect(token).await;
            }
        }
        SessionStatus::Unauthenticated | SessionStatus::Expired => {
            channel.disconnect().await;
        }
        SessionStatus::Authenticating => {}
    }
}
