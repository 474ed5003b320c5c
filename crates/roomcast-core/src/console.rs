//! The console: one object wiring session, channel, and dispatcher
//! together for a UI frontend.
//!
//! Construction is cheap and infallible apart from config validation;
//! nothing touches the network until [`Console::init`] or
//! [`Console::login`]. `init` starts the background plumbing (the
//! session/channel bridge and the event pump) and optionally resumes a
//! cached token; [`Console::teardown`] shuts all of it down.

use std::sync::Arc;

use roomcast_api::{
    AuthSession, ChannelPhase, Principal, PushEvent, RealtimeChannel, SessionStatus, Token,
};
use secrecy::SecretString;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::SessionChannelBridge;
use crate::config::ConsoleConfig;
use crate::dispatch::EventDispatcher;
use crate::error::CoreError;

/// Top-level handle for a frontend. Cheaply cloneable.
#[derive(Clone)]
pub struct Console {
    inner: Arc<ConsoleInner>,
}

struct ConsoleInner {
    session: AuthSession,
    channel: RealtimeChannel,
    dispatcher: EventDispatcher,
    cancel: CancellationToken,
    bridge: Mutex<Option<SessionChannelBridge>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Console {
    /// Build the console from config. No network I/O happens here.
    pub fn new(config: &ConsoleConfig) -> Result<Self, CoreError> {
        let session = AuthSession::new(
            config.url.clone(),
            &config.transport(),
            config.refresh_timeout,
        )?;

        let ws_url = match &config.events_url {
            Some(url) => url.clone(),
            None => RealtimeChannel::event_endpoint(&config.url)?,
        };
        let channel = RealtimeChannel::new(ws_url, config.reconnect.clone());

        Ok(Self {
            inner: Arc::new(ConsoleInner {
                session,
                channel,
                dispatcher: EventDispatcher::new(),
                cancel: CancellationToken::new(),
                bridge: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        })
    }

    /// Start the background plumbing and, if a cached token is
    /// provided, try to resume the previous session.
    ///
    /// A rejected cached token is not an error -- the console simply
    /// starts unauthenticated and the caller prompts for login.
    /// Calling `init` more than once is a no-op beyond the resume.
    pub async fn init(&self, cached: Option<Token>) -> Option<Principal> {
        {
            let mut pump = self.inner.pump.lock().await;
            if pump.is_none() {
                *pump = Some(self.inner.dispatcher.attach(
                    self.inner.channel.events(),
                    self.inner.cancel.clone(),
                ));
            }
        }
        {
            let mut bridge = self.inner.bridge.lock().await;
            if bridge.is_none() {
                *bridge = Some(SessionChannelBridge::spawn(
                    self.inner.session.clone(),
                    self.inner.channel.clone(),
                ));
            }
        }

        let token = cached?;
        match self.inner.session.resume(token).await {
            Ok(principal) => {
                info!(principal = %principal.email, "session resumed from cached token");
                Some(principal)
            }
            Err(e) => {
                debug!(error = %e, "cached token rejected; starting unauthenticated");
                None
            }
        }
    }

    /// Authenticate. The bridge opens the realtime channel on success.
    pub async fn login(
        &self,
        identifier: &str,
        secret: &SecretString,
    ) -> Result<Principal, CoreError> {
        Ok(self.inner.session.login(identifier, secret).await?)
    }

    /// End the session; the bridge closes the channel in response.
    pub async fn logout(&self) {
        self.inner.session.logout().await;
    }

    /// Full shutdown: log out, stop the bridge and pump, close the
    /// channel. The console is not reusable afterwards.
    pub async fn teardown(&self) {
        self.inner.session.logout().await;

        if let Some(bridge) = self.inner.bridge.lock().await.take() {
            bridge.shutdown().await;
        }

        self.inner.cancel.cancel();
        if let Some(pump) = self.inner.pump.lock().await.take() {
            let _ = pump.await;
        }

        self.inner.channel.disconnect().await;
        debug!("console torn down");
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn session(&self) -> &AuthSession {
        &self.inner.session
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.inner.channel
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.session.status()
    }

    pub fn phase(&self) -> watch::Receiver<ChannelPhase> {
        self.inner.channel.phase()
    }

    pub fn principal(&self) -> Option<Arc<Principal>> {
        self.inner.session.principal()
    }

    pub fn events(&self) -> broadcast::Receiver<Arc<PushEvent>> {
        self.inner.channel.events()
    }
}
