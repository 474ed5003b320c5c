// Authenticated session state machine.
//
// One `AuthSession` exists per client process. It owns the token store,
// publishes its status through a watch channel (the bridge in
// roomcast-core reacts to transitions), and is the sole path by which
// the rest of the system talks to the backend: every business request
// goes through the authorized helpers, which attach the bearer token and
// transparently recover from a 401 with at most one coalesced refresh
// and exactly one replay.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::token::{Token, TokenStore};
use crate::transport::TransportConfig;

// ── Principal ────────────────────────────────────────────────────────

/// Authenticated user identity and role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: uuid::Uuid,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: Role,
}

/// Access level of the authenticated administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    Manager,
    Staff,
    #[default]
    Unknown,
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "admin" => Self::Admin,
            "manager" => Self::Manager,
            "staff" => Self::Staff,
            _ => Self::Unknown,
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Admin => "admin".into(),
            Role::Manager => "manager".into(),
            Role::Staff => "staff".into(),
            Role::Unknown => "unknown".into(),
        }
    }
}

// ── SessionStatus ────────────────────────────────────────────────────

/// Observable session lifecycle state.
///
/// `Expired` is terminal until an explicit [`AuthSession::login`] -- it is
/// never silently collapsed into `Unauthenticated`, so consumers can
/// distinguish "never logged in" from "was logged in, now invalid".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    principal: Principal,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    principal: Principal,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

// ── AuthSession ──────────────────────────────────────────────────────

/// Login/logout/refresh state machine plus authorized request helpers.
///
/// Cheaply cloneable via `Arc` inner; all methods take `&self`.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    http: reqwest::Client,
    base_url: Url,
    tokens: TokenStore,
    principal: ArcSwapOption<Principal>,
    status_tx: watch::Sender<SessionStatus>,
    /// Single-flight guard: at most one refresh call is in flight; token
    /// writes during recovery happen only inside this critical section.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped on every local teardown (logout, expiry, fresh login). A
    /// refresh whose network call straddles a bump must discard its
    /// result instead of resurrecting the torn-down session.
    epoch: AtomicU64,
    refresh_timeout: Duration,
}

impl AuthSession {
    /// Create an unauthenticated session against `base_url`.
    ///
    /// `refresh_timeout` bounds the wait on a refresh call so a
    /// connectivity stall cannot wedge the single-flight lock.
    pub fn new(
        base_url: Url,
        transport: &TransportConfig,
        refresh_timeout: Duration,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        let (status_tx, _) = watch::channel(SessionStatus::Unauthenticated);

        Ok(Self {
            inner: Arc::new(SessionInner {
                http,
                base_url,
                tokens: TokenStore::new(),
                principal: ArcSwapOption::empty(),
                status_tx,
                refresh_lock: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                refresh_timeout,
            }),
        })
    }

    // ── State observation ────────────────────────────────────────────

    /// Subscribe to session status transitions.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx().subscribe()
    }

    /// The current status snapshot.
    pub fn current_status(&self) -> SessionStatus {
        *self.status_tx().borrow()
    }

    /// The current token, if any. Read-only copy.
    pub fn token(&self) -> Option<Token> {
        self.inner.tokens.get()
    }

    /// The authenticated principal. `None` unless status is Authenticated.
    pub fn principal(&self) -> Option<Arc<Principal>> {
        self.inner.principal.load_full()
    }

    fn status_tx(&self) -> &watch::Sender<SessionStatus> {
        &self.inner.status_tx
    }

    // ── Lifecycle transitions ────────────────────────────────────────

    /// Authenticate with the platform using identifier/secret.
    ///
    /// On success the token and principal are stored and status becomes
    /// Authenticated. On any failure (bad credentials, network, server)
    /// the session is left unauthenticated and a typed error is
    /// returned. Never retried automatically.
    pub async fn login(
        &self,
        identifier: &str,
        secret: &SecretString,
    ) -> Result<Principal, Error> {
        self.clear_local(SessionStatus::Authenticating);

        let url = self.inner.base_url.join("auth/login")?;
        debug!(%url, "logging in");

        let body = json!({
            "identifier": identifier,
            "secret": secret.expose_secret(),
        });

        let resp = match self.inner.http.post(url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.clear_local(SessionStatus::Unauthenticated);
                return Err(Error::Transport(e));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            self.clear_local(SessionStatus::Unauthenticated);
            return Err(Error::Authentication {
                message: format!("login failed (HTTP {status}): {body}"),
            });
        }

        let grant: LoginResponse = match parse_body(resp).await {
            Ok(grant) => grant,
            Err(e) => {
                self.clear_local(SessionStatus::Unauthenticated);
                return Err(e);
            }
        };

        self.install(Token::new(grant.token), grant.principal.clone());
        debug!(principal = %grant.principal.email, "login successful");
        Ok(grant.principal)
    }

    /// Validate a locally cached token at process start.
    ///
    /// Probes `GET /auth/profile` with the candidate token; on success
    /// the session behaves exactly as after a fresh login. A rejected
    /// token leaves the session Unauthenticated (the cache was stale,
    /// not an expired live session).
    pub async fn resume(&self, token: Token) -> Result<Principal, Error> {
        self.clear_local(SessionStatus::Authenticating);

        let url = self.inner.base_url.join("auth/profile")?;
        debug!(%url, "validating cached token");

        let resp = match self
            .inner
            .http
            .get(url)
            .bearer_auth(token.as_str())
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.clear_local(SessionStatus::Unauthenticated);
                return Err(Error::Transport(e));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            self.clear_local(SessionStatus::Unauthenticated);
            return Err(Error::Authentication {
                message: format!("cached token rejected (HTTP {status})"),
            });
        }

        let profile: ProfileResponse = match parse_body(resp).await {
            Ok(profile) => profile,
            Err(e) => {
                self.clear_local(SessionStatus::Unauthenticated);
                return Err(e);
            }
        };

        self.install(token, profile.principal.clone());
        Ok(profile.principal)
    }

    /// End the session. Always succeeds from the caller's perspective.
    ///
    /// Local state is cleared unconditionally *before* the server is
    /// notified; a failed logout call is swallowed. Requests already
    /// waiting on an in-flight refresh observe the cleared token and
    /// fail with `SessionExpired` instead of being replayed.
    pub async fn logout(&self) {
        let token = self.inner.tokens.get();
        self.clear_local(SessionStatus::Unauthenticated);

        let Some(token) = token else { return };
        let Ok(url) = self.inner.base_url.join("auth/logout") else {
            return;
        };

        if let Err(e) = self
            .inner
            .http
            .post(url)
            .bearer_auth(token.as_str())
            .send()
            .await
        {
            debug!(error = %e, "logout notification failed (ignored)");
        }
    }

    fn install(&self, token: Token, principal: Principal) {
        self.inner.tokens.set(token);
        self.inner.principal.store(Some(Arc::new(principal)));
        let _ = self.inner.status_tx.send_replace(SessionStatus::Authenticated);
    }

    fn clear_local(&self, status: SessionStatus) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.tokens.clear();
        self.inner.principal.store(None);
        let _ = self.inner.status_tx.send_replace(status);
    }

    // ── Authorized request helpers ───────────────────────────────────

    /// Authorized GET, deserializing the JSON response body.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let resp = self.send_authorized(Method::GET, path, None).await?;
        parse_response(resp).await
    }

    /// Authorized POST with a JSON body.
    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, Error> {
        let body = to_replayable(body)?;
        let resp = self.send_authorized(Method::POST, path, Some(body)).await?;
        parse_response(resp).await
    }

    /// Authorized PUT with a JSON body.
    pub async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, Error> {
        let body = to_replayable(body)?;
        let resp = self.send_authorized(Method::PUT, path, Some(body)).await?;
        parse_response(resp).await
    }

    /// Authorized DELETE; the response body is discarded.
    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        let resp = self.send_authorized(Method::DELETE, path, None).await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    /// Send one authorized request with the single-retry contract:
    /// a 401 triggers at most one (coalesced) refresh, then the original
    /// request is replayed exactly once with the fresh token.
    async fn send_authorized(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, Error> {
        let url = self.inner.base_url.join(path)?;

        let Some(token) = self.inner.tokens.get() else {
            return Err(match self.current_status() {
                SessionStatus::Expired => Error::SessionExpired,
                _ => Error::NotAuthenticated,
            });
        };

        let resp = self.dispatch(&token, &method, &url, body.as_ref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        debug!(%url, "request unauthorized; attempting token refresh");
        let fresh = self.refresh_after_unauthorized(&token).await?;

        let resp = self.dispatch(&fresh, &method, &url, body.as_ref()).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            // Replay is bounded at one. A freshly minted token that still
            // fails means the session is gone server-side.
            warn!(%url, "replayed request still unauthorized");
            self.clear_local(SessionStatus::Expired);
            return Err(Error::SessionExpired);
        }
        Ok(resp)
    }

    async fn dispatch(
        &self,
        token: &Token,
        method: &Method,
        url: &Url,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, Error> {
        debug!(%method, %url, "dispatching authorized request");

        let mut req = self
            .inner
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(token.as_str());
        if let Some(body) = body {
            req = req.json(body);
        }

        req.send().await.map_err(Error::Transport)
    }

    // ── Single-flight refresh ────────────────────────────────────────

    /// Exchange the stale token for a fresh one, coalescing concurrent
    /// callers onto a single network call.
    ///
    /// Whichever caller acquires the lock first performs the refresh;
    /// the rest block on the lock and, once inside, observe either the
    /// changed token (peer succeeded -- reuse it, no second call) or the
    /// torn-down session (peer failed, or a logout intervened -- fail
    /// with `SessionExpired`, abandoning the replay).
    async fn refresh_after_unauthorized(&self, stale: &Token) -> Result<Token, Error> {
        let _guard = self.inner.refresh_lock.lock().await;

        match self.inner.tokens.get() {
            Some(current) if current != *stale => return Ok(current),
            None => return Err(Error::SessionExpired),
            Some(_) => {}
        }
        if self.current_status() == SessionStatus::Expired {
            return Err(Error::SessionExpired);
        }

        // A logout (or a fresh login) landing while the exchange is on
        // the wire bumps the epoch; the result is then discarded rather
        // than written over the torn-down session.
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        debug!("refreshing session token");
        match self.perform_refresh(stale).await {
            Ok(token) => {
                if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                    debug!("session torn down during refresh; discarding fresh token");
                    return Err(Error::SessionExpired);
                }
                self.inner.tokens.set(token.clone());
                let _ = self.inner.status_tx.send_replace(SessionStatus::Authenticated);
                debug!("token refresh successful");
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed; session expired");
                if self.inner.epoch.load(Ordering::SeqCst) == epoch {
                    self.clear_local(SessionStatus::Expired);
                }
                Err(Error::SessionExpired)
            }
        }
    }

    /// The actual `POST /auth/refresh` exchange, bounded by the
    /// configured refresh timeout.
    async fn perform_refresh(&self, stale: &Token) -> Result<Token, Error> {
        let url = self.inner.base_url.join("auth/refresh")?;

        let fut = self
            .inner
            .http
            .post(url)
            .bearer_auth(stale.as_str())
            .send();

        let resp = tokio::time::timeout(self.inner.refresh_timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: self.inner.refresh_timeout.as_secs(),
            })?
            .map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: format!("refresh rejected (HTTP {status}): {body}"),
            });
        }

        let grant: RefreshResponse = parse_body(resp).await?;
        Ok(Token::new(grant.token))
    }
}

// ── Response parsing ─────────────────────────────────────────────────

/// Serialize a request body once up front so the 401 replay sends
/// byte-identical JSON.
fn to_replayable(body: &impl Serialize) -> Result<serde_json::Value, Error> {
    serde_json::to_value(body).map_err(|e| Error::Deserialization {
        message: format!("request body serialization failed: {e}"),
        body: String::new(),
    })
}

/// Parse a business response: non-2xx becomes `Error::Api`, success is
/// deserialized into `T`.
async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();
    let body = resp.text().await.map_err(Error::Transport)?;

    if !status.is_success() {
        return Err(api_error(status, &body));
    }

    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

/// Deserialize a 2xx body into `T` (auth endpoints, where non-2xx has
/// already been handled by the caller).
async fn parse_body<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let body = resp.text().await.map_err(Error::Transport)?;
    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

/// Build an `Error::Api` from a non-2xx status and its body, parsing the
/// platform's `{message, code}` error envelope when present.
fn api_error(status: StatusCode, body: &str) -> Error {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => Error::Api {
            message: parsed.message,
            code: parsed.code,
            status: status.as_u16(),
        },
        Err(_) => Error::Api {
            message: if body.is_empty() {
                status.to_string()
            } else {
                body.to_owned()
            },
            code: None,
            status: status.as_u16(),
        },
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_known_and_unknown() {
        assert_eq!(Role::from("admin".to_owned()), Role::Admin);
        assert_eq!(Role::from("manager".to_owned()), Role::Manager);
        assert_eq!(Role::from("staff".to_owned()), Role::Staff);
        assert_eq!(Role::from("night-auditor".to_owned()), Role::Unknown);
    }

    #[test]
    fn api_error_parses_envelope() {
        let err = api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message":"room number taken","code":"room.conflict"}"#,
        );
        match err {
            Error::Api {
                message,
                code,
                status,
            } => {
                assert_eq!(message, "room number taken");
                assert_eq!(code.as_deref(), Some("room.conflict"));
                assert_eq!(status, 422);
            }
            other => panic!("expected Api error, got: {other:?}"),
        }
    }

    #[test]
    fn api_error_falls_back_to_raw_body() {
        let err = api_error(StatusCode::BAD_GATEWAY, "upstream down");
        match err {
            Error::Api { message, code, status } => {
                assert_eq!(message, "upstream down");
                assert!(code.is_none());
                assert_eq!(status, 502);
            }
            other => panic!("expected Api error, got: {other:?}"),
        }
    }

    #[test]
    fn principal_deserializes_with_defaulted_role() {
        let principal: Principal = serde_json::from_str(
            r#"{"id":"4f1f3a34-9c07-4d2f-9a0f-2b8d8f6a1f00","name":"Dana","email":"dana@hotel.test"}"#,
        )
        .expect("principal should deserialize without a role field");
        assert_eq!(principal.role, Role::Unknown);
    }
}
