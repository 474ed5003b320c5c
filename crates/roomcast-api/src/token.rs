// Bearer token storage.
//
// The token is the one piece of state shared across concurrent request
// callers. `TokenStore` holds it behind an `ArcSwapOption` so reads are
// lock-free; writes happen only in the session's login/refresh/logout
// paths (refresh writes are serialized by the session's refresh lock).

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// An opaque bearer credential authorizing REST and channel access.
///
/// Expiry is not tracked client-side -- the server signals it with a 401
/// and the session refreshes reactively. Copies handed out are read-only
/// values; nothing outside [`TokenStore`] mutates one in place.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw bearer string, for constructing `Authorization` headers.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log credential material.
        f.write_str("Token(***)")
    }
}

/// Process-wide holder for the current [`Token`]. No network logic.
#[derive(Default)]
pub struct TokenStore {
    current: ArcSwapOption<Token>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current token, if any.
    pub fn get(&self) -> Option<Token> {
        self.current.load_full().map(|t| (*t).clone())
    }

    /// Replace the current token.
    pub fn set(&self, token: Token) {
        self.current.store(Some(Arc::new(token)));
    }

    /// Drop the current token.
    pub fn clear(&self) {
        self.current.store(None);
    }
}
