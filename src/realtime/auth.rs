//! Connection admission: token extraction and verification.
//!
//! A token arrives either in the explicit auth field of the handshake
//! (optionally prefixed with `Bearer `) or in the session cookie. Verifying
//! it is delegated to a [`TokenVerifier`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default name of the session cookie carrying the token
pub const DEFAULT_SESSION_COOKIE: &str = "session";

/// What a client presents when opening a connection
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Explicit auth field
    pub auth_token: Option<String>,

    /// Raw `Cookie` header
    pub cookie_header: Option<String>,
}

impl Handshake {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            auth_token: Some(token.into()),
            cookie_header: None,
        }
    }

    pub fn with_cookies(header: impl Into<String>) -> Self {
        Self {
            auth_token: None,
            cookie_header: Some(header.into()),
        }
    }
}

/// Pull the bearer token out of a handshake; the auth field wins over the cookie
pub fn extract_token(handshake: &Handshake, cookie_name: &str) -> Option<String> {
    if let Some(raw) = handshake.auth_token.as_deref() {
        let raw = raw.trim_start();
        // Scheme is case-insensitive; a bare "Bearer" carries no token
        let token = match raw.get(..6) {
            Some(scheme)
                if scheme.eq_ignore_ascii_case("bearer")
                    && raw[6..].chars().next().map_or(true, char::is_whitespace) =>
            {
                &raw[6..]
            }
            _ => raw,
        }
        .trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    handshake
        .cookie_header
        .as_deref()?
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| name.trim() == cookie_name && !value.trim().is_empty())
        .map(|(_, value)| value.trim().to_string())
}

/// Verified identity of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token rejected: {0}")]
    Rejected(String),

    #[error("Token verifier unavailable: {0}")]
    Unavailable(String),
}

/// Opaque token verification capability
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token → user table, for development and tests
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.insert(token, user_id);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.insert(token.into(), Identity::new(user_id));
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Rejected("unknown token".to_string()))
    }
}
