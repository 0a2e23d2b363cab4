use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::TryOnError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("bearer token not recognised")]
    InvalidToken,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthError> for TryOnError {
    fn from(err: AuthError) -> Self {
        TryOnError::unauthorized(err.to_string())
    }
}

/// Resolves a caller's bearer token to an identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token table, typically loaded from `auth.tokens` in the config.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    tokens: HashMap<String, String>,
}

impl StaticTokenProvider {
    pub fn new<I, T, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (T, S)>,
        T: Into<String>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(token, identity)| (token.into(), identity.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        match self.tokens.get(token) {
            Some(identity) if !identity.trim().is_empty() => Ok(Identity {
                id: identity.trim().to_string(),
            }),
            _ => Err(AuthError::InvalidToken),
        }
    }
}
