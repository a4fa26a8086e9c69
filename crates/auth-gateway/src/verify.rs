//! Secret verification: cache first, secret store on miss.

use std::sync::Arc;
use std::time::Duration;

use api_key::{Token, secrets_match};
use thiserror::Error;

use crate::cache::{CacheLookup, SecretCache};
use crate::store::{SecretStore, StoreError};

/// Outcome of comparing a token's secret against the stored one.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretMatch {
    /// Stored value, `None` if the store has no secret for this key.
    pub secret_value: Option<String>,
    pub matched: bool,
}

impl std::fmt::Debug for SecretMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretMatch")
            .field("secret_value", &self.secret_value.as_ref().map(|_| "<redacted>"))
            .field("matched", &self.matched)
            .finish()
    }
}

impl SecretMatch {
    fn compare(stored: Option<String>, provided: &str) -> Self {
        let matched = stored
            .as_deref()
            .is_some_and(|stored| secrets_match(stored, provided));
        Self {
            secret_value: stored,
            matched,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The store failed for a reason other than "not found", or timed out.
    #[error("secret store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Resolves token secrets against the store, through the cache.
pub struct SecretVerifier {
    store: Arc<dyn SecretStore>,
    cache: Arc<SecretCache>,
    timeout: Duration,
}

impl SecretVerifier {
    pub fn new(store: Arc<dyn SecretStore>, cache: Arc<SecretCache>, timeout: Duration) -> Self {
        Self {
            store,
            cache,
            timeout,
        }
    }

    pub fn cache(&self) -> &Arc<SecretCache> {
        &self.cache
    }

    /// Check the token's secret.
    ///
    /// Store errors and timeouts are returned as [`VerifyError::StoreUnavailable`]
    /// and never cached. No lock is held while the store call is in flight.
    pub async fn verify(&self, token: &Token) -> Result<SecretMatch, VerifyError> {
        let name = token.secret_name();

        if let CacheLookup::Hit(cached) = self.cache.get(&name) {
            log::debug!("secret cache hit for {name}");
            return Ok(SecretMatch::compare(cached, token.secret()));
        }

        let looked_up = tokio::time::timeout(self.timeout, self.store.get(&name)).await;
        let stored = match looked_up {
            Err(_) => {
                log::warn!("secret store lookup for {name} timed out after {:?}", self.timeout);
                return Err(VerifyError::StoreUnavailable("timed out".to_string()));
            }
            Ok(Err(StoreError::NotFound)) => {
                log::debug!("secret {name} not found, caching absence");
                self.cache.set(&name, None);
                return Ok(SecretMatch::compare(None, token.secret()));
            }
            Ok(Err(StoreError::Unavailable(reason))) => {
                log::error!("secret store lookup for {name} failed: {reason}");
                return Err(VerifyError::StoreUnavailable(reason));
            }
            Ok(Ok(value)) => value,
        };

        // An empty secret can never match; treat it like an absent one.
        let stored = Some(stored).filter(|v| !v.is_empty());
        self.cache.set(&name, stored.clone());
        Ok(SecretMatch::compare(stored, token.secret()))
    }
}
