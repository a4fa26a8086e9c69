//! API key management against the secret store: create, list and revoke.
//!
//! A revoked key keeps working on running gateways until its cached secret
//! expires (`api_key_cache_ttl_seconds`).

use std::sync::Arc;

use api_key::{ApiKeyConfig, ApiKeyError, GeneratedKey, is_valid_key_id, secret_name};
use thiserror::Error;

use crate::store::{SecretAdmin, StoreError};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error(transparent)]
    ApiKey(#[from] ApiKeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no key {0:?} under this prefix")]
    UnknownKey(String),
}

pub struct KeyManager {
    config: ApiKeyConfig,
    admin: Arc<dyn SecretAdmin>,
}

impl KeyManager {
    pub fn new(config: ApiKeyConfig, admin: Arc<dyn SecretAdmin>) -> Self {
        Self { config, admin }
    }

    /// Build a key without storing it. `supplied` is an existing token or
    /// secret to register instead of a random one.
    pub fn mint(
        config: &ApiKeyConfig,
        key_id: Option<&str>,
        supplied: Option<&str>,
    ) -> Result<GeneratedKey, KeyError> {
        config.validate()?;
        let key = match (key_id, supplied) {
            (key_id, Some(supplied)) => api_key::import_key(config, key_id, supplied)?,
            (Some(key_id), None) => api_key::generate_for(config, key_id)?,
            (None, None) => api_key::generate(config),
        };
        Ok(key)
    }

    /// Mint a key and write its secret to the store.
    pub async fn create(
        &self,
        key_id: Option<&str>,
        supplied: Option<&str>,
    ) -> Result<GeneratedKey, KeyError> {
        let key = Self::mint(&self.config, key_id, supplied)?;
        self.admin.set(&key.secret_name, &key.secret).await?;
        log::info!("stored secret {} for key {}", key.secret_name, key.key_id);
        Ok(key)
    }

    /// Sorted ids of the keys stored under this prefix.
    pub async fn list(&self) -> Result<Vec<String>, KeyError> {
        let name_prefix = secret_name(&self.config.prefix, "");
        let mut key_ids: Vec<String> = self
            .admin
            .list_names()
            .await?
            .into_iter()
            .filter_map(|name| name.strip_prefix(&name_prefix).map(str::to_string))
            .filter(|key_id| is_valid_key_id(key_id))
            .collect();
        key_ids.sort();
        Ok(key_ids)
    }

    /// Delete the secrets of `key_ids`. All ids are checked before anything is
    /// deleted. Returns the revoked ids, sorted.
    pub async fn revoke(&self, key_ids: &[String]) -> Result<Vec<String>, KeyError> {
        let mut revoked = Vec::with_capacity(key_ids.len());
        for key_id in key_ids {
            let key_id = key_id.trim();
            if !is_valid_key_id(key_id) {
                return Err(ApiKeyError::InvalidKeyId.into());
            }
            revoked.push(key_id.to_string());
        }
        revoked.sort();
        revoked.dedup();

        for key_id in &revoked {
            let name = secret_name(&self.config.prefix, key_id);
            match self.admin.delete(&name).await {
                Ok(()) => log::info!("deleted secret {name}"),
                Err(StoreError::NotFound) => return Err(KeyError::UnknownKey(key_id.clone())),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(revoked)
    }
}
