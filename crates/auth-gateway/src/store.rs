//! Secret store backends.
//!
//! The store is the system of record for key secrets. The gateway only needs a
//! single lookup by name ([`SecretStore`]); the `keys` command line tool writes,
//! lists and deletes through [`SecretAdmin`].

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

/// API version sent to Key-Vault-style stores.
pub const VAULT_API_VERSION: &str = "7.4";

/// Errors returned by a secret store lookup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store answered and has no secret under that name.
    #[error("secret not found")]
    NotFound,

    /// The store could not answer (network, auth, server error).
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

/// Remote lookup of a secret by name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<String, StoreError>;
}

/// Write side of a secret store, used for key management.
#[async_trait]
pub trait SecretAdmin: Send + Sync {
    /// Create or overwrite the secret under `name`.
    async fn set(&self, name: &str, value: &str) -> Result<(), StoreError>;

    /// `NotFound` if nothing is stored under `name`.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    async fn list_names(&self) -> Result<Vec<String>, StoreError>;
}

/// Source of the bearer credential presented to the store.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, StoreError>;
}

/// Credential fixed at startup.
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn bearer_token(&self) -> Result<String, StoreError> {
        Ok(self.token.clone())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-process store, for local runs and tests.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, String>>,
    lookups: AtomicUsize,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(secrets: HashMap<String, String>) -> Self {
        Self {
            secrets: RwLock::new(secrets),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a secret.
    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        let mut secrets = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        secrets.insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) {
        let mut secrets = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        secrets.remove(name);
    }

    /// Number of `get` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<String, StoreError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        secrets.get(name).cloned().ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl SecretAdmin for MemorySecretStore {
    async fn set(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.insert(name, value);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut secrets = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        secrets.remove(name).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn list_names(&self) -> Result<Vec<String>, StoreError> {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        Ok(secrets.keys().cloned().collect())
    }
}

// ============================================================================
// Vault store
// ============================================================================

#[derive(Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

#[derive(Deserialize)]
struct SecretItem {
    /// `{vault}/secrets/{name}`
    id: String,
}

#[derive(Deserialize)]
struct SecretListPage {
    #[serde(default)]
    value: Vec<SecretItem>,
    #[serde(rename = "nextLink", default)]
    next_link: Option<String>,
}

impl SecretItem {
    fn name(&self) -> Option<&str> {
        self.id
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
    }
}

fn status_error(status: StatusCode) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound,
        status => StoreError::Unavailable(format!("secret store returned {status}")),
    }
}

/// Key-Vault-style REST store: `GET {url}/secrets/{name}?api-version=7.4`.
pub struct VaultSecretStore {
    base_url: String,
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl VaultSecretStore {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            credentials,
        })
    }

    fn secret_url(&self, name: &str) -> String {
        format!(
            "{}/secrets/{}?api-version={}",
            self.base_url, name, VAULT_API_VERSION
        )
    }

    fn list_url(&self) -> String {
        format!("{}/secrets?api-version={}", self.base_url, VAULT_API_VERSION)
    }

    /// Attach the bearer credential and send.
    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let token = self.credentials.bearer_token().await?;
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("request failed: {e}")))
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn get(&self, name: &str) -> Result<String, StoreError> {
        let resp = self.send(self.client.get(self.secret_url(name))).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        let bundle: SecretBundle = resp
            .json()
            .await
            .map_err(|e| StoreError::Unavailable(format!("undecodable secret bundle: {e}")))?;
        Ok(bundle.value.unwrap_or_default())
    }
}

#[async_trait]
impl SecretAdmin for VaultSecretStore {
    async fn set(&self, name: &str, value: &str) -> Result<(), StoreError> {
        let request = self
            .client
            .put(self.secret_url(name))
            .json(&serde_json::json!({ "value": value }));
        let resp = self.send(request).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let resp = self.send(self.client.delete(self.secret_url(name))).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        Ok(())
    }

    async fn list_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut next = Some(self.list_url());
        while let Some(url) = next.take() {
            let resp = self.send(self.client.get(&url)).await?;
            if !resp.status().is_success() {
                return Err(StoreError::Unavailable(format!(
                    "secret listing returned {}",
                    resp.status()
                )));
            }
            let page: SecretListPage = resp
                .json()
                .await
                .map_err(|e| StoreError::Unavailable(format!("undecodable secret list: {e}")))?;
            names.extend(page.value.iter().filter_map(SecretItem::name).map(str::to_string));
            next = page.next_link.filter(|link| !link.is_empty() && *link != url);
        }
        Ok(names)
    }
}
