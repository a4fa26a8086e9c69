//! Key minting for API keys.

use rand::Rng;
use rand::distributions::Alphanumeric;
use zeroize::Zeroize;

use crate::config::ApiKeyConfig;
use crate::error::{ApiKeyError, Result};
use crate::parse::{is_valid_key_id, parse, secret_name};

const KEY_ID_LENGTH: usize = 12;
const SECRET_LENGTH: usize = 48;

/// A freshly minted API key.
///
/// `token` is handed to the user, `secret` is written to the secret store
/// under `secret_name`.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    /// The full token string (`{prefix}_{key_id}_{secret}`).
    pub token: String,
    /// The key identifier.
    pub key_id: String,
    /// The secret value.
    pub secret: String,
    /// Name of the secret store entry holding `secret`.
    pub secret_name: String,
}

impl Drop for GeneratedKey {
    fn drop(&mut self) {
        self.token.zeroize();
        self.secret.zeroize();
    }
}

fn random_alphanumeric(len: usize) -> String {
    rand::rngs::OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Mint a new API key with a random key id.
pub fn generate(config: &ApiKeyConfig) -> GeneratedKey {
    build(config, random_alphanumeric(KEY_ID_LENGTH))
}

/// Mint a new API key for a caller-chosen key id.
pub fn generate_for(config: &ApiKeyConfig, key_id: &str) -> Result<GeneratedKey> {
    let key_id = key_id.trim();
    if !is_valid_key_id(key_id) {
        return Err(ApiKeyError::InvalidKeyId);
    }
    Ok(build(config, key_id.to_string()))
}

/// Register a caller-supplied token or secret.
///
/// A full `{prefix}_{key_id}_{secret}` token for this prefix is split into its
/// parts, as long as `key_id` is absent or agrees with the token's. Anything
/// else is taken verbatim as the secret for `key_id` (random if absent).
pub fn import_key(config: &ApiKeyConfig, key_id: Option<&str>, supplied: &str) -> Result<GeneratedKey> {
    let supplied = supplied.trim();
    if supplied.is_empty() {
        return Err(ApiKeyError::InvalidSecret);
    }
    let key_id = key_id.map(str::trim);

    if let Ok(token) = parse(supplied, &config.prefix)
        && key_id.is_none_or(|id| id == token.key_id)
    {
        return Ok(assemble(config, token.key_id.clone(), token.secret().to_string()));
    }

    let key_id = match key_id {
        Some(id) if is_valid_key_id(id) => id.to_string(),
        Some(_) => return Err(ApiKeyError::InvalidKeyId),
        None => random_alphanumeric(KEY_ID_LENGTH),
    };
    Ok(assemble(config, key_id, supplied.to_string()))
}

fn build(config: &ApiKeyConfig, key_id: String) -> GeneratedKey {
    assemble(config, key_id, random_alphanumeric(SECRET_LENGTH))
}

fn assemble(config: &ApiKeyConfig, key_id: String, secret: String) -> GeneratedKey {
    let token = format!("{}_{}_{}", config.prefix, key_id, secret);
    let secret_name = secret_name(&config.prefix, &key_id);

    GeneratedKey {
        token,
        key_id,
        secret,
        secret_name,
    }
}
