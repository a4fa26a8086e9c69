//! Token parsing for API keys.

use std::fmt;

use zeroize::Zeroize;

use crate::error::{ApiKeyError, Result};

const PREFIX_LEN: (usize, usize) = (3, 32);
const KEY_ID_LEN: (usize, usize) = (6, 64);

/// Parsed components from a token string.
pub struct Token {
    /// Prefix naming the key family (e.g. "azjina").
    pub prefix: String,
    /// Key identifier, used for quota and rate limit bookkeeping.
    pub key_id: String,
    secret: String,
}

impl Token {
    /// Get a reference to the secret.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Name under which the secret store holds this key's secret.
    pub fn secret_name(&self) -> String {
        secret_name(&self.prefix, &self.key_id)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("prefix", &self.prefix)
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        // Clear secret from memory when dropped
        self.secret.zeroize();
    }
}

/// Derive the secret store name for a key: `{prefix}-api-key-{key_id}`.
pub fn secret_name(prefix: &str, key_id: &str) -> String {
    format!("{prefix}-api-key-{key_id}")
}

fn charset_ok(value: &str, (min, max): (usize, usize)) -> bool {
    (min..=max).contains(&value.len())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Whether `value` is a well-formed prefix: `[A-Za-z0-9-]{3,32}`.
pub fn is_valid_prefix(value: &str) -> bool {
    charset_ok(value, PREFIX_LEN)
}

/// Whether `value` is a well-formed key id: `[A-Za-z0-9-]{6,64}`.
pub fn is_valid_key_id(value: &str) -> bool {
    charset_ok(value, KEY_ID_LEN)
}

/// Parse a token string into its components.
///
/// # Arguments
/// * `token` - The full token string (e.g., "azjina_abc123_s3cr3t")
/// * `expected_prefix` - The expected prefix (e.g., "azjina")
///
/// # Returns
/// * `Token` containing prefix, key id and secret
/// * Error if token format is invalid
///
/// Everything after the second underscore belongs to the secret, so secrets
/// may themselves contain underscores.
pub fn parse(token: &str, expected_prefix: &str) -> Result<Token> {
    let raw = token.trim();
    if raw.is_empty() {
        return Err(ApiKeyError::Empty);
    }

    // Split by underscore: prefix_keyid_secret...
    let mut parts = raw.splitn(3, '_');
    let (Some(prefix), Some(key_id), Some(secret)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ApiKeyError::InvalidFormat);
    };

    let (prefix, key_id, secret) = (prefix.trim(), key_id.trim(), secret.trim());
    if prefix.is_empty() || key_id.is_empty() {
        return Err(ApiKeyError::InvalidFormat);
    }
    if secret.is_empty() {
        return Err(ApiKeyError::InvalidSecret);
    }

    if prefix != expected_prefix || !is_valid_prefix(prefix) {
        return Err(ApiKeyError::InvalidPrefix {
            expected: expected_prefix.to_string(),
            got: prefix.to_string(),
        });
    }

    if !is_valid_key_id(key_id) {
        return Err(ApiKeyError::InvalidKeyId);
    }

    Ok(Token {
        prefix: prefix.to_string(),
        key_id: key_id.to_string(),
        secret: secret.to_string(),
    })
}
