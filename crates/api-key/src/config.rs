//! Configuration for API key parsing and minting.

use crate::error::{ApiKeyError, Result};
use crate::parse::is_valid_prefix;

/// Default prefix used by deployed tokens.
pub const DEFAULT_PREFIX: &str = "azjina";

/// Configuration for API key parsing and minting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyConfig {
    /// Prefix for token strings (e.g., "azjina" produces "azjina_<key id>_<secret>").
    pub prefix: String,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl ApiKeyConfig {
    /// Create a new config with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim().to_string(),
        }
    }

    /// Check the prefix against `[A-Za-z0-9-]{3,32}`.
    pub fn validate(&self) -> Result<()> {
        if is_valid_prefix(&self.prefix) {
            Ok(())
        } else {
            Err(ApiKeyError::InvalidPrefix {
                expected: "3-32 chars (letters, digits, hyphen)".to_string(),
                got: self.prefix.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiKeyConfig::default();
        assert_eq!(config.prefix, "azjina");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_new_trims_prefix() {
        let config = ApiKeyConfig::new("  lb-prod ");
        assert_eq!(config.prefix, "lb-prod");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_prefixes() {
        assert!(ApiKeyConfig::new("ab").validate().is_err());
        assert!(ApiKeyConfig::new("has_underscore").validate().is_err());
        assert!(ApiKeyConfig::new("a".repeat(33)).validate().is_err());
        assert!(ApiKeyConfig::new("").validate().is_err());
    }
}
