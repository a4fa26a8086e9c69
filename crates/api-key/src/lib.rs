//! API key parsing, comparison and minting.
//!
//! This crate provides functionality for:
//! - Parsing tokens to extract their components
//! - Deriving the secret store name that holds a key's secret
//! - Comparing secrets in constant time
//! - Minting new keys from the OS random number generator
//!
//! # Token Format
//!
//! Tokens follow the format: `{prefix}_{key_id}_{secret}`
//!
//! Example: `azjina_abc123_s3cr3t`
//!
//! The prefix matches `[A-Za-z0-9-]{3,32}`, the key id `[A-Za-z0-9-]{6,64}`,
//! and the secret is everything after the second underscore.
//!
//! # Example
//!
//! ```rust
//! use api_key::{ApiKeyConfig, generate, parse, secrets_match};
//!
//! let config = ApiKeyConfig::new("azjina");
//! let key = generate(&config);
//!
//! // Store key.secret under key.secret_name, hand key.token to the user.
//!
//! let token = parse(&key.token, &config.prefix).unwrap();
//! assert_eq!(token.secret_name(), key.secret_name);
//! assert!(secrets_match(&key.secret, token.secret()));
//! ```

mod config;
mod error;
mod parse;
mod token;
mod verify;

// Public re-exports
pub use config::{ApiKeyConfig, DEFAULT_PREFIX};
pub use error::{ApiKeyError, Result};
pub use parse::{Token, is_valid_key_id, is_valid_prefix, parse, secret_name};
pub use token::{GeneratedKey, generate, generate_for, import_key};
pub use verify::secrets_match;
