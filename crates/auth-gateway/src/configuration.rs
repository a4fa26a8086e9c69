//! Gateway configuration: YAML file plus environment overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use api_key::{ApiKeyConfig, is_valid_key_id};
use serde::Deserialize;
use thiserror::Error;

use crate::store::{MemorySecretStore, SecretStore, StaticCredential, VaultSecretStore};

const DEFAULT_TOKEN_ENV: &str = "KEY_VAULT_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Bearer key callers (gateway, dashboard) must present on every decision request.
    pub dashboard_api_key: String,
    pub api_key_prefix: String,
    /// Zero disables the secret cache.
    pub api_key_cache_ttl_seconds: u64,
    pub default_wallet_balance: u64,
    /// Zero disables rate limiting.
    pub rate_limit_per_minute: u32,
    pub rate_limit_overrides: HashMap<String, u32>,
    pub store_timeout_ms: u64,
    pub cache_sweep_interval_secs: u64,
    pub secret_store: Option<SecretStoreConfig>,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SecretStoreConfig {
    Memory {
        #[serde(default)]
        secrets: HashMap<String, String>,
    },
    Vault {
        url: String,
        /// Bearer credential; when absent it is read from `token_env`.
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_token_env")]
        token_env: String,
    },
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            dashboard_api_key: String::new(),
            api_key_prefix: api_key::DEFAULT_PREFIX.to_string(),
            api_key_cache_ttl_seconds: 300,
            default_wallet_balance: 1_000_000,
            rate_limit_per_minute: 0,
            rate_limit_overrides: HashMap::new(),
            store_timeout_ms: 2_000,
            cache_sweep_interval_secs: 60,
            secret_store: None,
            log_level: "info".to_string(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}

impl GatewayConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// File (if any), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. `lookup` returns the value of a variable.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let first = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| lookup(name).map(|value| (name.to_string(), value)))
        };

        if let Some((_, value)) = first(&["AUTH_DASHBOARD_API_KEY", "DASHBOARD_API_KEY"]) {
            self.dashboard_api_key = value;
        }
        if let Some((_, value)) = first(&["KEY_VAULT_URI", "SELF_HOST_TOKENS_VAULT_URL"]) {
            match &mut self.secret_store {
                Some(SecretStoreConfig::Vault { url, .. }) => *url = value,
                _ => {
                    self.secret_store = Some(SecretStoreConfig::Vault {
                        url: value,
                        token: None,
                        token_env: default_token_env(),
                    })
                }
            }
        }
        if let Some((_, value)) = first(&["API_KEY_PREFIX"]) {
            self.api_key_prefix = value;
        }
        if let Some((name, value)) = first(&["API_KEY_CACHE_TTL_SECONDS"]) {
            self.api_key_cache_ttl_seconds = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = first(&["DEFAULT_WALLET_BALANCE"]) {
            self.default_wallet_balance = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = first(&["RATE_LIMIT_PER_MINUTE"]) {
            self.rate_limit_per_minute = parse_env(&name, &value)?;
        }
        if let Some((_, value)) = first(&["HOST"]) {
            self.host = value;
        }
        if let Some((name, value)) = first(&["PORT"]) {
            self.port = parse_env(&name, &value)?;
        }
        if let Some((_, value)) = first(&["LOG_LEVEL"]) {
            self.log_level = value.to_lowercase();
        }
        Ok(())
    }

    /// Trim string settings and check every field.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.dashboard_api_key = self.dashboard_api_key.trim().to_string();
        self.api_key_prefix = self.api_key_prefix.trim().to_string();

        if self.dashboard_api_key.is_empty() {
            return Err(ConfigError::Invalid(
                "AUTH_DASHBOARD_API_KEY is required".to_string(),
            ));
        }
        self.api_key_config().validate().map_err(|_| {
            ConfigError::Invalid(
                "API_KEY_PREFIX must be 3-32 chars (letters, digits, hyphen)".to_string(),
            )
        })?;
        if let Some(bad) = self
            .rate_limit_overrides
            .keys()
            .find(|key_id| !is_valid_key_id(key_id))
        {
            return Err(ConfigError::Invalid(format!(
                "rate limit override for invalid key id {bad:?}"
            )));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid("store_timeout_ms must be > 0".to_string()));
        }
        if self.cache_sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache_sweep_interval_secs must be > 0".to_string(),
            ));
        }
        match &mut self.secret_store {
            None => Err(ConfigError::Invalid(
                "a secret store is required (set KEY_VAULT_URI)".to_string(),
            )),
            Some(SecretStoreConfig::Vault { url, .. }) => {
                *url = url.trim().to_string();
                if url.is_empty() {
                    return Err(ConfigError::Invalid("KEY_VAULT_URI is required".to_string()));
                }
                Ok(())
            }
            Some(SecretStoreConfig::Memory { .. }) => Ok(()),
        }
    }

    pub fn api_key_config(&self) -> ApiKeyConfig {
        ApiKeyConfig::new(&self.api_key_prefix)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }
}

impl SecretStoreConfig {
    /// Construct the configured store.
    pub fn build(&self, timeout: Duration) -> Result<Arc<dyn SecretStore>, ConfigError> {
        match self {
            SecretStoreConfig::Memory { secrets } => {
                Ok(Arc::new(MemorySecretStore::from_map(secrets.clone())))
            }
            SecretStoreConfig::Vault {
                url,
                token,
                token_env,
            } => {
                let token = token
                    .clone()
                    .or_else(|| std::env::var(token_env).ok())
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "vault credential missing: set secret_store.token or {token_env}"
                        ))
                    })?;
                let store =
                    VaultSecretStore::new(url.clone(), Arc::new(StaticCredential::new(token)), timeout)
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
host: 127.0.0.1
port: 9090
dashboard_api_key: dash-key
api_key_prefix: azjina
api_key_cache_ttl_seconds: 30
default_wallet_balance: 100
rate_limit_per_minute: 5
rate_limit_overrides:
  vip-key-1: 500
secret_store:
  type: memory
  secrets:
    azjina-api-key-abc123: s3cr3t
"#;
        let mut config = GatewayConfig::from_yaml(yaml).expect("Failed to deserialize config");
        config.validate().unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:9090");
        assert_eq!(config.api_key_cache_ttl_seconds, 30);
        assert_eq!(config.default_wallet_balance, 100);
        assert_eq!(config.rate_limit_overrides.get("vip-key-1"), Some(&500));
        // unspecified fields keep defaults
        assert_eq!(config.store_timeout_ms, 2_000);
        if let Some(SecretStoreConfig::Memory { secrets }) = &config.secret_store {
            assert_eq!(
                secrets.get("azjina-api-key-abc123").map(|s| s.as_str()),
                Some("s3cr3t")
            );
        } else {
            panic!("Expected memory secret store");
        }
    }

    #[test]
    fn test_deserialize_vault_store() {
        let yaml = r#"
dashboard_api_key: dash-key
secret_store:
  type: vault
  url: https://kv.example.net
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.secret_store,
            Some(SecretStoreConfig::Vault {
                url: "https://kv.example.net".to_string(),
                token: None,
                token_env: "KEY_VAULT_TOKEN".to_string(),
            })
        );
    }

    #[test]
    fn test_negative_values_rejected_by_parser() {
        assert!(GatewayConfig::from_yaml("default_wallet_balance: -1").is_err());
        assert!(GatewayConfig::from_yaml("api_key_cache_ttl_seconds: -5").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        config
            .apply_env(env(&[
                ("DASHBOARD_API_KEY", " dash "),
                ("KEY_VAULT_URI", "https://kv.example.net"),
                ("API_KEY_PREFIX", "acme"),
                ("API_KEY_CACHE_TTL_SECONDS", "0"),
                ("DEFAULT_WALLET_BALANCE", "42"),
                ("RATE_LIMIT_PER_MINUTE", "7"),
                ("PORT", "9000"),
                ("LOG_LEVEL", "DEBUG"),
            ]))
            .unwrap();
        config.validate().unwrap();

        assert_eq!(config.dashboard_api_key, "dash");
        assert_eq!(config.api_key_prefix, "acme");
        assert_eq!(config.api_key_cache_ttl_seconds, 0);
        assert_eq!(config.default_wallet_balance, 42);
        assert_eq!(config.rate_limit_per_minute, 7);
        assert_eq!(config.port, 9000);
        assert_eq!(config.log_level, "debug");
        assert!(matches!(
            config.secret_store,
            Some(SecretStoreConfig::Vault { ref url, .. }) if url == "https://kv.example.net"
        ));
    }

    #[test]
    fn test_primary_env_name_wins() {
        let mut config = GatewayConfig::default();
        config
            .apply_env(env(&[
                ("AUTH_DASHBOARD_API_KEY", "primary"),
                ("DASHBOARD_API_KEY", "fallback"),
            ]))
            .unwrap();
        assert_eq!(config.dashboard_api_key, "primary");
    }

    #[test]
    fn test_env_rejects_negative_numbers() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_env(env(&[("RATE_LIMIT_PER_MINUTE", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_validate_requires_dashboard_key_and_store() {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_err());

        config.dashboard_api_key = "dash".to_string();
        assert!(config.validate().is_err());

        config.secret_store = Some(SecretStoreConfig::Memory {
            secrets: HashMap::new(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let mut config = GatewayConfig {
            dashboard_api_key: "dash".to_string(),
            api_key_prefix: "no_underscores".to_string(),
            secret_store: Some(SecretStoreConfig::Memory {
                secrets: HashMap::new(),
            }),
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_blank_vault_url() {
        let mut config = GatewayConfig {
            dashboard_api_key: "dash".to_string(),
            secret_store: Some(SecretStoreConfig::Vault {
                url: "  ".to_string(),
                token: None,
                token_env: default_token_env(),
            }),
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_vault_requires_credential() {
        let store = SecretStoreConfig::Vault {
            url: "https://kv.example.net".to_string(),
            token: None,
            token_env: "AUTH_GATEWAY_TEST_UNSET_TOKEN_VAR".to_string(),
        };
        assert!(store.build(Duration::from_secs(1)).is_err());

        let store = SecretStoreConfig::Vault {
            url: "https://kv.example.net".to_string(),
            token: Some("t0k3n".to_string()),
            token_env: default_token_env(),
        };
        assert!(store.build(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"dashboard_api_key: dash\nsecret_store:\n  type: memory\n",
        )
        .unwrap();
        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dashboard_api_key, "dash");

        let missing = GatewayConfig::from_file(Path::new("/nonexistent/gateway.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_example_config_is_valid() {
        let mut config =
            GatewayConfig::from_yaml(include_str!("../gateway.example.yaml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.rate_limit_overrides.get("abc123"), Some(&600));
        assert!(matches!(
            config.secret_store,
            Some(SecretStoreConfig::Vault { ref token_env, .. }) if token_env == "KEY_VAULT_TOKEN"
        ));
    }
}
