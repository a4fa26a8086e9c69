//! Authorization decision pipeline.
//!
//! parse -> verify secret -> rate limit -> quota. The first failing stage ends
//! the request, so a rejected request never spends rate limit budget or quota.

use std::sync::Arc;

use api_key::ApiKeyConfig;
use serde::Serialize;
use thiserror::Error;

use crate::cache::SecretCache;
use crate::clock::Clock;
use crate::configuration::GatewayConfig;
use crate::limiter::SlidingWindowLimiter;
use crate::metric::{Metrics, UNKNOWN_KEY};
use crate::store::SecretStore;
use crate::throttle::StaticRatelimit;
use crate::usage::{UsageState, UsageTracker};
use crate::verify::SecretVerifier;

/// Data returned for an authorized key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub key_id: String,
    pub balance: u64,
    pub used: u64,
}

impl Grant {
    fn new(key_id: &str, state: UsageState) -> Self {
        Self {
            key_id: key_id.to_string(),
            balance: state.balance,
            used: state.used,
        }
    }
}

/// Why a request was refused.
///
/// `InvalidToken` covers malformed tokens, unknown keys and wrong secrets alike.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Denial {
    #[error("invalid API key")]
    InvalidToken,
    #[error("auth backend unavailable")]
    BackendUnavailable,
    #[error("rate limit exceeded")]
    RateLimited,
    /// Carries the key's state after any consumption this request made.
    #[error("out of quota")]
    QuotaExhausted(Grant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    InvalidToken,
    BackendUnavailable,
    RateLimited,
    QuotaExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidToken => "invalid_token",
            FailureKind::BackendUnavailable => "backend_unavailable",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::QuotaExhausted => "quota_exhausted",
        }
    }
}

impl Denial {
    pub fn kind(&self) -> FailureKind {
        match self {
            Denial::InvalidToken => FailureKind::InvalidToken,
            Denial::BackendUnavailable => FailureKind::BackendUnavailable,
            Denial::RateLimited => FailureKind::RateLimited,
            Denial::QuotaExhausted(_) => FailureKind::QuotaExhausted,
        }
    }
}

pub type Outcome = Result<Grant, Denial>;

/// Metrics label for successful decisions.
pub const GRANTED: &str = "granted";

/// Sizes of the gate's in-memory state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub cached_secrets: usize,
    /// Keys with a usage balance. Never shrinks; the ledger is the quota record.
    pub ledger_keys: usize,
    pub rate_limited_keys: usize,
    pub metric_keys: usize,
}

/// What one [`Gate::housekeep`] pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Housekeeping {
    pub expired_secrets: usize,
    pub idle_windows: usize,
    pub idle_metric_keys: usize,
}

#[derive(Debug, Clone, Copy)]
enum Charge {
    ReadOnly,
    Consume(u64),
}

pub struct Gate {
    api_key: ApiKeyConfig,
    verifier: SecretVerifier,
    limiter: SlidingWindowLimiter,
    usage: UsageTracker,
    metrics: Arc<Metrics>,
}

impl Gate {
    pub fn new(
        api_key: ApiKeyConfig,
        verifier: SecretVerifier,
        limiter: SlidingWindowLimiter,
        usage: UsageTracker,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            api_key,
            verifier,
            limiter,
            usage,
            metrics,
        }
    }

    /// Wire up all components from a validated config.
    pub fn from_config(
        config: &GatewayConfig,
        store: Arc<dyn SecretStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cache = Arc::new(SecretCache::new(
            config.api_key_cache_ttl_seconds,
            clock.clone(),
        ));
        let verifier = SecretVerifier::new(store, cache, config.store_timeout());
        let policy = StaticRatelimit::new(config.rate_limit_per_minute)
            .with_overrides(config.rate_limit_overrides.clone());
        let limiter = SlidingWindowLimiter::new(Arc::new(policy), clock);
        let usage = UsageTracker::new(config.default_wallet_balance);

        Self::new(config.api_key_config(), verifier, limiter, usage, metrics)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            cached_secrets: self.verifier.cache().len(),
            ledger_keys: self.usage.tracked_keys(),
            rate_limited_keys: self.limiter.tracked_keys(),
            metric_keys: self.metrics.tracked_keys(),
        }
    }

    /// Drop state that no longer affects any decision: expired cache entries,
    /// idle rate windows and metric buckets past retention.
    pub fn housekeep(&self) -> Housekeeping {
        Housekeeping {
            expired_secrets: self.verifier.cache().evict_expired(),
            idle_windows: self.limiter.evict_idle(),
            idle_metric_keys: self.metrics.prune(),
        }
    }

    #[cfg(test)]
    fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Eligibility check. Reads the balance without consuming any.
    pub async fn authorize(&self, raw_token: &str) -> Outcome {
        self.decide(raw_token, Charge::ReadOnly).await
    }

    /// Charge `tokens` units to the key and return the post-consumption balance.
    pub async fn report_usage(&self, raw_token: &str, tokens: u64) -> Outcome {
        self.decide(raw_token, Charge::Consume(tokens)).await
    }

    async fn decide(&self, raw_token: &str, charge: Charge) -> Outcome {
        let token = match api_key::parse(raw_token, &self.api_key.prefix) {
            Ok(token) => token,
            Err(e) => {
                log::debug!("rejecting malformed token: {e}");
                self.metrics
                    .record(UNKNOWN_KEY, FailureKind::InvalidToken.as_str());
                return Err(Denial::InvalidToken);
            }
        };
        let key_id = token.key_id.as_str();

        let outcome = match self.verifier.verify(&token).await {
            Err(e) => {
                log::warn!("cannot verify key {key_id}: {e}");
                Err(Denial::BackendUnavailable)
            }
            Ok(found) if !found.matched => {
                log::info!("rejecting key {key_id}: secret mismatch or unknown key");
                Err(Denial::InvalidToken)
            }
            Ok(_) => self.admit(key_id, charge),
        };

        match &outcome {
            Ok(grant) => {
                log::debug!(
                    "granted key {key_id} (balance={}, used={})",
                    grant.balance,
                    grant.used
                );
                self.metrics.record(key_id, GRANTED);
            }
            // Unauthenticated callers must not mint new metric keys.
            Err(denial @ (Denial::InvalidToken | Denial::BackendUnavailable)) => {
                self.metrics.record(UNKNOWN_KEY, denial.kind().as_str());
            }
            Err(denial) => {
                log::info!("denied key {key_id}: {denial}");
                self.metrics.record(key_id, denial.kind().as_str());
            }
        }
        outcome
    }

    /// Rate limit then quota, for a key whose secret already checked out.
    fn admit(&self, key_id: &str, charge: Charge) -> Outcome {
        if !self.limiter.allow(key_id) {
            return Err(Denial::RateLimited);
        }

        match charge {
            Charge::ReadOnly => {
                let grant = Grant::new(key_id, self.usage.get_state(key_id));
                if grant.balance == 0 {
                    return Err(Denial::QuotaExhausted(grant));
                }
                Ok(grant)
            }
            Charge::Consume(tokens) => {
                let (state, out_of_quota) = self.usage.consume(key_id, tokens);
                let grant = Grant::new(key_id, state);
                if out_of_quota {
                    return Err(Denial::QuotaExhausted(grant));
                }
                Ok(grant)
            }
        }
    }
}
