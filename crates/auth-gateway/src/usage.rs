//! Per-key quota ledger.
//!
//! Each key id owns a wallet balance that starts at the configured default and
//! only goes down, plus a running total of consumed units. State lives in
//! memory for the lifetime of the process.

use dashmap::DashMap;

/// Balance and cumulative consumption for a single key id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageState {
    pub balance: u64,
    pub used: u64,
}

/// Thread-safe quota tracker, one map entry per key id.
#[derive(Debug)]
pub struct UsageTracker {
    default_balance: u64,
    state: DashMap<String, UsageState>,
}

impl UsageTracker {
    pub fn new(default_balance: u64) -> Self {
        Self {
            default_balance,
            state: DashMap::new(),
        }
    }

    fn fresh(&self) -> UsageState {
        UsageState {
            balance: self.default_balance,
            used: 0,
        }
    }

    /// Current state of a key, created with the default balance on first use.
    pub fn get_state(&self, key_id: &str) -> UsageState {
        *self
            .state
            .entry(key_id.to_string())
            .or_insert_with(|| self.fresh())
    }

    /// Deduct `tokens` from a key's balance.
    ///
    /// Returns the post-consumption state and whether the key was out of quota,
    /// judged against the balance *before* this call. A charge larger than the
    /// remaining balance is still applied: the balance floors at zero and `used`
    /// grows by the full amount.
    pub fn consume(&self, key_id: &str, tokens: u64) -> (UsageState, bool) {
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut entry = self
            .state
            .entry(key_id.to_string())
            .or_insert_with(|| self.fresh());

        let out_of_quota = entry.balance == 0 || tokens > entry.balance;
        if tokens > 0 {
            entry.balance = entry.balance.saturating_sub(tokens);
            entry.used = entry.used.saturating_add(tokens);
        }
        (*entry, out_of_quota)
    }

    /// Number of key ids seen so far.
    pub fn tracked_keys(&self) -> usize {
        self.state.len()
    }
}
