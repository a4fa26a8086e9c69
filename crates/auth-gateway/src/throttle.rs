use std::collections::HashMap;

/// Per-minute admission ceiling. Zero disables limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub per_minute: u32,
}

impl Limit {
    pub fn unlimited() -> Self {
        Self { per_minute: 0 }
    }

    pub fn is_unlimited(&self) -> bool {
        self.per_minute == 0
    }
}

impl Default for Limit {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Provide rate limit settings for a given key id.
pub trait Ratelimit: Send + Sync {
    fn limit_for_key(&self, key_id: &str) -> Limit;
}

/// Same allowance for every key, with optional per-key overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticRatelimit {
    default: Limit,
    overrides: HashMap<String, Limit>,
}

impl StaticRatelimit {
    pub fn new(per_minute: u32) -> Self {
        Self {
            default: Limit { per_minute },
            overrides: HashMap::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, u32>) -> Self {
        self.overrides = overrides
            .into_iter()
            .map(|(key_id, per_minute)| (key_id, Limit { per_minute }))
            .collect();
        self
    }
}

impl Ratelimit for StaticRatelimit {
    fn limit_for_key(&self, key_id: &str) -> Limit {
        self.overrides.get(key_id).copied().unwrap_or(self.default)
    }
}
