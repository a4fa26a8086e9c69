//! Decision counters per key id, bucketed by wall-clock minute.
//!
//! Only the most recent `retention_minutes` buckets are kept for each key.
//! Keys whose buckets have all aged out are dropped by [`Metrics::prune`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

/// Bucket label for requests whose token never parsed or verified.
pub const UNKNOWN_KEY: &str = "<invalid>";

pub const DEFAULT_RETENTION_MINUTES: u64 = 60;

/// Outcome label to count.
pub type Counts = HashMap<&'static str, u64>;

/// Minute buckets for one key, oldest first.
#[derive(Default)]
struct History {
    minutes: VecDeque<(u64, Counts)>,
}

impl History {
    fn bump(&mut self, minute: u64, outcome: &'static str) {
        // Usually the current minute, so `at` is the back or one past it.
        let at = self.minutes.partition_point(|(m, _)| *m < minute);
        if self.minutes.get(at).is_none_or(|(m, _)| *m != minute) {
            self.minutes.insert(at, (minute, Counts::new()));
        }
        if let Some((_, counts)) = self.minutes.get_mut(at) {
            *counts.entry(outcome).or_insert(0) += 1;
        }
    }

    fn drop_before(&mut self, oldest: u64) {
        while self.minutes.front().is_some_and(|(m, _)| *m < oldest) {
            self.minutes.pop_front();
        }
    }

    fn newest(&self) -> Option<u64> {
        self.minutes.back().map(|(m, _)| *m)
    }

    fn totals(&self) -> Counts {
        let mut totals = Counts::new();
        for (_, counts) in &self.minutes {
            for (outcome, count) in counts {
                *totals.entry(*outcome).or_insert(0) += *count;
            }
        }
        totals
    }
}

pub struct Metrics {
    retention_minutes: u64,
    keys: Mutex<HashMap<String, History>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION_MINUTES)
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `minutes` buckets per key (at least one).
    pub fn with_retention(minutes: u64) -> Self {
        Self {
            retention_minutes: minutes.max(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, History>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn oldest_kept(&self, newest: u64) -> u64 {
        newest.saturating_sub(self.retention_minutes - 1)
    }

    pub fn record(&self, key_id: &str, outcome: &'static str) {
        self.record_at(key_id, outcome, SystemTime::now());
    }

    /// Count `outcome` for `key_id` in the minute containing `at`.
    pub fn record_at(&self, key_id: &str, outcome: &'static str, at: SystemTime) {
        let minute = minute_of(at);
        let mut keys = self.keys();
        let history = keys.entry(key_id.to_string()).or_default();
        if history.newest().is_some_and(|newest| minute < self.oldest_kept(newest)) {
            return;
        }
        history.bump(minute, outcome);
        if let Some(newest) = history.newest() {
            history.drop_before(self.oldest_kept(newest));
        }
    }

    /// Retained buckets for `key_id` by minute since the epoch.
    pub fn snapshot(&self, key_id: &str) -> BTreeMap<u64, Counts> {
        self.keys()
            .get(key_id)
            .map(|h| h.minutes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Counts per outcome for `key_id` across the retained minutes.
    pub fn totals(&self, key_id: &str) -> Counts {
        self.keys()
            .get(key_id)
            .map(History::totals)
            .unwrap_or_default()
    }

    /// Totals for every key with retained buckets.
    pub fn summary(&self) -> BTreeMap<String, Counts> {
        self.keys()
            .iter()
            .map(|(key_id, history)| (key_id.clone(), history.totals()))
            .filter(|(_, totals)| !totals.is_empty())
            .collect()
    }

    pub fn prune(&self) -> usize {
        self.prune_at(SystemTime::now())
    }

    /// Drop buckets that fell out of the retention window as of `now`, then
    /// keys left with none. Returns how many keys were dropped.
    pub fn prune_at(&self, now: SystemTime) -> usize {
        let oldest = self.oldest_kept(minute_of(now));
        let mut keys = self.keys();
        let before = keys.len();
        keys.retain(|_, history| {
            history.drop_before(oldest);
            !history.minutes.is_empty()
        });
        before - keys.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys().len()
    }
}

fn minute_of(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        / 60
}
