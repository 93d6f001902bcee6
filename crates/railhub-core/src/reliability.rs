//! Per-hub and per-switch command reliability counters.
//!
//! Only the command engine records into a [`ReliabilityBook`]; everyone
//! else reads snapshots. Counters only grow until an explicit operator
//! reset clears them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use railhub_types::MotorPort;

/// What the counters are kept for: a whole hub, or one switch port on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatsKey {
    pub hub_id: String,
    pub port: Option<MotorPort>,
}

impl StatsKey {
    pub fn hub(hub_id: impl Into<String>) -> Self {
        Self {
            hub_id: hub_id.into(),
            port: None,
        }
    }

    pub fn port(hub_id: impl Into<String>, port: MotorPort) -> Self {
        Self {
            hub_id: hub_id.into(),
            port: Some(port),
        }
    }
}

/// Snapshot of delivery counters. `attempts == successes + failures`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    total_latency_ms: u64,
}

impl ReliabilityStats {
    /// Percentage of attempts that were confirmed, `None` before any attempt.
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        (self.attempts > 0).then(|| self.successes as f64 / self.attempts as f64 * 100.0)
    }

    #[must_use]
    pub fn avg_latency_ms(&self) -> Option<f64> {
        (self.attempts > 0).then(|| self.total_latency_ms as f64 / self.attempts as f64)
    }

    fn record(&mut self, success: bool, latency: Duration, at: OffsetDateTime) {
        let ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
        self.attempts += 1;
        self.total_latency_ms = self.total_latency_ms.saturating_add(ms);
        self.min_latency_ms = Some(self.min_latency_ms.map_or(ms, |m| m.min(ms)));
        self.max_latency_ms = Some(self.max_latency_ms.map_or(ms, |m| m.max(ms)));
        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
            self.last_success = Some(at);
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_failure = Some(at);
        }
    }
}

/// Counters for every key the engine has delivered to.
#[derive(Debug, Default)]
pub struct ReliabilityBook {
    entries: Mutex<HashMap<StatsKey, ReliabilityStats>>,
}

impl ReliabilityBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_success(&self, key: &StatsKey, latency: Duration) {
        self.record(key, true, latency);
    }

    pub(crate) fn record_failure(&self, key: &StatsKey, latency: Duration) {
        self.record(key, false, latency);
    }

    fn record(&self, key: &StatsKey, success: bool, latency: Duration) {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.lock();
        entries
            .entry(key.clone())
            .or_default()
            .record(success, latency, now);
    }

    /// Current counters for `key`; all zero if nothing was recorded yet.
    pub fn get(&self, key: &StatsKey) -> ReliabilityStats {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    /// Drop every counter belonging to `hub_id`, including its ports.
    pub(crate) fn clear_hub(&self, hub_id: &str) {
        self.lock().retain(|key, _| key.hub_id != hub_id);
    }

    pub(crate) fn clear_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StatsKey, ReliabilityStats>> {
        // counters stay consistent even if a holder panicked mid-update
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_add_up() {
        let book = ReliabilityBook::new();
        let key = StatsKey::port("sw", MotorPort::A);
        book.record_failure(&key, Duration::from_millis(30));
        book.record_failure(&key, Duration::from_millis(10));
        book.record_success(&key, Duration::from_millis(20));

        let stats = book.get(&key);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.attempts, stats.successes + stats.failures);
        assert_eq!(stats.consecutive_failures, 0);
        assert!(stats.last_failure.is_some());
        assert_eq!(stats.min_latency_ms, Some(10));
        assert_eq!(stats.max_latency_ms, Some(30));
        assert_eq!(stats.avg_latency_ms(), Some(20.0));
    }

    #[test]
    fn test_consecutive_failures() {
        let book = ReliabilityBook::new();
        let key = StatsKey::hub("train");
        for _ in 0..4 {
            book.record_failure(&key, Duration::ZERO);
        }
        assert_eq!(book.get(&key).consecutive_failures, 4);
    }

    #[test]
    fn test_success_rate() {
        let mut stats = ReliabilityStats::default();
        assert_eq!(stats.success_rate(), None);
        let now = OffsetDateTime::now_utc();
        stats.record(true, Duration::ZERO, now);
        stats.record(false, Duration::ZERO, now);
        assert_eq!(stats.success_rate(), Some(50.0));
    }

    #[test]
    fn test_clear_hub_keeps_other_hubs() {
        let book = ReliabilityBook::new();
        book.record_success(&StatsKey::hub("a"), Duration::ZERO);
        book.record_success(&StatsKey::port("a", MotorPort::B), Duration::ZERO);
        book.record_success(&StatsKey::hub("b"), Duration::ZERO);

        book.clear_hub("a");
        assert_eq!(book.get(&StatsKey::hub("a")).attempts, 0);
        assert_eq!(book.get(&StatsKey::port("a", MotorPort::B)).attempts, 0);
        assert_eq!(book.get(&StatsKey::hub("b")).attempts, 1);
    }

    #[test]
    fn test_unknown_key_is_zero() {
        let book = ReliabilityBook::new();
        assert_eq!(book.get(&StatsKey::hub("nobody")), ReliabilityStats::default());
    }
}
