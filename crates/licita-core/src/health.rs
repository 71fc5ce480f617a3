//! Process-wide, cross-request health state per source.
//!
//! Unlike [`CircuitBreaker`](crate::CircuitBreaker), which guards one
//! source's sub-requests inside a single fetch, the registry accumulates
//! failures across `fetch_all` calls and drives escalation decisions: skipping
//! a source that is down and widening timeouts when the primary is unhealthy.
//!
//! Entries expire lazily: a read that finds an entry older than the TTL resets
//! it to healthy. There is no background sweeper.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::SourceCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    pub const fn is_unhealthy(self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub degraded_threshold: u32,
    pub down_threshold: u32,
    pub ttl: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: 3,
            down_threshold: 5,
            ttl: Duration::from_secs(300),
        }
    }
}

impl HealthConfig {
    fn status_for(&self, consecutive_failures: u32) -> HealthStatus {
        if consecutive_failures >= self.down_threshold {
            HealthStatus::Down
        } else if consecutive_failures >= self.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthEntry {
    pub consecutive_failures: u32,
    pub status: HealthStatus,
    pub updated_at: Instant,
}

impl HealthEntry {
    fn healthy(now: Instant) -> Self {
        Self {
            consecutive_failures: 0,
            status: HealthStatus::Healthy,
            updated_at: now,
        }
    }
}

/// Serializable view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub age_ms: u64,
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    config: HealthConfig,
    entries: Mutex<HashMap<SourceCode, HealthEntry>>,
}

impl HealthRegistry {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> HealthConfig {
        self.config
    }

    pub fn record_success(&self, code: &SourceCode) {
        let now = Instant::now();
        let previous = self
            .lock()
            .insert(code.clone(), HealthEntry::healthy(now))
            .map(|entry| entry.status);

        if previous.is_some_and(HealthStatus::is_unhealthy) {
            tracing::info!(source = %code, "source recovered");
        }
    }

    pub fn record_failure(&self, code: &SourceCode) {
        let now = Instant::now();
        let (before, after, failures) = {
            let mut entries = self.lock();
            let entry = entries
                .entry(code.clone())
                .or_insert_with(|| HealthEntry::healthy(now));
            let before = entry.status;
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.status = self.config.status_for(entry.consecutive_failures);
            entry.updated_at = now;
            (before, entry.status, entry.consecutive_failures)
        };

        if before != after {
            tracing::warn!(
                source = %code,
                from = %before,
                to = %after,
                failures,
                "source health changed"
            );
        }
    }

    /// Current status; an entry older than the TTL is reset to healthy first.
    pub fn get_status(&self, code: &SourceCode) -> HealthStatus {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get_mut(code) {
            Some(entry) => {
                if now.saturating_duration_since(entry.updated_at) > self.config.ttl {
                    *entry = HealthEntry::healthy(now);
                }
                entry.status
            }
            None => HealthStatus::Healthy,
        }
    }

    /// Healthy and degraded sources are available; down sources are not.
    pub fn is_available(&self, code: &SourceCode) -> bool {
        self.get_status(code) != HealthStatus::Down
    }

    pub fn consecutive_failures(&self, code: &SourceCode) -> u32 {
        let _ = self.get_status(code);
        self.lock()
            .get(code)
            .map_or(0, |entry| entry.consecutive_failures)
    }

    /// Every known entry after TTL re-evaluation, keyed by source code.
    pub fn snapshot(&self) -> BTreeMap<String, HealthSnapshot> {
        let now = Instant::now();
        let mut entries = self.lock();
        entries
            .iter_mut()
            .map(|(code, entry)| {
                if now.saturating_duration_since(entry.updated_at) > self.config.ttl {
                    *entry = HealthEntry::healthy(now);
                }
                let age = now.saturating_duration_since(entry.updated_at);
                (
                    code.to_string(),
                    HealthSnapshot {
                        status: entry.status,
                        consecutive_failures: entry.consecutive_failures,
                        age_ms: age.as_millis().min(u128::from(u64::MAX)) as u64,
                    },
                )
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SourceCode, HealthEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
