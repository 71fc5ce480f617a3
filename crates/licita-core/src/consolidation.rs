//! Multi-source consolidation.
//!
//! [`ConsolidationService::fetch_all`] fans a search out to every enabled
//! adapter concurrently, bounds each source by its own timeout and the whole
//! run by a global deadline, salvages whatever a cancelled source already
//! produced, and merges the union through [`deduplicate`](crate::deduplicate).
//!
//! ```text
//!            ┌──────────────┐
//!  query ───▶│ health gate  │── down ──▶ SourceResult(error, skipped)
//!            └──────┬───────┘
//!                   ▼
//!      ┌───────── join_all (global deadline) ─────────┐
//!      │ timeout(source A) │ timeout(source B) │ ...  │
//!      └────────┬──────────────────────────────────────┘
//!               ▼
//!   union empty? ── yes ──▶ fallback adapter ──▶ AllSourcesFailed
//!               │ no
//!               ▼
//!          deduplicate ──▶ ConsolidationResult
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::data_source::{FetchOptions, FetchQuery, SourceAdapter, SourceAvailability, SourceErrorKind};
use crate::health::{HealthRegistry, HealthStatus};
use crate::{deduplicate, ConsolidationError, ProcurementRecord, SourceCode, SourceMetadata, StateCode};

/// Progress hook invoked exactly once per attempted source with
/// `(source_code, record_count, error)`.
pub type SourceCompleteCallback = dyn Fn(&SourceCode, usize, Option<&str>) + Send + Sync;

/// Timeouts and failure policy of a consolidation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationConfig {
    pub source_timeout: Duration,
    /// Used for non-primary sources while the primary is degraded or down.
    pub extended_source_timeout: Duration,
    pub global_timeout: Duration,
    /// Used while the primary is degraded or down.
    pub extended_global_timeout: Duration,
    pub fallback_timeout: Duration,
    /// Try the fallback and raise `AllSourcesFailed` when no source produced data.
    pub fail_on_all_errors: bool,
    /// Source whose health widens everybody else's timeouts.
    pub primary_source: Option<SourceCode>,
    pub source_timeouts: BTreeMap<SourceCode, Duration>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(50),
            extended_source_timeout: Duration::from_secs(90),
            global_timeout: Duration::from_secs(90),
            extended_global_timeout: Duration::from_secs(150),
            fallback_timeout: Duration::from_secs(120),
            fail_on_all_errors: true,
            primary_source: Some(SourceCode::builtin(SourceCode::PNCP)),
            source_timeouts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Success,
    Error,
    Timeout,
    /// Failed or timed out after producing at least one record.
    Partial,
}

impl SourceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Partial => "partial",
        }
    }
}

/// Outcome of one source within a `fetch_all` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceResult {
    pub source_code: SourceCode,
    pub status: SourceStatus,
    pub record_count: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationResult {
    pub records: Vec<ProcurementRecord>,
    pub total_before_dedup: usize,
    pub total_after_dedup: usize,
    pub duplicates_removed: usize,
    pub source_results: Vec<SourceResult>,
    pub elapsed_ms: u64,
    pub is_partial: bool,
    pub degradation_reason: Option<String>,
}

/// Per-source state owned by the orchestrator while a run is in flight.
///
/// The buffer lives outside the fetch future, so records received before a
/// cancellation stay readable.
struct SourceRun {
    adapter: Arc<dyn SourceAdapter>,
    timeout: Duration,
    started: Instant,
    buffer: Vec<ProcurementRecord>,
    result: Option<SourceResult>,
}

impl SourceRun {
    fn new(adapter: Arc<dyn SourceAdapter>, timeout: Duration) -> Self {
        Self {
            adapter,
            timeout,
            started: Instant::now(),
            buffer: Vec::new(),
            result: None,
        }
    }

    fn code(&self) -> &SourceCode {
        self.adapter.code()
    }

    fn finish(&mut self, status: SourceStatus, error: Option<String>) {
        self.result = Some(SourceResult {
            source_code: self.code().clone(),
            status,
            record_count: self.buffer.len(),
            duration_ms: elapsed_ms(self.started),
            error,
        });
    }

    fn succeeded(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|result| result.status == SourceStatus::Success)
    }

    fn error_message(&self) -> String {
        match &self.result {
            Some(SourceResult {
                error: Some(error), ..
            }) => error.clone(),
            Some(_) => String::from("no records returned"),
            None => String::from("not completed"),
        }
    }
}

/// Top-level entry point composing adapters, the health registry and dedup.
pub struct ConsolidationService {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    fallback: Option<Arc<dyn SourceAdapter>>,
    health: Arc<HealthRegistry>,
    config: ConsolidationConfig,
    fetch_options: FetchOptions,
}

impl ConsolidationService {
    /// `adapters` are kept in the given order, which breaks dedup ties.
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        health: Arc<HealthRegistry>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            adapters,
            fallback: None,
            health,
            config,
            fetch_options: FetchOptions::default(),
        }
    }

    /// Designated fallback, tried only when the primary tier returns nothing.
    pub fn with_fallback(mut self, fallback: Arc<dyn SourceAdapter>) -> Self {
        if self.adapters.iter().any(|adapter| adapter.code() == fallback.code()) {
            tracing::warn!(
                source = %fallback.code(),
                "fallback is already a primary source; ignoring"
            );
            return self;
        }
        self.fallback = Some(fallback);
        self
    }

    pub fn with_fetch_options(mut self, options: FetchOptions) -> Self {
        self.fetch_options = options;
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn adapters(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    pub fn fallback(&self) -> Option<&Arc<dyn SourceAdapter>> {
        self.fallback.as_ref()
    }

    /// Probes every adapter, fallback included, concurrently.
    pub async fn check_sources(&self) -> Vec<(SourceMetadata, SourceAvailability)> {
        let probes = self
            .adapters
            .iter()
            .chain(self.fallback.iter())
            .map(|adapter| async move {
                let availability = adapter.health_check().await;
                (adapter.metadata().clone(), availability)
            });
        join_all(probes).await
    }

    /// Fetches from every enabled source and merges the results.
    ///
    /// # Errors
    ///
    /// - [`ConsolidationError::Validation`] when `date_from > date_to`
    /// - [`ConsolidationError::AllSourcesFailed`] when every attempted source,
    ///   fallback included, failed without producing a record
    pub async fn fetch_all(
        &self,
        date_from: Date,
        date_to: Date,
        state_filter: Option<Vec<StateCode>>,
        on_source_complete: Option<&SourceCompleteCallback>,
    ) -> Result<ConsolidationResult, ConsolidationError> {
        let started = Instant::now();
        let query = FetchQuery::new(date_from, date_to, state_filter)?
            .with_options(self.fetch_options.clone());

        let primary_unhealthy = self.primary_unhealthy();
        let global_timeout = if primary_unhealthy {
            self.config.extended_global_timeout
        } else {
            self.config.global_timeout
        };

        tracing::info!(
            sources = self.adapters.len(),
            %date_from,
            %date_to,
            states = query.states.len(),
            primary_unhealthy,
            global_timeout_secs = global_timeout.as_secs(),
            "consolidation started"
        );

        let mut runs: Vec<SourceRun> = self
            .adapters
            .iter()
            .map(|adapter| {
                let timeout = self.source_timeout(adapter.code(), primary_unhealthy);
                SourceRun::new(Arc::clone(adapter), timeout)
            })
            .collect();

        for run in runs.iter_mut() {
            if !self.health.is_available(run.code()) {
                tracing::warn!(source = %run.code(), "source is down; skipping");
                run.finish(
                    SourceStatus::Error,
                    Some(String::from("skipped: source marked down by health registry")),
                );
                notify(run, on_source_complete);
            }
        }

        let drives = runs
            .iter_mut()
            .filter(|run| run.result.is_none())
            .map(|run| self.drive(run, query.clone(), on_source_complete));

        if tokio::time::timeout(global_timeout, join_all(drives))
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = global_timeout.as_secs(),
                "global deadline exceeded; salvaging completed work"
            );
        }

        for run in runs.iter_mut().filter(|run| run.result.is_none()) {
            let status = if run.buffer.is_empty() {
                SourceStatus::Timeout
            } else {
                SourceStatus::Partial
            };
            run.finish(
                status,
                Some(format!(
                    "global deadline of {}s exceeded",
                    global_timeout.as_secs()
                )),
            );
            self.report(run, on_source_complete);
        }

        let primary_tier_empty = runs.iter().all(|run| run.buffer.is_empty());
        let any_succeeded = runs.iter().any(SourceRun::succeeded);
        let mut fallback_used = false;

        if primary_tier_empty && !any_succeeded && !runs.is_empty() && self.config.fail_on_all_errors {
            if let Some(fallback) = &self.fallback {
                tracing::warn!(
                    source = %fallback.code(),
                    "every primary source failed; trying fallback"
                );
                let mut run = SourceRun::new(Arc::clone(fallback), self.config.fallback_timeout);
                self.drive(&mut run, query.clone(), on_source_complete).await;
                fallback_used = !run.buffer.is_empty();
                runs.push(run);
            }

            if !fallback_used {
                let source_errors: BTreeMap<String, String> = runs
                    .iter()
                    .map(|run| (run.code().to_string(), run.error_message()))
                    .collect();
                tracing::error!(sources = source_errors.len(), "all sources failed");
                return Err(ConsolidationError::AllSourcesFailed { source_errors });
            }
        }

        Ok(self.merge(runs, started, fallback_used))
    }

    /// Closes every adapter, fallback included.
    pub async fn close(&self) {
        let closes = self
            .adapters
            .iter()
            .chain(self.fallback.iter())
            .map(|adapter| adapter.close());
        join_all(closes).await;
    }

    fn primary_unhealthy(&self) -> bool {
        self.config
            .primary_source
            .as_ref()
            .is_some_and(|primary| self.health.get_status(primary) != HealthStatus::Healthy)
    }

    fn source_timeout(&self, code: &SourceCode, primary_unhealthy: bool) -> Duration {
        let base = self
            .config
            .source_timeouts
            .get(code)
            .copied()
            .unwrap_or(self.config.source_timeout);
        let is_primary = self.config.primary_source.as_ref() == Some(code);

        if primary_unhealthy && !is_primary {
            base.max(self.config.extended_source_timeout)
        } else {
            base
        }
    }

    /// Runs one source to completion or timeout and records its outcome.
    async fn drive(
        &self,
        run: &mut SourceRun,
        query: FetchQuery,
        on_source_complete: Option<&SourceCompleteCallback>,
    ) {
        run.started = Instant::now();
        let adapter = Arc::clone(&run.adapter);
        let buffer = &mut run.buffer;

        let collect = async {
            adapter.open().await?;
            let query = query.for_capabilities(adapter.metadata().capabilities);
            let mut stream = adapter.fetch(query);
            while let Some(item) = stream.next().await {
                buffer.push(item?);
            }
            Ok::<(), crate::SourceError>(())
        };

        let outcome = tokio::time::timeout(run.timeout, collect).await;
        match outcome {
            Ok(Ok(())) => run.finish(SourceStatus::Success, None),
            Ok(Err(error)) => {
                let status = if !run.buffer.is_empty() {
                    SourceStatus::Partial
                } else if error.kind() == SourceErrorKind::Timeout {
                    SourceStatus::Timeout
                } else {
                    SourceStatus::Error
                };
                run.finish(status, Some(error.to_string()));
            }
            Err(_) => {
                let status = if run.buffer.is_empty() {
                    SourceStatus::Timeout
                } else {
                    SourceStatus::Partial
                };
                run.finish(
                    status,
                    Some(format!("timed out after {}s", run.timeout.as_secs())),
                );
            }
        }

        self.report(run, on_source_complete);
    }

    fn report(&self, run: &SourceRun, on_source_complete: Option<&SourceCompleteCallback>) {
        let Some(result) = &run.result else {
            return;
        };

        if result.status == SourceStatus::Success {
            self.health.record_success(&result.source_code);
            tracing::info!(
                source = %result.source_code,
                records = result.record_count,
                duration_ms = result.duration_ms,
                "source completed"
            );
        } else {
            self.health.record_failure(&result.source_code);
            tracing::warn!(
                source = %result.source_code,
                status = result.status.as_str(),
                records = result.record_count,
                duration_ms = result.duration_ms,
                error = result.error.as_deref().unwrap_or_default(),
                "source failed"
            );
        }

        notify(run, on_source_complete);
    }

    fn merge(&self, runs: Vec<SourceRun>, started: Instant, fallback_used: bool) -> ConsolidationResult {
        let priorities: HashMap<SourceCode, u32> = runs
            .iter()
            .map(|run| (run.code().clone(), run.adapter.metadata().priority))
            .collect();

        let mut source_results = Vec::with_capacity(runs.len());
        let mut union = Vec::new();
        for run in runs {
            if let Some(result) = run.result {
                source_results.push(result);
            }
            union.extend(run.buffer);
        }

        let total_before_dedup = union.len();
        let records = deduplicate(union, |record| {
            priorities
                .get(&record.source_code)
                .copied()
                .unwrap_or(u32::MAX)
        });
        let total_after_dedup = records.len();

        let degraded: Vec<&str> = source_results
            .iter()
            .filter(|result| result.status != SourceStatus::Success)
            .map(|result| result.source_code.as_str())
            .collect();
        let is_partial = fallback_used || !degraded.is_empty();
        let degradation_reason = is_partial.then(|| {
            if degraded.is_empty() {
                String::from("served by fallback source")
            } else {
                format!("sources failed or timed out: {}", degraded.join(", "))
            }
        });

        let result = ConsolidationResult {
            records,
            total_before_dedup,
            total_after_dedup,
            duplicates_removed: total_before_dedup - total_after_dedup,
            source_results,
            elapsed_ms: elapsed_ms(started),
            is_partial,
            degradation_reason,
        };

        tracing::info!(
            before = result.total_before_dedup,
            after = result.total_after_dedup,
            duplicates = result.duplicates_removed,
            partial = result.is_partial,
            elapsed_ms = result.elapsed_ms,
            "consolidation finished"
        );
        tracing::debug!(health = ?self.health.snapshot(), "source health after consolidation");
        result
    }
}

fn notify(run: &SourceRun, on_source_complete: Option<&SourceCompleteCallback>) {
    if let (Some(callback), Some(result)) = (on_source_complete, &run.result) {
        callback(&result.source_code, result.record_count, result.error.as_deref());
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(value: &str) -> SourceCode {
        SourceCode::parse(value).expect("valid code")
    }

    fn service(config: ConsolidationConfig) -> ConsolidationService {
        ConsolidationService::new(Vec::new(), Arc::new(HealthRegistry::default()), config)
    }

    #[test]
    fn secondary_timeouts_extend_only_when_primary_is_unhealthy() {
        let service = service(ConsolidationConfig::default());
        let pncp = code(SourceCode::PNCP);
        let other = code(SourceCode::COMPRAS_GOV);

        assert_eq!(service.source_timeout(&other, false), Duration::from_secs(50));
        assert_eq!(service.source_timeout(&other, true), Duration::from_secs(90));
        assert_eq!(service.source_timeout(&pncp, true), Duration::from_secs(50));
    }

    #[test]
    fn per_source_override_is_never_shortened() {
        let mut config = ConsolidationConfig::default();
        config
            .source_timeouts
            .insert(code(SourceCode::TRANSPARENCIA), Duration::from_secs(120));
        let service = service(config);

        assert_eq!(
            service.source_timeout(&code(SourceCode::TRANSPARENCIA), true),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn primary_health_drives_escalation() {
        let service = service(ConsolidationConfig::default());
        assert!(!service.primary_unhealthy());

        for _ in 0..3 {
            service.health().record_failure(&code(SourceCode::PNCP));
        }
        assert!(service.primary_unhealthy());
    }

    #[test]
    fn source_status_serializes_lowercase() {
        let value = serde_json::to_value(SourceStatus::Partial).expect("serializable");
        assert_eq!(value, "partial");
    }
}
