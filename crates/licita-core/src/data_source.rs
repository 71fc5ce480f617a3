//! Source adapter contract and the request/response types around it.
//!
//! Every upstream procurement source implements [`SourceAdapter`]. The
//! consolidation engine only talks to sources through this trait, so it can
//! classify failures by [`SourceErrorKind`] without knowing anything about a
//! particular API.
//!
//! # Contract
//!
//! | Method | Description |
//! |--------|-------------|
//! | [`metadata`](SourceAdapter::metadata) | Immutable description, priority and capabilities |
//! | [`health_check`](SourceAdapter::health_check) | Cheap probe, bounded by [`HEALTH_CHECK_TIMEOUT`] |
//! | [`fetch`](SourceAdapter::fetch) | Lazy, cancellable stream of normalized records |
//! | [`normalize`](SourceAdapter::normalize) | One raw item to one record, or a parse error |
//! | [`open`](SourceAdapter::open) / [`close`](SourceAdapter::close) | Resource lifecycle |

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Date;

use crate::{ProcurementRecord, SourceCode, StateCode, ValidationError};

/// Upper bound for any adapter health probe, independent of request timeouts.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Filtering and pagination features a source supports natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub pagination: bool,
    pub date_range: bool,
    pub uf_filter: bool,
    pub keyword_filter: bool,
}

impl CapabilitySet {
    pub const fn new(pagination: bool, date_range: bool, uf_filter: bool, keyword_filter: bool) -> Self {
        Self {
            pagination,
            date_range,
            uf_filter,
            keyword_filter,
        }
    }

    pub fn supported(self) -> Vec<&'static str> {
        let mut values = Vec::with_capacity(4);
        if self.pagination {
            values.push("pagination");
        }
        if self.date_range {
            values.push("date_range");
        }
        if self.uf_filter {
            values.push("uf_filter");
        }
        if self.keyword_filter {
            values.push("keyword_filter");
        }
        values
    }
}

/// Declared request budget of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Minimum delay between two consecutive requests.
    pub min_interval_ms: u64,
}

impl RateLimit {
    pub const fn min_interval(self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Immutable description of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub name: String,
    pub code: SourceCode,
    pub base_url: String,
    pub capabilities: CapabilitySet,
    pub rate_limit: RateLimit,
    /// Lower wins when two sources report the same procurement.
    pub priority: u32,
    pub documentation_url: String,
}

/// Result of a cheap health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceAvailability {
    Available,
    /// Responsive, but slow or throttling.
    Degraded,
    Unavailable,
}

/// Adapter-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Timeout,
    RateLimited { retry_after: Option<Duration> },
    AuthFailure,
    Api { status: Option<u16> },
    Parse { field: &'static str },
    /// The source refused to run (open circuit, closed adapter).
    Unavailable,
    /// Upstream rejected the query itself (HTTP 400 or 422).
    InvalidRequest,
}

/// Structured, source-scoped error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    source: SourceCode,
    kind: SourceErrorKind,
    message: String,
}

impl SourceError {
    pub fn new(source: SourceCode, kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            source,
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(source: SourceCode, message: impl Into<String>) -> Self {
        Self::new(source, SourceErrorKind::Timeout, message)
    }

    pub fn rate_limited(
        source: SourceCode,
        retry_after: Option<Duration>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(source, SourceErrorKind::RateLimited { retry_after }, message)
    }

    pub fn auth_failure(source: SourceCode, message: impl Into<String>) -> Self {
        Self::new(source, SourceErrorKind::AuthFailure, message)
    }

    pub fn api(source: SourceCode, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::new(source, SourceErrorKind::Api { status }, message)
    }

    pub fn parse(source: SourceCode, field: &'static str, message: impl Into<String>) -> Self {
        Self::new(source, SourceErrorKind::Parse { field }, message)
    }

    pub fn unavailable(source: SourceCode, message: impl Into<String>) -> Self {
        Self::new(source, SourceErrorKind::Unavailable, message)
    }

    pub fn invalid_request(source: SourceCode, message: impl Into<String>) -> Self {
        Self::new(source, SourceErrorKind::InvalidRequest, message)
    }

    pub fn source_code(&self) -> &SourceCode {
        &self.source
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::Timeout => "source.timeout",
            SourceErrorKind::RateLimited { .. } => "source.rate_limited",
            SourceErrorKind::AuthFailure => "source.auth_failure",
            SourceErrorKind::Api { .. } => "source.api_error",
            SourceErrorKind::Parse { .. } => "source.parse_error",
            SourceErrorKind::Unavailable => "source.unavailable",
            SourceErrorKind::InvalidRequest => "source.invalid_request",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} ({})", self.source, self.message, self.code())
    }
}

impl std::error::Error for SourceError {}

/// Per-request tuning passed through to adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    pub page_size: u32,
    /// Stop paginating after this many pages per query dimension.
    pub max_pages: Option<u32>,
    /// Modality codes for sources that must be queried per modality.
    pub modalities: Vec<u16>,
    /// Only forwarded to sources with keyword capability.
    pub keyword: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: None,
            modalities: Vec::new(),
            keyword: None,
        }
    }
}

/// Validated search window handed to every adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchQuery {
    pub date_from: Date,
    pub date_to: Date,
    /// Empty means every UF.
    pub states: Vec<StateCode>,
    pub options: FetchOptions,
}

impl FetchQuery {
    pub fn new(
        date_from: Date,
        date_to: Date,
        states: Option<Vec<StateCode>>,
    ) -> Result<Self, ValidationError> {
        if date_from > date_to {
            return Err(ValidationError::InvertedDateRange {
                from: date_from.to_string(),
                to: date_to.to_string(),
            });
        }

        let mut states = states.unwrap_or_default();
        states.sort();
        states.dedup();

        Ok(Self {
            date_from,
            date_to,
            states,
            options: FetchOptions::default(),
        })
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// Drops options the source cannot honor natively.
    pub fn for_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        if !capabilities.keyword_filter {
            self.options.keyword = None;
        }
        self
    }

    /// UFs to visit for sources that must be queried state by state.
    pub fn states_or_all(&self) -> Vec<StateCode> {
        if self.states.is_empty() {
            StateCode::all()
        } else {
            self.states.clone()
        }
    }

    /// Client-side UF filter for sources without native UF support.
    pub fn accepts_state(&self, state: Option<&StateCode>) -> bool {
        if self.states.is_empty() {
            return true;
        }
        state.is_some_and(|state| self.states.contains(state))
    }
}

/// Lazy stream of normalized records.
pub type RecordStream<'a> = BoxStream<'a, Result<ProcurementRecord, SourceError>>;

pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source adapter contract.
///
/// # Streaming
///
/// [`fetch`](SourceAdapter::fetch) yields records as pages arrive. Dropping the
/// stream at any point cancels the in-flight request and leaves every item
/// already yielded intact. An `Err` item ends the stream: it reports the
/// request-level failure after the adapter exhausted its own retries.
///
/// Malformed single items are never surfaced as stream errors; adapters log
/// and skip them.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one instance serves concurrent
/// consolidation runs.
pub trait SourceAdapter: Send + Sync {
    fn metadata(&self) -> &SourceMetadata;

    fn code(&self) -> &SourceCode {
        &self.metadata().code
    }

    /// Probes the upstream cheaply. Never takes longer than [`HEALTH_CHECK_TIMEOUT`].
    fn health_check<'a>(&'a self) -> AdapterFuture<'a, SourceAvailability>;

    fn fetch<'a>(&'a self, query: FetchQuery) -> RecordStream<'a>;

    /// Converts one raw upstream item into a record.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceErrorKind::Parse`] error naming the offending field.
    fn normalize(&self, raw: &Value) -> Result<ProcurementRecord, SourceError>;

    /// Acquires resources. Calling it on an open adapter is a no-op.
    fn open<'a>(&'a self) -> AdapterFuture<'a, Result<(), SourceError>>;

    /// Releases resources. Calling it on an idle or closed adapter is a no-op.
    fn close<'a>(&'a self) -> AdapterFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    fn date(day: u8) -> Date {
        Date::from_calendar_date(2024, Month::March, day).expect("valid date")
    }

    fn code() -> SourceCode {
        SourceCode::parse("pncp").expect("valid code")
    }

    #[test]
    fn inverted_range_is_rejected() {
        let error = FetchQuery::new(date(10), date(1), None).expect_err("must fail");
        assert!(matches!(error, ValidationError::InvertedDateRange { .. }));
    }

    #[test]
    fn empty_state_filter_means_every_uf() {
        let query = FetchQuery::new(date(1), date(2), None).expect("valid query");
        assert_eq!(query.states_or_all().len(), 27);
        assert!(query.accepts_state(None));
    }

    #[test]
    fn state_filter_is_deduplicated_and_applied() {
        let sp = StateCode::parse("SP").expect("valid UF");
        let rj = StateCode::parse("RJ").expect("valid UF");
        let query = FetchQuery::new(date(1), date(2), Some(vec![sp, rj, sp])).expect("valid");

        assert_eq!(query.states, vec![rj, sp]);
        assert!(query.accepts_state(Some(&sp)));
        assert!(!query.accepts_state(Some(&StateCode::parse("BA").expect("valid UF"))));
        assert!(!query.accepts_state(None));
    }

    #[test]
    fn keyword_is_kept_only_for_keyword_capable_sources() {
        let query = FetchQuery::new(date(1), date(2), None)
            .expect("valid query")
            .with_options(FetchOptions {
                keyword: Some(String::from("merenda")),
                ..FetchOptions::default()
            });

        let capable = query
            .clone()
            .for_capabilities(CapabilitySet::new(true, true, false, true));
        let plain = query.for_capabilities(CapabilitySet::new(true, true, true, false));

        assert_eq!(capable.options.keyword.as_deref(), Some("merenda"));
        assert_eq!(plain.options.keyword, None);
    }

    #[test]
    fn display_includes_source_and_code() {
        let error = SourceError::rate_limited(code(), Some(Duration::from_secs(3)), "slow down");
        assert_eq!(error.to_string(), "[pncp] slow down (source.rate_limited)");
    }
}
