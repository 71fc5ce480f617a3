//! Concrete procurement source adapters.
//!
//! | Adapter | Code | Priority | Notes |
//! |---------|------|----------|-------|
//! | [`PncpAdapter`] | `pncp` | 1 | Primary; queried UF by UF behind a circuit breaker |
//! | [`ComprasGovAdapter`] | `compras_gov` | 2 | Open data API, native UF filter |
//! | [`TransparenciaAdapter`] | `transparencia` | 3 | Needs an API key; default fallback |

mod compras_gov;
mod pncp;
mod transparencia;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::Value;
use time::Date;

use crate::http_client::HttpClient;
use crate::retry::RetryConfig;
use crate::transport::ResilientTransport;
use crate::{parse_source_date, ProcurementRecord, SourceAdapter, SourceCode, StateCode};

pub use compras_gov::ComprasGovAdapter;
pub use pncp::{PncpAdapter, PncpSettings};
pub use transparencia::TransparenciaAdapter;

/// Request pacing, timeout and retry policy of one adapter transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub min_interval: Duration,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl TransportSettings {
    pub(crate) fn build(&self, source: SourceCode, client: Arc<dyn HttpClient>) -> ResilientTransport {
        ResilientTransport::new(source, client)
            .with_min_interval(self.min_interval)
            .with_request_timeout(self.request_timeout)
            .with_retry(self.retry.clone())
    }
}

/// Normalizes a page of raw items, logging and skipping the malformed ones.
pub(crate) fn normalize_page<A>(adapter: &A, items: &[Value]) -> Vec<ProcurementRecord>
where
    A: SourceAdapter + ?Sized,
{
    items
        .iter()
        .filter_map(|raw| match adapter.normalize(raw) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(source = %adapter.code(), error = %error, "skipping malformed item");
                None
            }
        })
        .collect()
}

/// Field lookup by JSON pointer (`/orgaoEntidade/cnpj`).
fn field<'v>(raw: &'v Value, pointer: &str) -> Option<&'v Value> {
    raw.pointer(pointer).filter(|value| !value.is_null())
}

/// Trimmed, non-empty text; numbers are rendered as text.
pub(crate) fn text(raw: &Value, pointer: &str) -> Option<String> {
    let rendered = match field(raw, pointer)? {
        Value::String(value) => value.trim().to_owned(),
        Value::Number(value) => value.to_string(),
        _ => return None,
    };
    (!rendered.is_empty()).then_some(rendered)
}

pub(crate) fn integer(raw: &Value, pointer: &str) -> Option<i64> {
    match field(raw, pointer)? {
        Value::Number(value) => value.as_i64(),
        Value::String(value) => value.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn date(raw: &Value, pointer: &str) -> Option<Date> {
    text(raw, pointer).and_then(|value| parse_source_date(&value))
}

pub(crate) fn state(raw: &Value, pointer: &str) -> Option<StateCode> {
    text(raw, pointer).and_then(|value| StateCode::parse(&value).ok())
}

/// Monetary value from a JSON number or a string in either `1234.56` or
/// Brazilian `1.234,56` notation.
pub(crate) fn decimal(raw: &Value, pointer: &str) -> Option<Decimal> {
    match field(raw, pointer)? {
        Value::Number(value) => {
            let rendered = value.to_string();
            Decimal::from_str(&rendered)
                .or_else(|_| Decimal::from_scientific(&rendered))
                .ok()
        }
        Value::String(value) => parse_decimal_text(value),
        _ => None,
    }
}

fn parse_decimal_text(value: &str) -> Option<Decimal> {
    let trimmed = value.trim().trim_start_matches("R$").trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains(',') {
        let normalized = trimmed.replace('.', "").replace(',', ".");
        return Decimal::from_str(&normalized).ok();
    }
    Decimal::from_str(trimmed).ok()
}

/// Pages contain items under `key`; a bare array is also accepted.
pub(crate) fn page_items(body: &Value, key: &str) -> Vec<Value> {
    match body {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
