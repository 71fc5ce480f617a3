//! # Licita Core
//!
//! Multi-source consolidation engine for Brazilian public procurement
//! ("licitação") records.
//!
//! ## Overview
//!
//! Several government APIs publish overlapping tender data with very different
//! reliability. This crate queries all of them concurrently and returns one
//! deduplicated, best-effort result per search:
//!
//! - **Canonical record model** every source normalizes into
//! - **Source adapter contract** with a lazy, cancellable record stream
//! - **Health registry** tracking cross-request source health
//! - **Circuit breaker** guarding one source's per-UF sub-requests
//! - **Consolidation service** with per-source and global deadlines, partial
//!   salvage and a fallback tier
//! - **Deduplication** with priority-based conflict resolution
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Source adapters (PNCP, Compras.gov, Portal da Transparência) |
//! | [`circuit_breaker`] | Cooldown-based circuit breaker |
//! | [`config`] | TOML engine configuration |
//! | [`consolidation`] | `fetch_all` orchestration |
//! | [`data_source`] | Adapter trait and request/error types |
//! | [`dedup`] | Dedup key and merge |
//! | [`domain`] | Procurement record, UF, dates |
//! | [`error`] | Core error types |
//! | [`health`] | Source health registry |
//! | [`http_client`] | HTTP client abstraction |
//! | [`retry`] | Backoff and retry decisions |
//! | [`source`] | Source identifiers |
//! | [`throttling`] | Minimum inter-request delay |
//! | [`transport`] | Retrying JSON transport shared by adapters |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use licita_core::EngineConfig;
//! use time::macros::date;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = EngineConfig::load_default()?.build_service()?;
//!
//!     let result = service
//!         .fetch_all(date!(2024 - 03 - 01), date!(2024 - 03 - 07), None, None)
//!         .await?;
//!
//!     println!("{} records, partial: {}", result.total_after_dedup, result.is_partial);
//!     service.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐     ┌──────────────────┐
//! │ ConsolidationService │────▶│ Health Registry  │
//! └──────────┬───────────┘     └──────────────────┘
//!            │ fetch (concurrent)
//!            ▼
//! ┌──────────────────────┐     ┌──────────────────┐
//! │ SourceAdapter        │────▶│ Circuit Breaker  │
//! │ (pncp, compras_gov,  │     │ (pncp only)      │
//! │  transparencia)      │     └──────────────────┘
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐     ┌──────────────────┐
//! │ ResilientTransport   │────▶│ HttpClient       │
//! │ (pacing, retry)      │     │ (reqwest)        │
//! └──────────────────────┘     └──────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Adapter failures never abort a run; they become a
//! [`SourceResult`](consolidation::SourceResult). Only a run where every
//! source, fallback included, produced nothing fails:
//!
//! ```rust
//! use licita_core::ConsolidationError;
//!
//! fn handle(error: ConsolidationError) {
//!     if let Some(source_errors) = error.source_errors() {
//!         for (source, message) in source_errors {
//!             eprintln!("{source}: {message}");
//!         }
//!     }
//! }
//! ```
//!
//! ## Security
//!
//! - API keys are read from environment variables only and never logged

pub mod adapters;
pub mod circuit_breaker;
pub mod config;
pub mod consolidation;
pub mod data_source;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod health;
pub mod http_client;
pub mod retry;
pub mod source;
pub mod throttling;
pub mod transport;

// Adapter implementations
pub use adapters::{
    ComprasGovAdapter, PncpAdapter, PncpSettings, TransparenciaAdapter, TransportSettings,
};

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

// Configuration
pub use config::EngineConfig;

// Consolidation
pub use consolidation::{
    ConsolidationConfig, ConsolidationResult, ConsolidationService, SourceCompleteCallback,
    SourceResult, SourceStatus,
};

// Data source trait and types
pub use data_source::{
    AdapterFuture, CapabilitySet, FetchOptions, FetchQuery, RateLimit, RecordStream,
    SourceAdapter, SourceAvailability, SourceError, SourceErrorKind, SourceMetadata,
    HEALTH_CHECK_TIMEOUT,
};

// Deduplication
pub use dedup::{dedup_key, deduplicate};

// Domain models
pub use domain::{
    format_brazilian, format_compact, parse_iso_date, parse_source_date, IssuingAgency,
    ProcurementRecord, Sphere, StateCode, UtcDateTime,
};

// Error types
pub use error::{ConfigError, ConsolidationError, ValidationError};

// Health registry
pub use health::{HealthConfig, HealthEntry, HealthRegistry, HealthSnapshot, HealthStatus};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient,
    ScriptedHttpClient,
};

// Retry logic
pub use retry::{Backoff, RetryConfig, RetryDecision};

// Source identifiers
pub use source::SourceCode;

// Throttling
pub use throttling::RequestPacer;

// Transport
pub use transport::ResilientTransport;
