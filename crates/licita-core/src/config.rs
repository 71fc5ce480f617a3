//! Engine configuration.
//!
//! Loaded from a TOML file; every section and key is optional and falls back
//! to the defaults below.
//!
//! ```toml
//! [consolidation]
//! source_timeout_secs = 50
//! global_timeout_secs = 90
//! fail_on_all_errors = true
//! primary = "pncp"
//! fallback = "transparencia"
//!
//! [health]
//! degraded_threshold = 3
//! down_threshold = 5
//! ttl_secs = 300
//!
//! [breaker]
//! failure_threshold = 5
//! cooldown_secs = 120
//! uf_concurrency = 6
//!
//! [sources.compras_gov]
//! enabled = true
//! timeout_secs = 60
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::{
    ComprasGovAdapter, PncpAdapter, PncpSettings, TransparenciaAdapter, TransportSettings,
};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::consolidation::{ConsolidationConfig, ConsolidationService};
use crate::data_source::{FetchOptions, SourceAdapter};
use crate::health::{HealthConfig, HealthRegistry};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::retry::RetryConfig;
use crate::{ConfigError, SourceCode};

/// Environment variable pointing at the config file.
pub const CONFIG_ENV: &str = "LICITA_CONFIG";

/// Built-in sources in declared order. Declared order breaks dedup ties.
pub const KNOWN_SOURCES: [&str; 3] = [
    SourceCode::PNCP,
    SourceCode::COMPRAS_GOV,
    SourceCode::TRANSPARENCIA,
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub consolidation: ConsolidationSection,
    pub health: HealthSection,
    pub breaker: BreakerSection,
    pub sources: BTreeMap<String, SourceSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationSection {
    pub source_timeout_secs: u64,
    pub extended_source_timeout_secs: u64,
    pub global_timeout_secs: u64,
    pub extended_global_timeout_secs: u64,
    pub fallback_timeout_secs: u64,
    pub fail_on_all_errors: bool,
    pub primary: Option<String>,
    pub fallback: Option<String>,
    pub page_size: u32,
    pub max_pages: Option<u32>,
}

impl Default for ConsolidationSection {
    fn default() -> Self {
        Self {
            source_timeout_secs: 50,
            extended_source_timeout_secs: 90,
            global_timeout_secs: 90,
            extended_global_timeout_secs: 150,
            fallback_timeout_secs: 120,
            fail_on_all_errors: true,
            primary: Some(String::from(SourceCode::PNCP)),
            fallback: Some(String::from(SourceCode::TRANSPARENCIA)),
            page_size: 50,
            max_pages: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub degraded_threshold: u32,
    pub down_threshold: u32,
    pub ttl_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            degraded_threshold: 3,
            down_threshold: 5,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub uf_timeout_secs: u64,
    pub uf_retry_backoff_secs: u64,
    /// PNCP UFs fetched at the same time.
    pub uf_concurrency: usize,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 120,
            uf_timeout_secs: 15,
            uf_retry_backoff_secs: 3,
            uf_concurrency: 6,
        }
    }
}

/// Per-source overrides under `[sources.<code>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// Defaults to true for every built-in source except the fallback.
    pub enabled: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub min_interval_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    /// Environment variable holding the API key, for sources that need one.
    pub api_key_env: Option<String>,
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading config");
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads the file named by `LICITA_CONFIG`, or defaults when it is unset.
    pub fn load_default() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
            Some(path) => Self::load_from(path),
            None => {
                tracing::debug!("{CONFIG_ENV} not set, using default config");
                Ok(Self::default())
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (code, source) in &self.sources {
            known_source(code)?;
            if source.timeout_secs == Some(0) {
                return Err(invalid("sources.timeout_secs", "must be at least 1"));
            }
        }
        let section = &self.consolidation;
        let timeouts = [
            ("consolidation.source_timeout_secs", section.source_timeout_secs),
            ("consolidation.extended_source_timeout_secs", section.extended_source_timeout_secs),
            ("consolidation.global_timeout_secs", section.global_timeout_secs),
            ("consolidation.extended_global_timeout_secs", section.extended_global_timeout_secs),
            ("consolidation.fallback_timeout_secs", section.fallback_timeout_secs),
            ("breaker.uf_timeout_secs", self.breaker.uf_timeout_secs),
        ];
        if let Some((key, _)) = timeouts.into_iter().find(|(_, secs)| *secs == 0) {
            return Err(invalid(key, "must be at least 1"));
        }
        if self.health.degraded_threshold == 0 {
            return Err(invalid("health.degraded_threshold", "must be at least 1"));
        }
        if self.health.down_threshold < self.health.degraded_threshold {
            return Err(invalid(
                "health.down_threshold",
                "must not be below health.degraded_threshold",
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.breaker.uf_concurrency == 0 {
            return Err(invalid("breaker.uf_concurrency", "must be at least 1"));
        }
        if let Some(primary) = &section.primary {
            SourceCode::parse(primary)?;
        }
        if let Some(fallback) = self.fallback_code()? {
            if self.is_enabled(fallback.as_str()) {
                return Err(ConfigError::FallbackIsPrimary(fallback.to_string()));
            }
        }
        Ok(())
    }

    /// An empty `fallback` disables the fallback tier.
    fn fallback_name(&self) -> Option<&str> {
        self.consolidation
            .fallback
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    fn fallback_code(&self) -> Result<Option<SourceCode>, ConfigError> {
        self.fallback_name().map(known_source).transpose()
    }

    fn source(&self, code: &str) -> SourceSection {
        self.sources.get(code).cloned().unwrap_or_default()
    }

    fn is_fallback(&self, code: &str) -> bool {
        self.fallback_name()
            .is_some_and(|fallback| fallback.eq_ignore_ascii_case(code))
    }

    /// Whether `code` runs in the primary tier.
    pub fn is_enabled(&self, code: &str) -> bool {
        self.source(code)
            .enabled
            .unwrap_or_else(|| !self.is_fallback(code))
    }

    /// Enabled built-in sources in declared order.
    pub fn enabled_sources(&self) -> Vec<SourceCode> {
        KNOWN_SOURCES
            .into_iter()
            .filter(|code| self.is_enabled(code))
            .map(SourceCode::builtin)
            .collect()
    }

    pub fn consolidation_config(&self) -> Result<ConsolidationConfig, ConfigError> {
        let section = &self.consolidation;
        let source_timeouts = self
            .sources
            .iter()
            .filter_map(|(code, source)| source.timeout_secs.map(|secs| (code, secs)))
            .map(|(code, secs)| Ok((known_source(code)?, Duration::from_secs(secs))))
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

        Ok(ConsolidationConfig {
            source_timeout: Duration::from_secs(section.source_timeout_secs),
            extended_source_timeout: Duration::from_secs(section.extended_source_timeout_secs),
            global_timeout: Duration::from_secs(section.global_timeout_secs),
            extended_global_timeout: Duration::from_secs(section.extended_global_timeout_secs),
            fallback_timeout: Duration::from_secs(section.fallback_timeout_secs),
            fail_on_all_errors: section.fail_on_all_errors,
            primary_source: section
                .primary
                .as_deref()
                .map(SourceCode::parse)
                .transpose()?,
            source_timeouts,
        })
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            degraded_threshold: self.health.degraded_threshold,
            down_threshold: self.health.down_threshold,
            ttl: Duration::from_secs(self.health.ttl_secs),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            page_size: self.consolidation.page_size,
            max_pages: self.consolidation.max_pages,
            ..FetchOptions::default()
        }
    }

    /// Builds a service over the reqwest client with a fresh health registry.
    pub fn build_service(&self) -> Result<ConsolidationService, ConfigError> {
        self.build_service_with(
            Arc::new(ReqwestHttpClient::new()),
            Arc::new(HealthRegistry::new(self.health_config())),
        )
    }

    pub fn build_service_with(
        &self,
        http_client: Arc<dyn HttpClient>,
        health: Arc<HealthRegistry>,
    ) -> Result<ConsolidationService, ConfigError> {
        let adapters = self
            .enabled_sources()
            .iter()
            .map(|code| self.build_adapter(code, Arc::clone(&http_client)))
            .collect::<Vec<_>>();

        let mut service =
            ConsolidationService::new(adapters, health, self.consolidation_config()?)
                .with_fetch_options(self.fetch_options());

        if let Some(fallback) = self.fallback_code()? {
            service = service.with_fallback(self.build_adapter(&fallback, http_client));
        }

        tracing::debug!(
            sources = ?self.enabled_sources().iter().map(SourceCode::as_str).collect::<Vec<_>>(),
            fallback = ?self.consolidation.fallback,
            "consolidation service built"
        );
        Ok(service)
    }

    fn transport_settings(&self, code: &str, defaults: TransportSettings) -> TransportSettings {
        let section = self.source(code);
        TransportSettings {
            min_interval: section
                .min_interval_ms
                .map_or(defaults.min_interval, Duration::from_millis),
            request_timeout: section
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            retry: section
                .max_retries
                .map_or(defaults.retry.clone(), |max_retries| RetryConfig {
                    max_retries,
                    ..defaults.retry
                }),
        }
    }

    fn build_adapter(&self, code: &SourceCode, http_client: Arc<dyn HttpClient>) -> Arc<dyn SourceAdapter> {
        match code.as_str() {
            SourceCode::PNCP => Arc::new(PncpAdapter::with_settings(
                http_client,
                self.transport_settings(code.as_str(), PncpAdapter::default_transport()),
                Arc::new(CircuitBreaker::new(self.breaker_config())),
                PncpSettings {
                    uf_timeout: Duration::from_secs(self.breaker.uf_timeout_secs),
                    uf_retry_backoff: Duration::from_secs(self.breaker.uf_retry_backoff_secs),
                    uf_concurrency: self.breaker.uf_concurrency,
                },
            )),
            SourceCode::TRANSPARENCIA => Arc::new(TransparenciaAdapter::with_settings(
                http_client,
                self.api_key(code.as_str())
                    .or_else(TransparenciaAdapter::api_key_from_env),
                self.transport_settings(code.as_str(), TransparenciaAdapter::default_transport()),
            )),
            _ => Arc::new(ComprasGovAdapter::with_settings(
                http_client,
                self.transport_settings(code.as_str(), TransportSettings::default()),
            )),
        }
    }

    fn api_key(&self, code: &str) -> Option<String> {
        let variable = self.source(code).api_key_env?;
        std::env::var(variable)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

fn invalid(key: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue { key, reason }
}

fn known_source(code: &str) -> Result<SourceCode, ConfigError> {
    let parsed = SourceCode::parse(code)?;
    if KNOWN_SOURCES.contains(&parsed.as_str()) {
        Ok(parsed)
    } else {
        Err(ConfigError::UnknownSource(code.to_owned()))
    }
}
