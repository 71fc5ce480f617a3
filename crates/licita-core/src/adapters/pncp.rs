use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::adapters::{
    date, decimal, integer, normalize_page, page_items, state, text, TransportSettings,
};
use crate::circuit_breaker::CircuitBreaker;
use crate::data_source::{
    AdapterFuture, CapabilitySet, FetchQuery, RateLimit, RecordStream, SourceAdapter,
    SourceAvailability, SourceError, SourceErrorKind, SourceMetadata,
};
use crate::http_client::{HttpClient, HttpRequest};
use crate::transport::ResilientTransport;
use crate::{format_compact, IssuingAgency, ProcurementRecord, SourceCode, Sphere, StateCode};

const BASE_URL: &str = "https://pncp.gov.br/api/consulta";
const PUBLICATIONS_PATH: &str = "/v1/contratacoes/publicacao";
const PORTAL_URL: &str = "https://pncp.gov.br/app/editais";

/// Competitive modalities queried when the caller does not pick any:
/// concorrência (eletrônica, presencial), pregão (eletrônico, presencial)
/// and dispensa.
const DEFAULT_MODALITIES: [u16; 5] = [4, 5, 6, 7, 8];

/// Smallest page PNCP accepts.
const MIN_PAGE_SIZE: u32 = 10;

/// Per-UF sub-fetch bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PncpSettings {
    pub uf_timeout: Duration,
    /// Fixed pause before the single retry of a timed-out UF.
    pub uf_retry_backoff: Duration,
    /// UFs fetched at the same time. Zero is treated as one.
    pub uf_concurrency: usize,
}

impl Default for PncpSettings {
    fn default() -> Self {
        Self {
            uf_timeout: Duration::from_secs(15),
            uf_retry_backoff: Duration::from_secs(3),
            uf_concurrency: 6,
        }
    }
}

/// Portal Nacional de Contratações Públicas, the primary high-volume source.
///
/// PNCP has to be queried one UF per request, with up to `uf_concurrency`
/// UFs in flight. A health canary runs before the first UF; if the shared
/// circuit breaker is already open, neither the canary nor the fetch runs.
/// The breaker is checked again before each UF starts. Each UF is bounded by
/// its own timeout with one retry, and every timeout counts toward the
/// breaker threshold.
pub struct PncpAdapter {
    metadata: SourceMetadata,
    transport: ResilientTransport,
    breaker: Arc<CircuitBreaker>,
    settings: PncpSettings,
}

impl PncpAdapter {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self::with_settings(
            http_client,
            Self::default_transport(),
            Arc::new(CircuitBreaker::default()),
            PncpSettings::default(),
        )
    }

    pub fn with_settings(
        http_client: Arc<dyn HttpClient>,
        transport: TransportSettings,
        breaker: Arc<CircuitBreaker>,
        settings: PncpSettings,
    ) -> Self {
        let metadata = Self::default_metadata(&transport);
        Self {
            transport: transport.build(metadata.code.clone(), http_client),
            metadata,
            breaker,
            settings,
        }
    }

    pub fn default_transport() -> TransportSettings {
        TransportSettings {
            min_interval: Duration::from_millis(100),
            ..TransportSettings::default()
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn default_metadata(transport: &TransportSettings) -> SourceMetadata {
        SourceMetadata {
            name: String::from("Portal Nacional de Contratações Públicas"),
            code: SourceCode::builtin(SourceCode::PNCP),
            base_url: String::from(BASE_URL),
            capabilities: CapabilitySet::new(true, true, true, false),
            rate_limit: RateLimit {
                min_interval_ms: transport.min_interval.as_millis() as u64,
            },
            priority: 1,
            documentation_url: String::from("https://pncp.gov.br/api/consulta/swagger-ui/index.html"),
        }
    }

    fn page_request(
        &self,
        query: &FetchQuery,
        uf: StateCode,
        modality: u16,
        page: u32,
        page_size: u32,
    ) -> HttpRequest {
        HttpRequest::get(format!("{BASE_URL}{PUBLICATIONS_PATH}"))
            .with_query("dataInicial", format_compact(query.date_from))
            .with_query("dataFinal", format_compact(query.date_to))
            .with_query("codigoModalidadeContratacao", modality)
            .with_query("uf", uf)
            .with_query("pagina", page)
            .with_query("tamanhoPagina", page_size)
    }

    /// One-item request used as the canary and the health probe.
    fn canary_request(&self, query: Option<&FetchQuery>) -> HttpRequest {
        let today = time::OffsetDateTime::now_utc().date();
        let (from, to) = query.map_or((today, today), |query| (query.date_to, query.date_to));
        HttpRequest::get(format!("{BASE_URL}{PUBLICATIONS_PATH}"))
            .with_query("dataInicial", format_compact(from))
            .with_query("dataFinal", format_compact(to))
            .with_query("codigoModalidadeContratacao", DEFAULT_MODALITIES[2])
            .with_query("pagina", 1)
            .with_query("tamanhoPagina", MIN_PAGE_SIZE)
    }

    fn modalities(query: &FetchQuery) -> Vec<u16> {
        if query.options.modalities.is_empty() {
            DEFAULT_MODALITIES.to_vec()
        } else {
            query.options.modalities.clone()
        }
    }

    /// Fails fast when the breaker is open, otherwise feeds the canary
    /// outcome into the breaker.
    async fn run_canary(&self, query: &FetchQuery) -> Result<(), SourceError> {
        if !self.transport.is_open() {
            return Err(SourceError::unavailable(
                self.metadata.code.clone(),
                "adapter is closed; call open() first",
            ));
        }
        if !self.breaker.try_recover() {
            return Err(self.circuit_open_error());
        }

        match self.transport.probe(self.canary_request(Some(query))).await {
            SourceAvailability::Unavailable => {
                tracing::warn!(source = %self.metadata.code, "health canary failed");
                self.breaker.record_failure();
            }
            SourceAvailability::Available | SourceAvailability::Degraded => {
                self.breaker.record_success();
            }
        }
        Ok(())
    }

    fn circuit_open_error(&self) -> SourceError {
        let remaining = self
            .breaker
            .remaining_cooldown()
            .map_or(0, |remaining| remaining.as_secs());
        SourceError::unavailable(
            self.metadata.code.clone(),
            format!("circuit breaker open; retry in {remaining}s"),
        )
    }

    /// Every page of every modality for one UF.
    async fn fetch_state(
        &self,
        query: &FetchQuery,
        uf: StateCode,
    ) -> Result<Vec<ProcurementRecord>, SourceError> {
        let page_size = query.options.page_size.max(MIN_PAGE_SIZE);
        let mut records = Vec::new();

        for modality in Self::modalities(query) {
            let mut page = 1_u32;
            loop {
                let body = self
                    .transport
                    .get_json(self.page_request(query, uf, modality, page, page_size))
                    .await?;
                let items = page_items(&body, "data");
                records.extend(normalize_page(self, &items));

                let total_pages = body
                    .get("totalPaginas")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let reached_limit = query.options.max_pages.is_some_and(|max| page >= max);
                if items.is_empty() || u64::from(page) >= total_pages || reached_limit {
                    break;
                }
                page += 1;
            }
        }

        Ok(records)
    }

    /// One UF under its own timeout, retried once after a fixed pause.
    async fn fetch_state_guarded(
        &self,
        query: &FetchQuery,
        uf: StateCode,
    ) -> Result<Vec<ProcurementRecord>, SourceError> {
        for attempt in 0..2 {
            let outcome = tokio::time::timeout(self.settings.uf_timeout, self.fetch_state(query, uf)).await;
            match outcome {
                Ok(Ok(records)) => {
                    self.breaker.record_success();
                    return Ok(records);
                }
                Ok(Err(error)) => {
                    self.breaker.record_failure();
                    return Err(error);
                }
                Err(_) => {
                    self.breaker.record_failure();
                    tracing::warn!(
                        source = %self.metadata.code,
                        uf = %uf,
                        attempt = attempt + 1,
                        timeout_secs = self.settings.uf_timeout.as_secs(),
                        "UF fetch timed out"
                    );
                    if attempt == 0 && !self.breaker.is_degraded() {
                        tokio::time::sleep(self.settings.uf_retry_backoff).await;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(SourceError::timeout(
            self.metadata.code.clone(),
            format!("UF {uf} timed out"),
        ))
    }
}

/// What happened to one UF of a scan.
enum StateOutcome {
    Fetched(StateCode, Vec<ProcurementRecord>),
    Failed(StateCode, SourceError),
    /// The breaker was open when the UF was due to start.
    Skipped,
}

/// Progress through the UF outcomes of one fetch.
struct StateScan<'a> {
    outcomes: BoxStream<'a, StateOutcome>,
    succeeded: usize,
    last_error: Option<SourceError>,
    finished: bool,
}

impl PncpAdapter {
    /// Runs the UF sub-fetches with bounded concurrency, yielding each
    /// outcome as it completes.
    fn state_outcomes<'a>(&'a self, query: Arc<FetchQuery>) -> BoxStream<'a, StateOutcome> {
        stream::iter(query.states_or_all())
            .map(move |uf| {
                let query = Arc::clone(&query);
                async move {
                    if self.breaker.is_degraded() {
                        return StateOutcome::Skipped;
                    }
                    match self.fetch_state_guarded(&query, uf).await {
                        Ok(records) => StateOutcome::Fetched(uf, records),
                        Err(error) => StateOutcome::Failed(uf, error),
                    }
                }
            })
            .buffer_unordered(self.settings.uf_concurrency.max(1))
            .boxed()
    }

    fn scan_states<'a>(
        &'a self,
        query: Arc<FetchQuery>,
    ) -> BoxStream<'a, Result<Vec<ProcurementRecord>, SourceError>> {
        let scan = StateScan {
            outcomes: self.state_outcomes(query),
            succeeded: 0,
            last_error: None,
            finished: false,
        };

        stream::unfold(scan, move |mut scan| async move {
            if scan.finished {
                return None;
            }

            while let Some(outcome) = scan.outcomes.next().await {
                match outcome {
                    StateOutcome::Fetched(uf, records) => {
                        scan.succeeded += 1;
                        tracing::debug!(source = %self.metadata.code, uf = %uf, records = records.len(), "UF fetched");
                        return Some((Ok(records), scan));
                    }
                    StateOutcome::Failed(_, error) if error.kind() == SourceErrorKind::AuthFailure => {
                        scan.finished = true;
                        return Some((Err(error), scan));
                    }
                    StateOutcome::Failed(uf, error) => {
                        tracing::warn!(source = %self.metadata.code, uf = %uf, error = %error, "UF fetch failed");
                        scan.last_error = Some(error);
                    }
                    StateOutcome::Skipped => {
                        scan.finished = true;
                        tracing::warn!(source = %self.metadata.code, "circuit opened; skipping remaining UFs");
                        return Some((Err(self.circuit_open_error()), scan));
                    }
                }
            }

            scan.finished = true;
            match scan.last_error.take() {
                Some(error) if scan.succeeded == 0 => Some((Err(error), scan)),
                _ => None,
            }
        })
        .boxed()
    }
}

impl SourceAdapter for PncpAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn health_check<'a>(&'a self) -> AdapterFuture<'a, SourceAvailability> {
        Box::pin(async move {
            if self.breaker.is_degraded() && !self.breaker.try_recover() {
                return SourceAvailability::Unavailable;
            }
            self.transport.probe(self.canary_request(None)).await
        })
    }

    fn fetch<'a>(&'a self, query: FetchQuery) -> RecordStream<'a> {
        let query = Arc::new(query);

        stream::once(async move {
            let canary = self.run_canary(&query).await;
            match canary {
                Ok(()) => self.scan_states(query),
                Err(error) => stream::once(future::ready(Err(error))).boxed(),
            }
        })
        .flatten()
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, SourceError>)))
        .try_flatten()
        .boxed()
    }

    fn normalize(&self, raw: &Value) -> Result<ProcurementRecord, SourceError> {
        let code = &self.metadata.code;
        let source_id = text(raw, "/numeroControlePNCP").ok_or_else(|| {
            SourceError::parse(code.clone(), "numeroControlePNCP", "missing control number")
        })?;

        let mut record = ProcurementRecord::new(
            code.clone(),
            self.metadata.name.clone(),
            source_id,
            text(raw, "/objetoCompra").unwrap_or_default(),
            raw.clone(),
        )
        .map_err(|error| SourceError::parse(code.clone(), "numeroControlePNCP", error.to_string()))?;

        let tax_id = text(raw, "/orgaoEntidade/cnpj").unwrap_or_default();
        record.issuing_agency = IssuingAgency::new(
            text(raw, "/orgaoEntidade/razaoSocial").unwrap_or_default(),
            tax_id.clone(),
        );
        record.estimated_value = decimal(raw, "/valorTotalEstimado");
        record.state_code = state(raw, "/unidadeOrgao/ufSigla");
        record.municipality = text(raw, "/unidadeOrgao/municipioNome");
        record.publication_date = date(raw, "/dataPublicacaoPncp");
        record.opening_date = date(raw, "/dataAberturaProposta");
        record.closing_date = date(raw, "/dataEncerramentoProposta");
        record.edital_number = text(raw, "/numeroCompra");
        record.year = integer(raw, "/anoCompra").and_then(|year| i32::try_from(year).ok());
        record.modality = text(raw, "/modalidadeNome");
        record.status_text = text(raw, "/situacaoCompraNome");
        record.sphere = text(raw, "/orgaoEntidade/esferaId")
            .map(|sphere| Sphere::from_code(&sphere))
            .unwrap_or_default();

        if let (Some(year), Some(sequence)) = (record.year, integer(raw, "/sequencialCompra")) {
            let cnpj = record.issuing_agency.normalized_tax_id();
            if !cnpj.is_empty() {
                record.links.push(format!("{PORTAL_URL}/{cnpj}/{year}/{sequence}"));
            }
        }
        if let Some(origin) = text(raw, "/linkSistemaOrigem") {
            record.links.push(origin);
        }

        Ok(record)
    }

    fn open<'a>(&'a self) -> AdapterFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            self.transport.open();
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> AdapterFuture<'a, ()> {
        Box::pin(async move {
            self.transport.close();
        })
    }
}
