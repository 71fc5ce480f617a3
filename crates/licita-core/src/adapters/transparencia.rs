use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use time::Date;

use crate::adapters::{date, decimal, normalize_page, page_items, state, text, TransportSettings};
use crate::data_source::{
    AdapterFuture, CapabilitySet, FetchQuery, RateLimit, RecordStream, SourceAdapter,
    SourceAvailability, SourceError, SourceMetadata,
};
use crate::http_client::{HttpAuth, HttpClient, HttpRequest};
use crate::transport::ResilientTransport;
use crate::{format_brazilian, IssuingAgency, ProcurementRecord, SourceCode, Sphere};

const BASE_URL: &str = "https://api.portaldatransparencia.gov.br/api-de-dados";
const TENDERS_PATH: &str = "/licitacoes";
const API_KEY_HEADER: &str = "chave-api-dados";

/// The API rejects date windows longer than one month.
const MAX_WINDOW_DAYS: i64 = 30;

/// Portal da Transparência, the broad but slow federal source.
///
/// Requires an API key. Pagination ends on the first empty page and UF
/// filtering happens client-side.
pub struct TransparenciaAdapter {
    metadata: SourceMetadata,
    transport: ResilientTransport,
    auth: HttpAuth,
}

impl TransparenciaAdapter {
    pub fn new(http_client: Arc<dyn HttpClient>, api_key: Option<String>) -> Self {
        Self::with_settings(http_client, api_key, Self::default_transport())
    }

    pub fn with_settings(
        http_client: Arc<dyn HttpClient>,
        api_key: Option<String>,
        transport: TransportSettings,
    ) -> Self {
        let metadata = SourceMetadata {
            name: String::from("Portal da Transparência"),
            code: SourceCode::builtin(SourceCode::TRANSPARENCIA),
            base_url: String::from(BASE_URL),
            capabilities: CapabilitySet::new(true, true, false, false),
            rate_limit: RateLimit {
                min_interval_ms: transport.min_interval.as_millis() as u64,
            },
            priority: 3,
            documentation_url: String::from("https://api.portaldatransparencia.gov.br/swagger-ui/index.html"),
        };
        let auth = match api_key.filter(|key| !key.trim().is_empty()) {
            Some(key) => HttpAuth::Header {
                name: String::from(API_KEY_HEADER),
                value: key,
            },
            None => HttpAuth::None,
        };

        Self {
            transport: transport.build(metadata.code.clone(), http_client),
            metadata,
            auth,
        }
    }

    /// 90 requests per minute on the free tier.
    pub fn default_transport() -> TransportSettings {
        TransportSettings {
            min_interval: Duration::from_millis(700),
            request_timeout: Duration::from_secs(60),
            ..TransportSettings::default()
        }
    }

    /// Reads the key from `LICITA_TRANSPARENCIA_API_KEY`, then `TRANSPARENCIA_API_KEY`.
    pub fn api_key_from_env() -> Option<String> {
        std::env::var("LICITA_TRANSPARENCIA_API_KEY")
            .or_else(|_| std::env::var("TRANSPARENCIA_API_KEY"))
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    pub fn has_api_key(&self) -> bool {
        self.auth != HttpAuth::None
    }

    fn missing_key_error(&self) -> SourceError {
        SourceError::auth_failure(
            self.metadata.code.clone(),
            "missing API key; set LICITA_TRANSPARENCIA_API_KEY",
        )
    }

    fn page_request(&self, window: (Date, Date), page: u32) -> HttpRequest {
        HttpRequest::get(format!("{BASE_URL}{TENDERS_PATH}"))
            .with_query("dataInicial", format_brazilian(window.0))
            .with_query("dataFinal", format_brazilian(window.1))
            .with_query("pagina", page)
            .with_auth(&self.auth)
    }

    /// Splits `[from, to]` into consecutive windows of at most 30 days.
    fn windows(from: Date, to: Date) -> VecDeque<(Date, Date)> {
        let mut windows = VecDeque::new();
        let mut start = from;
        while start <= to {
            let end = start
                .checked_add(time::Duration::days(MAX_WINDOW_DAYS - 1))
                .map_or(to, |end| end.min(to));
            windows.push_back((start, end));
            match end.next_day() {
                Some(next) => start = next,
                None => break,
            }
        }
        windows
    }
}

struct PageScan {
    query: FetchQuery,
    windows: VecDeque<(Date, Date)>,
    page: u32,
    failed: bool,
}

impl SourceAdapter for TransparenciaAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn health_check<'a>(&'a self) -> AdapterFuture<'a, SourceAvailability> {
        Box::pin(async move {
            if !self.has_api_key() {
                return SourceAvailability::Unavailable;
            }
            let today = time::OffsetDateTime::now_utc().date();
            self.transport.probe(self.page_request((today, today), 1)).await
        })
    }

    fn fetch<'a>(&'a self, query: FetchQuery) -> RecordStream<'a> {
        let scan = PageScan {
            windows: Self::windows(query.date_from, query.date_to),
            query,
            page: 1,
            failed: false,
        };

        stream::unfold(scan, move |mut scan| async move {
            if scan.failed {
                return None;
            }
            let window = *scan.windows.front()?;

            let body = match self.transport.get_json(self.page_request(window, scan.page)).await {
                Ok(body) => body,
                Err(error) => {
                    scan.failed = true;
                    return Some((Err(error), scan));
                }
            };

            let items = page_items(&body, "data");
            let reached_limit = scan
                .query
                .options
                .max_pages
                .is_some_and(|max| scan.page >= max);
            if items.is_empty() || reached_limit {
                scan.windows.pop_front();
                scan.page = 1;
            } else {
                scan.page += 1;
            }

            let records: Vec<ProcurementRecord> = normalize_page(self, &items)
                .into_iter()
                .filter(|record| scan.query.accepts_state(record.state_code.as_ref()))
                .collect();
            Some((Ok(records), scan))
        })
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, SourceError>)))
        .try_flatten()
        .boxed()
    }

    fn normalize(&self, raw: &Value) -> Result<ProcurementRecord, SourceError> {
        let code = &self.metadata.code;
        let source_id = text(raw, "/id")
            .ok_or_else(|| SourceError::parse(code.clone(), "id", "missing tender id"))?;

        let mut record = ProcurementRecord::new(
            code.clone(),
            self.metadata.name.clone(),
            source_id,
            text(raw, "/licitacao/objeto").unwrap_or_default(),
            raw.clone(),
        )
        .map_err(|error| SourceError::parse(code.clone(), "id", error.to_string()))?;

        record.issuing_agency = IssuingAgency::new(
            text(raw, "/unidadeGestora/orgaoVinculado/nome")
                .or_else(|| text(raw, "/unidadeGestora/nome"))
                .unwrap_or_default(),
            text(raw, "/unidadeGestora/orgaoVinculado/cnpj").unwrap_or_default(),
        );
        record.estimated_value = decimal(raw, "/valor");
        record.state_code = state(raw, "/municipio/uf/sigla");
        record.municipality = text(raw, "/municipio/nomeIBGE");
        record.publication_date = date(raw, "/dataPublicacao");
        record.opening_date = date(raw, "/dataAbertura");
        record.closing_date = date(raw, "/dataResultadoCompra");
        record.edital_number = text(raw, "/licitacao/numero");
        record.year = record.publication_date.map(Date::year);
        record.modality = text(raw, "/modalidadeLicitacao/descricao");
        record.status_text = text(raw, "/situacaoCompra/descricao");
        record.sphere = Sphere::Federal;
        record.links.push(format!("https://portaldatransparencia.gov.br/licitacoes/{}", record.source_id));

        Ok(record)
    }

    fn open<'a>(&'a self) -> AdapterFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            if !self.has_api_key() {
                return Err(self.missing_key_error());
            }
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
