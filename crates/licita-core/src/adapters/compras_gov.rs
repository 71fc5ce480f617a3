use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::adapters::{
    date, decimal, integer, normalize_page, page_items, state, text, TransportSettings,
};
use crate::data_source::{
    AdapterFuture, CapabilitySet, FetchQuery, RateLimit, RecordStream, SourceAdapter,
    SourceAvailability, SourceError, SourceMetadata,
};
use crate::http_client::{HttpClient, HttpRequest};
use crate::transport::ResilientTransport;
use crate::{IssuingAgency, ProcurementRecord, SourceCode, Sphere, StateCode};

const BASE_URL: &str = "https://dadosabertos.compras.gov.br";
const CONTRACTS_PATH: &str = "/modulo-contratacoes/1_consultarContratacoes_PNCP_14133";

/// Pregão eletrônico, concorrência eletrônica and dispensa.
const DEFAULT_MODALITIES: [u16; 3] = [6, 4, 8];

/// Compras.gov.br open data API, a secondary source with native UF filtering.
pub struct ComprasGovAdapter {
    metadata: SourceMetadata,
    transport: ResilientTransport,
}

/// Next page to request along one (modality, UF) dimension.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    modality: u16,
    uf: Option<StateCode>,
    page: u32,
}

impl ComprasGovAdapter {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self::with_settings(http_client, TransportSettings::default())
    }

    pub fn with_settings(http_client: Arc<dyn HttpClient>, transport: TransportSettings) -> Self {
        let metadata = SourceMetadata {
            name: String::from("Compras.gov.br Dados Abertos"),
            code: SourceCode::builtin(SourceCode::COMPRAS_GOV),
            base_url: String::from(BASE_URL),
            capabilities: CapabilitySet::new(true, true, true, false),
            rate_limit: RateLimit {
                min_interval_ms: transport.min_interval.as_millis() as u64,
            },
            priority: 2,
            documentation_url: String::from("https://dadosabertos.compras.gov.br/swagger-ui/index.html"),
        };
        Self {
            transport: transport.build(metadata.code.clone(), http_client),
            metadata,
        }
    }

    fn page_request(&self, query: &FetchQuery, cursor: Cursor) -> HttpRequest {
        let mut request = HttpRequest::get(format!("{BASE_URL}{CONTRACTS_PATH}"))
            .with_query("dataPublicacaoPncpInicial", query.date_from)
            .with_query("dataPublicacaoPncpFinal", query.date_to)
            .with_query("codigoModalidade", cursor.modality)
            .with_query("pagina", cursor.page)
            .with_query("tamanhoPagina", query.options.page_size.clamp(10, 500));
        if let Some(uf) = cursor.uf {
            request = request.with_query("unidadeOrgaoUfSigla", uf);
        }
        request
    }

    fn dimensions(query: &FetchQuery) -> VecDeque<Cursor> {
        let modalities = if query.options.modalities.is_empty() {
            DEFAULT_MODALITIES.to_vec()
        } else {
            query.options.modalities.clone()
        };
        let states: Vec<Option<StateCode>> = if query.states.is_empty() {
            vec![None]
        } else {
            query.states.iter().copied().map(Some).collect()
        };

        modalities
            .into_iter()
            .flat_map(|modality| {
                states.iter().map(move |uf| Cursor {
                    modality,
                    uf: *uf,
                    page: 1,
                })
            })
            .collect()
    }

    /// Fetches the page at the front of `pending` and advances the cursor.
    async fn next_page(
        &self,
        query: &FetchQuery,
        pending: &mut VecDeque<Cursor>,
    ) -> Option<Result<Vec<ProcurementRecord>, SourceError>> {
        let cursor = pending.pop_front()?;
        let body = match self.transport.get_json(self.page_request(query, cursor)).await {
            Ok(body) => body,
            Err(error) => {
                pending.clear();
                return Some(Err(error));
            }
        };

        let items = page_items(&body, "resultado");
        let remaining = body
            .get("paginasRestantes")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let reached_limit = query
            .options
            .max_pages
            .is_some_and(|max| cursor.page >= max);
        if !items.is_empty() && remaining > 0 && !reached_limit {
            pending.push_front(Cursor {
                page: cursor.page + 1,
                ..cursor
            });
        }

        Some(Ok(normalize_page(self, &items)))
    }
}

impl SourceAdapter for ComprasGovAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn health_check<'a>(&'a self) -> AdapterFuture<'a, SourceAvailability> {
        Box::pin(async move {
            let today = time::OffsetDateTime::now_utc().date();
            let request = HttpRequest::get(format!("{BASE_URL}{CONTRACTS_PATH}"))
                .with_query("dataPublicacaoPncpInicial", today)
                .with_query("dataPublicacaoPncpFinal", today)
                .with_query("codigoModalidade", DEFAULT_MODALITIES[0])
                .with_query("pagina", 1)
                .with_query("tamanhoPagina", 10);
            self.transport.probe(request).await
        })
    }

    fn fetch<'a>(&'a self, query: FetchQuery) -> RecordStream<'a> {
        let pending = Self::dimensions(&query);

        stream::unfold((query, pending), move |(query, mut pending)| async move {
            let page = self.next_page(&query, &mut pending).await?;
            Some((page, (query, pending)))
        })
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, SourceError>)))
        .try_flatten()
        .boxed()
    }

    fn normalize(&self, raw: &Value) -> Result<ProcurementRecord, SourceError> {
        let code = &self.metadata.code;
        let source_id = text(raw, "/idCompra")
            .or_else(|| text(raw, "/numeroControlePNCP"))
            .ok_or_else(|| SourceError::parse(code.clone(), "idCompra", "missing purchase id"))?;

        let mut record = ProcurementRecord::new(
            code.clone(),
            self.metadata.name.clone(),
            source_id,
            text(raw, "/objetoCompra").unwrap_or_default(),
            raw.clone(),
        )
        .map_err(|error| SourceError::parse(code.clone(), "idCompra", error.to_string()))?;

        record.issuing_agency = IssuingAgency::new(
            text(raw, "/orgaoEntidadeRazaoSocial").unwrap_or_default(),
            text(raw, "/orgaoEntidadeCnpj").unwrap_or_default(),
        );
        record.estimated_value = decimal(raw, "/valorTotalEstimado");
        record.state_code = state(raw, "/unidadeOrgaoUfSigla");
        record.municipality = text(raw, "/unidadeOrgaoMunicipioNome");
        record.publication_date = date(raw, "/dataPublicacaoPncp");
        record.opening_date = date(raw, "/dataAberturaPropostaPncp");
        record.closing_date = date(raw, "/dataEncerramentoPropostaPncp");
        record.edital_number = text(raw, "/numeroCompra");
        record.year = integer(raw, "/anoCompraPncp").and_then(|year| i32::try_from(year).ok());
        record.modality = text(raw, "/modalidadeNome");
        record.status_text = text(raw, "/situacaoCompraNomePncp");
        record.sphere = text(raw, "/orgaoEntidadeEsferaId")
            .map(|sphere| Sphere::from_code(&sphere))
            .unwrap_or_default();
        if let Some(control) = text(raw, "/numeroControlePNCP") {
            record
                .links
                .push(format!("https://pncp.gov.br/app/editais?q={}", urlencoding::encode(&control)));
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
