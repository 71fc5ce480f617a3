use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use licita_core::{
    CircuitBreaker, ComprasGovAdapter, FetchOptions, FetchQuery, HttpResponse, PncpAdapter,
    PncpSettings, ProcurementRecord, RetryConfig, ScriptedHttpClient, SourceAdapter,
    SourceAvailability, SourceError, SourceErrorKind, StateCode, TransparenciaAdapter,
    TransportSettings,
};
use rust_decimal::Decimal;
use serde_json::json;
use time::{Date, Month};

const PNCP_URL: &str = "https://pncp.gov.br/api/consulta/v1/contratacoes/publicacao";
const COMPRAS_URL: &str =
    "https://dadosabertos.compras.gov.br/modulo-contratacoes/1_consultarContratacoes_PNCP_14133";
const TRANSPARENCIA_URL: &str = "https://api.portaldatransparencia.gov.br/api-de-dados/licitacoes";

struct AdapterCase {
    name: &'static str,
    adapter: Arc<dyn SourceAdapter>,
    client: Arc<ScriptedHttpClient>,
}

fn fast_transport() -> TransportSettings {
    TransportSettings {
        min_interval: Duration::ZERO,
        request_timeout: Duration::from_secs(1),
        retry: RetryConfig::no_retry(),
    }
}

fn pncp(client: Arc<ScriptedHttpClient>) -> PncpAdapter {
    PncpAdapter::with_settings(
        client,
        fast_transport(),
        Arc::new(CircuitBreaker::default()),
        PncpSettings::default(),
    )
}

fn compras(client: Arc<ScriptedHttpClient>) -> ComprasGovAdapter {
    ComprasGovAdapter::with_settings(client, fast_transport())
}

fn transparencia(client: Arc<ScriptedHttpClient>, api_key: Option<&str>) -> TransparenciaAdapter {
    TransparenciaAdapter::with_settings(client, api_key.map(str::to_owned), fast_transport())
}

fn adapter_cases() -> Vec<AdapterCase> {
    let pncp_client = Arc::new(ScriptedHttpClient::new());
    let compras_client = Arc::new(ScriptedHttpClient::new());
    let transparencia_client = Arc::new(ScriptedHttpClient::new());

    vec![
        AdapterCase {
            name: "pncp",
            adapter: Arc::new(pncp(Arc::clone(&pncp_client))),
            client: pncp_client,
        },
        AdapterCase {
            name: "compras_gov",
            adapter: Arc::new(compras(Arc::clone(&compras_client))),
            client: compras_client,
        },
        AdapterCase {
            name: "transparencia",
            adapter: Arc::new(transparencia(Arc::clone(&transparencia_client), Some("demo-key"))),
            client: transparencia_client,
        },
    ]
}

fn day(month: Month, value: u8) -> Date {
    Date::from_calendar_date(2024, month, value).expect("valid date")
}

fn query(from: Date, to: Date, states: &[&str]) -> FetchQuery {
    let states = (!states.is_empty()).then(|| {
        states
            .iter()
            .map(|uf| StateCode::parse(uf).expect("valid UF"))
            .collect()
    });
    FetchQuery::new(from, to, states)
        .expect("valid query")
        .with_options(FetchOptions {
            modalities: vec![6],
            ..FetchOptions::default()
        })
}

async fn collect(
    adapter: &dyn SourceAdapter,
    query: FetchQuery,
) -> (Vec<ProcurementRecord>, Vec<SourceError>) {
    let items: Vec<_> = adapter.fetch(query).collect().await;
    let mut records = Vec::new();
    let mut errors = Vec::new();
    for item in items {
        match item {
            Ok(record) => records.push(record),
            Err(error) => errors.push(error),
        }
    }
    (records, errors)
}

// =============================================================================
// Contract: metadata
// =============================================================================

#[test]
fn metadata_is_consistent_for_all_adapters() {
    let cases = adapter_cases();
    let mut priorities = HashSet::new();

    for case in &cases {
        let metadata = case.adapter.metadata();
        assert_eq!(metadata.code.as_str(), case.name, "adapter '{}': code", case.name);
        assert_eq!(case.adapter.code(), &metadata.code);
        assert!(
            metadata.base_url.starts_with("https://"),
            "adapter '{}': base_url must be https",
            case.name
        );
        assert!(metadata.capabilities.pagination, "adapter '{}': pagination", case.name);
        assert!(metadata.capabilities.date_range, "adapter '{}': date_range", case.name);
        assert!(
            priorities.insert(metadata.priority),
            "adapter '{}': priority {} must be unique",
            case.name,
            metadata.priority
        );
    }

    assert_eq!(cases[0].adapter.metadata().priority, 1, "pncp takes precedence");
}

#[test]
fn normalize_rejects_items_without_identity_for_all_adapters() {
    for case in adapter_cases() {
        let error = case
            .adapter
            .normalize(&json!({"objetoCompra": "sem identificador"}))
            .expect_err("item without id");
        assert!(
            matches!(error.kind(), SourceErrorKind::Parse { .. }),
            "adapter '{}': expected parse error, got {error}",
            case.name
        );
        assert_eq!(error.source_code().as_str(), case.name);
    }
}

// =============================================================================
// Contract: lifecycle
// =============================================================================

#[tokio::test]
async fn open_and_close_are_idempotent_for_all_adapters() {
    for case in adapter_cases() {
        case.adapter.open().await.unwrap_or_else(|error| {
            panic!("adapter '{}' failed to open: {error}", case.name)
        });
        case.adapter.open().await.expect("second open is a no-op");
        case.adapter.close().await;
        case.adapter.close().await;
    }
}

#[tokio::test]
async fn fetch_on_closed_adapter_sends_no_request() {
    for case in adapter_cases() {
        let query = query(day(Month::March, 1), day(Month::March, 2), &[]);

        let (records, errors) = collect(case.adapter.as_ref(), query).await;

        assert!(records.is_empty(), "adapter '{}': no records", case.name);
        assert_eq!(errors.len(), 1, "adapter '{}': one error", case.name);
        assert_eq!(errors[0].kind(), SourceErrorKind::Unavailable);
        assert!(case.client.recorded_requests().is_empty());
    }
}

#[tokio::test]
async fn health_check_maps_upstream_status_for_all_adapters() {
    for case in adapter_cases() {
        case.client.push_json(case.adapter.metadata().base_url.clone(), "[]");
        assert_eq!(
            case.adapter.health_check().await,
            SourceAvailability::Available,
            "adapter '{}': 200 means available",
            case.name
        );
    }

    for case in adapter_cases() {
        case.client.push(
            case.adapter.metadata().base_url.clone(),
            Ok(HttpResponse::new(503, "")),
        );
        assert_eq!(
            case.adapter.health_check().await,
            SourceAvailability::Unavailable,
            "adapter '{}': 503 means unavailable",
            case.name
        );
    }
}

// =============================================================================
// PNCP
// =============================================================================

#[tokio::test]
async fn pncp_follows_total_pages_per_uf() {
    let client = Arc::new(ScriptedHttpClient::new());
    client.push_json(format!("{PNCP_URL}?dataInicial=20240302"), "{}");
    let page = |page: u32| {
        format!(
            "{PNCP_URL}?dataInicial=20240301&dataFinal=20240302&codigoModalidadeContratacao=6&uf=SP&pagina={page}&"
        )
    };
    client.push_json(
        page(1),
        json!({
            "data": [
                {"numeroControlePNCP": "c-1", "objetoCompra": "Obra", "unidadeOrgao": {"ufSigla": "SP"}},
                {"objetoCompra": "sem controle"}
            ],
            "totalPaginas": 2
        })
        .to_string(),
    );
    client.push_json(
        page(2),
        json!({
            "data": [{"numeroControlePNCP": "c-2", "objetoCompra": "Serviço", "valorTotalEstimado": 1500}],
            "totalPaginas": 2
        })
        .to_string(),
    );
    let adapter = pncp(Arc::clone(&client));
    adapter.open().await.expect("open");

    let (records, errors) = collect(
        &adapter,
        query(day(Month::March, 1), day(Month::March, 2), &["SP"]),
    )
    .await;

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(
        records.iter().map(|r| r.source_id.as_str()).collect::<Vec<_>>(),
        vec!["c-1", "c-2"],
        "malformed item is skipped"
    );
    assert_eq!(records[1].estimated_value, Some(Decimal::new(1500, 0)));
    assert_eq!(client.recorded_requests().len(), 3, "canary plus two pages");
}

// =============================================================================
// Compras.gov.br
// =============================================================================

fn compras_page_prefix(page: u32) -> String {
    format!(
        "{COMPRAS_URL}?dataPublicacaoPncpInicial=2024-03-01&dataPublicacaoPncpFinal=2024-03-02&codigoModalidade=6&pagina={page}&"
    )
}

fn compras_item(id: &str) -> serde_json::Value {
    json!({
        "idCompra": id,
        "objetoCompra": format!("Compra {id}"),
        "orgaoEntidadeCnpj": "00394460000141",
        "unidadeOrgaoUfSigla": "SP",
        "valorTotalEstimado": "1.234,56",
        "dataPublicacaoPncp": "2024-03-01T08:00:00"
    })
}

#[tokio::test]
async fn compras_gov_paginates_until_no_pages_remain() {
    let client = Arc::new(ScriptedHttpClient::new());
    client.push_json(
        compras_page_prefix(1),
        json!({
            "resultado": [compras_item("1"), {"objetoCompra": "sem id"}, compras_item("2")],
            "paginasRestantes": 1
        })
        .to_string(),
    );
    client.push_json(
        compras_page_prefix(2),
        json!({"resultado": [compras_item("3")], "paginasRestantes": 0}).to_string(),
    );
    let adapter = compras(Arc::clone(&client));
    adapter.open().await.expect("open");

    let (records, errors) = collect(
        &adapter,
        query(day(Month::March, 1), day(Month::March, 2), &["SP"]),
    )
    .await;

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].estimated_value, Some(Decimal::new(123456, 2)));
    assert_eq!(records[0].publication_date, Some(day(Month::March, 1)));
    assert_eq!(client.recorded_requests().len(), 2);
    assert!(client.recorded_requests()[0]
        .full_url()
        .contains("unidadeOrgaoUfSigla=SP"));
}

#[tokio::test]
async fn compras_gov_stops_at_max_pages() {
    let client = Arc::new(ScriptedHttpClient::new());
    client.push_json(
        compras_page_prefix(1),
        json!({"resultado": [compras_item("1")], "paginasRestantes": 5}).to_string(),
    );
    let adapter = compras(Arc::clone(&client));
    adapter.open().await.expect("open");
    let mut query = query(day(Month::March, 1), day(Month::March, 2), &[]);
    query.options.max_pages = Some(1);

    let (records, _) = collect(&adapter, query).await;

    assert_eq!(records.len(), 1);
    assert_eq!(client.recorded_requests().len(), 1);
}

#[tokio::test]
async fn compras_gov_surfaces_request_failures_as_stream_error() {
    let client = Arc::new(ScriptedHttpClient::new());
    client.push(COMPRAS_URL, Ok(HttpResponse::new(500, "")));
    let adapter = compras(Arc::clone(&client));
    adapter.open().await.expect("open");

    let (records, errors) = collect(
        &adapter,
        query(day(Month::March, 1), day(Month::March, 2), &["SP", "RJ"]),
    )
    .await;

    assert!(records.is_empty());
    assert_eq!(errors.len(), 1, "the first failure ends the stream");
    assert_eq!(errors[0].kind(), SourceErrorKind::Api { status: Some(500) });
    assert_eq!(client.recorded_requests().len(), 1);
}

// =============================================================================
// Portal da Transparência
// =============================================================================

fn transparencia_item(id: u64, uf: &str) -> serde_json::Value {
    json!({
        "id": id,
        "licitacao": {"objeto": format!("Licitação {id}"), "numero": "9/2024"},
        "valor": "2.500,00",
        "unidadeGestora": {
            "nome": "Unidade Gestora",
            "orgaoVinculado": {"nome": "Ministério da Saúde", "cnpj": "00394544000185"}
        },
        "municipio": {"nomeIBGE": "Brasília", "uf": {"sigla": uf}},
        "dataPublicacao": "05/03/2024"
    })
}

#[tokio::test]
async fn transparencia_without_api_key_refuses_to_open() {
    let client = Arc::new(ScriptedHttpClient::new());
    let adapter = transparencia(Arc::clone(&client), None);

    let error = adapter.open().await.expect_err("missing key");

    assert_eq!(error.kind(), SourceErrorKind::AuthFailure);
    assert!(!adapter.has_api_key());
    assert_eq!(adapter.health_check().await, SourceAvailability::Unavailable);
    assert!(client.recorded_requests().is_empty());
}

#[tokio::test]
async fn transparencia_splits_long_ranges_and_filters_uf_locally() {
    let client = Arc::new(ScriptedHttpClient::new());
    let window = |from: &str, to: &str, page: u32| {
        format!("{TRANSPARENCIA_URL}?dataInicial={from}&dataFinal={to}&pagina={page}")
    };
    client.push_json(
        window("01%2F03%2F2024", "30%2F03%2F2024", 1),
        json!([transparencia_item(1, "DF"), transparencia_item(2, "SP")]).to_string(),
    );
    client.push_json(window("01%2F03%2F2024", "30%2F03%2F2024", 2), "[]");
    client.push_json(
        window("31%2F03%2F2024", "14%2F04%2F2024", 1),
        json!([transparencia_item(3, "DF")]).to_string(),
    );
    client.push_json(window("31%2F03%2F2024", "14%2F04%2F2024", 2), "[]");
    let adapter = transparencia(Arc::clone(&client), Some("demo-key"));
    adapter.open().await.expect("open");

    let (records, errors) = collect(
        &adapter,
        query(day(Month::March, 1), day(Month::April, 14), &["DF"]),
    )
    .await;

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(
        records.iter().map(|r| r.source_id.as_str()).collect::<Vec<_>>(),
        vec!["1", "3"]
    );
    assert_eq!(records[0].estimated_value, Some(Decimal::new(250000, 2)));
    assert_eq!(records[0].year, Some(2024));

    let requests = client.recorded_requests();
    assert_eq!(requests.len(), 4, "two windows, two pages each");
    assert!(requests.iter().all(|request| {
        request.headers.get("chave-api-dados").map(String::as_str) == Some("demo-key")
    }));
}

#[tokio::test]
async fn transparencia_rejected_key_is_an_auth_failure() {
    let client = Arc::new(ScriptedHttpClient::new());
    client.push(TRANSPARENCIA_URL, Ok(HttpResponse::new(401, "")));
    let adapter = transparencia(Arc::clone(&client), Some("revoked"));
    adapter.open().await.expect("open");

    let (_, errors) = collect(
        &adapter,
        query(day(Month::March, 1), day(Month::March, 2), &[]),
    )
    .await;

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), SourceErrorKind::AuthFailure);
}
