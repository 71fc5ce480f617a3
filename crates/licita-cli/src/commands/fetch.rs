use licita_core::{
    format_brazilian, parse_iso_date, ConsolidationResult, EngineConfig, ProcurementRecord,
    SourceCode, SourceCompleteCallback, StateCode,
};

use crate::cli::FetchArgs;
use crate::error::CliError;

use super::{CommandResult, Table};

const DESCRIPTION_WIDTH: usize = 60;

pub async fn run(args: &FetchArgs, config: &EngineConfig) -> Result<CommandResult, CliError> {
    let date_from = parse_iso_date(&args.from)?;
    let date_to = parse_iso_date(&args.to)?;
    let states = parse_states(&args.states)?;

    let mut options = config.fetch_options();
    if let Some(page_size) = args.page_size {
        options.page_size = page_size;
    }
    if args.max_pages.is_some() {
        options.max_pages = args.max_pages;
    }
    if !args.modalities.is_empty() {
        options.modalities = args.modalities.clone();
    }
    if args.keyword.is_some() {
        options.keyword = args.keyword.clone();
    }

    let service = config.build_service()?.with_fetch_options(options);

    let progress: &SourceCompleteCallback = &|source: &SourceCode, count, error| match error {
        None => tracing::info!(source = %source, records = count, "source complete"),
        Some(error) => {
            tracing::warn!(source = %source, records = count, error, "source incomplete")
        }
    };

    let outcome = service
        .fetch_all(date_from, date_to, states, Some(progress))
        .await;
    service.close().await;

    Ok(render(outcome?)?)
}

fn parse_states(values: &[String]) -> Result<Option<Vec<StateCode>>, CliError> {
    if values.is_empty() {
        return Ok(None);
    }
    let states = values
        .iter()
        .map(|value| StateCode::parse(value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(states))
}

fn render(result: ConsolidationResult) -> Result<CommandResult, serde_json::Error> {
    let items = result
        .records
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    let table = Table {
        headers: vec!["source", "uf", "published", "value", "agency", "object"],
        rows: result.records.iter().map(table_row).collect(),
    };

    let mut command = CommandResult::ok(serde_json::to_value(&result)?)
        .with_items(items)
        .with_table(table)
        .with_summary("records", result.total_after_dedup)
        .with_summary("duplicates", result.duplicates_removed)
        .with_summary("elapsed_ms", result.elapsed_ms)
        .with_summary("partial", result.is_partial);

    for source in &result.source_results {
        command = command.with_summary(
            "source",
            format!(
                "{} {} ({} records, {} ms)",
                source.source_code,
                source.status.as_str(),
                source.record_count,
                source.duration_ms
            ),
        );
    }
    if let Some(reason) = &result.degradation_reason {
        command = command.with_warning(reason.clone());
    }
    for source in result.source_results.iter().filter(|source| source.error.is_some()) {
        let error = source.error.as_deref().unwrap_or_default();
        command = command.with_warning(format!("{}: {error}", source.source_code));
    }

    Ok(command)
}

fn table_row(record: &ProcurementRecord) -> Vec<String> {
    vec![
        record.source_code.to_string(),
        record
            .state_code
            .as_ref()
            .map(|uf| uf.as_str().to_owned())
            .unwrap_or_default(),
        record.publication_date.map(format_brazilian).unwrap_or_default(),
        record
            .estimated_value
            .map(|value| value.round_dp(2).to_string())
            .unwrap_or_default(),
        record.issuing_agency.name.clone(),
        truncate(&record.object_description, DESCRIPTION_WIDTH),
    ]
}

fn truncate(text: &str, width: usize) -> String {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() <= width {
        return text;
    }
    let mut short = text.chars().take(width.saturating_sub(1)).collect::<String>();
    short.push('…');
    short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_uf_list_means_every_state() {
        assert_eq!(parse_states(&[]).expect("no states"), None);
    }

    #[test]
    fn invalid_uf_is_a_validation_error() {
        let error = parse_states(&[String::from("XX1")]).expect_err("bad uf");
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn truncate_collapses_whitespace_and_marks_cut() {
        assert_eq!(truncate("aquisição   de\nmedicamentos", 60), "aquisição de medicamentos");
        assert_eq!(truncate("abcdef", 4), "abc…");
    }
}
