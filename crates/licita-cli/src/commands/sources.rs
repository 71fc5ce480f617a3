use serde::Serialize;

use licita_core::{
    ConsolidationService, EngineConfig, SourceAvailability, SourceCode, SourceMetadata,
};

use crate::cli::SourcesArgs;
use crate::error::CliError;

use super::{CommandResult, Table};

#[derive(Debug, Serialize)]
struct SourceStatus {
    code: SourceCode,
    name: String,
    role: &'static str,
    priority: u32,
    base_url: String,
    capabilities: Vec<&'static str>,
    min_interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability: Option<SourceAvailability>,
}

#[derive(Debug, Serialize)]
struct SourcesResponseData {
    sources: Vec<SourceStatus>,
}

pub async fn run(args: &SourcesArgs, config: &EngineConfig) -> Result<CommandResult, CliError> {
    let service = config.build_service()?;

    let probed: Vec<(SourceMetadata, Option<SourceAvailability>)> = if args.offline {
        service
            .adapters()
            .iter()
            .chain(service.fallback())
            .map(|adapter| (adapter.metadata().clone(), None))
            .collect()
    } else {
        service
            .check_sources()
            .await
            .into_iter()
            .map(|(metadata, availability)| (metadata, Some(availability)))
            .collect()
    };

    let sources = probed
        .into_iter()
        .map(|(metadata, availability)| SourceStatus {
            role: role(&service, &metadata.code),
            capabilities: metadata.capabilities.supported(),
            min_interval_ms: metadata.rate_limit.min_interval_ms,
            code: metadata.code,
            name: metadata.name,
            priority: metadata.priority,
            base_url: metadata.base_url,
            availability,
        })
        .collect::<Vec<_>>();
    service.close().await;

    let mut warnings = Vec::new();
    let mut table = Table {
        headers: vec!["code", "role", "priority", "availability", "capabilities"],
        rows: Vec::with_capacity(sources.len()),
    };
    let mut items = Vec::with_capacity(sources.len());
    for source in &sources {
        if source.availability == Some(SourceAvailability::Unavailable) {
            warnings.push(format!("{} is unavailable", source.code));
        }
        table.rows.push(vec![
            source.code.to_string(),
            source.role.to_owned(),
            source.priority.to_string(),
            source
                .availability
                .map(availability_label)
                .unwrap_or("-")
                .to_owned(),
            source.capabilities.join(","),
        ]);
        items.push(serde_json::to_value(source)?);
    }

    let data = serde_json::to_value(SourcesResponseData { sources })?;
    Ok(warnings
        .into_iter()
        .fold(CommandResult::ok(data), CommandResult::with_warning)
        .with_items(items)
        .with_table(table))
}

fn role(service: &ConsolidationService, code: &SourceCode) -> &'static str {
    let is_fallback = service
        .fallback()
        .is_some_and(|fallback| fallback.code() == code);
    if is_fallback {
        "fallback"
    } else if service.config().primary_source.as_ref() == Some(code) {
        "primary"
    } else {
        "secondary"
    }
}

const fn availability_label(availability: SourceAvailability) -> &'static str {
    match availability {
        SourceAvailability::Available => "available",
        SourceAvailability::Degraded => "degraded",
        SourceAvailability::Unavailable => "unavailable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_listing_reports_roles_without_probing() {
        let result = run(&SourcesArgs { offline: true }, &EngineConfig::default())
            .await
            .expect("sources listed");

        let roles: Vec<_> = result
            .items
            .iter()
            .map(|item| (item["code"].as_str(), item["role"].as_str()))
            .collect();
        assert_eq!(
            roles,
            vec![
                (Some("pncp"), Some("primary")),
                (Some("compras_gov"), Some("secondary")),
                (Some("transparencia"), Some("fallback")),
            ]
        );
        assert!(result.items.iter().all(|item| item.get("availability").is_none()));
        assert!(result.warnings.is_empty());
    }
}
