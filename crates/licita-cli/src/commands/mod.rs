mod fetch;
mod sources;

use licita_core::EngineConfig;
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// Columns printed by `--format table`.
#[derive(Debug, Default)]
pub struct Table {
    pub headers: Vec<&'static str>,
    pub rows: Vec<Vec<String>>,
}

pub struct CommandResult {
    pub data: Value,
    /// One entry per NDJSON line.
    pub items: Vec<Value>,
    pub summary: Vec<(&'static str, String)>,
    pub table: Table,
    pub warnings: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            items: Vec::new(),
            summary: Vec::new(),
            table: Table::default(),
            warnings: Vec::new(),
        }
    }

    pub fn with_items(mut self, items: Vec<Value>) -> Self {
        self.items = items;
        self
    }

    pub fn with_summary(mut self, key: &'static str, value: impl ToString) -> Self {
        self.summary.push((key, value.to_string()));
        self
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.table = table;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

pub async fn run(cli: &Cli) -> Result<CommandResult, CliError> {
    let config = load_config(cli)?;

    match &cli.command {
        Command::Fetch(args) => fetch::run(args, &config).await,
        Command::Sources(args) => sources::run(args, &config).await,
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig, CliError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load_default()?,
    };
    Ok(config)
}
