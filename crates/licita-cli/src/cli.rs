//! CLI argument definitions for licita.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fetch` | Consolidate tenders from every enabled source |
//! | `sources` | List sources with a live health probe |
//!
//! # Examples
//!
//! ```bash
//! # One week of tenders in São Paulo and Rio de Janeiro
//! licita fetch --from 2024-03-01 --to 2024-03-07 --uf SP --uf RJ --pretty
//!
//! # Fail the run if any source degraded
//! licita fetch --from 2024-03-01 --to 2024-03-01 --strict
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Consolidated Brazilian public procurement search.
///
/// Queries PNCP, Compras.gov.br and Portal da Transparência concurrently and
/// prints one deduplicated result set.
#[derive(Debug, Parser)]
#[command(name = "licita", author, version, about = "Multi-source procurement search")]
pub struct Cli {
    /// Output format for results.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Treat a partial result as a failure (exit code 5).
    #[arg(long, global = true, default_value_t = false)]
    pub strict: bool,

    /// Engine config file. Defaults to $LICITA_CONFIG, then built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary.
    Table,
    /// Single JSON object.
    Json,
    /// One JSON record per line.
    Ndjson,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch and consolidate tenders published in a date range.
    Fetch(FetchArgs),
    /// List configured sources, their capabilities and a live health probe.
    Sources(SourcesArgs),
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// First publication date (YYYY-MM-DD).
    #[arg(long)]
    pub from: String,

    /// Last publication date (YYYY-MM-DD), inclusive.
    #[arg(long)]
    pub to: String,

    /// UF filter; repeat for several states. Omit for the whole country.
    #[arg(long = "uf")]
    pub states: Vec<String>,

    /// Override the configured page size.
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Stop paginating each query dimension after this many pages.
    #[arg(long)]
    pub max_pages: Option<u32>,

    /// Modality codes to query (PNCP numbering); repeatable.
    #[arg(long = "modality")]
    pub modalities: Vec<u16>,

    /// Free-text filter, sent only to sources that can filter by keyword.
    #[arg(long)]
    pub keyword: Option<String>,
}

#[derive(Debug, Args)]
pub struct SourcesArgs {
    /// Skip the live health probes.
    #[arg(long, default_value_t = false)]
    pub offline: bool,
}
