use crate::cli::OutputFormat;
use crate::commands::{CommandResult, Table};
use crate::error::CliError;

pub fn render(result: &CommandResult, format: OutputFormat, pretty: bool) -> Result<(), CliError> {
    match format {
        OutputFormat::Json => {
            let payload = if pretty {
                serde_json::to_string_pretty(&result.data)?
            } else {
                serde_json::to_string(&result.data)?
            };
            println!("{payload}");
        }
        OutputFormat::Ndjson => {
            for item in &result.items {
                println!("{}", serde_json::to_string(item)?);
            }
        }
        OutputFormat::Table => render_table(result),
    }

    // Warnings go to stderr so stdout stays machine-readable.
    if format != OutputFormat::Table {
        for warning in &result.warnings {
            eprintln!("warning: {warning}");
        }
    }

    Ok(())
}

fn render_table(result: &CommandResult) {
    let key_width = result
        .summary
        .iter()
        .map(|(key, _)| key.len())
        .max()
        .unwrap_or_default();
    for (key, value) in &result.summary {
        println!("{key:<key_width$} : {value}");
    }

    if !result.warnings.is_empty() {
        println!("warnings:");
        for warning in &result.warnings {
            println!("  - {warning}");
        }
    }

    if !result.table.rows.is_empty() {
        if !result.summary.is_empty() {
            println!();
        }
        for line in format_table(&result.table) {
            println!("{line}");
        }
    }
}

fn format_table(table: &Table) -> Vec<String> {
    let mut widths = table.headers.iter().map(|h| h.chars().count()).collect::<Vec<_>>();
    for row in &table.rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut lines = Vec::with_capacity(table.rows.len() + 1);
    lines.push(format_row(table.headers.iter().copied(), &widths));
    for row in &table.rows {
        lines.push(format_row(row.iter().map(String::as_str), &widths));
    }
    lines
}

fn format_row<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    cells
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_owned()
}
