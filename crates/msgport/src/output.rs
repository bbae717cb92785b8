use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Result of a command run, printable in every [`OutputFormat`].
pub trait Report: Serialize {
    /// Field names and display values, in print order.
    fn fields(&self) -> Vec<(&'static str, String)>;
}

pub fn print_report<R: Report>(report: &R, format: OutputFormat) {
    println!("{}", render(report, format));
}

fn render<R: Report>(report: &R, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (name, value) in report.fields() {
                table.add_row(vec![name.to_string(), value]);
            }
            table.to_string()
        }
        OutputFormat::Pretty => report
            .fields()
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" "),
        OutputFormat::Raw => report
            .fields()
            .into_iter()
            .map(|(_, value)| value)
            .collect::<Vec<_>>()
            .join("\t"),
    }
}
