//! Output formatters for decompilation reports.

mod csv;
mod dot;
mod json;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::pipeline::Report;
use crate::AnalysisError;

/// Supported output formats for decompilation reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text report (default)
    Text,
    /// JSON report
    Json,
    /// CSV function summary
    Csv,
    /// Graphviz call graph
    Dot,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Dot => write!(f, "dot"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "dot" | "graphviz" => Ok(OutputFormat::Dot),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
            OutputFormat::Dot => Box::new(DotFormatter),
        }
    }
}

/// Formatter trait for decompilation reports
pub trait ReportFormatter {
    fn format(&self, report: &Report) -> Result<String, AnalysisError>;
}

/// Format a report as readable text
pub struct TextFormatter;

/// Format a report as JSON
pub struct JsonFormatter;

/// Format a report as a CSV function summary
pub struct CsvFormatter;

/// Format a report's call graph in Graphviz dot syntax
pub struct DotFormatter;

impl ReportFormatter for TextFormatter {
    fn format(&self, report: &Report) -> Result<String, AnalysisError> {
        let mut output = String::new();

        output.push_str(&format!("Decompilation of {}\n\n", report.input));
        output.push_str(&report.header);
        output.push_str(&format!(
            "\n{} functions, {} strings\n",
            report.functions.len(),
            report.strings.len()
        ));
        if !report.failed_analyzers.is_empty() {
            output.push_str(&format!(
                "Failed analyzers: {}\n",
                report.failed_analyzers.join(", ")
            ));
        }
        output.push('\n');

        for func in &report.functions {
            output.push_str(&format!(
                "{} [0x{:X}..0x{:X}] complexity {}\n",
                func.name, func.start_address, func.end_address, func.complexity
            ));
            if let Some(purpose) = &func.purpose {
                output.push_str(&format!("  Purpose: {}\n", purpose));
            }
            for comment in &func.comments {
                output.push_str(&format!("  ; {}\n", comment));
            }
            for insn in &func.instructions {
                let bytes = insn
                    .bytes
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(" ");
                output.push_str(&format!(
                    "  0x{:08X}: {:<8} {:<28} ; {}\n",
                    insn.address, insn.mnemonic, insn.operands, bytes
                ));
            }
            output.push('\n');
        }

        Ok(output)
    }
}
