//! JSON output formatter

use super::ReportFormatter;
use crate::pipeline::Report;
use crate::AnalysisError;

impl ReportFormatter for super::JsonFormatter {
    fn format(&self, report: &Report) -> Result<String, AnalysisError> {
        serde_json::to_string_pretty(report)
            .map_err(|e| AnalysisError::Report(format!("JSON serialization error: {}", e)))
    }
}
