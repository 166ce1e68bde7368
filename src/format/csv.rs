//! CSV function-summary formatter

use super::ReportFormatter;
use crate::pipeline::Report;
use crate::AnalysisError;

impl ReportFormatter for super::CsvFormatter {
    fn format(&self, report: &Report) -> Result<String, AnalysisError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record([
                "name",
                "start",
                "end",
                "instructions",
                "complexity",
                "calls",
                "recursive",
                "purpose",
            ])
            .map_err(|e| AnalysisError::Report(format!("CSV error: {}", e)))?;

        for func in &report.functions {
            let calls = func
                .calls
                .iter()
                .map(|c| format!("0x{:X}", c))
                .collect::<Vec<_>>()
                .join(" ");
            writer
                .write_record([
                    func.name.clone(),
                    format!("0x{:X}", func.start_address),
                    format!("0x{:X}", func.end_address),
                    func.instructions.len().to_string(),
                    func.complexity.to_string(),
                    calls,
                    func.is_recursive.to_string(),
                    func.purpose.clone().unwrap_or_default(),
                ])
                .map_err(|e| AnalysisError::Report(format!("CSV error: {}", e)))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| AnalysisError::Report(format!("CSV error: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| AnalysisError::Report(format!("CSV error: {}", e)))
    }
}
