//! Graphviz call-graph formatter

use std::collections::BTreeSet;

use super::ReportFormatter;
use crate::pipeline::Report;
use crate::AnalysisError;

impl ReportFormatter for super::DotFormatter {
    fn format(&self, report: &Report) -> Result<String, AnalysisError> {
        let known: BTreeSet<_> = report.functions.iter().map(|f| f.start_address).collect();

        let mut output = String::from("digraph call_graph {\n");
        output.push_str("  rankdir=LR;\n  node [shape=box];\n");
        for func in &report.functions {
            let label = match &func.purpose {
                Some(purpose) => format!("{}\\n{}", func.name, purpose),
                None => func.name.clone(),
            };
            output.push_str(&format!("  \"{}\" [label=\"{}\"];\n", func.name, label));
        }
        for func in &report.functions {
            // one edge per callee even when called repeatedly
            let callees: BTreeSet<_> = func
                .calls
                .iter()
                .filter(|c| known.contains(c))
                .copied()
                .collect();
            for callee in callees {
                let target = report
                    .functions
                    .iter()
                    .find(|f| f.start_address == callee)
                    .map(|f| f.name.as_str())
                    .unwrap_or_default();
                output.push_str(&format!("  \"{}\" -> \"{}\";\n", func.name, target));
            }
        }
        output.push_str("}\n");
        Ok(output)
    }
}
