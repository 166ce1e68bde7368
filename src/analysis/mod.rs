//! Post-CFG analyzers and the ordered runner that drives them.
//!
//! Analyzers run after data flow, in a fixed order. Each one reports
//! success or failure through its return value and contains its own
//! errors; a failing analyzer never aborts the pipeline.

pub mod call_graph;
pub mod data_structs;
pub mod resources;
pub mod state_vars;
pub mod structure;

use log::{debug, error};

use crate::Function;

/// One analysis pass over the recovered function set.
///
/// Implementations may annotate functions (variables, purposes, comments,
/// structures) but must not add or remove functions or rewrite CFGs.
pub trait Analyzer {
    fn name(&self) -> &'static str;

    /// Run the pass. Returns `false` on failure; the pass logs its own
    /// diagnostics either way.
    fn analyze(&mut self, functions: &mut [Function]) -> bool;
}

/// Run analyzers in order, logging failures. Returns the names of the
/// passes that failed.
pub fn run_analyzers(
    analyzers: &mut [Box<dyn Analyzer>],
    functions: &mut [Function],
) -> Vec<&'static str> {
    let mut failed = Vec::new();
    for analyzer in analyzers.iter_mut() {
        debug!("running {} analyzer", analyzer.name());
        if !analyzer.analyze(functions) {
            error!("{} analyzer failed, continuing", analyzer.name());
            failed.push(analyzer.name());
        }
    }
    failed
}
