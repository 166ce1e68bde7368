//! End-to-end decompilation pipeline.
//!
//! Parse, sweep, assemble functions, build CFGs, run data flow, then run
//! the enabled analyzers in a fixed order. Only a parse failure aborts;
//! analyzer failures are logged and recorded in the report.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;

use crate::analysis::call_graph::CallGraphAnalyzer;
use crate::analysis::data_structs::DataStructAnalyzer;
use crate::analysis::resources::ResourceAnalyzer;
use crate::analysis::state_vars::StateVarAnalyzer;
use crate::analysis::structure::StructureAnalyzer;
use crate::analysis::{run_analyzers, Analyzer};
use crate::assemble::assemble_functions;
use crate::cfg::build_cfg;
use crate::dataflow::DataFlowAnalyzer;
use crate::decoder::Real16Decoder;
use crate::format::{CsvFormatter, DotFormatter, JsonFormatter, ReportFormatter};
use crate::parser::MzParser;
use crate::sweep::sweep;
use crate::{Address, AnalysisError, Function};

/// Analyzer toggles and inputs for one decompilation run.
#[derive(Debug, Clone)]
pub struct Options {
    pub call_graph: bool,
    pub structure: bool,
    pub state_machine: bool,
    pub data_structures: bool,
    pub resources: bool,
    /// Directory scanned for resource files next to the executable
    pub resource_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            call_graph: true,
            structure: true,
            state_machine: true,
            data_structures: true,
            resources: true,
            resource_dir: None,
        }
    }
}

/// Everything a run produced, ready for formatting.
#[derive(Debug, Serialize)]
pub struct Report {
    pub input: String,
    pub file_size: usize,
    pub entry_point: Address,
    /// Human-readable MZ header dump
    pub header: String,
    pub functions: Vec<Function>,
    pub strings: BTreeMap<Address, String>,
    /// Names of analyzers that failed during the run
    pub failed_analyzers: Vec<String>,
}

/// Drives one executable through the full pipeline.
pub struct Decompiler {
    image: Vec<u8>,
    input: String,
    options: Options,
}

impl Decompiler {
    pub fn new(image: Vec<u8>, input: &str, options: Options) -> Self {
        Self {
            image,
            input: input.to_string(),
            options,
        }
    }

    pub fn from_file(path: &Path, options: Options) -> Result<Self, AnalysisError> {
        let image = fs::read(path)?;
        Ok(Self::new(image, &path.display().to_string(), options))
    }

    pub fn decompile(&self) -> Result<Report, AnalysisError> {
        let parsed = MzParser::new().parse(&self.image)?;
        info!(
            "{}: {} bytes, entry 0x{:X}",
            self.input, parsed.file_size, parsed.entry_point
        );

        let decoder =
            Real16Decoder::new().map_err(|e| AnalysisError::Decoder(e.to_string()))?;
        let segment = parsed.code_segment();
        let result = sweep(&self.image, segment, parsed.entry_point, &decoder);
        let segment_end = segment.start + segment.size as Address;
        let mut functions = assemble_functions(&result, parsed.entry_point, segment_end);
        info!("assembled {} functions", functions.len());

        for func in &mut functions {
            build_cfg(func);
            let variables = DataFlowAnalyzer::new(func).analyze();
            func.variables = variables;
        }

        let mut analyzers: Vec<Box<dyn Analyzer>> = Vec::new();
        if self.options.call_graph {
            analyzers.push(Box::new(CallGraphAnalyzer::new()));
        }
        if self.options.structure {
            analyzers.push(Box::new(StructureAnalyzer::new()));
        }
        if self.options.state_machine {
            analyzers.push(Box::new(StateVarAnalyzer::new()));
        }
        if self.options.data_structures {
            analyzers.push(Box::new(DataStructAnalyzer::new()));
        }
        if self.options.resources {
            analyzers.push(Box::new(ResourceAnalyzer::new(
                parsed.strings.clone(),
                self.options.resource_dir.clone(),
            )));
        }
        let failed = run_analyzers(&mut analyzers, &mut functions);

        Ok(Report {
            input: self.input.clone(),
            file_size: parsed.file_size,
            entry_point: parsed.entry_point,
            header: parsed.header_report(),
            functions,
            strings: parsed.strings,
            failed_analyzers: failed.iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// Write the standard report file set into `dir`.
///
/// Emits `header.txt`, `disassembly.asm`, `strings.txt`, `functions.json`
/// and `functions.csv`; `call_graph.dot` only when `visualize` is set.
pub fn save_output(report: &Report, dir: &Path, visualize: bool) -> Result<(), AnalysisError> {
    fs::create_dir_all(dir)?;

    fs::write(dir.join("header.txt"), &report.header)?;

    let mut asm = String::new();
    for func in &report.functions {
        for comment in &func.comments {
            asm.push_str(&format!("; {}\n", comment));
        }
        asm.push_str(&format!("{}:\n", func.name));
        for insn in &func.instructions {
            asm.push_str(&format!(
                "    0x{:08X}  {:<8} {}\n",
                insn.address, insn.mnemonic, insn.operands
            ));
        }
        asm.push('\n');
    }
    fs::write(dir.join("disassembly.asm"), asm)?;

    let mut strings = String::new();
    for (addr, string) in &report.strings {
        strings.push_str(&format!("0x{:08X}: {}\n", addr, string));
    }
    fs::write(dir.join("strings.txt"), strings)?;

    fs::write(dir.join("functions.json"), JsonFormatter.format(report)?)?;
    fs::write(dir.join("functions.csv"), CsvFormatter.format(report)?)?;
    if visualize {
        fs::write(dir.join("call_graph.dot"), DotFormatter.format(report)?)?;
    }
    info!("report written to {}", dir.display());
    Ok(())
}
