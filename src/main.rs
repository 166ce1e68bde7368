use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use retrodec::format::OutputFormat;
use retrodec::pipeline::{save_output, Decompiler, Options};

/// Decompiler for 16-bit DOS MZ executables
///
/// Disassembles the code segment, recovers functions, control flow and
/// variables, then annotates them with call-graph, structure, state and
/// resource analysis.
#[derive(Parser)]
#[command(name = "retrodec", version)]
struct Cli {
    /// MZ executable to decompile
    input: PathBuf,

    /// Directory to write the report files into
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Report format for stdout when no output directory is given
    #[arg(short, long, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Directory scanned for game resource files
    #[arg(long)]
    resource_dir: Option<PathBuf>,

    /// Also write a Graphviz call graph into the output directory
    #[arg(long)]
    visualize: bool,

    /// Skip call graph analysis
    #[arg(long)]
    no_call_graph: bool,

    /// Skip loop and conditional recovery
    #[arg(long)]
    no_structure: bool,

    /// Skip state variable analysis
    #[arg(long)]
    no_state_machine: bool,

    /// Skip array and struct recognition
    #[arg(long)]
    no_data_structures: bool,

    /// Skip resource file analysis
    #[arg(long)]
    no_resources: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let options = Options {
        call_graph: !cli.no_call_graph,
        structure: !cli.no_structure,
        state_machine: !cli.no_state_machine,
        data_structures: !cli.no_data_structures,
        resources: !cli.no_resources,
        resource_dir: cli
            .resource_dir
            .clone()
            .or_else(|| cli.input.parent().map(|p| p.to_path_buf())),
    };

    let decompiler = Decompiler::from_file(&cli.input, options)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let report = decompiler
        .decompile()
        .with_context(|| format!("failed to decompile {}", cli.input.display()))?;

    match cli.output {
        Some(dir) => save_output(&report, &dir, cli.visualize)
            .with_context(|| format!("failed to write report to {}", dir.display()))?,
        None => {
            let formatter = cli.format.get_formatter();
            print!("{}", formatter.format(&report)?);
        }
    }
    Ok(())
}
