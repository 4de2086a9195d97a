use anyhow::{Context, Result};
use chimera_diagram::Diagram;
use chimera_expr::StructuralOracle;
use chimera_synth::{ModuleCountRanking, SynthConfig, Synthesizer};
use chimera_targets::default_targets;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CHIMERA - retargetable network-function synthesis
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize execution plans from a decision diagram
    Synth {
        /// Decision diagram (JSON)
        diagram: PathBuf,

        /// Output directory for plan reports
        #[arg(short, long, default_value = "build")]
        output: PathBuf,

        /// Keep at most this many finished plans
        #[arg(long, default_value_t = 64)]
        max_plans: usize,

        /// Sweep the search worklist on a thread pool
        #[arg(long)]
        parallel: bool,
    },

    /// Parse and summarize a diagram without synthesizing
    Inspect {
        /// Decision diagram (JSON)
        diagram: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Synth {
            diagram,
            output,
            max_plans,
            parallel,
        } => synth(&diagram, &output, max_plans, parallel),
        Commands::Inspect { diagram } => inspect(&diagram),
    }
}

fn load_diagram(path: &PathBuf) -> Result<Diagram> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading diagram {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing diagram {}", path.display()))
}

fn synth(path: &PathBuf, output: &PathBuf, max_plans: usize, parallel: bool) -> Result<()> {
    let diagram = load_diagram(path)?;
    info!(name = %diagram.name, nodes = diagram.len(), "loaded diagram");

    let oracle = StructuralOracle::new();
    let synthesizer = Synthesizer::new(default_targets()).with_config(SynthConfig {
        max_plans,
        parallel,
        ..SynthConfig::default()
    });
    let plans = synthesizer.synthesize(diagram, &oracle)?;
    if plans.is_empty() {
        anyhow::bail!("no target combination covers the diagram");
    }

    let ranked = synthesizer.rank(&plans, &ModuleCountRanking);
    fs::create_dir_all(output)
        .with_context(|| format!("creating output directory {}", output.display()))?;
    for (rank, (score, report)) in ranked.iter().enumerate() {
        let file = output.join(format!("plan_{:03}.json", rank));
        fs::write(&file, serde_json::to_string_pretty(report)?)
            .with_context(|| format!("writing {}", file.display()))?;
        info!(
            rank,
            score,
            modules = report.module_count(),
            targets = report.targets.len(),
            plan = %file.display(),
            "plan written"
        );
    }
    info!(plans = ranked.len(), "synthesis finished");
    Ok(())
}

fn inspect(path: &PathBuf) -> Result<()> {
    let diagram = load_diagram(path)?;
    let root = diagram.root()?;
    let mut calls = 0usize;
    let mut branches = 0usize;
    let mut returns = 0usize;
    for node in diagram.iter() {
        match &node.kind {
            chimera_diagram::NodeKind::Call(_) => calls += 1,
            chimera_diagram::NodeKind::Branch(_) => branches += 1,
            chimera_diagram::NodeKind::Return(_) => returns += 1,
        }
    }
    println!(
        "{}: {} nodes (root {}), {} calls, {} branches, {} returns",
        diagram.name,
        diagram.len(),
        root,
        calls,
        branches,
        returns
    );
    Ok(())
}
