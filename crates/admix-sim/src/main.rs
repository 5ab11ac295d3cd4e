use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use admix_mcmc::{resume, run, RunSummary};
use clap::{Args as ClapArgs, Parser, Subcommand};
use log::info;
use serde_json::json;

mod demo;

use demo::DemoConfig;

#[derive(Parser, Debug)]
#[command(name = "admix-sim", about = "Admixture-graph MCMC sampler CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample a birth-death admixture model described by a YAML file.
    Run(RunArgs),
    /// Continue a run from a checkpoint file.
    Resume(ResumeArgs),
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// YAML configuration with `model`, `moves` and `mcmc` sections.
    #[arg(long)]
    config: PathBuf,
    /// Overrides `mcmc.seed_policy.master_seed`.
    #[arg(long)]
    seed: Option<u64>,
    /// Output directory for run artefacts.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct ResumeArgs {
    /// Checkpoint written by an earlier run.
    #[arg(long)]
    checkpoint: PathBuf,
    /// Configuration the checkpointed run was started from.
    #[arg(long)]
    config: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_sampler(args),
        Command::Resume(args) => resume_sampler(args),
    }
}

fn run_sampler(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.config, args.seed, args.out.as_deref())?;
    let seed = config.mcmc.seed_policy.master_seed;
    let problem = demo::build(&config.model, &config.moves, seed)?;
    info!("sampling {} taxa with master seed {seed}", config.model.taxa.len());

    let summary = run(&config.mcmc, problem.model, problem.moves, &problem.targets)?;
    report(&summary, config.mcmc.output.run_directory.as_deref())?;

    if let Some(out) = &config.mcmc.output.run_directory {
        fs::copy(&args.config, out.join("config.yaml")).ok();
    }
    Ok(())
}

fn resume_sampler(args: ResumeArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.config, None, None)?;
    let problem = demo::build(
        &config.model,
        &config.moves,
        config.mcmc.seed_policy.master_seed,
    )?;
    info!("resuming from {}", args.checkpoint.display());

    let summary = resume(&args.checkpoint, problem.model, problem.moves, &problem.targets)?;
    let out = summary
        .manifest_path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    report(&summary, out.as_deref())
}

fn load_config(
    path: &Path,
    seed: Option<u64>,
    out_dir: Option<&Path>,
) -> Result<DemoConfig, Box<dyn Error>> {
    let mut config = DemoConfig::load(path)?;
    if let Some(seed) = seed {
        config.mcmc.seed_policy.master_seed = seed;
    }
    if let Some(out) = out_dir {
        fs::create_dir_all(out)?;
        config.mcmc.output.run_directory = Some(out.to_path_buf());
    }
    Ok(config)
}

fn report(summary: &RunSummary, out: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    write!(handle, "{}", summary.operator_table)?;
    writeln!(handle, "{:<20} {:>12} {:>12} {:>10}", "parameter", "mean", "sd", "ess")?;
    for parameter in &summary.parameters {
        writeln!(
            handle,
            "{:<20} {:>12.5} {:>12.5} {:>10.1}",
            parameter.name,
            parameter.mean,
            parameter.variance.sqrt(),
            parameter.ess
        )?;
    }
    if let Some(rate) = summary.swap_acceptance {
        writeln!(handle, "heat-swap acceptance: {rate:.3}")?;
    }

    let Some(out) = out else {
        return Ok(());
    };
    admix_mcmc::metrics::write_csv(&summary.trace, out.join("trace.csv"))?;
    let payload = json!({
        "generations": summary.generations,
        "final_ln_posterior": summary.final_ln_posterior,
        "final_tree_hash": summary.final_tree_hash,
        "swap_acceptance": summary.swap_acceptance,
        "operators": summary.operators,
        "parameters": summary.parameters,
    });
    write_json(out.join("summary.json"), &payload)
}

fn write_json<P: AsRef<Path>, T: serde::Serialize>(
    path: P,
    value: &T,
) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}
