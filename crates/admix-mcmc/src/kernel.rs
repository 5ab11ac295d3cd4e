use std::path::{Path, PathBuf};

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_core::VariableId;
use admix_dag::Model;
use log::info;

use crate::chain::OperatorSummary;
use crate::checkpoint::{self, CheckpointPayload};
use crate::config::{McmcConfig, OutputConfig};
use crate::manifest::{timestamp, RunManifest};
use crate::metrics::{self, ParameterSummary};
use crate::monitors::{
    BipartitionMonitor, FileMonitor, ScreenMonitor, Trace, TraceHandle, TraceRecorder, TreeMonitor,
};
use crate::moves::Move;
use crate::tempering::ParallelMcmcmc;

/// Variables that monitors record.
#[derive(Debug, Clone, Default)]
pub struct MonitorTargets {
    /// Variables written to the parameter trace.
    pub traced: Vec<VariableId>,
    /// Tree variable written to the tree trace.
    pub tree: Option<VariableId>,
}

/// Outcome of [`run`] or [`resume`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Generations completed, burn-in included.
    pub generations: u64,
    /// Log-posterior of the final state of the active chain.
    pub final_ln_posterior: f64,
    /// Operator counters of the active chain.
    pub operators: Vec<OperatorSummary>,
    /// Heat-swap acceptance rate when more than one chain ran.
    pub swap_acceptance: Option<f64>,
    /// Mean, variance and ESS of every traced column.
    pub parameters: Vec<ParameterSummary>,
    /// Canonical hash of the final tree.
    pub final_tree_hash: Option<String>,
    /// Samples recorded at the trace cadence.
    pub trace: Trace,
    /// Parameter trace file.
    pub trace_path: Option<PathBuf>,
    /// Tree trace file.
    pub tree_path: Option<PathBuf>,
    /// Manifest file.
    pub manifest_path: Option<PathBuf>,
    /// Retained checkpoint files.
    pub checkpoints: Vec<PathBuf>,
    /// Operator table as printed at the end of the run.
    pub operator_table: String,
}

/// Builds an ensemble from `config` and runs burn-in and sampling.
pub fn run(
    config: &McmcConfig,
    model: Model,
    moves: Vec<Box<dyn Move>>,
    targets: &MonitorTargets,
) -> Result<RunSummary, AdmixError> {
    config.validate()?;
    let seed = config.seed_policy.master_seed;
    let ensemble = build_ensemble(config, model, moves, seed)?;
    run_with_ensemble(config, seed, ensemble, targets)
}

/// Resumes a run from a checkpoint file using the same model and moves.
pub fn resume(
    path: &Path,
    model: Model,
    moves: Vec<Box<dyn Move>>,
    targets: &MonitorTargets,
) -> Result<RunSummary, AdmixError> {
    let payload = CheckpointPayload::load(path)?;
    if payload.chains.is_empty() {
        return Err(AdmixError::Serde(
            ErrorInfo::new("empty-checkpoint", "checkpoint contained no chains")
                .with_context("path", path.display().to_string()),
        ));
    }
    let config = payload.config.clone();
    let mut ensemble = build_ensemble(&config, model, moves, payload.master_seed)?;
    checkpoint::restore_payload(&mut ensemble, &payload)?;
    info!("resuming from {} at generation {}", path.display(), payload.generation);
    run_with_ensemble(&config, payload.master_seed, ensemble, targets)
}

fn build_ensemble(
    config: &McmcConfig,
    model: Model,
    moves: Vec<Box<dyn Move>>,
    seed: u64,
) -> Result<ParallelMcmcmc, AdmixError> {
    let verify_interval = config.verify_interval;
    let moves_per_generation = config.moves_per_generation;
    let ensemble = ParallelMcmcmc::new(model, moves, &config.tempering, seed)?.map_chains(|chain| {
        let chain = chain.with_verify_interval(verify_interval);
        match moves_per_generation {
            Some(count) => chain.with_moves_per_generation(count),
            None => chain,
        }
    });
    Ok(ensemble)
}

fn run_with_ensemble(
    config: &McmcConfig,
    seed: u64,
    ensemble: ParallelMcmcmc,
    targets: &MonitorTargets,
) -> Result<RunSummary, AdmixError> {
    let layout = resolve_output_paths(&config.output);
    let (mut ensemble, trace) = attach_monitors(ensemble, config, targets, &layout);
    let start = ensemble.generation();

    let remaining_burn_in = config.burn_in.saturating_sub(start);
    if remaining_burn_in > 0 {
        ensemble.burnin(remaining_burn_in, config.tuning_interval)?;
    }

    let total = config.burn_in + config.generations;
    let checkpoint_dir = config
        .checkpoint
        .directory
        .clone()
        .or_else(|| layout.checkpoint_dir.clone());
    let mut checkpoints = Vec::new();
    while ensemble.generation() < total {
        let generation = ensemble.generation();
        let mut segment = total - generation;
        if config.checkpoint.interval > 0 && checkpoint_dir.is_some() {
            let interval = config.checkpoint.interval;
            segment = segment.min(interval - generation % interval);
        }
        ensemble.run(segment)?;
        let generation = ensemble.generation();
        if let Some(dir) = &checkpoint_dir {
            if config.checkpoint.interval > 0 && generation % config.checkpoint.interval == 0 {
                let path = checkpoint::checkpoint_path(dir, generation);
                checkpoint::build_payload(&ensemble, config, seed)?.store(&path)?;
                checkpoints.push(path);
                checkpoint::enforce_checkpoint_retention(
                    &mut checkpoints,
                    config.checkpoint.max_to_keep,
                )?;
            }
        }
    }

    let cold = ensemble.cold_chain();
    let final_tree_hash = match targets.tree {
        Some(tree) => Some(cold.model().tree(tree)?.canonical_hash()?),
        None => None,
    };
    let operators = ensemble.operator_summary();
    let swap_acceptance = (ensemble.chains().len() > 1).then(|| ensemble.swap_counters().rate());
    let mut table = Vec::new();
    ensemble.print_operator_summary(&mut table)?;
    let operator_table = String::from_utf8_lossy(&table).into_owned();
    info!("operator summary\n{operator_table}");

    let trace = trace.snapshot();
    let parameters = metrics::summarize(&trace);

    let manifest_path = if let Some(run_dir) = layout.run_directory.clone() {
        let path = run_dir.join(&config.output.manifest_file);
        let relative = |path: &Option<PathBuf>| {
            path.as_ref()
                .and_then(|path| path.strip_prefix(&run_dir).ok())
                .map(Path::to_path_buf)
        };
        let tree_file = layout.tree_file.clone().filter(|_| targets.tree.is_some());
        let manifest = RunManifest {
            config: config.clone(),
            master_seed: seed,
            seed_label: config.seed_policy.label.clone(),
            created_at: timestamp(),
            generations: ensemble.generation(),
            final_ln_posterior: cold.ln_posterior(),
            final_tree_hash: final_tree_hash.clone(),
            operators: operators.clone(),
            swap_acceptance,
            trace_file: relative(&layout.trace_file),
            tree_file: relative(&tree_file),
            checkpoints: checkpoints
                .iter()
                .map(|path| {
                    path.strip_prefix(&run_dir)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|_| path.clone())
                })
                .collect(),
        };
        manifest.write(&path)?;
        Some(path)
    } else {
        None
    };

    Ok(RunSummary {
        generations: ensemble.generation(),
        final_ln_posterior: cold.ln_posterior(),
        operators,
        swap_acceptance,
        parameters,
        final_tree_hash,
        trace,
        trace_path: layout.trace_file.clone(),
        tree_path: layout.tree_file.clone().filter(|_| targets.tree.is_some()),
        manifest_path,
        checkpoints,
        operator_table,
    })
}

fn attach_monitors(
    mut ensemble: ParallelMcmcmc,
    config: &McmcConfig,
    targets: &MonitorTargets,
    layout: &ResolvedOutput,
) -> (ParallelMcmcmc, TraceHandle) {
    let recorder = TraceRecorder::new(config.monitor.trace_interval, targets.traced.clone());
    let handle = recorder.handle();
    ensemble = ensemble
        .with_monitor(Box::new(recorder))
        .with_monitor(Box::new(ScreenMonitor::new(
            config.monitor.screen_interval,
            targets.traced.clone(),
        )));
    if let Some(path) = &layout.trace_file {
        ensemble = ensemble.with_monitor(Box::new(FileMonitor::new(
            path.clone(),
            config.monitor.trace_interval,
            targets.traced.clone(),
        )));
    }
    if let (Some(path), Some(tree)) = (&layout.tree_file, targets.tree) {
        ensemble = ensemble.with_monitor(Box::new(TreeMonitor::new(
            path.clone(),
            config.monitor.tree_interval,
            tree,
        )));
    }
    if let (Some(path), Some(tree)) = (&layout.bipartition_file, targets.tree) {
        ensemble = ensemble.with_monitor(Box::new(BipartitionMonitor::new(
            path.clone(),
            config.monitor.tree_interval,
            tree,
        )));
    }
    (ensemble, handle)
}

#[derive(Default)]
struct ResolvedOutput {
    run_directory: Option<PathBuf>,
    trace_file: Option<PathBuf>,
    tree_file: Option<PathBuf>,
    bipartition_file: Option<PathBuf>,
    checkpoint_dir: Option<PathBuf>,
}

fn resolve_output_paths(config: &OutputConfig) -> ResolvedOutput {
    match &config.run_directory {
        None => ResolvedOutput::default(),
        Some(run_dir) => ResolvedOutput {
            run_directory: Some(run_dir.clone()),
            trace_file: Some(run_dir.join(&config.trace_file)),
            tree_file: Some(run_dir.join(&config.tree_file)),
            bipartition_file: Some(run_dir.join(&config.bipartition_file)),
            checkpoint_dir: Some(run_dir.join(&config.checkpoint_dir)),
        },
    }
}
