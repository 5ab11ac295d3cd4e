use std::fs;
use std::path::{Path, PathBuf};

use admix_core::{AdmixError, NodeId, VariableId};
use admix_dag::{BirthDeathDensity, ExponentialDensity, Model};
use admix_tree::{AdmixtureTree, BirthDeathProcess, TreeBuilder};
use tempfile::tempdir;

use admix_mcmc::checkpoint::{checkpoint_path, enforce_checkpoint_retention, CheckpointPayload};
use admix_mcmc::manifest::RunManifest;
use admix_mcmc::{
    resume, run, AdmixtureEdgeAdd, AdmixtureEdgeRemove, AdmixtureEdgeReweight, McmcConfig,
    MonitorTargets, Move, NodeTimeSlideBeta, ScaleMove, SwapMode,
};

fn admixed_quartet() -> AdmixtureTree {
    let mut builder = TreeBuilder::new();
    let a = builder.tip("A", 0.0);
    let b = builder.tip("B", 0.0);
    let c = builder.tip("C", 0.0);
    let d = builder.tip("D", 0.0);
    let ab = builder.join(0.4, a, b).unwrap();
    let cd = builder.join(0.6, c, d).unwrap();
    let root = builder.join(1.0, ab, cd).unwrap();
    let mut tree = builder.finish(root).unwrap();
    tree.add_admixture_edge(NodeId::from_raw(4), NodeId::from_raw(2), 0.5, 0.3)
        .unwrap();
    tree
}

fn sample_problem() -> (Model, Vec<Box<dyn Move>>, MonitorTargets) {
    let taxa = ["A", "B", "C", "D"].iter().map(|t| t.to_string()).collect();
    let process = BirthDeathProcess::new(taxa).unwrap();
    let mut model = Model::new();
    let one = model.add_constant("one", 1.0).unwrap();
    let five = model.add_constant("five", 5.0).unwrap();
    let diversification: VariableId = model
        .add_stochastic("diversification", ExponentialDensity::scalar(), &[one], 1.0)
        .unwrap();
    let turnover = model
        .add_stochastic("turnover", ExponentialDensity::scalar(), &[five], 0.1)
        .unwrap();
    let tree = model
        .add_stochastic(
            "tree",
            BirthDeathDensity::new(process),
            &[diversification, turnover],
            admixed_quartet(),
        )
        .unwrap();
    let moves: Vec<Box<dyn Move>> = vec![
        Box::new(ScaleMove::new(diversification, 1.0, 1.0)),
        Box::new(ScaleMove::new(turnover, 1.0, 1.0)),
        Box::new(NodeTimeSlideBeta::new(tree, 10.0, 1.0)),
        Box::new(AdmixtureEdgeAdd::new(tree, 2, 0.5)),
        Box::new(AdmixtureEdgeRemove::new(tree, 0.5)),
        Box::new(AdmixtureEdgeReweight::new(tree, 5.0, 1.0)),
    ];
    let targets = MonitorTargets {
        traced: vec![diversification, turnover, tree],
        tree: Some(tree),
    };
    (model, moves, targets)
}

fn checkpoint_config(root: &Path) -> McmcConfig {
    let mut config = McmcConfig::default();
    config.generations = 200;
    config.burn_in = 20;
    config.tuning_interval = 10;
    config.checkpoint.interval = 50;
    config.checkpoint.max_to_keep = 2;
    config.output.run_directory = Some(root.to_path_buf());
    config.monitor.trace_interval = 10;
    config.monitor.tree_interval = 20;
    config.monitor.screen_interval = 0;
    config.seed_policy.master_seed = 1234;
    config.seed_policy.label = Some("checkpoint-test".to_string());
    config
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path).unwrap().lines().count()
}

#[test]
fn run_writes_traces_checkpoints_and_manifest() {
    let dir = tempdir().unwrap();
    let config = checkpoint_config(dir.path());
    let (model, moves, targets) = sample_problem();
    let summary = run(&config, model, moves, &targets).unwrap();

    assert_eq!(summary.generations, 220);
    assert_eq!(summary.trace.samples.len(), 21);
    assert_eq!(
        summary.trace.names,
        vec!["diversification", "turnover", "tree"]
    );
    assert_eq!(summary.parameters.len(), 3);
    assert!(summary.swap_acceptance.is_none());

    let trace_path = summary.trace_path.clone().unwrap();
    let trace = fs::read_to_string(&trace_path).unwrap();
    let header = trace.lines().next().unwrap();
    assert_eq!(
        header,
        "Iteration\tPosterior\tLikelihood\tPrior\tdiversification\tturnover\ttree"
    );
    assert_eq!(line_count(&trace_path), 22);
    let tree_path = summary.tree_path.clone().unwrap();
    assert_eq!(line_count(&tree_path), 12);
    assert_eq!(line_count(&dir.path().join("bipartitions.tsv")), 12);

    let expected: Vec<PathBuf> = [150, 200]
        .iter()
        .map(|&generation| checkpoint_path(&dir.path().join("checkpoints"), generation))
        .collect();
    assert_eq!(summary.checkpoints, expected);
    assert!(expected.iter().all(|path| path.exists()));
    assert!(!checkpoint_path(&dir.path().join("checkpoints"), 100).exists());

    let manifest = RunManifest::load(&summary.manifest_path.clone().unwrap()).unwrap();
    assert_eq!(manifest.config, config);
    assert_eq!(manifest.master_seed, 1234);
    assert_eq!(manifest.seed_label.as_deref(), Some("checkpoint-test"));
    assert_eq!(manifest.generations, 220);
    assert_eq!(manifest.trace_file, Some(PathBuf::from("trace.tsv")));
    assert_eq!(manifest.tree_file, Some(PathBuf::from("trees.tsv")));
    assert_eq!(
        manifest.checkpoints,
        vec![
            PathBuf::from("checkpoints/ckpt_000150.json"),
            PathBuf::from("checkpoints/ckpt_000200.json"),
        ]
    );
    assert_eq!(manifest.final_tree_hash, summary.final_tree_hash);
    assert_eq!(manifest.operators, summary.operators);
    assert!(summary.operator_table.contains("admixture-edge-reweight"));
}

#[test]
fn runs_are_reproducible_for_a_fixed_seed() {
    let mut config = McmcConfig::default();
    config.generations = 120;
    config.burn_in = 30;
    config.monitor.screen_interval = 0;
    let (model, moves, targets) = sample_problem();
    let first = run(&config, model, moves, &targets).unwrap();
    let (model, moves, targets) = sample_problem();
    let second = run(&config, model, moves, &targets).unwrap();
    assert_eq!(first.final_ln_posterior.to_bits(), second.final_ln_posterior.to_bits());
    assert_eq!(first.final_tree_hash, second.final_tree_hash);
    assert_eq!(first.trace, second.trace);
    assert!(first.trace_path.is_none());
    assert!(first.manifest_path.is_none());
    assert!(first.checkpoints.is_empty());
}

#[test]
fn resume_continues_to_the_configured_length() {
    let dir = tempdir().unwrap();
    let config = checkpoint_config(dir.path());
    let (model, moves, targets) = sample_problem();
    let summary = run(&config, model, moves, &targets).unwrap();
    let checkpoint = summary.checkpoints[0].clone();

    let payload = CheckpointPayload::load(&checkpoint).unwrap();
    assert_eq!(payload.generation, 150);
    assert_eq!(payload.master_seed, 1234);
    assert_eq!(payload.chains.len(), 1);
    assert!(payload.chains[0].values.contains_key("tree"));
    assert!(!payload.chains[0].values.contains_key("one"));
    assert_eq!(payload.chains[0].tuning.len(), 6);

    let (model, moves, targets) = sample_problem();
    let first = resume(&checkpoint, model, moves, &targets).unwrap();
    let (model, moves, targets) = sample_problem();
    let second = resume(&checkpoint, model, moves, &targets).unwrap();
    assert_eq!(first.generations, 220);
    assert_eq!(first.trace.samples.first().unwrap().generation, 150);
    assert_eq!(first.final_ln_posterior.to_bits(), second.final_ln_posterior.to_bits());
    assert_eq!(first.final_tree_hash, second.final_tree_hash);
}

#[test]
fn tempered_runs_report_swap_acceptance() {
    let mut config = McmcConfig::default();
    config.generations = 100;
    config.monitor.screen_interval = 0;
    config.tempering.chains = 3;
    config.tempering.swap_interval = 5;
    config.tempering.swap_mode = SwapMode::Random;
    let (model, moves, targets) = sample_problem();
    let summary = run(&config, model, moves, &targets).unwrap();
    let rate = summary.swap_acceptance.unwrap();
    assert!((0.0..=1.0).contains(&rate));
    assert!(summary.operator_table.contains("swaps: tried 20"));
}

#[test]
fn payload_survives_a_disk_round_trip() {
    let dir = tempdir().unwrap();
    let mut config = checkpoint_config(dir.path());
    config.generations = 50;
    config.burn_in = 0;
    let (model, moves, targets) = sample_problem();
    let summary = run(&config, model, moves, &targets).unwrap();
    let path = summary.checkpoints.last().unwrap();
    let payload = CheckpointPayload::load(path).unwrap();
    let copy = dir.path().join("copy.json");
    payload.store(&copy).unwrap();
    assert_eq!(CheckpointPayload::load(&copy).unwrap(), payload);
}

#[test]
fn retention_drops_the_oldest_files() {
    let dir = tempdir().unwrap();
    let mut paths = Vec::new();
    for generation in [10, 20, 30] {
        let path = checkpoint_path(dir.path(), generation);
        fs::write(&path, "{}").unwrap();
        paths.push(path);
    }
    enforce_checkpoint_retention(&mut paths, 2).unwrap();
    assert_eq!(paths.len(), 2);
    assert!(!checkpoint_path(dir.path(), 10).exists());
    assert!(checkpoint_path(dir.path(), 30).exists());
}

#[test]
fn missing_checkpoint_is_a_read_error() {
    let dir = tempdir().unwrap();
    let (model, moves, targets) = sample_problem();
    let err = resume(&dir.path().join("absent.json"), model, moves, &targets)
        .err()
        .unwrap();
    assert!(matches!(err, AdmixError::Serde(info) if info.code == "checkpoint-read"));
}

#[test]
fn config_round_trips_through_yaml() {
    let yaml = r#"
generations: 500
burn_in: 100
tempering:
  chains: 3
  swap_mode: random
checkpoint:
  interval: 50
seed_policy:
  master_seed: 42
  label: demo
"#;
    let config = McmcConfig::from_yaml_str(yaml).unwrap();
    assert_eq!(config.generations, 500);
    assert_eq!(config.burn_in, 100);
    assert_eq!(config.tuning_interval, 100);
    assert_eq!(config.tempering.chains, 3);
    assert_eq!(config.tempering.delta, 0.2);
    assert_eq!(config.tempering.swap_interval, 10);
    assert_eq!(config.tempering.swap_mode, SwapMode::Random);
    assert_eq!(config.checkpoint.max_to_keep, 4);
    assert_eq!(config.seed_policy.master_seed, 42);
    assert_eq!(config.output.trace_file, "trace.tsv");

    let rendered = config.to_yaml().unwrap();
    assert_eq!(McmcConfig::from_yaml_str(&rendered).unwrap(), config);
}

#[test]
fn invalid_configs_are_rejected() {
    let err = McmcConfig::from_yaml_str("tempering:\n  chains: 0\n").unwrap_err();
    assert!(matches!(err, AdmixError::Config(info) if info.code == "tempering-chains"));
    let err = McmcConfig::from_yaml_str("tempering:\n  chains: 2\n  swap_interval: 0\n")
        .unwrap_err();
    assert!(matches!(err, AdmixError::Config(info) if info.code == "swap-interval"));
    let err = McmcConfig::from_yaml_str("moves_per_generation: 0\n").unwrap_err();
    assert!(matches!(err, AdmixError::Config(info) if info.code == "moves-per-generation"));
    let err = McmcConfig::from_yaml_str("generations: [1, 2]\n").unwrap_err();
    assert!(matches!(err, AdmixError::Config(info) if info.code == "config-parse"));
}
