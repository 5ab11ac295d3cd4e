//! Birth-death admixture model assembled from a YAML description.

use std::error::Error;
use std::fs;
use std::path::Path;

use admix_core::{derive_substream_seed, RngHandle};
use admix_dag::{AdmixtureEventCount, BirthDeathDensity, ExponentialDensity, Model, TreeLength};
use admix_mcmc::{
    AdmixtureEdgeAdd, AdmixtureEdgeDivergenceMerge, AdmixtureEdgeDivergenceSplit,
    AdmixtureEdgeRemove, AdmixtureEdgeReversePolarity, AdmixtureEdgeReweight, AdmixtureEdgeSlide,
    FixedNodeheightPruneRegraft, McmcConfig, MonitorTargets, Move, NarrowExchange,
    NodeTimeSlideBeta, PriorRatioTerm, ScaleMove,
};
use admix_tree::BirthDeathProcess;
use log::info;
use serde::{Deserialize, Serialize};

/// Substream used to simulate the starting tree, away from every chain stream.
const START_TREE_STREAM: u64 = u64::MAX - 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DemoConfig {
    #[serde(default)]
    pub model: ModelSpec,
    #[serde(default)]
    pub moves: MoveWeights,
    #[serde(default)]
    pub mcmc: McmcConfig,
}

impl DemoConfig {
    pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
        let contents = fs::read_to_string(path)?;
        let config: DemoConfig = serde_yaml::from_str(&contents)?;
        config.mcmc.validate()?;
        Ok(config)
    }
}

/// Taxa and priors of the birth-death admixture model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default = "default_taxa")]
    pub taxa: Vec<String>,
    /// Names of outgroup taxa.
    #[serde(default)]
    pub outgroup: Vec<String>,
    #[serde(default = "default_root_age")]
    pub root_age: f64,
    /// Rate of the exponential prior on the diversification rate.
    #[serde(default = "default_diversification_prior")]
    pub diversification_prior: f64,
    /// Rate of the exponential prior on the turnover rate.
    #[serde(default = "default_turnover_prior")]
    pub turnover_prior: f64,
    #[serde(default = "default_max_admixture_events")]
    pub max_admixture_events: usize,
    /// Optional move-local prior on `2w` for reweighting moves.
    #[serde(default)]
    pub weight_prior_term: PriorRatioTerm,
}

fn default_taxa() -> Vec<String> {
    ["A", "B", "C", "D", "E", "F"].iter().map(|t| t.to_string()).collect()
}

fn default_root_age() -> f64 {
    1.0
}

fn default_diversification_prior() -> f64 {
    1.0
}

fn default_turnover_prior() -> f64 {
    5.0
}

fn default_max_admixture_events() -> usize {
    3
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            taxa: default_taxa(),
            outgroup: Vec::new(),
            root_age: default_root_age(),
            diversification_prior: default_diversification_prior(),
            turnover_prior: default_turnover_prior(),
            max_admixture_events: default_max_admixture_events(),
            weight_prior_term: PriorRatioTerm::default(),
        }
    }
}

/// Selection weights; a zero weight leaves the move out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveWeights {
    pub rate_scale: f64,
    pub narrow_exchange: f64,
    pub prune_regraft: f64,
    pub node_time_slide: f64,
    pub edge_add: f64,
    pub edge_remove: f64,
    pub edge_reweight: f64,
    pub edge_reverse: f64,
    pub edge_slide: f64,
    pub divergence_merge: f64,
    pub divergence_split: f64,
}

impl Default for MoveWeights {
    fn default() -> Self {
        Self {
            rate_scale: 1.0,
            narrow_exchange: 2.0,
            prune_regraft: 2.0,
            node_time_slide: 4.0,
            edge_add: 1.0,
            edge_remove: 1.0,
            edge_reweight: 2.0,
            edge_reverse: 0.5,
            edge_slide: 2.0,
            divergence_merge: 0.5,
            divergence_split: 0.5,
        }
    }
}

pub struct DemoProblem {
    pub model: Model,
    pub moves: Vec<Box<dyn Move>>,
    pub targets: MonitorTargets,
}

/// Builds the model, its starting tree and the weighted move set.
pub fn build(
    spec: &ModelSpec,
    weights: &MoveWeights,
    seed: u64,
) -> Result<DemoProblem, Box<dyn Error>> {
    let unknown: Vec<&String> = spec
        .outgroup
        .iter()
        .filter(|name| !spec.taxa.contains(name))
        .collect();
    if !unknown.is_empty() {
        return Err(format!("outgroup names not among the taxa: {unknown:?}").into());
    }
    let flags = spec
        .taxa
        .iter()
        .map(|taxon| spec.outgroup.contains(taxon))
        .collect();
    let process = BirthDeathProcess::new(spec.taxa.clone())?
        .with_outgroup(flags)?
        .with_root_age(spec.root_age);

    let mut rng = RngHandle::from_seed(derive_substream_seed(seed, START_TREE_STREAM));
    let start = process.simulate(1.0, 0.1, &mut rng)?;
    info!(
        "starting tree for {} taxa: {}",
        spec.taxa.len(),
        start.to_extended_newick()?
    );

    let mut model = Model::new();
    let diversification_rate =
        model.add_constant("diversification_prior", spec.diversification_prior)?;
    let turnover_rate = model.add_constant("turnover_prior", spec.turnover_prior)?;
    let diversification = model.add_stochastic(
        "diversification",
        ExponentialDensity::scalar(),
        &[diversification_rate],
        1.0,
    )?;
    let turnover =
        model.add_stochastic("turnover", ExponentialDensity::scalar(), &[turnover_rate], 0.1)?;
    let tree = model.add_stochastic(
        "tree",
        BirthDeathDensity::new(process),
        &[diversification, turnover],
        start,
    )?;
    let length = model.add_deterministic("tree_length", TreeLength, &[tree])?;
    let events = model.add_deterministic("admixture_events", AdmixtureEventCount, &[tree])?;

    let prior_term = spec.weight_prior_term;
    let mut moves: Vec<Box<dyn Move>> = Vec::new();
    keep(&mut moves, ScaleMove::new(diversification, 1.0, weights.rate_scale));
    keep(&mut moves, ScaleMove::new(turnover, 1.0, weights.rate_scale));
    keep(&mut moves, NarrowExchange::new(tree, weights.narrow_exchange));
    keep(&mut moves, FixedNodeheightPruneRegraft::new(tree, weights.prune_regraft));
    keep(&mut moves, NodeTimeSlideBeta::new(tree, 10.0, weights.node_time_slide));
    keep(
        &mut moves,
        AdmixtureEdgeAdd::new(tree, spec.max_admixture_events, weights.edge_add),
    );
    keep(&mut moves, AdmixtureEdgeRemove::new(tree, weights.edge_remove));
    keep(
        &mut moves,
        AdmixtureEdgeReweight::new(tree, 5.0, weights.edge_reweight).with_prior_term(prior_term),
    );
    keep(
        &mut moves,
        AdmixtureEdgeReversePolarity::new(tree, 5.0, weights.edge_reverse)
            .with_prior_term(prior_term),
    );
    keep(&mut moves, AdmixtureEdgeSlide::new(tree, 10.0, 5.0, weights.edge_slide));
    keep(&mut moves, AdmixtureEdgeDivergenceMerge::new(tree, weights.divergence_merge));
    keep(
        &mut moves,
        AdmixtureEdgeDivergenceSplit::new(
            tree,
            spec.max_admixture_events,
            weights.divergence_split,
        ),
    );
    if moves.is_empty() {
        return Err("every move weight is zero".into());
    }

    Ok(DemoProblem {
        model,
        moves,
        targets: MonitorTargets {
            traced: vec![diversification, turnover, length, events],
            tree: Some(tree),
        },
    })
}

fn keep(moves: &mut Vec<Box<dyn Move>>, candidate: impl Move + 'static) {
    if candidate.core().weight() > 0.0 {
        moves.push(Box::new(candidate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundled_config() -> DemoConfig {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/demo.yaml");
        DemoConfig::load(&path).unwrap()
    }

    #[test]
    fn bundled_config_parses() {
        let config = bundled_config();
        assert_eq!(config.model.taxa.len(), 7);
        assert_eq!(config.model.outgroup, vec!["O".to_string()]);
        assert_eq!(
            config.model.weight_prior_term,
            PriorRatioTerm::Beta { alpha: 1.0, beta: 5.0 }
        );
        assert_eq!(config.mcmc.tempering.chains, 3);
    }

    #[test]
    fn zero_weights_drop_moves() {
        let mut weights = MoveWeights::default();
        weights.edge_reverse = 0.0;
        weights.rate_scale = 0.0;
        let problem = build(&ModelSpec::default(), &weights, 7).unwrap();
        assert_eq!(problem.moves.len(), 9);
        assert_eq!(problem.targets.traced.len(), 4);
    }

    #[test]
    fn unknown_outgroup_is_rejected() {
        let spec = ModelSpec {
            outgroup: vec!["Z".to_string()],
            ..ModelSpec::default()
        };
        assert!(build(&spec, &MoveWeights::default(), 1).is_err());
    }

    #[test]
    fn short_run_writes_artefacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = bundled_config();
        config.mcmc.generations = 40;
        config.mcmc.burn_in = 10;
        config.mcmc.tuning_interval = 5;
        config.mcmc.checkpoint.interval = 20;
        config.mcmc.monitor.screen_interval = 0;
        config.mcmc.output.run_directory = Some(dir.path().to_path_buf());
        let problem = build(&config.model, &config.moves, 11).unwrap();
        let summary =
            admix_mcmc::run(&config.mcmc, problem.model, problem.moves, &problem.targets)
                .unwrap();
        assert_eq!(summary.generations, 50);
        assert!(summary.swap_acceptance.is_some());
        assert!(summary.final_tree_hash.is_some());
        assert!(dir.path().join("trace.tsv").exists());
    }
}
