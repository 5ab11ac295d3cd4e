use std::path::{Path, PathBuf};

use admix_core::errors::{AdmixError, ErrorInfo};
use serde::{Deserialize, Serialize};

/// YAML-configurable parameters of a sampling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcConfig {
    /// Sampling generations after burn-in.
    #[serde(default = "default_generations")]
    pub generations: u64,
    /// Burn-in generations; moves are tuned and nothing is monitored.
    #[serde(default)]
    pub burn_in: u64,
    /// Generations between tuning steps during burn-in (0 disables tuning).
    #[serde(default = "default_tuning_interval")]
    pub tuning_interval: u64,
    /// Fixed number of proposals per generation instead of the summed move weights.
    #[serde(default)]
    pub moves_per_generation: Option<usize>,
    /// Generations between full posterior re-evaluations (0 disables the check).
    #[serde(default)]
    pub verify_interval: u64,
    /// Heated chains and swap schedule.
    #[serde(default)]
    pub tempering: TemperingConfig,
    /// Checkpointing behaviour.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Master seed and run label.
    #[serde(default)]
    pub seed_policy: SeedPolicy,
    /// Output file layout.
    #[serde(default)]
    pub output: OutputConfig,
    /// Monitor cadence.
    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_generations() -> u64 {
    1000
}

fn default_tuning_interval() -> u64 {
    100
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            generations: default_generations(),
            burn_in: 0,
            tuning_interval: default_tuning_interval(),
            moves_per_generation: None,
            verify_interval: 0,
            tempering: TemperingConfig::default(),
            checkpoint: CheckpointConfig::default(),
            seed_policy: SeedPolicy::default(),
            output: OutputConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

fn config_error(code: &str, message: &str) -> AdmixError {
    AdmixError::Config(ErrorInfo::new(code, message))
}

impl McmcConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AdmixError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|err| AdmixError::Config(ErrorInfo::new("config-parse", err.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    pub fn from_yaml_path(path: &Path) -> Result<Self, AdmixError> {
        let yaml = std::fs::read_to_string(path).map_err(|err| {
            AdmixError::Config(
                ErrorInfo::new("config-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Renders the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, AdmixError> {
        serde_yaml::to_string(self)
            .map_err(|err| AdmixError::Config(ErrorInfo::new("config-render", err.to_string())))
    }

    /// Rejects values the driver cannot honour.
    pub fn validate(&self) -> Result<(), AdmixError> {
        if self.tempering.chains == 0 {
            return Err(config_error("tempering-chains", "at least one chain is required"));
        }
        if !(self.tempering.delta >= 0.0 && self.tempering.delta.is_finite()) {
            return Err(AdmixError::Config(
                ErrorInfo::new("tempering-delta", "delta must be finite and non-negative")
                    .with_context("delta", self.tempering.delta),
            ));
        }
        if self.tempering.chains > 1 && self.tempering.swap_interval == 0 {
            return Err(config_error(
                "swap-interval",
                "heated chains need a positive swap interval",
            ));
        }
        if self.moves_per_generation == Some(0) {
            return Err(config_error(
                "moves-per-generation",
                "at least one proposal per generation is required",
            ));
        }
        Ok(())
    }
}

/// How swap partners are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwapMode {
    /// Two chains with adjacent heat ranks.
    #[default]
    Neighbour,
    /// Any two distinct chains.
    Random,
}

/// Metropolis-coupled chains with heats `1 / (1 + delta * rank)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperingConfig {
    /// Number of chains; one disables tempering.
    #[serde(default = "default_chains")]
    pub chains: usize,
    /// Heat spacing.
    #[serde(default = "default_delta")]
    pub delta: f64,
    /// Generations between swap attempts.
    #[serde(default = "default_swap_interval")]
    pub swap_interval: u64,
    /// Swap partner selection.
    #[serde(default)]
    pub swap_mode: SwapMode,
    /// Tune delta towards the target swap rate during burn-in.
    #[serde(default)]
    pub tune_delta: bool,
}

fn default_chains() -> usize {
    1
}

fn default_delta() -> f64 {
    0.2
}

fn default_swap_interval() -> u64 {
    10
}

impl Default for TemperingConfig {
    fn default() -> Self {
        Self {
            chains: default_chains(),
            delta: default_delta(),
            swap_interval: default_swap_interval(),
            swap_mode: SwapMode::default(),
            tune_delta: false,
        }
    }
}

/// Checkpointing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Interval in generations between checkpoint writes (0 disables checkpoints).
    #[serde(default)]
    pub interval: u64,
    /// Directory where checkpoints are stored; overrides the run directory layout.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Maximum number of checkpoints to retain.
    #[serde(default = "default_checkpoint_retention")]
    pub max_to_keep: usize,
}

fn default_checkpoint_retention() -> usize {
    4
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 0,
            directory: None,
            max_to_keep: default_checkpoint_retention(),
        }
    }
}

/// Master seed and label recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPolicy {
    /// Master seed every stream is derived from.
    #[serde(default = "default_master_seed")]
    pub master_seed: u64,
    /// Free-form label.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_master_seed() -> u64 {
    0x5EED
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self {
            master_seed: default_master_seed(),
            label: None,
        }
    }
}

/// Output layout relative to the run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving every artefact; `None` keeps the run in memory.
    #[serde(default)]
    pub run_directory: Option<PathBuf>,
    /// Tab-separated parameter trace.
    #[serde(default = "default_trace_file")]
    pub trace_file: String,
    /// Extended Newick tree trace.
    #[serde(default = "default_tree_file")]
    pub tree_file: String,
    /// Per-sample clade and admixture bipartitions of the tree.
    #[serde(default = "default_bipartition_file")]
    pub bipartition_file: String,
    /// Run manifest.
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
    /// Checkpoint subdirectory.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
}

fn default_trace_file() -> String {
    "trace.tsv".to_string()
}

fn default_tree_file() -> String {
    "trees.tsv".to_string()
}

fn default_bipartition_file() -> String {
    "bipartitions.tsv".to_string()
}

fn default_manifest_file() -> String {
    "manifest.json".to_string()
}

fn default_checkpoint_dir() -> String {
    "checkpoints".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            run_directory: None,
            trace_file: default_trace_file(),
            tree_file: default_tree_file(),
            bipartition_file: default_bipartition_file(),
            manifest_file: default_manifest_file(),
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

/// Monitor cadence in generations; zero disables a monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Parameter trace cadence.
    #[serde(default = "default_trace_interval")]
    pub trace_interval: u64,
    /// Tree trace cadence.
    #[serde(default = "default_trace_interval")]
    pub tree_interval: u64,
    /// Progress line cadence.
    #[serde(default = "default_screen_interval")]
    pub screen_interval: u64,
}

fn default_trace_interval() -> u64 {
    10
}

fn default_screen_interval() -> u64 {
    100
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            trace_interval: default_trace_interval(),
            tree_interval: default_trace_interval(),
            screen_interval: default_screen_interval(),
        }
    }
}
