use std::fs;
use std::path::{Path, PathBuf};

use admix_core::errors::{AdmixError, ErrorInfo};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::OperatorSummary;
use crate::config::McmcConfig;

/// Structured manifest describing a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Configuration used for the run.
    pub config: McmcConfig,
    /// Master seed used to derive chain substreams.
    pub master_seed: u64,
    /// Optional seed label captured from the configuration.
    pub seed_label: Option<String>,
    /// RFC 3339 timestamp of manifest creation.
    pub created_at: String,
    /// Generations completed, burn-in included.
    pub generations: u64,
    /// Log-posterior of the final state of the active chain.
    pub final_ln_posterior: f64,
    /// Canonical hash of the final tree, when the model has one.
    pub final_tree_hash: Option<String>,
    /// Operator counters of the active chain.
    pub operators: Vec<OperatorSummary>,
    /// Heat-swap acceptance rate when more than one chain ran.
    pub swap_acceptance: Option<f64>,
    /// Parameter trace (relative to the run directory).
    pub trace_file: Option<PathBuf>,
    /// Tree trace (relative to the run directory).
    pub tree_file: Option<PathBuf>,
    /// Checkpoint files generated during the run (relative order preserved).
    pub checkpoints: Vec<PathBuf>,
}

/// Current UTC time in RFC 3339 form.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl RunManifest {
    /// Writes the manifest to a JSON file.
    pub fn write(&self, path: &Path) -> Result<(), AdmixError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AdmixError::Serde(
                    ErrorInfo::new("manifest-mkdir", err.to_string())
                        .with_context("path", parent.display().to_string()),
                )
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            AdmixError::Serde(
                ErrorInfo::new("manifest-serialize", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        fs::write(path, json).map_err(|err| {
            AdmixError::Serde(
                ErrorInfo::new("manifest-write", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Loads a manifest from disk.
    pub fn load(path: &Path) -> Result<Self, AdmixError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AdmixError::Serde(
                ErrorInfo::new("manifest-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            AdmixError::Serde(
                ErrorInfo::new("manifest-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }
}
