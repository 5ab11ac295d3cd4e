use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_dag::Value;
use serde::{Deserialize, Serialize};

use crate::chain::Mcmc;
use crate::config::McmcConfig;
use crate::determinism::{resume_seed, resume_swap_seed};
use crate::tempering::ParallelMcmcmc;

/// Serializable state of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainCheckpoint {
    /// Index of the chain within the ensemble.
    pub chain_index: usize,
    /// Heat rank held when the checkpoint was written.
    pub heat_rank: usize,
    /// Log-posterior at the time of checkpointing.
    pub ln_posterior: f64,
    /// Committed values of the unclamped stochastic variables, by name.
    pub values: BTreeMap<String, Value>,
    /// Tuning parameter of every move, in registration order.
    pub tuning: Vec<Option<f64>>,
}

/// Aggregated checkpoint payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    /// Generation when the checkpoint was written.
    pub generation: u64,
    /// Configuration snapshot associated with the run.
    pub config: McmcConfig,
    /// Master seed used to derive chain substreams.
    pub master_seed: u64,
    /// Heat spacing at the time of checkpointing.
    pub delta: f64,
    /// Chain states in index order.
    pub chains: Vec<ChainCheckpoint>,
}

impl CheckpointPayload {
    /// Restores the payload from disk.
    pub fn load(path: &Path) -> Result<Self, AdmixError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AdmixError::Serde(
                ErrorInfo::new("checkpoint-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            AdmixError::Serde(
                ErrorInfo::new("checkpoint-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Writes the payload to disk.
    pub fn store(&self, path: &Path) -> Result<(), AdmixError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AdmixError::Serde(
                    ErrorInfo::new("checkpoint-mkdir", err.to_string())
                        .with_context("path", parent.display().to_string()),
                )
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            AdmixError::Serde(
                ErrorInfo::new("checkpoint-serialize", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        fs::write(path, json).map_err(|err| {
            AdmixError::Serde(
                ErrorInfo::new("checkpoint-write", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }
}

fn chain_checkpoint(chain: &Mcmc, heat_rank: usize) -> Result<ChainCheckpoint, AdmixError> {
    let model = chain.model();
    let mut values = BTreeMap::new();
    for id in model.stochastic_ids() {
        if model.is_clamped(id)? {
            continue;
        }
        values.insert(model.name(id)?.to_string(), model.committed(id)?.clone());
    }
    Ok(ChainCheckpoint {
        chain_index: chain.chain_index(),
        heat_rank,
        ln_posterior: chain.ln_posterior(),
        values,
        tuning: chain.moves().iter().map(|mv| mv.tuning_parameter()).collect(),
    })
}

/// Captures every chain of an ensemble.
pub fn build_payload(
    ensemble: &ParallelMcmcmc,
    config: &McmcConfig,
    master_seed: u64,
) -> Result<CheckpointPayload, AdmixError> {
    let mut chains = Vec::with_capacity(ensemble.chains().len());
    for (chain, &rank) in ensemble.chains().iter().zip(ensemble.ranks()) {
        chains.push(chain_checkpoint(chain, rank)?);
    }
    Ok(CheckpointPayload {
        generation: ensemble.generation(),
        config: config.clone(),
        master_seed,
        delta: ensemble.delta(),
        chains,
    })
}

/// Loads checkpointed values into a freshly built ensemble with the same model
/// and moves. Every random stream is re-seeded from the master seed and the
/// checkpoint generation.
pub fn restore_payload(
    ensemble: &mut ParallelMcmcmc,
    payload: &CheckpointPayload,
) -> Result<(), AdmixError> {
    if payload.chains.len() != ensemble.chains().len() {
        return Err(AdmixError::Serde(
            ErrorInfo::new("checkpoint-shape", "checkpoint chain count differs from the ensemble")
                .with_context("expected", ensemble.chains().len())
                .with_context("found", payload.chains.len()),
        ));
    }
    let mut ranks = Vec::with_capacity(payload.chains.len());
    for (chain, saved) in ensemble.chains_mut().iter_mut().zip(&payload.chains) {
        let model = chain.model_mut();
        for (name, value) in &saved.values {
            let id = model.lookup(name)?;
            model.set_value(id, value.clone())?;
        }
        model.keep_touched()?;
        let ln_posterior = model.ln_posterior()?;
        for (mv, tuning) in chain.moves_mut().iter_mut().zip(&saved.tuning) {
            mv.core_mut().reset();
            if let Some(value) = tuning {
                mv.set_tuning_parameter(*value);
            }
        }
        chain.restore_position(
            payload.generation,
            ln_posterior,
            resume_seed(payload.master_seed, saved.chain_index, payload.generation),
        );
        ranks.push(saved.heat_rank);
    }
    ensemble.restore_ladder(
        ranks,
        payload.delta,
        resume_swap_seed(payload.master_seed, payload.generation),
    );
    Ok(())
}

/// Determines the checkpoint file path for `generation`.
pub fn checkpoint_path(root: &Path, generation: u64) -> PathBuf {
    root.join(format!("ckpt_{generation:06}.json"))
}

/// Deletes the oldest checkpoints beyond `max_to_keep`.
pub fn enforce_checkpoint_retention(
    paths: &mut Vec<PathBuf>,
    max_to_keep: usize,
) -> Result<(), AdmixError> {
    while max_to_keep > 0 && paths.len() > max_to_keep {
        let oldest = paths.remove(0);
        if oldest.exists() {
            fs::remove_file(&oldest).map_err(|err| {
                AdmixError::Serde(
                    ErrorInfo::new("checkpoint-prune", err.to_string())
                        .with_context("path", oldest.display().to_string()),
                )
            })?;
        }
    }
    Ok(())
}
