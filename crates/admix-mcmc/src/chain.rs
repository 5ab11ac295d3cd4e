//! Single Metropolis-Hastings chain.

use std::io::Write;

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_core::RngHandle;
use admix_dag::Model;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::monitors::{ChainView, Monitor};
use crate::moves::Move;

/// Maximum tolerated gap between the cached and the re-evaluated posterior.
pub const CONSERVATION_TOLERANCE: f64 = 1e-8;

/// Result of one proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Index of the selected move.
    pub move_index: usize,
    /// Whether the proposal was accepted.
    pub accepted: bool,
    /// Whether the proposal was infeasible.
    pub failed: bool,
}

/// Counters and tuning state of one move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSummary {
    /// Move name.
    pub name: String,
    /// Names of the edited variables.
    pub targets: Vec<String>,
    /// Selection weight.
    pub weight: f64,
    /// Proposals made.
    pub tried: u64,
    /// Proposals accepted.
    pub accepted: u64,
    /// Infeasible proposals.
    pub failed: u64,
    /// `accepted / tried`.
    pub acceptance_ratio: f64,
    /// Tuning parameter after the run.
    pub tuning_parameter: Option<f64>,
}

/// Writes the operator table shared by single chains and ensembles.
pub fn write_operator_table<W: Write>(
    writer: &mut W,
    summaries: &[OperatorSummary],
) -> Result<(), AdmixError> {
    let map =
        |err: std::io::Error| AdmixError::Serde(ErrorInfo::new("summary-write", err.to_string()));
    writeln!(
        writer,
        "{:<34} {:<16} {:>8} {:>10} {:>10} {:>10} {:>12}",
        "Name", "Param", "Weight", "Tried", "Accepted", "Acc.Ratio", "Parameter"
    )
    .map_err(map)?;
    writeln!(writer, "{}", "=".repeat(106)).map_err(map)?;
    for summary in summaries {
        let parameter = summary
            .tuning_parameter
            .map(|value| format!("{value:.4}"))
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            writer,
            "{:<34} {:<16} {:>8.2} {:>10} {:>10} {:>10.4} {:>12}",
            summary.name,
            summary.targets.join(","),
            summary.weight,
            summary.tried,
            summary.accepted,
            summary.acceptance_ratio,
            parameter
        )
        .map_err(map)?;
    }
    Ok(())
}

/// A Metropolis-Hastings chain over a [`Model`].
///
/// Each generation performs `round(sum of active weights)` proposals unless an
/// explicit count is configured. Monitors only ever see committed state.
pub struct Mcmc {
    model: Model,
    moves: Vec<Box<dyn Move>>,
    monitors: Vec<Box<dyn Monitor>>,
    rng: RngHandle,
    generation: u64,
    ln_posterior: f64,
    heat: f64,
    chain_index: usize,
    active: bool,
    moves_per_generation: Option<usize>,
    verify_interval: u64,
    headers_written: bool,
}

impl Mcmc {
    /// Initialises `model` and builds a cold chain seeded with `seed`.
    pub fn new(mut model: Model, moves: Vec<Box<dyn Move>>, seed: u64) -> Result<Self, AdmixError> {
        if moves.is_empty() {
            return Err(AdmixError::Chain(ErrorInfo::new(
                "no-moves",
                "a chain needs at least one move",
            )));
        }
        model.initialize()?;
        let ln_posterior = model.ln_posterior()?;
        if !ln_posterior.is_finite() {
            return Err(AdmixError::Chain(
                ErrorInfo::new("initial-posterior", "starting state has zero posterior density")
                    .with_context("ln_posterior", ln_posterior)
                    .with_hint("choose initial values inside the support of every density"),
            ));
        }
        Ok(Self {
            model,
            moves,
            monitors: Vec::new(),
            rng: RngHandle::from_seed(seed),
            generation: 0,
            ln_posterior,
            heat: 1.0,
            chain_index: 0,
            active: true,
            moves_per_generation: None,
            verify_interval: 0,
            headers_written: false,
        })
    }

    /// Adds a monitor.
    pub fn with_monitor(mut self, monitor: Box<dyn Monitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    /// Sets the heat that multiplies the posterior ratio.
    pub fn with_heat(mut self, heat: f64) -> Self {
        self.heat = heat;
        self
    }

    /// Overrides the number of proposals per generation.
    pub fn with_moves_per_generation(mut self, count: usize) -> Self {
        self.moves_per_generation = Some(count);
        self
    }

    /// Re-evaluates the posterior from scratch every `interval` generations.
    pub fn with_verify_interval(mut self, interval: u64) -> Self {
        self.verify_interval = interval;
        self
    }

    /// The model in its committed state.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Moves in registration order.
    pub fn moves(&self) -> &[Box<dyn Move>] {
        &self.moves
    }

    /// Completed generations, burn-in included.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Unheated log-posterior of the committed state.
    pub fn ln_posterior(&self) -> f64 {
        self.ln_posterior
    }

    /// Current heat.
    pub fn heat(&self) -> f64 {
        self.heat
    }

    /// Replaces the heat.
    pub fn set_heat(&mut self, heat: f64) {
        self.heat = heat;
    }

    /// Index of the chain within its ensemble.
    pub fn chain_index(&self) -> usize {
        self.chain_index
    }

    /// Sets the ensemble index.
    pub fn set_chain_index(&mut self, index: usize) {
        self.chain_index = index;
    }

    /// Whether this chain currently holds the cold role.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Grants or revokes the cold role.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// View handed to monitors.
    pub fn view(&self) -> ChainView<'_> {
        ChainView {
            model: &self.model,
            ln_posterior: self.ln_posterior,
            heat: self.heat,
            chain_index: self.chain_index,
        }
    }

    /// Selects a move among those active at the upcoming generation and runs
    /// one proposal through accept or reject.
    pub fn step(&mut self) -> Result<StepOutcome, AdmixError> {
        let generation = self.generation + 1;
        let move_index = self.select_move(generation)?;
        self.perform(move_index)
    }

    fn select_move(&mut self, generation: u64) -> Result<usize, AdmixError> {
        let total: f64 = self
            .moves
            .iter()
            .filter(|mv| mv.core().is_active(generation))
            .map(|mv| mv.core().weight())
            .sum();
        if !(total > 0.0) {
            return Err(AdmixError::Chain(
                ErrorInfo::new("no-active-moves", "no move is active at this generation")
                    .with_context("generation", generation),
            ));
        }
        let mut threshold = self.rng.uniform01() * total;
        let mut last = 0;
        for (idx, mv) in self.moves.iter().enumerate() {
            let core = mv.core();
            if !core.is_active(generation) {
                continue;
            }
            last = idx;
            threshold -= core.weight();
            if threshold < 0.0 {
                return Ok(idx);
            }
        }
        Ok(last)
    }

    fn perform(&mut self, move_index: usize) -> Result<StepOutcome, AdmixError> {
        let mv = &mut self.moves[move_index];
        let proposal = mv.propose(&mut self.model, &mut self.rng)?;
        let u = self.rng.uniform01();
        let failed = mv.core().is_failed();
        let mut ratio = 0.0;
        let accepted = if failed {
            false
        } else {
            ratio = self.model.touched_ln_ratio()?;
            let ln_acceptance =
                self.heat * ratio + proposal.ln_hastings_ratio + proposal.ln_prior_ratio;
            u.ln() < ln_acceptance
        };
        if accepted {
            mv.accept(&mut self.model)?;
            self.ln_posterior += ratio;
        } else {
            if failed {
                debug!("{} failed at generation {}", mv.core().name(), self.generation + 1);
            }
            mv.reject(&mut self.model)?;
        }
        Ok(StepOutcome {
            move_index,
            accepted,
            failed,
        })
    }

    /// Number of proposals for the upcoming generation.
    fn proposals_per_generation(&self) -> usize {
        if let Some(count) = self.moves_per_generation {
            return count;
        }
        let generation = self.generation + 1;
        let total: f64 = self
            .moves
            .iter()
            .filter(|mv| mv.core().is_active(generation))
            .map(|mv| mv.core().weight())
            .sum();
        (total.round() as usize).max(1)
    }

    /// Runs one generation without reporting to monitors.
    pub fn advance(&mut self) -> Result<(), AdmixError> {
        for _ in 0..self.proposals_per_generation() {
            self.step()?;
        }
        self.generation += 1;
        if self.verify_interval > 0 && self.generation % self.verify_interval == 0 {
            self.verify()?;
        }
        Ok(())
    }

    /// Checks the cached posterior against a full re-evaluation and
    /// resynchronises the running total.
    pub fn verify(&mut self) -> Result<(), AdmixError> {
        let cached = self.model.ln_posterior()?;
        let full = self.model.full_ln_posterior();
        if !((cached - full).abs() <= CONSERVATION_TOLERANCE) {
            return Err(AdmixError::Chain(
                ErrorInfo::new("posterior-drift", "cached posterior disagrees with full evaluation")
                    .with_context("generation", self.generation)
                    .with_context("cached", cached)
                    .with_context("full", full),
            ));
        }
        self.ln_posterior = full;
        Ok(())
    }

    /// Resets every move counter.
    pub fn reset_counters(&mut self) {
        for mv in &mut self.moves {
            mv.core_mut().reset_counters();
        }
    }

    /// Applies the tuning rule to every tunable move and clears its window.
    pub fn tune_moves(&mut self) {
        for mv in &mut self.moves {
            if let Some(rate) = mv.core().window_rate() {
                if mv.core().auto_tune() {
                    mv.tune(rate);
                }
            }
            mv.core_mut().reset_window();
        }
    }

    /// Runs `generations` generations of burn-in, tuning every
    /// `tuning_interval` generations. Counters are reset before and after.
    pub fn burnin(&mut self, generations: u64, tuning_interval: u64) -> Result<(), AdmixError> {
        info!(
            "chain {}: burn-in for {generations} generations (tuning every {tuning_interval})",
            self.chain_index
        );
        self.reset_counters();
        for done in 1..=generations {
            self.advance()?;
            if tuning_interval > 0 && done % tuning_interval == 0 {
                self.tune_moves();
            }
        }
        self.reset_counters();
        Ok(())
    }

    /// Opens the monitors and writes headers on first use.
    pub fn start_monitors(&mut self) -> Result<(), AdmixError> {
        for monitor in &mut self.monitors {
            monitor.open()?;
        }
        if !self.headers_written {
            self.headers_written = true;
            let view = ChainView {
                model: &self.model,
                ln_posterior: self.ln_posterior,
                heat: self.heat,
                chain_index: self.chain_index,
            };
            for monitor in &mut self.monitors {
                monitor.print_header(&view)?;
                if monitor.is_due(self.generation) {
                    monitor.report(self.generation, &view)?;
                }
            }
        }
        Ok(())
    }

    /// Reports the current generation to every monitor that is due.
    pub fn report_monitors(&mut self) -> Result<(), AdmixError> {
        let view = ChainView {
            model: &self.model,
            ln_posterior: self.ln_posterior,
            heat: self.heat,
            chain_index: self.chain_index,
        };
        for monitor in &mut self.monitors {
            if monitor.is_due(self.generation) {
                monitor.report(self.generation, &view)?;
            }
        }
        Ok(())
    }

    /// Closes every monitor.
    pub fn close_monitors(&mut self) -> Result<(), AdmixError> {
        for monitor in &mut self.monitors {
            monitor.close()?;
        }
        Ok(())
    }

    /// Runs `generations` generations, reporting to the monitors.
    pub fn run(&mut self, generations: u64) -> Result<(), AdmixError> {
        info!(
            "chain {}: sampling {generations} generations from generation {}",
            self.chain_index, self.generation
        );
        self.start_monitors()?;
        for _ in 0..generations {
            self.advance()?;
            self.report_monitors()?;
        }
        self.close_monitors()
    }

    /// Structured counters of every move.
    pub fn operator_summary(&self) -> Vec<OperatorSummary> {
        self.moves
            .iter()
            .map(|mv| {
                let core = mv.core();
                OperatorSummary {
                    name: core.name().to_string(),
                    targets: core
                        .targets()
                        .iter()
                        .map(|&id| {
                            self.model
                                .name(id)
                                .map(str::to_string)
                                .unwrap_or_else(|_| id.to_string())
                        })
                        .collect(),
                    weight: core.weight(),
                    tried: core.tried(),
                    accepted: core.accepted(),
                    failed: core.failures(),
                    acceptance_ratio: core.acceptance_ratio(),
                    tuning_parameter: mv.tuning_parameter(),
                }
            })
            .collect()
    }

    /// Writes the operator table to `writer`.
    pub fn print_operator_summary<W: Write>(&self, writer: &mut W) -> Result<(), AdmixError> {
        write_operator_table(writer, &self.operator_summary())
    }

    pub(crate) fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub(crate) fn moves_mut(&mut self) -> &mut [Box<dyn Move>] {
        &mut self.moves
    }

    pub(crate) fn restore_position(&mut self, generation: u64, ln_posterior: f64, seed: u64) {
        self.generation = generation;
        self.ln_posterior = ln_posterior;
        self.rng = RngHandle::from_seed(seed);
    }
}
