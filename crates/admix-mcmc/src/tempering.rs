//! Metropolis-coupled chains run on scoped threads.

use std::io::Write;

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_core::RngHandle;
use admix_dag::Model;
use log::{debug, info};

use crate::chain::{write_operator_table, Mcmc, OperatorSummary};
use crate::config::{SwapMode, TemperingConfig};
use crate::determinism::{chain_seed, swap_seed};
use crate::monitors::Monitor;
use crate::moves::{Move, DEFAULT_TARGET_RATE};

/// Heat of the chain holding `rank` in a ladder with spacing `delta`.
pub fn heat_for_rank(delta: f64, rank: usize) -> f64 {
    1.0 / (1.0 + delta * rank as f64)
}

/// Log acceptance ratio for exchanging the heats of two chains.
pub fn swap_ln_ratio(heat_j: f64, ln_posterior_j: f64, heat_k: f64, ln_posterior_k: f64) -> f64 {
    heat_j * (ln_posterior_k - ln_posterior_j) + heat_k * (ln_posterior_j - ln_posterior_k)
}

fn generations_until(position: u64, interval: u64) -> u64 {
    if interval == 0 {
        u64::MAX
    } else {
        interval - position % interval
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Burnin { tuning_interval: u64 },
    Sampling,
}

/// Swap counters of an ensemble.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SwapCounters {
    /// Swaps attempted.
    pub tried: u64,
    /// Swaps accepted.
    pub accepted: u64,
}

impl SwapCounters {
    /// `accepted / tried`, zero before the first attempt.
    pub fn rate(&self) -> f64 {
        if self.tried == 0 {
            0.0
        } else {
            self.accepted as f64 / self.tried as f64
        }
    }
}

/// Ensemble of heated chains with heat swaps.
///
/// Chain `i` starts with heat rank `i`. Accepted swaps exchange heats and
/// ranks; the chain holding rank zero is the active one and the only one
/// reported to monitors.
pub struct ParallelMcmcmc {
    chains: Vec<Mcmc>,
    ranks: Vec<usize>,
    delta: f64,
    swap_interval: u64,
    swap_mode: SwapMode,
    tune_delta: bool,
    swap_rng: RngHandle,
    monitors: Vec<Box<dyn Monitor>>,
    swaps: SwapCounters,
    window: SwapCounters,
    headers_written: bool,
}

impl ParallelMcmcmc {
    /// Builds `config.chains` copies of `model` and `moves` with derived seeds.
    pub fn new(
        model: Model,
        moves: Vec<Box<dyn Move>>,
        config: &TemperingConfig,
        master_seed: u64,
    ) -> Result<Self, AdmixError> {
        if config.chains == 0 {
            return Err(AdmixError::Config(ErrorInfo::new(
                "tempering-chains",
                "at least one chain is required",
            )));
        }
        let mut chains = Vec::with_capacity(config.chains);
        for idx in 0..config.chains {
            let copies: Vec<Box<dyn Move>> = moves.iter().map(|mv| mv.box_clone()).collect();
            let mut chain = Mcmc::new(model.clone(), copies, chain_seed(master_seed, idx))?
                .with_heat(heat_for_rank(config.delta, idx));
            chain.set_chain_index(idx);
            chain.set_active(idx == 0);
            chains.push(chain);
        }
        info!(
            "tempering: {} chains, delta {}, swap every {} generations",
            config.chains, config.delta, config.swap_interval
        );
        Ok(Self {
            chains,
            ranks: (0..config.chains).collect(),
            delta: config.delta,
            swap_interval: config.swap_interval,
            swap_mode: config.swap_mode,
            tune_delta: config.tune_delta,
            swap_rng: RngHandle::from_seed(swap_seed(master_seed)),
            monitors: Vec::new(),
            swaps: SwapCounters::default(),
            window: SwapCounters::default(),
            headers_written: false,
        })
    }

    /// Adds a monitor fed by the active chain.
    pub fn with_monitor(mut self, monitor: Box<dyn Monitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    /// Applies a builder step to every chain.
    pub fn map_chains(mut self, configure: impl Fn(Mcmc) -> Mcmc) -> Self {
        self.chains = self.chains.into_iter().map(configure).collect();
        self
    }

    /// Chains in index order.
    pub fn chains(&self) -> &[Mcmc] {
        &self.chains
    }

    /// Heat rank of every chain, by chain index.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Current heat spacing.
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Swap counters since the last reset.
    pub fn swap_counters(&self) -> SwapCounters {
        self.swaps
    }

    /// Index of the chain holding heat rank zero.
    pub fn cold_index(&self) -> usize {
        self.chain_with_rank(0)
    }

    /// The chain holding heat rank zero.
    pub fn cold_chain(&self) -> &Mcmc {
        &self.chains[self.cold_index()]
    }

    /// Completed generations.
    pub fn generation(&self) -> u64 {
        self.chains[0].generation()
    }

    fn chain_with_rank(&self, rank: usize) -> usize {
        self.ranks.iter().position(|&r| r == rank).unwrap_or(0)
    }

    fn advance_all(&mut self, generations: u64) -> Result<(), AdmixError> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .chains
                .iter_mut()
                .map(|chain| {
                    scope.spawn(move || -> Result<(), AdmixError> {
                        for _ in 0..generations {
                            chain.advance()?;
                        }
                        Ok(())
                    })
                })
                .collect();
            let mut outcome = Ok(());
            for (idx, handle) in handles.into_iter().enumerate() {
                let result = handle.join().unwrap_or_else(|_| {
                    Err(AdmixError::Chain(
                        ErrorInfo::new("chain-panicked", "chain thread panicked")
                            .with_context("chain", idx),
                    ))
                });
                if let (Err(err), true) = (result, outcome.is_ok()) {
                    outcome = Err(err);
                }
            }
            outcome
        })
    }

    /// Attempts one heat swap.
    pub fn swap(&mut self) -> Result<bool, AdmixError> {
        let count = self.chains.len();
        if count < 2 {
            return Ok(false);
        }
        let (j, k) = match self.swap_mode {
            SwapMode::Neighbour => {
                let rank = self.swap_rng.index(count - 1);
                (self.chain_with_rank(rank), self.chain_with_rank(rank + 1))
            }
            SwapMode::Random => {
                let j = self.swap_rng.index(count);
                let mut k = self.swap_rng.index(count - 1);
                if k >= j {
                    k += 1;
                }
                (j, k)
            }
        };
        let heat_j = self.chains[j].heat();
        let heat_k = self.chains[k].heat();
        let ln_ratio = swap_ln_ratio(
            heat_j,
            self.chains[j].ln_posterior(),
            heat_k,
            self.chains[k].ln_posterior(),
        );
        let u = self.swap_rng.uniform01();
        self.swaps.tried += 1;
        self.window.tried += 1;
        let accepted = u.ln() < ln_ratio;
        if accepted {
            self.swaps.accepted += 1;
            self.window.accepted += 1;
            self.chains[j].set_heat(heat_k);
            self.chains[k].set_heat(heat_j);
            self.ranks.swap(j, k);
            for (chain, &rank) in self.chains.iter_mut().zip(&self.ranks) {
                chain.set_active(rank == 0);
            }
        }
        debug!(
            "swap chains {j}<->{k} at generation {}: ln ratio {ln_ratio:.4}, accepted {accepted}",
            self.generation()
        );
        Ok(accepted)
    }

    fn tune_heats(&mut self) {
        if self.window.tried == 0 {
            return;
        }
        let rate = self.window.rate();
        let target = DEFAULT_TARGET_RATE;
        self.delta = if rate > target {
            self.delta * (1.0 + (rate - target) / (1.0 - target))
        } else {
            self.delta / (2.0 - rate / target)
        };
        self.window = SwapCounters::default();
        for (chain, &rank) in self.chains.iter_mut().zip(&self.ranks) {
            chain.set_heat(heat_for_rank(self.delta, rank));
        }
        debug!("tempering: swap rate {rate:.3}, delta now {:.4}", self.delta);
    }

    fn drive(&mut self, generations: u64, phase: Phase) -> Result<(), AdmixError> {
        let start = self.generation();
        let mut done = 0;
        while done < generations {
            let current = start + done;
            let mut block =
                (generations - done).min(generations_until(current, self.swap_interval));
            match phase {
                Phase::Burnin { tuning_interval } => {
                    block = block.min(generations_until(done, tuning_interval));
                }
                Phase::Sampling => {
                    for monitor in &self.monitors {
                        block = block.min(generations_until(current, monitor.interval()));
                    }
                }
            }
            self.advance_all(block)?;
            done += block;
            let generation = start + done;
            if self.swap_interval > 0 && generation % self.swap_interval == 0 {
                self.swap()?;
            }
            match phase {
                Phase::Burnin { tuning_interval } => {
                    if tuning_interval > 0 && done % tuning_interval == 0 {
                        for chain in &mut self.chains {
                            chain.tune_moves();
                        }
                        if self.tune_delta {
                            self.tune_heats();
                        }
                    }
                }
                Phase::Sampling => self.report_monitors()?,
            }
        }
        Ok(())
    }

    fn report_monitors(&mut self) -> Result<(), AdmixError> {
        let cold = self.cold_index();
        let generation = self.chains[cold].generation();
        let view = self.chains[cold].view();
        for monitor in &mut self.monitors {
            if monitor.is_due(generation) {
                monitor.report(generation, &view)?;
            }
        }
        Ok(())
    }

    /// Burn-in with move tuning and, if configured, heat tuning.
    pub fn burnin(&mut self, generations: u64, tuning_interval: u64) -> Result<(), AdmixError> {
        info!("tempering: burn-in for {generations} generations");
        for chain in &mut self.chains {
            chain.reset_counters();
        }
        self.drive(generations, Phase::Burnin { tuning_interval })?;
        for chain in &mut self.chains {
            chain.reset_counters();
        }
        self.swaps = SwapCounters::default();
        self.window = SwapCounters::default();
        Ok(())
    }

    /// Samples `generations` generations, reporting the active chain.
    pub fn run(&mut self, generations: u64) -> Result<(), AdmixError> {
        info!(
            "tempering: sampling {generations} generations from generation {}",
            self.generation()
        );
        for monitor in &mut self.monitors {
            monitor.open()?;
        }
        if !self.headers_written {
            self.headers_written = true;
            let cold = self.cold_index();
            let generation = self.chains[cold].generation();
            let view = self.chains[cold].view();
            for monitor in &mut self.monitors {
                monitor.print_header(&view)?;
                if monitor.is_due(generation) {
                    monitor.report(generation, &view)?;
                }
            }
        }
        self.drive(generations, Phase::Sampling)?;
        for monitor in &mut self.monitors {
            monitor.close()?;
        }
        Ok(())
    }

    /// Operator counters of the active chain.
    pub fn operator_summary(&self) -> Vec<OperatorSummary> {
        self.cold_chain().operator_summary()
    }

    /// Operator table of the active chain followed by the swap statistics.
    pub fn print_operator_summary<W: Write>(&self, writer: &mut W) -> Result<(), AdmixError> {
        write_operator_table(writer, &self.operator_summary())?;
        writeln!(
            writer,
            "swaps: tried {} accepted {} ratio {:.4} delta {:.4}",
            self.swaps.tried,
            self.swaps.accepted,
            self.swaps.rate(),
            self.delta
        )
        .map_err(|err| AdmixError::Serde(ErrorInfo::new("summary-write", err.to_string())))
    }

    pub(crate) fn chains_mut(&mut self) -> &mut [Mcmc] {
        &mut self.chains
    }

    pub(crate) fn restore_ladder(&mut self, ranks: Vec<usize>, delta: f64, swap_seed: u64) {
        self.ranks = ranks;
        self.delta = delta;
        self.swap_rng = RngHandle::from_seed(swap_seed);
        self.headers_written = false;
        for (chain, &rank) in self.chains.iter_mut().zip(&self.ranks) {
            chain.set_heat(heat_for_rank(delta, rank));
            chain.set_active(rank == 0);
        }
    }
}
