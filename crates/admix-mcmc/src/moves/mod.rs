//! Metropolis-Hastings proposals and their shared bookkeeping.
//!
//! Every move follows the same protocol: [`Move::propose`] touches and edits
//! the model, the driver evaluates the acceptance ratio, and exactly one of
//! [`Move::accept`] or [`Move::reject`] closes the proposal. Moves keep the
//! references they need to invert their edit so that a rejection restores
//! the tree bit for bit.

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_core::stats::{beta_ln_pdf, sample_beta};
use admix_core::{RngHandle, VariableId};
use admix_dag::Model;
use log::warn;
use serde::{Deserialize, Serialize};

mod admixture;
mod divergence;
mod scalar;
mod slide;
mod topology;

pub use admixture::{
    AdmixtureEdgeAdd, AdmixtureEdgeRemove, AdmixtureEdgeReversePolarity, AdmixtureEdgeReweight,
};
pub use divergence::{AdmixtureEdgeDivergenceMerge, AdmixtureEdgeDivergenceSplit};
pub use scalar::{ScaleMove, SlideMove};
pub use slide::AdmixtureEdgeSlide;
pub use topology::{FixedNodeheightPruneRegraft, NarrowExchange, NodeTimeSlideBeta};

/// Acceptance rate the tuning rule steers towards unless overridden.
pub const DEFAULT_TARGET_RATE: f64 = 0.44;

/// Ratios returned by a proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proposal {
    /// Log proposal-density ratio, including any Jacobian.
    pub ln_hastings_ratio: f64,
    /// Move-local prior term added on top of the model ratio.
    pub ln_prior_ratio: f64,
}

impl Proposal {
    /// Proposal with the given Hastings ratio and no prior term.
    pub fn new(ln_hastings_ratio: f64) -> Self {
        Self {
            ln_hastings_ratio,
            ln_prior_ratio: 0.0,
        }
    }

    /// Adds a move-local prior term.
    pub fn with_prior_ratio(mut self, ln_prior_ratio: f64) -> Self {
        self.ln_prior_ratio = ln_prior_ratio;
        self
    }

    /// Ratio returned alongside the failed flag.
    pub fn infeasible() -> Self {
        Self::new(f64::NEG_INFINITY)
    }
}

/// Protocol state of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveState {
    /// No proposal pending.
    Idle,
    /// A proposal awaits acceptance or rejection.
    Proposed,
}

/// Name, weight, targets, counters and tuning shared by every move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveCore {
    name: String,
    targets: Vec<VariableId>,
    weight: f64,
    active_after: u64,
    target_rate: f64,
    auto_tune: bool,
    state: MoveState,
    failed: bool,
    tried: u64,
    accepted: u64,
    failures: u64,
    window_tried: u64,
    window_accepted: u64,
}

impl MoveCore {
    /// Creates an idle core with the default target rate and tuning enabled.
    pub fn new(name: impl Into<String>, targets: Vec<VariableId>, weight: f64) -> Self {
        Self {
            name: name.into(),
            targets,
            weight,
            active_after: 0,
            target_rate: DEFAULT_TARGET_RATE,
            auto_tune: true,
            state: MoveState::Idle,
            failed: false,
            tried: 0,
            accepted: 0,
            failures: 0,
            window_tried: 0,
            window_accepted: 0,
        }
    }

    /// Keeps the move inactive while the generation is at most `generation`.
    pub fn with_delay(mut self, generation: u64) -> Self {
        self.active_after = generation;
        self
    }

    /// Overrides the acceptance rate used by the tuning rule.
    pub fn with_target_rate(mut self, rate: f64) -> Self {
        self.target_rate = rate;
        self
    }

    /// Enables or disables tuning during burn-in.
    pub fn with_auto_tune(mut self, enabled: bool) -> Self {
        self.auto_tune = enabled;
        self
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Variables the move edits.
    pub fn targets(&self) -> &[VariableId] {
        &self.targets
    }

    /// Relative selection weight.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Last generation during which the move stays inactive.
    pub fn active_after(&self) -> u64 {
        self.active_after
    }

    /// Whether the move may be selected at `generation`.
    pub fn is_active(&self, generation: u64) -> bool {
        generation > self.active_after
    }

    /// Acceptance rate the tuning rule steers towards.
    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    /// Whether burn-in tuning applies to this move.
    pub fn auto_tune(&self) -> bool {
        self.auto_tune
    }

    /// Current protocol state.
    pub fn state(&self) -> MoveState {
        self.state
    }

    /// Whether the pending proposal was infeasible.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Flags the pending proposal as infeasible. Call before mutating anything.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// Proposals made since the last counter reset.
    pub fn tried(&self) -> u64 {
        self.tried
    }

    /// Proposals accepted since the last counter reset.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Infeasible proposals since the last counter reset.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Overall acceptance ratio, zero before the first proposal.
    pub fn acceptance_ratio(&self) -> f64 {
        if self.tried == 0 {
            0.0
        } else {
            self.accepted as f64 / self.tried as f64
        }
    }

    /// Acceptance rate within the current tuning window, if anything was tried.
    pub fn window_rate(&self) -> Option<f64> {
        (self.window_tried > 0).then(|| self.window_accepted as f64 / self.window_tried as f64)
    }

    /// Clears the tuning window.
    pub fn reset_window(&mut self) {
        self.window_tried = 0;
        self.window_accepted = 0;
    }

    /// Clears every counter.
    pub fn reset_counters(&mut self) {
        self.tried = 0;
        self.accepted = 0;
        self.failures = 0;
        self.reset_window();
    }

    /// Drops a pending proposal without touching the model.
    pub fn reset(&mut self) {
        self.state = MoveState::Idle;
        self.failed = false;
    }

    /// Rescales a step size: rates above target enlarge it, rates below shrink it.
    pub fn tuned_step(&self, step: f64, rate: f64) -> f64 {
        let target = self.target_rate;
        if rate > target {
            step * (1.0 + (rate - target) / (1.0 - target))
        } else {
            step / (2.0 - rate / target)
        }
    }

    /// Same rule for a concentration parameter, where larger means smaller steps.
    pub fn tuned_concentration(&self, concentration: f64, rate: f64) -> f64 {
        let target = self.target_rate;
        if rate > target {
            concentration / (1.0 + (rate - target) / (1.0 - target))
        } else {
            concentration * (2.0 - rate / target)
        }
    }

    fn begin(&mut self) -> Result<(), AdmixError> {
        if self.state == MoveState::Proposed {
            return Err(AdmixError::Move(
                ErrorInfo::new("move-not-resolved", "previous proposal is still pending")
                    .with_context("move", &self.name),
            ));
        }
        self.state = MoveState::Proposed;
        self.failed = false;
        Ok(())
    }

    fn expect_proposed(&self, operation: &str) -> Result<(), AdmixError> {
        if self.state == MoveState::Proposed {
            Ok(())
        } else {
            Err(AdmixError::Move(
                ErrorInfo::new("no-pending-proposal", "nothing to resolve")
                    .with_context("move", &self.name)
                    .with_context("operation", operation),
            ))
        }
    }

    fn finish(&mut self, accepted: bool) {
        self.tried += 1;
        self.window_tried += 1;
        if accepted {
            self.accepted += 1;
            self.window_accepted += 1;
        }
        if self.failed {
            self.failures += 1;
        }
        self.state = MoveState::Idle;
        self.failed = false;
    }
}

/// A Metropolis-Hastings proposal over one or more model variables.
///
/// Implementors provide the edit hooks; the provided `propose`/`accept`/`reject`
/// methods enforce the protocol and update the shared counters.
pub trait Move: Send {
    /// Shared bookkeeping.
    fn core(&self) -> &MoveCore;

    /// Shared bookkeeping, mutable.
    fn core_mut(&mut self) -> &mut MoveCore;

    /// Draws randomness, touches and edits the model. Infeasible proposals call
    /// [`MoveCore::fail`] and return [`Proposal::infeasible`] without editing.
    fn propose_edit(
        &mut self,
        model: &mut Model,
        rng: &mut RngHandle,
    ) -> Result<Proposal, AdmixError>;

    /// Move-local commit, run before the model keeps its touched variables.
    fn commit_edit(&mut self, _model: &mut Model) -> Result<(), AdmixError> {
        Ok(())
    }

    /// Inverts the edit made by the last `propose_edit`.
    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError>;

    /// Adjusts the tuning parameter given the window acceptance rate.
    fn tune(&mut self, _rate: f64) {}

    /// Current tuning parameter, if the move has one.
    fn tuning_parameter(&self) -> Option<f64> {
        None
    }

    /// Overwrites the tuning parameter, e.g. when resuming from a checkpoint.
    fn set_tuning_parameter(&mut self, _value: f64) {}

    /// Clones the move behind a box.
    fn box_clone(&self) -> Box<dyn Move>;

    /// Starts a proposal.
    fn propose(&mut self, model: &mut Model, rng: &mut RngHandle) -> Result<Proposal, AdmixError> {
        self.core_mut().begin()?;
        let mut proposal = match self.propose_edit(model, rng) {
            Ok(proposal) => proposal,
            Err(err) => {
                self.core_mut().reset();
                return Err(err);
            }
        };
        let ratio = proposal.ln_hastings_ratio;
        if ratio.is_nan() || ratio == f64::INFINITY {
            warn!(
                "move {} produced a non-finite hastings ratio {ratio}; rejecting",
                self.core().name()
            );
            proposal.ln_hastings_ratio = f64::NEG_INFINITY;
        }
        Ok(proposal)
    }

    /// Accepts the pending proposal and commits the touched variables.
    fn accept(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        self.core().expect_proposed("accept")?;
        if self.core().is_failed() {
            return Err(AdmixError::Move(
                ErrorInfo::new("accept-failed-proposal", "infeasible proposals cannot be accepted")
                    .with_context("move", self.core().name()),
            ));
        }
        self.commit_edit(model)?;
        model.keep_touched()?;
        self.core_mut().finish(true);
        Ok(())
    }

    /// Rejects the pending proposal, inverting the edit before the model restores.
    fn reject(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        self.core().expect_proposed("reject")?;
        if !self.core().is_failed() {
            self.revert_edit(model)?;
        }
        model.restore_touched()?;
        self.core_mut().finish(false);
        Ok(())
    }
}

impl Clone for Box<dyn Move> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Outcome of a Beta relative-position draw on the unit interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BetaStep {
    /// Proposed unit position.
    pub position: f64,
    /// `lnBeta(u | a', b') - lnBeta(u' | a, b)`.
    pub ln_hastings_ratio: f64,
}

/// Beta relative-position proposal centred on `position` with concentration `lambda`.
pub fn beta_step(
    rng: &mut RngHandle,
    position: f64,
    lambda: f64,
) -> Result<BetaStep, AdmixError> {
    let (a, b) = beta_shape(position, lambda);
    let proposed = sample_beta(rng, a, b)?;
    let (a_back, b_back) = beta_shape(proposed, lambda);
    let ln_hastings_ratio = beta_ln_pdf(a_back, b_back, position) - beta_ln_pdf(a, b, proposed);
    Ok(BetaStep {
        position: proposed,
        ln_hastings_ratio,
    })
}

fn beta_shape(position: f64, lambda: f64) -> (f64, f64) {
    (lambda * position + 1.0, lambda * (1.0 - position) + 1.0)
}

/// Move-local prior term for admixture weights, evaluated on `2w`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PriorRatioTerm {
    /// The model density already carries the weight prior.
    #[default]
    Excluded,
    /// `ln Beta(2w' | alpha, beta) - ln Beta(2w | alpha, beta)`.
    Beta {
        /// First shape parameter.
        alpha: f64,
        /// Second shape parameter.
        beta: f64,
    },
}

impl PriorRatioTerm {
    /// Prior ratio for a weight change from `old_weight` to `new_weight`.
    pub fn ln_ratio(&self, old_weight: f64, new_weight: f64) -> f64 {
        match *self {
            PriorRatioTerm::Excluded => 0.0,
            PriorRatioTerm::Beta { alpha, beta } => {
                beta_ln_pdf(alpha, beta, 2.0 * new_weight)
                    - beta_ln_pdf(alpha, beta, 2.0 * old_weight)
            }
        }
    }
}

pub(crate) fn single_target(core: &MoveCore) -> Result<VariableId, AdmixError> {
    match core.targets() {
        [target] => Ok(*target),
        targets => Err(AdmixError::Move(
            ErrorInfo::new("target-count", "move edits exactly one variable")
                .with_context("move", core.name())
                .with_context("targets", targets.len()),
        )),
    }
}

pub(crate) fn missing_record(core: &MoveCore) -> AdmixError {
    AdmixError::Move(
        ErrorInfo::new("missing-record", "no stored edit to invert")
            .with_context("move", core.name()),
    )
}
