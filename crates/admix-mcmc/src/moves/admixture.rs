//! Moves that add, remove and reweight admixture edges.

use std::f64::consts::LN_2;

use admix_core::errors::AdmixError;
use admix_core::stats::{beta_ln_pdf, sample_beta};
use admix_core::{NodeId, RngHandle, VariableId};
use admix_dag::Model;
use admix_tree::{AdmixtureEdge, AdmixtureTree, ArenaMark, RemovedAdmixture};
use log::debug;

use super::{beta_step, missing_record, single_target, Move, MoveCore, PriorRatioTerm, Proposal};

/// Shape parameters of the `Beta` law on `2w` used when drawing new weights.
pub(super) const NEW_WEIGHT_SHAPE: (f64, f64) = (1.0, 3.0);

/// Log-density of a new weight `w = Beta(1, 3) / 2`.
pub(super) fn new_weight_ln_density(weight: f64) -> f64 {
    LN_2 + beta_ln_pdf(NEW_WEIGHT_SHAPE.0, NEW_WEIGHT_SHAPE.1, 2.0 * weight)
}

fn matching_lineages(
    tree: &AdmixtureTree,
    lineages: &[NodeId],
    source: NodeId,
) -> Result<Vec<NodeId>, AdmixError> {
    let outgroup = tree.node(source)?.is_outgroup();
    let mut matching = Vec::new();
    for &lineage in lineages {
        if lineage != source && tree.node(lineage)?.is_outgroup() == outgroup {
            matching.push(lineage);
        }
    }
    Ok(matching)
}

/// Reversible-jump birth of an admixture edge.
///
/// Draws an age uniformly below the root, an ordered pair of distinct lineages
/// spanning that age in the same outgroup partition and a weight
/// `w = Beta(1, 3) / 2`.
#[derive(Debug, Clone)]
pub struct AdmixtureEdgeAdd {
    core: MoveCore,
    max_events: usize,
    stored: Option<(AdmixtureEdge, ArenaMark)>,
}

impl AdmixtureEdgeAdd {
    /// Edge birth on `tree`, allowing at most `max_events` edges.
    pub fn new(tree: VariableId, max_events: usize, weight: f64) -> Self {
        Self::with_core(MoveCore::new("admixture-edge-add", vec![tree], weight), max_events)
    }

    /// Edge birth with a custom core.
    pub fn with_core(core: MoveCore, max_events: usize) -> Self {
        Self {
            core,
            max_events,
            stored: None,
        }
    }
}

impl Move for AdmixtureEdgeAdd {
    fn core(&self) -> &MoveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MoveCore {
        &mut self.core
    }

    fn propose_edit(
        &mut self,
        model: &mut Model,
        rng: &mut RngHandle,
    ) -> Result<Proposal, AdmixError> {
        let target = single_target(&self.core)?;
        let tree = model.tree(target)?;
        let events = tree.num_admixture_events();
        if events >= self.max_events {
            debug!("admixture add: already at {events} events");
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let height = tree.tree_height();
        let age = height * rng.uniform01();
        let lineages = tree.lineages_at(age);
        if lineages.len() < 2 {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let source = lineages[rng.index(lineages.len())];
        let destinations = matching_lineages(tree, &lineages, source)?;
        if destinations.is_empty() {
            debug!("admixture add: no destination matches the outgroup flag of {source}");
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let destination = destinations[rng.index(destinations.len())];
        let weight = 0.5 * sample_beta(rng, NEW_WEIGHT_SHAPE.0, NEW_WEIGHT_SHAPE.1)?;
        if !(weight > 0.0) {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let mark = tree.mark();
        let edge = model
            .tree_mut(target)?
            .add_admixture_edge(source, destination, age, weight)?;
        self.stored = Some((edge, mark));
        let ln_hastings_ratio = height.ln()
            + (lineages.len() as f64).ln()
            + (destinations.len() as f64).ln()
            - ((events + 1) as f64).ln()
            - new_weight_ln_density(weight);
        Ok(Proposal::new(ln_hastings_ratio))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let (edge, mark) = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        model.tree_mut(target)?.undo_add_admixture_edge(edge, &mark)
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}

/// Reversible-jump death of a uniformly chosen admixture edge; the exact inverse
/// of [`AdmixtureEdgeAdd`].
#[derive(Debug, Clone)]
pub struct AdmixtureEdgeRemove {
    core: MoveCore,
    stored: Option<RemovedAdmixture>,
}

impl AdmixtureEdgeRemove {
    /// Edge death on `tree`.
    pub fn new(tree: VariableId, weight: f64) -> Self {
        Self::with_core(MoveCore::new("admixture-edge-remove", vec![tree], weight))
    }

    /// Edge death with a custom core.
    pub fn with_core(core: MoveCore) -> Self {
        Self { core, stored: None }
    }
}

impl Move for AdmixtureEdgeRemove {
    fn core(&self) -> &MoveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MoveCore {
        &mut self.core
    }

    fn propose_edit(
        &mut self,
        model: &mut Model,
        rng: &mut RngHandle,
    ) -> Result<Proposal, AdmixError> {
        let target = single_target(&self.core)?;
        let tree = model.tree(target)?;
        let children = tree.admixture_children();
        if children.is_empty() {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let events = children.len();
        let chosen = children[rng.index(events)];
        let height = tree.tree_height();
        let removed = model.tree_mut(target)?.remove_admixture_edge(chosen)?;
        let tree = model.tree(target)?;
        let lineages = tree.lineages_at(removed.age());
        let destinations = matching_lineages(tree, &lineages, removed.parent_branch())?;
        let ln_hastings_ratio = (events as f64).ln()
            - height.ln()
            - (lineages.len() as f64).ln()
            - (destinations.len() as f64).ln()
            + new_weight_ln_density(removed.weight());
        self.stored = Some(removed);
        Ok(Proposal::new(ln_hastings_ratio))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let removed = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        model.tree_mut(target)?.restore_admixture_edge(&removed)
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}

struct WeightDraw {
    node: NodeId,
    weight: f64,
    proposed: f64,
    ln_hastings_ratio: f64,
}

/// Picks an admixture child uniformly and draws a Beta step on `2w`.
fn draw_weight(
    core: &mut MoveCore,
    tree: &AdmixtureTree,
    rng: &mut RngHandle,
    lambda: f64,
) -> Result<Option<WeightDraw>, AdmixError> {
    let children = tree.admixture_children();
    if children.is_empty() {
        core.fail();
        return Ok(None);
    }
    let node = children[rng.index(children.len())];
    let weight = tree.node(node)?.weight();
    let step = beta_step(rng, 2.0 * weight, lambda)?;
    let proposed = 0.5 * step.position;
    if !(proposed > 0.0 && proposed <= 0.5) {
        debug!("{}: proposed weight {proposed} outside (0, 0.5]", core.name());
        core.fail();
        return Ok(None);
    }
    Ok(Some(WeightDraw {
        node,
        weight,
        proposed,
        ln_hastings_ratio: step.ln_hastings_ratio,
    }))
}

/// Beta proposal on twice the weight of a uniformly chosen admixture edge.
#[derive(Debug, Clone)]
pub struct AdmixtureEdgeReweight {
    core: MoveCore,
    lambda: f64,
    prior: PriorRatioTerm,
    stored: Option<(NodeId, f64)>,
}

impl AdmixtureEdgeReweight {
    /// Reweight move on `tree` with concentration `lambda`.
    pub fn new(tree: VariableId, lambda: f64, weight: f64) -> Self {
        Self::with_core(MoveCore::new("admixture-edge-reweight", vec![tree], weight), lambda)
    }

    /// Reweight move with a custom core.
    pub fn with_core(core: MoveCore, lambda: f64) -> Self {
        Self {
            core,
            lambda,
            prior: PriorRatioTerm::default(),
            stored: None,
        }
    }

    /// Sets the move-local prior term.
    pub fn with_prior_term(mut self, prior: PriorRatioTerm) -> Self {
        self.prior = prior;
        self
    }
}

impl Move for AdmixtureEdgeReweight {
    fn core(&self) -> &MoveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MoveCore {
        &mut self.core
    }

    fn propose_edit(
        &mut self,
        model: &mut Model,
        rng: &mut RngHandle,
    ) -> Result<Proposal, AdmixError> {
        let target = single_target(&self.core)?;
        let Some(draw) = draw_weight(&mut self.core, model.tree(target)?, rng, self.lambda)? else {
            return Ok(Proposal::infeasible());
        };
        model.tree_mut(target)?.set_weight(draw.node, draw.proposed)?;
        self.stored = Some((draw.node, draw.weight));
        Ok(Proposal::new(draw.ln_hastings_ratio)
            .with_prior_ratio(self.prior.ln_ratio(draw.weight, draw.proposed)))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let (node, weight) = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        model.tree_mut(target)?.set_weight(node, weight)
    }

    fn tune(&mut self, rate: f64) {
        self.lambda = self.core.tuned_concentration(self.lambda, rate);
    }

    fn tuning_parameter(&self) -> Option<f64> {
        Some(self.lambda)
    }

    fn set_tuning_parameter(&mut self, value: f64) {
        self.lambda = value;
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}

/// Swaps source and destination of an admixture edge, then reweights the new
/// destination with a Beta step on `2w`.
#[derive(Debug, Clone)]
pub struct AdmixtureEdgeReversePolarity {
    core: MoveCore,
    lambda: f64,
    prior: PriorRatioTerm,
    stored: Option<(AdmixtureEdge, f64)>,
}

impl AdmixtureEdgeReversePolarity {
    /// Polarity reversal on `tree` with concentration `lambda`.
    pub fn new(tree: VariableId, lambda: f64, weight: f64) -> Self {
        Self::with_core(
            MoveCore::new("admixture-edge-reverse-polarity", vec![tree], weight),
            lambda,
        )
    }

    /// Polarity reversal with a custom core.
    pub fn with_core(core: MoveCore, lambda: f64) -> Self {
        Self {
            core,
            lambda,
            prior: PriorRatioTerm::default(),
            stored: None,
        }
    }

    /// Sets the move-local prior term.
    pub fn with_prior_term(mut self, prior: PriorRatioTerm) -> Self {
        self.prior = prior;
        self
    }
}

impl Move for AdmixtureEdgeReversePolarity {
    fn core(&self) -> &MoveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MoveCore {
        &mut self.core
    }

    fn propose_edit(
        &mut self,
        model: &mut Model,
        rng: &mut RngHandle,
    ) -> Result<Proposal, AdmixError> {
        let target = single_target(&self.core)?;
        let Some(draw) = draw_weight(&mut self.core, model.tree(target)?, rng, self.lambda)? else {
            return Ok(Proposal::infeasible());
        };
        let tree = model.tree_mut(target)?;
        let reversed = tree.reverse_admixture_edge(draw.node)?;
        tree.set_weight(reversed.child, draw.proposed)?;
        self.stored = Some((reversed, draw.weight));
        Ok(Proposal::new(draw.ln_hastings_ratio)
            .with_prior_ratio(self.prior.ln_ratio(draw.weight, draw.proposed)))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let (reversed, weight) = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        let tree = model.tree_mut(target)?;
        tree.set_weight(reversed.child, weight)?;
        tree.reverse_admixture_edge(reversed.child)?;
        Ok(())
    }

    fn tune(&mut self, rate: f64) {
        self.lambda = self.core.tuned_concentration(self.lambda, rate);
    }

    fn tuning_parameter(&self) -> Option<f64> {
        Some(self.lambda)
    }

    fn set_tuning_parameter(&mut self, value: f64) {
        self.lambda = value;
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}
