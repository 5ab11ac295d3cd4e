//! Topology and node-age moves on the underlying tree.

use admix_core::errors::AdmixError;
use admix_core::{NodeId, RngHandle, VariableId};
use admix_dag::Model;
use admix_tree::{AdmixtureTree, PruneRegraft};
use log::debug;

use super::{beta_step, missing_record, single_target, Move, MoveCore, Proposal};

/// Swaps a node with its uncle.
///
/// The chosen node must not be the root or an admixture node, its parent a
/// non-root divergence node and its grandparent a divergence node. The uncle has
/// to be younger than the parent, not an admixture node and in the same
/// outgroup partition as the node.
#[derive(Debug, Clone)]
pub struct NarrowExchange {
    core: MoveCore,
    stored: Option<(NodeId, NodeId)>,
}

impl NarrowExchange {
    /// Narrow exchange on the tree variable `tree`.
    pub fn new(tree: VariableId, weight: f64) -> Self {
        Self::with_core(MoveCore::new("narrow-exchange", vec![tree], weight))
    }

    /// Narrow exchange with a custom core.
    pub fn with_core(core: MoveCore) -> Self {
        Self { core, stored: None }
    }
}

fn exchange_partner(tree: &AdmixtureTree, id: NodeId) -> Result<Option<NodeId>, AdmixError> {
    let node = tree.node(id)?;
    if node.is_admixture() {
        return Ok(None);
    }
    let Some(parent) = node.parent() else {
        return Ok(None);
    };
    let parent_node = tree.node(parent)?;
    if !parent_node.is_divergence() {
        return Ok(None);
    }
    let Some(grandparent) = parent_node.parent() else {
        return Ok(None);
    };
    let grandparent_node = tree.node(grandparent)?;
    if !grandparent_node.is_divergence() {
        return Ok(None);
    }
    let Some(uncle) = grandparent_node
        .children()
        .iter()
        .copied()
        .find(|&child| child != parent)
    else {
        return Ok(None);
    };
    let uncle_node = tree.node(uncle)?;
    if uncle_node.age() >= parent_node.age()
        || uncle_node.is_admixture()
        || uncle_node.is_outgroup() != node.is_outgroup()
    {
        return Ok(None);
    }
    Ok(Some(uncle))
}

impl Move for NarrowExchange {
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
        let ids: Vec<NodeId> = tree.node_ids().collect();
        let node = ids[rng.index(ids.len())];
        let Some(uncle) = exchange_partner(tree, node)? else {
            debug!("narrow exchange: no valid uncle for {node}");
            self.core.fail();
            return Ok(Proposal::infeasible());
        };
        model.tree_mut(target)?.exchange(node, uncle)?;
        self.stored = Some((node, uncle));
        Ok(Proposal::new(0.0))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let (node, uncle) = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        model.tree_mut(target)?.exchange(node, uncle)
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}

/// Prunes the parent of a node and regrafts it at the same age elsewhere.
///
/// Target branches span the pruned age, lie outside the moved subtree and share
/// its outgroup flag. Nodes without any target are not candidates, so the
/// Hastings ratio is the ratio of candidate counts before and after.
#[derive(Debug, Clone)]
pub struct FixedNodeheightPruneRegraft {
    core: MoveCore,
    stored: Option<PruneRegraft>,
}

impl FixedNodeheightPruneRegraft {
    /// Prune-and-regraft on the tree variable `tree`.
    pub fn new(tree: VariableId, weight: f64) -> Self {
        Self::with_core(MoveCore::new("fixed-nodeheight-prune-regraft", vec![tree], weight))
    }

    /// Prune-and-regraft with a custom core.
    pub fn with_core(core: MoveCore) -> Self {
        Self { core, stored: None }
    }
}

struct PruneCandidate {
    subtree: NodeId,
    targets: Vec<NodeId>,
}

fn prune_candidates(tree: &AdmixtureTree) -> Result<Vec<PruneCandidate>, AdmixError> {
    let mut candidates = Vec::new();
    for id in tree.node_ids() {
        let Some(parent) = tree.parent(id)? else {
            continue;
        };
        let pruned = tree.node(parent)?;
        if pruned.is_root() || !pruned.is_divergence() {
            continue;
        }
        let outgroup = pruned.is_outgroup();
        let mut targets = Vec::new();
        for lineage in tree.lineages_at(pruned.age()) {
            if tree.node(lineage)?.is_outgroup() == outgroup {
                targets.push(lineage);
            }
        }
        if !targets.is_empty() {
            candidates.push(PruneCandidate {
                subtree: id,
                targets,
            });
        }
    }
    Ok(candidates)
}

impl Move for FixedNodeheightPruneRegraft {
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
        let candidates = prune_candidates(model.tree(target)?)?;
        if candidates.is_empty() {
            debug!("prune-regraft: no candidate subtree");
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let chosen = &candidates[rng.index(candidates.len())];
        let regraft = chosen.targets[rng.index(chosen.targets.len())];
        let record = model.tree_mut(target)?.prune_regraft(chosen.subtree, regraft)?;
        self.stored = Some(record);
        let after = prune_candidates(model.tree(target)?)?.len();
        Ok(Proposal::new((candidates.len() as f64).ln() - (after as f64).ln()))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let record = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        model.tree_mut(target)?.undo_prune_regraft(&record)
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}

/// Beta relative-position slide of one node age between its children and parent.
///
/// Admixture pairs move together; the floor and ceiling take both ends into
/// account.
#[derive(Debug, Clone)]
pub struct NodeTimeSlideBeta {
    core: MoveCore,
    lambda: f64,
    stored: Option<AgeRecord>,
}

#[derive(Debug, Clone, Copy)]
struct AgeRecord {
    node: NodeId,
    partner: Option<NodeId>,
    age: f64,
}

impl NodeTimeSlideBeta {
    /// Node-age slide on the tree variable `tree` with concentration `lambda`.
    pub fn new(tree: VariableId, lambda: f64, weight: f64) -> Self {
        Self::with_core(MoveCore::new("node-time-slide-beta", vec![tree], weight), lambda)
    }

    /// Node-age slide with a custom core.
    pub fn with_core(core: MoveCore, lambda: f64) -> Self {
        Self {
            core,
            lambda,
            stored: None,
        }
    }
}

fn age_candidates(tree: &AdmixtureTree) -> Vec<NodeId> {
    let mut candidates = Vec::new();
    for id in tree.node_ids() {
        let Ok(node) = tree.node(id) else {
            continue;
        };
        let movable = if node.is_admixture() {
            node.admixture_parent().is_some()
        } else {
            node.is_divergence() && !node.is_root()
        };
        if movable {
            candidates.push(id);
        }
    }
    candidates
}

fn age_bounds(tree: &AdmixtureTree, ends: &[NodeId]) -> Result<(f64, f64), AdmixError> {
    let mut floor = f64::NEG_INFINITY;
    let mut ceiling = f64::INFINITY;
    for &end in ends {
        for &child in tree.children(end)? {
            floor = floor.max(tree.age(child)?);
        }
        if let Some(parent) = tree.parent(end)? {
            ceiling = ceiling.min(tree.age(parent)?);
        }
    }
    Ok((floor, ceiling))
}

impl Move for NodeTimeSlideBeta {
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
        let candidates = age_candidates(tree);
        if candidates.is_empty() {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let node = candidates[rng.index(candidates.len())];
        let partner = tree.node(node)?.partner();
        let ends: Vec<NodeId> = std::iter::once(node).chain(partner).collect();
        let (floor, ceiling) = age_bounds(tree, &ends)?;
        let age = tree.age(node)?;
        if !(floor < ceiling) {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let span = ceiling - floor;
        let step = beta_step(rng, (age - floor) / span, self.lambda)?;
        let proposed = floor + step.position * span;
        if !(floor < proposed && proposed < ceiling) {
            debug!("node-time slide: proposed age {proposed} outside ({floor}, {ceiling})");
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let tree = model.tree_mut(target)?;
        for &end in &ends {
            tree.set_age(end, proposed)?;
        }
        self.stored = Some(AgeRecord { node, partner, age });
        Ok(Proposal::new(step.ln_hastings_ratio))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let record = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        let tree = model.tree_mut(target)?;
        tree.set_age(record.node, record.age)?;
        if let Some(partner) = record.partner {
            tree.set_age(partner, record.age)?;
        }
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
