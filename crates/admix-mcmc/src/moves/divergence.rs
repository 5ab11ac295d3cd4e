//! Moves that trade an admixture edge for a divergence and back.
//!
//! The merge removes an edge and regrafts the divergence above its
//! destination onto the source branch at the edge age. The split picks a
//! divergence, lifts it to a new age on another lineage and leaves an edge
//! from the sibling branch behind at the old age.

use std::f64::consts::LN_2;

use admix_core::errors::AdmixError;
use admix_core::stats::sample_beta;
use admix_core::{NodeId, RngHandle, VariableId};
use admix_dag::Model;
use admix_tree::{AdmixtureEdge, AdmixtureTree, ArenaMark, PruneRegraft, RemovedAdmixture};
use log::debug;

use super::admixture::{new_weight_ln_density, NEW_WEIGHT_SHAPE};
use super::{missing_record, single_target, Move, MoveCore, Proposal};

/// Non-root divergence nodes.
fn split_candidates(tree: &AdmixtureTree) -> Vec<NodeId> {
    let root = tree.root();
    tree.divergence_nodes()
        .into_iter()
        .filter(|&id| id != root)
        .collect()
}

/// Lineages at `age` that can receive `divergence` when it is lifted with
/// `moved`: same outgroup flag, and not the lineage the divergence hangs from.
fn split_targets(
    tree: &AdmixtureTree,
    divergence: NodeId,
    moved: NodeId,
    age: f64,
) -> Result<Vec<NodeId>, AdmixError> {
    let outgroup = tree.node(moved)?.is_outgroup();
    let mut targets = Vec::new();
    for lineage in tree.lineages_at(age) {
        if tree.node(lineage)?.is_outgroup() == outgroup
            && !tree.is_descendant(divergence, lineage)?
        {
            targets.push(lineage);
        }
    }
    Ok(targets)
}

#[derive(Debug, Clone)]
struct MergeRecord {
    removed: RemovedAdmixture,
    regraft: PruneRegraft,
    merged: NodeId,
    old_age: f64,
}

/// Reversible-jump merge of an admixture edge into a divergence.
///
/// A uniformly chosen edge is removed; the divergence directly above its
/// destination is pruned together with the destination branch and regrafted
/// onto the source branch at the edge age. Edges whose destination does not
/// hang directly below a non-root divergence, or whose source descends from
/// that divergence, are infeasible.
#[derive(Debug, Clone)]
pub struct AdmixtureEdgeDivergenceMerge {
    core: MoveCore,
    stored: Option<MergeRecord>,
}

impl AdmixtureEdgeDivergenceMerge {
    /// Merge move on `tree`.
    pub fn new(tree: VariableId, weight: f64) -> Self {
        Self::with_core(MoveCore::new(
            "admixture-edge-divergence-merge",
            vec![tree],
            weight,
        ))
    }

    /// Merge move with a custom core.
    pub fn with_core(core: MoveCore) -> Self {
        Self { core, stored: None }
    }
}

impl Move for AdmixtureEdgeDivergenceMerge {
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
        let destination = children[rng.index(events)];
        let edge = tree.edge_of(destination)?;
        let Some(merged) = tree.parent(destination)? else {
            self.core.fail();
            return Ok(Proposal::infeasible());
        };
        let merged_node = tree.node(merged)?;
        if !merged_node.is_divergence() || merged_node.is_root() {
            debug!("divergence merge: {destination} does not hang below a non-root divergence");
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        if tree.is_descendant(edge.parent, merged)? {
            debug!("divergence merge: source of {destination} descends from {merged}");
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let moved = tree.children(destination)?[0];
        let source_branch = tree.children(edge.parent)?[0];
        let slot = if merged_node.children()[0] == destination { 1 } else { 0 };
        let sibling = merged_node.children()[slot];
        let outgroup = tree.node(moved)?.is_outgroup();
        if tree.node(source_branch)?.is_outgroup() != outgroup
            || tree.node(sibling)?.is_outgroup() != outgroup
        {
            debug!("divergence merge: outgroup flags differ around {merged}");
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let old_age = merged_node.age();
        let height = tree.tree_height();

        let tree = model.tree_mut(target)?;
        let removed = tree.remove_admixture_edge(destination)?;
        let age = removed.age();
        let weight = removed.weight();
        tree.set_age(merged, age)?;
        let regraft = tree.prune_regraft(removed.child_branch(), removed.parent_branch())?;

        let tree = model.tree(target)?;
        let candidates = split_candidates(tree).len();
        let targets = split_targets(tree, merged, moved, old_age)?.len();
        let ln_hastings_ratio = (events as f64).ln()
            - (candidates as f64).ln()
            - LN_2
            - (height - age).ln()
            - (targets as f64).ln()
            + new_weight_ln_density(weight);
        self.stored = Some(MergeRecord {
            removed,
            regraft,
            merged,
            old_age,
        });
        Ok(Proposal::new(ln_hastings_ratio))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let record = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        let tree = model.tree_mut(target)?;
        tree.undo_prune_regraft(&record.regraft)?;
        tree.set_age(record.merged, record.old_age)?;
        tree.restore_admixture_edge(&record.removed)
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
struct SplitRecord {
    split: NodeId,
    old_age: f64,
    regraft: PruneRegraft,
    edge: AdmixtureEdge,
    mark: ArenaMark,
}

/// Reversible-jump split of a divergence into an admixture edge; the exact
/// inverse of [`AdmixtureEdgeDivergenceMerge`].
///
/// Picks a non-root divergence and one of its children uniformly, draws a new
/// age uniformly between the divergence and the root, and regrafts the
/// divergence with that child onto a lineage spanning the new age. An edge
/// with weight `w = Beta(1, 3) / 2` from the sibling branch into the moved
/// child keeps the old age.
#[derive(Debug, Clone)]
pub struct AdmixtureEdgeDivergenceSplit {
    core: MoveCore,
    max_events: usize,
    stored: Option<SplitRecord>,
}

impl AdmixtureEdgeDivergenceSplit {
    /// Split move on `tree`, allowing at most `max_events` edges.
    pub fn new(tree: VariableId, max_events: usize, weight: f64) -> Self {
        Self::with_core(
            MoveCore::new("admixture-edge-divergence-split", vec![tree], weight),
            max_events,
        )
    }

    /// Split move with a custom core.
    pub fn with_core(core: MoveCore, max_events: usize) -> Self {
        Self {
            core,
            max_events,
            stored: None,
        }
    }
}

impl Move for AdmixtureEdgeDivergenceSplit {
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
            debug!("divergence split: already at {events} events");
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let candidates = split_candidates(tree);
        if candidates.is_empty() {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let split = candidates[rng.index(candidates.len())];
        let slot = rng.index(2);
        let children = tree.children(split)?;
        let (moved, sibling) = (children[slot], children[1 - slot]);
        if tree.node(moved)?.is_outgroup() != tree.node(sibling)?.is_outgroup() {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let age = tree.age(split)?;
        let height = tree.tree_height();
        let new_age = age + (height - age) * rng.uniform01();
        if !(new_age > age && new_age < height) {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let targets = split_targets(tree, split, moved, new_age)?;
        if targets.is_empty() {
            debug!("divergence split: no lineage receives {split} at {new_age}");
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let destination = targets[rng.index(targets.len())];
        let weight = 0.5 * sample_beta(rng, NEW_WEIGHT_SHAPE.0, NEW_WEIGHT_SHAPE.1)?;
        if !(weight > 0.0) {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let mark = tree.mark();

        let tree = model.tree_mut(target)?;
        tree.set_age(split, new_age)?;
        let regraft = tree.prune_regraft(moved, destination)?;
        let edge = tree.add_admixture_edge(sibling, moved, age, weight)?;
        self.stored = Some(SplitRecord {
            split,
            old_age: age,
            regraft,
            edge,
            mark,
        });
        let ln_hastings_ratio = (candidates.len() as f64).ln()
            + LN_2
            + (height - age).ln()
            + (targets.len() as f64).ln()
            - new_weight_ln_density(weight)
            - ((events + 1) as f64).ln();
        Ok(Proposal::new(ln_hastings_ratio))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let record = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        let tree = model.tree_mut(target)?;
        tree.undo_add_admixture_edge(record.edge, &record.mark)?;
        tree.undo_prune_regraft(&record.regraft)?;
        tree.set_age(record.split, record.old_age)
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}
