//! Admixture-edge slide along the tip paths below each end.

use admix_core::errors::AdmixError;
use admix_core::{NodeId, RngHandle, VariableId};
use admix_dag::Model;
use admix_tree::{AdmixtureEdge, AdmixtureTree, ArenaMark, RemovedAdmixture};
use log::debug;

use super::{beta_step, missing_record, single_target, Move, MoveCore, Proposal};

/// Slides both ends of an admixture edge to a new age and reweights it.
///
/// The edge is lifted out of the tree, one tip is drawn below each end and the
/// new age is a Beta step between the older of the two tips and their most
/// recent common ancestor. Each end is re-spliced on the branch of its tip's
/// ancestry spanning the new age.
#[derive(Debug, Clone)]
pub struct AdmixtureEdgeSlide {
    core: MoveCore,
    age_lambda: f64,
    weight_lambda: f64,
    stored: Option<SlideRecord>,
}

#[derive(Debug, Clone)]
struct SlideRecord {
    removed: RemovedAdmixture,
    mark: ArenaMark,
    edge: Option<AdmixtureEdge>,
}

impl AdmixtureEdgeSlide {
    /// Edge slide on `tree` with concentrations for the age and weight steps.
    pub fn new(tree: VariableId, age_lambda: f64, weight_lambda: f64, weight: f64) -> Self {
        Self::with_core(
            MoveCore::new("admixture-edge-slide", vec![tree], weight),
            age_lambda,
            weight_lambda,
        )
    }

    /// Edge slide with a custom core.
    pub fn with_core(core: MoveCore, age_lambda: f64, weight_lambda: f64) -> Self {
        Self {
            core,
            age_lambda,
            weight_lambda,
            stored: None,
        }
    }
}

/// Ancestor of `tip` (inclusive) whose branch spans `age`, if the walk stays strict.
fn branch_spanning(
    tree: &AdmixtureTree,
    tip: NodeId,
    age: f64,
) -> Result<Option<NodeId>, AdmixError> {
    let mut current = tip;
    loop {
        let Some(parent) = tree.parent(current)? else {
            return Ok(None);
        };
        let ceiling = tree.age(parent)?;
        if age < ceiling {
            return Ok((tree.age(current)? < age).then_some(current));
        }
        current = parent;
    }
}

impl Move for AdmixtureEdgeSlide {
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
        let children = model.tree(target)?.admixture_children();
        if children.is_empty() {
            self.core.fail();
            return Ok(Proposal::infeasible());
        }
        let chosen = children[rng.index(children.len())];

        let tree = model.tree_mut(target)?;
        let removed = tree.remove_admixture_edge(chosen)?;
        let mark = tree.mark();
        let age = removed.age();
        let weight = removed.weight();

        let source_tips = tree.descendant_tips(removed.parent_branch())?;
        let destination_tips = tree.descendant_tips(removed.child_branch())?;
        let source_tip = source_tips[rng.index(source_tips.len())];
        let destination_tip = destination_tips[rng.index(destination_tips.len())];
        let floor = tree.age(source_tip)?.max(tree.age(destination_tip)?);
        let ceiling = tree.age(tree.mrca(source_tip, destination_tip)?)?;
        let span = ceiling - floor;

        let age_step = beta_step(rng, (age - floor) / span, self.age_lambda)?;
        let weight_step = beta_step(rng, 2.0 * weight, self.weight_lambda)?;
        let new_age = floor + age_step.position * span;
        let new_weight = 0.5 * weight_step.position;
        self.stored = Some(SlideRecord {
            removed,
            mark,
            edge: None,
        });

        let source = branch_spanning(tree, source_tip, new_age)?;
        let destination = branch_spanning(tree, destination_tip, new_age)?;
        let (Some(source), Some(destination)) = (source, destination) else {
            debug!("admixture slide: age {new_age} lands on a node of the tip paths");
            return Ok(Proposal::infeasible());
        };
        if source == destination || !(new_weight > 0.0 && new_weight <= 0.5) {
            return Ok(Proposal::infeasible());
        }
        let forward_choices = (source_tips.len() * destination_tips.len()) as f64;
        let backward_choices =
            (tree.descendant_tips(source)?.len() * tree.descendant_tips(destination)?.len()) as f64;
        let edge = tree.add_admixture_edge(source, destination, new_age, new_weight)?;
        if let Some(record) = self.stored.as_mut() {
            record.edge = Some(edge);
        }
        Ok(Proposal::new(
            forward_choices.ln() - backward_choices.ln()
                + age_step.ln_hastings_ratio
                + weight_step.ln_hastings_ratio,
        ))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let record = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        let tree = model.tree_mut(target)?;
        if let Some(edge) = record.edge {
            tree.undo_add_admixture_edge(edge, &record.mark)?;
        }
        tree.restore_admixture_edge(&record.removed)
    }

    fn tune(&mut self, rate: f64) {
        self.age_lambda = self.core.tuned_concentration(self.age_lambda, rate);
    }

    fn tuning_parameter(&self) -> Option<f64> {
        Some(self.age_lambda)
    }

    fn set_tuning_parameter(&mut self, value: f64) {
        self.age_lambda = value;
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}
