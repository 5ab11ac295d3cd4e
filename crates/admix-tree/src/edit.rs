//! Structural edits with exact inverses.

use admix_core::errors::AdmixError;
use admix_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::node::AdmixtureNode;
use crate::tree::{tree_error, AdmixtureTree, ContextExt};

/// Identifiers of the two ends of an admixture edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmixtureEdge {
    /// Source of gene flow.
    pub parent: NodeId,
    /// Destination of gene flow; carries the weight.
    pub child: NodeId,
}

/// Arena bookkeeping captured before slots are allocated or released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaMark {
    len: usize,
    free: Vec<usize>,
}

/// Everything needed to put a removed admixture edge back in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedAdmixture {
    /// Identifiers the edge occupied.
    pub edge: AdmixtureEdge,
    parent_node: AdmixtureNode,
    child_node: AdmixtureNode,
    parent_branch: NodeId,
    child_branch: NodeId,
    mark: ArenaMark,
}

impl RemovedAdmixture {
    /// Age the edge had before removal.
    pub fn age(&self) -> f64 {
        self.child_node.age
    }

    /// Weight the edge had before removal.
    pub fn weight(&self) -> f64 {
        self.child_node.weight
    }

    /// Child end of the branch that held the source node.
    pub fn parent_branch(&self) -> NodeId {
        self.parent_branch
    }

    /// Child end of the branch that held the destination node.
    pub fn child_branch(&self) -> NodeId {
        self.child_branch
    }
}

/// Record of a prune-and-regraft edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneRegraft {
    /// The divergence node that was moved together with one of its subtrees.
    pub pruned: NodeId,
    /// Sibling left behind at the old position.
    pub old_sibling: NodeId,
    /// Former parent of `pruned`.
    pub old_parent: NodeId,
    old_slot: usize,
    sibling_slot: usize,
    /// Child end of the branch `pruned` was regrafted onto.
    pub new_sibling: NodeId,
    /// New parent of `pruned`.
    pub new_parent: NodeId,
    new_slot: usize,
}

impl AdmixtureTree {
    /// Overwrites the age of a node without validation.
    pub fn set_age(&mut self, id: NodeId, age: f64) -> Result<(), AdmixError> {
        self.node_mut(id)?.age = age;
        Ok(())
    }

    /// Overwrites the mixing weight of an admixture child.
    pub fn set_weight(&mut self, id: NodeId, weight: f64) -> Result<(), AdmixError> {
        let node = self.node_mut(id)?;
        if node.admixture_parent.is_none() {
            return Err(tree_error("not-admixture-child", "only admixture children carry weights")
                .with_context("node", id));
        }
        node.weight = weight;
        Ok(())
    }

    /// Marks the arena state so that later allocations can be rolled back.
    pub fn mark(&self) -> ArenaMark {
        ArenaMark {
            len: self.nodes.len(),
            free: self.free.clone(),
        }
    }

    fn allocate(&mut self, node: AdmixtureNode) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                NodeId::from_raw(slot as u64)
            }
            None => {
                self.nodes.push(node);
                NodeId::from_raw((self.nodes.len() - 1) as u64)
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id.index()] = AdmixtureNode::vacant();
        self.free.push(id.index());
    }

    fn rollback_to(&mut self, mark: &ArenaMark) {
        for slot in self.free.iter().copied().filter(|slot| !mark.free.contains(slot)) {
            self.nodes[slot] = AdmixtureNode::vacant();
        }
        for &slot in &mark.free {
            if slot < self.nodes.len() {
                self.nodes[slot] = AdmixtureNode::vacant();
            }
        }
        self.nodes.truncate(mark.len);
        self.free = mark.free.clone();
    }

    fn child_slot(&self, parent: NodeId, child: NodeId) -> Result<usize, AdmixError> {
        self.node(parent)?
            .children
            .iter()
            .position(|&c| c == child)
            .ok_or_else(|| {
                tree_error("child-link", "parent does not list node as child")
                    .with_context("parent", parent)
                    .with_context("node", child)
            })
    }

    /// Inserts a detached single-child node on the branch above `child`.
    ///
    /// The new node takes over `child`'s slot in its parent.
    pub fn splice(&mut self, node: NodeId, child: NodeId) -> Result<(), AdmixError> {
        {
            let inserted = self.node(node)?;
            if inserted.parent.is_some() || !inserted.children.is_empty() {
                return Err(tree_error("not-detached", "spliced node must be detached")
                    .with_context("node", node));
            }
        }
        let parent = self.node(child)?.parent.ok_or_else(|| {
            tree_error("splice-root", "cannot splice above the root").with_context("node", child)
        })?;
        let slot = self.child_slot(parent, child)?;
        self.node_mut(parent)?.children[slot] = node;
        {
            let inserted = self.node_mut(node)?;
            inserted.parent = Some(parent);
            inserted.children.push(child);
        }
        self.node_mut(child)?.parent = Some(node);
        Ok(())
    }

    /// Removes a single-child node from its branch, reconnecting its parent and child.
    ///
    /// Returns the former child. The node is left detached but alive.
    pub fn unsplice(&mut self, node: NodeId) -> Result<NodeId, AdmixError> {
        let (parent, child) = {
            let current = self.node(node)?;
            if current.children.len() != 1 {
                return Err(tree_error("not-single-child", "only single-child nodes can be unspliced")
                    .with_context("node", node));
            }
            let parent = current.parent.ok_or_else(|| {
                tree_error("unsplice-root", "cannot unsplice the root").with_context("node", node)
            })?;
            (parent, current.children[0])
        };
        let slot = self.child_slot(parent, node)?;
        self.node_mut(parent)?.children[slot] = child;
        self.node_mut(child)?.parent = Some(parent);
        let current = self.node_mut(node)?;
        current.parent = None;
        current.children.clear();
        Ok(child)
    }

    /// Swaps the parents of two nodes, each taking the other's child slot.
    ///
    /// Applying the same exchange twice restores the original tree.
    pub fn exchange(&mut self, a: NodeId, b: NodeId) -> Result<(), AdmixError> {
        if self.is_descendant(a, b)? || self.is_descendant(b, a)? {
            return Err(tree_error("nested-exchange", "exchanged nodes must not be nested")
                .with_context("a", a)
                .with_context("b", b));
        }
        let parent_a = self.node(a)?.parent.ok_or_else(|| {
            tree_error("exchange-root", "cannot exchange the root").with_context("node", a)
        })?;
        let parent_b = self.node(b)?.parent.ok_or_else(|| {
            tree_error("exchange-root", "cannot exchange the root").with_context("node", b)
        })?;
        let slot_a = self.child_slot(parent_a, a)?;
        let slot_b = self.child_slot(parent_b, b)?;
        self.node_mut(parent_a)?.children[slot_a] = b;
        self.node_mut(parent_b)?.children[slot_b] = a;
        self.node_mut(a)?.parent = Some(parent_b);
        self.node_mut(b)?.parent = Some(parent_a);
        Ok(())
    }

    /// Prunes the parent of `subtree` and regrafts it, at its current age, onto the
    /// branch above `target`.
    ///
    /// The pruned node keeps `subtree` as a child; its other child is left behind
    /// attached to the former grandparent.
    pub fn prune_regraft(
        &mut self,
        subtree: NodeId,
        target: NodeId,
    ) -> Result<PruneRegraft, AdmixError> {
        let pruned = self.node(subtree)?.parent.ok_or_else(|| {
            tree_error("prune-root", "subtree root has no parent").with_context("node", subtree)
        })?;
        let pruned_node = self.node(pruned)?;
        if !pruned_node.is_divergence() || pruned_node.is_admixture() {
            return Err(tree_error("prune-arity", "only divergence nodes can be pruned")
                .with_context("node", pruned));
        }
        let pruned_age = pruned_node.age;
        let old_parent = pruned_node.parent.ok_or_else(|| {
            tree_error("prune-root", "cannot prune the root").with_context("node", pruned)
        })?;
        let sibling_slot = if pruned_node.children[0] == subtree { 1 } else { 0 };
        let old_sibling = pruned_node.children[sibling_slot];
        if target == pruned || self.is_descendant(target, subtree)? {
            return Err(tree_error("regraft-inside", "cannot regraft inside the moved subtree")
                .with_context("node", pruned)
                .with_context("target", target));
        }
        let new_parent = if target == old_sibling {
            old_parent
        } else {
            self.node(target)?.parent.ok_or_else(|| {
                tree_error("regraft-root", "cannot regraft above the root")
                    .with_context("target", target)
            })?
        };
        let target_age = self.node(target)?.age;
        let ceiling = self.node(new_parent)?.age;
        if !(target_age < pruned_age && pruned_age < ceiling) {
            return Err(tree_error("age-order", "target branch does not span the pruned age")
                .with_context("node", pruned)
                .with_context("age", pruned_age)
                .with_context("target", target));
        }

        let old_slot = self.child_slot(old_parent, pruned)?;
        self.node_mut(old_parent)?.children[old_slot] = old_sibling;
        self.node_mut(old_sibling)?.parent = Some(old_parent);

        let new_slot = self.child_slot(new_parent, target)?;
        self.node_mut(new_parent)?.children[new_slot] = pruned;
        self.node_mut(pruned)?.parent = Some(new_parent);
        self.node_mut(pruned)?.children[sibling_slot] = target;
        self.node_mut(target)?.parent = Some(pruned);

        Ok(PruneRegraft {
            pruned,
            old_sibling,
            old_parent,
            old_slot,
            sibling_slot,
            new_sibling: target,
            new_parent,
            new_slot,
        })
    }

    /// Replays a [`PruneRegraft`] backwards.
    pub fn undo_prune_regraft(&mut self, record: &PruneRegraft) -> Result<(), AdmixError> {
        self.node_mut(record.new_parent)?.children[record.new_slot] = record.new_sibling;
        self.node_mut(record.new_sibling)?.parent = Some(record.new_parent);
        self.node_mut(record.pruned)?.children[record.sibling_slot] = record.old_sibling;
        self.node_mut(record.old_sibling)?.parent = Some(record.pruned);
        self.node_mut(record.old_parent)?.children[record.old_slot] = record.pruned;
        self.node_mut(record.pruned)?.parent = Some(record.old_parent);
        Ok(())
    }

    /// Adds an admixture edge from the branch above `parent_branch` to the branch
    /// above `child_branch` at `age` with mixing `weight`.
    pub fn add_admixture_edge(
        &mut self,
        parent_branch: NodeId,
        child_branch: NodeId,
        age: f64,
        weight: f64,
    ) -> Result<AdmixtureEdge, AdmixError> {
        if parent_branch == child_branch {
            return Err(tree_error("same-branch", "source and destination branches coincide")
                .with_context("node", parent_branch));
        }
        if !(weight > 0.0 && weight <= 0.5) {
            return Err(tree_error("weight-range", "admixture weight outside (0, 0.5]")
                .with_context("weight", weight));
        }
        for branch in [parent_branch, child_branch] {
            let node = self.node(branch)?;
            let parent = node.parent.ok_or_else(|| {
                tree_error("splice-root", "cannot attach above the root").with_context("node", branch)
            })?;
            let ceiling = self.node(parent)?.age;
            if !(node.age < age && age < ceiling) {
                return Err(tree_error("age-order", "branch does not span the admixture age")
                    .with_context("node", branch)
                    .with_context("age", age));
            }
        }
        let source_outgroup = self.node(parent_branch)?.outgroup;
        let destination_outgroup = self.node(child_branch)?.outgroup;

        let parent = self.allocate(AdmixtureNode::new(age));
        let child = self.allocate(AdmixtureNode::new(age));
        {
            let node = &mut self.nodes[parent.index()];
            node.admixture_child = Some(child);
            node.outgroup = source_outgroup;
        }
        {
            let node = &mut self.nodes[child.index()];
            node.admixture_parent = Some(parent);
            node.weight = weight;
            node.outgroup = destination_outgroup;
        }
        self.splice(parent, parent_branch)?;
        self.splice(child, child_branch)?;
        Ok(AdmixtureEdge { parent, child })
    }

    /// Removes an edge created by [`AdmixtureTree::add_admixture_edge`] and rolls the
    /// arena back to `mark`.
    pub fn undo_add_admixture_edge(
        &mut self,
        edge: AdmixtureEdge,
        mark: &ArenaMark,
    ) -> Result<(), AdmixError> {
        self.unsplice(edge.child)?;
        self.unsplice(edge.parent)?;
        self.rollback_to(mark);
        Ok(())
    }

    /// Removes the admixture edge that `node` belongs to.
    pub fn remove_admixture_edge(&mut self, node: NodeId) -> Result<RemovedAdmixture, AdmixError> {
        let edge = self.edge_of(node)?;
        let mark = self.mark();
        let parent_node = self.node(edge.parent)?.clone();
        let child_node = self.node(edge.child)?.clone();
        let child_branch = self.unsplice(edge.child)?;
        let parent_branch = self.unsplice(edge.parent)?;
        self.release(edge.child);
        self.release(edge.parent);
        Ok(RemovedAdmixture {
            edge,
            parent_node,
            child_node,
            parent_branch,
            child_branch,
            mark,
        })
    }

    /// Puts a removed admixture edge back exactly where it was.
    pub fn restore_admixture_edge(&mut self, removed: &RemovedAdmixture) -> Result<(), AdmixError> {
        let AdmixtureEdge { parent, child } = removed.edge;
        self.free = removed.mark.free.clone();
        for (id, snapshot) in [(parent, &removed.parent_node), (child, &removed.child_node)] {
            let mut node = snapshot.clone();
            node.parent = None;
            node.children.clear();
            self.nodes[id.index()] = node;
        }
        self.splice(parent, removed.parent_branch)?;
        self.splice(child, removed.child_branch)?;
        Ok(())
    }

    /// Swaps source and destination of the admixture edge containing `node`.
    ///
    /// The weight moves with the destination role. Reversing twice is the identity.
    pub fn reverse_admixture_edge(&mut self, node: NodeId) -> Result<AdmixtureEdge, AdmixError> {
        let AdmixtureEdge { parent, child } = self.edge_of(node)?;
        let parent_weight = self.node(parent)?.weight;
        let child_weight = self.node(child)?.weight;
        {
            let old_parent = self.node_mut(parent)?;
            old_parent.admixture_child = None;
            old_parent.admixture_parent = Some(child);
            old_parent.weight = child_weight;
        }
        {
            let old_child = self.node_mut(child)?;
            old_child.admixture_parent = None;
            old_child.admixture_child = Some(parent);
            old_child.weight = parent_weight;
        }
        Ok(AdmixtureEdge {
            parent: child,
            child: parent,
        })
    }

    /// Normalises any admixture node to the edge it belongs to.
    pub fn edge_of(&self, node: NodeId) -> Result<AdmixtureEdge, AdmixError> {
        let current = self.node(node)?;
        if let Some(child) = current.admixture_child {
            Ok(AdmixtureEdge {
                parent: node,
                child,
            })
        } else if let Some(parent) = current.admixture_parent {
            Ok(AdmixtureEdge {
                parent,
                child: node,
            })
        } else {
            Err(tree_error("not-admixture", "node is not part of an admixture edge")
                .with_context("node", node))
        }
    }
}
