use std::collections::BTreeSet;

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::node::AdmixtureNode;

/// Rooted binary tree with admixture (reticulation) edges stored in an arena.
///
/// All references between nodes are [`NodeId`] indices. Structural edits are
/// index rewrites, and every edit used by a proposal has an exact inverse so a
/// rejected proposal leaves the arena, the free list and the child slot order
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmixtureTree {
    pub(crate) nodes: Vec<AdmixtureNode>,
    pub(crate) free: Vec<usize>,
    pub(crate) root: NodeId,
    pub(crate) tips: Vec<NodeId>,
}

/// Bottom-up constructor for [`AdmixtureTree`].
#[derive(Debug, Default)]
pub struct TreeBuilder {
    nodes: Vec<AdmixtureNode>,
    tips: Vec<NodeId>,
}

impl TreeBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tip. Tips are indexed in the order they are added.
    pub fn tip(&mut self, name: impl Into<String>, age: f64) -> NodeId {
        let id = NodeId::from_raw(self.nodes.len() as u64);
        let mut node = AdmixtureNode::new(age);
        node.name = Some(name.into());
        self.nodes.push(node);
        self.tips.push(id);
        id
    }

    /// Marks a tip as a member of the outgroup.
    pub fn mark_outgroup(&mut self, tip: NodeId) -> Result<(), AdmixError> {
        let node = self
            .nodes
            .get_mut(tip.index())
            .filter(|node| node.children.is_empty())
            .ok_or_else(|| {
                tree_error("unknown-tip", "outgroup marker must name a tip").with_context("node", tip)
            })?;
        node.outgroup = true;
        Ok(())
    }

    /// Joins two parentless nodes under a new divergence node of the given age.
    pub fn join(&mut self, age: f64, left: NodeId, right: NodeId) -> Result<NodeId, AdmixError> {
        if left == right {
            return Err(tree_error("duplicate-child", "cannot join a node with itself")
                .with_context("node", left));
        }
        for child in [left, right] {
            let node = self.nodes.get(child.index()).ok_or_else(|| {
                tree_error("unknown-node", "node does not exist").with_context("node", child)
            })?;
            if node.parent.is_some() {
                return Err(tree_error("already-attached", "node already has a parent")
                    .with_context("node", child));
            }
            if node.age >= age {
                return Err(tree_error("age-order", "parent must be older than its children")
                    .with_context("node", child)
                    .with_context("child_age", node.age)
                    .with_context("parent_age", age));
            }
        }
        let id = NodeId::from_raw(self.nodes.len() as u64);
        let mut node = AdmixtureNode::new(age);
        node.children = vec![left, right];
        self.nodes.push(node);
        self.nodes[left.index()].parent = Some(id);
        self.nodes[right.index()].parent = Some(id);
        Ok(id)
    }

    /// Finalises the tree rooted at `root`, propagating outgroup flags upward.
    pub fn finish(self, root: NodeId) -> Result<AdmixtureTree, AdmixError> {
        let mut tree = AdmixtureTree {
            nodes: self.nodes,
            free: Vec::new(),
            root,
            tips: self.tips,
        };
        tree.node(root)?;
        tree.propagate_outgroup(root);
        tree.check_invariants()?;
        Ok(tree)
    }
}

impl AdmixtureTree {
    /// Returns the root identifier.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Looks up a live node.
    pub fn node(&self, id: NodeId) -> Result<&AdmixtureNode, AdmixError> {
        self.nodes
            .get(id.index())
            .filter(|node| node.alive)
            .ok_or_else(|| {
                tree_error("unknown-node", "node does not exist").with_context("node", id)
            })
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut AdmixtureNode, AdmixError> {
        self.nodes
            .get_mut(id.index())
            .filter(|node| node.alive)
            .ok_or_else(|| {
                tree_error("unknown-node", "node does not exist").with_context("node", id)
            })
    }

    /// Identifiers of all live nodes in arena order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.alive)
            .map(|(idx, _)| NodeId::from_raw(idx as u64))
    }

    /// Number of live nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().filter(|node| node.alive).count()
    }

    /// Tips in taxon order.
    pub fn tips(&self) -> &[NodeId] {
        &self.tips
    }

    /// Number of tips.
    pub fn num_tips(&self) -> usize {
        self.tips.len()
    }

    /// Finds a tip by taxon name.
    pub fn tip_by_name(&self, name: &str) -> Option<NodeId> {
        self.tips
            .iter()
            .copied()
            .find(|tip| self.nodes[tip.index()].name.as_deref() == Some(name))
    }

    /// Age of a node.
    pub fn age(&self, id: NodeId) -> Result<f64, AdmixError> {
        Ok(self.node(id)?.age)
    }

    /// Immediate parent of a node.
    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>, AdmixError> {
        Ok(self.node(id)?.parent)
    }

    /// Immediate children of a node in slot order.
    pub fn children(&self, id: NodeId) -> Result<&[NodeId], AdmixError> {
        Ok(&self.node(id)?.children)
    }

    /// Length of the branch above `id`; zero for the root.
    pub fn branch_length(&self, id: NodeId) -> Result<f64, AdmixError> {
        let node = self.node(id)?;
        match node.parent {
            Some(parent) => Ok(self.node(parent)?.age - node.age),
            None => Ok(0.0),
        }
    }

    /// Age of the root.
    pub fn tree_height(&self) -> f64 {
        self.nodes[self.root.index()].age
    }

    /// Sum of all branch lengths.
    pub fn tree_length(&self) -> f64 {
        self.node_ids()
            .filter_map(|id| {
                let node = &self.nodes[id.index()];
                node.parent
                    .map(|parent| self.nodes[parent.index()].age - node.age)
            })
            .sum()
    }

    /// Tree length divided by tree height.
    pub fn unit_tree_length(&self) -> f64 {
        self.tree_length() / self.tree_height()
    }

    /// Nearest ancestor that is not an admixture node.
    pub fn topology_parent(&self, id: NodeId) -> Result<Option<NodeId>, AdmixError> {
        let mut current = self.node(id)?.parent;
        while let Some(candidate) = current {
            let node = self.node(candidate)?;
            if !node.is_admixture() {
                return Ok(Some(candidate));
            }
            current = node.parent;
        }
        Ok(None)
    }

    /// The `slot`-th child of `id`, following single-child admixture chains downward.
    pub fn topology_child(&self, id: NodeId, slot: usize) -> Result<NodeId, AdmixError> {
        let mut current = *self.node(id)?.children.get(slot).ok_or_else(|| {
            tree_error("unknown-child", "child slot out of range")
                .with_context("node", id)
                .with_context("slot", slot)
        })?;
        loop {
            let node = self.node(current)?;
            if node.is_admixture() {
                current = node.children[0];
            } else {
                return Ok(current);
            }
        }
    }

    /// Whether `id` is one end of an admixture edge.
    pub fn is_admixture_node(&self, id: NodeId) -> Result<bool, AdmixError> {
        Ok(self.node(id)?.is_admixture())
    }

    /// Sources of gene flow (nodes with an admixture child), in arena order.
    pub fn admixture_parents(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|id| self.nodes[id.index()].admixture_child.is_some())
            .collect()
    }

    /// Destinations of gene flow (nodes with an admixture parent), in arena order.
    pub fn admixture_children(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|id| self.nodes[id.index()].admixture_parent.is_some())
            .collect()
    }

    /// Number of admixture edges.
    pub fn num_admixture_events(&self) -> usize {
        self.admixture_children().len()
    }

    /// Bifurcating nodes, including the root, in arena order.
    pub fn divergence_nodes(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|id| self.nodes[id.index()].is_divergence())
            .collect()
    }

    /// Tips below `id` in depth-first slot order.
    pub fn descendant_tips(&self, id: NodeId) -> Result<Vec<NodeId>, AdmixError> {
        let mut tips = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node(current)?;
            if node.is_tip() {
                tips.push(current);
            } else {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        Ok(tips)
    }

    /// Whether `ancestor` lies on the path from `id` to the root (inclusive).
    pub fn is_descendant(&self, id: NodeId, ancestor: NodeId) -> Result<bool, AdmixError> {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return Ok(true);
            }
            current = self.node(node)?.parent;
        }
        Ok(false)
    }

    /// Most recent common ancestor of two nodes.
    pub fn mrca(&self, a: NodeId, b: NodeId) -> Result<NodeId, AdmixError> {
        let mut ancestors = BTreeSet::new();
        let mut current = Some(a);
        while let Some(node) = current {
            ancestors.insert(node);
            current = self.node(node)?.parent;
        }
        let mut current = Some(b);
        while let Some(node) = current {
            if ancestors.contains(&node) {
                return Ok(node);
            }
            current = self.node(node)?.parent;
        }
        Err(tree_error("disconnected", "nodes share no ancestor")
            .with_context("a", a)
            .with_context("b", b))
    }

    /// Non-root nodes whose branch strictly spans `age`.
    pub fn lineages_at(&self, age: f64) -> Vec<NodeId> {
        self.node_ids()
            .filter(|id| {
                let node = &self.nodes[id.index()];
                match node.parent {
                    Some(parent) => node.age < age && age < self.nodes[parent.index()].age,
                    None => false,
                }
            })
            .collect()
    }

    /// Verifies every structural invariant of the tree.
    pub fn check_invariants(&self) -> Result<(), AdmixError> {
        let root = self.node(self.root)?;
        if root.parent.is_some() {
            return Err(tree_error("root-has-parent", "root must not have a parent")
                .with_context("node", self.root));
        }
        for id in self.node_ids() {
            let node = &self.nodes[id.index()];
            if !(node.age >= 0.0) {
                return Err(tree_error("negative-age", "ages must be non-negative")
                    .with_context("node", id)
                    .with_context("age", node.age));
            }
            let expected_children = if node.is_admixture() {
                1
            } else if node.name.is_some() {
                0
            } else {
                2
            };
            if node.children.len() != expected_children {
                return Err(tree_error("arity", "unexpected number of children")
                    .with_context("node", id)
                    .with_context("children", node.children.len())
                    .with_context("expected", expected_children));
            }
            for &child in &node.children {
                if self.node(child)?.parent != Some(id) {
                    return Err(tree_error("parent-link", "child does not point back to parent")
                        .with_context("node", id)
                        .with_context("child", child));
                }
            }
            if let Some(parent) = node.parent {
                let parent_node = self.node(parent)?;
                if !parent_node.children.contains(&id) {
                    return Err(tree_error("child-link", "parent does not list node as child")
                        .with_context("node", id)
                        .with_context("parent", parent));
                }
                if !(node.age < parent_node.age) {
                    return Err(tree_error("age-order", "node must be younger than its parent")
                        .with_context("node", id)
                        .with_context("age", node.age)
                        .with_context("parent_age", parent_node.age));
                }
            } else if id != self.root {
                return Err(tree_error("detached", "non-root node without parent")
                    .with_context("node", id));
            }
            if let Some(child) = node.admixture_child {
                let partner = self.node(child)?;
                if partner.admixture_parent != Some(id) || node.admixture_parent.is_some() {
                    return Err(tree_error("partner-link", "admixture partners disagree")
                        .with_context("node", id)
                        .with_context("partner", child));
                }
                if partner.age.to_bits() != node.age.to_bits() {
                    return Err(tree_error("partner-age", "admixture partners must share an age")
                        .with_context("node", id)
                        .with_context("age", node.age)
                        .with_context("partner_age", partner.age));
                }
                if !(partner.weight > 0.0 && partner.weight <= 0.5) {
                    return Err(tree_error("weight-range", "admixture weight outside (0, 0.5]")
                        .with_context("node", child)
                        .with_context("weight", partner.weight));
                }
            }
            if let Some(parent) = node.admixture_parent {
                if self.node(parent)?.admixture_child != Some(id) {
                    return Err(tree_error("partner-link", "admixture partners disagree")
                        .with_context("node", id)
                        .with_context("partner", parent));
                }
            }
        }
        let reachable = self.reachable_count();
        if reachable != self.num_nodes() {
            return Err(tree_error("unreachable", "live nodes not reachable from the root")
                .with_context("reachable", reachable)
                .with_context("alive", self.num_nodes()));
        }
        Ok(())
    }

    fn reachable_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(current) = stack.pop() {
            count += 1;
            stack.extend(self.nodes[current.index()].children.iter().copied());
        }
        count
    }

    pub(crate) fn propagate_outgroup(&mut self, id: NodeId) -> bool {
        let children = self.nodes[id.index()].children.clone();
        if children.is_empty() {
            return self.nodes[id.index()].outgroup;
        }
        let mut all = true;
        for child in children {
            all &= self.propagate_outgroup(child);
        }
        self.nodes[id.index()].outgroup = all;
        all
    }

    /// Serializes the tree to JSON.
    pub fn to_json(&self) -> Result<String, AdmixError> {
        serde_json::to_string(self).map_err(|err| {
            AdmixError::Serde(ErrorInfo::new("tree-serialize", err.to_string()))
        })
    }

    /// Restores a tree from JSON and validates it.
    pub fn from_json(json: &str) -> Result<Self, AdmixError> {
        let tree: Self = serde_json::from_str(json)
            .map_err(|err| AdmixError::Serde(ErrorInfo::new("tree-parse", err.to_string())))?;
        tree.check_invariants()?;
        Ok(tree)
    }
}

pub(crate) fn tree_error(code: impl Into<String>, message: impl Into<String>) -> AdmixError {
    AdmixError::Tree(ErrorInfo::new(code, message))
}

pub(crate) trait ContextExt {
    fn with_context(self, key: impl Into<String>, value: impl ToString) -> AdmixError;
}

impl ContextExt for AdmixError {
    fn with_context(self, key: impl Into<String>, value: impl ToString) -> AdmixError {
        match self {
            AdmixError::Tree(info) => AdmixError::Tree(info.with_context(key, value.to_string())),
            other => other,
        }
    }
}
