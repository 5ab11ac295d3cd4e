use admix_core::NodeId;
use serde::{Deserialize, Serialize};

/// A single node of an [`AdmixtureTree`](crate::AdmixtureTree).
///
/// Tips have no children, admixture nodes have exactly one child and a
/// partner, divergence nodes have two children. The mixing weight is only
/// meaningful on the admixture child (the destination of gene flow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmixtureNode {
    pub(crate) alive: bool,
    pub(crate) name: Option<String>,
    pub(crate) age: f64,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) admixture_parent: Option<NodeId>,
    pub(crate) admixture_child: Option<NodeId>,
    pub(crate) weight: f64,
    pub(crate) outgroup: bool,
}

impl AdmixtureNode {
    pub(crate) fn new(age: f64) -> Self {
        Self {
            alive: true,
            name: None,
            age,
            parent: None,
            children: Vec::new(),
            admixture_parent: None,
            admixture_child: None,
            weight: 1.0,
            outgroup: false,
        }
    }

    /// Canonical content of a recycled arena slot.
    pub(crate) fn vacant() -> Self {
        Self {
            alive: false,
            ..Self::new(0.0)
        }
    }

    /// Taxon name for tips.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Age of the node (time before the present).
    pub fn age(&self) -> f64 {
        self.age
    }

    /// Immediate parent in the arena, including admixture nodes.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Immediate children in slot order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Source partner, set on the admixture child.
    pub fn admixture_parent(&self) -> Option<NodeId> {
        self.admixture_parent
    }

    /// Destination partner, set on the admixture parent.
    pub fn admixture_child(&self) -> Option<NodeId> {
        self.admixture_child
    }

    /// Admixture partner regardless of direction.
    pub fn partner(&self) -> Option<NodeId> {
        self.admixture_parent.or(self.admixture_child)
    }

    /// Mixing weight carried by an admixture child.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Whether the node belongs to the outgroup clade.
    pub fn is_outgroup(&self) -> bool {
        self.outgroup
    }

    /// Whether the node is a tip.
    pub fn is_tip(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether the node is the root.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether the node is one end of an admixture edge.
    pub fn is_admixture(&self) -> bool {
        self.partner().is_some()
    }

    /// Whether the node is a bifurcation of the underlying tree.
    pub fn is_divergence(&self) -> bool {
        self.children.len() == 2
    }
}
