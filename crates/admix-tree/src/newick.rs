//! Newick rendering, admixture descriptors and canonical hashing.

use std::fmt::{self, Display, Write as _};

use admix_core::errors::AdmixError;
use admix_core::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tree::AdmixtureTree;

/// Human readable summary of one admixture edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmixtureDescriptor {
    /// Tip names below the source node.
    pub source_tips: Vec<String>,
    /// Tip names below the destination node.
    pub destination_tips: Vec<String>,
    /// Age of the edge.
    pub age: f64,
    /// Mixing weight.
    pub weight: f64,
}

impl Display for AdmixtureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{s={},d={},t={:.6},w={:.6}}}",
            self.source_tips.join("+"),
            self.destination_tips.join("+"),
            self.age,
            self.weight
        )
    }
}

impl AdmixtureTree {
    /// Newick string of the underlying tree; admixture nodes are skipped and
    /// branch lengths measured between topological nodes.
    pub fn to_newick(&self) -> Result<String, AdmixError> {
        let mut out = String::new();
        self.write_newick(self.root(), false, &mut out)?;
        out.push(';');
        Ok(out)
    }

    fn write_newick(&self, id: NodeId, sorted: bool, out: &mut String) -> Result<(), AdmixError> {
        let node = self.node(id)?;
        if node.is_tip() {
            out.push_str(node.name().unwrap_or("?"));
        } else {
            let mut children = Vec::with_capacity(node.children().len());
            for slot in 0..node.children().len() {
                children.push(self.topology_child(id, slot)?);
            }
            if sorted {
                let mut keyed = Vec::with_capacity(children.len());
                for child in children {
                    keyed.push((self.smallest_tip_name(child)?, child));
                }
                keyed.sort();
                children = keyed.into_iter().map(|(_, child)| child).collect();
            }
            out.push('(');
            for (idx, child) in children.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                self.write_newick(child, sorted, out)?;
            }
            out.push(')');
        }
        if let Some(parent) = self.topology_parent(id)? {
            let length = self.node(parent)?.age() - node.age();
            // writing to a String cannot fail
            let _ = write!(out, ":{length:.6}");
        }
        Ok(())
    }

    fn smallest_tip_name(&self, id: NodeId) -> Result<String, AdmixError> {
        let mut names = Vec::new();
        for tip in self.descendant_tips(id)? {
            names.push(self.node(tip)?.name().unwrap_or_default().to_string());
        }
        names.sort();
        Ok(names.into_iter().next().unwrap_or_default())
    }

    fn tip_names(&self, id: NodeId) -> Result<Vec<String>, AdmixError> {
        let mut names = Vec::new();
        for tip in self.descendant_tips(id)? {
            names.push(self.node(tip)?.name().unwrap_or_default().to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Descriptors of every admixture edge ordered by age, oldest first.
    pub fn admixture_descriptors(&self) -> Result<Vec<AdmixtureDescriptor>, AdmixError> {
        let mut descriptors = Vec::new();
        for child in self.admixture_children() {
            let edge = self.edge_of(child)?;
            let destination = self.node(edge.child)?;
            descriptors.push(AdmixtureDescriptor {
                source_tips: self.tip_names(edge.parent)?,
                destination_tips: self.tip_names(edge.child)?,
                age: destination.age(),
                weight: destination.weight(),
            });
        }
        descriptors.sort_by(|a, b| b.age.total_cmp(&a.age));
        Ok(descriptors)
    }

    /// Newick string followed by the admixture descriptors.
    pub fn to_extended_newick(&self) -> Result<String, AdmixError> {
        let mut out = self.to_newick()?;
        for descriptor in self.admixture_descriptors()? {
            let _ = write!(out, "{descriptor}");
        }
        Ok(out)
    }

    /// SHA-256 over a canonical rendering that ignores arena layout and child order.
    pub fn canonical_hash(&self) -> Result<String, AdmixError> {
        let mut canonical = String::new();
        self.write_newick(self.root(), true, &mut canonical)?;
        for descriptor in self.admixture_descriptors()? {
            let _ = write!(canonical, "{descriptor}");
        }
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}
