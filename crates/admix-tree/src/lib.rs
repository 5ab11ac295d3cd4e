#![deny(missing_docs)]
#![doc = "Arena-backed admixture trees: a rooted binary tree whose branches may carry reticulation edges, with invertible structural edits for MCMC proposals."]

mod birth_death;
mod edit;
mod newick;
mod node;
mod tree;

pub use birth_death::BirthDeathProcess;
pub use edit::{AdmixtureEdge, ArenaMark, PruneRegraft, RemovedAdmixture};
pub use newick::AdmixtureDescriptor;
pub use node::AdmixtureNode;
pub use tree::{AdmixtureTree, TreeBuilder};
