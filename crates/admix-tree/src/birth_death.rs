//! Constant-rate birth-death process over admixture trees.

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_core::stats::beta_ln_pdf;
use admix_core::{NodeId, RngHandle};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::tree::{AdmixtureTree, TreeBuilder};

/// Generative process for the admixture tree.
///
/// Speciation rate is `diversification + turnover`, extinction rate is
/// `turnover`. The density is conditioned on the root age; every admixture
/// weight contributes a `Beta(1, 5)` prior on `2w`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BirthDeathProcess {
    taxa: Vec<String>,
    outgroup: Vec<bool>,
    root_age: f64,
}

impl BirthDeathProcess {
    /// Creates a process over the given taxa with no outgroup and unit root age.
    pub fn new(taxa: Vec<String>) -> Result<Self, AdmixError> {
        if taxa.len() < 2 {
            return Err(AdmixError::Tree(
                ErrorInfo::new("too-few-taxa", "a tree needs at least two taxa")
                    .with_context("taxa", taxa.len()),
            ));
        }
        let outgroup = vec![false; taxa.len()];
        Ok(Self {
            taxa,
            outgroup,
            root_age: 1.0,
        })
    }

    /// Flags outgroup taxa; at least one taxon must remain in the ingroup.
    pub fn with_outgroup(mut self, outgroup: Vec<bool>) -> Result<Self, AdmixError> {
        if outgroup.len() != self.taxa.len() {
            return Err(AdmixError::Tree(
                ErrorInfo::new("outgroup-length", "outgroup flags must match the taxa")
                    .with_context("taxa", self.taxa.len())
                    .with_context("flags", outgroup.len()),
            ));
        }
        if outgroup.iter().all(|&flag| flag) {
            return Err(AdmixError::Tree(ErrorInfo::new(
                "empty-ingroup",
                "at least one taxon must belong to the ingroup",
            )));
        }
        self.outgroup = outgroup;
        Ok(self)
    }

    /// Sets the age of the simulated root.
    pub fn with_root_age(mut self, root_age: f64) -> Self {
        self.root_age = root_age;
        self
    }

    /// Taxon names.
    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    /// Simulates a ranked random topology with birth-death node ages.
    pub fn simulate(
        &self,
        diversification: f64,
        turnover: f64,
        rng: &mut RngHandle,
    ) -> Result<AdmixtureTree, AdmixError> {
        check_rates(diversification, turnover)?;
        let num_outgroup = self.outgroup.iter().filter(|&&flag| flag).count();
        let num_ingroup = self.taxa.len() - num_outgroup;

        // proto nodes: children lists, index 0 is the root
        let mut children: Vec<Vec<usize>> = Vec::new();
        let mut ingroup_leaves;
        let mut outgroup_leaves = Vec::new();
        if num_outgroup > 0 {
            children.push(vec![1, 2]);
            children.push(Vec::new());
            children.push(Vec::new());
            ingroup_leaves = grow_random_binary(&mut children, 1, num_ingroup, rng);
            outgroup_leaves = grow_random_binary(&mut children, 2, num_outgroup, rng);
        } else {
            children.push(Vec::new());
            ingroup_leaves = grow_random_binary(&mut children, 0, num_ingroup, rng);
        }

        let mut builder = TreeBuilder::new();
        let mut built: Vec<Option<NodeId>> = vec![None; children.len()];
        for (taxon, name) in self.taxa.iter().enumerate() {
            let pool = if self.outgroup[taxon] {
                &mut outgroup_leaves
            } else {
                &mut ingroup_leaves
            };
            let leaf = pool.swap_remove(rng.index(pool.len()));
            let tip = builder.tip(name.clone(), 0.0);
            if self.outgroup[taxon] {
                builder.mark_outgroup(tip)?;
            }
            built[leaf] = Some(tip);
        }

        let ages = self.ranked_ages(diversification, turnover, &children, rng);
        let root = build_postorder(&mut builder, &children, &ages, &mut built, 0)?;
        let tree = builder.finish(root)?;
        debug!(
            "simulated birth-death tree: tips={} height={}",
            tree.num_tips(),
            tree.tree_height()
        );
        Ok(tree)
    }

    fn ranked_ages(
        &self,
        diversification: f64,
        turnover: f64,
        children: &[Vec<usize>],
        rng: &mut RngHandle,
    ) -> Vec<f64> {
        let internal = children.iter().filter(|c| !c.is_empty()).count();
        let mut times: Vec<f64> = (1..internal)
            .map(|_| speciation_age(diversification, turnover, self.root_age, rng))
            .collect();
        times.sort_by(|a, b| b.total_cmp(a));
        let mut ages = vec![0.0; children.len()];
        ages[0] = self.root_age;
        let mut available: Vec<usize> = children[0]
            .iter()
            .copied()
            .filter(|&c| !children[c].is_empty())
            .collect();
        for age in times {
            let pick = available.swap_remove(rng.index(available.len()));
            ages[pick] = age;
            available.extend(children[pick].iter().copied().filter(|&c| !children[c].is_empty()));
        }
        ages
    }

    /// Log-density of `tree` given the rates; NaN when undefined.
    pub fn ln_density(&self, tree: &AdmixtureTree, diversification: f64, turnover: f64) -> f64 {
        if check_rates(diversification, turnover).is_err() {
            return f64::NAN;
        }
        let height = tree.tree_height();
        let speciation = diversification + turnover;
        let mut ln_probability =
            2.0 * (p1(0.0, height, diversification, turnover)
                - survival(0.0, height, diversification, turnover).ln());
        for id in tree.divergence_nodes() {
            let Ok(node) = tree.node(id) else {
                return f64::NAN;
            };
            if node.is_root() {
                continue;
            }
            let time = height - node.age();
            ln_probability += speciation.ln() + p1(time, height, diversification, turnover);
            if !ln_probability.is_finite() {
                return f64::NAN;
            }
        }
        for id in tree.admixture_children() {
            if let Ok(node) = tree.node(id) {
                ln_probability += beta_ln_pdf(1.0, 5.0, 2.0 * node.weight()) + std::f64::consts::LN_2;
            }
        }
        ln_probability
    }
}

fn check_rates(diversification: f64, turnover: f64) -> Result<(), AdmixError> {
    if diversification > 0.0 && turnover >= 0.0 {
        Ok(())
    } else {
        Err(AdmixError::Tree(
            ErrorInfo::new("birth-death-rates", "rates must satisfy d > 0 and t >= 0")
                .with_context("diversification", diversification)
                .with_context("turnover", turnover),
        ))
    }
}

fn survival(start: f64, end: f64, diversification: f64, turnover: f64) -> f64 {
    let integral = ((diversification * (start - end)).exp() - 1.0) / (-diversification);
    1.0 / (1.0 + turnover * integral)
}

fn p1(time: f64, height: f64, diversification: f64, turnover: f64) -> f64 {
    let growth = diversification * (time - height);
    if growth > 0.0 {
        return f64::NEG_INFINITY;
    }
    2.0 * survival(time, height, diversification, turnover).ln() + growth
}

fn speciation_age(diversification: f64, turnover: f64, origin: f64, rng: &mut RngHandle) -> f64 {
    let u = rng.uniform01();
    let speciation = diversification + turnover;
    let decay = (-diversification * origin).exp();
    let numerator = speciation - turnover * decay - turnover * (1.0 - decay) * u;
    let denominator = speciation - turnover * decay - speciation * (1.0 - decay) * u;
    (numerator / denominator).ln() / diversification
}

fn grow_random_binary(
    children: &mut Vec<Vec<usize>>,
    start: usize,
    leaves: usize,
    rng: &mut RngHandle,
) -> Vec<usize> {
    let mut frontier = vec![start];
    while frontier.len() < leaves {
        let split = frontier.swap_remove(rng.index(frontier.len()));
        let left = children.len();
        children.push(Vec::new());
        children.push(Vec::new());
        children[split] = vec![left, left + 1];
        frontier.push(left);
        frontier.push(left + 1);
    }
    frontier
}

fn build_postorder(
    builder: &mut TreeBuilder,
    children: &[Vec<usize>],
    ages: &[f64],
    built: &mut [Option<NodeId>],
    index: usize,
) -> Result<NodeId, AdmixError> {
    if let Some(id) = built[index] {
        return Ok(id);
    }
    let left = build_postorder(builder, children, ages, built, children[index][0])?;
    let right = build_postorder(builder, children, ages, built, children[index][1])?;
    let id = builder.join(ages[index], left, right)?;
    built[index] = Some(id);
    Ok(id)
}
