use std::collections::BTreeMap;
use std::fs;

use admix_core::{NodeId, RngHandle, VariableId};
use admix_dag::{BirthDeathDensity, Model};
use admix_tree::{AdmixtureTree, BirthDeathProcess, TreeBuilder};
use tempfile::tempdir;

use admix_mcmc::{
    AdmixtureEdgeDivergenceMerge, AdmixtureEdgeDivergenceSplit, BipartitionMonitor, ChainView,
    Monitor, Move, CONSERVATION_TOLERANCE,
};

fn id(raw: u64) -> NodeId {
    NodeId::from_raw(raw)
}

/// ((((A,B),C),(D,E))), optionally with an edge from the (A,B,C) branch into D.
fn pentad(admixed: bool) -> AdmixtureTree {
    let mut builder = TreeBuilder::new();
    let a = builder.tip("A", 0.0);
    let b = builder.tip("B", 0.0);
    let c = builder.tip("C", 0.0);
    let d = builder.tip("D", 0.0);
    let e = builder.tip("E", 0.0);
    let ab = builder.join(0.2, a, b).unwrap();
    let abc = builder.join(0.4, ab, c).unwrap();
    let de = builder.join(0.5, d, e).unwrap();
    let root = builder.join(1.0, abc, de).unwrap();
    let mut tree = builder.finish(root).unwrap();
    if admixed {
        tree.add_admixture_edge(id(6), id(3), 0.45, 0.2).unwrap();
    }
    tree
}

fn tree_model(tree: AdmixtureTree) -> (Model, VariableId) {
    let taxa = ["A", "B", "C", "D", "E"].iter().map(|t| t.to_string()).collect();
    let process = BirthDeathProcess::new(taxa).unwrap();
    let mut model = Model::new();
    let diversification = model.add_constant("diversification", 1.5).unwrap();
    let turnover = model.add_constant("turnover", 0.3).unwrap();
    let variable = model
        .add_stochastic(
            "tree",
            BirthDeathDensity::new(process),
            &[diversification, turnover],
            tree,
        )
        .unwrap();
    model.initialize().unwrap();
    (model, variable)
}

/// Sorted tips below each divergence, mapped to the divergence age bits.
fn clade_ages(tree: &AdmixtureTree) -> BTreeMap<Vec<NodeId>, u64> {
    tree.divergence_nodes()
        .into_iter()
        .map(|node| {
            let mut tips = tree.descendant_tips(node).unwrap();
            tips.sort();
            (tips, tree.age(node).unwrap().to_bits())
        })
        .collect()
}

fn assert_conserved(model: &mut Model) {
    let cached = model.ln_posterior().unwrap();
    let full = model.full_ln_posterior();
    assert!((cached - full).abs() <= CONSERVATION_TOLERANCE, "cached {cached} vs full {full}");
}

#[test]
fn merge_regrafts_the_destination_divergence_at_the_edge_age() {
    let (mut model, tree) = tree_model(pentad(true));
    let mut merge = AdmixtureEdgeDivergenceMerge::new(tree, 1.0);
    let proposal = merge.propose(&mut model, &mut RngHandle::from_seed(3)).unwrap();
    assert!(!merge.core().is_failed());

    let merged = model.tree(tree).unwrap();
    merged.check_invariants().unwrap();
    assert_eq!(merged.num_admixture_events(), 0);
    assert_eq!(merged.age(id(7)).unwrap(), 0.45);
    assert_eq!(merged.parent(id(4)).unwrap(), Some(id(8)));
    let mut clade = merged.descendant_tips(id(7)).unwrap();
    clade.sort();
    assert_eq!(clade, vec![id(0), id(1), id(2), id(3)]);

    // Reverse split: three divergences, two children, age window 0.55 and the
    // single lineage E at the old age 0.5.
    let weight_density = 2.0 * 3.0 * 0.6_f64.powi(2);
    let expected = weight_density.ln() - 3.0_f64.ln() - 2.0_f64.ln() - 0.55_f64.ln();
    assert!((proposal.ln_hastings_ratio - expected).abs() < 1e-12);

    merge.accept(&mut model).unwrap();
    assert_conserved(&mut model);
}

#[test]
fn merge_rejects_to_the_admixed_tree() {
    let (mut model, tree) = tree_model(pentad(true));
    let before = model.tree(tree).unwrap().clone();
    let mut merge = AdmixtureEdgeDivergenceMerge::new(tree, 1.0);
    merge.propose(&mut model, &mut RngHandle::from_seed(0)).unwrap();
    merge.reject(&mut model).unwrap();
    assert_eq!(model.tree(tree).unwrap(), &before);
    assert!(model.touched_variables().is_empty());
}

#[test]
fn merge_without_edges_is_infeasible() {
    let (mut model, tree) = tree_model(pentad(false));
    let mut merge = AdmixtureEdgeDivergenceMerge::new(tree, 1.0);
    let proposal = merge.propose(&mut model, &mut RngHandle::from_seed(0)).unwrap();
    assert!(merge.core().is_failed());
    assert_eq!(proposal.ln_hastings_ratio, f64::NEG_INFINITY);
    merge.reject(&mut model).unwrap();
    assert_eq!(merge.core().failures(), 1);
}

#[test]
fn split_respects_the_event_cap() {
    let (mut model, tree) = tree_model(pentad(true));
    let mut split = AdmixtureEdgeDivergenceSplit::new(tree, 1, 1.0);
    split.propose(&mut model, &mut RngHandle::from_seed(5)).unwrap();
    assert!(split.core().is_failed());
    split.reject(&mut model).unwrap();
    assert_eq!(model.tree(tree).unwrap().num_admixture_events(), 1);
}

#[test]
fn split_then_merge_returns_the_tree_with_opposite_ratios() {
    let original = pentad(false);
    let clades = clade_ages(&original);
    let mut checked = 0;
    for seed in 0..200 {
        let (mut model, tree) = tree_model(original.clone());
        let mut split = AdmixtureEdgeDivergenceSplit::new(tree, 3, 1.0);
        let mut merge = AdmixtureEdgeDivergenceMerge::new(tree, 1.0);

        let forward = split.propose(&mut model, &mut RngHandle::from_seed(seed)).unwrap();
        if split.core().is_failed() {
            split.reject(&mut model).unwrap();
            continue;
        }
        split.accept(&mut model).unwrap();
        let admixed = model.tree(tree).unwrap();
        admixed.check_invariants().unwrap();
        assert_eq!(admixed.num_admixture_events(), 1);
        assert_conserved(&mut model);

        let backward = merge
            .propose(&mut model, &mut RngHandle::from_seed(seed + 1000))
            .unwrap();
        assert!(!merge.core().is_failed(), "seed {seed}: split has no merge back");
        assert!(
            (forward.ln_hastings_ratio + backward.ln_hastings_ratio).abs() < 1e-9,
            "seed {seed}: {} vs {}",
            forward.ln_hastings_ratio,
            backward.ln_hastings_ratio
        );
        merge.accept(&mut model).unwrap();
        let restored = model.tree(tree).unwrap();
        restored.check_invariants().unwrap();
        assert_eq!(restored.num_admixture_events(), 0);
        assert_eq!(clade_ages(restored), clades, "seed {seed}");
        assert_conserved(&mut model);
        checked += 1;
    }
    assert!(checked > 100);
}

#[test]
fn bipartition_monitor_counts_clades_and_edges() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bipartitions.tsv");
    let (mut model, tree) = tree_model(pentad(true));
    let mut monitor = BipartitionMonitor::new(&path, 1, tree);
    let counts = monitor.handle();

    monitor.open().unwrap();
    let posterior = model.ln_posterior().unwrap();
    let view = ChainView {
        model: &model,
        ln_posterior: posterior,
        heat: 1.0,
        chain_index: 0,
    };
    monitor.print_header(&view).unwrap();
    monitor.report(1, &view).unwrap();

    let mut merge = AdmixtureEdgeDivergenceMerge::new(tree, 1.0);
    merge.propose(&mut model, &mut RngHandle::from_seed(3)).unwrap();
    merge.accept(&mut model).unwrap();
    let posterior = model.ln_posterior().unwrap();
    let view = ChainView {
        model: &model,
        ln_posterior: posterior,
        heat: 1.0,
        chain_index: 0,
    };
    monitor.report(2, &view).unwrap();
    monitor.close().unwrap();

    let snapshot = counts.snapshot();
    assert_eq!(snapshot.samples, 2);
    assert_eq!(snapshot.frequency("11000"), 1.0);
    assert_eq!(snapshot.frequency("11100"), 1.0);
    assert_eq!(snapshot.frequency("00011"), 0.5);
    assert_eq!(snapshot.frequency("11110"), 0.5);
    assert_eq!(snapshot.frequency("11100,00010"), 0.5);
    assert_eq!(snapshot.frequencies()[0].1, 1.0);

    let written = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "Iteration\tPosterior\tBipartitions");
    assert!(lines[1].starts_with("1\t"));
    assert!(lines[1].contains("11100,00010,0.45,0.2"));
    assert!(lines[2].contains("11110,,0.45"));
    assert!(!lines[2].contains("00011"));
}
