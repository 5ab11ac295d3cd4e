use admix_core::{NodeId, RngHandle, VariableId};
use admix_dag::{BirthDeathDensity, Model};
use admix_tree::{AdmixtureTree, BirthDeathProcess, TreeBuilder};
use proptest::prelude::*;

use admix_mcmc::{
    AdmixtureEdgeAdd, AdmixtureEdgeDivergenceMerge, AdmixtureEdgeDivergenceSplit,
    AdmixtureEdgeRemove, AdmixtureEdgeReversePolarity, AdmixtureEdgeReweight, AdmixtureEdgeSlide,
    FixedNodeheightPruneRegraft, Move, NarrowExchange, NodeTimeSlideBeta, CONSERVATION_TOLERANCE,
};

fn id(raw: u64) -> NodeId {
    NodeId::from_raw(raw)
}

/// ((((A,B),C),(D,E))) with one edge from the (A,B,C) branch into D.
fn admixed_pentad() -> AdmixtureTree {
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
    tree.add_admixture_edge(id(6), id(3), 0.45, 0.2).unwrap();
    tree
}

fn tree_model() -> (Model, VariableId) {
    let taxa = ["A", "B", "C", "D", "E"].iter().map(|t| t.to_string()).collect();
    let process = BirthDeathProcess::new(taxa).unwrap();
    let mut model = Model::new();
    let diversification = model.add_constant("diversification", 1.5).unwrap();
    let turnover = model.add_constant("turnover", 0.3).unwrap();
    let tree = model
        .add_stochastic(
            "tree",
            BirthDeathDensity::new(process),
            &[diversification, turnover],
            admixed_pentad(),
        )
        .unwrap();
    model.initialize().unwrap();
    (model, tree)
}

fn tree_moves(tree: VariableId) -> Vec<Box<dyn Move>> {
    vec![
        Box::new(NarrowExchange::new(tree, 1.0)),
        Box::new(FixedNodeheightPruneRegraft::new(tree, 1.0)),
        Box::new(NodeTimeSlideBeta::new(tree, 10.0, 1.0)),
        Box::new(AdmixtureEdgeAdd::new(tree, 3, 1.0)),
        Box::new(AdmixtureEdgeRemove::new(tree, 1.0)),
        Box::new(AdmixtureEdgeReweight::new(tree, 5.0, 1.0)),
        Box::new(AdmixtureEdgeReversePolarity::new(tree, 5.0, 1.0)),
        Box::new(AdmixtureEdgeSlide::new(tree, 10.0, 5.0, 1.0)),
        Box::new(AdmixtureEdgeDivergenceMerge::new(tree, 1.0)),
        Box::new(AdmixtureEdgeDivergenceSplit::new(tree, 3, 1.0)),
    ]
}

fn assert_reject_restores(mv: &mut dyn Move, seed: u64) {
    let (mut model, tree) = tree_model();
    let before = model.tree(tree).unwrap().clone();
    let posterior = model.ln_posterior().unwrap();
    let mut rng = RngHandle::from_seed(seed);
    let proposal = mv.propose(&mut model, &mut rng).unwrap();
    if proposal.ln_hastings_ratio.is_finite() {
        model.tree(tree).unwrap().check_invariants().unwrap();
    }
    mv.reject(&mut model).unwrap();
    let after = model.tree(tree).unwrap();
    assert_eq!(after, &before, "{} did not restore the tree", mv.core().name());
    assert_eq!(
        after.to_extended_newick().unwrap(),
        before.to_extended_newick().unwrap()
    );
    assert_eq!(model.ln_posterior().unwrap().to_bits(), posterior.to_bits());
    assert!(model.touched_variables().is_empty());
}

#[test]
fn every_tree_move_rejects_to_the_committed_tree() {
    let (_, tree) = tree_model();
    for mut mv in tree_moves(tree) {
        for seed in 0..60 {
            assert_reject_restores(mv.as_mut(), seed);
        }
        assert_eq!(mv.core().tried(), 60);
        assert_eq!(mv.core().accepted(), 0);
    }
}

fn assert_replay_inverts(mv: &mut dyn Move, seed: u64) {
    let (mut model, tree) = tree_model();
    let before = model.tree(tree).unwrap().clone();
    let mut rng = RngHandle::from_seed(seed);
    mv.propose(&mut model, &mut rng).unwrap();
    if mv.core().is_failed() {
        assert_eq!(model.tree(tree).unwrap(), &before);
        assert!(model.touched_variables().is_empty());
    } else {
        mv.revert_edit(&mut model).unwrap();
        assert_eq!(
            model.tree(tree).unwrap(),
            &before,
            "{} seed {seed}: replayed edit differs from the committed tree",
            mv.core().name()
        );
    }
    model.restore_touched().unwrap();
    mv.core_mut().reset();
}

#[test]
fn recorded_edits_replay_back_to_the_committed_tree() {
    let (_, tree) = tree_model();
    for mut mv in tree_moves(tree) {
        for seed in 0..300 {
            assert_replay_inverts(mv.as_mut(), seed);
        }
    }
}

#[test]
fn accepted_edits_keep_invariants_and_conservation() {
    let (_, tree) = tree_model();
    for mut mv in tree_moves(tree) {
        let (mut model, tree) = tree_model();
        let mut rng = RngHandle::from_seed(77);
        for _ in 0..40 {
            mv.propose(&mut model, &mut rng).unwrap();
            if mv.core().is_failed() {
                mv.reject(&mut model).unwrap();
                continue;
            }
            mv.accept(&mut model).unwrap();
            let committed = model.tree(tree).unwrap();
            committed.check_invariants().unwrap();
            assert!(committed.num_admixture_events() <= 3);
            let cached = model.ln_posterior().unwrap();
            let full = model.full_ln_posterior();
            assert!(
                (cached - full).abs() <= CONSERVATION_TOLERANCE,
                "{}: cached {cached} vs full {full}",
                mv.core().name()
            );
        }
    }
}

#[test]
fn keep_is_idempotent_after_accept() {
    let (mut model, tree) = tree_model();
    let mut mv = AdmixtureEdgeSlide::new(tree, 10.0, 5.0, 1.0);
    let mut rng = RngHandle::from_seed(4);
    mv.propose(&mut model, &mut rng).unwrap();
    mv.accept(&mut model).unwrap();
    let kept = model.tree(tree).unwrap().clone();
    let posterior = model.ln_posterior().unwrap();
    model.keep_touched().unwrap();
    model.keep_touched().unwrap();
    assert_eq!(model.tree(tree).unwrap(), &kept);
    assert_eq!(model.ln_posterior().unwrap().to_bits(), posterior.to_bits());
}

#[test]
fn add_then_remove_hastings_ratios_are_opposite() {
    let (mut model, tree) = tree_model();
    let mut add = AdmixtureEdgeAdd::new(tree, 3, 1.0);
    let mut remove = AdmixtureEdgeRemove::new(tree, 1.0);
    let mut rng = RngHandle::from_seed(10);
    let birth = add.propose(&mut model, &mut rng).unwrap();
    assert!(!add.core().is_failed());
    add.accept(&mut model).unwrap();
    assert_eq!(model.tree(tree).unwrap().num_admixture_events(), 2);
    let newest = model.tree(tree).unwrap().clone();

    // Removing the edge that was just added must mirror the birth ratio.
    for seed in 0..200 {
        let death = remove.propose(&mut model, &mut RngHandle::from_seed(seed)).unwrap();
        let remaining = model.tree(tree).unwrap().clone();
        remove.reject(&mut model).unwrap();
        assert_eq!(model.tree(tree).unwrap(), &newest);
        let survivor = remaining.node(remaining.admixture_children()[0]).unwrap();
        if survivor.weight() == 0.2 && survivor.age() == 0.45 {
            assert!((birth.ln_hastings_ratio + death.ln_hastings_ratio).abs() < 1e-10);
            return;
        }
    }
    panic!("remove never selected the freshly added edge");
}

#[test]
fn add_respects_the_event_cap() {
    let (mut model, tree) = tree_model();
    let mut add = AdmixtureEdgeAdd::new(tree, 1, 1.0);
    let proposal = add.propose(&mut model, &mut RngHandle::from_seed(0)).unwrap();
    assert!(add.core().is_failed());
    assert_eq!(proposal.ln_hastings_ratio, f64::NEG_INFINITY);
    add.reject(&mut model).unwrap();
    assert_eq!(add.core().failures(), 1);
}

#[test]
fn cloned_moves_are_independent() {
    let (mut model, tree) = tree_model();
    let original: Box<dyn Move> = Box::new(AdmixtureEdgeReweight::new(tree, 5.0, 1.0));
    let mut copy = original.clone();
    copy.propose(&mut model, &mut RngHandle::from_seed(2)).unwrap();
    copy.accept(&mut model).unwrap();
    assert_eq!(copy.core().tried(), 1);
    assert_eq!(original.core().tried(), 0);
    assert_eq!(original.tuning_parameter(), Some(5.0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn reject_round_trips_for_any_seed(seed in any::<u64>(), pick in 0usize..8) {
        let (_, tree) = tree_model();
        let mut moves = tree_moves(tree);
        assert_reject_restores(moves[pick].as_mut(), seed);
    }
}
