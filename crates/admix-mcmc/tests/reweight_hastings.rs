use admix_core::stats::beta_ln_pdf;
use admix_core::{NodeId, RngHandle, VariableId};
use admix_dag::{BirthDeathDensity, Model};
use admix_tree::{AdmixtureTree, BirthDeathProcess, TreeBuilder};

use admix_mcmc::{AdmixtureEdgeReweight, Move, MoveState, PriorRatioTerm};

const LAMBDA: f64 = 5.0;

fn admixed_quartet() -> AdmixtureTree {
    let mut builder = TreeBuilder::new();
    let a = builder.tip("A", 0.0);
    let b = builder.tip("B", 0.0);
    let c = builder.tip("C", 0.0);
    let d = builder.tip("D", 0.0);
    let ab = builder.join(0.4, a, b).unwrap();
    let cd = builder.join(0.6, c, d).unwrap();
    let root = builder.join(1.0, ab, cd).unwrap();
    let mut tree = builder.finish(root).unwrap();
    tree.add_admixture_edge(NodeId::from_raw(4), NodeId::from_raw(2), 0.5, 0.3)
        .unwrap();
    tree
}

fn tree_model() -> (Model, VariableId) {
    let taxa = ["A", "B", "C", "D"].iter().map(|t| t.to_string()).collect();
    let process = BirthDeathProcess::new(taxa).unwrap();
    let mut model = Model::new();
    let diversification = model.add_constant("diversification", 1.0).unwrap();
    let turnover = model.add_constant("turnover", 0.1).unwrap();
    let tree = model
        .add_stochastic(
            "tree",
            BirthDeathDensity::new(process),
            &[diversification, turnover],
            admixed_quartet(),
        )
        .unwrap();
    model.initialize().unwrap();
    (model, tree)
}

fn admixture_weight(model: &Model, tree: VariableId) -> f64 {
    let tree = model.tree(tree).unwrap();
    let child = tree.admixture_children()[0];
    tree.node(child).unwrap().weight()
}

fn closed_form(old: f64, new: f64) -> f64 {
    beta_ln_pdf(LAMBDA * new + 1.0, LAMBDA * (1.0 - new) + 1.0, old)
        - beta_ln_pdf(LAMBDA * old + 1.0, LAMBDA * (1.0 - old) + 1.0, new)
}

#[test]
fn hastings_ratio_matches_beta_closed_form() {
    let (mut model, tree) = tree_model();
    let mut mv = AdmixtureEdgeReweight::new(tree, LAMBDA, 1.0);
    let mut rng = RngHandle::from_seed(31);
    for _ in 0..200 {
        let old = 2.0 * admixture_weight(&model, tree);
        let proposal = mv.propose(&mut model, &mut rng).unwrap();
        assert!(!mv.core().is_failed());
        let new = 2.0 * admixture_weight(&model, tree);
        assert_ne!(new, old);
        assert!(new > 0.0 && new <= 1.0);
        assert!((proposal.ln_hastings_ratio - closed_form(old, new)).abs() < 1e-10);
        assert_eq!(proposal.ln_prior_ratio, 0.0);
        mv.accept(&mut model).unwrap();
        assert_eq!(mv.core().state(), MoveState::Idle);
        assert_eq!(2.0 * admixture_weight(&model, tree), new);
    }
    assert_eq!(mv.core().tried(), 200);
    assert_eq!(mv.core().accepted(), 200);
}

#[test]
fn rejection_restores_the_original_weight() {
    let (mut model, tree) = tree_model();
    let before = model.tree(tree).unwrap().clone();
    let posterior = model.ln_posterior().unwrap();
    let mut mv = AdmixtureEdgeReweight::new(tree, LAMBDA, 1.0);
    let mut rng = RngHandle::from_seed(8);
    for _ in 0..50 {
        mv.propose(&mut model, &mut rng).unwrap();
        mv.reject(&mut model).unwrap();
        assert_eq!(model.tree(tree).unwrap(), &before);
        assert_eq!(admixture_weight(&model, tree), 0.3);
        assert_eq!(model.ln_posterior().unwrap().to_bits(), posterior.to_bits());
    }
}

#[test]
fn configured_prior_term_uses_beta_on_twice_the_weight() {
    let (mut model, tree) = tree_model();
    let term = PriorRatioTerm::Beta {
        alpha: 1.0,
        beta: 5.0,
    };
    let mut mv = AdmixtureEdgeReweight::new(tree, LAMBDA, 1.0).with_prior_term(term);
    let mut rng = RngHandle::from_seed(12);
    let proposal = mv.propose(&mut model, &mut rng).unwrap();
    let new = 2.0 * admixture_weight(&model, tree);
    let expected = beta_ln_pdf(1.0, 5.0, new) - beta_ln_pdf(1.0, 5.0, 0.6);
    assert!((proposal.ln_prior_ratio - expected).abs() < 1e-10);
    assert!((proposal.ln_hastings_ratio - closed_form(0.6, new)).abs() < 1e-10);
    mv.reject(&mut model).unwrap();
}

#[test]
fn tree_without_admixture_fails_cleanly() {
    let taxa = ["A", "B"].iter().map(|t| t.to_string()).collect();
    let process = BirthDeathProcess::new(taxa).unwrap();
    let mut builder = TreeBuilder::new();
    let a = builder.tip("A", 0.0);
    let b = builder.tip("B", 0.0);
    let root = builder.join(1.0, a, b).unwrap();
    let plain = builder.finish(root).unwrap();
    let mut model = Model::new();
    let diversification = model.add_constant("diversification", 1.0).unwrap();
    let turnover = model.add_constant("turnover", 0.1).unwrap();
    let tree = model
        .add_stochastic(
            "tree",
            BirthDeathDensity::new(process),
            &[diversification, turnover],
            plain.clone(),
        )
        .unwrap();
    model.initialize().unwrap();
    let mut mv = AdmixtureEdgeReweight::new(tree, LAMBDA, 1.0);
    let proposal = mv.propose(&mut model, &mut RngHandle::from_seed(1)).unwrap();
    assert!(mv.core().is_failed());
    assert_eq!(proposal.ln_hastings_ratio, f64::NEG_INFINITY);
    mv.reject(&mut model).unwrap();
    assert_eq!(mv.core().failures(), 1);
    assert_eq!(model.tree(tree).unwrap(), &plain);
}
