use admix_core::{AdmixError, NodeId, RngHandle, VariableId};
use admix_dag::{BirthDeathDensity, ExponentialDensity, Model};
use admix_tree::{AdmixtureTree, BirthDeathProcess, TreeBuilder};

use admix_mcmc::{
    AdmixtureEdgeAdd, AdmixtureEdgeRemove, AdmixtureEdgeReweight, AdmixtureEdgeSlide,
    FixedNodeheightPruneRegraft, Mcmc, Move, MoveCore, MoveState, NarrowExchange,
    NodeTimeSlideBeta, ScaleMove,
};

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

struct RatesModel {
    model: Model,
    tree: VariableId,
    diversification: VariableId,
    turnover: VariableId,
}

fn rates_model() -> RatesModel {
    let taxa = ["A", "B", "C", "D"].iter().map(|t| t.to_string()).collect();
    let process = BirthDeathProcess::new(taxa).unwrap();
    let mut model = Model::new();
    let one = model.add_constant("one", 1.0).unwrap();
    let five = model.add_constant("five", 5.0).unwrap();
    let diversification = model
        .add_stochastic("diversification", ExponentialDensity::scalar(), &[one], 1.0)
        .unwrap();
    let turnover = model
        .add_stochastic("turnover", ExponentialDensity::scalar(), &[five], 0.1)
        .unwrap();
    let tree = model
        .add_stochastic(
            "tree",
            BirthDeathDensity::new(process),
            &[diversification, turnover],
            admixed_quartet(),
        )
        .unwrap();
    RatesModel {
        model,
        tree,
        diversification,
        turnover,
    }
}

fn mixed_moves(m: &RatesModel) -> Vec<Box<dyn Move>> {
    vec![
        Box::new(ScaleMove::new(m.diversification, 1.0, 2.0)),
        Box::new(ScaleMove::new(m.turnover, 1.0, 2.0)),
        Box::new(NarrowExchange::new(m.tree, 1.0)),
        Box::new(FixedNodeheightPruneRegraft::new(m.tree, 1.0)),
        Box::new(NodeTimeSlideBeta::new(m.tree, 10.0, 2.0)),
        Box::new(AdmixtureEdgeAdd::new(m.tree, 3, 1.0)),
        Box::new(AdmixtureEdgeRemove::new(m.tree, 1.0)),
        Box::new(AdmixtureEdgeReweight::new(m.tree, 5.0, 1.0)),
        Box::new(AdmixtureEdgeSlide::new(m.tree, 10.0, 5.0, 1.0)),
    ]
}

#[test]
fn second_propose_without_resolution_is_an_error() {
    let RatesModel {
        mut model,
        diversification,
        ..
    } = rates_model();
    model.initialize().unwrap();
    let mut mv = ScaleMove::new(diversification, 1.0, 1.0);
    let mut rng = RngHandle::from_seed(1);
    mv.propose(&mut model, &mut rng).unwrap();
    assert_eq!(mv.core().state(), MoveState::Proposed);
    let err = mv.propose(&mut model, &mut rng).unwrap_err();
    assert!(matches!(err, AdmixError::Move(info) if info.code == "move-not-resolved"));
    mv.reject(&mut model).unwrap();
    assert_eq!(mv.core().state(), MoveState::Idle);
}

#[test]
fn resolving_without_a_proposal_is_an_error() {
    let RatesModel {
        mut model,
        diversification,
        ..
    } = rates_model();
    model.initialize().unwrap();
    let mut mv = ScaleMove::new(diversification, 1.0, 1.0);
    let err = mv.accept(&mut model).unwrap_err();
    assert!(matches!(err, AdmixError::Move(info) if info.code == "no-pending-proposal"));
    let err = mv.reject(&mut model).unwrap_err();
    assert!(matches!(err, AdmixError::Move(info) if info.code == "no-pending-proposal"));
}

#[test]
fn failed_proposals_cannot_be_accepted() {
    let RatesModel { mut model, tree, .. } = rates_model();
    model.initialize().unwrap();
    let mut add = AdmixtureEdgeAdd::new(tree, 1, 1.0);
    add.propose(&mut model, &mut RngHandle::from_seed(5)).unwrap();
    assert!(add.core().is_failed());
    let err = add.accept(&mut model).unwrap_err();
    assert!(matches!(err, AdmixError::Move(info) if info.code == "accept-failed-proposal"));
    add.reject(&mut model).unwrap();
    assert_eq!(add.core().state(), MoveState::Idle);
}

#[test]
fn chain_needs_moves() {
    let RatesModel { model, .. } = rates_model();
    let err = Mcmc::new(model, Vec::new(), 1).err().unwrap();
    assert!(matches!(err, AdmixError::Chain(info) if info.code == "no-moves"));
}

#[test]
fn posterior_is_conserved_every_generation() {
    let m = rates_model();
    let moves = mixed_moves(&m);
    let mut chain = Mcmc::new(m.model, moves, 314).unwrap().with_verify_interval(1);
    for _ in 0..300 {
        chain.advance().unwrap();
    }
    assert_eq!(chain.generation(), 300);
    chain.model().tree(m.tree).unwrap().check_invariants().unwrap();
    let full = chain.model().full_ln_posterior();
    assert!((chain.ln_posterior() - full).abs() <= admix_mcmc::CONSERVATION_TOLERANCE);
    let summary = chain.operator_summary();
    assert!(summary.iter().map(|op| op.accepted).sum::<u64>() > 0);
}

#[test]
fn generation_runs_summed_weights_or_the_override() {
    let m = rates_model();
    let moves = mixed_moves(&m);
    let total_weight: f64 = moves.iter().map(|mv| mv.core().weight()).sum();
    let mut chain = Mcmc::new(m.model.clone(), moves.clone(), 9).unwrap();
    for _ in 0..10 {
        chain.advance().unwrap();
    }
    let tried: u64 = chain.operator_summary().iter().map(|op| op.tried).sum();
    assert_eq!(tried, 10 * total_weight.round() as u64);

    let mut fixed = Mcmc::new(m.model, moves, 9)
        .unwrap()
        .with_moves_per_generation(3);
    for _ in 0..10 {
        fixed.advance().unwrap();
    }
    let tried: u64 = fixed.operator_summary().iter().map(|op| op.tried).sum();
    assert_eq!(tried, 30);
}

#[test]
fn delayed_moves_wait_for_their_generation() {
    let m = rates_model();
    let delayed = ScaleMove::with_core(
        MoveCore::new("delayed-scale", vec![m.turnover], 1.0).with_delay(5),
        1.0,
    );
    let moves: Vec<Box<dyn Move>> = vec![
        Box::new(ScaleMove::new(m.diversification, 1.0, 1.0)),
        Box::new(delayed),
    ];
    let mut chain = Mcmc::new(m.model, moves, 21).unwrap();
    for _ in 0..5 {
        chain.advance().unwrap();
    }
    assert_eq!(chain.operator_summary()[1].tried, 0);
    for _ in 0..50 {
        chain.advance().unwrap();
    }
    assert!(chain.operator_summary()[1].tried > 0);
}

#[test]
fn same_seed_gives_same_chain() {
    let run = |seed| {
        let m = rates_model();
        let moves = mixed_moves(&m);
        let mut chain = Mcmc::new(m.model, moves, seed).unwrap();
        for _ in 0..100 {
            chain.advance().unwrap();
        }
        (
            chain.ln_posterior().to_bits(),
            chain.model().tree(m.tree).unwrap().clone(),
        )
    };
    assert_eq!(run(55), run(55));
}

#[test]
fn operator_table_lists_every_move() {
    let m = rates_model();
    let moves = mixed_moves(&m);
    let mut chain = Mcmc::new(m.model, moves, 2).unwrap();
    for _ in 0..20 {
        chain.advance().unwrap();
    }
    let mut table = Vec::new();
    chain.print_operator_summary(&mut table).unwrap();
    let table = String::from_utf8(table).unwrap();
    for name in [
        "scale",
        "narrow-exchange",
        "fixed-nodeheight-prune-regraft",
        "node-time-slide-beta",
        "admixture-edge-add",
        "admixture-edge-remove",
        "admixture-edge-reweight",
        "admixture-edge-slide",
    ] {
        assert!(table.contains(name), "missing {name} in\n{table}");
    }
}
