use admix_core::VariableId;
use admix_dag::{BirthDeathDensity, Model};
use admix_tree::{AdmixtureTree, BirthDeathProcess, TreeBuilder};

use admix_mcmc::{Mcmc, Move, NarrowExchange, StepOutcome};

fn caterpillar() -> AdmixtureTree {
    let mut builder = TreeBuilder::new();
    let a = builder.tip("A", 0.0);
    let b = builder.tip("B", 0.0);
    let c = builder.tip("C", 0.0);
    let d = builder.tip("D", 0.0);
    let ab = builder.join(0.3, a, b).unwrap();
    let abc = builder.join(0.6, ab, c).unwrap();
    let root = builder.join(1.0, abc, d).unwrap();
    builder.finish(root).unwrap()
}

fn tree_model() -> (Model, VariableId) {
    let taxa = ["A", "B", "C", "D"].iter().map(|t| t.to_string()).collect();
    let process = BirthDeathProcess::new(taxa).unwrap();
    let mut model = Model::new();
    let diversification = model.add_constant("diversification", 1.0).unwrap();
    let turnover = model.add_constant("turnover", 0.2).unwrap();
    let tree = model
        .add_stochastic(
            "tree",
            BirthDeathDensity::new(process),
            &[diversification, turnover],
            caterpillar(),
        )
        .unwrap();
    (model, tree)
}

fn exchange_run(seed: u64) -> (Vec<StepOutcome>, AdmixtureTree) {
    let (model, tree) = tree_model();
    let moves: Vec<Box<dyn Move>> = vec![Box::new(NarrowExchange::new(tree, 1.0))];
    let mut chain = Mcmc::new(model, moves, seed).unwrap();
    let outcomes = (0..10_000).map(|_| chain.step().unwrap()).collect();
    (outcomes, chain.model().tree(tree).unwrap().clone())
}

#[test]
fn ten_thousand_exchanges_are_reproducible() {
    let (first_outcomes, first_tree) = exchange_run(2024);
    let (second_outcomes, second_tree) = exchange_run(2024);
    assert_eq!(first_outcomes, second_outcomes);
    assert_eq!(first_tree, second_tree);
    assert_eq!(
        first_tree.to_extended_newick().unwrap(),
        second_tree.to_extended_newick().unwrap()
    );
    first_tree.check_invariants().unwrap();
    assert_eq!(first_tree.num_tips(), 4);
    assert_eq!(first_tree.tree_height(), 1.0);
}

#[test]
fn exchanges_mix_feasible_and_infeasible_draws() {
    let (outcomes, _) = exchange_run(7);
    let accepted = outcomes.iter().filter(|o| o.accepted).count();
    let failed = outcomes.iter().filter(|o| o.failed).count();
    assert!(accepted > 0);
    assert!(failed > 0);
    assert!(outcomes.iter().all(|o| !(o.accepted && o.failed)));
}

#[test]
fn different_seeds_diverge() {
    let (first, _) = exchange_run(1);
    let (second, _) = exchange_run(2);
    assert_ne!(first, second);
}

#[test]
fn operator_counters_match_outcomes() {
    let (model, tree) = tree_model();
    let moves: Vec<Box<dyn Move>> = vec![Box::new(NarrowExchange::new(tree, 1.0))];
    let mut chain = Mcmc::new(model, moves, 99).unwrap();
    let outcomes: Vec<StepOutcome> = (0..500).map(|_| chain.step().unwrap()).collect();
    let summary = &chain.operator_summary()[0];
    assert_eq!(summary.name, "narrow-exchange");
    assert_eq!(summary.targets, vec!["tree".to_string()]);
    assert_eq!(summary.tried, 500);
    assert_eq!(summary.accepted as usize, outcomes.iter().filter(|o| o.accepted).count());
    assert_eq!(summary.failed as usize, outcomes.iter().filter(|o| o.failed).count());
}
