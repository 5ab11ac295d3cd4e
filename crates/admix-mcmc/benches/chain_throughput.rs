use admix_core::RngHandle;
use admix_dag::{BirthDeathDensity, ExponentialDensity, Model};
use admix_tree::BirthDeathProcess;
use criterion::{criterion_group, criterion_main, Criterion};

use admix_mcmc::{
    AdmixtureEdgeAdd, AdmixtureEdgeRemove, AdmixtureEdgeReweight, AdmixtureEdgeSlide,
    FixedNodeheightPruneRegraft, Mcmc, McmcConfig, Move, MonitorTargets, NarrowExchange,
    NodeTimeSlideBeta, ScaleMove,
};

fn sample_problem() -> (Model, Vec<Box<dyn Move>>, MonitorTargets) {
    let taxa: Vec<String> = (0..8).map(|i| format!("T{i}")).collect();
    let process = BirthDeathProcess::new(taxa).unwrap();
    let mut start = process.simulate(1.0, 0.2, &mut RngHandle::from_seed(3)).unwrap();
    let (source, destination) = (start.tips()[0], start.tips()[7]);
    let parent_age = |tip| start.age(start.parent(tip).unwrap().unwrap()).unwrap();
    let age = 0.5 * parent_age(source).min(parent_age(destination));
    start.add_admixture_edge(source, destination, age, 0.2).unwrap();

    let mut model = Model::new();
    let one = model.add_constant("one", 1.0).unwrap();
    let five = model.add_constant("five", 5.0).unwrap();
    let diversification = model
        .add_stochastic("diversification", ExponentialDensity::scalar(), &[one], 1.0)
        .unwrap();
    let turnover = model
        .add_stochastic("turnover", ExponentialDensity::scalar(), &[five], 0.2)
        .unwrap();
    let tree = model
        .add_stochastic(
            "tree",
            BirthDeathDensity::new(process),
            &[diversification, turnover],
            start,
        )
        .unwrap();
    let moves: Vec<Box<dyn Move>> = vec![
        Box::new(ScaleMove::new(diversification, 1.0, 1.0)),
        Box::new(ScaleMove::new(turnover, 1.0, 1.0)),
        Box::new(NarrowExchange::new(tree, 2.0)),
        Box::new(FixedNodeheightPruneRegraft::new(tree, 2.0)),
        Box::new(NodeTimeSlideBeta::new(tree, 10.0, 4.0)),
        Box::new(AdmixtureEdgeAdd::new(tree, 4, 1.0)),
        Box::new(AdmixtureEdgeRemove::new(tree, 1.0)),
        Box::new(AdmixtureEdgeReweight::new(tree, 5.0, 2.0)),
        Box::new(AdmixtureEdgeSlide::new(tree, 10.0, 5.0, 2.0)),
    ];
    let targets = MonitorTargets {
        traced: vec![diversification, turnover],
        tree: Some(tree),
    };
    (model, moves, targets)
}

fn bench_generations(c: &mut Criterion) {
    let (model, moves, _) = sample_problem();
    c.bench_function("mcmc_generation", |b| {
        let mut chain = Mcmc::new(model.clone(), moves.clone(), 42).unwrap();
        b.iter(|| chain.advance().unwrap())
    });
}

fn bench_run(c: &mut Criterion) {
    let mut config = McmcConfig::default();
    config.generations = 50;
    config.monitor.screen_interval = 0;
    config.tempering.chains = 2;
    config.tempering.swap_interval = 5;

    c.bench_function("tempered_run", |b| {
        b.iter(|| {
            let (model, moves, targets) = sample_problem();
            let _ = admix_mcmc::run(&config, model, moves, &targets).unwrap();
        })
    });
}

criterion_group!(benches, bench_generations, bench_run);
criterion_main!(benches);
