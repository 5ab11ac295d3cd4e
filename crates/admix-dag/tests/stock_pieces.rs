use admix_core::stats::{beta_ln_pdf, gamma_ln_pdf, poisson_ln_pmf};
use admix_core::RngHandle;
use admix_dag::{
    AdmixtureEventCount, BetaDensity, BirthDeathDensity, Density, GammaDensity, Model,
    PoissonDensity, Product, TreeLength, UniformDensity, Value,
};
use admix_tree::BirthDeathProcess;

#[test]
fn stock_densities_match_closed_forms() {
    let two = Value::Real(2.0);
    let three = Value::Real(3.0);
    let gamma = GammaDensity::scalar().ln_density(&Value::Real(0.8), &[&two, &three]);
    assert!((gamma - gamma_ln_pdf(2.0, 3.0, 0.8)).abs() < 1e-12);
    let beta = BetaDensity::iid(2).ln_density(&Value::RealVector(vec![0.2, 0.9]), &[&two, &three]);
    let expected = beta_ln_pdf(2.0, 3.0, 0.2) + beta_ln_pdf(2.0, 3.0, 0.9);
    assert!((beta - expected).abs() < 1e-12);
    let poisson = PoissonDensity.ln_density(&Value::Integer(4), &[&three]);
    assert!((poisson - poisson_ln_pmf(3.0, 4)).abs() < 1e-12);
    let zero = Value::Real(0.0);
    let uniform = UniformDensity::scalar().ln_density(&Value::Real(2.5), &[&zero, &two]);
    assert_eq!(uniform, f64::NEG_INFINITY);
}

#[test]
fn stock_simulations_respect_shapes() {
    let mut rng = RngHandle::from_seed(8);
    let (lower, upper) = (Value::Real(-1.0), Value::Real(1.0));
    let draw = UniformDensity::iid(5).simulate(&[&lower, &upper], &mut rng).unwrap();
    let values = draw.as_real_vector().unwrap();
    assert_eq!(values.len(), 5);
    assert!(values.iter().all(|x| (-1.0..1.0).contains(x)));

    let rate = Value::Real(2.5);
    let count = PoissonDensity.simulate(&[&rate], &mut rng).unwrap();
    assert!(count.as_integer().unwrap() >= 0);

    let bad = Value::Real(-1.0);
    let err = GammaDensity::scalar().simulate(&[&bad, &rate], &mut rng).unwrap_err();
    assert_eq!(err.info().code, "density-parameters");
}

#[test]
fn tree_functions_follow_the_tree() {
    let taxa: Vec<String> = ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect();
    let density = BirthDeathDensity::new(BirthDeathProcess::new(taxa).unwrap());
    let mut rng = RngHandle::from_seed(21);
    let mut model = Model::new();
    let div = model.add_constant("diversification", 1.0).unwrap();
    let turnover = model.add_constant("turnover", 0.2).unwrap();
    let initial = density
        .simulate(&[&Value::Real(1.0), &Value::Real(0.2)], &mut rng)
        .unwrap();
    let tree = model
        .add_stochastic("tree", density, &[div, turnover], initial)
        .unwrap();
    let length = model.add_deterministic("length", TreeLength, &[tree]).unwrap();
    let events = model
        .add_deterministic("events", AdmixtureEventCount, &[tree])
        .unwrap();
    let doubled = model
        .add_deterministic("doubled", Product, &[length, div])
        .unwrap();
    model.initialize().unwrap();

    let expected = model.tree(tree).unwrap().tree_length();
    assert_eq!(model.real(length).unwrap(), expected);
    assert_eq!(model.value(events).unwrap(), &Value::Integer(0));
    assert_eq!(model.real(doubled).unwrap(), expected);
    assert!(model.ln_probability(tree).unwrap().is_finite());

    model.redraw(tree, &mut rng).unwrap();
    assert!(model.is_touched(length).unwrap());
    model.keep_touched().unwrap();
    let redrawn = model.tree(tree).unwrap().tree_length();
    assert_eq!(model.real(length).unwrap(), redrawn);
}

#[test]
fn values_serialize_with_kind_tags() {
    let json = serde_json::to_string(&Value::Real(1.5)).unwrap();
    assert_eq!(json, r#"{"kind":"Real","value":1.5}"#);
    let back: Value = serde_json::from_str(&json).unwrap();
    assert_eq!(back, Value::Real(1.5));
}
