//! Density callbacks for stochastic variables and the stock set shipped with the crate.

use std::fmt;

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_core::stats::{
    beta_ln_pdf, exponential_ln_pdf, gamma_ln_pdf, normal_ln_pdf, poisson_ln_pmf, sample_beta,
    uniform_ln_pdf,
};
use admix_core::RngHandle;
use admix_tree::BirthDeathProcess;
use rand_distr::{Distribution, Exp, Gamma, Normal, Poisson};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Probability density (or mass) of a stochastic variable given its parents.
///
/// Parents are passed in the order they were registered. Implementations return
/// NaN when the density is undefined at the given parents and `-inf` when the
/// value lies outside the support.
pub trait Density: fmt::Debug + Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Log-density of `value`.
    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64;

    /// Draws a fresh value.
    fn simulate(&self, parents: &[&Value], rng: &mut RngHandle) -> Result<Value, AdmixError>;
}

/// Number of independent draws a stock density produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shape {
    /// A single real.
    Scalar,
    /// A vector of independent, identically distributed reals.
    Iid(usize),
}

fn param(parents: &[&Value], idx: usize) -> f64 {
    parents
        .get(idx)
        .and_then(|value| value.as_real())
        .unwrap_or(f64::NAN)
}

fn iid_ln_density(value: &Value, ln_pdf: impl Fn(f64) -> f64) -> f64 {
    match value.elements() {
        Some(elements) => elements.into_iter().map(ln_pdf).sum(),
        None => f64::NAN,
    }
}

fn iid_draw(
    shape: Shape,
    rng: &mut RngHandle,
    mut draw: impl FnMut(&mut RngHandle) -> Result<f64, AdmixError>,
) -> Result<Value, AdmixError> {
    match shape {
        Shape::Scalar => Ok(Value::Real(draw(rng)?)),
        Shape::Iid(len) => {
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                values.push(draw(rng)?);
            }
            Ok(Value::RealVector(values))
        }
    }
}

fn parameter_error(density: &str, message: impl ToString) -> AdmixError {
    AdmixError::Graph(
        ErrorInfo::new("density-parameters", message.to_string()).with_context("density", density),
    )
}

/// Normal distribution with parents `[mean, sd]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalDensity {
    shape: Shape,
}

impl NormalDensity {
    /// Density over a single real.
    pub fn scalar() -> Self {
        Self { shape: Shape::Scalar }
    }

    /// Density over `len` IID reals.
    pub fn iid(len: usize) -> Self {
        Self { shape: Shape::Iid(len) }
    }
}

impl Density for NormalDensity {
    fn name(&self) -> &str {
        "normal"
    }

    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        let (mean, sd) = (param(parents, 0), param(parents, 1));
        iid_ln_density(value, |x| normal_ln_pdf(mean, sd, x))
    }

    fn simulate(&self, parents: &[&Value], rng: &mut RngHandle) -> Result<Value, AdmixError> {
        let normal = Normal::new(param(parents, 0), param(parents, 1))
            .map_err(|err| parameter_error(self.name(), err))?;
        iid_draw(self.shape, rng, |rng| Ok(normal.sample(rng)))
    }
}

/// Exponential distribution with parent `[rate]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExponentialDensity {
    shape: Shape,
}

impl ExponentialDensity {
    /// Density over a single real.
    pub fn scalar() -> Self {
        Self { shape: Shape::Scalar }
    }

    /// Density over `len` IID reals.
    pub fn iid(len: usize) -> Self {
        Self { shape: Shape::Iid(len) }
    }
}

impl Density for ExponentialDensity {
    fn name(&self) -> &str {
        "exponential"
    }

    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        let rate = param(parents, 0);
        iid_ln_density(value, |x| exponential_ln_pdf(rate, x))
    }

    fn simulate(&self, parents: &[&Value], rng: &mut RngHandle) -> Result<Value, AdmixError> {
        let exp = Exp::new(param(parents, 0)).map_err(|err| parameter_error(self.name(), err))?;
        iid_draw(self.shape, rng, |rng| Ok(exp.sample(rng)))
    }
}

/// Gamma distribution with parents `[shape, rate]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GammaDensity {
    shape: Shape,
}

impl GammaDensity {
    /// Density over a single real.
    pub fn scalar() -> Self {
        Self { shape: Shape::Scalar }
    }

    /// Density over `len` IID reals.
    pub fn iid(len: usize) -> Self {
        Self { shape: Shape::Iid(len) }
    }
}

impl Density for GammaDensity {
    fn name(&self) -> &str {
        "gamma"
    }

    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        let (shape, rate) = (param(parents, 0), param(parents, 1));
        iid_ln_density(value, |x| gamma_ln_pdf(shape, rate, x))
    }

    fn simulate(&self, parents: &[&Value], rng: &mut RngHandle) -> Result<Value, AdmixError> {
        let gamma = Gamma::new(param(parents, 0), 1.0 / param(parents, 1))
            .map_err(|err| parameter_error(self.name(), err))?;
        iid_draw(self.shape, rng, |rng| Ok(gamma.sample(rng)))
    }
}

/// Uniform distribution with parents `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniformDensity {
    shape: Shape,
}

impl UniformDensity {
    /// Density over a single real.
    pub fn scalar() -> Self {
        Self { shape: Shape::Scalar }
    }

    /// Density over `len` IID reals.
    pub fn iid(len: usize) -> Self {
        Self { shape: Shape::Iid(len) }
    }
}

impl Density for UniformDensity {
    fn name(&self) -> &str {
        "uniform"
    }

    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        let (lower, upper) = (param(parents, 0), param(parents, 1));
        iid_ln_density(value, |x| uniform_ln_pdf(lower, upper, x))
    }

    fn simulate(&self, parents: &[&Value], rng: &mut RngHandle) -> Result<Value, AdmixError> {
        let (lower, upper) = (param(parents, 0), param(parents, 1));
        if !(lower < upper) || !(upper - lower).is_finite() {
            return Err(parameter_error(self.name(), "uniform bounds must be finite and ordered"));
        }
        iid_draw(self.shape, rng, |rng| Ok(lower + (upper - lower) * rng.uniform01()))
    }
}

/// Beta distribution with parents `[alpha, beta]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaDensity {
    shape: Shape,
}

impl BetaDensity {
    /// Density over a single real.
    pub fn scalar() -> Self {
        Self { shape: Shape::Scalar }
    }

    /// Density over `len` IID reals.
    pub fn iid(len: usize) -> Self {
        Self { shape: Shape::Iid(len) }
    }
}

impl Density for BetaDensity {
    fn name(&self) -> &str {
        "beta"
    }

    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        let (alpha, beta) = (param(parents, 0), param(parents, 1));
        if !(alpha > 0.0 && beta > 0.0) {
            return f64::NAN;
        }
        iid_ln_density(value, |x| beta_ln_pdf(alpha, beta, x))
    }

    fn simulate(&self, parents: &[&Value], rng: &mut RngHandle) -> Result<Value, AdmixError> {
        let (alpha, beta) = (param(parents, 0), param(parents, 1));
        iid_draw(self.shape, rng, |rng| sample_beta(rng, alpha, beta))
    }
}

/// Poisson distribution over an integer with parent `[rate]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoissonDensity;

impl Density for PoissonDensity {
    fn name(&self) -> &str {
        "poisson"
    }

    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        match value.as_integer() {
            Some(k) => poisson_ln_pmf(param(parents, 0), k),
            None => f64::NAN,
        }
    }

    fn simulate(&self, parents: &[&Value], rng: &mut RngHandle) -> Result<Value, AdmixError> {
        let poisson =
            Poisson::new(param(parents, 0)).map_err(|err| parameter_error(self.name(), err))?;
        let draw: f64 = poisson.sample(rng);
        Ok(Value::Integer(draw as i64))
    }
}

/// Birth-death prior over admixture trees with parents `[diversification, turnover]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BirthDeathDensity {
    process: BirthDeathProcess,
}

impl BirthDeathDensity {
    /// Wraps a configured process.
    pub fn new(process: BirthDeathProcess) -> Self {
        Self { process }
    }

    /// The wrapped process.
    pub fn process(&self) -> &BirthDeathProcess {
        &self.process
    }
}

impl Density for BirthDeathDensity {
    fn name(&self) -> &str {
        "birth-death"
    }

    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        match value.as_tree() {
            Some(tree) => self
                .process
                .ln_density(tree, param(parents, 0), param(parents, 1)),
            None => f64::NAN,
        }
    }

    fn simulate(&self, parents: &[&Value], rng: &mut RngHandle) -> Result<Value, AdmixError> {
        let tree = self
            .process
            .simulate(param(parents, 0), param(parents, 1), rng)?;
        Ok(Value::from(tree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iid_densities_sum_elements() {
        let density = NormalDensity::iid(2);
        let (mean, sd) = (Value::Real(0.0), Value::Real(1.0));
        let joint = density.ln_density(&Value::RealVector(vec![0.5, -1.0]), &[&mean, &sd]);
        let expected = normal_ln_pdf(0.0, 1.0, 0.5) + normal_ln_pdf(0.0, 1.0, -1.0);
        assert!((joint - expected).abs() < 1e-12);
    }

    #[test]
    fn missing_parents_are_undefined() {
        assert!(ExponentialDensity::scalar()
            .ln_density(&Value::Real(1.0), &[])
            .is_nan());
        assert!(PoissonDensity.ln_density(&Value::Real(1.0), &[&Value::Real(1.0)]).is_nan());
    }
}
