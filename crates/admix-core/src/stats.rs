//! Special functions and log-densities used by proposals and stock distributions.

use rand_distr::{Beta, Distribution};

use crate::errors::{AdmixError, ErrorInfo};
use crate::rng::RngHandle;

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEFFICIENTS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// Returns `true` when `value` is neither NaN nor infinite.
pub fn is_computable(value: f64) -> bool {
    value.is_finite()
}

/// Natural logarithm of the gamma function (Lanczos approximation).
pub fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        // reflection
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin().abs()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = LANCZOS_COEFFICIENTS[0];
    for (i, coefficient) in LANCZOS_COEFFICIENTS.iter().enumerate().skip(1) {
        acc += coefficient / (x + i as f64);
    }
    let t = x + LANCZOS_G + 0.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

/// Natural logarithm of the beta function `B(a, b)`.
pub fn ln_beta_function(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

fn xlogy(k: f64, y: f64) -> f64 {
    if k == 0.0 {
        0.0
    } else {
        k * y.ln()
    }
}

/// Log-density of `Beta(a, b)` at `x`.
pub fn beta_ln_pdf(a: f64, b: f64, x: f64) -> f64 {
    if !(0.0..=1.0).contains(&x) {
        return f64::NEG_INFINITY;
    }
    xlogy(a - 1.0, x) + xlogy(b - 1.0, 1.0 - x) - ln_beta_function(a, b)
}

/// Log-density of a normal distribution.
pub fn normal_ln_pdf(mean: f64, sd: f64, x: f64) -> f64 {
    if sd <= 0.0 {
        return f64::NAN;
    }
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
}

/// Log-density of an exponential distribution parameterised by its rate.
pub fn exponential_ln_pdf(rate: f64, x: f64) -> f64 {
    if rate <= 0.0 {
        return f64::NAN;
    }
    if x < 0.0 {
        return f64::NEG_INFINITY;
    }
    rate.ln() - rate * x
}

/// Log-density of a gamma distribution parameterised by shape and rate.
pub fn gamma_ln_pdf(shape: f64, rate: f64, x: f64) -> f64 {
    if shape <= 0.0 || rate <= 0.0 {
        return f64::NAN;
    }
    if x < 0.0 {
        return f64::NEG_INFINITY;
    }
    shape * rate.ln() + xlogy(shape - 1.0, x) - rate * x - ln_gamma(shape)
}

/// Log-density of the uniform distribution on `[lower, upper]`.
pub fn uniform_ln_pdf(lower: f64, upper: f64, x: f64) -> f64 {
    if upper <= lower {
        return f64::NAN;
    }
    if x < lower || x > upper {
        return f64::NEG_INFINITY;
    }
    -(upper - lower).ln()
}

/// Log-probability mass of a Poisson distribution.
pub fn poisson_ln_pmf(rate: f64, k: i64) -> f64 {
    if rate < 0.0 {
        return f64::NAN;
    }
    if k < 0 {
        return f64::NEG_INFINITY;
    }
    let k = k as f64;
    xlogy(k, rate) - rate - ln_gamma(k + 1.0)
}

/// Draws a `Beta(a, b)` variate.
pub fn sample_beta(rng: &mut RngHandle, a: f64, b: f64) -> Result<f64, AdmixError> {
    let beta = Beta::new(a, b).map_err(|err| {
        AdmixError::Move(
            ErrorInfo::new("beta-parameters", err.to_string())
                .with_context("alpha", a)
                .with_context("beta", b),
        )
    })?;
    Ok(beta.sample(rng))
}
