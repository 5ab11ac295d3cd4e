use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::monitors::Trace;

/// Posterior summary of one trace column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    /// Column name.
    pub name: String,
    /// Sample mean.
    pub mean: f64,
    /// Unbiased sample variance.
    pub variance: f64,
    /// Effective sample size.
    pub ess: f64,
}

impl ParameterSummary {
    /// Monte Carlo standard error of the mean.
    pub fn standard_error(&self) -> f64 {
        (self.variance / self.ess).sqrt()
    }
}

/// Sample mean; NaN for an empty slice.
pub fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Unbiased sample variance; zero below two samples.
pub fn variance(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let centre = mean(samples);
    samples.iter().map(|x| (x - centre).powi(2)).sum::<f64>() / (samples.len() - 1) as f64
}

fn autocovariance(samples: &[f64], centre: f64, lag: usize) -> f64 {
    let n = samples.len();
    samples[..n - lag]
        .iter()
        .zip(&samples[lag..])
        .map(|(a, b)| (a - centre) * (b - centre))
        .sum::<f64>()
        / n as f64
}

/// Effective sample size using Geyer's initial positive sequence.
///
/// Sums of adjacent autocovariance pairs are accumulated while positive. A
/// constant trace reports the raw sample count.
pub fn effective_sample_size(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n < 4 {
        return n as f64;
    }
    let centre = mean(samples);
    let gamma0 = autocovariance(samples, centre, 0);
    if !(gamma0 > 0.0) {
        return n as f64;
    }
    let mut pair_sum = 0.0;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = autocovariance(samples, centre, lag) + autocovariance(samples, centre, lag + 1);
        if pair <= 0.0 {
            break;
        }
        pair_sum += pair;
        lag += 2;
    }
    let tau = -1.0 + 2.0 * pair_sum / gamma0;
    if tau > 0.0 {
        n as f64 / tau
    } else {
        n as f64
    }
}

/// Mean, variance and ESS of every column in `trace`.
pub fn summarize(trace: &Trace) -> Vec<ParameterSummary> {
    trace
        .names
        .iter()
        .filter_map(|name| {
            let column = trace.column(name)?;
            Some(ParameterSummary {
                name: name.clone(),
                mean: mean(&column),
                variance: variance(&column),
                ess: effective_sample_size(&column),
            })
        })
        .collect()
}

/// Writes a trace as CSV with one row per sample.
pub fn write_csv<P: AsRef<Path>>(trace: &Trace, path: P) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    let mut header = vec!["generation".to_string(), "ln_posterior".to_string()];
    header.extend(trace.names.iter().cloned());
    writeln!(file, "{}", header.join(","))?;
    for sample in &trace.samples {
        let mut row = vec![sample.generation.to_string(), format!("{:.6}", sample.ln_posterior)];
        row.extend(sample.values.iter().map(|value| format!("{value:.6}")));
        writeln!(file, "{}", row.join(","))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_draws_have_near_full_ess() {
        let samples: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!(effective_sample_size(&samples) >= 200.0);
        let sticky: Vec<f64> = (0..200).map(|i| (i / 20) as f64).collect();
        assert!(effective_sample_size(&sticky) < 20.0);
    }

    #[test]
    fn variance_matches_hand_computation() {
        let samples = [1.0, 2.0, 3.0, 4.0];
        assert!((mean(&samples) - 2.5).abs() < 1e-12);
        assert!((variance(&samples) - 5.0 / 3.0).abs() < 1e-12);
    }
}
