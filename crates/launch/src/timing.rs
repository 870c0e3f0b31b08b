//! Latency aggregation for repeated measurements.

use anyhow::{ensure, Result};

/// Mean of the samples after dropping the single smallest and single
/// largest. Needs at least three samples to stay non-degenerate.
pub fn trimmed_mean(samples: &[f64]) -> Result<f64> {
    ensure!(
        samples.len() >= 3,
        "trimmed mean needs at least 3 samples, got {}",
        samples.len()
    );
    let mut kept: Vec<f64> = samples.to_vec();
    let min_idx = extreme_index(&kept, |a, b| a < b);
    kept.remove(min_idx);
    let max_idx = extreme_index(&kept, |a, b| a > b);
    kept.remove(max_idx);
    Ok(kept.iter().sum::<f64>() / kept.len() as f64)
}

fn extreme_index(samples: &[f64], better: impl Fn(f64, f64) -> bool) -> usize {
    let mut idx = 0;
    for (i, &sample) in samples.iter().enumerate().skip(1) {
        if better(sample, samples[idx]) {
            idx = i;
        }
    }
    idx
}
