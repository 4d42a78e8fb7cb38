//! Weighted posterior summaries.
//!
//! Both the run-length encoded sampler output and the importance-weighted
//! output reduce to the same form here: parameter draws with nonnegative
//! weights. Quantiles are weighted empirical quantiles; the effective
//! sample size is the usual (Σw)²/Σw² of the normalized weights.

use faer::Col;
use itertools::Itertools;

use crate::is_corr::IsOutput;
use crate::mcmc::McmcOutput;

#[derive(Debug, Clone, Copy)]
pub struct ParameterSummary {
    pub mean: f64,
    pub sd: f64,
    pub median: f64,
    /// 2.5% quantile.
    pub lower: f64,
    /// 97.5% quantile.
    pub upper: f64,
}

#[derive(Debug, Clone)]
pub struct PosteriorSummary {
    /// One entry per hyperparameter.
    pub parameters: Vec<ParameterSummary>,
    /// Effective sample size implied by the weights.
    pub ess: f64,
}

fn weighted_quantile(pairs: &[(f64, f64)], total: f64, prob: f64) -> f64 {
    // `pairs` sorted by value; first value whose cumulative weight covers
    // the requested probability mass.
    let mut cum = 0f64;
    for &(value, weight) in pairs {
        cum += weight;
        if cum >= prob * total {
            return value;
        }
    }
    pairs.last().map(|&(v, _)| v).unwrap_or(f64::NAN)
}

fn summarize_weighted(theta: &[Vec<f64>], weights: &[f64]) -> PosteriorSummary {
    let total: f64 = weights.iter().sum();
    let sum_sq: f64 = weights.iter().map(|&w| w * w).sum();
    let ess = if sum_sq > 0f64 { total * total / sum_sq } else { 0f64 };

    let npar = theta.first().map_or(0, |t| t.len());
    let parameters = (0..npar)
        .map(|k| {
            let mean: f64 = theta
                .iter()
                .zip(weights.iter())
                .map(|(t, &w)| w * t[k])
                .sum::<f64>()
                / total;
            let var: f64 = theta
                .iter()
                .zip(weights.iter())
                .map(|(t, &w)| w * (t[k] - mean) * (t[k] - mean))
                .sum::<f64>()
                / total;

            let sorted: Vec<(f64, f64)> = theta
                .iter()
                .zip(weights.iter())
                .map(|(t, &w)| (t[k], w))
                .sorted_by(|a, b| a.0.total_cmp(&b.0))
                .collect();

            ParameterSummary {
                mean,
                sd: var.max(0f64).sqrt(),
                median: weighted_quantile(&sorted, total, 0.5),
                lower: weighted_quantile(&sorted, total, 0.025),
                upper: weighted_quantile(&sorted, total, 0.975),
            }
        })
        .collect();

    PosteriorSummary { parameters, ess }
}

/// Summarize one chain; the run lengths act as integer weights.
pub fn summarize_chain(chain: &McmcOutput) -> PosteriorSummary {
    let weights: Vec<f64> = chain.counts.iter().map(|&c| c as f64).collect();
    summarize_weighted(&chain.theta, &weights)
}

/// Pool several chains of the same posterior into one summary.
pub fn summarize_chains(chains: &[McmcOutput]) -> PosteriorSummary {
    let theta: Vec<Vec<f64>> = chains.iter().flat_map(|c| c.theta.iter().cloned()).collect();
    let weights: Vec<f64> = chains
        .iter()
        .flat_map(|c| c.counts.iter().map(|&n| n as f64))
        .collect();
    summarize_weighted(&theta, &weights)
}

fn is_weights(out: &IsOutput) -> Vec<f64> {
    // Normalize by the largest log-weight; summaries are invariant to the
    // common factor.
    let max_lw = out
        .log_weights
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    out.counts
        .iter()
        .zip(out.log_weights.iter())
        .map(|(&c, &lw)| c as f64 * (lw - max_lw).exp())
        .collect()
}

/// Summarize an importance-corrected chain; each distinct value carries
/// its run length times its importance weight.
pub fn summarize_is(out: &IsOutput) -> PosteriorSummary {
    summarize_weighted(&out.theta, &is_weights(out))
}

/// Weighted posterior mean of the latent states from the stored
/// trajectories of an importance-corrected chain.
pub fn state_means(out: &IsOutput) -> Vec<Col<f64>> {
    let weights = is_weights(out);
    let total: f64 = weights.iter().sum();
    let n = out.trajectories.first().map_or(0, |t| t.len());
    let m = out
        .trajectories
        .first()
        .and_then(|t| t.first())
        .map_or(0, |s| s.nrows());

    (0..n)
        .map(|t| {
            Col::from_fn(m, |i| {
                out.trajectories
                    .iter()
                    .zip(weights.iter())
                    .map(|(traj, &w)| w * traj[t][i])
                    .sum::<f64>()
                    / total
            })
        })
        .collect()
}
