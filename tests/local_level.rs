//! End-to-end runs of the public API on local level models.

use approx::assert_abs_diff_eq;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bayes_ssm::{
    bootstrap_filter, gaussian_approx, is_correction, kalman_filter, psi_filter, run_chain,
    run_mcmc_gaussian, run_mcmc_is, summarize_chain, summarize_chains, summarize_is,
    ApproxPosterior, ApproxSettings, FilterKind, IsSettings, McmcSettings, ObsDistribution,
    Prior, StructuralCount, StructuralGaussian,
};

fn simulate_level(n: usize, obs_sd: f64, level_sd: f64, seed: u64) -> (Vec<f64>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut level = 0f64;
    let mut levels = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    for _ in 0..n {
        levels.push(level);
        let eps: f64 = rng.sample(rand_distr::StandardNormal);
        y.push(level + obs_sd * eps);
        let eta: f64 = rng.sample(rand_distr::StandardNormal);
        level += level_sd * eta;
    }
    (y, levels)
}

fn simulate_counts(n: usize, level_sd: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut level = 1f64;
    (0..n)
        .map(|_| {
            let eta: f64 = rng.sample(rand_distr::StandardNormal);
            level += level_sd * eta;
            let lambda = level.exp();
            // Crude Poisson draw, fine for test data.
            let mut k = 0f64;
            let mut p = (-lambda).exp();
            let mut cum = p;
            let u: f64 = rng.random();
            while u > cum && k < 1000f64 {
                k += 1f64;
                p *= lambda / k;
                cum += p;
            }
            k
        })
        .collect()
}

fn half_normal() -> Prior {
    Prior::HalfNormal { sd: 2f64 }
}

#[test]
fn gaussian_pipeline_recovers_noise_scales() {
    let (y, _) = simulate_level(300, 0.5, 0.2, 1);
    let model = StructuralGaussian::local_level(y, half_normal(), half_normal())
        .with_initial(vec![1f64, 1f64]);

    let settings = McmcSettings {
        iterations: 8000,
        burnin: 2000,
        chains: 2,
        seed: 9,
        ..McmcSettings::default()
    };
    let chains = run_mcmc_gaussian(&model, &settings).unwrap();
    let summary = summarize_chains(&chains);

    // Posterior mass around the generating values.
    assert!(summary.parameters[0].lower < 0.5 && 0.5 < summary.parameters[0].upper);
    assert!(summary.parameters[1].lower < 0.2 && 0.2 < summary.parameters[1].upper);
    for chain in &chains {
        assert!(chain.acceptance_rate > 0.1 && chain.acceptance_rate < 0.5);
    }
}

#[test]
fn particle_estimates_agree_with_kalman_through_public_api() {
    let (y, _) = simulate_level(60, 0.5, 0.2, 2);
    let model = StructuralGaussian::local_level(y, half_normal(), half_normal());
    let built = bayes_ssm::GaussianModel::build(&model, &[0.5, 0.2]).unwrap();

    let exact = kalman_filter(&built).unwrap().log_likelihood;

    // ψ proposals are exact for a Gaussian model.
    let approx = gaussian_approx(&built, ApproxSettings::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(4);
    let psi = psi_filter(&built, &approx, 10, &mut rng).unwrap();
    assert_abs_diff_eq!(psi.log_likelihood, exact, epsilon = 1e-6);

    // The bootstrap estimate is noisy but centered.
    let mean: f64 = (0..10)
        .map(|_| {
            bootstrap_filter(&built, 2000, &mut rng)
                .unwrap()
                .log_likelihood
        })
        .sum::<f64>()
        / 10f64;
    assert_abs_diff_eq!(mean, exact, epsilon = 0.5);
}

#[test]
fn poisson_pipeline_with_importance_correction() {
    let y = simulate_counts(80, 0.1, 3);
    let model = StructuralCount::local_level(y, ObsDistribution::Poisson, half_normal());

    let settings = McmcSettings {
        iterations: 1500,
        burnin: 500,
        chains: 2,
        seed: 17,
        ..McmcSettings::default()
    };
    let is_settings = IsSettings {
        kind: FilterKind::Psi,
        particles: 200,
        seed: 17,
        ..IsSettings::default()
    };
    let corrected = run_mcmc_is(&model, &settings, &is_settings).unwrap();
    assert_eq!(corrected.len(), 2);

    let summary = summarize_is(&corrected[0]);
    assert!(summary.parameters[0].mean.is_finite());
    assert!(summary.parameters[0].sd > 0f64);
    // ψ weights are tight for this model; the correction should cost
    // little effective sample size beyond what the run lengths already do.
    let total: f64 = corrected[0].counts.iter().map(|&c| c as f64).sum();
    let sum_sq: f64 = corrected[0].counts.iter().map(|&c| (c as f64) * (c as f64)).sum();
    let counts_only_ess = total * total / sum_sq;
    assert!(summary.ess > 0.8 * counts_only_ess);

    for out in &corrected {
        assert_eq!(out.theta.len(), out.log_weights.len());
        assert_eq!(out.theta.len(), out.trajectories.len());
    }
}

#[test]
fn approximate_and_corrected_summaries_agree_when_weights_are_flat() {
    let y = simulate_counts(60, 0.1, 5);
    let model = StructuralCount::local_level(y, ObsDistribution::Poisson, half_normal());

    let posterior = ApproxPosterior::new(&model, ApproxSettings::default());
    let settings = McmcSettings {
        iterations: 2000,
        burnin: 500,
        ..McmcSettings::default()
    };
    let mut rng = StdRng::seed_from_u64(8);
    let chain = run_chain(&posterior, &settings, &mut rng).unwrap();

    let corrected = is_correction(&model, &chain, &IsSettings::default()).unwrap();

    let approx_summary = summarize_chain(&chain);
    let exact_summary = summarize_is(&corrected);
    assert_abs_diff_eq!(
        approx_summary.parameters[0].mean,
        exact_summary.parameters[0].mean,
        epsilon = 0.05
    );
}
