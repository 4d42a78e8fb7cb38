//! Sequential Monte Carlo engine.
//!
//! The driver `run_filter` is shared between the bootstrap filter and the
//! ψ-APF (see `psi.rs`); kernels provide initial draws, propagation and
//! incremental log-weights. The estimate of log p(y|θ) accumulates the
//! log-mean-weight at every resampling event, which keeps the estimator
//! unbiased on the likelihood scale regardless of when resampling fires.

use faer::{Col, Mat};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::SsmError;
use crate::linalg::cholesky_psd;
use crate::model::{log_normal_pdf, LatentGaussian, NonlinearModel, SdeModel};

/// Proposal strategy of the particle filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterKind {
    /// Propagate from the transition density, weight by the observation
    /// density.
    Bootstrap,
    /// Look-ahead proposals from the Gaussian approximating model.
    #[default]
    Psi,
}

/// Trigger adaptive resampling when ESS drops below this fraction of the
/// particle count.
pub(crate) const ESS_THRESHOLD: f64 = 0.5;

/// Result of one particle filter pass.
#[derive(Debug, Clone)]
pub struct ParticleOutput {
    /// Unbiased estimate of log p(y | θ) (on the likelihood scale).
    pub log_likelihood: f64,
    /// Weighted filtered state means per time step.
    pub filtered_mean: Vec<Col<f64>>,
    /// One latent trajectory drawn from the weighted genealogy.
    pub trajectory: Vec<Col<f64>>,
    /// Smallest effective sample size observed over the pass.
    pub min_ess: f64,
}

/// One SMC proposal/weight scheme.
pub(crate) trait SmcKernel {
    fn n_obs(&self) -> usize;
    fn state_dim(&self) -> usize;
    fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Col<f64>;
    fn propagate<R: Rng + ?Sized>(&self, t: usize, parent: &Col<f64>, rng: &mut R) -> Col<f64>;
    /// Incremental log-weight of a particle at time `t`; 0 for missing
    /// observations.
    fn log_weight(&self, t: usize, state: &Col<f64>) -> f64;
    /// Deterministic constant added to the likelihood estimate.
    fn log_constant(&self) -> f64 {
        0f64
    }
}

pub(crate) fn log_sum_exp(logs: &[f64]) -> f64 {
    let max = logs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return f64::NEG_INFINITY;
    }
    max + logs.iter().map(|&l| (l - max).exp()).sum::<f64>().ln()
}

fn normalized_weights(logw: &[f64]) -> Option<Vec<f64>> {
    let total = log_sum_exp(logw);
    if !total.is_finite() {
        return None;
    }
    Some(logw.iter().map(|&l| (l - total).exp()).collect())
}

fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_sq: f64 = weights.iter().map(|&w| w * w).sum();
    if sum_sq > 0f64 {
        1f64 / sum_sq
    } else {
        0f64
    }
}

/// Systematic resampling: one uniform draw, stratified over a unit-spaced
/// grid. Returns parent indices, nondecreasing.
pub(crate) fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    let step = 1f64 / n as f64;
    let u = rng.random::<f64>() * step;

    let mut indices = Vec::with_capacity(n);
    let mut cumulative = weights[0];
    let mut j = 0;
    for k in 0..n {
        let target = u + k as f64 * step;
        while cumulative < target && j + 1 < n {
            j += 1;
            cumulative += weights[j];
        }
        indices.push(j);
    }
    indices
}

pub(crate) fn run_filter<K: SmcKernel, R: Rng + ?Sized>(
    kernel: &K,
    particles: usize,
    rng: &mut R,
) -> Result<ParticleOutput, SsmError> {
    let n = kernel.n_obs();
    if n == 0 {
        return Err(SsmError::InvalidModel("empty observation series".into()));
    }
    let m = kernel.state_dim();
    let ln_n_particles = (particles as f64).ln();

    let mut states: Vec<Col<f64>> = (0..particles).map(|_| kernel.init(rng)).collect();
    let mut logw = vec![0f64; particles];
    let mut log_likelihood = kernel.log_constant();
    let mut min_ess = particles as f64;

    let mut history: Vec<Vec<Col<f64>>> = Vec::with_capacity(n);
    let mut ancestry: Vec<Vec<usize>> = Vec::with_capacity(n);
    let mut parents: Vec<usize> = (0..particles).collect();
    let mut filtered_mean = Vec::with_capacity(n);

    for t in 0..n {
        if t > 0 {
            states = states
                .iter()
                .map(|s| kernel.propagate(t - 1, s, rng))
                .collect();
        }
        history.push(states.clone());
        ancestry.push(parents.clone());

        for (s, lw) in states.iter().zip(logw.iter_mut()) {
            *lw += kernel.log_weight(t, s);
        }

        let weights =
            normalized_weights(&logw).ok_or(SsmError::ParticleDegeneracy { time: t })?;
        filtered_mean.push(Col::from_fn(m, |i| {
            weights
                .iter()
                .zip(states.iter())
                .map(|(&w, s)| w * s[i])
                .sum()
        }));

        let ess = effective_sample_size(&weights);
        min_ess = min_ess.min(ess);

        if t + 1 == n {
            log_likelihood += log_sum_exp(&logw) - ln_n_particles;
        } else if ess < ESS_THRESHOLD * particles as f64 {
            log_likelihood += log_sum_exp(&logw) - ln_n_particles;
            let indices = systematic_resample(&weights, rng);
            states = indices.iter().map(|&i| states[i].clone()).collect();
            parents = indices;
            logw.iter_mut().for_each(|lw| *lw = 0f64);
        } else {
            parents = (0..particles).collect();
        }
    }

    if !log_likelihood.is_finite() {
        return Err(SsmError::NonFiniteLikelihood { time: n - 1 });
    }

    // Draw one ancestral path from the final weighted particle set.
    let final_weights =
        normalized_weights(&logw).ok_or(SsmError::ParticleDegeneracy { time: n - 1 })?;
    let mut pick = rng.random::<f64>();
    let mut j = particles - 1;
    for (i, &w) in final_weights.iter().enumerate() {
        if pick < w {
            j = i;
            break;
        }
        pick -= w;
    }
    let mut trajectory = vec![Col::zeros(m); n];
    for t in (0..n).rev() {
        trajectory[t] = history[t][j].clone();
        j = ancestry[t][j];
    }

    Ok(ParticleOutput {
        log_likelihood,
        filtered_mean,
        trajectory,
        min_ess,
    })
}

pub(crate) fn standard_normal_col<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Col<f64> {
    Col::from_fn(len, |_| StandardNormal.sample(rng))
}

/// Bootstrap kernel over linear-Gaussian latent dynamics with an
/// arbitrary (Gaussian or count) observation density.
struct LatentKernel<'a, M: LatentGaussian> {
    model: &'a M,
    p1_chol: Mat<f64>,
}

impl<M: LatentGaussian> SmcKernel for LatentKernel<'_, M> {
    fn n_obs(&self) -> usize {
        self.model.n_obs()
    }

    fn state_dim(&self) -> usize {
        self.model.state_dim()
    }

    fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Col<f64> {
        let m = self.model.state_dim();
        let xi = standard_normal_col(m, rng);
        let lxi = &self.p1_chol * &xi;
        Col::from_fn(m, |i| self.model.a1()[i] + lxi[i])
    }

    fn propagate<R: Rng + ?Sized>(&self, _t: usize, parent: &Col<f64>, rng: &mut R) -> Col<f64> {
        let m = self.model.state_dim();
        let eta = standard_normal_col(self.model.r_mat().ncols(), rng);
        let reta = self.model.r_mat() * &eta;
        let tx = self.model.t_mat() * parent;
        Col::from_fn(m, |i| tx[i] + reta[i])
    }

    fn log_weight(&self, t: usize, state: &Col<f64>) -> f64 {
        let signal: f64 = (0..self.model.state_dim())
            .map(|i| self.model.z()[i] * state[i])
            .sum();
        self.model.log_obs(t, signal).unwrap_or(0f64)
    }
}

/// Bootstrap particle filter for latent-Gaussian models. Returns an
/// unbiased estimate of the marginal likelihood and consistent weighted
/// samples of the latent states.
pub fn bootstrap_filter<M: LatentGaussian, R: Rng + ?Sized>(
    model: &M,
    particles: usize,
    rng: &mut R,
) -> Result<ParticleOutput, SsmError> {
    let kernel = LatentKernel {
        model,
        p1_chol: cholesky_psd(model.p1())?,
    };
    run_filter(&kernel, particles, rng)
}

struct NonlinearKernel<'a, M: NonlinearModel> {
    model: &'a M,
    theta: &'a [f64],
    p1_chol: Mat<f64>,
    q_chols: Vec<Mat<f64>>,
}

impl<M: NonlinearModel> SmcKernel for NonlinearKernel<'_, M> {
    fn n_obs(&self) -> usize {
        self.model.observations().len()
    }

    fn state_dim(&self) -> usize {
        self.model.state_dim()
    }

    fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Col<f64> {
        let m = self.model.state_dim();
        let a1 = self.model.a1(self.theta);
        let xi = standard_normal_col(m, rng);
        let lxi = &self.p1_chol * &xi;
        Col::from_fn(m, |i| a1[i] + lxi[i])
    }

    fn propagate<R: Rng + ?Sized>(&self, t: usize, parent: &Col<f64>, rng: &mut R) -> Col<f64> {
        let m = self.model.state_dim();
        let mean = self.model.transition_fn(t, parent, self.theta);
        let eta = standard_normal_col(m, rng);
        let leta = &self.q_chols[t] * &eta;
        Col::from_fn(m, |i| mean[i] + leta[i])
    }

    fn log_weight(&self, t: usize, state: &Col<f64>) -> f64 {
        let y = self.model.observations()[t];
        if !y.is_finite() {
            return 0f64;
        }
        let mean = self.model.observation_fn(t, state, self.theta);
        log_normal_pdf(y, mean, self.model.obs_sd(t, self.theta))
    }
}

/// Bootstrap particle filter for non-linear models.
pub fn bootstrap_filter_nonlinear<M: NonlinearModel, R: Rng + ?Sized>(
    model: &M,
    theta: &[f64],
    particles: usize,
    rng: &mut R,
) -> Result<ParticleOutput, SsmError> {
    let n = model.observations().len();
    let q_chols = (0..n)
        .map(|t| cholesky_psd(&model.state_cov(t, theta)))
        .collect::<Result<Vec<_>, _>>()?;
    let kernel = NonlinearKernel {
        model,
        theta,
        p1_chol: cholesky_psd(&model.p1(theta))?,
        q_chols,
    };
    run_filter(&kernel, particles, rng)
}

struct SdeKernel<'a, M: SdeModel> {
    model: &'a M,
    theta: &'a [f64],
    /// Euler–Maruyama steps per observation interval: 2^level.
    steps: usize,
}

impl<M: SdeModel> SmcKernel for SdeKernel<'_, M> {
    fn n_obs(&self) -> usize {
        self.model.observations().len()
    }

    fn state_dim(&self) -> usize {
        1
    }

    fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Col<f64> {
        let (mean, sd) = self.model.initial_distribution(self.theta);
        let xi: f64 = StandardNormal.sample(rng);
        Col::from_fn(1, |_| mean + sd * xi)
    }

    fn propagate<R: Rng + ?Sized>(&self, _t: usize, parent: &Col<f64>, rng: &mut R) -> Col<f64> {
        let dt = 1f64 / self.steps as f64;
        let sqrt_dt = dt.sqrt();
        let mut x = parent[0];
        for _ in 0..self.steps {
            let dw: f64 = StandardNormal.sample(rng);
            x += self.model.drift(x, self.theta) * dt
                + self.model.diffusion(x, self.theta) * sqrt_dt * dw;
        }
        Col::from_fn(1, |_| x)
    }

    fn log_weight(&self, t: usize, state: &Col<f64>) -> f64 {
        self.model.log_obs(t, state[0], self.theta).unwrap_or(0f64)
    }
}

/// Bootstrap particle filter for diffusion models, discretized by
/// Euler–Maruyama with 2^level steps per observation interval.
pub fn bootstrap_filter_sde<M: SdeModel, R: Rng + ?Sized>(
    model: &M,
    theta: &[f64],
    level: u32,
    particles: usize,
    rng: &mut R,
) -> Result<ParticleOutput, SsmError> {
    let kernel = SdeKernel {
        model,
        theta,
        steps: 1usize << level,
    };
    run_filter(&kernel, particles, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalman::kalman_filter;
    use crate::model::GaussianSsm;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn local_level(y: Vec<f64>) -> GaussianSsm {
        GaussianSsm::new(
            y,
            Col::from_fn(1, |_| 1f64),
            vec![0.8],
            Mat::from_fn(1, 1, |_, _| 1f64),
            Mat::from_fn(1, 1, |_, _| 0.4),
            Col::zeros(1),
            Mat::from_fn(1, 1, |_, _| 4f64),
        )
        .unwrap()
    }

    fn simulate_series(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut level = 0f64;
        (0..n)
            .map(|_| {
                let eta: f64 = StandardNormal.sample(&mut rng);
                let eps: f64 = StandardNormal.sample(&mut rng);
                level += 0.4 * eta;
                level + 0.8 * eps
            })
            .collect()
    }

    #[test]
    fn bootstrap_likelihood_approaches_kalman() {
        let model = local_level(simulate_series(40, 3));
        let exact = kalman_filter(&model).unwrap().log_likelihood;

        let mut rng = StdRng::seed_from_u64(11);
        let estimates: Vec<f64> = (0..20)
            .map(|_| {
                bootstrap_filter(&model, 2000, &mut rng)
                    .unwrap()
                    .log_likelihood
            })
            .collect();
        let mean = estimates.iter().sum::<f64>() / estimates.len() as f64;
        assert_abs_diff_eq!(mean, exact, epsilon = 0.5);
    }

    #[test]
    fn more_particles_reduce_variance() {
        let model = local_level(simulate_series(50, 5));

        let variance_at = |particles: usize| {
            let mut rng = StdRng::seed_from_u64(17);
            let lls: Vec<f64> = (0..30)
                .map(|_| {
                    bootstrap_filter(&model, particles, &mut rng)
                        .unwrap()
                        .log_likelihood
                })
                .collect();
            let mean = lls.iter().sum::<f64>() / lls.len() as f64;
            lls.iter().map(|l| (l - mean) * (l - mean)).sum::<f64>() / (lls.len() - 1) as f64
        };

        assert!(variance_at(1000) < variance_at(50));
    }

    #[test]
    fn filtered_means_track_kalman() {
        let model = local_level(simulate_series(30, 9));
        let exact = kalman_filter(&model).unwrap();
        let mut rng = StdRng::seed_from_u64(23);
        let out = bootstrap_filter(&model, 5000, &mut rng).unwrap();
        for t in 0..30 {
            assert_abs_diff_eq!(
                out.filtered_mean[t][0],
                exact.filtered_mean[t][0],
                epsilon = 0.15
            );
        }
    }

    struct EmptyDiffusion;

    impl crate::model::Model for EmptyDiffusion {
        fn npar(&self) -> usize {
            0
        }
        fn log_prior(&self, _theta: &[f64]) -> f64 {
            0f64
        }
        fn initial_theta(&self) -> Vec<f64> {
            Vec::new()
        }
    }

    impl SdeModel for EmptyDiffusion {
        fn observations(&self) -> &[f64] {
            &[]
        }
        fn drift(&self, _x: f64, _theta: &[f64]) -> f64 {
            0f64
        }
        fn diffusion(&self, _x: f64, _theta: &[f64]) -> f64 {
            1f64
        }
        fn log_obs(&self, _t: usize, _x: f64, _theta: &[f64]) -> Option<f64> {
            None
        }
        fn initial_distribution(&self, _theta: &[f64]) -> (f64, f64) {
            (0f64, 1f64)
        }
    }

    #[test]
    fn empty_observation_series_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = bootstrap_filter_sde(&EmptyDiffusion, &[], 1, 10, &mut rng);
        assert!(matches!(err, Err(SsmError::InvalidModel(_))));
    }

    #[test]
    fn trajectory_has_full_length() {
        let model = local_level(simulate_series(25, 13));
        let mut rng = StdRng::seed_from_u64(29);
        let out = bootstrap_filter(&model, 200, &mut rng).unwrap();
        assert_eq!(out.trajectory.len(), 25);
        assert!(out.trajectory.iter().all(|s| s[0].is_finite()));
    }

    proptest! {
        #[test]
        fn systematic_resampling_matches_expected_counts(
            raw in prop::collection::vec(0.01f64..1f64, 2..50),
            seed in 0u64..1000,
        ) {
            let total: f64 = raw.iter().sum();
            let weights: Vec<f64> = raw.iter().map(|w| w / total).collect();
            let n = weights.len();
            let mut rng = StdRng::seed_from_u64(seed);
            let indices = systematic_resample(&weights, &mut rng);

            prop_assert_eq!(indices.len(), n);
            prop_assert!(indices.windows(2).all(|w| w[0] <= w[1]));
            let mut counts = vec![0usize; n];
            for &i in &indices {
                prop_assert!(i < n);
                counts[i] += 1;
            }
            // Systematic resampling keeps every count within one of its
            // expectation.
            for (c, w) in counts.iter().zip(weights.iter()) {
                prop_assert!((*c as f64 - n as f64 * w).abs() <= 1.0 + 1e-9);
            }
        }
    }
}
