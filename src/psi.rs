//! ψ-auxiliary particle filter.
//!
//! The filter twists the bootstrap dynamics with the backward likelihood
//! of the Gaussian approximating model: log ψ_t(α) = c_t − ½α'Λ_tα + α'λ_t
//! is the exact log of p̂(ỹ_{t:n} | α_t) under the pseudo-model, computed
//! by a backward information recursion. Proposals then draw from the
//! pseudo-model smoothing distribution one step at a time, and the
//! incremental weight collapses to the density ratio g(y_t|s_t)/ĝ(ỹ_t|s_t).
//! When the model is itself Gaussian every weight is one and the estimate
//! equals the exact Kalman log-likelihood with zero variance.

use faer::{Col, Mat};
use rand::Rng;

use crate::approx::GaussianApprox;
use crate::error::SsmError;
use crate::linalg::{cholesky_psd, dot, quad_form, symmetrize, Lu};
use crate::model::{log_normal_pdf, GaussianSsm, LatentGaussian, LN_SQRT_2PI};
use crate::particle::{run_filter, standard_normal_col, ParticleOutput, SmcKernel};

/// Twisted proposal for one transition step: α_{t+1} | α_t, ỹ_{t+1:n} is
/// Gaussian with mean `mean_mat α_t + offset` and covariance `chol chol'`.
struct StepProposal {
    mean_mat: Mat<f64>,
    offset: Col<f64>,
    chol: Mat<f64>,
}

pub(crate) struct PsiKernel<'a, M: LatentGaussian> {
    model: &'a M,
    pseudo: &'a GaussianSsm,
    init_mean: Col<f64>,
    init_chol: Mat<f64>,
    steps: Vec<StepProposal>,
    log_z: f64,
}

impl<'a, M: LatentGaussian> PsiKernel<'a, M> {
    /// Run the backward information recursion over the approximating model
    /// and precompute every proposal.
    pub(crate) fn new(model: &'a M, approx: &'a GaussianApprox) -> Result<Self, SsmError> {
        let pseudo = &approx.model;
        let n = pseudo.y.len();
        let m = pseudo.state_dim();
        let q = pseudo.state_cov();
        let identity = Mat::<f64>::from_fn(m, m, |i, j| if i == j { 1f64 } else { 0f64 });

        let mut lambda_mat: Mat<f64> = Mat::zeros(m, m);
        let mut lambda_vec: Col<f64> = Col::zeros(m);
        let mut c = 0f64;
        let mut steps: Vec<Option<StepProposal>> = (0..n.saturating_sub(1)).map(|_| None).collect();

        for t in (0..n).rev() {
            if t + 1 < n {
                // Marginalize the next state: ν_{t+1}(α) = ∫ N(x; Tα, Q) ψ_{t+1}(x) dx
                // stays log-quadratic with G = (I + Q Λ_{t+1})^{-1}.
                let a = &identity + &q * &lambda_mat;
                let lu = Lu::new(&a)?;
                let g = lu.solve_mat(&identity);
                let gq = &g * &q;
                let offset = &gq * &lambda_vec;

                c += -0.5 * lu.log_det()? + 0.5 * dot(&lambda_vec, &offset);

                let mut sigma = gq;
                symmetrize(&mut sigma);
                steps[t] = Some(StepProposal {
                    mean_mat: &g * &pseudo.t,
                    offset,
                    chol: cholesky_psd(&sigma)?,
                });

                let lam_g = &lambda_mat * &g;
                let mut next = pseudo.t.transpose() * &lam_g * &pseudo.t;
                symmetrize(&mut next);
                lambda_mat = next;
                lambda_vec = pseudo.t.transpose() * (g.transpose() * &lambda_vec);
            }

            let y = pseudo.y[t];
            if y.is_finite() {
                let h2 = pseudo.obs_sd(t) * pseudo.obs_sd(t);
                for i in 0..m {
                    for j in 0..m {
                        lambda_mat[(i, j)] += pseudo.z[i] * pseudo.z[j] / h2;
                    }
                    lambda_vec[i] += pseudo.z[i] * y / h2;
                }
                c += -LN_SQRT_2PI - 0.5 * h2.ln() - 0.5 * y * y / h2;
            }
        }

        // Fold in the initial distribution; the remaining integral is the
        // pseudo-model marginal likelihood p̂(ỹ_{1:n}).
        let a0 = &identity + &pseudo.p1 * &lambda_mat;
        let lu0 = Lu::new(&a0)?;
        let g0 = lu0.solve_mat(&identity);
        let mut sigma0 = &g0 * &pseudo.p1;
        symmetrize(&mut sigma0);
        let g0a1 = &g0 * &pseudo.a1;
        let sig_lam = &sigma0 * &lambda_vec;

        let lam_g0 = &lambda_mat * &g0;
        let log_z = c - 0.5 * lu0.log_det()? - 0.5 * quad_form(&lam_g0, &pseudo.a1)
            + dot(&lambda_vec, &g0a1)
            + 0.5 * dot(&lambda_vec, &sig_lam);

        Ok(Self {
            model,
            pseudo,
            init_mean: Col::from_fn(m, |i| g0a1[i] + sig_lam[i]),
            init_chol: cholesky_psd(&sigma0)?,
            steps: steps.into_iter().map(|s| s.expect("filled above")).collect(),
            log_z,
        })
    }
}

impl<M: LatentGaussian> SmcKernel for PsiKernel<'_, M> {
    fn n_obs(&self) -> usize {
        self.pseudo.y.len()
    }

    fn state_dim(&self) -> usize {
        self.pseudo.state_dim()
    }

    fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Col<f64> {
        let m = self.state_dim();
        let xi = standard_normal_col(m, rng);
        let lxi = &self.init_chol * &xi;
        Col::from_fn(m, |i| self.init_mean[i] + lxi[i])
    }

    fn propagate<R: Rng + ?Sized>(&self, t: usize, parent: &Col<f64>, rng: &mut R) -> Col<f64> {
        let step = &self.steps[t];
        let m = self.state_dim();
        let mean = &step.mean_mat * parent;
        let xi = standard_normal_col(m, rng);
        let lxi = &step.chol * &xi;
        Col::from_fn(m, |i| mean[i] + step.offset[i] + lxi[i])
    }

    fn log_weight(&self, t: usize, state: &Col<f64>) -> f64 {
        let signal: f64 = (0..self.state_dim())
            .map(|i| self.pseudo.z[i] * state[i])
            .sum();
        match self.model.log_obs(t, signal) {
            Some(log_g) => {
                log_g - log_normal_pdf(self.pseudo.y[t], signal, self.pseudo.obs_sd(t))
            }
            None => 0f64,
        }
    }

    fn log_constant(&self) -> f64 {
        self.log_z
    }
}

/// ψ-APF pass over a latent-Gaussian model, given its Gaussian
/// approximation. Returns an unbiased estimate of log p(y | θ).
pub fn psi_filter<M: LatentGaussian, R: Rng + ?Sized>(
    model: &M,
    approx: &GaussianApprox,
    particles: usize,
    rng: &mut R,
) -> Result<ParticleOutput, SsmError> {
    let kernel = PsiKernel::new(model, approx)?;
    run_filter(&kernel, particles, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::{gaussian_approx, ApproxSettings};
    use crate::kalman::kalman_filter;
    use crate::model::{GaussianSsm, NonGaussianSsm, ObsDistribution};
    use crate::particle::bootstrap_filter;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gaussian_model() -> GaussianSsm {
        GaussianSsm::new(
            vec![0.4, 1.1, 0.7, f64::NAN, 0.9, -0.3, 0.2, 1.5],
            Col::from_fn(1, |_| 1f64),
            vec![0.6],
            Mat::from_fn(1, 1, |_, _| 0.9),
            Mat::from_fn(1, 1, |_, _| 0.3),
            Col::zeros(1),
            Mat::from_fn(1, 1, |_, _| 2f64),
        )
        .unwrap()
    }

    fn poisson_model() -> NonGaussianSsm {
        let y = vec![2f64, 4f64, 3f64, 6f64, 5f64, 4f64, 7f64, 3f64, 2f64, 5f64];
        let n = y.len();
        NonGaussianSsm::new(
            y,
            vec![1f64; n],
            ObsDistribution::Poisson,
            Col::from_fn(1, |_| 1f64),
            Mat::from_fn(1, 1, |_, _| 1f64),
            Mat::from_fn(1, 1, |_, _| 0.15),
            Col::from_fn(1, |_| 1f64),
            Mat::from_fn(1, 1, |_, _| 1f64),
        )
        .unwrap()
    }

    #[test]
    fn normalizer_equals_pseudo_model_likelihood() {
        let model = poisson_model();
        let approx = gaussian_approx(&model, ApproxSettings::default()).unwrap();
        let kernel = PsiKernel::new(&model, &approx).unwrap();
        let pseudo_ll = kalman_filter(&approx.model).unwrap().log_likelihood;
        assert_abs_diff_eq!(kernel.log_constant(), pseudo_ll, epsilon = 1e-8);
    }

    #[test]
    fn exact_and_deterministic_for_gaussian_models() {
        let model = gaussian_model();
        let exact = kalman_filter(&model).unwrap().log_likelihood;
        let approx = gaussian_approx(&model, ApproxSettings::default()).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..5 {
            // Every particle carries weight one, so even 3 particles give
            // the exact likelihood with zero variance.
            let out = psi_filter(&model, &approx, 3, &mut rng).unwrap();
            assert_abs_diff_eq!(out.log_likelihood, exact, epsilon = 1e-6);
        }
    }

    #[test]
    fn agrees_with_bootstrap_on_poisson() {
        let model = poisson_model();
        let approx = gaussian_approx(&model, ApproxSettings::default()).unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        let psi_mean: f64 = (0..20)
            .map(|_| {
                psi_filter(&model, &approx, 500, &mut rng)
                    .unwrap()
                    .log_likelihood
            })
            .sum::<f64>()
            / 20f64;
        let boot_mean: f64 = (0..20)
            .map(|_| {
                bootstrap_filter(&model, 2000, &mut rng)
                    .unwrap()
                    .log_likelihood
            })
            .sum::<f64>()
            / 20f64;
        assert_abs_diff_eq!(psi_mean, boot_mean, epsilon = 0.3);
    }

    #[test]
    fn lower_variance_than_bootstrap() {
        let model = poisson_model();
        let approx = gaussian_approx(&model, ApproxSettings::default()).unwrap();

        let variance = |estimates: &[f64]| {
            let mean = estimates.iter().sum::<f64>() / estimates.len() as f64;
            estimates.iter().map(|l| (l - mean) * (l - mean)).sum::<f64>()
                / (estimates.len() - 1) as f64
        };

        let mut rng = StdRng::seed_from_u64(7);
        let psi: Vec<f64> = (0..30)
            .map(|_| {
                psi_filter(&model, &approx, 200, &mut rng)
                    .unwrap()
                    .log_likelihood
            })
            .collect();
        let boot: Vec<f64> = (0..30)
            .map(|_| {
                bootstrap_filter(&model, 200, &mut rng)
                    .unwrap()
                    .log_likelihood
            })
            .collect();
        assert!(variance(&psi) < variance(&boot));
    }
}
