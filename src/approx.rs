//! Approximation engine.
//!
//! For non-Gaussian observation families the engine computes a Gaussian
//! approximating model by iterated Kalman smoothing (a Laplace
//! approximation at the smoothing mode), giving pseudo-observations and
//! pseudo-variances plus an approximate marginal log-likelihood. For
//! non-linear models the extended Kalman filter provides the approximate
//! likelihood directly.

use faer::{Col, Mat};

use crate::error::SsmError;
use crate::kalman::{kalman_filter, kalman_smoother};
use crate::linalg::symmetrize;
use crate::model::{
    log_normal_pdf, GaussianSsm, LatentGaussian, NonlinearModel, LN_SQRT_2PI,
};

/// Cap on the curvature of the observation log-density; flatter than this
/// and the pseudo-variance would blow up.
const D2_MAX: f64 = -1e-8;

/// Result of the Laplace / mode-finding approximation.
#[derive(Debug, Clone)]
pub struct GaussianApprox {
    /// The approximating linear-Gaussian model: pseudo-observations ỹ_t
    /// with pseudo noise standard deviations H̃_t, same latent dynamics.
    pub model: GaussianSsm,
    /// Signal ẑ'α̂_t at the smoothing mode.
    pub mode_signal: Vec<f64>,
    /// Smoothed state means at the mode.
    pub mode_state: Vec<Col<f64>>,
    /// Approximate marginal log-likelihood
    /// log p̂(y|θ) = log p_g(ỹ|θ) + Σ_t [log g(y_t|ŝ_t) − log ĝ(ỹ_t|ŝ_t)].
    pub log_likelihood: f64,
    /// Marginal log-likelihood of the approximating Gaussian model alone.
    pub gaussian_log_likelihood: f64,
    pub iterations: usize,
}

/// Settings for the mode-finding iteration.
#[derive(Debug, Clone, Copy)]
pub struct ApproxSettings {
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for ApproxSettings {
    fn default() -> Self {
        Self { max_iter: 100, tol: 1e-8 }
    }
}

/// Compute the Gaussian approximating model of a latent-Gaussian model.
///
/// For a model that is already Gaussian this converges in two iterations
/// with ỹ = y and H̃ = H, and the approximate likelihood equals the exact
/// one.
pub fn gaussian_approx(
    model: &impl LatentGaussian,
    settings: ApproxSettings,
) -> Result<GaussianApprox, SsmError> {
    let n = model.n_obs();
    let m = model.state_dim();

    let mut signal = vec![0f64; n];
    let mut last_change = f64::INFINITY;

    for iter in 0..settings.max_iter {
        let mut pseudo_y = Vec::with_capacity(n);
        let mut pseudo_h = Vec::with_capacity(n);
        for t in 0..n {
            match model.obs_derivs(t, signal[t]) {
                Some((d1, d2)) => {
                    let d2 = d2.min(D2_MAX);
                    pseudo_y.push(signal[t] - d1 / d2);
                    pseudo_h.push((-1f64 / d2).sqrt());
                }
                None => {
                    pseudo_y.push(f64::NAN);
                    pseudo_h.push(1f64);
                }
            }
        }

        let approx = GaussianSsm::new(
            pseudo_y,
            model.z().clone(),
            pseudo_h,
            model.t_mat().clone(),
            model.r_mat().clone(),
            model.a1().clone(),
            model.p1().clone(),
        )?;

        let filter = kalman_filter(&approx)?;
        let smooth = kalman_smoother(&approx, &filter);

        last_change = 0f64;
        for t in 0..n {
            let s: f64 = (0..m).map(|i| model.z()[i] * smooth.smoothed_mean[t][i]).sum();
            last_change = last_change.max((s - signal[t]).abs());
            signal[t] = s;
        }

        if last_change < settings.tol {
            let mut correction = 0f64;
            for t in 0..n {
                if let Some(log_g) = model.log_obs(t, signal[t]) {
                    let log_g_hat =
                        log_normal_pdf(approx.y[t], signal[t], approx.obs_sd(t));
                    correction += log_g - log_g_hat;
                }
            }
            return Ok(GaussianApprox {
                mode_signal: signal,
                mode_state: smooth.smoothed_mean,
                log_likelihood: filter.log_likelihood + correction,
                gaussian_log_likelihood: filter.log_likelihood,
                iterations: iter + 1,
                model: approx,
            });
        }
    }

    Err(SsmError::ApproximationFailed {
        max_iter: settings.max_iter,
        last_change,
    })
}

/// Output of the extended Kalman filter.
#[derive(Debug, Clone)]
pub struct EkfOutput {
    /// Approximate marginal log-likelihood from the linearized model.
    pub log_likelihood: f64,
    pub filtered_mean: Vec<Col<f64>>,
    pub filtered_cov: Vec<Mat<f64>>,
}

/// Extended Kalman filter: first-order linearization of a non-linear
/// model around the filtered means.
pub fn ekf_filter<M: NonlinearModel>(model: &M, theta: &[f64]) -> Result<EkfOutput, SsmError> {
    let y = model.observations();
    let n = y.len();
    let m = model.state_dim();

    let mut a = model.a1(theta);
    let mut p = model.p1(theta);
    let mut log_likelihood = 0f64;
    let mut filtered_mean = Vec::with_capacity(n);
    let mut filtered_cov = Vec::with_capacity(n);

    for (t, &yt) in y.iter().enumerate() {
        let (att, ptt) = if yt.is_finite() {
            let z = model.observation_jacobian(t, &a, theta);
            let v = yt - model.observation_fn(t, &a, theta);
            let pz = &p * &z;
            let h = model.obs_sd(t, theta);
            let f: f64 = (0..m).map(|i| z[i] * pz[i]).sum::<f64>() + h * h;
            if !(f > 0f64) || !f.is_finite() {
                return Err(SsmError::NonFiniteLikelihood { time: t });
            }
            log_likelihood += -LN_SQRT_2PI - 0.5 * f.ln() - 0.5 * v * v / f;
            if !log_likelihood.is_finite() {
                return Err(SsmError::NonFiniteLikelihood { time: t });
            }
            let att = Col::from_fn(m, |i| a[i] + pz[i] * v / f);
            let mut ptt = Mat::from_fn(m, m, |i, j| p[(i, j)] - pz[i] * pz[j] / f);
            symmetrize(&mut ptt);
            (att, ptt)
        } else {
            (a.clone(), p.clone())
        };

        filtered_mean.push(att.clone());
        filtered_cov.push(ptt.clone());

        let tj = model.transition_jacobian(t, &att, theta);
        a = model.transition_fn(t, &att, theta);
        p = &tj * &ptt * tj.transpose() + model.state_cov(t, theta);
        symmetrize(&mut p);
    }

    Ok(EkfOutput { log_likelihood, filtered_mean, filtered_cov })
}
