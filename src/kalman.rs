//! Kalman filter, disturbance smoother and simulation smoother for
//! linear-Gaussian models.
//!
//! The filter returns the exact marginal log-likelihood via the
//! prediction error decomposition; the smoother is the Durbin–Koopman
//! backward disturbance recursion, which needs no matrix inversions.

use faer::{Col, Mat};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::SsmError;
use crate::linalg::{cholesky_psd, symmetrize};
use crate::model::{GaussianSsm, LatentGaussian, LN_SQRT_2PI};

/// Floor for the innovation variance; anything below this means the model
/// is numerically degenerate.
const F_MIN: f64 = 1e-12;

/// Output of a full forward filter pass.
#[derive(Debug, Clone)]
pub struct KalmanOutput {
    /// Exact marginal log-likelihood log p(y | θ).
    pub log_likelihood: f64,
    /// One-step-ahead predicted state means a_t = E[α_t | y_{1:t-1}].
    pub predicted_mean: Vec<Col<f64>>,
    /// One-step-ahead predicted state covariances P_t.
    pub predicted_cov: Vec<Mat<f64>>,
    /// Filtered state means E[α_t | y_{1:t}].
    pub filtered_mean: Vec<Col<f64>>,
    /// Filtered state covariances.
    pub filtered_cov: Vec<Mat<f64>>,
    /// Innovations v_t; `NaN` where the observation is missing.
    pub innovations: Vec<f64>,
    /// Innovation variances F_t.
    pub innovation_var: Vec<f64>,
}

/// Output of the backward smoothing pass.
#[derive(Debug, Clone)]
pub struct SmootherOutput {
    /// Smoothed state means E[α_t | y_{1:n}].
    pub smoothed_mean: Vec<Col<f64>>,
    /// Smoothed state covariances Var[α_t | y_{1:n}].
    pub smoothed_cov: Vec<Mat<f64>>,
}

pub fn kalman_filter(model: &GaussianSsm) -> Result<KalmanOutput, SsmError> {
    let n = model.y.len();
    let m = model.state_dim();
    let q = model.state_cov();

    let mut a = model.a1.clone();
    let mut p = model.p1.clone();
    let mut log_likelihood = 0f64;

    let mut predicted_mean = Vec::with_capacity(n);
    let mut predicted_cov = Vec::with_capacity(n);
    let mut filtered_mean = Vec::with_capacity(n);
    let mut filtered_cov = Vec::with_capacity(n);
    let mut innovations = Vec::with_capacity(n);
    let mut innovation_var = Vec::with_capacity(n);

    for t in 0..n {
        predicted_mean.push(a.clone());
        predicted_cov.push(p.clone());

        let y = model.y[t];
        let (att, ptt) = if y.is_finite() {
            let signal: f64 = (0..m).map(|i| model.z[i] * a[i]).sum();
            let v = y - signal;
            let pz = &p * &model.z;
            let h = model.obs_sd(t);
            let f: f64 = (0..m).map(|i| model.z[i] * pz[i]).sum::<f64>() + h * h;
            if !(f > F_MIN) || !f.is_finite() {
                return Err(SsmError::NonFiniteLikelihood { time: t });
            }
            log_likelihood += -LN_SQRT_2PI - 0.5 * f.ln() - 0.5 * v * v / f;
            if !log_likelihood.is_finite() {
                return Err(SsmError::NonFiniteLikelihood { time: t });
            }
            innovations.push(v);
            innovation_var.push(f);

            let att = Col::from_fn(m, |i| a[i] + pz[i] * v / f);
            let mut ptt = Mat::from_fn(m, m, |i, j| p[(i, j)] - pz[i] * pz[j] / f);
            symmetrize(&mut ptt);
            (att, ptt)
        } else {
            innovations.push(f64::NAN);
            innovation_var.push(f64::NAN);
            (a.clone(), p.clone())
        };

        filtered_mean.push(att.clone());
        filtered_cov.push(ptt.clone());

        a = &model.t * &att;
        p = &model.t * &ptt * model.t.transpose() + &q;
        symmetrize(&mut p);
    }

    Ok(KalmanOutput {
        log_likelihood,
        predicted_mean,
        predicted_cov,
        filtered_mean,
        filtered_cov,
        innovations,
        innovation_var,
    })
}

/// Durbin–Koopman disturbance smoother, consuming a forward filter pass.
pub fn kalman_smoother(model: &GaussianSsm, filter: &KalmanOutput) -> SmootherOutput {
    let n = model.y.len();
    let m = model.state_dim();

    let mut r = Col::zeros(m);
    let mut big_n: Mat<f64> = Mat::zeros(m, m);
    let mut smoothed_mean = vec![Col::zeros(m); n];
    let mut smoothed_cov = vec![Mat::zeros(m, m); n];

    for t in (0..n).rev() {
        let a = &filter.predicted_mean[t];
        let p = &filter.predicted_cov[t];
        let v = filter.innovations[t];

        let (r_prev, n_prev) = if v.is_finite() {
            let f = filter.innovation_var[t];
            let pz = p * &model.z;
            let tpz = &model.t * &pz;
            // Kalman gain and companion matrix in smoother timing:
            // K_t = T P_t z / F_t, L_t = T - K_t z'.
            let k = Col::from_fn(m, |i| tpz[i] / f);
            let l = Mat::from_fn(m, m, |i, j| model.t[(i, j)] - k[i] * model.z[j]);
            let ltr = l.transpose() * &r;
            let r_prev = Col::from_fn(m, |i| model.z[i] * v / f + ltr[i]);
            let mut n_prev = l.transpose() * &big_n * &l;
            for i in 0..m {
                for j in 0..m {
                    n_prev[(i, j)] += model.z[i] * model.z[j] / f;
                }
            }
            (r_prev, n_prev)
        } else {
            (model.t.transpose() * &r, model.t.transpose() * &big_n * &model.t)
        };

        let pr = p * &r_prev;
        smoothed_mean[t] = Col::from_fn(m, |i| a[i] + pr[i]);
        let mut cov = p - p * &n_prev * p;
        symmetrize(&mut cov);
        smoothed_cov[t] = cov;

        r = r_prev;
        big_n = n_prev;
    }

    SmootherOutput { smoothed_mean, smoothed_cov }
}

/// Draw one latent trajectory and matching observations from the model.
pub fn simulate_states<R: Rng + ?Sized>(
    model: &GaussianSsm,
    rng: &mut R,
) -> Result<(Vec<Col<f64>>, Vec<f64>), SsmError> {
    let n = model.y.len();
    let m = model.state_dim();
    let k = model.r.ncols();
    let l1 = cholesky_psd(&model.p1)?;

    let std_normal = StandardNormal;
    let draw_col = |len: usize, rng: &mut R| -> Col<f64> {
        Col::from_fn(len, |_| std_normal.sample(rng))
    };

    let xi = draw_col(m, rng);
    let l1xi = &l1 * &xi;
    let mut alpha = Col::from_fn(m, |i| model.a1[i] + l1xi[i]);

    let mut states = Vec::with_capacity(n);
    let mut obs = Vec::with_capacity(n);
    for t in 0..n {
        states.push(alpha.clone());
        let signal: f64 = (0..m).map(|i| model.z[i] * alpha[i]).sum();
        let eps: f64 = std_normal.sample(rng);
        // Keep the missingness pattern of the data.
        if model.y[t].is_finite() {
            obs.push(signal + model.obs_sd(t) * eps);
        } else {
            obs.push(f64::NAN);
        }
        let eta = draw_col(k, rng);
        let reta = &model.r * &eta;
        let talpha = &model.t * &alpha;
        alpha = Col::from_fn(m, |i| talpha[i] + reta[i]);
    }
    Ok((states, obs))
}

/// Mean-correction simulation smoother: one draw from the smoothing
/// distribution p(α_{1:n} | y_{1:n}, θ).
pub fn simulation_smoother<R: Rng + ?Sized>(
    model: &GaussianSsm,
    rng: &mut R,
) -> Result<Vec<Col<f64>>, SsmError> {
    let filter = kalman_filter(model)?;
    let smoothed = kalman_smoother(model, &filter);

    let (plus_states, plus_obs) = simulate_states(model, rng)?;
    let mut plus_model = model.clone();
    plus_model.y = plus_obs;
    let plus_filter = kalman_filter(&plus_model)?;
    let plus_smoothed = kalman_smoother(&plus_model, &plus_filter);

    let m = model.state_dim();
    let draw = (0..model.y.len())
        .map(|t| {
            Col::from_fn(m, |i| {
                smoothed.smoothed_mean[t][i] + plus_states[t][i]
                    - plus_smoothed.smoothed_mean[t][i]
            })
        })
        .collect();
    Ok(draw)
}
