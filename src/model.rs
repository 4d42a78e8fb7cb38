//! Model definition layer.
//!
//! A state-space model instance is a bundle of system matrices (or
//! functions) produced from a hyperparameter vector θ. The `*Model`
//! traits define the θ → model mapping together with the prior; the
//! built structs (`GaussianSsm`, `NonGaussianSsm`) are what the filters
//! and smoothers consume.
//!
//! Observations are univariate; missing values are encoded as `NaN` and
//! skipped by every filter.

use faer::{Col, Mat};
use statrs::function::gamma::ln_gamma;

use crate::error::SsmError;

pub(crate) const LN_SQRT_2PI: f64 = 0.9189385332046727;

/// Gaussian log-density, used by filters and weight computations.
pub(crate) fn log_normal_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -LN_SQRT_2PI - sd.ln() - 0.5 * z * z
}

fn softplus(x: f64) -> f64 {
    if x > 30f64 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Observation family of a non-Gaussian model, on the scale of the linear
/// predictor s_t = z'α_t (log link for counts, logit link for binomial).
#[derive(Debug, Clone, Copy)]
pub enum ObsDistribution {
    /// y_t ~ Poisson(u_t * exp(s_t))
    Poisson,
    /// y_t ~ Binomial(u_t, logistic(s_t))
    Binomial,
    /// y_t ~ NegativeBinomial with mean u_t * exp(s_t) and dispersion φ.
    NegativeBinomial { dispersion: f64 },
}

impl ObsDistribution {
    fn log_density(&self, y: f64, u: f64, signal: f64) -> f64 {
        match *self {
            ObsDistribution::Poisson => {
                let log_mean = u.ln() + signal;
                y * log_mean - log_mean.exp() - ln_gamma(y + 1f64)
            }
            ObsDistribution::Binomial => {
                let binom = ln_gamma(u + 1f64) - ln_gamma(y + 1f64) - ln_gamma(u - y + 1f64);
                binom + y * signal - u * softplus(signal)
            }
            ObsDistribution::NegativeBinomial { dispersion: phi } => {
                let mean = u * signal.exp();
                ln_gamma(y + phi) - ln_gamma(phi) - ln_gamma(y + 1f64)
                    + phi * (phi.ln() - (phi + mean).ln())
                    + y * (mean.ln() - (phi + mean).ln())
            }
        }
    }

    /// First and second derivatives of the log-density with respect to the
    /// signal, as used by the mode-finding iteration of the Gaussian
    /// approximation.
    fn derivs(&self, y: f64, u: f64, signal: f64) -> (f64, f64) {
        match *self {
            ObsDistribution::Poisson => {
                let mean = u * signal.exp();
                (y - mean, -mean)
            }
            ObsDistribution::Binomial => {
                let p = 1f64 / (1f64 + (-signal).exp());
                (y - u * p, -u * p * (1f64 - p))
            }
            ObsDistribution::NegativeBinomial { dispersion: phi } => {
                let mean = u * signal.exp();
                let d1 = y - (y + phi) * mean / (mean + phi);
                let d2 = -(y + phi) * phi * mean / ((mean + phi) * (mean + phi));
                (d1, d2)
            }
        }
    }
}

/// Common seam over models with linear-Gaussian latent dynamics
///
///   α_{t+1} = T α_t + R η_t,  η_t ~ N(0, I_k),  α_1 ~ N(a1, P1)
///
/// and a univariate observation depending on the signal s_t = z'α_t.
/// The approximation engine, the ψ-APF and the bootstrap filter are all
/// generic over this trait.
pub trait LatentGaussian {
    fn n_obs(&self) -> usize;
    fn state_dim(&self) -> usize;
    fn z(&self) -> &Col<f64>;
    fn t_mat(&self) -> &Mat<f64>;
    fn r_mat(&self) -> &Mat<f64>;
    fn a1(&self) -> &Col<f64>;
    fn p1(&self) -> &Mat<f64>;

    /// Log observation density at time `t` given the signal; `None` when
    /// the observation is missing.
    fn log_obs(&self, t: usize, signal: f64) -> Option<f64>;

    /// First and second derivative of `log_obs` with respect to the signal.
    fn obs_derivs(&self, t: usize, signal: f64) -> Option<(f64, f64)>;

    /// State disturbance covariance Q = R R'.
    fn state_cov(&self) -> Mat<f64> {
        let r = self.r_mat();
        r * r.transpose()
    }
}

fn validate_dynamics(
    n: usize,
    z: &Col<f64>,
    t: &Mat<f64>,
    r: &Mat<f64>,
    a1: &Col<f64>,
    p1: &Mat<f64>,
) -> Result<(), SsmError> {
    let m = z.nrows();
    if n == 0 {
        return Err(SsmError::InvalidModel("empty observation series".into()));
    }
    if t.nrows() != m || t.ncols() != m {
        return Err(SsmError::InvalidModel(format!(
            "transition matrix is {}x{}, expected {m}x{m}",
            t.nrows(),
            t.ncols()
        )));
    }
    if r.nrows() != m {
        return Err(SsmError::InvalidModel(format!(
            "disturbance loading has {} rows, expected {m}",
            r.nrows()
        )));
    }
    if a1.nrows() != m || p1.nrows() != m || p1.ncols() != m {
        return Err(SsmError::InvalidModel(
            "initial distribution dimensions do not match the state".into(),
        ));
    }
    Ok(())
}

/// Univariate linear-Gaussian state-space model.
#[derive(Debug, Clone)]
pub struct GaussianSsm {
    pub y: Vec<f64>,
    pub z: Col<f64>,
    /// Observation noise standard deviations; length 1 (time-invariant)
    /// or one per observation.
    pub h: Vec<f64>,
    pub t: Mat<f64>,
    pub r: Mat<f64>,
    pub a1: Col<f64>,
    pub p1: Mat<f64>,
}

impl GaussianSsm {
    pub fn new(
        y: Vec<f64>,
        z: Col<f64>,
        h: Vec<f64>,
        t: Mat<f64>,
        r: Mat<f64>,
        a1: Col<f64>,
        p1: Mat<f64>,
    ) -> Result<Self, SsmError> {
        validate_dynamics(y.len(), &z, &t, &r, &a1, &p1)?;
        if h.len() != 1 && h.len() != y.len() {
            return Err(SsmError::InvalidModel(format!(
                "{} observation noise values for {} observations",
                h.len(),
                y.len()
            )));
        }
        if h.iter().any(|&v| !(v > 0f64) || !v.is_finite()) {
            return Err(SsmError::InvalidModel(
                "observation noise standard deviations must be positive".into(),
            ));
        }
        Ok(Self { y, z, h, t, r, a1, p1 })
    }

    pub fn obs_sd(&self, t: usize) -> f64 {
        if self.h.len() == 1 {
            self.h[0]
        } else {
            self.h[t]
        }
    }
}

impl LatentGaussian for GaussianSsm {
    fn n_obs(&self) -> usize {
        self.y.len()
    }

    fn state_dim(&self) -> usize {
        self.z.nrows()
    }

    fn z(&self) -> &Col<f64> {
        &self.z
    }

    fn t_mat(&self) -> &Mat<f64> {
        &self.t
    }

    fn r_mat(&self) -> &Mat<f64> {
        &self.r
    }

    fn a1(&self) -> &Col<f64> {
        &self.a1
    }

    fn p1(&self) -> &Mat<f64> {
        &self.p1
    }

    fn log_obs(&self, t: usize, signal: f64) -> Option<f64> {
        let y = self.y[t];
        y.is_finite()
            .then(|| log_normal_pdf(y, signal, self.obs_sd(t)))
    }

    fn obs_derivs(&self, t: usize, signal: f64) -> Option<(f64, f64)> {
        let y = self.y[t];
        if !y.is_finite() {
            return None;
        }
        let var = self.obs_sd(t) * self.obs_sd(t);
        Some(((y - signal) / var, -1f64 / var))
    }
}

/// State-space model with linear-Gaussian latent dynamics and a count
/// observation family.
#[derive(Debug, Clone)]
pub struct NonGaussianSsm {
    pub y: Vec<f64>,
    /// Exposure (Poisson, negative binomial) or number of trials (binomial).
    pub u: Vec<f64>,
    pub distribution: ObsDistribution,
    pub z: Col<f64>,
    pub t: Mat<f64>,
    pub r: Mat<f64>,
    pub a1: Col<f64>,
    pub p1: Mat<f64>,
}

impl NonGaussianSsm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        y: Vec<f64>,
        u: Vec<f64>,
        distribution: ObsDistribution,
        z: Col<f64>,
        t: Mat<f64>,
        r: Mat<f64>,
        a1: Col<f64>,
        p1: Mat<f64>,
    ) -> Result<Self, SsmError> {
        validate_dynamics(y.len(), &z, &t, &r, &a1, &p1)?;
        if u.len() != 1 && u.len() != y.len() {
            return Err(SsmError::InvalidModel(format!(
                "{} exposure values for {} observations",
                u.len(),
                y.len()
            )));
        }
        if u.iter().any(|&v| !(v > 0f64)) {
            return Err(SsmError::InvalidModel("exposures must be positive".into()));
        }
        if let ObsDistribution::NegativeBinomial { dispersion } = distribution {
            if !(dispersion > 0f64) {
                return Err(SsmError::InvalidModel(
                    "negative binomial dispersion must be positive".into(),
                ));
            }
        }
        Ok(Self { y, u, distribution, z, t, r, a1, p1 })
    }

    pub fn exposure(&self, t: usize) -> f64 {
        if self.u.len() == 1 {
            self.u[0]
        } else {
            self.u[t]
        }
    }
}

impl LatentGaussian for NonGaussianSsm {
    fn n_obs(&self) -> usize {
        self.y.len()
    }

    fn state_dim(&self) -> usize {
        self.z.nrows()
    }

    fn z(&self) -> &Col<f64> {
        &self.z
    }

    fn t_mat(&self) -> &Mat<f64> {
        &self.t
    }

    fn r_mat(&self) -> &Mat<f64> {
        &self.r
    }

    fn a1(&self) -> &Col<f64> {
        &self.a1
    }

    fn p1(&self) -> &Mat<f64> {
        &self.p1
    }

    fn log_obs(&self, t: usize, signal: f64) -> Option<f64> {
        let y = self.y[t];
        y.is_finite()
            .then(|| self.distribution.log_density(y, self.exposure(t), signal))
    }

    fn obs_derivs(&self, t: usize, signal: f64) -> Option<(f64, f64)> {
        let y = self.y[t];
        y.is_finite()
            .then(|| self.distribution.derivs(y, self.exposure(t), signal))
    }
}

/// The θ side of a model: prior, dimensionality and a starting point.
pub trait Model: Send + Sync {
    fn npar(&self) -> usize;
    /// Joint log prior density; `-inf` outside the support.
    fn log_prior(&self, theta: &[f64]) -> f64;
    fn initial_theta(&self) -> Vec<f64>;
}

/// Models that build a linear-Gaussian instance for a given θ.
pub trait GaussianModel: Model {
    fn build(&self, theta: &[f64]) -> Result<GaussianSsm, SsmError>;
}

/// Models that build a non-Gaussian instance for a given θ.
pub trait NonGaussianModel: Model {
    fn build(&self, theta: &[f64]) -> Result<NonGaussianSsm, SsmError>;
}

/// Non-linear Gaussian-noise models, defined by θ-dependent transition and
/// observation functions with Jacobians. Consumed by the extended Kalman
/// filter and, without the Jacobians, by the bootstrap filter.
pub trait NonlinearModel: Model {
    fn state_dim(&self) -> usize;
    /// Observations, `NaN` for missing.
    fn observations(&self) -> &[f64];
    fn a1(&self, theta: &[f64]) -> Col<f64>;
    fn p1(&self, theta: &[f64]) -> Mat<f64>;
    fn transition_fn(&self, t: usize, state: &Col<f64>, theta: &[f64]) -> Col<f64>;
    fn transition_jacobian(&self, t: usize, state: &Col<f64>, theta: &[f64]) -> Mat<f64>;
    fn observation_fn(&self, t: usize, state: &Col<f64>, theta: &[f64]) -> f64;
    fn observation_jacobian(&self, t: usize, state: &Col<f64>, theta: &[f64]) -> Col<f64>;
    /// State disturbance covariance at time `t`.
    fn state_cov(&self, t: usize, theta: &[f64]) -> Mat<f64>;
    fn obs_sd(&self, t: usize, theta: &[f64]) -> f64;
}

/// Scalar-diffusion latent-state models
///
///   dx_t = μ(x_t, θ) dt + σ(x_t, θ) dB_t
///
/// observed at unit-spaced times through an arbitrary density. The
/// bootstrap filter discretizes the transition by Euler–Maruyama with
/// 2^level steps per observation interval.
pub trait SdeModel: Model {
    /// Observations, `NaN` for missing.
    fn observations(&self) -> &[f64];
    fn drift(&self, x: f64, theta: &[f64]) -> f64;
    fn diffusion(&self, x: f64, theta: &[f64]) -> f64;
    fn log_obs(&self, t: usize, x: f64, theta: &[f64]) -> Option<f64>;
    /// Mean and standard deviation of the initial state distribution.
    fn initial_distribution(&self, theta: &[f64]) -> (f64, f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn local_level(y: Vec<f64>) -> GaussianSsm {
        let n = y.len();
        GaussianSsm::new(
            y,
            Col::from_fn(1, |_| 1f64),
            vec![0.5; n],
            Mat::from_fn(1, 1, |_, _| 1f64),
            Mat::from_fn(1, 1, |_, _| 0.3),
            Col::zeros(1),
            Mat::from_fn(1, 1, |_, _| 2f64),
        )
        .unwrap()
    }

    #[test]
    fn dimension_validation() {
        let err = GaussianSsm::new(
            vec![1f64, 2f64],
            Col::zeros(2),
            vec![1f64],
            Mat::zeros(1, 1),
            Mat::zeros(2, 1),
            Col::zeros(2),
            Mat::zeros(2, 2),
        );
        assert!(matches!(err, Err(SsmError::InvalidModel(_))));
    }

    #[test]
    fn gaussian_obs_density_and_derivs_agree() {
        let model = local_level(vec![1.2, f64::NAN, -0.4]);
        assert!(model.log_obs(1, 0f64).is_none());
        let (d1, d2) = model.obs_derivs(0, 0.7).unwrap();
        // Finite-difference check of the analytic derivatives.
        let eps = 1e-6;
        let f = |s: f64| model.log_obs(0, s).unwrap();
        let num_d1 = (f(0.7 + eps) - f(0.7 - eps)) / (2f64 * eps);
        let num_d2 = (f(0.7 + eps) - 2f64 * f(0.7) + f(0.7 - eps)) / (eps * eps);
        assert_abs_diff_eq!(d1, num_d1, epsilon = 1e-6);
        assert_abs_diff_eq!(d2, num_d2, epsilon = 1e-4);
    }

    #[test]
    fn poisson_derivs_match_numeric() {
        let distr = ObsDistribution::Poisson;
        let (y, u, s) = (3f64, 2f64, 0.4);
        let (d1, d2) = distr.derivs(y, u, s);
        let eps = 1e-6;
        let f = |s: f64| distr.log_density(y, u, s);
        assert_abs_diff_eq!(d1, (f(s + eps) - f(s - eps)) / (2f64 * eps), epsilon = 1e-5);
        assert_abs_diff_eq!(
            d2,
            (f(s + eps) - 2f64 * f(s) + f(s - eps)) / (eps * eps),
            epsilon = 1e-3
        );
    }

    #[test]
    fn negbin_derivs_match_numeric() {
        let distr = ObsDistribution::NegativeBinomial { dispersion: 1.5 };
        let (y, u, s) = (4f64, 1f64, -0.2);
        let (d1, d2) = distr.derivs(y, u, s);
        let eps = 1e-6;
        let f = |s: f64| distr.log_density(y, u, s);
        assert_abs_diff_eq!(d1, (f(s + eps) - f(s - eps)) / (2f64 * eps), epsilon = 1e-5);
        assert_abs_diff_eq!(
            d2,
            (f(s + eps) - 2f64 * f(s) + f(s - eps)) / (eps * eps),
            epsilon = 1e-3
        );
    }

    #[test]
    fn binomial_density_sums_to_one() {
        let distr = ObsDistribution::Binomial;
        let total: f64 = (0..=5)
            .map(|y| distr.log_density(y as f64, 5f64, 0.3).exp())
            .sum();
        assert_abs_diff_eq!(total, 1f64, epsilon = 1e-10);
    }
}
