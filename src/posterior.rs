//! Log posterior densities fed to the sampler.
//!
//! Each wrapper pairs a model with one likelihood backend: the exact
//! Kalman filter, the Gaussian approximation, the extended Kalman filter,
//! or a particle filter (pseudo-marginal). All of them short-circuit to
//! `-inf` when the prior rejects θ, before any model is built, and map
//! numerical failures at a proposed θ to `-inf` as well so the sampler
//! simply rejects the move.

use rand::Rng;

use crate::approx::{ekf_filter, gaussian_approx, ApproxSettings};
use crate::error::SsmError;
use crate::kalman::kalman_filter;
use crate::model::{GaussianModel, Model, NonGaussianModel, NonlinearModel, SdeModel};
use crate::particle::{
    bootstrap_filter, bootstrap_filter_nonlinear, bootstrap_filter_sde, FilterKind,
};
use crate::psi::psi_filter;

/// Unnormalized log posterior over the hyperparameters. `log_density` may
/// be stochastic (pseudo-marginal); the sampler never re-evaluates it at
/// the current point.
pub trait Posterior: Send + Sync {
    fn dim(&self) -> usize;
    fn initial_theta(&self) -> Vec<f64>;
    /// Log prior plus (exact, approximate or estimated) log-likelihood;
    /// `-inf` means reject.
    fn log_density<R: Rng + ?Sized>(&self, theta: &[f64], rng: &mut R)
        -> Result<f64, SsmError>;
}

/// Numerical failures at a proposed point become rejections; structural
/// errors (bad dimensions, failed factorizations) still abort the run.
fn reject_on_numeric(err: SsmError) -> Result<f64, SsmError> {
    match err {
        SsmError::NonFiniteLikelihood { .. }
        | SsmError::ApproximationFailed { .. }
        | SsmError::ParticleDegeneracy { .. } => Ok(f64::NEG_INFINITY),
        other => Err(other),
    }
}

/// Exact posterior of a linear-Gaussian model via the Kalman filter.
pub struct ExactPosterior<'a, M: GaussianModel> {
    model: &'a M,
}

impl<'a, M: GaussianModel> ExactPosterior<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }
}

impl<M: GaussianModel> Posterior for ExactPosterior<'_, M> {
    fn dim(&self) -> usize {
        self.model.npar()
    }

    fn initial_theta(&self) -> Vec<f64> {
        self.model.initial_theta()
    }

    fn log_density<R: Rng + ?Sized>(
        &self,
        theta: &[f64],
        _rng: &mut R,
    ) -> Result<f64, SsmError> {
        let prior = self.model.log_prior(theta);
        if !prior.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        let built = self.model.build(theta)?;
        match kalman_filter(&built) {
            Ok(out) => Ok(prior + out.log_likelihood),
            Err(err) => reject_on_numeric(err),
        }
    }
}

/// Approximate posterior of a non-Gaussian model: prior plus the Laplace
/// approximation of the marginal likelihood. Deterministic, so the chain
/// it produces targets the approximate posterior and is meant to be
/// re-weighted afterwards.
pub struct ApproxPosterior<'a, M: NonGaussianModel> {
    model: &'a M,
    settings: ApproxSettings,
}

impl<'a, M: NonGaussianModel> ApproxPosterior<'a, M> {
    pub fn new(model: &'a M, settings: ApproxSettings) -> Self {
        Self { model, settings }
    }
}

impl<M: NonGaussianModel> Posterior for ApproxPosterior<'_, M> {
    fn dim(&self) -> usize {
        self.model.npar()
    }

    fn initial_theta(&self) -> Vec<f64> {
        self.model.initial_theta()
    }

    fn log_density<R: Rng + ?Sized>(
        &self,
        theta: &[f64],
        _rng: &mut R,
    ) -> Result<f64, SsmError> {
        let prior = self.model.log_prior(theta);
        if !prior.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        let built = self.model.build(theta)?;
        match gaussian_approx(&built, self.settings) {
            Ok(approx) => Ok(prior + approx.log_likelihood),
            Err(err) => reject_on_numeric(err),
        }
    }
}

/// Approximate posterior of a non-linear model via the extended Kalman
/// filter.
pub struct EkfPosterior<'a, M: NonlinearModel> {
    model: &'a M,
}

impl<'a, M: NonlinearModel> EkfPosterior<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }
}

impl<M: NonlinearModel> Posterior for EkfPosterior<'_, M> {
    fn dim(&self) -> usize {
        self.model.npar()
    }

    fn initial_theta(&self) -> Vec<f64> {
        self.model.initial_theta()
    }

    fn log_density<R: Rng + ?Sized>(
        &self,
        theta: &[f64],
        _rng: &mut R,
    ) -> Result<f64, SsmError> {
        let prior = self.model.log_prior(theta);
        if !prior.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        match ekf_filter(self.model, theta) {
            Ok(out) => Ok(prior + out.log_likelihood),
            Err(err) => reject_on_numeric(err),
        }
    }
}

/// Pseudo-marginal posterior of a non-Gaussian model: prior plus a
/// particle estimate of the log-likelihood, bootstrap or ψ-APF.
pub struct ParticlePosterior<'a, M: NonGaussianModel> {
    model: &'a M,
    kind: FilterKind,
    particles: usize,
    approx_settings: ApproxSettings,
}

impl<'a, M: NonGaussianModel> ParticlePosterior<'a, M> {
    pub fn new(model: &'a M, kind: FilterKind, particles: usize) -> Self {
        Self { model, kind, particles, approx_settings: ApproxSettings::default() }
    }
}

impl<M: NonGaussianModel> Posterior for ParticlePosterior<'_, M> {
    fn dim(&self) -> usize {
        self.model.npar()
    }

    fn initial_theta(&self) -> Vec<f64> {
        self.model.initial_theta()
    }

    fn log_density<R: Rng + ?Sized>(
        &self,
        theta: &[f64],
        rng: &mut R,
    ) -> Result<f64, SsmError> {
        let prior = self.model.log_prior(theta);
        if !prior.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        let built = self.model.build(theta)?;
        let estimate = match self.kind {
            FilterKind::Bootstrap => bootstrap_filter(&built, self.particles, rng),
            FilterKind::Psi => gaussian_approx(&built, self.approx_settings)
                .and_then(|approx| psi_filter(&built, &approx, self.particles, rng)),
        };
        match estimate {
            Ok(out) => Ok(prior + out.log_likelihood),
            Err(err) => reject_on_numeric(err),
        }
    }
}

/// Pseudo-marginal posterior of a non-linear model via the bootstrap
/// filter.
pub struct NonlinearParticlePosterior<'a, M: NonlinearModel> {
    model: &'a M,
    particles: usize,
}

impl<'a, M: NonlinearModel> NonlinearParticlePosterior<'a, M> {
    pub fn new(model: &'a M, particles: usize) -> Self {
        Self { model, particles }
    }
}

impl<M: NonlinearModel> Posterior for NonlinearParticlePosterior<'_, M> {
    fn dim(&self) -> usize {
        self.model.npar()
    }

    fn initial_theta(&self) -> Vec<f64> {
        self.model.initial_theta()
    }

    fn log_density<R: Rng + ?Sized>(
        &self,
        theta: &[f64],
        rng: &mut R,
    ) -> Result<f64, SsmError> {
        let prior = self.model.log_prior(theta);
        if !prior.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        match bootstrap_filter_nonlinear(self.model, theta, self.particles, rng) {
            Ok(out) => Ok(prior + out.log_likelihood),
            Err(err) => reject_on_numeric(err),
        }
    }
}

/// Pseudo-marginal posterior of a diffusion model at a fixed
/// discretization level.
pub struct SdePosterior<'a, M: SdeModel> {
    model: &'a M,
    level: u32,
    particles: usize,
}

impl<'a, M: SdeModel> SdePosterior<'a, M> {
    pub fn new(model: &'a M, level: u32, particles: usize) -> Self {
        Self { model, level, particles }
    }
}

impl<M: SdeModel> Posterior for SdePosterior<'_, M> {
    fn dim(&self) -> usize {
        self.model.npar()
    }

    fn initial_theta(&self) -> Vec<f64> {
        self.model.initial_theta()
    }

    fn log_density<R: Rng + ?Sized>(
        &self,
        theta: &[f64],
        rng: &mut R,
    ) -> Result<f64, SsmError> {
        let prior = self.model.log_prior(theta);
        if !prior.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        match bootstrap_filter_sde(self.model, theta, self.level, self.particles, rng) {
            Ok(out) => Ok(prior + out.log_likelihood),
            Err(err) => reject_on_numeric(err),
        }
    }
}
