//! Bayesian inference for state-space models.
//!
//! The crate covers the full pipeline for univariate time series with
//! latent Gaussian dynamics: exact Kalman filtering and smoothing for
//! linear-Gaussian models, Laplace approximation and particle filtering
//! (bootstrap and ψ-APF) for count-valued and non-linear models, adaptive
//! random-walk Metropolis over the hyperparameters, and an
//! importance-sampling correction that turns approximate chains into
//! exact weighted posterior draws.
//!
//! ```
//! use bayes_ssm::{
//!     run_mcmc_gaussian, summarize_chains, McmcSettings, Prior, StructuralGaussian,
//! };
//!
//! let y = vec![1.2, 0.8, 1.5, 1.1, 0.4, 0.9, 1.3, 0.7];
//! let model = StructuralGaussian::local_level(
//!     y,
//!     Prior::HalfNormal { sd: 2.0 },
//!     Prior::HalfNormal { sd: 2.0 },
//! );
//!
//! let settings = McmcSettings { iterations: 500, burnin: 200, chains: 2, ..Default::default() };
//! let chains = run_mcmc_gaussian(&model, &settings)?;
//! let summary = summarize_chains(&chains);
//! assert!(summary.parameters[0].sd > 0.0);
//! # Ok::<(), anyhow::Error>(())
//! ```

mod approx;
mod bsm;
mod error;
mod is_corr;
mod kalman;
mod linalg;
mod mcmc;
mod model;
mod particle;
mod posterior;
mod prior;
mod psi;
mod run;
mod summary;

pub use approx::{ekf_filter, gaussian_approx, ApproxSettings, EkfOutput, GaussianApprox};
pub use bsm::{StructuralCount, StructuralGaussian};
pub use error::SsmError;
pub use is_corr::{is_correction, is_correction_sde, IsOutput, IsSettings};
pub use kalman::{
    kalman_filter, kalman_smoother, simulate_states, simulation_smoother, KalmanOutput,
    SmootherOutput,
};
pub use mcmc::{run_chain, McmcOutput, McmcSettings};
pub use model::{
    GaussianModel, GaussianSsm, LatentGaussian, Model, NonGaussianModel, NonGaussianSsm,
    NonlinearModel, ObsDistribution, SdeModel,
};
pub use particle::{
    bootstrap_filter, bootstrap_filter_nonlinear, bootstrap_filter_sde, FilterKind,
    ParticleOutput,
};
pub use posterior::{
    ApproxPosterior, EkfPosterior, ExactPosterior, NonlinearParticlePosterior, ParticlePosterior,
    Posterior, SdePosterior,
};
pub use prior::{log_prior, Prior};
pub use psi::psi_filter;
pub use run::{
    run_mcmc, run_mcmc_approx, run_mcmc_ekf, run_mcmc_gaussian, run_mcmc_is,
    run_mcmc_nonlinear_pm, run_mcmc_pm, run_mcmc_sde, run_mcmc_sde_is, run_mcmc_with_progress,
    ChainProgress, ProgressCallback,
};
pub use summary::{
    state_means, summarize_chain, summarize_chains, summarize_is, ParameterSummary,
    PosteriorSummary,
};
