use thiserror::Error;

/// Failure taxonomy of the inference engine.
///
/// Prior rejections are not errors: posteriors return `-inf` log-density
/// for parameter values outside the prior support, and the sampler treats
/// that as an ordinary rejection. Everything in this enum is a hard
/// failure that aborts the current operation.
#[derive(Error, Debug)]
pub enum SsmError {
    /// Model matrices or data with inconsistent dimensions or invalid values.
    #[error("Invalid model: {0}")]
    InvalidModel(String),
    /// The (exact or estimated) log-likelihood became non-finite.
    #[error("Log-likelihood is not finite at time index {time}")]
    NonFiniteLikelihood { time: usize },
    /// The Gaussian approximation did not converge.
    #[error("Gaussian approximation did not converge in {max_iter} iterations (last change {last_change})")]
    ApproximationFailed { max_iter: usize, last_change: f64 },
    /// All particle weights vanished at some time point.
    #[error("Particle weights all vanished at time index {time}")]
    ParticleDegeneracy { time: usize },
    /// A matrix factorization failed (not positive definite / singular).
    #[error("Linear algebra failure: {0}")]
    Factorization(&'static str),
    /// The sampler could not find a finite starting density.
    #[error("No valid initial parameters: log-density not finite at the initial point")]
    BadInitialPoint,
}
