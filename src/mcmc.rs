//! Adaptive random-walk Metropolis sampler.
//!
//! Proposals are θ' = θ + S u with u standard normal; the lower-triangular
//! scale S adapts by rank-one Cholesky updates toward a fixed acceptance
//! rate (robust adaptive Metropolis). The chain is stored run-length
//! encoded: one entry per accepted value plus the number of iterations it
//! was held, which is also exactly the form the importance-sampling
//! correction consumes.

use faer::{Col, Mat};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::SsmError;
use crate::linalg::chol_rank1;
use crate::posterior::Posterior;

/// Tuning knobs of the sampler. `iterations` counts post-burnin draws;
/// adaptation runs during burnin only.
#[derive(Debug, Clone, Copy)]
pub struct McmcSettings {
    pub iterations: usize,
    pub burnin: usize,
    /// Acceptance rate the scale adaptation targets.
    pub target_accept: f64,
    /// Decay exponent of the adaptation step size, in (1/2, 1].
    pub gamma: f64,
    /// Initial proposal scale, S = initial_scale * I.
    pub initial_scale: f64,
    pub chains: usize,
    pub seed: u64,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            iterations: 5000,
            burnin: 1000,
            target_accept: 0.234,
            gamma: 2f64 / 3f64,
            initial_scale: 0.1,
            chains: 4,
            seed: 0,
        }
    }
}

/// One chain, run-length encoded.
#[derive(Debug, Clone)]
pub struct McmcOutput {
    /// Distinct accepted parameter vectors, in chain order.
    pub theta: Vec<Vec<f64>>,
    /// Iterations each distinct value was held; `counts[i]` pairs with
    /// `theta[i]` and the counts sum to the post-burnin iteration count.
    pub counts: Vec<u32>,
    /// Log posterior density (possibly estimated) at each distinct value.
    pub log_density: Vec<f64>,
    /// Post-burnin acceptance rate.
    pub acceptance_rate: f64,
    /// Final proposal scale factor.
    pub proposal_chol: Mat<f64>,
}

impl McmcOutput {
    /// Total post-burnin iterations represented.
    pub fn len(&self) -> usize {
        self.counts.iter().map(|&c| c as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Expand the run-length encoding into one row per iteration.
    pub fn expand(&self) -> Vec<Vec<f64>> {
        self.theta
            .iter()
            .zip(self.counts.iter())
            .flat_map(|(t, &c)| itertools::repeat_n(t.clone(), c as usize))
            .collect()
    }
}

/// Run a single chain. Multi-chain orchestration and seeding live in the
/// top-level entry points.
pub fn run_chain<P: Posterior, R: Rng + ?Sized>(
    posterior: &P,
    settings: &McmcSettings,
    rng: &mut R,
) -> Result<McmcOutput, SsmError> {
    let d = posterior.dim();
    let mut theta = posterior.initial_theta();
    let mut density = posterior.log_density(&theta, rng)?;
    if !density.is_finite() {
        return Err(SsmError::BadInitialPoint);
    }

    let mut scale: Mat<f64> =
        Mat::from_fn(d, d, |i, j| if i == j { settings.initial_scale } else { 0f64 });

    let mut out = McmcOutput {
        theta: Vec::new(),
        counts: Vec::new(),
        log_density: Vec::new(),
        acceptance_rate: 0f64,
        proposal_chol: scale.clone(),
    };
    let mut accepted = 0usize;

    let total = settings.burnin + settings.iterations;
    for i in 0..total {
        let u = Col::from_fn(d, |_| StandardNormal.sample(rng));
        let su = &scale * &u;
        let proposal: Vec<f64> = theta.iter().zip(0..d).map(|(&t, k)| t + su[k]).collect();

        let proposal_density = posterior.log_density(&proposal, rng)?;
        let log_alpha = (proposal_density - density).min(0f64);
        let alpha = if log_alpha.is_finite() { log_alpha.exp() } else { 0f64 };

        let accept = alpha > 0f64 && rng.random::<f64>() < alpha;
        if accept {
            theta = proposal;
            density = proposal_density;
        }

        if i < settings.burnin {
            adapt_scale(&mut scale, &su, &u, alpha, i + 1, settings);
        } else {
            if accept {
                accepted += 1;
            }
            if accept || out.theta.is_empty() {
                out.theta.push(theta.clone());
                out.counts.push(1);
                out.log_density.push(density);
            } else if let Some(last) = out.counts.last_mut() {
                *last += 1;
            }
        }
    }

    out.acceptance_rate = accepted as f64 / settings.iterations as f64;
    out.proposal_chol = scale;
    Ok(out)
}

/// Rank-one update of the proposal Cholesky factor,
/// S S' <- S S' ± (η |α − α*| / ‖u‖²) (S u)(S u)'.
fn adapt_scale(
    scale: &mut Mat<f64>,
    su: &Col<f64>,
    u: &Col<f64>,
    alpha: f64,
    iteration: usize,
    settings: &McmcSettings,
) {
    let d = scale.nrows();
    let u_norm2: f64 = (0..d).map(|i| u[i] * u[i]).sum();
    if u_norm2 <= 0f64 {
        return;
    }
    let eta = (d as f64 * (iteration as f64).powf(-settings.gamma)).min(1f64);
    let diff = alpha - settings.target_accept;
    let factor = (eta * diff.abs() / u_norm2).sqrt();
    let update = Col::from_fn(d, |i| factor * su[i]);

    // The downdate can lose positive definiteness; commit only on success.
    let mut candidate = scale.clone();
    if chol_rank1(&mut candidate, &update, diff.signum()) {
        *scale = candidate;
    }
}
