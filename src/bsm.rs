//! Basic structural time series models.
//!
//! Level, optional slope and optional dummy-seasonal components assembled
//! into the state-space form the filters consume. The hyperparameters are
//! the disturbance standard deviations, one per component (plus the
//! observation noise for the Gaussian variant), in that order.

use faer::{Col, Mat};

use crate::error::SsmError;
use crate::model::{
    GaussianModel, GaussianSsm, Model, NonGaussianModel, NonGaussianSsm, ObsDistribution,
};
use crate::prior::{log_prior, Prior};

fn validate_period(period: Option<usize>) -> Result<(), SsmError> {
    if let Some(p) = period {
        if p < 2 {
            return Err(SsmError::InvalidModel(format!(
                "seasonal period {p} must be at least 2"
            )));
        }
    }
    Ok(())
}

/// System matrices shared by the Gaussian and count variants. `sds` holds
/// the disturbance standard deviations in component order: level, slope
/// (if present), seasonal (if present).
fn structural_system(
    slope: bool,
    period: Option<usize>,
    sds: &[f64],
) -> (Col<f64>, Mat<f64>, Mat<f64>) {
    let seasonal = period.map_or(0, |p| p - 1);
    let m = 1 + usize::from(slope) + seasonal;
    let k = sds.len();
    let s0 = 1 + usize::from(slope);

    let mut z = Col::zeros(m);
    z[0] = 1f64;
    if seasonal > 0 {
        z[s0] = 1f64;
    }

    let mut t = Mat::zeros(m, m);
    t[(0, 0)] = 1f64;
    if slope {
        t[(0, 1)] = 1f64;
        t[(1, 1)] = 1f64;
    }
    if seasonal > 0 {
        for j in 0..seasonal {
            t[(s0, s0 + j)] = -1f64;
        }
        for j in 1..seasonal {
            t[(s0 + j, s0 + j - 1)] = 1f64;
        }
    }

    let mut r = Mat::zeros(m, k);
    r[(0, 0)] = sds[0];
    if slope {
        r[(1, 1)] = sds[1];
    }
    if seasonal > 0 {
        r[(s0, k - 1)] = sds[k - 1];
    }

    (z, t, r)
}

/// Gaussian structural model; θ = (obs sd, level sd, slope sd?, seasonal sd?).
pub struct StructuralGaussian {
    y: Vec<f64>,
    slope: bool,
    period: Option<usize>,
    priors: Vec<Prior>,
    initial: Vec<f64>,
    initial_variance: f64,
}

impl StructuralGaussian {
    /// Local level model: random-walk level plus observation noise.
    pub fn local_level(y: Vec<f64>, obs_prior: Prior, level_prior: Prior) -> Self {
        Self {
            y,
            slope: false,
            period: None,
            priors: vec![obs_prior, level_prior],
            initial: vec![0.1, 0.1],
            initial_variance: 100f64,
        }
    }

    /// Local linear trend model: level with a random-walk slope.
    pub fn local_trend(
        y: Vec<f64>,
        obs_prior: Prior,
        level_prior: Prior,
        slope_prior: Prior,
    ) -> Self {
        Self {
            y,
            slope: true,
            period: None,
            priors: vec![obs_prior, level_prior, slope_prior],
            initial: vec![0.1; 3],
            initial_variance: 100f64,
        }
    }

    /// Add a dummy-seasonal component with the given period. Periods
    /// below 2 are rejected when the model is built.
    pub fn with_seasonal(mut self, period: usize, prior: Prior) -> Self {
        self.period = Some(period);
        self.priors.push(prior);
        self.initial.push(0.1);
        self
    }

    /// Override the default starting point of the chain.
    pub fn with_initial(mut self, initial: Vec<f64>) -> Self {
        debug_assert_eq!(initial.len(), self.priors.len());
        self.initial = initial;
        self
    }
}

impl Model for StructuralGaussian {
    fn npar(&self) -> usize {
        self.priors.len()
    }

    fn log_prior(&self, theta: &[f64]) -> f64 {
        log_prior(&self.priors, theta)
    }

    fn initial_theta(&self) -> Vec<f64> {
        self.initial.clone()
    }
}

impl GaussianModel for StructuralGaussian {
    fn build(&self, theta: &[f64]) -> Result<GaussianSsm, SsmError> {
        validate_period(self.period)?;
        let (z, t, r) = structural_system(self.slope, self.period, &theta[1..]);
        let m = z.nrows();
        GaussianSsm::new(
            self.y.clone(),
            z,
            vec![theta[0]],
            t,
            r,
            Col::zeros(m),
            Mat::from_fn(m, m, |i, j| {
                if i == j { self.initial_variance } else { 0f64 }
            }),
        )
    }
}

/// Structural model with a count observation family;
/// θ = (level sd, slope sd?, seasonal sd?).
pub struct StructuralCount {
    y: Vec<f64>,
    u: Vec<f64>,
    distribution: ObsDistribution,
    slope: bool,
    period: Option<usize>,
    priors: Vec<Prior>,
    initial: Vec<f64>,
    initial_variance: f64,
}

impl StructuralCount {
    /// Count-valued local level model with unit exposure.
    pub fn local_level(y: Vec<f64>, distribution: ObsDistribution, level_prior: Prior) -> Self {
        let n = y.len();
        Self {
            y,
            u: vec![1f64; n],
            distribution,
            slope: false,
            period: None,
            priors: vec![level_prior],
            initial: vec![0.1],
            initial_variance: 10f64,
        }
    }

    pub fn with_slope(mut self, prior: Prior) -> Self {
        self.slope = true;
        self.priors.push(prior);
        self.initial.push(0.1);
        self
    }

    pub fn with_seasonal(mut self, period: usize, prior: Prior) -> Self {
        self.period = Some(period);
        self.priors.push(prior);
        self.initial.push(0.1);
        self
    }

    /// Exposure (or binomial trial counts), one per observation.
    pub fn with_exposure(mut self, u: Vec<f64>) -> Self {
        debug_assert_eq!(u.len(), self.y.len());
        self.u = u;
        self
    }

    pub fn with_initial(mut self, initial: Vec<f64>) -> Self {
        debug_assert_eq!(initial.len(), self.priors.len());
        self.initial = initial;
        self
    }
}

impl Model for StructuralCount {
    fn npar(&self) -> usize {
        self.priors.len()
    }

    fn log_prior(&self, theta: &[f64]) -> f64 {
        log_prior(&self.priors, theta)
    }

    fn initial_theta(&self) -> Vec<f64> {
        self.initial.clone()
    }
}

impl NonGaussianModel for StructuralCount {
    fn build(&self, theta: &[f64]) -> Result<NonGaussianSsm, SsmError> {
        validate_period(self.period)?;
        // The slope column sits at index 1 only when a slope is present;
        // structural_system reads sds positionally, so pass them as-is.
        let (z, t, r) = structural_system(self.slope, self.period, theta);
        let m = z.nrows();
        NonGaussianSsm::new(
            self.y.clone(),
            self.u.clone(),
            self.distribution,
            z,
            t,
            r,
            Col::zeros(m),
            Mat::from_fn(m, m, |i, j| {
                if i == j { self.initial_variance } else { 0f64 }
            }),
        )
    }
}
