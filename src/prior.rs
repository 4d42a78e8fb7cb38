//! Univariate prior densities over hyperparameters.

use statrs::function::gamma::ln_gamma;

use std::f64::consts::PI;

/// Prior density for a single element of the hyperparameter vector.
///
/// `log_pdf` returns `-inf` outside the support, which the sampler treats
/// as an ordinary rejection.
#[derive(Debug, Clone, Copy)]
pub enum Prior {
    Normal { mean: f64, sd: f64 },
    /// Half-normal on `[0, inf)`, typically for noise standard deviations.
    HalfNormal { sd: f64 },
    Uniform { min: f64, max: f64 },
    Gamma { shape: f64, rate: f64 },
}

impl Prior {
    pub fn log_pdf(&self, x: f64) -> f64 {
        match *self {
            Prior::Normal { mean, sd } => {
                let z = (x - mean) / sd;
                -0.5 * (2f64 * PI).ln() - sd.ln() - 0.5 * z * z
            }
            Prior::HalfNormal { sd } => {
                if x < 0f64 {
                    return f64::NEG_INFINITY;
                }
                let z = x / sd;
                2f64.ln() - 0.5 * (2f64 * PI).ln() - sd.ln() - 0.5 * z * z
            }
            Prior::Uniform { min, max } => {
                if x < min || x > max {
                    f64::NEG_INFINITY
                } else {
                    -(max - min).ln()
                }
            }
            Prior::Gamma { shape, rate } => {
                if x <= 0f64 {
                    return f64::NEG_INFINITY;
                }
                shape * rate.ln() - ln_gamma(shape) + (shape - 1f64) * x.ln() - rate * x
            }
        }
    }
}

/// Sum of independent univariate prior log-densities.
pub fn log_prior(priors: &[Prior], theta: &[f64]) -> f64 {
    debug_assert_eq!(priors.len(), theta.len());
    priors
        .iter()
        .zip(theta.iter())
        .map(|(p, &x)| p.log_pdf(x))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn normal_log_pdf() {
        let p = Prior::Normal { mean: 0f64, sd: 1f64 };
        assert_abs_diff_eq!(p.log_pdf(0f64), -0.9189385332046727, epsilon = 1e-12);
    }

    #[test]
    fn half_normal_support() {
        let p = Prior::HalfNormal { sd: 2f64 };
        assert!(p.log_pdf(-0.1).is_infinite());
        // Twice the normal density on the positive half line.
        let n = Prior::Normal { mean: 0f64, sd: 2f64 };
        assert_abs_diff_eq!(p.log_pdf(1.3), n.log_pdf(1.3) + 2f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn gamma_log_pdf_normalizes_exponential() {
        // Gamma(1, rate) is Exponential(rate).
        let p = Prior::Gamma { shape: 1f64, rate: 0.7 };
        assert_abs_diff_eq!(p.log_pdf(2f64), 0.7f64.ln() - 0.7 * 2f64, epsilon = 1e-12);
    }
}
