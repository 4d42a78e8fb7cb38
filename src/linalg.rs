//! Small dense helpers on faer types.
//!
//! State dimensions in this crate are tiny (a structural model with a
//! yearly seasonal has 13 states), so the factorizations here are plain
//! loops over `faer::Mat` storage rather than calls into blocked kernels.

use faer::{Col, Mat};

use crate::error::SsmError;

/// Relative pivot tolerance below which a Cholesky pivot is treated as zero.
const PSD_TOL: f64 = 1e-10;

/// Lower Cholesky factor of a symmetric positive semi-definite matrix.
///
/// Columns with a (relatively) zero pivot are set to zero instead of
/// failing, so singular state covariances (e.g. `R R'` with fewer
/// disturbances than states) factor cleanly. A pivot that is negative
/// beyond tolerance is an error.
pub(crate) fn cholesky_psd(a: &Mat<f64>) -> Result<Mat<f64>, SsmError> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols());
    let scale = (0..n).map(|i| a[(i, i)].abs()).fold(1f64, f64::max);
    let tol = PSD_TOL * scale;

    let mut l = Mat::zeros(n, n);
    for j in 0..n {
        let mut d = a[(j, j)];
        for k in 0..j {
            d -= l[(j, k)] * l[(j, k)];
        }
        if d <= tol {
            if d < -tol {
                return Err(SsmError::Factorization(
                    "matrix is not positive semi-definite",
                ));
            }
            // Zero pivot: leave the column at zero.
            continue;
        }
        let d = d.sqrt();
        l[(j, j)] = d;
        for i in (j + 1)..n {
            let mut s = a[(i, j)];
            for k in 0..j {
                s -= l[(i, k)] * l[(j, k)];
            }
            l[(i, j)] = s / d;
        }
    }
    Ok(l)
}

/// LU factorization with partial pivoting of a small square matrix.
pub(crate) struct Lu {
    lu: Mat<f64>,
    perm: Vec<usize>,
    swaps: usize,
}

impl Lu {
    pub(crate) fn new(a: &Mat<f64>) -> Result<Self, SsmError> {
        let n = a.nrows();
        debug_assert_eq!(n, a.ncols());
        let mut lu = a.clone();
        let mut perm: Vec<usize> = (0..n).collect();
        let mut swaps = 0;

        for k in 0..n {
            let mut p = k;
            let mut max = lu[(k, k)].abs();
            for i in (k + 1)..n {
                if lu[(i, k)].abs() > max {
                    max = lu[(i, k)].abs();
                    p = i;
                }
            }
            if !(max > 0f64) || !max.is_finite() {
                return Err(SsmError::Factorization(
                    "singular matrix in LU factorization",
                ));
            }
            if p != k {
                for j in 0..n {
                    let tmp = lu[(k, j)];
                    lu[(k, j)] = lu[(p, j)];
                    lu[(p, j)] = tmp;
                }
                perm.swap(k, p);
                swaps += 1;
            }
            let pivot = lu[(k, k)];
            for i in (k + 1)..n {
                let factor = lu[(i, k)] / pivot;
                lu[(i, k)] = factor;
                for j in (k + 1)..n {
                    lu[(i, j)] -= factor * lu[(k, j)];
                }
            }
        }
        Ok(Self { lu, perm, swaps })
    }

    fn solve_into(&self, b: &mut [f64]) {
        let n = self.lu.nrows();
        let permuted: Vec<f64> = self.perm.iter().map(|&i| b[i]).collect();
        b.copy_from_slice(&permuted);
        for i in 1..n {
            for k in 0..i {
                b[i] -= self.lu[(i, k)] * b[k];
            }
        }
        for i in (0..n).rev() {
            for k in (i + 1)..n {
                b[i] -= self.lu[(i, k)] * b[k];
            }
            b[i] /= self.lu[(i, i)];
        }
    }

    pub(crate) fn solve_col(&self, b: &Col<f64>) -> Col<f64> {
        let n = self.lu.nrows();
        let mut x: Vec<f64> = (0..n).map(|i| b[i]).collect();
        self.solve_into(&mut x);
        Col::from_fn(n, |i| x[i])
    }

    pub(crate) fn solve_mat(&self, b: &Mat<f64>) -> Mat<f64> {
        let n = self.lu.nrows();
        let mut out = Mat::zeros(n, b.ncols());
        let mut col = vec![0f64; n];
        for j in 0..b.ncols() {
            for (i, v) in col.iter_mut().enumerate() {
                *v = b[(i, j)];
            }
            self.solve_into(&mut col);
            for i in 0..n {
                out[(i, j)] = col[i];
            }
        }
        out
    }

    /// Log-determinant; fails when the determinant is not positive.
    ///
    /// The matrices factored here are of the form `I + Q Λ` with `Q`, `Λ`
    /// PSD, whose determinant is always >= 1 in exact arithmetic.
    pub(crate) fn log_det(&self) -> Result<f64, SsmError> {
        let n = self.lu.nrows();
        let mut log_det = 0f64;
        let mut sign = if self.swaps % 2 == 0 { 1f64 } else { -1f64 };
        for i in 0..n {
            let d = self.lu[(i, i)];
            sign *= d.signum();
            log_det += d.abs().ln();
        }
        if sign <= 0f64 || !log_det.is_finite() {
            return Err(SsmError::Factorization("non-positive determinant"));
        }
        Ok(log_det)
    }
}

/// Rank-one update (`sign = 1`) or downdate (`sign = -1`) of a lower
/// Cholesky factor: `L L' <- L L' + sign * x x'`.
///
/// Returns `false` when a downdate would destroy positive definiteness;
/// the factor is left partially modified then, so callers work on a copy
/// and commit on success.
pub(crate) fn chol_rank1(l: &mut Mat<f64>, x: &Col<f64>, sign: f64) -> bool {
    let n = l.nrows();
    let mut work: Vec<f64> = (0..n).map(|i| x[i]).collect();
    for k in 0..n {
        let lkk = l[(k, k)];
        let r2 = lkk * lkk + sign * work[k] * work[k];
        if r2 <= 0f64 || !r2.is_finite() {
            return false;
        }
        let r = r2.sqrt();
        let c = r / lkk;
        let s = work[k] / lkk;
        l[(k, k)] = r;
        for i in (k + 1)..n {
            l[(i, k)] = (l[(i, k)] + sign * s * work[i]) / c;
            work[i] = c * work[i] - s * l[(i, k)];
        }
    }
    true
}

/// `x' A x` for square `A`.
pub(crate) fn quad_form(a: &Mat<f64>, x: &Col<f64>) -> f64 {
    let n = a.nrows();
    let mut acc = 0f64;
    for i in 0..n {
        let mut row = 0f64;
        for j in 0..n {
            row += a[(i, j)] * x[j];
        }
        acc += x[i] * row;
    }
    acc
}

pub(crate) fn dot(a: &Col<f64>, b: &Col<f64>) -> f64 {
    debug_assert_eq!(a.nrows(), b.nrows());
    (0..a.nrows()).map(|i| a[i] * b[i]).sum()
}

/// Overwrite `a` with `(a + a') / 2`.
pub(crate) fn symmetrize(a: &mut Mat<f64>) {
    let n = a.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let v = 0.5 * (a[(i, j)] + a[(j, i)]);
            a[(i, j)] = v;
            a[(j, i)] = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn spd3() -> Mat<f64> {
        // A = B B' + I for a fixed B, guaranteed SPD.
        let b = Mat::from_fn(3, 3, |i, j| ((i * 3 + j) as f64 * 0.31).sin());
        let mut a = &b * b.transpose();
        for i in 0..3 {
            a[(i, i)] += 1f64;
        }
        a
    }

    #[test]
    fn cholesky_reconstructs() {
        let a = spd3();
        let l = cholesky_psd(&a).unwrap();
        let back = &l * l.transpose();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(back[(i, j)], a[(i, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn cholesky_handles_singular() {
        // Rank-one PSD matrix.
        let v = Col::from_fn(3, |i| (i as f64) + 1f64);
        let a = Mat::from_fn(3, 3, |i, j| v[i] * v[j]);
        let l = cholesky_psd(&a).unwrap();
        let back = &l * l.transpose();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(back[(i, j)], a[(i, j)], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn lu_solves_and_dets() {
        let a = spd3();
        let lu = Lu::new(&a).unwrap();
        let b = Col::from_fn(3, |i| (i as f64) - 1.5);
        let x = lu.solve_col(&b);
        for i in 0..3 {
            let mut ax = 0f64;
            for j in 0..3 {
                ax += a[(i, j)] * x[j];
            }
            assert_abs_diff_eq!(ax, b[i], epsilon = 1e-10);
        }

        // log det against the Cholesky factor.
        let l = cholesky_psd(&a).unwrap();
        let chol_logdet: f64 = (0..3).map(|i| 2f64 * l[(i, i)].ln()).sum();
        assert_abs_diff_eq!(lu.log_det().unwrap(), chol_logdet, epsilon = 1e-10);
    }

    #[test]
    fn rank1_update_matches_direct() {
        let a = spd3();
        let mut l = cholesky_psd(&a).unwrap();
        let x = Col::from_fn(3, |i| 0.3 * (i as f64) - 0.2);
        assert!(chol_rank1(&mut l, &x, 1f64));

        let mut direct = a;
        for i in 0..3 {
            for j in 0..3 {
                direct[(i, j)] += x[i] * x[j];
            }
        }
        let expected = cholesky_psd(&direct).unwrap();
        for i in 0..3 {
            for j in 0..=i {
                assert_abs_diff_eq!(l[(i, j)], expected[(i, j)], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn rank1_downdate_roundtrips() {
        let a = spd3();
        let l0 = cholesky_psd(&a).unwrap();
        let mut l = l0.clone();
        let x = Col::from_fn(3, |i| 0.1 * (i as f64 + 1f64));
        assert!(chol_rank1(&mut l, &x, 1f64));
        assert!(chol_rank1(&mut l, &x, -1f64));
        for i in 0..3 {
            for j in 0..=i {
                assert_abs_diff_eq!(l[(i, j)], l0[(i, j)], epsilon = 1e-9);
            }
        }
    }
}
