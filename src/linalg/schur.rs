//! Schur-complement solve of the damped block normal equations.
//!
//! The point block of the photometric Hessian is diagonal (every residual of
//! a point shares its single log-depth), so it is eliminated explicitly:
//!
//! ```text
//! H_reduced = H_FF - H_FP · H_PP⁻¹ · H_FPᵀ
//! g_reduced = g_F  - H_FP · H_PP⁻¹ · g_P
//! δx_F = solve(H_reduced, -g_reduced)
//! δx_P = -H_PP⁻¹ · (g_P + H_FPᵀ · δx_F)
//! ```
//!
//! The reduced frame system is factored with sparse Cholesky; when damping
//! has not made it positive definite the solver falls back to a QR
//! least-squares solve of the same system.

use super::{LinAlgError, LinAlgResult};
use faer::linalg::solvers::{Solve, SolveLstsqCore};
use faer::sparse::linalg::solvers::{Llt, Qr, SymbolicLlt, SymbolicQr};
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// Solver for the reduced frame system with point back-substitution.
#[derive(Debug, Clone, Default)]
pub struct SchurComplementSolver;

impl SchurComplementSolver {
    pub fn new() -> Self {
        Self
    }

    /// Eliminate the diagonal point block and solve for the frame and point
    /// deltas of `H δ = -g`.
    ///
    /// # Arguments
    ///
    /// * `h_ff` - dense symmetric frame block (already damped)
    /// * `h_fp` - frame-point block, one column per point
    /// * `h_pp` - diagonal of the point block (already damped)
    /// * `g_f`, `g_p` - frame and point gradient
    ///
    /// Returns `(δx_F, δx_P)`.
    pub fn solve(
        &self,
        h_ff: &DMatrix<f64>,
        h_fp: &DMatrix<f64>,
        h_pp: &DVector<f64>,
        g_f: &DVector<f64>,
        g_p: &DVector<f64>,
    ) -> LinAlgResult<(DVector<f64>, DVector<f64>)> {
        let num_frame = h_ff.nrows();
        let num_points = h_pp.len();
        if h_fp.nrows() != num_frame || h_fp.ncols() != num_points {
            return Err(LinAlgError::DimensionMismatch(format!(
                "frame-point block is {}x{}, expected {}x{}",
                h_fp.nrows(),
                h_fp.ncols(),
                num_frame,
                num_points
            )));
        }

        // H_PP⁻¹ is a guarded reciprocation; a point whose residuals carry no
        // image gradient contributes a zero row and gets a zero delta.
        let h_pp_inv = h_pp.map(|d| if d.abs() > f64::EPSILON { 1.0 / d } else { 0.0 });

        // H_FP scaled by H_PP⁻¹ column-wise.
        let mut h_fp_dinv = h_fp.clone();
        for (col, inv) in h_pp_inv.iter().enumerate() {
            h_fp_dinv.column_mut(col).scale_mut(*inv);
        }

        let h_reduced = h_ff - &h_fp_dinv * h_fp.transpose();
        let g_reduced = g_f - &h_fp_dinv * g_p;

        let delta_frame = self.solve_reduced(&h_reduced, &g_reduced)?;

        // Back-substitution for the point deltas.
        let correlation = h_fp.transpose() * &delta_frame;
        let mut delta_point = DVector::zeros(num_points);
        for i in 0..num_points {
            delta_point[i] = -h_pp_inv[i] * (g_p[i] + correlation[i]);
        }

        Ok((delta_frame, delta_point))
    }

    /// Solve `H_reduced δ = -g_reduced` by sparse Cholesky with QR fallback.
    fn solve_reduced(
        &self,
        h_reduced: &DMatrix<f64>,
        g_reduced: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        let n = h_reduced.nrows();

        let mut triplets = Vec::with_capacity(n * n);
        for col in 0..n {
            for row in 0..n {
                let value = h_reduced[(row, col)];
                if value != 0.0 {
                    triplets.push(Triplet::new(row, col, value));
                }
            }
        }
        let matrix = SparseColMat::try_new_from_triplets(n, n, &triplets)
            .map_err(|e| LinAlgError::MatrixConstruction(format!("{e:?}")))?;

        let mut rhs = faer::Mat::zeros(n, 1);
        for i in 0..n {
            rhs[(i, 0)] = -g_reduced[i];
        }

        let solution = match self.solve_with_cholesky(&matrix, &rhs) {
            Ok(solution) => solution,
            Err(err) => {
                debug!("cholesky failed ({err}), falling back to QR");
                self.solve_with_qr(&matrix, &rhs)?
            }
        };

        Ok(DVector::from_fn(n, |i, _| solution[(i, 0)]))
    }

    fn solve_with_cholesky(
        &self,
        matrix: &SparseColMat<usize, f64>,
        rhs: &faer::Mat<f64>,
    ) -> LinAlgResult<faer::Mat<f64>> {
        let sym = SymbolicLlt::try_new(matrix.symbolic(), faer::Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed(format!("symbolic cholesky failed: {e:?}"))
        })?;
        let cholesky =
            Llt::try_new_with_symbolic(sym, matrix.as_ref(), faer::Side::Lower).map_err(|e| {
                LinAlgError::FactorizationFailed(format!("cholesky factorization failed: {e:?}"))
            })?;
        Ok(cholesky.solve(rhs))
    }

    fn solve_with_qr(
        &self,
        matrix: &SparseColMat<usize, f64>,
        rhs: &faer::Mat<f64>,
    ) -> LinAlgResult<faer::Mat<f64>> {
        let sym = SymbolicQr::try_new(matrix.symbolic())
            .map_err(|e| LinAlgError::FactorizationFailed(format!("symbolic qr failed: {e:?}")))?;
        let qr = Qr::try_new_with_symbolic(sym, matrix.as_ref()).map_err(|e| {
            LinAlgError::FactorizationFailed(format!("qr factorization failed: {e:?}"))
        })?;
        let mut solution = rhs.clone();
        qr.solve_lstsq_in_place_with_conj(faer::Conj::No, solution.as_mut());
        Ok(solution)
    }
}
