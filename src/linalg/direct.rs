use sprs::CsMat;
use std::time::Instant;

use super::solver::{Solver, SolverStats, SolverUtils};

/// Direct solver: dense LU factorisation through nalgebra
///
/// Meant for the small block systems of verification runs; the matrix is
/// densified on every call.
pub struct DirectSolver {
    name: String,
    /// Relative residual below which the solve counts as converged
    tolerance: f64,
    abs_tolerance: f64,
}

impl DirectSolver {
    pub fn new() -> Self {
        Self {
            name: "Direct (dense LU)".to_string(),
            tolerance: 1e-8,
            abs_tolerance: 1e-14,
        }
    }
}

impl Default for DirectSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for DirectSolver {
    #[allow(non_snake_case)]
    fn solve(&mut self, A: &CsMat<f64>, b: &[f64]) -> (Vec<f64>, SolverStats) {
        let start = Instant::now();
        let n = b.len();

        let mut a_dense = nalgebra::DMatrix::zeros(n, n);
        for (row_idx, row) in A.outer_iterator().enumerate() {
            for (col_idx, &val) in row.iter() {
                a_dense[(row_idx, col_idx)] = val;
            }
        }

        let b_vec = nalgebra::DVector::from_column_slice(b);
        let Some(x_vec) = a_dense.lu().solve(&b_vec) else {
            // singular: report a failed solve, the caller decides
            return (
                vec![0.0; n],
                SolverStats {
                    residual_norm: SolverUtils::norm(b),
                    relative_residual: 1.0,
                    converged: false,
                    solve_time: start.elapsed().as_secs_f64(),
                    ..SolverStats::default()
                },
            );
        };

        let x: Vec<f64> = x_vec.iter().copied().collect();
        let (residual_norm, relative_residual) = SolverUtils::relative_residual(A, &x, b);
        let converged = x.iter().all(|v| v.is_finite())
            && (relative_residual < self.tolerance || residual_norm < self.abs_tolerance);

        let stats = SolverStats {
            iterations: 0,
            residual_norm,
            relative_residual,
            converged,
            solve_time: start.elapsed().as_secs_f64(),
        };
        (x, stats)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn abs_tolerance(&self) -> f64 {
        self.abs_tolerance
    }

    fn set_abs_tolerance(&mut self, tolerance: f64) {
        self.abs_tolerance = tolerance;
    }

    fn tolerance(&self) -> f64 {
        self.tolerance
    }

    fn set_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }
}
