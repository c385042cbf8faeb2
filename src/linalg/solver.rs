use serde::{Deserialize, Serialize};
use sprs::CsMat;

use super::direct::DirectSolver;
use super::iterative::{BiCGSTAB, GMRES};
use super::preconditioner::PreconditionerKind;

/// Statistics from one linear solve
#[derive(Debug, Clone, Default)]
pub struct SolverStats {
    /// Number of iterations (0 for direct solvers)
    pub iterations: usize,

    /// Final residual norm ||b - Ax||
    pub residual_norm: f64,

    /// Relative residual ||b - Ax|| / ||b||
    pub relative_residual: f64,

    pub converged: bool,

    /// Wall time in seconds
    pub solve_time: f64,
}

/// Operator A that can be applied to a vector
pub trait LinearOperator {
    /// out = A * v
    fn apply(&self, v: &[f64]) -> Vec<f64>;

    fn rows(&self) -> usize;

    fn cols(&self) -> usize;
}

impl LinearOperator for CsMat<f64> {
    fn apply(&self, v: &[f64]) -> Vec<f64> {
        self.outer_iterator()
            .map(|row| row.iter().map(|(col, &val)| val * v[col]).sum())
            .collect()
    }

    fn rows(&self) -> usize {
        self.rows()
    }

    fn cols(&self) -> usize {
        self.cols()
    }
}

/// Linear solver for the block system Ax = b
pub trait Solver {
    /// Solve Ax = b
    ///
    /// # Arguments
    /// * `A` - System matrix (n x n)
    /// * `b` - Right-hand side (n)
    ///
    /// # Returns
    /// * Solution x (n) and solve statistics; `stats.converged` tells whether x can be used
    #[allow(non_snake_case)]
    fn solve(&mut self, A: &CsMat<f64>, b: &[f64]) -> (Vec<f64>, SolverStats);

    fn name(&self) -> &str;

    /// Install the block partition of the system (full-map lids per block)
    ///
    /// Only block preconditioners use it.
    fn set_block_partition(&mut self, _blocks: Vec<Vec<usize>>) {}

    fn abs_tolerance(&self) -> f64;
    fn set_abs_tolerance(&mut self, tolerance: f64);

    /// Relative tolerance ||r|| / ||b||
    fn tolerance(&self) -> f64;
    fn set_tolerance(&mut self, tolerance: f64);
}

/// Solver used for the block system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinearSolverKind {
    /// Dense LU, small systems only
    #[default]
    Direct,
    Bicgstab,
    Gmres,
}

impl std::fmt::Display for LinearSolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinearSolverKind::Direct => "direct",
            LinearSolverKind::Bicgstab => "bicgstab",
            LinearSolverKind::Gmres => "gmres",
        };
        f.write_str(name)
    }
}

/// Parameters of the iterative solvers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSolverParams {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_abs_tolerance")]
    pub abs_tolerance: f64,
    /// Krylov space size between GMRES restarts
    #[serde(default = "default_restart")]
    pub restart: usize,
    #[serde(default)]
    pub preconditioner: PreconditionerKind,
}

fn default_max_iterations() -> usize { 1000 }
fn default_tolerance() -> f64 { 1e-10 }
fn default_abs_tolerance() -> f64 { 1e-14 }
fn default_restart() -> usize { 50 }

impl Default for LinearSolverParams {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            abs_tolerance: default_abs_tolerance(),
            restart: default_restart(),
            preconditioner: PreconditionerKind::default(),
        }
    }
}

/// Build the solver selected in the configuration
pub fn build_solver(kind: LinearSolverKind, params: &LinearSolverParams) -> Box<dyn Solver> {
    match kind {
        LinearSolverKind::Direct => {
            let mut solver = DirectSolver::new();
            solver.set_tolerance(params.tolerance);
            Box::new(solver)
        }
        LinearSolverKind::Bicgstab => Box::new(
            BiCGSTAB::new()
                .with_max_iterations(params.max_iterations)
                .with_tolerance(params.tolerance)
                .with_abs_tolerance(params.abs_tolerance)
                .with_preconditioner(params.preconditioner),
        ),
        LinearSolverKind::Gmres => Box::new(
            GMRES::new()
                .with_restart(params.restart)
                .with_max_iterations(params.max_iterations)
                .with_tolerance(params.tolerance)
                .with_abs_tolerance(params.abs_tolerance)
                .with_preconditioner(params.preconditioner),
        ),
    }
}

/// Small dense vector kernels shared by the solvers
pub struct SolverUtils;

impl SolverUtils {
    pub fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    /// L2 norm
    pub fn norm(v: &[f64]) -> f64 {
        Self::dot(v, v).sqrt()
    }

    /// y += alpha * x
    pub fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
        for (yi, xi) in y.iter_mut().zip(x) {
            *yi += alpha * xi;
        }
    }

    /// r = b - Ax
    #[allow(non_snake_case)]
    pub fn compute_residual<O: LinearOperator + ?Sized>(A: &O, x: &[f64], b: &[f64]) -> Vec<f64> {
        let ax = A.apply(x);
        b.iter().zip(&ax).map(|(bi, axi)| bi - axi).collect()
    }

    /// ||b - Ax|| / ||b||, or ||b - Ax|| for a vanishing right-hand side
    #[allow(non_snake_case)]
    pub fn relative_residual<O: LinearOperator + ?Sized>(A: &O, x: &[f64], b: &[f64]) -> (f64, f64) {
        let r_norm = Self::norm(&Self::compute_residual(A, x, b));
        let b_norm = Self::norm(b);
        let relative = if b_norm < 1e-300 { r_norm } else { r_norm / b_norm };
        (r_norm, relative)
    }
}
