//! Newton convergence check of the coupled system

use serde::{Deserialize, Serialize};

use crate::error::{SstiError, SstiResult};
use crate::fem::Subproblem;
use crate::linalg::SolverUtils;

/// Newton iteration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewtonParams {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// ε_abs for residual norms
    #[serde(default = "default_abs_res")]
    pub abs_tol_res: f64,
    /// ε_rel for residual norms, relative to 1 + ||u_np||
    #[serde(default = "default_rel_res")]
    pub rel_tol_res: f64,
    #[serde(default = "default_abs_inc")]
    pub abs_tol_inc: f64,
    #[serde(default = "default_rel_inc")]
    pub rel_tol_inc: f64,
}

fn default_max_iterations() -> usize { 20 }
fn default_abs_res() -> f64 { 1e-10 }
fn default_rel_res() -> f64 { 1e-8 }
fn default_abs_inc() -> f64 { 1e-10 }
fn default_rel_inc() -> f64 { 1e-8 }

impl Default for NewtonParams {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            abs_tol_res: default_abs_res(),
            rel_tol_res: default_rel_res(),
            abs_tol_inc: default_abs_inc(),
            rel_tol_inc: default_rel_inc(),
        }
    }
}

/// L2 norms of one field at one Newton iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldNorms {
    pub field: Subproblem,
    /// ||r_f||
    pub residual: f64,
    /// ||Δu_f|| of the last increment
    pub increment: f64,
    /// ||u_f_np||
    pub state: f64,
}

impl FieldNorms {
    pub fn compute(field: Subproblem, residual: &[f64], increment: &[f64], state: &[f64]) -> Self {
        Self {
            field,
            residual: SolverUtils::norm(residual),
            increment: SolverUtils::norm(increment),
            state: SolverUtils::norm(state),
        }
    }

    fn is_finite(&self) -> bool {
        self.residual.is_finite() && self.increment.is_finite() && self.state.is_finite()
    }
}

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Converged,
    /// Solve and iterate again
    Continue,
}

/// Absolute/relative residual and increment test with iteration cap
#[derive(Debug, Clone)]
pub struct ConvergenceCheck {
    params: NewtonParams,
}

impl ConvergenceCheck {
    pub fn new(params: NewtonParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NewtonParams {
        &self.params
    }

    fn passes(value: f64, state: f64, abs: f64, rel: f64) -> bool {
        value < abs || value / (1.0 + state) < rel
    }

    /// True if a single field satisfies the residual and increment criteria
    pub fn field_converged(&self, norms: &FieldNorms) -> bool {
        let p = &self.params;
        Self::passes(norms.residual, norms.state, p.abs_tol_res, p.rel_tol_res)
            && Self::passes(norms.increment, norms.state, p.abs_tol_inc, p.rel_tol_inc)
    }

    /// Decide after assembling the residual of iteration `iteration` (1-based)
    ///
    /// On the first iteration no increment exists yet, so convergence means
    /// every residual is below the absolute tolerance. Afterwards every field
    /// has to pass the residual and the increment test. Reaching the
    /// iteration cap without convergence is a `NonConvergence` error.
    pub fn check(&self, iteration: usize, norms: &[FieldNorms]) -> SstiResult<ConvergenceStatus> {
        if let Some(bad) = norms.iter().find(|n| !n.is_finite()) {
            return Err(SstiError::assembly(Some(bad.field), "non-finite norm in convergence check"));
        }

        let converged = if iteration <= 1 {
            norms.iter().all(|n| n.residual < self.params.abs_tol_res)
        } else {
            norms.iter().all(|n| self.field_converged(n))
        };

        if converged {
            Ok(ConvergenceStatus::Converged)
        } else if iteration >= self.params.max_iterations {
            Err(SstiError::NonConvergence {
                step: 0,
                iteration,
                norms: norms.to_vec(),
            })
        } else {
            Ok(ConvergenceStatus::Continue)
        }
    }

    /// Log the convergence table row of one iteration
    pub fn log_iteration(&self, iteration: usize, norms: &[FieldNorms]) {
        let columns: Vec<String> = norms
            .iter()
            .map(|n| format!("{:>9}: |r| {:10.3e} |du| {:10.3e}", n.field.to_string(), n.residual, n.increment))
            .collect();
        log::info!("  newton {:3}/{:<3} {}", iteration, self.params.max_iterations, columns.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norms(residual: f64, increment: f64) -> Vec<FieldNorms> {
        Subproblem::ALL
            .iter()
            .map(|&field| FieldNorms { field, residual, increment, state: 1.0 })
            .collect()
    }

    fn check() -> ConvergenceCheck {
        ConvergenceCheck::new(NewtonParams {
            max_iterations: 5,
            abs_tol_res: 1e-10,
            rel_tol_res: 1e-8,
            abs_tol_inc: 1e-10,
            rel_tol_inc: 1e-8,
        })
    }

    #[test]
    fn test_first_iteration_uses_absolute_residual_only() {
        let c = check();
        assert_eq!(c.check(1, &norms(1e-12, 1.0)).unwrap(), ConvergenceStatus::Converged);
        // relative criterion is not enough without an increment
        assert_eq!(c.check(1, &norms(1e-9, 0.0)).unwrap(), ConvergenceStatus::Continue);
    }

    #[test]
    fn test_relative_criteria() {
        let c = check();
        // 1e-9 / (1 + 1) < 1e-8
        assert_eq!(c.check(2, &norms(1e-9, 1e-9)).unwrap(), ConvergenceStatus::Converged);
        // increment still too large
        assert_eq!(c.check(2, &norms(1e-9, 1e-3)).unwrap(), ConvergenceStatus::Continue);
    }

    #[test]
    fn test_every_field_must_pass() {
        let c = check();
        let mut n = norms(1e-12, 1e-12);
        n[2].residual = 1.0;
        assert_eq!(c.check(3, &n).unwrap(), ConvergenceStatus::Continue);
    }

    #[test]
    fn test_iteration_cap() {
        let c = check();
        let err = c.check(5, &norms(1.0, 1.0)).unwrap_err();
        match err {
            SstiError::NonConvergence { iteration, norms, .. } => {
                assert_eq!(iteration, 5);
                assert_eq!(norms.len(), 3);
            }
            other => panic!("unexpected error {other}"),
        }
        // converging on the last allowed iteration is fine
        assert_eq!(c.check(5, &norms(1e-12, 1e-12)).unwrap(), ConvergenceStatus::Converged);
    }

    #[test]
    fn test_non_finite_norm_is_an_assembly_error() {
        let c = check();
        let mut n = norms(1.0, 1.0);
        n[1].residual = f64::NAN;
        assert!(matches!(c.check(2, &n), Err(SstiError::Assembly { .. })));
    }
}
