//! Error kinds of the monolithic SSTI core
//!
//! Every fallible setup and per-step operation returns [`SstiResult`]. Errors
//! coming out of field integrators or the discretization are propagated
//! unchanged; the only recovery edge is Newton non-convergence, which the
//! driver may answer with a time step reduction.

use thiserror::Error;

use crate::fem::Subproblem;
use crate::monolithic::FieldNorms;

/// Result type used throughout the crate
pub type SstiResult<T> = Result<T, SstiError>;

/// Fatal error of the coupled solver
///
/// `Display` renders a single diagnostic line carrying step, iteration,
/// field and offending gid where they are known.
#[derive(Debug, Error)]
pub enum SstiError {
    /// Inconsistent option combination or invalid parameter, detected at setup
    #[error("configuration error: {0}")]
    Config(String),

    /// A mesh-tying slave dof also carries a structural Dirichlet condition
    #[error(
        "Inconsistency in structure Dirichlet conditions and Mortar symmetry conditions: \
         slave node {node} (dof {dof}) on interface {interface} is Dirichlet constrained"
    )]
    MeshtyingConflict {
        node: usize,
        dof: usize,
        interface: usize,
    },

    /// Missing state, empty map, non-finite entries or an inconsistent map at assembly time
    #[error("assembly error [step {step}, iter {iteration}, field {}]: {reason}{}", fmt_field(.field), fmt_gid(.gid))]
    Assembly {
        step: usize,
        iteration: usize,
        field: Option<Subproblem>,
        reason: String,
        gid: Option<usize>,
    },

    /// The linear solver did not converge on the block system
    #[error(
        "linear solver '{solver}' failed [step {step}, iter {iteration}]: ||r|| = {residual_norm:.3e}, block residual norms [{}]",
        fmt_values(.block_norms)
    )]
    LinearSolve {
        step: usize,
        iteration: usize,
        solver: String,
        residual_norm: f64,
        block_norms: Vec<f64>,
    },

    /// Newton iteration cap reached without convergence
    #[error(
        "Newton-Raphson did not converge [step {step}, iter {iteration}]: {}",
        fmt_norms(.norms)
    )]
    NonConvergence {
        step: usize,
        iteration: usize,
        norms: Vec<FieldNorms>,
    },

    /// Restart data does not match the current discretization
    #[error("restart inconsistency: {0}")]
    Restart(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

impl SstiError {
    /// Assembly error without step context (filled in by the driver)
    pub fn assembly(field: Option<Subproblem>, reason: impl Into<String>) -> Self {
        SstiError::Assembly {
            step: 0,
            iteration: 0,
            field,
            reason: reason.into(),
            gid: None,
        }
    }

    /// Assembly error naming an offending global dof id
    pub fn assembly_at_gid(field: Option<Subproblem>, gid: usize, reason: impl Into<String>) -> Self {
        SstiError::Assembly {
            step: 0,
            iteration: 0,
            field,
            reason: reason.into(),
            gid: Some(gid),
        }
    }

    /// Attach step and Newton iteration to errors raised below the driver
    pub fn with_context(self, at_step: usize, at_iteration: usize) -> Self {
        match self {
            SstiError::Assembly { field, reason, gid, .. } => SstiError::Assembly {
                step: at_step,
                iteration: at_iteration,
                field,
                reason,
                gid,
            },
            SstiError::LinearSolve { solver, residual_norm, block_norms, .. } => SstiError::LinearSolve {
                step: at_step,
                iteration: at_iteration,
                solver,
                residual_norm,
                block_norms,
            },
            SstiError::NonConvergence { norms, .. } => SstiError::NonConvergence {
                step: at_step,
                iteration: at_iteration,
                norms,
            },
            other => other,
        }
    }

    /// Process exit code of the CLI wrapper
    ///
    /// 0 is reserved for normal completion.
    pub fn exit_code(&self) -> i32 {
        match self {
            SstiError::NonConvergence { .. } => 1,
            SstiError::LinearSolve { .. } => 2,
            SstiError::Restart(_) => 3,
            SstiError::Config(_) | SstiError::MeshtyingConflict { .. } | SstiError::Parse(_) => 4,
            SstiError::Assembly { .. } | SstiError::Io(_) => 1,
        }
    }

    /// True for the only recoverable kind (Newton non-convergence)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SstiError::NonConvergence { .. })
    }
}

fn fmt_field(field: &Option<Subproblem>) -> String {
    match field {
        Some(f) => f.to_string(),
        None => "-".to_string(),
    }
}

fn fmt_gid(gid: &Option<usize>) -> String {
    match gid {
        Some(g) => format!(" (gid {})", g),
        None => String::new(),
    }
}

fn fmt_values(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{:.3e}", v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_norms(norms: &[FieldNorms]) -> String {
    norms
        .iter()
        .map(|n| {
            format!(
                "{}: ||r|| = {:.3e}, ||du|| = {:.3e}, ||u|| = {:.3e}",
                n.field, n.residual, n.increment, n.state
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SstiError::Config("x".into()).exit_code(), 4);
        assert_eq!(SstiError::Restart("x".into()).exit_code(), 3);
        let err = SstiError::NonConvergence { step: 1, iteration: 20, norms: vec![] };
        assert_eq!(err.exit_code(), 1);
        assert!(err.is_recoverable());
        let err = SstiError::LinearSolve {
            step: 1,
            iteration: 1,
            solver: "BiCGSTAB".into(),
            residual_norm: 1.0,
            block_norms: vec![1.0, 2.0],
        };
        assert_eq!(err.exit_code(), 2);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_meshtying_conflict_message() {
        let err = SstiError::MeshtyingConflict { node: 42, dof: 126, interface: 0 };
        let msg = err.to_string();
        assert!(msg.contains("Inconsistency in structure Dirichlet conditions and Mortar symmetry conditions"));
        assert!(msg.contains("42"));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_context_is_attached() {
        let err = SstiError::assembly_at_gid(Some(Subproblem::Thermo), 7, "non-finite residual entry")
            .with_context(3, 2);
        let msg = err.to_string();
        assert!(msg.contains("step 3"));
        assert!(msg.contains("iter 2"));
        assert!(msg.contains("thermo"));
        assert!(msg.contains("gid 7"));
        assert_eq!(msg.lines().count(), 1);
    }

    #[test]
    fn test_non_convergence_lists_norms() {
        let err = SstiError::NonConvergence {
            step: 4,
            iteration: 20,
            norms: vec![
                FieldNorms { field: Subproblem::Structure, residual: 1.0, increment: 0.5, state: 2.0 },
                FieldNorms { field: Subproblem::ScalarTransport, residual: 3.0, increment: 0.1, state: 1.0 },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("structure"));
        assert!(msg.contains("scatra"));
        assert!(msg.contains("1.000e0"));
    }
}
