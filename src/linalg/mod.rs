pub mod solver;
pub mod direct;
pub mod iterative;
pub mod preconditioner;
pub mod block;
pub mod equilibration;

pub use solver::{build_solver, LinearOperator, LinearSolverKind, LinearSolverParams, Solver, SolverStats, SolverUtils};
pub use direct::DirectSolver;
pub use iterative::{BiCGSTAB, GMRES};
pub use preconditioner::{
    build_preconditioner, BlockJacobiPreconditioner, IdentityPreconditioner, JacobiPreconditioner, Preconditioner,
    PreconditionerKind,
};
pub use block::{BlockSystemMatrix, MatrixState};
pub use equilibration::{Equilibration, EquilibrationMethod, EquilibrationMethods};
