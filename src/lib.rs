pub mod error;
pub mod fem;
pub mod coupling;
pub mod linalg;
pub mod monolithic;
pub mod timestepping;
pub mod restart;
pub mod config;
pub mod models;  // Reference 1D fields

pub use error::{SstiError, SstiResult};
pub use fem::{
    Action, Contribution, DiscretizationEvaluator, DofMap, Evaluation, FieldIntegrator, FieldMatrixType, Fields,
    MapExtractor, RowMap, StateName, StateSlots, Subproblem, SystemMatrixType,
};
pub use coupling::{CouplingBlock, CouplingEvaluator, InterfaceMeshtying};
pub use linalg::{BlockSystemMatrix, Equilibration, EquilibrationMethod, LinearSolverKind, LinearSolverParams, Solver};
pub use monolithic::{ConvergenceCheck, FieldNorms, MonolithicDriver, NewtonParams, StepReport, TimeStatistics};
pub use timestepping::{DtReduction, DtSchedule, TimeStepController};
pub use restart::{FieldRestart, RestartArchive, RestartGroup};
pub use config::SstiConfig;
