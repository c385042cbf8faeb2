//! Monolithic SSTI algorithm: Newton driver, convergence check and the
//! per-iteration evaluation schedule

pub mod convergence;
pub mod driver;
pub mod schedule;

pub use convergence::{ConvergenceCheck, ConvergenceStatus, FieldNorms, NewtonParams};
pub use driver::{MonolithicDriver, StepReport, TimeStatistics};
pub use schedule::{EvaluationSchedule, ScheduleStep};
