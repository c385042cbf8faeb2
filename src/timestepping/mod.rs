//! Time step size control of the coupled time loop

pub mod adaptive;

pub use adaptive::{DtReduction, DtSchedule, TimeStepController};
