//! Time step size adaptation
//!
//! Two sources change Δt during a run: the scalar transport field may
//! propose a new size in its `prepare_time_step` (through a
//! [`TimeStepController`]), and the driver halves Δt after a failed Newton
//! solve. The bookkeeping of the latter lives in [`DtReduction`].

use std::collections::BTreeMap;

/// Halving bookkeeping of one time step
#[derive(Debug, Clone, Copy)]
pub struct DtReduction {
    max_reductions: usize,
    reductions: usize,
    /// Δt at the first attempt of the step
    initial_dt: Option<f64>,
}

impl DtReduction {
    /// Factor applied to Δt per reduction
    pub const FACTOR: f64 = 0.5;

    pub fn new(max_reductions: usize) -> Self {
        Self {
            max_reductions,
            reductions: 0,
            initial_dt: None,
        }
    }

    /// Next (halved) Δt, or `None` once the cap is reached
    pub fn reduce(&mut self, dt: f64) -> Option<f64> {
        if self.reductions >= self.max_reductions {
            return None;
        }
        self.initial_dt.get_or_insert(dt);
        self.reductions += 1;
        Some(dt * Self::FACTOR)
    }

    pub fn reductions(&self) -> usize {
        self.reductions
    }

    pub fn exhausted(&self) -> bool {
        self.reductions >= self.max_reductions
    }

    /// Δt of the first attempt, if the step was ever reduced
    pub fn initial_dt(&self) -> Option<f64> {
        self.initial_dt
    }

    /// Current Δt relative to the first attempt (1 if never reduced)
    pub fn ratio(&self) -> f64 {
        Self::FACTOR.powi(self.reductions as i32)
    }
}

/// Proposes a new Δt at the start of a step
///
/// Returning `None` keeps the current size.
pub trait TimeStepController {
    fn propose_dt(&mut self, step: usize, time: f64, dt: f64) -> Option<f64>;
}

impl<F> TimeStepController for F
where
    F: FnMut(usize, f64, f64) -> Option<f64>,
{
    fn propose_dt(&mut self, step: usize, time: f64, dt: f64) -> Option<f64> {
        self(step, time, dt)
    }
}

/// Prescribed Δt changes: at step n use a factor of the current size
#[derive(Debug, Clone, Default)]
pub struct DtSchedule {
    factors: BTreeMap<usize, f64>,
}

impl DtSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_change(mut self, step: usize, factor: f64) -> Self {
        self.factors.insert(step, factor);
        self
    }
}

impl TimeStepController for DtSchedule {
    fn propose_dt(&mut self, step: usize, _time: f64, dt: f64) -> Option<f64> {
        // each change fires once
        self.factors.remove(&step).map(|factor| dt * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_halving_until_cap() {
        let mut reduction = DtReduction::new(3);
        let mut dt = 0.8;
        for _ in 0..3 {
            dt = reduction.reduce(dt).unwrap();
        }
        assert_relative_eq!(dt, 0.1);
        assert!(reduction.exhausted());
        assert!(reduction.reduce(dt).is_none());
        assert_eq!(reduction.reductions(), 3);
        assert_relative_eq!(reduction.initial_dt().unwrap(), 0.8);
        assert_relative_eq!(reduction.ratio(), 0.125);
    }

    #[test]
    fn test_zero_cap_never_reduces() {
        let mut reduction = DtReduction::new(0);
        assert!(reduction.reduce(1.0).is_none());
        assert!(reduction.initial_dt().is_none());
    }

    #[test]
    fn test_schedule_fires_once() {
        let mut schedule = DtSchedule::new().with_change(3, 0.5);
        assert_eq!(schedule.propose_dt(2, 0.2, 0.1), None);
        assert_relative_eq!(schedule.propose_dt(3, 0.3, 0.1).unwrap(), 0.05);
        assert_eq!(schedule.propose_dt(3, 0.3, 0.05), None);
    }

    #[test]
    fn test_closure_controller() {
        let mut controller = |step: usize, _t: f64, dt: f64| if step == 1 { Some(2.0 * dt) } else { None };
        assert_eq!(controller.propose_dt(1, 0.0, 0.1), Some(0.2));
        assert_eq!(controller.propose_dt(2, 0.0, 0.1), None);
    }
}
