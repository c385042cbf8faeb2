//! Evaluation schedule of one Newton iteration
//!
//! Built once at setup from the active couplings and replayed every
//! iteration, so the order of field evaluations is fixed in one place.

use crate::coupling::CouplingBlock;
use crate::fem::{Contribution, Subproblem};

/// One step of the per-iteration evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStep {
    /// Residual and diagonal block of a field
    Field(Subproblem),
    /// One contribution of one off-diagonal block
    Coupling {
        block: CouplingBlock,
        contribution: Contribution,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationSchedule {
    steps: Vec<ScheduleStep>,
}

impl EvaluationSchedule {
    /// Fields first (structure, scatra, thermo), then domain couplings, then
    /// interface couplings if mesh-tying is active
    pub fn build(active: &[CouplingBlock], interface: bool) -> Self {
        let mut steps: Vec<ScheduleStep> = Subproblem::ALL.iter().map(|&f| ScheduleStep::Field(f)).collect();

        let ordered: Vec<CouplingBlock> = CouplingBlock::ALL.into_iter().filter(|b| active.contains(b)).collect();
        steps.extend(ordered.iter().map(|&block| ScheduleStep::Coupling {
            block,
            contribution: Contribution::Domain,
        }));
        if interface {
            steps.extend(ordered.iter().map(|&block| ScheduleStep::Coupling {
                block,
                contribution: Contribution::Interface,
            }));
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[ScheduleStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Display for EvaluationSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .steps
            .iter()
            .map(|s| match s {
                ScheduleStep::Field(field) => field.to_string(),
                ScheduleStep::Coupling { block, contribution } => format!("{}[{:?}]", block, contribution),
            })
            .collect();
        f.write_str(&names.join(" -> "))
    }
}
