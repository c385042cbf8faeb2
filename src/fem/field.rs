//! Field integrator contract and the tagged set of the three coupled fields

use serde::{Deserialize, Serialize};
use sprs::CsMat;

use crate::error::{SstiError, SstiResult};
use crate::fem::{DiscretizationEvaluator, RowMap, StateName, StateSlots};
use crate::linalg::EquilibrationMethod;
use crate::restart::FieldRestart;

/// The three coupled physics fields, in canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subproblem {
    Structure,
    ScalarTransport,
    Thermo,
}

impl Subproblem {
    /// Canonical order: structure = 0, scatra = 1, thermo = 2
    pub const ALL: [Subproblem; 3] = [Subproblem::Structure, Subproblem::ScalarTransport, Subproblem::Thermo];

    pub fn position(&self) -> usize {
        match self {
            Subproblem::Structure => 0,
            Subproblem::ScalarTransport => 1,
            Subproblem::Thermo => 2,
        }
    }

    pub fn from_position(position: usize) -> Self {
        match position {
            0 => Subproblem::Structure,
            1 => Subproblem::ScalarTransport,
            2 => Subproblem::Thermo,
            _ => panic!("invalid subproblem position {}", position),
        }
    }

    /// State slot under which this field's iterate is published
    pub fn state_name(&self) -> StateName {
        match self {
            Subproblem::Structure => StateName::Displacement,
            Subproblem::ScalarTransport => StateName::ScalarField,
            Subproblem::Thermo => StateName::Temperature,
        }
    }
}

impl std::fmt::Display for Subproblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Subproblem::Structure => "structure",
            Subproblem::ScalarTransport => "scatra",
            Subproblem::Thermo => "thermo",
        };
        f.write_str(name)
    }
}

/// Matrix representation a field uses for its own jacobian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMatrixType {
    Sparse,
    /// One block per transported species
    BlockPerSpecies,
}

/// Contract of a field time integrator (structure, scalar transport, thermo)
///
/// The driver owns one integrator per field and talks to it only through
/// these operations. Each field owns its residual and jacobian buffers and
/// its state slots; the driver writes other fields' iterates into the slots
/// before any evaluation.
pub trait FieldIntegrator {
    /// Which field this integrator advances
    fn kind(&self) -> Subproblem;

    /// One-time initialisation after construction
    fn setup(&mut self) -> SstiResult<()>;

    /// Called once after `setup` on a cold start
    fn post_setup(&mut self) -> SstiResult<()> {
        Ok(())
    }

    /// Called once before the first time step on a cold start
    fn prepare_time_loop(&mut self) -> SstiResult<()> {
        Ok(())
    }

    /// Replace u_n by a state consistent with the current coupling states
    /// (`elch.init_pot_calc`); `equilibration` scales the field system
    fn calc_initial_field(&mut self, equilibration: EquilibrationMethod) -> SstiResult<()> {
        let _ = equilibration;
        Err(SstiError::Config(format!("{} cannot compute a consistent initial state", self.kind())))
    }

    /// Advance time and step counter, apply Dirichlet values, predict
    fn prepare_time_step(&mut self) -> SstiResult<()>;

    /// True if the last `prepare_time_step` changed the time step size
    fn time_step_adapted(&self) -> bool {
        false
    }

    /// False once this field wants the time loop to stop
    fn not_finished(&self) -> bool {
        true
    }

    fn time(&self) -> f64;
    fn dt(&self) -> f64;
    fn step(&self) -> usize;
    fn set_dt(&mut self, dt: f64);
    /// Overwrite time and step counter (used when Δt changes mid-step)
    fn set_time_step(&mut self, time: f64, step: usize);

    fn dof_row_map(&self) -> &RowMap;

    /// Sub-block maps (empty for a single-block field)
    fn dof_block_maps(&self) -> Vec<RowMap> {
        Vec::new()
    }

    fn matrix_type(&self) -> FieldMatrixType {
        FieldMatrixType::Sparse
    }

    /// Gids carrying a Dirichlet condition
    fn dirichlet_dofs(&self) -> &[usize];

    fn set_state(&mut self, name: StateName, values: &[f64]);
    fn state_slots(&self) -> &StateSlots;
    fn discretization(&self) -> &dyn DiscretizationEvaluator;

    /// Evaluate residual and diagonal block at the current iterate
    fn evaluate(&mut self) -> SstiResult<()>;
    fn residual(&self) -> &[f64];
    fn system_matrix(&self) -> &CsMat<f64>;

    /// Current iterate u_np
    fn state_np(&self) -> &[f64];
    /// Converged state of the last step u_n
    fn state_n(&self) -> &[f64];

    /// Velocity consistent with the time integrator (structure only)
    fn velocity_np(&self) -> Option<&[f64]> {
        None
    }

    /// u_np += increment (scalar transport, thermo)
    fn update_iter(&mut self, increment: &[f64]) -> SstiResult<()>;

    /// u_np += increment and update derived kinematics (structure)
    fn update_state_incrementally(&mut self, increment: &[f64]) -> SstiResult<()> {
        self.update_iter(increment)
    }

    /// Discard the current iterate and return to u_n (after a failed step)
    fn reset_step(&mut self);

    /// Accept the converged step: u_n <- u_np
    fn update(&mut self) -> SstiResult<()>;

    fn prepare_output(&mut self) {}

    fn output(&mut self) -> SstiResult<()> {
        Ok(())
    }

    fn write_restart(&self) -> FieldRestart;
    fn read_restart(&mut self, data: &FieldRestart) -> SstiResult<()>;
}

/// The three field integrators, dispatched by [`Subproblem`] tag
pub struct Fields {
    structure: Box<dyn FieldIntegrator>,
    scatra: Box<dyn FieldIntegrator>,
    thermo: Box<dyn FieldIntegrator>,
}

impl Fields {
    /// Bundle the integrators; each must report the matching kind
    pub fn new(
        structure: Box<dyn FieldIntegrator>,
        scatra: Box<dyn FieldIntegrator>,
        thermo: Box<dyn FieldIntegrator>,
    ) -> SstiResult<Self> {
        let fields = Self { structure, scatra, thermo };
        for f in Subproblem::ALL {
            let kind = fields.get(f).kind();
            if kind != f {
                return Err(SstiError::Config(format!(
                    "field integrator in slot '{}' reports kind '{}'",
                    f, kind
                )));
            }
        }
        Ok(fields)
    }

    pub fn get(&self, f: Subproblem) -> &dyn FieldIntegrator {
        match f {
            Subproblem::Structure => self.structure.as_ref(),
            Subproblem::ScalarTransport => self.scatra.as_ref(),
            Subproblem::Thermo => self.thermo.as_ref(),
        }
    }

    pub fn get_mut(&mut self, f: Subproblem) -> &mut dyn FieldIntegrator {
        match f {
            Subproblem::Structure => self.structure.as_mut(),
            Subproblem::ScalarTransport => self.scatra.as_mut(),
            Subproblem::Thermo => self.thermo.as_mut(),
        }
    }

    pub fn structure(&self) -> &dyn FieldIntegrator {
        self.structure.as_ref()
    }

    pub fn scatra(&self) -> &dyn FieldIntegrator {
        self.scatra.as_ref()
    }

    pub fn thermo(&self) -> &dyn FieldIntegrator {
        self.thermo.as_ref()
    }
}
