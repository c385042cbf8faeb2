//! Configuration of a monolithic SSTI run
//!
//! Reads TOML files into an explicit configuration struct that is handed to
//! the driver at construction. Every section has defaults, so an input file
//! only lists what it changes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::coupling::{CouplingBlock, MATCHING_TOLERANCE};
use crate::error::{SstiError, SstiResult};
use crate::fem::SystemMatrixType;
use crate::linalg::{EquilibrationMethod, EquilibrationMethods, LinearSolverKind, LinearSolverParams};
use crate::monolithic::NewtonParams;

/// Main configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SstiConfig {
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub monolithic: MonolithicConfig,
    #[serde(default)]
    pub linear_solver: LinearSolverParams,
    #[serde(default)]
    pub newton: NewtonParams,
    #[serde(default)]
    pub adaptivity: AdaptivityConfig,
    #[serde(default)]
    pub coupling: CouplingConfig,
    #[serde(default)]
    pub elch: ElchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeConfig {
    /// Time step size
    #[serde(default = "default_dt")]
    pub dt: f64,
    /// End time of the simulation
    #[serde(default = "default_max_time")]
    pub max_time: f64,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Write restart data every n steps (0 = never)
    #[serde(default)]
    pub restart_every: usize,
    /// Call field output every n steps
    #[serde(default = "default_results_every")]
    pub results_every: usize,
}

fn default_dt() -> f64 { 0.1 }
fn default_max_time() -> f64 { 1.0 }
fn default_max_steps() -> usize { 10_000 }
fn default_results_every() -> usize { 1 }

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            dt: default_dt(),
            max_time: default_max_time(),
            max_steps: default_max_steps(),
            restart_every: 0,
            results_every: default_results_every(),
        }
    }
}

/// Options of the monolithic block system
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonolithicConfig {
    #[serde(default)]
    pub linear_solver: LinearSolverKind,
    #[serde(default)]
    pub equilibration: EquilibrationMethod,
    #[serde(default)]
    pub equilibration_scatra: EquilibrationMethod,
    #[serde(default)]
    pub equilibration_structure: EquilibrationMethod,
    #[serde(default)]
    pub equilibration_thermo: EquilibrationMethod,
    #[serde(default = "default_matrix_type")]
    pub matrix_type: SystemMatrixType,
    /// Equilibrate the initial potential sub-problem of scalar transport
    #[serde(default)]
    pub equilibration_init_scatra: bool,
}

fn default_matrix_type() -> SystemMatrixType { SystemMatrixType::Sparse }

impl MonolithicConfig {
    pub fn equilibration_methods(&self) -> EquilibrationMethods {
        EquilibrationMethods {
            global: self.equilibration,
            structure: self.equilibration_structure,
            scatra: self.equilibration_scatra,
            thermo: self.equilibration_thermo,
        }
    }

    /// Scaling of the consistent initial scalar transport solve
    ///
    /// Local equilibration falls back to the scalar transport block method.
    pub fn initial_field_equilibration(&self) -> EquilibrationMethod {
        if !self.equilibration_init_scatra {
            EquilibrationMethod::None
        } else if self.equilibration == EquilibrationMethod::Local {
            self.equilibration_scatra
        } else {
            self.equilibration
        }
    }
}

/// Time step adaptation
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdaptivityConfig {
    /// Accept Δt changes from scalar transport and halve Δt on Newton failure
    #[serde(default)]
    pub adaptive_timestepping: bool,
    /// Maximum number of halvings of one step
    #[serde(default = "default_max_dt_reductions")]
    pub max_dt_reductions: usize,
}

fn default_max_dt_reductions() -> usize { 5 }

impl Default for AdaptivityConfig {
    fn default() -> Self {
        Self {
            adaptive_timestepping: false,
            max_dt_reductions: default_max_dt_reductions(),
        }
    }
}

/// Which off-diagonal blocks are assembled
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CouplingConfig {
    #[serde(default = "default_true")]
    pub structure_scatra: bool,
    #[serde(default = "default_true")]
    pub scatra_structure: bool,
    #[serde(default = "default_true")]
    pub structure_thermo: bool,
    #[serde(default = "default_true")]
    pub thermo_structure: bool,
    #[serde(default = "default_true")]
    pub scatra_thermo: bool,
    #[serde(default = "default_true")]
    pub thermo_scatra: bool,
    /// Matching-node mesh-tying on "SSTIInterfaceMeshtying" conditions
    #[serde(default)]
    pub interface_meshtying: bool,
    #[serde(default = "default_matching_tolerance")]
    pub matching_tolerance: f64,
}

fn default_true() -> bool { true }
fn default_matching_tolerance() -> f64 { MATCHING_TOLERANCE }

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            structure_scatra: true,
            scatra_structure: true,
            structure_thermo: true,
            thermo_structure: true,
            scatra_thermo: true,
            thermo_scatra: true,
            interface_meshtying: false,
            matching_tolerance: MATCHING_TOLERANCE,
        }
    }
}

impl CouplingConfig {
    pub fn is_active(&self, block: CouplingBlock) -> bool {
        match block {
            CouplingBlock::StructureScatra => self.structure_scatra,
            CouplingBlock::ScatraStructure => self.scatra_structure,
            CouplingBlock::StructureThermo => self.structure_thermo,
            CouplingBlock::ThermoStructure => self.thermo_structure,
            CouplingBlock::ScatraThermo => self.scatra_thermo,
            CouplingBlock::ThermoScatra => self.thermo_scatra,
        }
    }

    pub fn active_blocks(&self) -> Vec<CouplingBlock> {
        CouplingBlock::ALL.into_iter().filter(|&b| self.is_active(b)).collect()
    }

    /// `active[row][col]` over field positions
    pub fn active_matrix(&self) -> [[bool; 3]; 3] {
        let mut active = [[false; 3]; 3];
        for block in self.active_blocks() {
            active[block.row().position()][block.column().position()] = true;
        }
        active
    }

    /// Switch every off-diagonal block off (decoupled fields)
    pub fn decoupled() -> Self {
        Self {
            structure_scatra: false,
            scatra_structure: false,
            structure_thermo: false,
            thermo_structure: false,
            scatra_thermo: false,
            thermo_scatra: false,
            ..Self::default()
        }
    }
}

/// Electrochemistry options that interact with the monolithic system
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ElchConfig {
    /// Compute a consistent initial potential before the time loop
    #[serde(default)]
    pub init_pot_calc: bool,
}

impl SstiConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> SstiResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            SstiError::Config(format!("failed to read config file {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> SstiResult<Self> {
        toml::from_str(contents).map_err(|e| SstiError::Parse(format!("failed to parse config: {}", e)))
    }

    /// Reject parameter values and option combinations that cannot run
    pub fn validate(&self) -> SstiResult<()> {
        let t = &self.time;
        if !(t.dt > 0.0) || !t.dt.is_finite() {
            return Err(SstiError::Config(format!("time step size must be positive, got {}", t.dt)));
        }
        if !(t.max_time > 0.0) {
            return Err(SstiError::Config(format!("max_time must be positive, got {}", t.max_time)));
        }
        if t.max_steps == 0 {
            return Err(SstiError::Config("max_steps must be at least 1".into()));
        }
        if t.results_every == 0 {
            return Err(SstiError::Config("results_every must be at least 1".into()));
        }

        let n = &self.newton;
        if n.max_iterations == 0 {
            return Err(SstiError::Config("Newton needs at least one iteration".into()));
        }
        for (name, tol) in [
            ("abs_tol_res", n.abs_tol_res),
            ("rel_tol_res", n.rel_tol_res),
            ("abs_tol_inc", n.abs_tol_inc),
            ("rel_tol_inc", n.rel_tol_inc),
        ] {
            if !(tol > 0.0) {
                return Err(SstiError::Config(format!("Newton tolerance {} must be positive, got {}", name, tol)));
            }
        }

        let m = &self.monolithic;
        let per_field = [m.equilibration_structure, m.equilibration_scatra, m.equilibration_thermo]
            .iter()
            .any(|e| *e != EquilibrationMethod::None);
        for (field, method) in [
            ("structure", m.equilibration_structure),
            ("scatra", m.equilibration_scatra),
            ("thermo", m.equilibration_thermo),
        ] {
            if method == EquilibrationMethod::Local {
                return Err(SstiError::Config(format!(
                    "equilibration_{} cannot itself be 'local'",
                    field
                )));
            }
        }
        if m.equilibration != EquilibrationMethod::Local && per_field {
            return Err(SstiError::Config("Either global equilibration or local equilibration".into()));
        }
        if m.matrix_type == SystemMatrixType::Sparse && per_field {
            return Err(SstiError::Config("Block based equilibration only for block matrices".into()));
        }
        if m.equilibration == EquilibrationMethod::Local && m.matrix_type == SystemMatrixType::Sparse {
            return Err(SstiError::Config("local equilibration requires matrix_type = \"block\"".into()));
        }
        if m.equilibration_init_scatra && !self.elch.init_pot_calc {
            return Err(SstiError::Config(
                "You selected to equilibrate equations of initial potential but did not activate init_pot_calc".into(),
            ));
        }

        if self.linear_solver.max_iterations == 0 || !(self.linear_solver.tolerance > 0.0) {
            return Err(SstiError::Config("linear solver needs positive iterations and tolerance".into()));
        }
        if self.coupling.interface_meshtying && !(self.coupling.matching_tolerance > 0.0) {
            return Err(SstiError::Config("mesh-tying matching tolerance must be positive".into()));
        }
        Ok(())
    }

    /// Number of time steps implied by max_time and dt, capped by max_steps
    pub fn num_steps(&self) -> usize {
        let steps = (self.time.max_time / self.time.dt - 1e-9).ceil().max(0.0) as usize;
        steps.min(self.time.max_steps)
    }

    pub fn print_summary(&self) {
        println!("═══════════════════════════════════════════════════════════════");
        println!("  Monolithic SSTI Configuration");
        println!("═══════════════════════════════════════════════════════════════");
        println!("Time:");
        println!("  dt = {:.3e}, t_end = {:.3e} ({} steps, max {})",
            self.time.dt, self.time.max_time, self.num_steps(), self.time.max_steps);
        if self.time.restart_every > 0 {
            println!("  Restart every {} steps", self.time.restart_every);
        }

        println!("\nBlock system:");
        println!("  Matrix type: {:?}", self.monolithic.matrix_type);
        println!("  Linear solver: {} (max_iter={}, tol={:.1e}, precond={:?})",
            self.monolithic.linear_solver,
            self.linear_solver.max_iterations,
            self.linear_solver.tolerance,
            self.linear_solver.preconditioner);
        println!("  Equilibration: {}", self.monolithic.equilibration);
        if self.monolithic.equilibration == EquilibrationMethod::Local {
            println!("    structure: {}, scatra: {}, thermo: {}",
                self.monolithic.equilibration_structure,
                self.monolithic.equilibration_scatra,
                self.monolithic.equilibration_thermo);
        }

        println!("\nNewton:");
        println!("  max_iter = {}, |r| < {:.1e} or {:.1e} rel, |du| < {:.1e} or {:.1e} rel",
            self.newton.max_iterations,
            self.newton.abs_tol_res, self.newton.rel_tol_res,
            self.newton.abs_tol_inc, self.newton.rel_tol_inc);

        println!("\nCoupling:");
        let blocks: Vec<String> = self.coupling.active_blocks().iter().map(|b| b.to_string()).collect();
        println!("  Active blocks: {}", if blocks.is_empty() { "none".to_string() } else { blocks.join(", ") });
        println!("  Interface mesh-tying: {}", self.coupling.interface_meshtying);
        println!("  Adaptive time stepping: {} (max {} reductions)",
            self.adaptivity.adaptive_timestepping, self.adaptivity.max_dt_reductions);

        println!("═══════════════════════════════════════════════════════════════\n");
    }
}
