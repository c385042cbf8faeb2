//! Monolithic Newton-Raphson driver of the three-field SSTI problem
//!
//! The driver owns the field integrators, the dof enumeration, the block
//! system matrix and everything built around it at setup. Each time step
//! runs
//!
//! ```text
//! prepare:  t += Δt; distribute states; scatra, (Δt from scatra), thermo, structure
//! newton:   clear K; distribute states; evaluate schedule; assemble K, r
//!           condense mesh-tying; complete; Dirichlet rows
//!           check convergence; scale; solve K Δu = -r; unscale
//!           slave <- master; update field iterates
//! finish:   update, output, restart group
//! ```
//!
//! A Newton failure is fatal unless adaptive time stepping is enabled, in
//! which case the step is reset and retried with half the step size.

use std::time::Instant;

use log::{debug, error, info, warn};
use sprs::CsMat;

use crate::config::SstiConfig;
use crate::coupling::{CouplingEvaluator, InterfaceMeshtying};
use crate::error::{SstiError, SstiResult};
use crate::fem::{DofMap, FieldMatrixType, Fields, StateName, Subproblem, SystemMatrixType};
use crate::linalg::{build_solver, BlockSystemMatrix, Equilibration, LinearOperator, Solver, SolverUtils};
use crate::monolithic::{ConvergenceCheck, ConvergenceStatus, EvaluationSchedule, FieldNorms, ScheduleStep};
use crate::restart::{RestartArchive, RestartGroup};
use crate::timestepping::DtReduction;

/// Relative tolerance when comparing field times with the driver time
const TIME_TOLERANCE: f64 = 1e-10;

/// Wall time spent in the parts of one time step (seconds)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeStatistics {
    /// Field and coupling evaluation plus assembly
    pub evaluate: f64,
    /// Equilibration and linear solve
    pub solve: f64,
    /// Whole Newton loop
    pub newton: f64,
}

impl TimeStatistics {
    fn add(&mut self, other: &TimeStatistics) {
        self.evaluate += other.evaluate;
        self.solve += other.solve;
        self.newton += other.newton;
    }
}

/// Summary of one accepted time step
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: usize,
    pub time: f64,
    pub dt: f64,
    pub newton_iterations: usize,
    /// Number of Δt halvings before the step converged
    pub dt_reductions: usize,
    /// Norms at the first Newton iteration of the accepted attempt
    pub first_norms: Vec<FieldNorms>,
    /// Norms at convergence
    pub final_norms: Vec<FieldNorms>,
    pub timing: TimeStatistics,
}

/// Result of one successful Newton loop
struct NewtonOutcome {
    iterations: usize,
    first_norms: Vec<FieldNorms>,
    final_norms: Vec<FieldNorms>,
    timing: TimeStatistics,
}

/// Monolithic SSTI time and Newton loop
pub struct MonolithicDriver {
    config: SstiConfig,
    fields: Fields,
    dofs: DofMap,
    meshtying: Option<InterfaceMeshtying>,
    system: BlockSystemMatrix,
    equilibration: Equilibration,
    coupling: CouplingEvaluator,
    schedule: EvaluationSchedule,
    convergence: ConvergenceCheck,
    solver: Box<dyn Solver>,

    time: f64,
    dt: f64,
    step: usize,
    /// Newton iteration of the running step (0 outside the loop)
    iteration: usize,
    /// Set once `prepare_time_loop` ran or a restart was read
    time_loop_prepared: bool,

    /// Last increment per field, for the increment norms
    increments: [Vec<f64>; 3],
    history: Vec<StepReport>,
    restarts: RestartArchive,
    total_timing: TimeStatistics,
}

impl MonolithicDriver {
    /// Validate the configuration, set up the fields and build every
    /// structure that lives through the time loop
    pub fn new(config: SstiConfig, fields: Fields) -> SstiResult<Self> {
        config.validate()?;
        let mut fields = fields;

        for f in Subproblem::ALL {
            let field = fields.get_mut(f);
            field.setup()?;
            field.set_dt(config.time.dt);
        }

        for f in Subproblem::ALL {
            if config.monolithic.matrix_type == SystemMatrixType::Sparse
                && fields.get(f).matrix_type() == FieldMatrixType::BlockPerSpecies
            {
                return Err(SstiError::Config(format!(
                    "field '{}' assembles block-per-species matrices but matrix_type is sparse",
                    f
                )));
            }
        }

        let dofs = DofMap::new(
            Subproblem::ALL.map(|f| fields.get(f).dof_row_map().clone()),
            Subproblem::ALL.map(|f| fields.get(f).dof_block_maps()),
            config.monolithic.matrix_type,
        )?;

        let meshtying = if config.coupling.interface_meshtying {
            let mut meshtying = InterfaceMeshtying::setup(&fields, config.coupling.matching_tolerance)?;
            meshtying.store_dirichlet_status(fields.structure().dirichlet_dofs())?;
            info!(
                "interface mesh-tying: {} structure, {} scatra, {} thermo slave dofs",
                meshtying.pairs(Subproblem::Structure).len(),
                meshtying.pairs(Subproblem::ScalarTransport).len(),
                meshtying.pairs(Subproblem::Thermo).len()
            );
            Some(meshtying)
        } else {
            None
        };

        let active = config.coupling.active_blocks();
        let system = BlockSystemMatrix::new(&dofs, config.coupling.active_matrix());
        let equilibration = Equilibration::new(&config.monolithic.equilibration_methods(), &dofs)?;
        let coupling = CouplingEvaluator::new(active.clone(), meshtying.is_some());
        let schedule = EvaluationSchedule::build(&active, meshtying.is_some());
        let convergence = ConvergenceCheck::new(config.newton.clone());

        let mut solver = build_solver(config.monolithic.linear_solver, &config.linear_solver);
        // block preconditioners work on the system blocks; a single block
        // falls back to the field partition
        let partition_source = if dofs.num_blocks() > 1 {
            dofs.block_extractor()
        } else {
            dofs.field_extractor()
        };
        solver.set_block_partition(
            (0..partition_source.num_maps())
                .map(|i| partition_source.positions(i).to_vec())
                .collect(),
        );

        debug!("evaluation schedule: {}", schedule);
        info!(
            "SSTI setup: {} dofs ({} structure, {} scatra, {} thermo), {} system blocks, solver {}",
            dofs.full_map().len(),
            dofs.field_map(Subproblem::Structure).len(),
            dofs.field_map(Subproblem::ScalarTransport).len(),
            dofs.field_map(Subproblem::Thermo).len(),
            dofs.num_blocks(),
            solver.name()
        );

        let increments = Subproblem::ALL.map(|f| vec![0.0; dofs.field_map(f).len()]);
        let dt = config.time.dt;

        Ok(Self {
            config,
            fields,
            dofs,
            meshtying,
            system,
            equilibration,
            coupling,
            schedule,
            convergence,
            solver,
            time: 0.0,
            dt,
            step: 0,
            iteration: 0,
            time_loop_prepared: false,
            increments,
            history: Vec::new(),
            restarts: RestartArchive::new(),
            total_timing: TimeStatistics::default(),
        })
    }

    pub fn config(&self) -> &SstiConfig {
        &self.config
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    pub fn dof_map(&self) -> &DofMap {
        &self.dofs
    }

    pub fn meshtying(&self) -> Option<&InterfaceMeshtying> {
        self.meshtying.as_ref()
    }

    pub fn system_matrix(&self) -> &BlockSystemMatrix {
        &self.system
    }

    pub fn schedule(&self) -> &EvaluationSchedule {
        &self.schedule
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Reports of all accepted steps
    pub fn history(&self) -> &[StepReport] {
        &self.history
    }

    pub fn restart_archive(&self) -> &RestartArchive {
        &self.restarts
    }

    pub fn total_timing(&self) -> TimeStatistics {
        self.total_timing
    }

    /// True while the end time and step cap are not reached and no field
    /// asked to stop
    pub fn not_finished(&self) -> bool {
        self.time < self.config.time.max_time * (1.0 - TIME_TOLERANCE) - TIME_TOLERANCE
            && self.step < self.config.time.max_steps
            && Subproblem::ALL.iter().all(|&f| self.fields.get(f).not_finished())
    }

    /// Run the time loop to the end
    ///
    /// Fatal errors are logged once before they are returned.
    pub fn run(&mut self) -> SstiResult<()> {
        let started = Instant::now();
        if !self.time_loop_prepared {
            self.prepare_time_loop().map_err(|e| self.log_fatal(e))?;
        }
        while self.not_finished() {
            self.do_step()?;
        }
        info!(
            "time loop finished: {} steps, t = {:.6e}, wall time {:.3} s (evaluate {:.3} s, solve {:.3} s)",
            self.step,
            self.time,
            started.elapsed().as_secs_f64(),
            self.total_timing.evaluate,
            self.total_timing.solve
        );
        Ok(())
    }

    /// Cold-start initialisation before the first step
    pub fn prepare_time_loop(&mut self) -> SstiResult<()> {
        if self.time_loop_prepared {
            return Ok(());
        }
        for f in Subproblem::ALL {
            self.fields.get_mut(f).post_setup()?;
        }
        self.distribute_states()?;
        if self.config.elch.init_pot_calc {
            let method = self.config.monolithic.initial_field_equilibration();
            self.fields.get_mut(Subproblem::ScalarTransport).calc_initial_field(method)?;
            self.distribute_states()?;
        }
        self.fields.get_mut(Subproblem::ScalarTransport).prepare_time_loop()?;
        self.fields.get_mut(Subproblem::Thermo).prepare_time_loop()?;
        self.time_loop_prepared = true;
        Ok(())
    }

    /// Advance one time step, retrying with smaller Δt if allowed
    pub fn do_step(&mut self) -> SstiResult<&StepReport> {
        if !self.time_loop_prepared {
            self.prepare_time_loop().map_err(|e| self.log_fatal(e))?;
        }
        let time_n = self.time;
        let step_n = self.step;
        let mut reduction = DtReduction::new(self.config.adaptivity.max_dt_reductions);

        let outcome = loop {
            self.prepare_time_step().map_err(|e| self.log_fatal(e))?;
            match self.newton_loop() {
                Ok(outcome) => break outcome,
                Err(e) if e.is_recoverable() && self.config.adaptivity.adaptive_timestepping => {
                    match reduction.reduce(self.dt) {
                        Some(new_dt) => {
                            warn!(
                                "step {}: {}; retrying with dt = {:.4e} (reduction {}/{})",
                                self.step,
                                e,
                                new_dt,
                                reduction.reductions(),
                                self.config.adaptivity.max_dt_reductions
                            );
                            self.reset_step(time_n, step_n, new_dt).map_err(|e| self.log_fatal(e))?;
                        }
                        None => return Err(self.log_fatal(e)),
                    }
                }
                Err(e) => return Err(self.log_fatal(e)),
            }
        };

        self.finish_step(outcome, reduction.reductions()).map_err(|e| self.log_fatal(e))?;
        // finish_step always pushes a report
        Ok(&self.history[self.history.len() - 1])
    }

    fn log_fatal(&self, e: SstiError) -> SstiError {
        error!("{}", e);
        e
    }

    /// Increment time, prepare the fields and accept a Δt change of the
    /// scalar transport field
    fn prepare_time_step(&mut self) -> SstiResult<()> {
        self.step += 1;
        self.time += self.dt;

        self.distribute_states()?;

        // scatra first so its predictor sees the old state
        self.fields.get_mut(Subproblem::ScalarTransport).prepare_time_step()?;
        if self.fields.scatra().time_step_adapted() {
            self.distribute_dt_from_scatra()?;
        }
        self.fields.get_mut(Subproblem::Thermo).prepare_time_step()?;
        self.fields.get_mut(Subproblem::Structure).prepare_time_step()?;

        self.check_time_consistency()
    }

    /// Hand the new Δt of the scalar transport field to structure and thermo
    fn distribute_dt_from_scatra(&mut self) -> SstiResult<()> {
        if !self.config.adaptivity.adaptive_timestepping {
            return Err(SstiError::Config(
                "scalar transport changed the time step size but adaptive time stepping is off".into(),
            ));
        }
        let new_time = self.fields.scatra().time();
        let new_dt = self.fields.scatra().dt();
        if !(new_dt > 0.0) {
            return Err(SstiError::assembly(
                Some(Subproblem::ScalarTransport),
                format!("adapted time step size {} is not positive", new_dt),
            ));
        }

        for f in [Subproblem::Thermo, Subproblem::Structure] {
            let field = self.fields.get_mut(f);
            field.set_dt(new_dt);
            field.set_time_step(new_time - new_dt, self.step - 1);
        }
        info!(
            "step {}: scatra adapted dt {:.4e} -> {:.4e}, t = {:.6e}",
            self.step, self.dt, new_dt, new_time
        );
        self.dt = new_dt;
        self.time = new_time;
        Ok(())
    }

    fn check_time_consistency(&self) -> SstiResult<()> {
        for f in Subproblem::ALL {
            let t = self.fields.get(f).time();
            if (t - self.time).abs() > TIME_TOLERANCE * self.time.abs().max(1.0) {
                return Err(SstiError::assembly(
                    Some(f),
                    format!("field time {:.12e} differs from driver time {:.12e}", t, self.time),
                )
                .with_context(self.step, 0));
            }
        }
        Ok(())
    }

    /// Return every field to the start of the step with a new Δt
    fn reset_step(&mut self, time_n: f64, step_n: usize, dt: f64) -> SstiResult<()> {
        for f in Subproblem::ALL {
            let field = self.fields.get_mut(f);
            field.reset_step();
            field.set_dt(dt);
            field.set_time_step(time_n, step_n);
        }
        self.time = time_n;
        self.step = step_n;
        self.dt = dt;
        for inc in &mut self.increments {
            inc.iter_mut().for_each(|v| *v = 0.0);
        }
        Ok(())
    }

    /// Install every field's current iterate on every field's state slots
    fn distribute_states(&mut self) -> SstiResult<()> {
        let displacement = self.fields.structure().state_np().to_vec();
        let velocity = self.fields.structure().velocity_np().map(|v| v.to_vec());
        let scalars = self.fields.scatra().state_np().to_vec();
        let temperature = self.fields.thermo().state_np().to_vec();

        let interface_views = match &self.meshtying {
            Some(mt) => Some((
                mt.master_side_view(
                    Subproblem::ScalarTransport,
                    self.dofs.field_map(Subproblem::ScalarTransport),
                    &scalars,
                )?,
                mt.master_side_view(Subproblem::Thermo, self.dofs.field_map(Subproblem::Thermo), &temperature)?,
                mt.slave_side_view(Subproblem::Thermo, self.dofs.field_map(Subproblem::Thermo), &temperature)?,
            )),
            None => None,
        };

        for f in Subproblem::ALL {
            let field = self.fields.get_mut(f);
            field.set_state(StateName::Displacement, &displacement);
            field.set_state(StateName::ScalarField, &scalars);
            field.set_state(StateName::Temperature, &temperature);
            if let Some(v) = &velocity {
                field.set_state(StateName::Velocity, v);
            }
            if let Some((master_scalars, master_temperature, slave_temperature)) = &interface_views {
                field.set_state(StateName::MasterScalar, master_scalars);
                field.set_state(StateName::MasterTemperature, master_temperature);
                field.set_state(StateName::SlaveTemperature, slave_temperature);
            }
        }
        Ok(())
    }

    /// Run the evaluation schedule of one Newton iteration
    fn evaluate_subproblems(&mut self) -> SstiResult<()> {
        let steps = self.schedule.steps().to_vec();
        for step in steps {
            match step {
                ScheduleStep::Field(f) => {
                    self.fields.get_mut(f).evaluate()?;
                    let n = self.dofs.field_map(f).len();
                    let field = self.fields.get(f);
                    if field.residual().len() != n {
                        return Err(SstiError::assembly(
                            Some(f),
                            format!("residual has {} entries, dof row map {}", field.residual().len(), n),
                        ));
                    }
                    let k = field.system_matrix();
                    if (k.rows(), k.cols()) != (n, n) {
                        return Err(SstiError::assembly(
                            Some(f),
                            format!("system matrix is {}x{}, dof row map {}", k.rows(), k.cols(), n),
                        ));
                    }
                }
                ScheduleStep::Coupling { block, contribution } => {
                    self.coupling.evaluate(block, contribution, &self.fields)?;
                }
            }
        }
        Ok(())
    }

    /// Assemble K and r, condense mesh-tying and impose Dirichlet rows
    fn assemble_system(&mut self) -> SstiResult<Vec<f64>> {
        for f in Subproblem::ALL {
            self.system.assemble(f, self.fields.get(f).system_matrix())?;
        }
        self.coupling.assemble_into(&mut self.system)?;

        let mut residual = vec![0.0; self.dofs.full_map().len()];
        for f in Subproblem::ALL {
            self.dofs.insert(self.fields.get(f).residual(), f, &mut residual);
        }

        if let Some(mt) = &self.meshtying {
            self.system.apply_meshtying(mt)?;
            let map = self.dofs.field_map(Subproblem::Structure);
            let mut r_structure = self.dofs.extract(&residual, Subproblem::Structure);
            mt.fold_slave_into_master(Subproblem::Structure, map, &mut r_structure)?;
            self.dofs.insert(&r_structure, Subproblem::Structure, &mut residual);
        }
        self.system.complete();

        let dbc_rows = self.dirichlet_rows()?;
        self.system.apply_dirichlet(&dbc_rows)?;
        for &row in &dbc_rows {
            residual[row] = 0.0;
        }
        Ok(residual)
    }

    /// Full-map lids of all Dirichlet dofs
    fn dirichlet_rows(&self) -> SstiResult<Vec<usize>> {
        let mut rows = Vec::new();
        for f in Subproblem::ALL {
            let map = self.dofs.field_map(f);
            for &gid in self.fields.get(f).dirichlet_dofs() {
                let lid = map
                    .lid(gid)
                    .ok_or_else(|| SstiError::assembly_at_gid(Some(f), gid, "Dirichlet dof not in dof row map"))?;
                rows.push(self.dofs.full_lid(f, lid));
            }
        }
        Ok(rows)
    }

    fn field_norms(&self, residual: &[f64]) -> Vec<FieldNorms> {
        Subproblem::ALL
            .iter()
            .map(|&f| {
                FieldNorms::compute(
                    f,
                    &self.dofs.extract(residual, f),
                    &self.increments[f.position()],
                    self.fields.get(f).state_np(),
                )
            })
            .collect()
    }

    fn newton_loop(&mut self) -> SstiResult<NewtonOutcome> {
        let started = Instant::now();
        let mut timing = TimeStatistics::default();
        let mut first_norms = Vec::new();
        for inc in &mut self.increments {
            inc.iter_mut().for_each(|v| *v = 0.0);
        }

        self.iteration = 0;
        loop {
            self.iteration += 1;
            let (step, iteration) = (self.step, self.iteration);

            let t_eval = Instant::now();
            self.system.clear();
            self.distribute_states().map_err(|e| e.with_context(step, iteration))?;
            self.evaluate_subproblems().map_err(|e| e.with_context(step, iteration))?;
            let residual = self.assemble_system().map_err(|e| e.with_context(step, iteration))?;
            timing.evaluate += t_eval.elapsed().as_secs_f64();

            let norms = self.field_norms(&residual);
            if iteration == 1 {
                first_norms = norms.clone();
            }
            self.convergence.log_iteration(iteration, &norms);
            let status = self
                .convergence
                .check(iteration, &norms)
                .map_err(|e| e.with_context(step, iteration))?;

            if status == ConvergenceStatus::Converged {
                timing.newton = started.elapsed().as_secs_f64();
                self.iteration = 0;
                return Ok(NewtonOutcome {
                    iterations: iteration,
                    first_norms,
                    final_norms: norms,
                    timing,
                });
            }

            let t_solve = Instant::now();
            let increment = self.solve(residual).map_err(|e| e.with_context(step, iteration))?;
            timing.solve += t_solve.elapsed().as_secs_f64();
            debug!(
                "  step {} iter {}: evaluate {:.3e} s, solve {:.3e} s",
                step, iteration, timing.evaluate, timing.solve
            );

            self.update_iter_states(&increment).map_err(|e| e.with_context(step, iteration))?;
        }
    }

    /// Equilibrate and solve K Δu = -r, returning the unscaled increment
    fn solve(&mut self, residual: Vec<f64>) -> SstiResult<Vec<f64>> {
        let mut matrix: CsMat<f64> = self.system.merged()?;
        let mut rhs: Vec<f64> = residual.into_iter().map(|r| -r).collect();
        self.equilibration.scale(&mut matrix, &mut rhs)?;

        let (mut increment, stats) = self.solver.solve(&matrix, &rhs);
        if !stats.converged || increment.iter().any(|v| !v.is_finite()) {
            let solve_residual = if increment.iter().all(|v| v.is_finite()) {
                SolverUtils::compute_residual(&matrix, &increment, &rhs)
            } else {
                rhs.clone()
            };
            let blocks = self.dofs.block_extractor();
            let block_norms = if blocks.num_maps() > 1 {
                (0..blocks.num_maps())
                    .map(|b| SolverUtils::norm(&blocks.extract_vector(&solve_residual, b)))
                    .collect()
            } else {
                Subproblem::ALL
                    .iter()
                    .map(|&f| SolverUtils::norm(&self.dofs.extract(&solve_residual, f)))
                    .collect()
            };
            return Err(SstiError::LinearSolve {
                step: 0,
                iteration: 0,
                solver: self.solver.name().to_string(),
                residual_norm: stats.residual_norm,
                block_norms,
            });
        }
        debug!(
            "  linear solve ({}): {} iterations, |r| = {:.3e}, {} x {}",
            self.solver.name(),
            stats.iterations,
            stats.residual_norm,
            LinearOperator::rows(&matrix),
            LinearOperator::cols(&matrix)
        );

        self.equilibration.unscale(&mut increment);
        Ok(increment)
    }

    /// Split the increment, rebuild structural slave dofs from their masters
    /// and update every field's iterate
    fn update_iter_states(&mut self, increment: &[f64]) -> SstiResult<()> {
        let mut field_increments = Subproblem::ALL.map(|f| self.dofs.extract(increment, f));

        if let Some(mt) = &self.meshtying {
            mt.copy_master_to_slave(
                Subproblem::Structure,
                self.dofs.field_map(Subproblem::Structure),
                &mut field_increments[Subproblem::Structure.position()],
            )?;
        }

        self.fields
            .get_mut(Subproblem::ScalarTransport)
            .update_iter(&field_increments[Subproblem::ScalarTransport.position()])?;
        self.fields
            .get_mut(Subproblem::Thermo)
            .update_iter(&field_increments[Subproblem::Thermo.position()])?;
        self.fields
            .get_mut(Subproblem::Structure)
            .update_state_incrementally(&field_increments[Subproblem::Structure.position()])?;

        self.increments = field_increments;
        Ok(())
    }

    /// Accept the converged step: update, output, restart, report
    fn finish_step(&mut self, outcome: NewtonOutcome, dt_reductions: usize) -> SstiResult<()> {
        for f in Subproblem::ALL {
            let field = self.fields.get_mut(f);
            field.prepare_output();
            field.update()?;
        }
        if self.step % self.config.time.results_every == 0 {
            for f in Subproblem::ALL {
                self.fields.get_mut(f).output()?;
            }
        }
        if self.config.time.restart_every > 0 && self.step % self.config.time.restart_every == 0 {
            let group = self.write_restart();
            self.restarts.insert(group);
            debug!("restart data written for step {}", self.step);
        }

        self.total_timing.add(&outcome.timing);
        info!(
            "step {:5} | t = {:.6e} | dt = {:.4e} | {} newton iterations{} | eval {:.3} s, solve {:.3} s",
            self.step,
            self.time,
            self.dt,
            outcome.iterations,
            if dt_reductions > 0 { format!(" after {} dt reductions", dt_reductions) } else { String::new() },
            outcome.timing.evaluate,
            outcome.timing.solve
        );
        self.history.push(StepReport {
            step: self.step,
            time: self.time,
            dt: self.dt,
            newton_iterations: outcome.iterations,
            dt_reductions,
            first_norms: outcome.first_norms,
            final_norms: outcome.final_norms,
            timing: outcome.timing,
        });
        Ok(())
    }

    /// Restart group of the current (converged) step
    pub fn write_restart(&self) -> RestartGroup {
        RestartGroup {
            step: self.step,
            time: self.time,
            dt_previous: self.dt,
            fields: Subproblem::ALL.iter().map(|&f| self.fields.get(f).write_restart()).collect(),
            meshtying_active: self.meshtying.as_ref().map(|mt| mt.active_set()).unwrap_or_default(),
        }
    }

    /// Restore the fields and the driver clock from a restart group
    ///
    /// Replaces the cold-start preparation; `post_setup` is not called.
    pub fn read_restart(&mut self, group: &RestartGroup) -> SstiResult<()> {
        for f in Subproblem::ALL {
            let data = group.field(f)?;
            data.check_compatible(f, self.dofs.field_map(f))?;
            let field = self.fields.get_mut(f);
            field.read_restart(data)?;
            field.set_dt(group.dt_previous);
            field.set_time_step(group.time, group.step);
        }
        if let Some(mt) = &mut self.meshtying {
            mt.restore_active_set(&group.meshtying_active)?;
        } else if !group.meshtying_active.is_empty() {
            return Err(SstiError::Restart(
                "restart data carries a mesh-tying active set but mesh-tying is off".into(),
            ));
        }

        self.time = group.time;
        self.step = group.step;
        self.dt = group.dt_previous;
        self.time_loop_prepared = true;
        self.distribute_states()?;
        info!("restarted from step {} at t = {:.6e}", self.step, self.time);
        Ok(())
    }
}
