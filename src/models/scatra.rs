//! Scalar transport on the deforming bar
//!
//! Backward Euler with lumped capacity, per species k:
//!
//! ```text
//! J ∂c/∂t − ∂/∂X (D/J ∂c/∂X) = J s,   J = 1 + ∂u/∂X
//! D = D0 (1 + γ (T − T_ref))
//! ```
//!
//! Across a mesh-tied interface the species pass with a linear exchange law
//! `j = k_T (c_m − c_s)`, whose rate constant depends on the mean interface
//! temperature.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{SstiError, SstiResult};
use crate::fem::{
    Action, Contribution, DiscretizationEvaluator, ElementFace, Evaluation, FieldIntegrator, FieldMatrixType,
    RowMap, StateName, StateSlots, Subproblem, MESHTYING_CONDITION,
};
use crate::linalg::EquilibrationMethod;
use crate::models::mesh1d::{resolve_dirichlet, Dirichlet, DofLayout, InterfaceCondition, Mesh1d};
use crate::models::{assemble_elements, element_mean, ElementContribution, TimeState};
use crate::restart::FieldRestart;
use crate::timestepping::TimeStepController;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatraParams {
    /// D0
    #[serde(default = "default_one")]
    pub diffusivity: f64,
    /// γ: relative change of D per kelvin
    #[serde(default)]
    pub temperature_coefficient: f64,
    /// Volumetric source s
    #[serde(default)]
    pub source: f64,
    #[serde(default)]
    pub reference_temperature: f64,
    #[serde(default)]
    pub initial_concentration: f64,
    /// Split the field matrix into one block per species
    #[serde(default)]
    pub block_per_species: bool,
}

fn default_one() -> f64 { 1.0 }

impl Default for ScatraParams {
    fn default() -> Self {
        Self {
            diffusivity: 1.0,
            temperature_coefficient: 0.0,
            source: 0.0,
            reference_temperature: 0.0,
            initial_concentration: 0.0,
            block_per_species: false,
        }
    }
}

/// Exchange law on mesh-tied interfaces
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InterfaceKinetics {
    /// k_I at the reference temperature
    pub rate: f64,
    /// γ_I
    #[serde(default)]
    pub temperature_coefficient: f64,
    /// Heat released at the slave side per transported amount (η_I)
    #[serde(default)]
    pub reaction_heat: f64,
    /// Thermal interface conductance h
    #[serde(default)]
    pub conductance: f64,
    #[serde(default)]
    pub reference_temperature: f64,
}

impl InterfaceKinetics {
    /// k_T at mean interface temperature `temperature`
    pub fn rate_at(&self, temperature: f64) -> f64 {
        self.rate * (1.0 + self.temperature_coefficient * (temperature - self.reference_temperature))
    }

    /// ∂k_T/∂T_m = ∂k_T/∂T_s
    pub fn rate_derivative(&self) -> f64 {
        0.5 * self.rate * self.temperature_coefficient
    }
}

/// Element and interface loop of the scalar transport field
#[derive(Debug, Clone)]
pub struct ScalarTransportDiscretization {
    mesh: Mesh1d,
    layout: DofLayout,
    params: ScatraParams,
    kinetics: Option<InterfaceKinetics>,
    history: Vec<f64>,
    dt: f64,
}

impl ScalarTransportDiscretization {
    pub fn new(mesh: Mesh1d, layout: DofLayout, params: ScatraParams, kinetics: Option<InterfaceKinetics>) -> Self {
        let n = layout.map(Subproblem::ScalarTransport).len();
        Self { mesh, layout, params, kinetics, history: vec![0.0; n], dt: 1.0 }
    }

    /// Install c_n and Δt of the current step
    pub fn set_history(&mut self, c_n: &[f64], dt: f64) {
        self.history.copy_from_slice(c_n);
        self.dt = dt;
    }

    pub fn params(&self) -> &ScatraParams {
        &self.params
    }

    fn num_interfaces(&self) -> usize {
        if self.kinetics.is_some() {
            self.mesh.interfaces().len()
        } else {
            0
        }
    }

    fn jacobian_determinant(&self, e: usize, u: &[f64]) -> SstiResult<(f64, f64)> {
        let [a, b] = self.mesh.elements()[e].nodes;
        let length = self.mesh.element_length(e);
        let j = 1.0 + (u[b] - u[a]) / length;
        if !(j > 0.0) {
            return Err(SstiError::assembly_at_gid(
                Some(Subproblem::ScalarTransport),
                self.layout.map(Subproblem::Structure).gid(a),
                format!("element {} is inverted (J = {:.3e})", e, j),
            ));
        }
        Ok((length, j))
    }

    fn diffusivity(&self, e: usize, temperature: &[f64]) -> f64 {
        let [a, b] = self.mesh.elements()[e].nodes;
        let p = &self.params;
        p.diffusivity * (1.0 + p.temperature_coefficient * (element_mean(temperature, [a, b]) - p.reference_temperature))
    }

    fn species_lids(&self, e: usize, k: usize) -> [usize; 2] {
        let [a, b] = self.mesh.elements()[e].nodes;
        [
            self.layout.lid(Subproblem::ScalarTransport, a, k),
            self.layout.lid(Subproblem::ScalarTransport, b, k),
        ]
    }

    fn residual_and_jacobian(&self, states: &StateSlots) -> SstiResult<Evaluation> {
        let c = states.require(StateName::ScalarField, Subproblem::ScalarTransport)?;
        let u = states.require(StateName::Displacement, Subproblem::ScalarTransport)?;
        let temperature = states.require(StateName::Temperature, Subproblem::ScalarTransport)?;
        let n = c.len();
        let num_elements = self.mesh.num_elements();
        let dt = self.dt;

        assemble_elements(num_elements + self.num_interfaces(), (n, n), true, |e| {
            if e >= num_elements {
                return Ok(self.interface_flux(&self.mesh.interfaces()[e - num_elements], c, temperature));
            }
            let (length, j) = self.jacobian_determinant(e, u)?;
            let d = self.diffusivity(e, temperature);
            let capacity = 0.5 * length * j / dt;
            let k_diff = d / (j * length);
            let source = 0.5 * self.params.source * length * j;

            let mut contribution = ElementContribution::default();
            for k in 0..self.layout.num_scal() {
                let [la, lb] = self.species_lids(e, k);
                let flux = k_diff * (c[la] - c[lb]);
                contribution.residual.extend([
                    (la, capacity * (c[la] - self.history[la]) + flux - source),
                    (lb, capacity * (c[lb] - self.history[lb]) - flux - source),
                ]);
                contribution.matrix.extend([
                    (la, la, capacity + k_diff),
                    (la, lb, -k_diff),
                    (lb, la, -k_diff),
                    (lb, lb, capacity + k_diff),
                ]);
            }
            Ok(contribution)
        })
    }

    /// Exchange flux of one interface and its derivative w.r.t. concentrations
    fn interface_flux(&self, interface: &InterfaceCondition, c: &[f64], temperature: &[f64]) -> ElementContribution {
        let mut contribution = ElementContribution::default();
        let Some(kinetics) = self.kinetics else {
            return contribution;
        };
        let t_mean = 0.5 * (temperature[interface.master_node] + temperature[interface.slave_node]);
        let k_t = kinetics.rate_at(t_mean);
        for k in 0..self.layout.num_scal() {
            let m = self.layout.lid(Subproblem::ScalarTransport, interface.master_node, k);
            let s = self.layout.lid(Subproblem::ScalarTransport, interface.slave_node, k);
            let j = k_t * (c[m] - c[s]);
            contribution.residual.extend([(m, j), (s, -j)]);
            contribution.matrix.extend([(m, m, k_t), (m, s, -k_t), (s, m, -k_t), (s, s, k_t)]);
        }
        contribution
    }

    /// ∂r/∂u through J
    fn structure_coupling(&self, states: &StateSlots) -> SstiResult<Evaluation> {
        let c = states.require(StateName::ScalarField, Subproblem::ScalarTransport)?;
        let u = states.require(StateName::Displacement, Subproblem::ScalarTransport)?;
        let temperature = states.require(StateName::Temperature, Subproblem::ScalarTransport)?;
        let shape = (c.len(), u.len());
        let dt = self.dt;

        assemble_elements(self.mesh.num_elements(), shape, false, |e| {
            let [a, b] = self.mesh.elements()[e].nodes;
            let (length, j) = self.jacobian_determinant(e, u)?;
            let d = self.diffusivity(e, temperature);
            let dj = [-1.0 / length, 1.0 / length];

            let mut matrix = Vec::with_capacity(4 * self.layout.num_scal());
            for k in 0..self.layout.num_scal() {
                let [la, lb] = self.species_lids(e, k);
                let dflux = -d / (j * j * length) * (c[la] - c[lb]);
                let dsource = 0.5 * self.params.source * length;
                let dr_a = 0.5 * length * (c[la] - self.history[la]) / dt + dflux - dsource;
                let dr_b = 0.5 * length * (c[lb] - self.history[lb]) / dt - dflux - dsource;
                for (node, dj_du) in [a, b].into_iter().zip(dj) {
                    matrix.push((la, node, dr_a * dj_du));
                    matrix.push((lb, node, dr_b * dj_du));
                }
            }
            Ok(ElementContribution { residual: Vec::new(), matrix })
        })
    }

    /// ∂r/∂T through the diffusivity
    fn thermo_coupling(&self, states: &StateSlots) -> SstiResult<Evaluation> {
        if self.params.temperature_coefficient == 0.0 {
            return Ok(Evaluation::default());
        }
        let c = states.require(StateName::ScalarField, Subproblem::ScalarTransport)?;
        let u = states.require(StateName::Displacement, Subproblem::ScalarTransport)?;
        let temperature = states.require(StateName::Temperature, Subproblem::ScalarTransport)?;
        let shape = (c.len(), temperature.len());
        let dd = 0.5 * self.params.diffusivity * self.params.temperature_coefficient;

        assemble_elements(self.mesh.num_elements(), shape, false, |e| {
            let [a, b] = self.mesh.elements()[e].nodes;
            let (length, j) = self.jacobian_determinant(e, u)?;
            let mut matrix = Vec::with_capacity(4 * self.layout.num_scal());
            for k in 0..self.layout.num_scal() {
                let [la, lb] = self.species_lids(e, k);
                let dflux = dd / (j * length) * (c[la] - c[lb]);
                for node in [a, b] {
                    let col = self.layout.lid(Subproblem::Thermo, node, 0);
                    matrix.push((la, col, dflux));
                    matrix.push((lb, col, -dflux));
                }
            }
            Ok(ElementContribution { residual: Vec::new(), matrix })
        })
    }

    /// ∂r/∂T of the exchange flux, from the interface temperature views
    fn interface_thermo_coupling(&self, states: &StateSlots) -> SstiResult<Evaluation> {
        let kinetics = match self.kinetics {
            Some(k) if k.temperature_coefficient != 0.0 => k,
            _ => return Ok(Evaluation::default()),
        };
        let c = states.require(StateName::ScalarField, Subproblem::ScalarTransport)?;
        let master_temperature = states.require(StateName::MasterTemperature, Subproblem::ScalarTransport)?;
        let slave_temperature = states.require(StateName::SlaveTemperature, Subproblem::ScalarTransport)?;
        let shape = (c.len(), master_temperature.len());
        let dk = kinetics.rate_derivative();

        assemble_elements(self.mesh.interfaces().len(), shape, false, |i| {
            let interface = &self.mesh.interfaces()[i];
            let col_m = self.layout.lid(Subproblem::Thermo, interface.master_node, 0);
            let col_s = self.layout.lid(Subproblem::Thermo, interface.slave_node, 0);
            // both views carry the interface value at the slave lid
            if !master_temperature[col_s].is_finite() || !slave_temperature[col_s].is_finite() {
                return Err(SstiError::assembly_at_gid(
                    Some(Subproblem::ScalarTransport),
                    self.layout.map(Subproblem::Thermo).gid(col_s),
                    "non-finite interface temperature",
                ));
            }
            let mut matrix = Vec::with_capacity(4 * self.layout.num_scal());
            for k in 0..self.layout.num_scal() {
                let m = self.layout.lid(Subproblem::ScalarTransport, interface.master_node, k);
                let s = self.layout.lid(Subproblem::ScalarTransport, interface.slave_node, k);
                let dj = dk * (c[m] - c[s]);
                matrix.extend([(m, col_m, dj), (m, col_s, dj), (s, col_m, -dj), (s, col_s, -dj)]);
            }
            Ok(ElementContribution { residual: Vec::new(), matrix })
        })
    }
}

impl DiscretizationEvaluator for ScalarTransportDiscretization {
    fn field(&self) -> Subproblem {
        Subproblem::ScalarTransport
    }

    fn evaluate(&self, action: Action, states: &StateSlots) -> SstiResult<Evaluation> {
        match action {
            Action::CalcResidualAndJacobian => self.residual_and_jacobian(states),
            Action::OffDiagonal { column: Subproblem::ScalarTransport, .. } => Err(SstiError::assembly(
                Some(Subproblem::ScalarTransport),
                "scatra-scatra is not an off-diagonal block",
            )),
            Action::OffDiagonal { column: Subproblem::Structure, contribution: Contribution::Domain } => {
                self.structure_coupling(states)
            }
            Action::OffDiagonal { column: Subproblem::Thermo, contribution: Contribution::Domain } => {
                self.thermo_coupling(states)
            }
            Action::OffDiagonal { column: Subproblem::Thermo, contribution: Contribution::Interface } => {
                self.interface_thermo_coupling(states)
            }
            // no area change across a point interface
            Action::OffDiagonal { column: Subproblem::Structure, contribution: Contribution::Interface } => {
                Ok(Evaluation::default())
            }
        }
    }

    fn condition_on(&self, name: &str) -> Vec<ElementFace> {
        if name == MESHTYING_CONDITION {
            self.mesh.interface_faces(&self.layout, Subproblem::ScalarTransport)
        } else {
            Vec::new()
        }
    }

    fn dof_row_map(&self, nodeset: usize) -> Option<&RowMap> {
        (nodeset < 3).then(|| self.layout.map(Subproblem::from_position(nodeset)))
    }
}

/// Scalar transport time integrator
///
/// An optional [`TimeStepController`] may change Δt at the start of a step;
/// the coupled driver then hands the new size to the other fields.
pub struct ScalarTransportField {
    disc: ScalarTransportDiscretization,
    state: TimeState,
    block_maps: Vec<RowMap>,
    controller: Option<Box<dyn TimeStepController>>,
    adapted: bool,
}

impl ScalarTransportField {
    pub fn new(
        mesh: Mesh1d,
        layout: DofLayout,
        params: ScatraParams,
        dirichlet: &[Dirichlet],
        kinetics: Option<InterfaceKinetics>,
    ) -> SstiResult<Self> {
        if !(params.diffusivity > 0.0) {
            return Err(SstiError::Config(format!("diffusivity must be positive, got {}", params.diffusivity)));
        }
        if let Some(k) = &kinetics {
            if k.rate < 0.0 {
                return Err(SstiError::Config(format!("interface rate must not be negative, got {}", k.rate)));
            }
        }
        let dbc = resolve_dirichlet(dirichlet, &layout, Subproblem::ScalarTransport)?;
        let map = layout.map(Subproblem::ScalarTransport).clone();
        let initial = vec![params.initial_concentration; map.len()];
        let state = TimeState::new(Subproblem::ScalarTransport, map, initial, dbc)?;
        let block_maps = if params.block_per_species { layout.species_maps()? } else { Vec::new() };
        Ok(Self {
            disc: ScalarTransportDiscretization::new(mesh, layout, params, kinetics),
            state,
            block_maps,
            controller: None,
            adapted: false,
        })
    }

    /// Let `controller` propose Δt at the start of every step
    pub fn with_controller(mut self, controller: impl TimeStepController + 'static) -> Self {
        self.controller = Some(Box::new(controller));
        self
    }

    fn sync_history(&mut self) {
        self.disc.set_history(&self.state.u_n, self.state.dt);
    }
}

impl FieldIntegrator for ScalarTransportField {
    fn kind(&self) -> Subproblem {
        Subproblem::ScalarTransport
    }

    fn setup(&mut self) -> SstiResult<()> {
        self.state.apply_dirichlet();
        self.state.update();
        self.sync_history();
        Ok(())
    }

    /// Stationary transport at the initial displacement and temperature
    fn calc_initial_field(&mut self, equilibration: EquilibrationMethod) -> SstiResult<()> {
        // no capacity term
        self.disc.set_history(&self.state.u_n, f64::INFINITY);
        let disc = &self.disc;
        let result = self.state.solve_stationary(StateName::ScalarField, equilibration, |slots| {
            disc.evaluate(Action::CalcResidualAndJacobian, slots)
        });
        if result.is_ok() {
            self.state.update();
        } else {
            self.state.reset();
        }
        self.sync_history();
        let solves = result?;
        info!("scatra: consistent initial state after {} linear solves", solves);
        Ok(())
    }

    fn prepare_time_step(&mut self) -> SstiResult<()> {
        self.adapted = false;
        if let Some(controller) = self.controller.as_mut() {
            let (step, dt) = (self.state.step + 1, self.state.dt);
            if let Some(new_dt) = controller.propose_dt(step, self.state.time + dt, dt) {
                if !(new_dt > 0.0) || !new_dt.is_finite() {
                    return Err(SstiError::assembly(
                        Some(Subproblem::ScalarTransport),
                        format!("time step controller proposed dt = {}", new_dt),
                    ));
                }
                debug!("scatra: step {} dt {:.4e} -> {:.4e}", step, dt, new_dt);
                self.state.dt = new_dt;
                self.adapted = new_dt != dt;
            }
        }
        self.state.advance();
        self.sync_history();
        Ok(())
    }

    fn time_step_adapted(&self) -> bool {
        self.adapted
    }

    fn time(&self) -> f64 {
        self.state.time
    }

    fn dt(&self) -> f64 {
        self.state.dt
    }

    fn step(&self) -> usize {
        self.state.step
    }

    fn set_dt(&mut self, dt: f64) {
        self.state.dt = dt;
        self.sync_history();
    }

    fn set_time_step(&mut self, time: f64, step: usize) {
        self.state.time = time;
        self.state.step = step;
    }

    fn dof_row_map(&self) -> &RowMap {
        &self.state.map
    }

    fn dof_block_maps(&self) -> Vec<RowMap> {
        self.block_maps.clone()
    }

    fn matrix_type(&self) -> FieldMatrixType {
        if self.disc.params().block_per_species {
            FieldMatrixType::BlockPerSpecies
        } else {
            FieldMatrixType::Sparse
        }
    }

    fn dirichlet_dofs(&self) -> &[usize] {
        self.state.dirichlet_gids()
    }

    fn set_state(&mut self, name: StateName, values: &[f64]) {
        self.state.slots.set(name, values);
    }

    fn state_slots(&self) -> &StateSlots {
        &self.state.slots
    }

    fn discretization(&self) -> &dyn DiscretizationEvaluator {
        &self.disc
    }

    fn evaluate(&mut self) -> SstiResult<()> {
        self.sync_history();
        self.state.slots.set(StateName::ScalarField, &self.state.u_np);
        let evaluation = self.disc.evaluate(Action::CalcResidualAndJacobian, &self.state.slots)?;
        evaluation.check_finite(Subproblem::ScalarTransport, &self.state.map)?;
        self.state.store(evaluation)
    }

    fn residual(&self) -> &[f64] {
        &self.state.residual
    }

    fn system_matrix(&self) -> &sprs::CsMat<f64> {
        &self.state.matrix
    }

    fn state_np(&self) -> &[f64] {
        &self.state.u_np
    }

    fn state_n(&self) -> &[f64] {
        &self.state.u_n
    }

    fn update_iter(&mut self, increment: &[f64]) -> SstiResult<()> {
        self.state.update_iter(increment)
    }

    fn reset_step(&mut self) {
        self.state.reset();
        self.adapted = false;
    }

    fn update(&mut self) -> SstiResult<()> {
        self.state.update();
        self.sync_history();
        Ok(())
    }

    fn write_restart(&self) -> FieldRestart {
        let mut data = self.state.write_restart();
        data.history.insert("dt".to_string(), vec![self.state.dt]);
        data
    }

    fn read_restart(&mut self, data: &FieldRestart) -> SstiResult<()> {
        self.state.read_restart(data)?;
        self.adapted = false;
        self.sync_history();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn disc(gamma: f64, kinetics: Option<InterfaceKinetics>) -> ScalarTransportDiscretization {
        let mesh = Mesh1d::two_blocks(2, 1, 0.5, 1.0);
        let layout = DofLayout::new(mesh.num_nodes(), 2);
        let params = ScatraParams { temperature_coefficient: gamma, source: 0.3, ..Default::default() };
        let mut d = ScalarTransportDiscretization::new(mesh, layout, params, kinetics);
        let n = d.history.len();
        d.set_history(&vec![0.1; n], 0.2);
        d
    }

    fn states(d: &ScalarTransportDiscretization) -> StateSlots {
        let nodes = d.layout.num_nodes();
        let n = d.history.len();
        let mut s = StateSlots::new();
        s.set(StateName::ScalarField, &(0..n).map(|i| 0.2 + 0.05 * i as f64).collect::<Vec<_>>());
        s.set(StateName::Displacement, &(0..nodes).map(|i| 0.01 * i as f64).collect::<Vec<_>>());
        s.set(StateName::Temperature, &(0..nodes).map(|i| 1.0 + 0.5 * i as f64).collect::<Vec<_>>());
        s
    }

    fn residual(d: &ScalarTransportDiscretization, s: &StateSlots) -> Vec<f64> {
        d.evaluate(Action::CalcResidualAndJacobian, s).unwrap().residual.unwrap()
    }

    /// Compare column `col` of a block with a forward difference in `name`
    fn check_column(d: &ScalarTransportDiscretization, block: &sprs::CsMat<f64>, name: StateName, col: usize) {
        let s = states(d);
        let base = residual(d, &s);
        let h = 1e-7;
        let mut perturbed = s.clone();
        let mut values = s.get(name).unwrap().to_vec();
        values[col] += h;
        perturbed.set(name, &values);
        let shifted = residual(d, &perturbed);
        for row in 0..base.len() {
            let fd = (shifted[row] - base[row]) / h;
            let exact = block.get(row, col).copied().unwrap_or(0.0);
            assert_relative_eq!(fd, exact, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let d = disc(0.1, None);
        let k = d.evaluate(Action::CalcResidualAndJacobian, &states(&d)).unwrap().matrix.unwrap();
        for col in [0, 3, 5] {
            check_column(&d, &k, StateName::ScalarField, col);
        }
    }

    #[test]
    fn test_structure_block_matches_finite_difference() {
        let d = disc(0.1, None);
        let action = Action::OffDiagonal { column: Subproblem::Structure, contribution: Contribution::Domain };
        let block = d.evaluate(action, &states(&d)).unwrap().matrix.unwrap();
        for col in 0..d.layout.num_nodes() {
            check_column(&d, &block, StateName::Displacement, col);
        }
    }

    #[test]
    fn test_thermo_block_matches_finite_difference() {
        let d = disc(0.1, None);
        let action = Action::OffDiagonal { column: Subproblem::Thermo, contribution: Contribution::Domain };
        let block = d.evaluate(action, &states(&d)).unwrap().matrix.unwrap();
        for col in 0..d.layout.num_nodes() {
            check_column(&d, &block, StateName::Temperature, col);
        }
    }

    #[test]
    fn test_interface_flux_and_its_temperature_derivative() {
        let kinetics = InterfaceKinetics {
            rate: 2.0,
            temperature_coefficient: 0.2,
            reaction_heat: 0.0,
            conductance: 0.0,
            reference_temperature: 1.0,
        };
        let d = disc(0.0, Some(kinetics));
        let mut s = states(&d);
        let interface = d.mesh.interfaces()[0];
        let temperature = s.get(StateName::Temperature).unwrap().to_vec();
        let mut master_view = vec![0.0; temperature.len()];
        let mut slave_view = vec![0.0; temperature.len()];
        master_view[interface.slave_node] = temperature[interface.master_node];
        slave_view[interface.slave_node] = temperature[interface.slave_node];
        s.set(StateName::MasterTemperature, &master_view);
        s.set(StateName::SlaveTemperature, &slave_view);

        let action = Action::OffDiagonal { column: Subproblem::Thermo, contribution: Contribution::Interface };
        let block = d.evaluate(action, &s).unwrap().matrix.unwrap();
        let base = residual(&d, &s);
        let h = 1e-7;
        for node in [interface.master_node, interface.slave_node] {
            let mut t = temperature.clone();
            t[node] += h;
            let mut perturbed = s.clone();
            perturbed.set(StateName::Temperature, &t);
            let shifted = residual(&d, &perturbed);
            for row in 0..base.len() {
                let fd = (shifted[row] - base[row]) / h;
                assert_relative_eq!(fd, block.get(row, node).copied().unwrap_or(0.0), epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_interface_flux_conserves_mass() {
        let kinetics = InterfaceKinetics {
            rate: 1.0,
            temperature_coefficient: 0.0,
            reaction_heat: 0.0,
            conductance: 0.0,
            reference_temperature: 0.0,
        };
        let with = disc(0.0, Some(kinetics));
        let without = disc(0.0, None);
        let s = states(&with);
        let total: f64 = residual(&with, &s).iter().zip(residual(&without, &s)).map(|(a, b)| a - b).sum();
        assert_relative_eq!(total, 0.0, epsilon = 1e-14);
    }

    #[test]
    fn test_inverted_element_is_reported() {
        let d = disc(0.0, None);
        let mut s = states(&d);
        s.set(StateName::Displacement, &[0.0, -1.0, 0.0, 0.0, 0.0]);
        let err = d.evaluate(Action::CalcResidualAndJacobian, &s).unwrap_err();
        assert!(err.to_string().contains("inverted"));
    }

    #[test]
    fn test_controller_adapts_step() {
        let mesh = Mesh1d::uniform(2, 1.0);
        let layout = DofLayout::new(3, 1);
        let mut field = ScalarTransportField::new(mesh, layout, ScatraParams::default(), &[], None)
            .unwrap()
            .with_controller(|step: usize, _t: f64, dt: f64| (step == 2).then_some(dt * 0.5));
        field.setup().unwrap();
        field.set_dt(0.1);
        field.prepare_time_step().unwrap();
        assert!(!field.time_step_adapted());
        field.update().unwrap();
        field.prepare_time_step().unwrap();
        assert!(field.time_step_adapted());
        assert_relative_eq!(field.time(), 0.15, epsilon = 1e-14);
        assert_eq!(field.step(), 2);
    }

    fn initial_field(source: f64) -> ScalarTransportField {
        let mesh = Mesh1d::uniform(4, 1.0);
        let layout = DofLayout::new(5, 1);
        let params = ScatraParams { source, initial_concentration: 0.5, ..Default::default() };
        let dirichlet = [Dirichlet::fixed(&[0], 0, 1.0), Dirichlet::fixed(&[4], 0, 0.0)];
        let mut field = ScalarTransportField::new(mesh, layout, params, &dirichlet, None).unwrap();
        field.setup().unwrap();
        field.set_dt(0.1);
        field.set_state(StateName::Displacement, &[0.0; 5]);
        field.set_state(StateName::Temperature, &[0.0; 5]);
        field
    }

    #[test]
    fn test_initial_field_is_stationary_profile() {
        let mut field = initial_field(0.0);
        field.calc_initial_field(EquilibrationMethod::None).unwrap();
        for (i, &c) in field.state_n().iter().enumerate() {
            assert_relative_eq!(c, 1.0 - 0.25 * i as f64, epsilon = 1e-12);
        }
        assert_eq!(field.state_np(), field.state_n());

        // a step from the stationary state stays there
        field.prepare_time_step().unwrap();
        field.evaluate().unwrap();
        assert!(field.residual()[1..4].iter().all(|r| r.abs() < 1e-12));
    }

    #[test]
    fn test_scaled_initial_field_matches_unscaled() {
        let mut plain = initial_field(2.0);
        plain.calc_initial_field(EquilibrationMethod::None).unwrap();
        let mut scaled = initial_field(2.0);
        scaled.calc_initial_field(EquilibrationMethod::RowsAndColumnsMaxabs).unwrap();
        for (a, b) in plain.state_n().iter().zip(scaled.state_n()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
        // the source lifts the interior above the linear profile
        assert!(plain.state_n()[2] > 0.5 + 1e-3);
    }

    #[test]
    fn test_initial_field_without_dirichlet_fails() {
        let mesh = Mesh1d::uniform(2, 1.0);
        let layout = DofLayout::new(3, 1);
        let params = ScatraParams { source: 1.0, ..Default::default() };
        let mut field = ScalarTransportField::new(mesh, layout, params, &[], None).unwrap();
        field.setup().unwrap();
        field.set_state(StateName::Displacement, &[0.0; 3]);
        field.set_state(StateName::Temperature, &[0.0; 3]);
        let err = field.calc_initial_field(EquilibrationMethod::None).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(field.state_n(), &[0.0; 3]);
    }

    #[test]
    fn test_block_per_species_maps() {
        let mesh = Mesh1d::uniform(2, 1.0);
        let layout = DofLayout::new(3, 2);
        let params = ScatraParams { block_per_species: true, ..Default::default() };
        let field = ScalarTransportField::new(mesh, layout, params, &[], None).unwrap();
        assert_eq!(field.matrix_type(), FieldMatrixType::BlockPerSpecies);
        let maps = field.dof_block_maps();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].gids(), &[3, 5, 7]);
    }
}
