//! Heat conduction on the deforming bar
//!
//! ```text
//! ρc J ∂T/∂t − ∂/∂X (k/J ∂T/∂X) = J q,   q = q0 + η Σ_k c_k
//! ```
//!
//! Mesh-tied interfaces conduct heat with a finite conductance `h` and
//! release the reaction heat of the species exchange on the slave side.

use serde::{Deserialize, Serialize};

use crate::error::{SstiError, SstiResult};
use crate::fem::{
    Action, Contribution, DiscretizationEvaluator, ElementFace, Evaluation, FieldIntegrator, RowMap, StateName,
    StateSlots, Subproblem, MESHTYING_CONDITION,
};
use crate::models::mesh1d::{resolve_dirichlet, Dirichlet, DofLayout, InterfaceCondition, Mesh1d};
use crate::models::scatra::InterfaceKinetics;
use crate::models::{assemble_elements, element_mean, ElementContribution, TimeState};
use crate::restart::FieldRestart;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermoParams {
    /// ρc
    #[serde(default = "default_one")]
    pub heat_capacity: f64,
    #[serde(default = "default_one")]
    pub conductivity: f64,
    /// q0
    #[serde(default)]
    pub heat_source: f64,
    /// η: heat per unit concentration
    #[serde(default)]
    pub reaction_heat: f64,
    #[serde(default)]
    pub initial_temperature: f64,
}

fn default_one() -> f64 { 1.0 }

impl Default for ThermoParams {
    fn default() -> Self {
        Self {
            heat_capacity: 1.0,
            conductivity: 1.0,
            heat_source: 0.0,
            reaction_heat: 0.0,
            initial_temperature: 0.0,
        }
    }
}

/// Element and interface loop of the thermo field
#[derive(Debug, Clone)]
pub struct ThermoDiscretization {
    mesh: Mesh1d,
    layout: DofLayout,
    params: ThermoParams,
    kinetics: Option<InterfaceKinetics>,
    history: Vec<f64>,
    dt: f64,
}

impl ThermoDiscretization {
    pub fn new(mesh: Mesh1d, layout: DofLayout, params: ThermoParams, kinetics: Option<InterfaceKinetics>) -> Self {
        let n = layout.map(Subproblem::Thermo).len();
        Self { mesh, layout, params, kinetics, history: vec![0.0; n], dt: 1.0 }
    }

    /// Install T_n and Δt of the current step
    pub fn set_history(&mut self, t_n: &[f64], dt: f64) {
        self.history.copy_from_slice(t_n);
        self.dt = dt;
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
                Some(Subproblem::Thermo),
                self.layout.map(Subproblem::Structure).gid(a),
                format!("element {} is inverted (J = {:.3e})", e, j),
            ));
        }
        Ok((length, j))
    }

    /// q of element `e`
    fn heat_source(&self, e: usize, c: &[f64]) -> f64 {
        let [a, b] = self.mesh.elements()[e].nodes;
        let concentration: f64 = (0..self.layout.num_scal())
            .map(|k| {
                element_mean(
                    c,
                    [
                        self.layout.lid(Subproblem::ScalarTransport, a, k),
                        self.layout.lid(Subproblem::ScalarTransport, b, k),
                    ],
                )
            })
            .sum();
        self.params.heat_source + self.params.reaction_heat * concentration
    }

    fn residual_and_jacobian(&self, states: &StateSlots) -> SstiResult<Evaluation> {
        let t = states.require(StateName::Temperature, Subproblem::Thermo)?;
        let u = states.require(StateName::Displacement, Subproblem::Thermo)?;
        let c = states.require(StateName::ScalarField, Subproblem::Thermo)?;
        let n = t.len();
        let num_elements = self.mesh.num_elements();
        let p = &self.params;
        let dt = self.dt;

        assemble_elements(num_elements + self.num_interfaces(), (n, n), true, |e| {
            if e >= num_elements {
                return Ok(self.interface_heat(&self.mesh.interfaces()[e - num_elements], t, c));
            }
            let [a, b] = self.mesh.elements()[e].nodes;
            let (length, j) = self.jacobian_determinant(e, u)?;
            let capacity = 0.5 * p.heat_capacity * length * j / dt;
            let k_cond = p.conductivity / (j * length);
            let source = 0.5 * self.heat_source(e, c) * length * j;
            let flux = k_cond * (t[a] - t[b]);
            Ok(ElementContribution {
                residual: vec![
                    (a, capacity * (t[a] - self.history[a]) + flux - source),
                    (b, capacity * (t[b] - self.history[b]) - flux - source),
                ],
                matrix: vec![
                    (a, a, capacity + k_cond),
                    (a, b, -k_cond),
                    (b, a, -k_cond),
                    (b, b, capacity + k_cond),
                ],
            })
        })
    }

    /// Conductance and reaction heat of one interface
    fn interface_heat(&self, interface: &InterfaceCondition, t: &[f64], c: &[f64]) -> ElementContribution {
        let mut contribution = ElementContribution::default();
        let Some(kinetics) = self.kinetics else {
            return contribution;
        };
        let (m, s) = (interface.master_node, interface.slave_node);
        let h = kinetics.conductance;
        let q = h * (t[m] - t[s]);
        contribution.residual.extend([(m, q), (s, -q)]);
        contribution.matrix.extend([(m, m, h), (m, s, -h), (s, m, -h), (s, s, h)]);

        if kinetics.reaction_heat != 0.0 {
            let k_t = kinetics.rate_at(0.5 * (t[m] + t[s]));
            let jump: f64 = (0..self.layout.num_scal())
                .map(|k| {
                    c[self.layout.lid(Subproblem::ScalarTransport, m, k)]
                        - c[self.layout.lid(Subproblem::ScalarTransport, s, k)]
                })
                .sum();
            let heat = kinetics.reaction_heat * k_t * jump;
            let dheat = kinetics.reaction_heat * kinetics.rate_derivative() * jump;
            contribution.residual.push((s, -heat));
            contribution.matrix.extend([(s, m, -dheat), (s, s, -dheat)]);
        }
        contribution
    }

    /// ∂r/∂u through J
    fn structure_coupling(&self, states: &StateSlots) -> SstiResult<Evaluation> {
        let t = states.require(StateName::Temperature, Subproblem::Thermo)?;
        let u = states.require(StateName::Displacement, Subproblem::Thermo)?;
        let c = states.require(StateName::ScalarField, Subproblem::Thermo)?;
        let p = &self.params;
        let dt = self.dt;

        assemble_elements(self.mesh.num_elements(), (t.len(), u.len()), false, |e| {
            let [a, b] = self.mesh.elements()[e].nodes;
            let (length, j) = self.jacobian_determinant(e, u)?;
            let dflux = -p.conductivity / (j * j * length) * (t[a] - t[b]);
            let dsource = 0.5 * self.heat_source(e, c) * length;
            let dr_a = 0.5 * p.heat_capacity * length * (t[a] - self.history[a]) / dt + dflux - dsource;
            let dr_b = 0.5 * p.heat_capacity * length * (t[b] - self.history[b]) / dt - dflux - dsource;
            let dj = [-1.0 / length, 1.0 / length];
            let matrix = [a, b]
                .into_iter()
                .zip(dj)
                .flat_map(|(node, dj_du)| [(a, node, dr_a * dj_du), (b, node, dr_b * dj_du)])
                .collect();
            Ok(ElementContribution { residual: Vec::new(), matrix })
        })
    }

    /// ∂r/∂c through the reaction heat source
    fn scatra_coupling(&self, states: &StateSlots) -> SstiResult<Evaluation> {
        if self.params.reaction_heat == 0.0 {
            return Ok(Evaluation::default());
        }
        let t = states.require(StateName::Temperature, Subproblem::Thermo)?;
        let u = states.require(StateName::Displacement, Subproblem::Thermo)?;
        let c = states.require(StateName::ScalarField, Subproblem::Thermo)?;
        let eta = self.params.reaction_heat;

        assemble_elements(self.mesh.num_elements(), (t.len(), c.len()), false, |e| {
            let [a, b] = self.mesh.elements()[e].nodes;
            let (length, j) = self.jacobian_determinant(e, u)?;
            // r_i -= (L J / 2) q, ∂q/∂c_node,k = η / 2
            let d = -0.25 * eta * length * j;
            let mut matrix = Vec::with_capacity(4 * self.layout.num_scal());
            for node in [a, b] {
                for k in 0..self.layout.num_scal() {
                    let col = self.layout.lid(Subproblem::ScalarTransport, node, k);
                    matrix.push((a, col, d));
                    matrix.push((b, col, d));
                }
            }
            Ok(ElementContribution { residual: Vec::new(), matrix })
        })
    }

    /// ∂r/∂c of the interface reaction heat, from the master-side scalar view
    fn interface_scatra_coupling(&self, states: &StateSlots) -> SstiResult<Evaluation> {
        let kinetics = match self.kinetics {
            Some(k) if k.reaction_heat != 0.0 => k,
            _ => return Ok(Evaluation::default()),
        };
        let t = states.require(StateName::Temperature, Subproblem::Thermo)?;
        let master_scalars = states.require(StateName::MasterScalar, Subproblem::Thermo)?;
        let shape = (t.len(), master_scalars.len());

        assemble_elements(self.mesh.interfaces().len(), shape, false, |i| {
            let interface = &self.mesh.interfaces()[i];
            let (m, s) = (interface.master_node, interface.slave_node);
            let slave_lid = self.layout.lid(Subproblem::ScalarTransport, s, 0);
            // the master values sit at the slave lids of the view
            if !master_scalars[slave_lid].is_finite() {
                return Err(SstiError::assembly_at_gid(
                    Some(Subproblem::Thermo),
                    self.layout.map(Subproblem::ScalarTransport).gid(slave_lid),
                    "non-finite master-side concentration",
                ));
            }
            let d = kinetics.reaction_heat * kinetics.rate_at(0.5 * (t[m] + t[s]));
            let mut matrix = Vec::with_capacity(2 * self.layout.num_scal());
            for k in 0..self.layout.num_scal() {
                matrix.push((s, self.layout.lid(Subproblem::ScalarTransport, m, k), -d));
                matrix.push((s, self.layout.lid(Subproblem::ScalarTransport, s, k), d));
            }
            Ok(ElementContribution { residual: Vec::new(), matrix })
        })
    }
}

impl DiscretizationEvaluator for ThermoDiscretization {
    fn field(&self) -> Subproblem {
        Subproblem::Thermo
    }

    fn evaluate(&self, action: Action, states: &StateSlots) -> SstiResult<Evaluation> {
        match action {
            Action::CalcResidualAndJacobian => self.residual_and_jacobian(states),
            Action::OffDiagonal { column: Subproblem::Thermo, .. } => {
                Err(SstiError::assembly(Some(Subproblem::Thermo), "thermo-thermo is not an off-diagonal block"))
            }
            Action::OffDiagonal { column: Subproblem::Structure, contribution: Contribution::Domain } => {
                self.structure_coupling(states)
            }
            Action::OffDiagonal { column: Subproblem::ScalarTransport, contribution: Contribution::Domain } => {
                self.scatra_coupling(states)
            }
            Action::OffDiagonal { column: Subproblem::ScalarTransport, contribution: Contribution::Interface } => {
                self.interface_scatra_coupling(states)
            }
            Action::OffDiagonal { column: Subproblem::Structure, contribution: Contribution::Interface } => {
                Ok(Evaluation::default())
            }
        }
    }

    fn condition_on(&self, name: &str) -> Vec<ElementFace> {
        if name == MESHTYING_CONDITION {
            self.mesh.interface_faces(&self.layout, Subproblem::Thermo)
        } else {
            Vec::new()
        }
    }

    fn dof_row_map(&self, nodeset: usize) -> Option<&RowMap> {
        (nodeset < 3).then(|| self.layout.map(Subproblem::from_position(nodeset)))
    }
}

/// Thermo time integrator
pub struct ThermoField {
    disc: ThermoDiscretization,
    state: TimeState,
}

impl ThermoField {
    pub fn new(
        mesh: Mesh1d,
        layout: DofLayout,
        params: ThermoParams,
        dirichlet: &[Dirichlet],
        kinetics: Option<InterfaceKinetics>,
    ) -> SstiResult<Self> {
        if !(params.conductivity > 0.0) || !(params.heat_capacity > 0.0) {
            return Err(SstiError::Config(format!(
                "conductivity and heat capacity must be positive, got {} and {}",
                params.conductivity, params.heat_capacity
            )));
        }
        let dbc = resolve_dirichlet(dirichlet, &layout, Subproblem::Thermo)?;
        let map = layout.map(Subproblem::Thermo).clone();
        let initial = vec![params.initial_temperature; map.len()];
        let state = TimeState::new(Subproblem::Thermo, map, initial, dbc)?;
        Ok(Self {
            disc: ThermoDiscretization::new(mesh, layout, params, kinetics),
            state,
        })
    }

    fn sync_history(&mut self) {
        self.disc.set_history(&self.state.u_n, self.state.dt);
    }
}

impl FieldIntegrator for ThermoField {
    fn kind(&self) -> Subproblem {
        Subproblem::Thermo
    }

    fn setup(&mut self) -> SstiResult<()> {
        self.state.apply_dirichlet();
        self.state.update();
        self.sync_history();
        Ok(())
    }

    fn prepare_time_step(&mut self) -> SstiResult<()> {
        self.state.advance();
        self.sync_history();
        Ok(())
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
        self.state.slots.set(StateName::Temperature, &self.state.u_np);
        let evaluation = self.disc.evaluate(Action::CalcResidualAndJacobian, &self.state.slots)?;
        evaluation.check_finite(Subproblem::Thermo, &self.state.map)?;
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
    }

    fn update(&mut self) -> SstiResult<()> {
        self.state.update();
        self.sync_history();
        Ok(())
    }

    fn write_restart(&self) -> FieldRestart {
        self.state.write_restart()
    }

    fn read_restart(&mut self, data: &FieldRestart) -> SstiResult<()> {
        self.state.read_restart(data)?;
        self.sync_history();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn kinetics() -> InterfaceKinetics {
        InterfaceKinetics {
            rate: 1.5,
            temperature_coefficient: 0.3,
            reaction_heat: 0.7,
            conductance: 4.0,
            reference_temperature: 1.0,
        }
    }

    fn disc(eta: f64) -> ThermoDiscretization {
        let mesh = Mesh1d::two_blocks(2, 2, 0.4, 1.0);
        let layout = DofLayout::new(mesh.num_nodes(), 1);
        let params = ThermoParams { heat_source: 0.2, reaction_heat: eta, ..Default::default() };
        let mut d = ThermoDiscretization::new(mesh, layout, params, Some(kinetics()));
        let n = d.history.len();
        d.set_history(&vec![1.0; n], 0.1);
        d
    }

    fn states(d: &ThermoDiscretization) -> StateSlots {
        let n = d.layout.num_nodes();
        let interface = d.mesh.interfaces()[0];
        let c: Vec<f64> = (0..n).map(|i| 0.5 + 0.1 * i as f64).collect();
        let mut master_view = vec![0.0; n];
        master_view[interface.slave_node] = c[interface.master_node];
        let mut s = StateSlots::new();
        s.set(StateName::Temperature, &(0..n).map(|i| 1.0 + 0.2 * i as f64).collect::<Vec<_>>());
        s.set(StateName::Displacement, &(0..n).map(|i| -0.02 * i as f64).collect::<Vec<_>>());
        s.set(StateName::ScalarField, &c);
        s.set(StateName::MasterScalar, &master_view);
        s
    }

    fn residual(d: &ThermoDiscretization, s: &StateSlots) -> Vec<f64> {
        d.evaluate(Action::CalcResidualAndJacobian, s).unwrap().residual.unwrap()
    }

    fn check_block(d: &ThermoDiscretization, block: &sprs::CsMat<f64>, name: StateName) {
        let s = states(d);
        let base = residual(d, &s);
        let h = 1e-8;
        for col in 0..s.get(name).unwrap().len() {
            let mut values = s.get(name).unwrap().to_vec();
            values[col] += h;
            let mut perturbed = s.clone();
            perturbed.set(name, &values);
            let shifted = residual(d, &perturbed);
            for row in 0..base.len() {
                let fd = (shifted[row] - base[row]) / h;
                assert_relative_eq!(fd, block.get(row, col).copied().unwrap_or(0.0), epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let d = disc(0.4);
        let k = d.evaluate(Action::CalcResidualAndJacobian, &states(&d)).unwrap().matrix.unwrap();
        check_block(&d, &k, StateName::Temperature);
    }

    #[test]
    fn test_structure_block_matches_finite_difference() {
        let d = disc(0.4);
        let action = Action::OffDiagonal { column: Subproblem::Structure, contribution: Contribution::Domain };
        let block = d.evaluate(action, &states(&d)).unwrap().matrix.unwrap();
        check_block(&d, &block, StateName::Displacement);
    }

    #[test]
    fn test_domain_and_interface_scatra_blocks_sum_to_full_derivative() {
        let d = disc(0.4);
        let s = states(&d);
        let domain = d
            .evaluate(Action::OffDiagonal { column: Subproblem::ScalarTransport, contribution: Contribution::Domain }, &s)
            .unwrap()
            .matrix
            .unwrap();
        let interface = d
            .evaluate(
                Action::OffDiagonal { column: Subproblem::ScalarTransport, contribution: Contribution::Interface },
                &s,
            )
            .unwrap()
            .matrix
            .unwrap();
        let total = &domain + &interface;
        check_block(&d, &total, StateName::ScalarField);
    }

    #[test]
    fn test_interface_block_requires_master_view() {
        let d = disc(0.0);
        let mut s = StateSlots::new();
        s.set(StateName::Temperature, &[1.0; 6]);
        let action = Action::OffDiagonal { column: Subproblem::ScalarTransport, contribution: Contribution::Interface };
        let err = d.evaluate(action, &s).unwrap_err();
        assert!(err.to_string().contains("imasterscatra"));
    }

    #[test]
    fn test_no_reaction_heat_gives_empty_domain_block() {
        let d = disc(0.0);
        let action = Action::OffDiagonal { column: Subproblem::ScalarTransport, contribution: Contribution::Domain };
        assert!(d.evaluate(action, &states(&d)).unwrap().matrix.is_none());
    }

    #[test]
    fn test_conduction_reaches_linear_profile() {
        let mesh = Mesh1d::uniform(4, 1.0);
        let layout = DofLayout::new(5, 1);
        let dbc = [Dirichlet::fixed(&[0], 0, 0.0), Dirichlet::fixed(&[4], 0, 1.0)];
        let mut field = ThermoField::new(mesh, layout, ThermoParams::default(), &dbc, None).unwrap();
        field.setup().unwrap();
        field.set_dt(1e8);
        field.prepare_time_step().unwrap();
        field.set_state(StateName::Displacement, &[0.0; 5]);
        field.set_state(StateName::ScalarField, &[0.0; 5]);
        field.evaluate().unwrap();
        // one Newton step on the free dofs of a linear problem
        let k = field.system_matrix().to_dense();
        let r = field.residual().to_vec();
        let free = [1, 2, 3];
        let a = nalgebra::DMatrix::from_fn(3, 3, |i, j| k[[free[i], free[j]]]);
        let b = nalgebra::DVector::from_fn(3, |i, _| -r[free[i]]);
        let du = a.lu().solve(&b).unwrap();
        let mut increment = vec![0.0; 5];
        for (i, &lid) in free.iter().enumerate() {
            increment[lid] = du[i];
        }
        field.update_iter(&increment).unwrap();
        for (node, &t) in field.state_np().iter().enumerate() {
            assert_relative_eq!(t, 0.25 * node as f64, epsilon = 1e-6);
        }
    }
}
