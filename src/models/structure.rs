//! Quasi-static bar with thermal and chemical expansion
//!
//! ```text
//! σ = E (ε − α (T − T_ref) − β Σ_k (c_k − c_ref)),   ε = du/dX
//! r = ∫ σ A dw/dX dX − F
//! ```
//!
//! Temperature and concentrations enter through element means. The
//! interface is not integrated here: matching-node mesh-tying condenses the
//! slave rows in the system matrix.

use serde::{Deserialize, Serialize};

use crate::error::{SstiError, SstiResult};
use crate::fem::{
    Action, Contribution, DiscretizationEvaluator, ElementFace, Evaluation, FieldIntegrator, RowMap, StateName,
    StateSlots, Subproblem, MESHTYING_CONDITION,
};
use crate::models::mesh1d::{resolve_dirichlet, Dirichlet, DofLayout, Mesh1d};
use crate::models::{assemble_elements, element_mean, ElementContribution, TimeState};
use crate::restart::FieldRestart;

/// Material of the bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureParams {
    #[serde(default = "default_one")]
    pub youngs_modulus: f64,
    #[serde(default = "default_one")]
    pub area: f64,
    /// α
    #[serde(default)]
    pub thermal_expansion: f64,
    /// β, per species
    #[serde(default)]
    pub chemical_expansion: f64,
    #[serde(default)]
    pub reference_temperature: f64,
    #[serde(default)]
    pub reference_concentration: f64,
}

fn default_one() -> f64 { 1.0 }

impl Default for StructureParams {
    fn default() -> Self {
        Self {
            youngs_modulus: 1.0,
            area: 1.0,
            thermal_expansion: 0.0,
            chemical_expansion: 0.0,
            reference_temperature: 0.0,
            reference_concentration: 0.0,
        }
    }
}

/// Axial point load on a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLoad {
    pub node: usize,
    pub value: f64,
}

/// Element loop of the bar
#[derive(Debug, Clone)]
pub struct StructureDiscretization {
    mesh: Mesh1d,
    layout: DofLayout,
    params: StructureParams,
    loads: Vec<PointLoad>,
}

impl StructureDiscretization {
    pub fn new(mesh: Mesh1d, layout: DofLayout, params: StructureParams, loads: Vec<PointLoad>) -> Self {
        Self { mesh, layout, params, loads }
    }

    pub fn mesh(&self) -> &Mesh1d {
        &self.mesh
    }

    pub fn params(&self) -> &StructureParams {
        &self.params
    }

    /// Axial stress of element `e`
    fn stress(&self, e: usize, u: &[f64], temperature: &[f64], scalars: &[f64]) -> f64 {
        let p = &self.params;
        let [a, b] = self.mesh.elements()[e].nodes;
        let strain = (u[b] - u[a]) / self.mesh.element_length(e);
        let dtemp = element_mean(temperature, [a, b]) - p.reference_temperature;
        let dconc: f64 = (0..self.layout.num_scal())
            .map(|k| {
                let lids = [
                    self.layout.lid(Subproblem::ScalarTransport, a, k),
                    self.layout.lid(Subproblem::ScalarTransport, b, k),
                ];
                element_mean(scalars, lids) - p.reference_concentration
            })
            .sum();
        p.youngs_modulus * (strain - p.thermal_expansion * dtemp - p.chemical_expansion * dconc)
    }

    /// Element stresses for the given states
    pub fn element_stresses(&self, states: &StateSlots) -> SstiResult<Vec<f64>> {
        let u = states.require(StateName::Displacement, Subproblem::Structure)?;
        let temperature = states.require(StateName::Temperature, Subproblem::Structure)?;
        let scalars = states.require(StateName::ScalarField, Subproblem::Structure)?;
        Ok((0..self.mesh.num_elements())
            .map(|e| self.stress(e, u, temperature, scalars))
            .collect())
    }

    fn residual_and_jacobian(&self, states: &StateSlots) -> SstiResult<Evaluation> {
        let u = states.require(StateName::Displacement, Subproblem::Structure)?;
        let temperature = states.require(StateName::Temperature, Subproblem::Structure)?;
        let scalars = states.require(StateName::ScalarField, Subproblem::Structure)?;
        let n = self.layout.map(Subproblem::Structure).len();
        let (e_mod, area) = (self.params.youngs_modulus, self.params.area);

        let mut evaluation = assemble_elements(self.mesh.num_elements(), (n, n), true, |e| {
            let [a, b] = self.mesh.elements()[e].nodes;
            let length = self.mesh.element_length(e);
            if !(length > 0.0) {
                return Err(SstiError::assembly_at_gid(
                    Some(Subproblem::Structure),
                    self.layout.map(Subproblem::Structure).gid(a),
                    format!("element {} has non-positive length", e),
                ));
            }
            let force = self.stress(e, u, temperature, scalars) * area;
            let k = e_mod * area / length;
            Ok(ElementContribution {
                residual: vec![(a, -force), (b, force)],
                matrix: vec![(a, a, k), (a, b, -k), (b, a, -k), (b, b, k)],
            })
        })?;

        if let Some(residual) = evaluation.residual.as_mut() {
            for load in &self.loads {
                residual[self.layout.lid(Subproblem::Structure, load.node, 0)] -= load.value;
            }
        }
        Ok(evaluation)
    }

    /// ∂r/∂T or ∂r/∂c: both enter σ through an element mean
    fn expansion_coupling(&self, column: Subproblem, states: &StateSlots) -> SstiResult<Evaluation> {
        let coefficient = match column {
            Subproblem::Thermo => self.params.thermal_expansion,
            Subproblem::ScalarTransport => self.params.chemical_expansion,
            Subproblem::Structure => {
                return Err(SstiError::assembly(Some(Subproblem::Structure), "structure-structure is not an off-diagonal block"))
            }
        };
        // the material carries no such derivative
        if coefficient == 0.0 {
            return Ok(Evaluation::default());
        }
        // the linearisation point must be installed even though the block is constant
        states.require(column.state_name(), Subproblem::Structure)?;

        let n_rows = self.layout.map(Subproblem::Structure).len();
        let n_cols = self.layout.map(column).len();
        let d = 0.5 * self.params.youngs_modulus * coefficient * self.params.area;
        let per_node = self.layout.dofs_per_node(column);

        assemble_elements(self.mesh.num_elements(), (n_rows, n_cols), false, |e| {
            let [a, b] = self.mesh.elements()[e].nodes;
            let mut matrix = Vec::with_capacity(4 * per_node);
            for node in [a, b] {
                for k in 0..per_node {
                    let col = self.layout.lid(column, node, k);
                    // r_a = -σA, r_b = σA, ∂σ/∂(T|c)_node = -Eα/2
                    matrix.push((a, col, d));
                    matrix.push((b, col, -d));
                }
            }
            Ok(ElementContribution { residual: Vec::new(), matrix })
        })
    }
}

impl DiscretizationEvaluator for StructureDiscretization {
    fn field(&self) -> Subproblem {
        Subproblem::Structure
    }

    fn evaluate(&self, action: Action, states: &StateSlots) -> SstiResult<Evaluation> {
        match action {
            Action::CalcResidualAndJacobian => self.residual_and_jacobian(states),
            Action::OffDiagonal { column, contribution: Contribution::Domain } => {
                self.expansion_coupling(column, states)
            }
            Action::OffDiagonal { contribution: Contribution::Interface, .. } => Ok(Evaluation::default()),
        }
    }

    fn condition_on(&self, name: &str) -> Vec<ElementFace> {
        if name == MESHTYING_CONDITION {
            self.mesh.interface_faces(&self.layout, Subproblem::Structure)
        } else {
            Vec::new()
        }
    }

    fn dof_row_map(&self, nodeset: usize) -> Option<&RowMap> {
        (nodeset < 3).then(|| self.layout.map(Subproblem::from_position(nodeset)))
    }
}

/// Quasi-static structural time integrator
///
/// The velocity is the backward difference of the displacement.
pub struct StructureField {
    disc: StructureDiscretization,
    state: TimeState,
    velocity: Vec<f64>,
}

impl StructureField {
    pub fn new(
        mesh: Mesh1d,
        layout: DofLayout,
        params: StructureParams,
        dirichlet: &[Dirichlet],
        loads: Vec<PointLoad>,
    ) -> SstiResult<Self> {
        for load in &loads {
            if load.node >= mesh.num_nodes() {
                return Err(SstiError::Config(format!("point load on unknown node {}", load.node)));
            }
        }
        let dbc = resolve_dirichlet(dirichlet, &layout, Subproblem::Structure)?;
        let map = layout.map(Subproblem::Structure).clone();
        let n = map.len();
        let state = TimeState::new(Subproblem::Structure, map, vec![0.0; n], dbc)?;
        Ok(Self {
            disc: StructureDiscretization::new(mesh, layout, params, loads),
            state,
            velocity: vec![0.0; n],
        })
    }

    /// Stresses at the current iterate
    pub fn element_stresses(&self) -> SstiResult<Vec<f64>> {
        let mut states = self.state.slots.clone();
        states.set(StateName::Displacement, &self.state.u_np);
        self.disc.element_stresses(&states)
    }

    fn update_velocity(&mut self) {
        let dt = self.state.dt;
        for ((v, u_np), u_n) in self.velocity.iter_mut().zip(&self.state.u_np).zip(&self.state.u_n) {
            *v = (u_np - u_n) / dt;
        }
    }
}

impl FieldIntegrator for StructureField {
    fn kind(&self) -> Subproblem {
        Subproblem::Structure
    }

    fn setup(&mut self) -> SstiResult<()> {
        self.state.apply_dirichlet();
        self.state.update();
        Ok(())
    }

    fn prepare_time_step(&mut self) -> SstiResult<()> {
        self.state.advance();
        self.update_velocity();
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
        self.state.slots.set(StateName::Displacement, &self.state.u_np);
        let evaluation = self.disc.evaluate(Action::CalcResidualAndJacobian, &self.state.slots)?;
        evaluation.check_finite(Subproblem::Structure, &self.state.map)?;
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

    fn velocity_np(&self) -> Option<&[f64]> {
        Some(&self.velocity)
    }

    fn update_iter(&mut self, increment: &[f64]) -> SstiResult<()> {
        self.state.update_iter(increment)?;
        self.update_velocity();
        Ok(())
    }

    fn reset_step(&mut self) {
        self.state.reset();
        self.velocity.iter_mut().for_each(|v| *v = 0.0);
    }

    fn update(&mut self) -> SstiResult<()> {
        self.state.update();
        Ok(())
    }

    fn write_restart(&self) -> FieldRestart {
        let mut data = self.state.write_restart();
        data.velocity = Some(self.velocity.clone());
        data
    }

    fn read_restart(&mut self, data: &FieldRestart) -> SstiResult<()> {
        self.state.read_restart(data)?;
        match &data.velocity {
            Some(v) if v.len() == self.velocity.len() => self.velocity.copy_from_slice(v),
            Some(v) => {
                return Err(SstiError::Restart(format!(
                    "structure velocity has {} entries, dof row map {}",
                    v.len(),
                    self.velocity.len()
                )))
            }
            None => self.velocity.iter_mut().for_each(|v| *v = 0.0),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bar(alpha: f64) -> (StructureDiscretization, StateSlots) {
        let mesh = Mesh1d::uniform(2, 1.0);
        let layout = DofLayout::new(mesh.num_nodes(), 1);
        let params = StructureParams { youngs_modulus: 2.0, thermal_expansion: alpha, ..Default::default() };
        let disc = StructureDiscretization::new(mesh, layout, params, vec![PointLoad { node: 2, value: 1.0 }]);
        let mut states = StateSlots::new();
        states.set(StateName::Displacement, &[0.0, 0.25, 0.5]);
        states.set(StateName::Temperature, &[0.0; 3]);
        states.set(StateName::ScalarField, &[0.0; 3]);
        (disc, states)
    }

    #[test]
    fn test_equilibrium_residual_vanishes() {
        // σ = E ε = 2 * 0.5 = 1 balances the unit load
        let (disc, states) = bar(0.0);
        let evaluation = disc.evaluate(Action::CalcResidualAndJacobian, &states).unwrap();
        let r = evaluation.residual.unwrap();
        assert_relative_eq!(r[1], 0.0, epsilon = 1e-14);
        assert_relative_eq!(r[2], 0.0, epsilon = 1e-14);
        assert_relative_eq!(r[0], -1.0, epsilon = 1e-14);

        let k = evaluation.matrix.unwrap();
        assert_relative_eq!(*k.get(1, 1).unwrap(), 8.0);
        assert_relative_eq!(*k.get(1, 2).unwrap(), -4.0);
    }

    #[test]
    fn test_thermal_block_matches_finite_difference() {
        let (disc, mut states) = bar(1e-2);
        let base = disc.evaluate(Action::CalcResidualAndJacobian, &states).unwrap().residual.unwrap();
        let block = disc
            .evaluate(
                Action::OffDiagonal { column: Subproblem::Thermo, contribution: Contribution::Domain },
                &states,
            )
            .unwrap()
            .matrix
            .unwrap();

        let h = 1e-6;
        states.set(StateName::Temperature, &[0.0, h, 0.0]);
        let perturbed = disc.evaluate(Action::CalcResidualAndJacobian, &states).unwrap().residual.unwrap();
        for row in 0..3 {
            let fd = (perturbed[row] - base[row]) / h;
            let exact = block.get(row, 1).copied().unwrap_or(0.0);
            assert_relative_eq!(fd, exact, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_missing_derivative_is_zero_block() {
        let (disc, states) = bar(0.0);
        let evaluation = disc
            .evaluate(
                Action::OffDiagonal { column: Subproblem::ScalarTransport, contribution: Contribution::Domain },
                &states,
            )
            .unwrap();
        assert!(evaluation.matrix.is_none());
    }

    #[test]
    fn test_missing_state_is_an_error() {
        let (disc, _) = bar(0.0);
        let err = disc.evaluate(Action::CalcResidualAndJacobian, &StateSlots::new()).unwrap_err();
        assert!(err.to_string().contains("displacement"));
    }

    #[test]
    fn test_velocity_is_backward_difference() {
        let mesh = Mesh1d::uniform(1, 1.0);
        let layout = DofLayout::new(2, 1);
        let mut field = StructureField::new(
            mesh,
            layout,
            StructureParams::default(),
            &[Dirichlet::fixed(&[0], 0, 0.0)],
            Vec::new(),
        )
        .unwrap();
        field.setup().unwrap();
        field.set_dt(0.5);
        field.prepare_time_step().unwrap();
        field.update_iter(&[0.0, 1.0]).unwrap();
        assert_eq!(field.velocity_np().unwrap(), &[0.0, 2.0]);
        assert_eq!(field.dirichlet_dofs(), &[0]);
    }
}
