//! Reference 1D discretizations of the three SSTI fields
//!
//! Linear two-node elements, backward Euler in time. Each field is split the
//! way the coupling core sees it: a `*Discretization` runs the element loop
//! behind [`DiscretizationEvaluator`](crate::fem::DiscretizationEvaluator),
//! and a `*Field` owns the time state behind
//! [`FieldIntegrator`](crate::fem::FieldIntegrator).

pub mod mesh1d;
pub mod scatra;
pub mod structure;
pub mod thermo;

pub use mesh1d::{Dirichlet, DofLayout, Element1d, InterfaceCondition, Mesh1d};
pub use scatra::{InterfaceKinetics, ScalarTransportDiscretization, ScalarTransportField, ScatraParams};
pub use structure::{PointLoad, StructureDiscretization, StructureField, StructureParams};
pub use thermo::{ThermoDiscretization, ThermoField, ThermoParams};

use log::debug;
use rayon::prelude::*;
use sprs::{CsMat, TriMat};

use crate::error::{SstiError, SstiResult};
use crate::fem::{Evaluation, RowMap, StateName, StateSlots, Subproblem};
use crate::linalg::{DirectSolver, Equilibration, EquilibrationMethod, Solver, SolverUtils};
use crate::monolithic::FieldNorms;
use crate::restart::FieldRestart;
use mesh1d::DirichletDof;

/// Residual entries and matrix triplets of one element (field-local lids)
#[derive(Debug, Clone, Default)]
pub(crate) struct ElementContribution {
    pub residual: Vec<(usize, f64)>,
    pub matrix: Vec<(usize, usize, f64)>,
}

/// Run an element loop in parallel and merge the element contributions
///
/// `with_residual` selects whether a residual vector is returned; element
/// residual entries are ignored otherwise.
pub(crate) fn assemble_elements<F>(
    num_elements: usize,
    shape: (usize, usize),
    with_residual: bool,
    element: F,
) -> SstiResult<Evaluation>
where
    F: Fn(usize) -> SstiResult<ElementContribution> + Sync + Send,
{
    let contributions: Vec<ElementContribution> = (0..num_elements)
        .into_par_iter()
        .map(element)
        .collect::<SstiResult<Vec<_>>>()?;

    let mut triplets = TriMat::new(shape);
    let mut residual = if with_residual { Some(vec![0.0; shape.0]) } else { None };
    for c in contributions {
        for (i, j, val) in c.matrix {
            triplets.add_triplet(i, j, val);
        }
        if let Some(r) = residual.as_mut() {
            for (i, val) in c.residual {
                r[i] += val;
            }
        }
    }

    Ok(Evaluation {
        residual,
        matrix: Some(triplets.to_csr()),
    })
}

/// Newton iterations of a stationary field solve
const STATIONARY_MAX_ITERATIONS: usize = 10;
/// Relative residual norm of a converged stationary field solve
const STATIONARY_TOLERANCE: f64 = 1e-12;

/// Replace the rows in `rows` by identity rows
fn identity_rows(matrix: &CsMat<f64>, rows: &[usize]) -> CsMat<f64> {
    let mut tri = TriMat::new((matrix.rows(), matrix.cols()));
    for (row, vec) in matrix.outer_iterator().enumerate() {
        if rows.contains(&row) {
            continue;
        }
        for (col, &val) in vec.iter() {
            tri.add_triplet(row, col, val);
        }
    }
    for &row in rows {
        tri.add_triplet(row, row, 1.0);
    }
    tri.to_csr()
}

/// Time state shared by the reference field integrators
#[derive(Debug, Clone)]
pub(crate) struct TimeState {
    pub kind: Subproblem,
    pub map: RowMap,
    pub time: f64,
    pub dt: f64,
    pub step: usize,
    pub u_n: Vec<f64>,
    pub u_np: Vec<f64>,
    pub residual: Vec<f64>,
    pub matrix: CsMat<f64>,
    pub slots: StateSlots,
    dirichlet: Vec<DirichletDof>,
    dirichlet_gids: Vec<usize>,
}

impl TimeState {
    pub fn new(kind: Subproblem, map: RowMap, initial: Vec<f64>, dirichlet: Vec<DirichletDof>) -> SstiResult<Self> {
        let n = map.len();
        if initial.len() != n {
            return Err(SstiError::Config(format!(
                "initial state of field '{}' has {} entries, dof row map {}",
                kind,
                initial.len(),
                n
            )));
        }
        let dirichlet_gids = dirichlet.iter().map(|d| d.gid).collect();
        Ok(Self {
            kind,
            map,
            time: 0.0,
            dt: 1.0,
            step: 0,
            u_n: initial.clone(),
            u_np: initial,
            residual: vec![0.0; n],
            matrix: TriMat::new((n, n)).to_csr(),
            slots: StateSlots::new(),
            dirichlet,
            dirichlet_gids,
        })
    }

    pub fn dirichlet_gids(&self) -> &[usize] {
        &self.dirichlet_gids
    }

    /// Overwrite Dirichlet dofs of u_np with their values at the current time
    pub fn apply_dirichlet(&mut self) {
        for d in &self.dirichlet {
            self.u_np[d.lid] = d.value + d.rate * self.time;
        }
    }

    /// t += Δt, step += 1, predict u_np = u_n with Dirichlet values
    pub fn advance(&mut self) {
        self.step += 1;
        self.time += self.dt;
        self.u_np.copy_from_slice(&self.u_n);
        self.apply_dirichlet();
    }

    pub fn update_iter(&mut self, increment: &[f64]) -> SstiResult<()> {
        if increment.len() != self.u_np.len() {
            return Err(SstiError::assembly(
                Some(self.kind),
                format!("increment has {} entries, dof row map {}", increment.len(), self.u_np.len()),
            ));
        }
        for (u, du) in self.u_np.iter_mut().zip(increment) {
            *u += du;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.u_np.copy_from_slice(&self.u_n);
    }

    pub fn update(&mut self) {
        self.u_n.copy_from_slice(&self.u_np);
    }

    /// Newton solve for u_np with the other fields frozen in `slots`
    ///
    /// `evaluate` assembles residual and jacobian with `own` set to the
    /// iterate; Dirichlet dofs keep their values. Returns the number of
    /// linear solves.
    pub fn solve_stationary<F>(
        &mut self,
        own: StateName,
        method: EquilibrationMethod,
        mut evaluate: F,
    ) -> SstiResult<usize>
    where
        F: FnMut(&StateSlots) -> SstiResult<Evaluation>,
    {
        let n = self.map.len();
        let dbc: Vec<usize> = self.dirichlet.iter().map(|d| d.lid).collect();
        let mut equilibration = Equilibration::single_block(method, n)?;
        let mut solver = DirectSolver::new();
        let mut increment = vec![0.0; n];

        for iteration in 0..=STATIONARY_MAX_ITERATIONS {
            self.slots.set(own, &self.u_np);
            let evaluation = evaluate(&self.slots)?;
            evaluation.check_finite(self.kind, &self.map)?;
            self.store(evaluation)?;

            let mut rhs: Vec<f64> = self.residual.iter().map(|r| -r).collect();
            for &lid in &dbc {
                rhs[lid] = 0.0;
            }
            let norm = SolverUtils::norm(&rhs);
            if norm <= STATIONARY_TOLERANCE * (1.0 + SolverUtils::norm(&self.u_np)) {
                debug!("{}: stationary solve converged after {} iterations, |r| = {:.3e}", self.kind, iteration, norm);
                return Ok(iteration);
            }
            if iteration == STATIONARY_MAX_ITERATIONS {
                break;
            }

            let mut matrix = identity_rows(&self.matrix, &dbc);
            equilibration.scale(&mut matrix, &mut rhs)?;
            let (du, stats) = solver.solve(&matrix, &rhs);
            if !stats.converged {
                return Err(SstiError::LinearSolve {
                    step: self.step,
                    iteration: iteration + 1,
                    solver: solver.name().to_string(),
                    residual_norm: stats.residual_norm,
                    block_norms: vec![norm],
                });
            }
            increment = du;
            equilibration.unscale(&mut increment);
            self.update_iter(&increment)?;
        }

        let rhs: Vec<f64> = self.residual.iter().map(|r| -r).collect();
        Err(SstiError::NonConvergence {
            step: self.step,
            iteration: STATIONARY_MAX_ITERATIONS,
            norms: vec![FieldNorms::compute(self.kind, &rhs, &increment, &self.u_np)],
        })
    }

    /// Take over residual and jacobian of an own-field evaluation
    pub fn store(&mut self, evaluation: Evaluation) -> SstiResult<()> {
        let n = self.map.len();
        self.residual = evaluation
            .residual
            .ok_or_else(|| SstiError::assembly(Some(self.kind), "evaluation returned no residual"))?;
        self.matrix = evaluation.matrix.unwrap_or_else(|| TriMat::new((n, n)).to_csr());
        Ok(())
    }

    pub fn write_restart(&self) -> FieldRestart {
        FieldRestart::new(self.kind, &self.map, self.step, self.time, self.u_n.clone())
    }

    pub fn read_restart(&mut self, data: &FieldRestart) -> SstiResult<()> {
        data.check_compatible(self.kind, &self.map)?;
        self.u_n.copy_from_slice(&data.u_n);
        self.u_np.copy_from_slice(&data.u_n);
        self.time = data.time;
        self.step = data.step;
        Ok(())
    }
}

/// Mean of two nodal values of an element
pub(crate) fn element_mean(values: &[f64], lids: [usize; 2]) -> f64 {
    0.5 * (values[lids[0]] + values[lids[1]])
}
