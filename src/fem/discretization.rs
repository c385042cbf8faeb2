//! Discretization evaluator contract
//!
//! Element-level residual and jacobian assembly lives behind
//! [`DiscretizationEvaluator`]. The coupling core only chooses the action and
//! installs read-only state views; shape functions, quadrature and material
//! evaluation are the discretization's business.

use std::collections::HashMap;

use sprs::CsMat;

use crate::error::{SstiError, SstiResult};
use crate::fem::{RowMap, Subproblem};

/// Named state slot on a discretization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateName {
    /// Scalar transport iterate (concentrations / potentials)
    ScalarField,
    /// Thermo iterate
    Temperature,
    /// Structural displacement iterate
    Displacement,
    /// Structural velocity
    Velocity,
    /// Scalar iterate with master-side interface values copied to the slave side
    MasterScalar,
    /// Temperature with master-side interface values copied to the slave side
    MasterTemperature,
    /// Slave-side interface temperatures
    SlaveTemperature,
}

impl StateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateName::ScalarField => "scalarfield",
            StateName::Temperature => "temperature",
            StateName::Displacement => "displacement",
            StateName::Velocity => "velocity",
            StateName::MasterScalar => "imasterscatra",
            StateName::MasterTemperature => "imastertemp",
            StateName::SlaveTemperature => "islavetemp",
        }
    }
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only views of other fields' iterates
///
/// Written by the driver's redistribution step, read by every evaluation
/// that follows within the same Newton iteration.
#[derive(Debug, Clone, Default)]
pub struct StateSlots {
    slots: HashMap<StateName, Vec<f64>>,
}

impl StateSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (copy) a state view
    pub fn set(&mut self, name: StateName, values: &[f64]) {
        match self.slots.get_mut(&name) {
            Some(slot) if slot.len() == values.len() => slot.copy_from_slice(values),
            _ => {
                self.slots.insert(name, values.to_vec());
            }
        }
    }

    pub fn get(&self, name: StateName) -> Option<&[f64]> {
        self.slots.get(&name).map(|v| v.as_slice())
    }

    /// Fetch a state that an evaluation cannot do without
    pub fn require(&self, name: StateName, field: Subproblem) -> SstiResult<&[f64]> {
        self.get(name).ok_or_else(|| {
            SstiError::assembly(Some(field), format!("missing state slot '{}'", name))
        })
    }

    pub fn contains(&self, name: StateName) -> bool {
        self.slots.contains_key(&name)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Which part of an off-diagonal linearisation is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Contribution {
    /// Volume integral over the elements
    Domain,
    /// Surface integral over the mesh-tying interfaces
    Interface,
}

/// Element action code handed to the discretization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Residual and jacobian of the owning field w.r.t. its own dofs
    CalcResidualAndJacobian,
    /// Linearisation of the owning field's residual w.r.t. `column`'s dofs
    OffDiagonal {
        column: Subproblem,
        contribution: Contribution,
    },
}

/// Output of one evaluation pass
///
/// Matrices are indexed by field-local lids: rows of the owning field,
/// columns of the field the action differentiates against.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub residual: Option<Vec<f64>>,
    pub matrix: Option<CsMat<f64>>,
}

impl Evaluation {
    /// Reject non-finite entries; the error names the offending row gid
    pub fn check_finite(&self, field: Subproblem, row_map: &RowMap) -> SstiResult<()> {
        if let Some(residual) = &self.residual {
            if let Some(lid) = residual.iter().position(|v| !v.is_finite()) {
                return Err(SstiError::assembly_at_gid(
                    Some(field),
                    row_map.gid(lid),
                    "element evaluation returned a non-finite residual entry",
                ));
            }
        }
        if let Some(matrix) = &self.matrix {
            for (row, vec) in matrix.outer_iterator().enumerate() {
                if vec.iter().any(|(_, v)| !v.is_finite()) {
                    return Err(SstiError::assembly_at_gid(
                        Some(field),
                        row_map.gid(row),
                        "element evaluation returned a non-finite matrix entry",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Side of a mesh-tying interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceSide {
    Master,
    Slave,
}

/// Node of a conditioned element face
#[derive(Debug, Clone, PartialEq)]
pub struct FaceNode {
    pub gid: usize,
    pub coords: [f64; 3],
    /// Dof gids of this node in the owning field
    pub dofs: Vec<usize>,
}

/// Element face carrying a named condition
#[derive(Debug, Clone, PartialEq)]
pub struct ElementFace {
    pub element: usize,
    pub interface: usize,
    pub side: InterfaceSide,
    pub nodes: Vec<FaceNode>,
}

/// Name of the matching-node mesh-tying condition
pub const MESHTYING_CONDITION: &str = "SSTIInterfaceMeshtying";

/// Contract of the element loop of one field's discretization
///
/// Dof sets are numbered like the canonical field order: nodeset 0 holds the
/// structural dofs, 1 the scalar transport dofs, 2 the thermo dofs, all on
/// the same geometry.
pub trait DiscretizationEvaluator {
    /// Field whose residual this discretization evaluates
    fn field(&self) -> Subproblem;

    /// Run the element loop for `action` with the given state views
    fn evaluate(&self, action: Action, states: &StateSlots) -> SstiResult<Evaluation>;

    /// Element faces carrying condition `name`
    fn condition_on(&self, name: &str) -> Vec<ElementFace>;

    /// Dof row map of dof set `nodeset`
    fn dof_row_map(&self, nodeset: usize) -> Option<&RowMap>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    #[test]
    fn test_state_slots() {
        let mut slots = StateSlots::new();
        assert!(slots.require(StateName::Temperature, Subproblem::Structure).is_err());

        slots.set(StateName::Temperature, &[1.0, 2.0]);
        assert_eq!(slots.get(StateName::Temperature), Some(&[1.0, 2.0][..]));

        // overwrite in place
        slots.set(StateName::Temperature, &[3.0, 4.0]);
        assert_eq!(slots.require(StateName::Temperature, Subproblem::Structure).unwrap(), &[3.0, 4.0]);

        slots.clear();
        assert!(!slots.contains(StateName::Temperature));
    }

    #[test]
    fn test_missing_slot_names_the_slot() {
        let slots = StateSlots::new();
        let err = slots.require(StateName::MasterTemperature, Subproblem::ScalarTransport).unwrap_err();
        assert!(err.to_string().contains("imastertemp"));
    }

    #[test]
    fn test_check_finite() {
        let map = RowMap::contiguous(10, 2);
        let ok = Evaluation { residual: Some(vec![1.0, 2.0]), matrix: None };
        assert!(ok.check_finite(Subproblem::Thermo, &map).is_ok());

        let bad = Evaluation { residual: Some(vec![1.0, f64::NAN]), matrix: None };
        let msg = bad.check_finite(Subproblem::Thermo, &map).unwrap_err().to_string();
        assert!(msg.contains("gid 11"));

        let mut tri = TriMat::new((2, 2));
        tri.add_triplet(0, 1, f64::INFINITY);
        let bad = Evaluation { residual: None, matrix: Some(tri.to_csr()) };
        let msg = bad.check_finite(Subproblem::Thermo, &map).unwrap_err().to_string();
        assert!(msg.contains("gid 10"));
    }
}
