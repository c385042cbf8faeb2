//! Off-diagonal coupling blocks
//!
//! Each of the six blocks is the linearisation of one field's residual
//! w.r.t. another field's dofs. The evaluator only picks the action and the
//! state views; the row field's discretization runs the element loop.

use std::collections::BTreeMap;

use sprs::{CsMat, TriMat};

use crate::error::{SstiError, SstiResult};
use crate::fem::{Action, Contribution, Fields, Subproblem};
use crate::linalg::BlockSystemMatrix;

/// The six off-diagonal blocks of the 3×3 field system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CouplingBlock {
    /// ∂r_S/∂u_Tc, stress dependence on concentration
    StructureScatra,
    /// ∂r_Tc/∂u_S, transport dependence on deformation
    ScatraStructure,
    /// ∂r_S/∂u_Tt, thermoelastic coupling
    StructureThermo,
    /// ∂r_Tt/∂u_S, mechanical dissipation in the heat balance
    ThermoStructure,
    /// ∂r_Tc/∂u_Tt, temperature-dependent transport
    ScatraThermo,
    /// ∂r_Tt/∂u_Tc, concentration-dependent heat source
    ThermoScatra,
}

impl CouplingBlock {
    pub const ALL: [CouplingBlock; 6] = [
        CouplingBlock::StructureScatra,
        CouplingBlock::ScatraStructure,
        CouplingBlock::StructureThermo,
        CouplingBlock::ThermoStructure,
        CouplingBlock::ScatraThermo,
        CouplingBlock::ThermoScatra,
    ];

    /// Field whose residual is differentiated
    pub fn row(&self) -> Subproblem {
        match self {
            CouplingBlock::StructureScatra | CouplingBlock::StructureThermo => Subproblem::Structure,
            CouplingBlock::ScatraStructure | CouplingBlock::ScatraThermo => Subproblem::ScalarTransport,
            CouplingBlock::ThermoStructure | CouplingBlock::ThermoScatra => Subproblem::Thermo,
        }
    }

    /// Field the residual is differentiated against
    pub fn column(&self) -> Subproblem {
        match self {
            CouplingBlock::ScatraStructure | CouplingBlock::ThermoStructure => Subproblem::Structure,
            CouplingBlock::StructureScatra | CouplingBlock::ThermoScatra => Subproblem::ScalarTransport,
            CouplingBlock::StructureThermo | CouplingBlock::ScatraThermo => Subproblem::Thermo,
        }
    }

    pub fn from_fields(row: Subproblem, column: Subproblem) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.row() == row && b.column() == column)
    }
}

impl std::fmt::Display for CouplingBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "K_({},{})", self.row(), self.column())
    }
}

/// Orchestrates the six off-diagonal evaluations of one Newton iteration
///
/// Domain and interface parts are stored separately; each evaluation
/// replaces its own part, so nothing accumulates across iterations.
#[derive(Debug, Clone)]
pub struct CouplingEvaluator {
    active: Vec<CouplingBlock>,
    interface: bool,
    parts: BTreeMap<(CouplingBlock, Contribution), CsMat<f64>>,
}

impl CouplingEvaluator {
    /// # Arguments
    /// * `active` - blocks to evaluate; the others stay zero views
    /// * `interface` - also evaluate interface contributions (mesh-tying active)
    pub fn new(active: Vec<CouplingBlock>, interface: bool) -> Self {
        Self {
            active,
            interface,
            parts: BTreeMap::new(),
        }
    }

    pub fn active_blocks(&self) -> &[CouplingBlock] {
        &self.active
    }

    pub fn is_active(&self, block: CouplingBlock) -> bool {
        self.active.contains(&block)
    }

    pub fn interface_active(&self) -> bool {
        self.interface
    }

    /// Evaluate one contribution of one block into a freshly zeroed target
    ///
    /// A discretization that returns no matrix for the action has no such
    /// derivative; the block part is then zero.
    pub fn evaluate(&mut self, block: CouplingBlock, contribution: Contribution, fields: &Fields) -> SstiResult<()> {
        if !self.is_active(block) {
            return Err(SstiError::assembly(Some(block.row()), format!("{} is not an active coupling block", block)));
        }
        if contribution == Contribution::Interface && !self.interface {
            return Err(SstiError::assembly(
                Some(block.row()),
                "interface contribution requested without interface mesh-tying",
            ));
        }

        let row_field = fields.get(block.row());
        let shape = (row_field.dof_row_map().len(), fields.get(block.column()).dof_row_map().len());

        // zero the target first
        let target = self
            .parts
            .entry((block, contribution))
            .or_insert_with(|| TriMat::new(shape).to_csr());
        *target = TriMat::new(shape).to_csr();

        let action = Action::OffDiagonal { column: block.column(), contribution };
        let evaluation = row_field.discretization().evaluate(action, row_field.state_slots())?;
        evaluation.check_finite(block.row(), row_field.dof_row_map())?;

        if let Some(matrix) = evaluation.matrix {
            if (matrix.rows(), matrix.cols()) != shape {
                return Err(SstiError::assembly(
                    Some(block.row()),
                    format!(
                        "{} ({:?}) returned a {}x{} matrix, expected {}x{}",
                        block,
                        contribution,
                        matrix.rows(),
                        matrix.cols(),
                        shape.0,
                        shape.1
                    ),
                ));
            }
            *target = matrix;
        }
        Ok(())
    }

    /// Last evaluated part of a block
    pub fn part(&self, block: CouplingBlock, contribution: Contribution) -> Option<&CsMat<f64>> {
        self.parts.get(&(block, contribution))
    }

    /// Add every evaluated part into the system matrix
    pub fn assemble_into(&self, system: &mut BlockSystemMatrix) -> SstiResult<()> {
        for (&(block, contribution), matrix) in &self.parts {
            if contribution == Contribution::Interface && !self.interface {
                continue;
            }
            system.assemble_off_diagonal(block.row(), block.column(), matrix, contribution)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_and_columns() {
        for block in CouplingBlock::ALL {
            assert_ne!(block.row(), block.column());
            assert_eq!(CouplingBlock::from_fields(block.row(), block.column()), Some(block));
        }
        assert_eq!(CouplingBlock::from_fields(Subproblem::Thermo, Subproblem::Thermo), None);
        assert_eq!(CouplingBlock::ThermoScatra.to_string(), "K_(thermo,scatra)");
    }

    #[test]
    fn test_all_six_pairs_are_distinct() {
        let mut pairs: Vec<(usize, usize)> = CouplingBlock::ALL
            .iter()
            .map(|b| (b.row().position(), b.column().position()))
            .collect();
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), 6);
    }
}
