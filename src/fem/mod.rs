pub mod dof;
pub mod discretization;
pub mod field;

pub use dof::{DofMap, MapExtractor, RowMap, SystemMatrixType};
pub use discretization::{
    Action, Contribution, DiscretizationEvaluator, ElementFace, Evaluation, FaceNode, InterfaceSide,
    StateName, StateSlots, MESHTYING_CONDITION,
};
pub use field::{FieldIntegrator, FieldMatrixType, Fields, Subproblem};
