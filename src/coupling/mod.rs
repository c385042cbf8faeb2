pub mod meshtying;
pub mod offdiag;

pub use meshtying::{InterfaceMeshtying, MeshtyingPair, MATCHING_TOLERANCE};
pub use offdiag::{CouplingBlock, CouplingEvaluator};
