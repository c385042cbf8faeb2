use nalgebra::{DMatrix, DVector, LU, Dyn};
use serde::{Deserialize, Serialize};
use sprs::CsMat;

/// Preconditioner for the Krylov solvers
///
/// Solves M z = r approximately (M ≈ A)
pub trait Preconditioner {
    /// Apply preconditioner: z = M^{-1} r
    fn apply(&self, r: &[f64]) -> Vec<f64>;
}

/// Preconditioner selected for the iterative solvers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionerKind {
    None,
    #[default]
    Jacobi,
    /// Exact inverse of every diagonal block of the block system
    BlockJacobi,
}

/// Build a preconditioner for `a`
///
/// `blocks` lists the full-map lids of every system block; without it a
/// block preconditioner degrades to point Jacobi.
pub fn build_preconditioner(
    kind: PreconditionerKind,
    a: &CsMat<f64>,
    blocks: Option<&[Vec<usize>]>,
) -> Box<dyn Preconditioner> {
    match (kind, blocks) {
        (PreconditionerKind::None, _) => Box::new(IdentityPreconditioner),
        (PreconditionerKind::Jacobi, _) | (PreconditionerKind::BlockJacobi, None) => Box::new(JacobiPreconditioner::new(a)),
        (PreconditionerKind::BlockJacobi, Some(blocks)) => Box::new(BlockJacobiPreconditioner::new(a, blocks)),
    }
}

/// Jacobi (diagonal) preconditioner, M = diag(A)
pub struct JacobiPreconditioner {
    /// 1 / A_ii, or 1 where the diagonal vanishes
    diag_inv: Vec<f64>,
}

impl JacobiPreconditioner {
    #[allow(non_snake_case)]
    pub fn new(A: &CsMat<f64>) -> Self {
        let diag_inv = (0..A.rows())
            .map(|i| match A.get(i, i) {
                Some(&d) if d.abs() > 1e-300 => 1.0 / d,
                _ => 1.0,
            })
            .collect();
        Self { diag_inv }
    }
}

impl Preconditioner for JacobiPreconditioner {
    fn apply(&self, r: &[f64]) -> Vec<f64> {
        r.iter().zip(&self.diag_inv).map(|(ri, di)| ri * di).collect()
    }
}

/// No preconditioning
pub struct IdentityPreconditioner;

impl Preconditioner for IdentityPreconditioner {
    fn apply(&self, r: &[f64]) -> Vec<f64> {
        r.to_vec()
    }
}

/// Largest block that is factorised densely
const MAX_DENSE_BLOCK: usize = 4000;

enum BlockInverse {
    Lu(LU<f64, Dyn, Dyn>),
    Diagonal(Vec<f64>),
}

/// Block Jacobi preconditioner over the field/species blocks of the system
///
/// Each diagonal block A_bb is factorised with a dense LU. Singular or
/// oversized blocks fall back to their point-Jacobi inverse.
pub struct BlockJacobiPreconditioner {
    blocks: Vec<Vec<usize>>,
    inverses: Vec<BlockInverse>,
}

impl BlockJacobiPreconditioner {
    #[allow(non_snake_case)]
    pub fn new(A: &CsMat<f64>, blocks: &[Vec<usize>]) -> Self {
        let n = A.rows();
        let mut local = vec![usize::MAX; n];
        let mut inverses = Vec::with_capacity(blocks.len());

        for lids in blocks {
            for (i, &lid) in lids.iter().enumerate() {
                local[lid] = i;
            }

            let m = lids.len();
            let mut dense = DMatrix::<f64>::zeros(m, m);
            let mut diag = vec![1.0; m];
            for (i, &row) in lids.iter().enumerate() {
                if let Some(vec) = A.outer_view(row) {
                    for (col, &val) in vec.iter() {
                        let j = local[col];
                        if j != usize::MAX && lids.get(j) == Some(&col) {
                            if m <= MAX_DENSE_BLOCK {
                                dense[(i, j)] = val;
                            }
                            if i == j && val.abs() > 1e-300 {
                                diag[i] = 1.0 / val;
                            }
                        }
                    }
                }
            }

            let inverse = if m <= MAX_DENSE_BLOCK {
                let lu = dense.lu();
                if lu.is_invertible() {
                    BlockInverse::Lu(lu)
                } else {
                    log::debug!("singular diagonal block of size {}, using point Jacobi", m);
                    BlockInverse::Diagonal(diag)
                }
            } else {
                BlockInverse::Diagonal(diag)
            };
            inverses.push(inverse);
        }

        Self { blocks: blocks.to_vec(), inverses }
    }
}

impl Preconditioner for BlockJacobiPreconditioner {
    fn apply(&self, r: &[f64]) -> Vec<f64> {
        let mut z = r.to_vec();
        for (lids, inverse) in self.blocks.iter().zip(&self.inverses) {
            match inverse {
                BlockInverse::Lu(lu) => {
                    let rb = DVector::from_iterator(lids.len(), lids.iter().map(|&l| r[l]));
                    if let Some(zb) = lu.solve(&rb) {
                        for (&l, &v) in lids.iter().zip(zb.iter()) {
                            z[l] = v;
                        }
                    }
                }
                BlockInverse::Diagonal(diag) => {
                    for (&l, &d) in lids.iter().zip(diag) {
                        z[l] = r[l] * d;
                    }
                }
            }
        }
        z
    }
}
