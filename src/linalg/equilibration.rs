//! Diagonal scaling of the linear system
//!
//! `scale` replaces `K <- D_r K D_c` and `r <- D_r r`; `unscale` maps the
//! increment of the scaled system back with `Δu <- D_c Δu`. The scaling is
//! recomputed from the fresh matrix on every call.

use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

use crate::error::{SstiError, SstiResult};
use crate::fem::{DofMap, Subproblem, SystemMatrixType};

/// Scaling policy of one matrix block (or of the whole matrix)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquilibrationMethod {
    #[default]
    None,
    /// D_r = 1 / max_j |K_ij|
    RowsMaxabs,
    /// D_c = 1 / max_i |K_ij|
    ColumnsMaxabs,
    /// Rows first, then columns of the row-scaled matrix
    #[serde(alias = "global")]
    RowsAndColumnsMaxabs,
    /// Per-field methods, combined blockwise
    Local,
}

impl EquilibrationMethod {
    fn scales_rows(&self) -> bool {
        matches!(self, Self::RowsMaxabs | Self::RowsAndColumnsMaxabs)
    }

    fn scales_columns(&self) -> bool {
        matches!(self, Self::ColumnsMaxabs | Self::RowsAndColumnsMaxabs)
    }
}

impl std::fmt::Display for EquilibrationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::RowsMaxabs => "rows_maxabs",
            Self::ColumnsMaxabs => "columns_maxabs",
            Self::RowsAndColumnsMaxabs => "rows_and_columns_maxabs",
            Self::Local => "local",
        };
        f.write_str(name)
    }
}

/// Global method plus per-field methods used with `Local`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EquilibrationMethods {
    pub global: EquilibrationMethod,
    pub structure: EquilibrationMethod,
    pub scatra: EquilibrationMethod,
    pub thermo: EquilibrationMethod,
}

impl EquilibrationMethods {
    pub fn field(&self, f: Subproblem) -> EquilibrationMethod {
        match f {
            Subproblem::Structure => self.structure,
            Subproblem::ScalarTransport => self.scatra,
            Subproblem::Thermo => self.thermo,
        }
    }

    fn any_field(&self) -> bool {
        Subproblem::ALL.iter().any(|&f| self.field(f) != EquilibrationMethod::None)
    }

    /// One method per system matrix block
    ///
    /// Sparse storage and non-local policies yield a single global method.
    /// With `Local`, every block takes the method of the field owning it.
    pub fn block_methods(&self, dofs: &DofMap) -> Vec<EquilibrationMethod> {
        if dofs.matrix_type() == SystemMatrixType::Sparse || self.global != EquilibrationMethod::Local {
            return vec![self.global];
        }
        if !self.any_field() {
            return vec![EquilibrationMethod::None];
        }
        let mut methods = vec![EquilibrationMethod::None; dofs.num_blocks()];
        for f in Subproblem::ALL {
            for &b in dofs.block_positions(f) {
                methods[b] = self.field(f);
            }
        }
        methods
    }
}

/// Equilibration strategy built once at setup
#[derive(Debug, Clone)]
pub struct Equilibration {
    block_methods: Vec<EquilibrationMethod>,
    /// (block, lid within block) of every full-map lid
    owners: Vec<(usize, usize)>,
    row_scaling: Option<Vec<f64>>,
    col_scaling: Option<Vec<f64>>,
}

impl Equilibration {
    pub fn new(methods: &EquilibrationMethods, dofs: &DofMap) -> SstiResult<Self> {
        if methods.global != EquilibrationMethod::Local && methods.any_field() {
            return Err(SstiError::Config("Either global equilibration or local equilibration".into()));
        }
        if dofs.matrix_type() == SystemMatrixType::Sparse && methods.any_field() {
            return Err(SstiError::Config("Block based equilibration only for block matrices".into()));
        }

        let block_methods = methods.block_methods(dofs);
        let owners = if block_methods.len() == 1 {
            (0..dofs.full_map().len()).map(|lid| (0, lid)).collect()
        } else {
            (0..dofs.full_map().len()).map(|lid| dofs.block_extractor().owner(lid)).collect()
        };

        Ok(Self { block_methods, owners, row_scaling: None, col_scaling: None })
    }

    /// Equilibration of a standalone field system of `n` rows
    pub fn single_block(method: EquilibrationMethod, n: usize) -> SstiResult<Self> {
        if method == EquilibrationMethod::Local {
            return Err(SstiError::Config("a single field system cannot be equilibrated locally".into()));
        }
        Ok(Self {
            block_methods: vec![method],
            owners: (0..n).map(|lid| (0, lid)).collect(),
            row_scaling: None,
            col_scaling: None,
        })
    }

    pub fn block_methods(&self) -> &[EquilibrationMethod] {
        &self.block_methods
    }

    pub fn is_active(&self) -> bool {
        self.block_methods.iter().any(|m| *m != EquilibrationMethod::None)
    }

    /// D_r of the last `scale` call (None while inactive)
    pub fn row_scaling(&self) -> Option<&[f64]> {
        self.row_scaling.as_deref()
    }

    /// D_c of the last `scale` call (None while inactive)
    pub fn col_scaling(&self) -> Option<&[f64]> {
        self.col_scaling.as_deref()
    }

    fn method_of(&self, full_lid: usize) -> EquilibrationMethod {
        self.block_methods[self.owners[full_lid].0]
    }

    /// True if (row, col) belong to the same block
    fn same_block(&self, row: usize, col: usize) -> bool {
        self.block_methods.len() == 1 || self.owners[row].0 == self.owners[col].0
    }

    /// Scale matrix and residual in place
    ///
    /// Row and column norms are taken within the diagonal block of each row
    /// and column when equilibrating blockwise.
    pub fn scale(&mut self, matrix: &mut CsMat<f64>, residual: &mut [f64]) -> SstiResult<()> {
        if !self.is_active() {
            self.row_scaling = None;
            self.col_scaling = None;
            return Ok(());
        }
        let n = matrix.rows();
        if n != self.owners.len() || residual.len() != n {
            return Err(SstiError::assembly(None, "equilibrated system does not match full map"));
        }

        let mut row_scale = vec![1.0; n];
        for (row, vec) in matrix.outer_iterator().enumerate() {
            if !self.method_of(row).scales_rows() {
                continue;
            }
            let max = vec
                .iter()
                .filter(|(col, _)| self.same_block(row, *col))
                .fold(0.0_f64, |m, (_, v)| m.max(v.abs()));
            row_scale[row] = inverse_norm(max, row)?;
        }

        // column norms of the row-scaled matrix
        let mut col_max = vec![0.0_f64; n];
        for (row, vec) in matrix.outer_iterator().enumerate() {
            for (col, &val) in vec.iter() {
                if self.same_block(row, col) {
                    col_max[col] = col_max[col].max((row_scale[row] * val).abs());
                }
            }
        }
        let mut col_scale = vec![1.0; n];
        for col in 0..n {
            if self.method_of(col).scales_columns() {
                col_scale[col] = inverse_norm(col_max[col], col)?;
            }
        }

        let mut tri = TriMat::new((n, matrix.cols()));
        for (row, vec) in matrix.outer_iterator().enumerate() {
            for (col, &val) in vec.iter() {
                tri.add_triplet(row, col, row_scale[row] * val * col_scale[col]);
            }
        }
        *matrix = tri.to_csr();

        for (r, d) in residual.iter_mut().zip(&row_scale) {
            *r *= d;
        }
        self.row_scaling = Some(row_scale);
        self.col_scaling = Some(col_scale);
        Ok(())
    }

    /// Map the increment of the scaled system back: Δu <- D_c Δu
    pub fn unscale(&self, increment: &mut [f64]) {
        if let Some(col_scale) = &self.col_scaling {
            for (du, d) in increment.iter_mut().zip(col_scale) {
                *du *= d;
            }
        }
    }
}

fn inverse_norm(max: f64, lid: usize) -> SstiResult<f64> {
    if max > 0.0 && max.is_finite() {
        Ok(1.0 / max)
    } else {
        Err(SstiError::assembly(
            None,
            format!("cannot equilibrate: row/column {} of the system matrix is zero", lid),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fem::RowMap;
    use approx::assert_relative_eq;

    fn dofs(matrix_type: SystemMatrixType) -> DofMap {
        DofMap::new(
            [RowMap::contiguous(0, 2), RowMap::contiguous(2, 1), RowMap::contiguous(3, 1)],
            [vec![], vec![], vec![]],
            matrix_type,
        )
        .unwrap()
    }

    fn system() -> CsMat<f64> {
        let mut tri = TriMat::new((4, 4));
        tri.add_triplet(0, 0, 100.0);
        tri.add_triplet(0, 1, -50.0);
        tri.add_triplet(1, 0, -50.0);
        tri.add_triplet(1, 1, 100.0);
        tri.add_triplet(1, 2, 3.0);
        tri.add_triplet(2, 2, 0.01);
        tri.add_triplet(3, 0, 7.0);
        tri.add_triplet(3, 3, 4.0);
        tri.to_csr()
    }

    #[test]
    fn test_incompatible_policies() {
        let mut methods = EquilibrationMethods {
            global: EquilibrationMethod::RowsMaxabs,
            structure: EquilibrationMethod::RowsMaxabs,
            ..Default::default()
        };
        let err = Equilibration::new(&methods, &dofs(SystemMatrixType::Block)).unwrap_err();
        assert!(err.to_string().contains("Either global equilibration or local equilibration"));

        methods.global = EquilibrationMethod::Local;
        let err = Equilibration::new(&methods, &dofs(SystemMatrixType::Sparse)).unwrap_err();
        assert!(err.to_string().contains("Block based equilibration only for block matrices"));
    }

    #[test]
    fn test_block_methods_follow_block_positions() {
        let methods = EquilibrationMethods {
            global: EquilibrationMethod::Local,
            structure: EquilibrationMethod::RowsMaxabs,
            scatra: EquilibrationMethod::None,
            thermo: EquilibrationMethod::ColumnsMaxabs,
        };
        let blocks = methods.block_methods(&dofs(SystemMatrixType::Block));
        assert_eq!(
            blocks,
            vec![EquilibrationMethod::RowsMaxabs, EquilibrationMethod::None, EquilibrationMethod::ColumnsMaxabs]
        );

        let global = EquilibrationMethods { global: EquilibrationMethod::Local, ..Default::default() };
        assert_eq!(global.block_methods(&dofs(SystemMatrixType::Block)), vec![EquilibrationMethod::None]);
    }

    #[test]
    fn test_global_scaling_bounds_entries() {
        let methods = EquilibrationMethods { global: EquilibrationMethod::RowsAndColumnsMaxabs, ..Default::default() };
        let mut eq = Equilibration::new(&methods, &dofs(SystemMatrixType::Sparse)).unwrap();
        let mut k = system();
        let mut r = vec![1.0, 1.0, 1.0, 1.0];
        eq.scale(&mut k, &mut r).unwrap();

        for (_, vec) in k.outer_iterator().enumerate() {
            let max = vec.iter().fold(0.0_f64, |m, (_, v)| m.max(v.abs()));
            assert!(max <= 1.0 + 1e-14);
        }
        assert_relative_eq!(r[0], 0.01, epsilon = 1e-14);
        assert_relative_eq!(r[2], 100.0, epsilon = 1e-10);
        assert_relative_eq!(r[3], 1.0 / 7.0, epsilon = 1e-14);
    }

    #[test]
    fn test_scaled_solution_maps_back() {
        // solve the 2x2 structure block with and without scaling
        let methods = EquilibrationMethods { global: EquilibrationMethod::RowsAndColumnsMaxabs, ..Default::default() };
        let mut eq = Equilibration::new(&methods, &dofs(SystemMatrixType::Sparse)).unwrap();
        let mut k = system();
        let original = k.clone();
        let mut r = vec![1.0, 2.0, 3.0, 4.0];
        eq.scale(&mut k, &mut r).unwrap();

        let mut dense = nalgebra::DMatrix::zeros(4, 4);
        for (i, vec) in k.outer_iterator().enumerate() {
            for (j, &v) in vec.iter() {
                dense[(i, j)] = v;
            }
        }
        let y = dense.lu().solve(&nalgebra::DVector::from_vec(r)).unwrap();
        let mut x: Vec<f64> = y.iter().copied().collect();
        eq.unscale(&mut x);

        let b = [1.0, 2.0, 3.0, 4.0];
        for (i, vec) in original.outer_iterator().enumerate() {
            let ax: f64 = vec.iter().map(|(j, &v)| v * x[j]).sum();
            assert_relative_eq!(ax, b[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_local_scaling_leaves_unscaled_blocks() {
        let methods = EquilibrationMethods {
            global: EquilibrationMethod::Local,
            structure: EquilibrationMethod::RowsMaxabs,
            ..Default::default()
        };
        let mut eq = Equilibration::new(&methods, &dofs(SystemMatrixType::Block)).unwrap();
        let mut k = system();
        let mut r = vec![1.0; 4];
        eq.scale(&mut k, &mut r).unwrap();

        assert_relative_eq!(*k.get(0, 0).unwrap(), 1.0, epsilon = 1e-14);
        // row 1: norm from the structure block only (100), not the coupling entry
        assert_relative_eq!(*k.get(1, 2).unwrap(), 0.03, epsilon = 1e-14);
        assert_relative_eq!(*k.get(2, 2).unwrap(), 0.01, epsilon = 1e-14);
        assert_relative_eq!(*k.get(3, 3).unwrap(), 4.0, epsilon = 1e-14);

        let mut du = vec![1.0; 4];
        eq.unscale(&mut du);
        assert_eq!(du, vec![1.0; 4]);
    }

    fn assert_unscaled_system_recovered(methods: EquilibrationMethods, matrix_type: SystemMatrixType) {
        let mut eq = Equilibration::new(&methods, &dofs(matrix_type)).unwrap();
        let original = system();
        let b = vec![1.0, -2.0, 3.0, 0.5];
        let mut k = original.clone();
        let mut r = b.clone();
        eq.scale(&mut k, &mut r).unwrap();

        let d_r = eq.row_scaling().unwrap().to_vec();
        let d_c = eq.col_scaling().unwrap().to_vec();
        assert_eq!(k.nnz(), original.nnz());
        for (i, vec) in original.outer_iterator().enumerate() {
            for (j, &v) in vec.iter() {
                let recovered = k.get(i, j).unwrap() / (d_r[i] * d_c[j]);
                assert_relative_eq!(recovered, v, epsilon = 1e-14, max_relative = 1e-14);
            }
        }
        for i in 0..4 {
            assert_relative_eq!(r[i] / d_r[i], b[i], epsilon = 1e-14, max_relative = 1e-14);
        }
    }

    #[test]
    fn test_global_scaling_is_invertible() {
        let methods = EquilibrationMethods { global: EquilibrationMethod::RowsAndColumnsMaxabs, ..Default::default() };
        assert_unscaled_system_recovered(methods, SystemMatrixType::Sparse);
    }

    #[test]
    fn test_local_scaling_is_invertible() {
        let methods = EquilibrationMethods {
            global: EquilibrationMethod::Local,
            structure: EquilibrationMethod::RowsAndColumnsMaxabs,
            scatra: EquilibrationMethod::RowsMaxabs,
            thermo: EquilibrationMethod::ColumnsMaxabs,
        };
        assert_unscaled_system_recovered(methods, SystemMatrixType::Block);
    }

    #[test]
    fn test_single_block_matches_sparse_global() {
        let methods = EquilibrationMethods { global: EquilibrationMethod::RowsMaxabs, ..Default::default() };
        let mut global = Equilibration::new(&methods, &dofs(SystemMatrixType::Sparse)).unwrap();
        let mut single = Equilibration::single_block(EquilibrationMethod::RowsMaxabs, 4).unwrap();
        let (mut k1, mut k2) = (system(), system());
        let (mut r1, mut r2) = (vec![1.0; 4], vec![1.0; 4]);
        global.scale(&mut k1, &mut r1).unwrap();
        single.scale(&mut k2, &mut r2).unwrap();
        assert_eq!(global.row_scaling(), single.row_scaling());
        assert_eq!(r1, r2);

        assert!(Equilibration::single_block(EquilibrationMethod::Local, 4).is_err());
    }

    #[test]
    fn test_inactive_scaling_has_no_factors() {
        let mut eq = Equilibration::new(&EquilibrationMethods::default(), &dofs(SystemMatrixType::Sparse)).unwrap();
        let mut k = system();
        eq.scale(&mut k, &mut [0.0; 4]).unwrap();
        assert!(eq.row_scaling().is_none());
        assert!(eq.col_scaling().is_none());
        assert_eq!(k, system());
    }

    #[test]
    fn test_zero_row_is_reported() {
        let methods = EquilibrationMethods { global: EquilibrationMethod::RowsMaxabs, ..Default::default() };
        let mut eq = Equilibration::new(&methods, &dofs(SystemMatrixType::Sparse)).unwrap();
        let mut tri = TriMat::new((4, 4));
        tri.add_triplet(0, 0, 1.0);
        let mut k: CsMat<f64> = tri.to_csr();
        assert!(eq.scale(&mut k, &mut [0.0; 4]).is_err());
    }
}
