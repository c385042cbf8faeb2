//! Block system matrix of the coupled problem
//!
//! A B×B grid of sparse cells laid over the block map of a [`DofMap`].
//! Fields assemble with field-local indices; the matrix routes every entry
//! to its cell. Per Newton step the matrix runs through
//! `Cleared -> Filling -> Completed -> ReadyToSolve`.

use std::collections::HashMap;

use sprs::{CsMat, TriMat};

use crate::coupling::InterfaceMeshtying;
use crate::error::{SstiError, SstiResult};
use crate::fem::{Contribution, DofMap, Subproblem};

/// Lifecycle state of the system matrix within one Newton step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixState {
    Cleared,
    Filling,
    Completed,
    ReadyToSolve,
}

/// One cell of the block grid
#[derive(Debug)]
struct SparseCell {
    shape: (usize, usize),
    triplets: TriMat<f64>,
    completed: Option<CsMat<f64>>,
}

impl SparseCell {
    fn new(shape: (usize, usize)) -> Self {
        Self {
            shape,
            triplets: TriMat::new(shape),
            completed: None,
        }
    }

    fn clear(&mut self) {
        self.triplets = TriMat::new(self.shape);
        self.completed = None;
    }

    fn complete(&mut self) {
        let mat: CsMat<f64> = self.triplets.to_csr();
        self.completed = Some(mat);
        self.triplets = TriMat::new(self.shape);
    }

    /// Move the completed entries back into the triplet buffer
    fn un_complete(&mut self) {
        if let Some(mat) = self.completed.take() {
            let mut tri = TriMat::new(self.shape);
            for (row, vec) in mat.outer_iterator().enumerate() {
                for (col, &val) in vec.iter() {
                    tri.add_triplet(row, col, val);
                }
            }
            self.triplets = tri;
        }
    }

    /// Drain all entries as (row, col, value), leaving the cell empty
    fn drain(&mut self) -> Vec<(usize, usize, f64)> {
        let entries = self
            .triplets
            .row_inds()
            .iter()
            .zip(self.triplets.col_inds())
            .zip(self.triplets.data())
            .map(|((&r, &c), &v)| (r, c, v))
            .collect();
        self.triplets = TriMat::new(self.shape);
        entries
    }
}

/// Block-sparse system matrix over the block map of a [`DofMap`]
///
/// With sparse storage the grid has a single cell holding the whole system.
/// Ownership is tracked per field pair: diagonal pairs are always owned,
/// off-diagonal pairs only if their coupling is active.
#[derive(Debug)]
pub struct BlockSystemMatrix {
    dofs: DofMap,
    num_blocks: usize,
    cells: Vec<SparseCell>,
    owned: [[bool; 3]; 3],
    /// (block, lid within block) of every field-local lid, per field
    field_to_block: [Vec<(usize, usize)>; 3],
    /// (block, lid within block) of every full-map lid
    full_to_block: Vec<(usize, usize)>,
    state: MatrixState,
}

impl BlockSystemMatrix {
    /// Create the cell grid
    ///
    /// # Arguments
    /// * `dofs` - dof enumeration (defines block layout)
    /// * `active` - `active[f][g]` is true if the (f, g) coupling block is assembled
    pub fn new(dofs: &DofMap, active: [[bool; 3]; 3]) -> Self {
        let blocks = dofs.block_extractor();
        let num_blocks = blocks.num_maps();

        let mut cells = Vec::with_capacity(num_blocks * num_blocks);
        for i in 0..num_blocks {
            for j in 0..num_blocks {
                cells.push(SparseCell::new((blocks.map(i).len(), blocks.map(j).len())));
            }
        }

        let mut owned = active;
        for (i, row) in owned.iter_mut().enumerate() {
            row[i] = true;
        }

        let full_to_block: Vec<(usize, usize)> = (0..dofs.full_map().len()).map(|lid| blocks.owner(lid)).collect();
        let field_to_block = Subproblem::ALL.map(|f| {
            (0..dofs.field_map(f).len())
                .map(|lid| full_to_block[dofs.full_lid(f, lid)])
                .collect::<Vec<_>>()
        });

        Self {
            dofs: dofs.clone(),
            num_blocks,
            cells,
            owned,
            field_to_block,
            full_to_block,
            state: MatrixState::Cleared,
        }
    }

    pub fn state(&self) -> MatrixState {
        self.state
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn dof_map(&self) -> &DofMap {
        &self.dofs
    }

    /// True if entries of the (row, col) field pair may be assembled
    pub fn is_owned(&self, row: Subproblem, col: Subproblem) -> bool {
        self.owned[row.position()][col.position()]
    }

    /// Zero all owned cells
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.clear();
        }
        self.state = MatrixState::Cleared;
    }

    /// Add a field's diagonal block (field-local rows and columns)
    pub fn assemble(&mut self, f: Subproblem, diagonal: &CsMat<f64>) -> SstiResult<()> {
        self.add_field_matrix(f, f, diagonal)
    }

    /// Add the linearisation of `row`'s residual w.r.t. `col`'s dofs
    pub fn assemble_off_diagonal(
        &mut self,
        row: Subproblem,
        col: Subproblem,
        matrix: &CsMat<f64>,
        contribution: Contribution,
    ) -> SstiResult<()> {
        if row == col {
            return Err(SstiError::assembly(
                Some(row),
                format!("{:?} contribution of a diagonal block assembled as off-diagonal", contribution),
            ));
        }
        self.add_field_matrix(row, col, matrix)
    }

    fn add_field_matrix(&mut self, row: Subproblem, col: Subproblem, matrix: &CsMat<f64>) -> SstiResult<()> {
        self.check_mutable(row)?;
        if !self.is_owned(row, col) {
            return Err(SstiError::assembly(
                Some(row),
                format!("coupling block ({}, {}) is not active", row, col),
            ));
        }
        let shape = (self.dofs.field_map(row).len(), self.dofs.field_map(col).len());
        if (matrix.rows(), matrix.cols()) != shape {
            return Err(SstiError::assembly(
                Some(row),
                format!(
                    "block ({}, {}) has shape {}x{}, expected {}x{}",
                    row,
                    col,
                    matrix.rows(),
                    matrix.cols(),
                    shape.0,
                    shape.1
                ),
            ));
        }

        let rows = &self.field_to_block[row.position()];
        let cols = &self.field_to_block[col.position()];
        for (lrow, vec) in matrix.outer_iterator().enumerate() {
            let (bi, i) = rows[lrow];
            for (lcol, &val) in vec.iter() {
                let (bj, j) = cols[lcol];
                self.cells[bi * self.num_blocks + bj].triplets.add_triplet(i, j, val);
            }
        }
        self.state = MatrixState::Filling;
        Ok(())
    }

    fn check_mutable(&self, field: Subproblem) -> SstiResult<()> {
        match self.state {
            MatrixState::Cleared | MatrixState::Filling => Ok(()),
            _ => Err(SstiError::assembly(
                Some(field),
                "system matrix is completed; un_complete() before adding entries",
            )),
        }
    }

    /// Add an entry in full-map coordinates
    fn push_full(&mut self, row: usize, col: usize, val: f64) {
        let (bi, i) = self.full_to_block[row];
        let (bj, j) = self.full_to_block[col];
        self.cells[bi * self.num_blocks + bj].triplets.add_triplet(i, j, val);
    }

    /// Take every entry out of the cells, in full-map coordinates
    fn drain_full(&mut self) -> Vec<(usize, usize, f64)> {
        let blocks = self.dofs.block_extractor();
        let mut entries = Vec::new();
        for bi in 0..self.num_blocks {
            for bj in 0..self.num_blocks {
                let cell = &mut self.cells[bi * self.num_blocks + bj];
                for (i, j, v) in cell.drain() {
                    entries.push((blocks.positions(bi)[i], blocks.positions(bj)[j], v));
                }
            }
        }
        entries
    }

    /// Condense the structural mesh-tying constraints into the matrix
    ///
    /// Every slave row is added onto its master row across all block columns.
    /// The slave row is then replaced by `e_s - e_m`, so the solve returns
    /// `Δu_s = Δu_m`. Must run before `complete()`.
    pub fn apply_meshtying(&mut self, meshtying: &InterfaceMeshtying) -> SstiResult<()> {
        self.check_mutable(Subproblem::Structure)?;
        let pairs = self.structural_pairs(meshtying)?;
        if pairs.is_empty() {
            return Ok(());
        }

        let slave_to_master: HashMap<usize, usize> = pairs.iter().copied().collect();
        for (row, col, val) in self.drain_full() {
            match slave_to_master.get(&row) {
                Some(&master) => self.push_full(master, col, val),
                None => self.push_full(row, col, val),
            }
        }
        for &(slave, master) in &pairs {
            self.push_full(slave, slave, 1.0);
            self.push_full(slave, master, -1.0);
        }
        self.state = MatrixState::Filling;
        Ok(())
    }

    /// Structural (slave, master) pairs as full-map lids
    fn structural_pairs(&self, meshtying: &InterfaceMeshtying) -> SstiResult<Vec<(usize, usize)>> {
        let map = self.dofs.field_map(Subproblem::Structure);
        meshtying
            .pairs(Subproblem::Structure)
            .iter()
            .map(|p| {
                let slave = map.lid(p.slave_dof).ok_or_else(|| {
                    SstiError::assembly_at_gid(Some(Subproblem::Structure), p.slave_dof, "slave dof not in structure map")
                })?;
                let master = map.lid(p.master_dof).ok_or_else(|| {
                    SstiError::assembly_at_gid(Some(Subproblem::Structure), p.master_dof, "master dof not in structure map")
                })?;
                Ok((
                    self.dofs.full_lid(Subproblem::Structure, slave),
                    self.dofs.full_lid(Subproblem::Structure, master),
                ))
            })
            .collect()
    }

    /// Finalise the sparsity of every cell
    pub fn complete(&mut self) {
        for cell in &mut self.cells {
            cell.complete();
        }
        self.state = MatrixState::Completed;
    }

    /// Reopen a completed matrix for further assembly
    pub fn un_complete(&mut self) {
        for cell in &mut self.cells {
            cell.un_complete();
        }
        self.state = MatrixState::Filling;
    }

    /// Impose Dirichlet rows given as full-map lids
    ///
    /// DBC rows become identity rows in the diagonal cell and zero rows
    /// everywhere else. Requires a completed matrix.
    pub fn apply_dirichlet(&mut self, dbc_rows: &[usize]) -> SstiResult<()> {
        if self.state != MatrixState::Completed && self.state != MatrixState::ReadyToSolve {
            return Err(SstiError::assembly(None, "Dirichlet conditions applied to an uncompleted system matrix"));
        }

        let mut is_dbc = vec![false; self.full_to_block.len()];
        for &row in dbc_rows {
            is_dbc[row] = true;
        }

        let blocks = self.dofs.block_extractor();
        for bi in 0..self.num_blocks {
            let rows = blocks.positions(bi);
            if !rows.iter().any(|&r| is_dbc[r]) {
                continue;
            }
            for bj in 0..self.num_blocks {
                let cell = &mut self.cells[bi * self.num_blocks + bj];
                let Some(mat) = cell.completed.as_ref() else { continue };

                let mut tri = TriMat::new(cell.shape);
                for (i, vec) in mat.outer_iterator().enumerate() {
                    if is_dbc[rows[i]] {
                        continue;
                    }
                    for (j, &val) in vec.iter() {
                        tri.add_triplet(i, j, val);
                    }
                }
                if bi == bj {
                    for (i, &r) in rows.iter().enumerate() {
                        if is_dbc[r] {
                            tri.add_triplet(i, i, 1.0);
                        }
                    }
                }
                cell.completed = Some(tri.to_csr());
            }
        }

        self.state = MatrixState::ReadyToSolve;
        Ok(())
    }

    /// Completed cell (bi, bj)
    pub fn block(&self, bi: usize, bj: usize) -> Option<&CsMat<f64>> {
        self.cells[bi * self.num_blocks + bj].completed.as_ref()
    }

    /// The whole system as one full-map sized matrix
    pub fn merged(&self) -> SstiResult<CsMat<f64>> {
        if !matches!(self.state, MatrixState::Completed | MatrixState::ReadyToSolve) {
            return Err(SstiError::assembly(None, "system matrix merged before complete()"));
        }
        let n = self.full_to_block.len();
        let blocks = self.dofs.block_extractor();
        let mut tri = TriMat::new((n, n));
        for bi in 0..self.num_blocks {
            for bj in 0..self.num_blocks {
                let Some(mat) = self.block(bi, bj) else { continue };
                for (i, vec) in mat.outer_iterator().enumerate() {
                    for (j, &val) in vec.iter() {
                        tri.add_triplet(blocks.positions(bi)[i], blocks.positions(bj)[j], val);
                    }
                }
            }
        }
        Ok(tri.to_csr())
    }
}
