use std::collections::HashMap;

use sprs::{CsMat, TriMat};

use crate::error::{SstiError, SstiResult};
use crate::fem::Subproblem;

/// Row map: an ordered set of unique global dof ids (gids)
///
/// The position of a gid inside the map is its local id (lid). Maps are
/// immutable once built; everything that needs a different layout builds a
/// new map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMap {
    gids: Vec<usize>,
    lids: HashMap<usize, usize>,
}

impl RowMap {
    /// Build a map from an ordered list of gids
    ///
    /// Duplicate gids are rejected.
    pub fn new(gids: Vec<usize>) -> SstiResult<Self> {
        let mut lids = HashMap::with_capacity(gids.len());
        for (lid, &gid) in gids.iter().enumerate() {
            if lids.insert(gid, lid).is_some() {
                return Err(SstiError::assembly_at_gid(None, gid, "duplicate gid in row map"));
            }
        }
        Ok(Self { gids, lids })
    }

    /// Map with gids `offset..offset + len`
    pub fn contiguous(offset: usize, len: usize) -> Self {
        let gids: Vec<usize> = (offset..offset + len).collect();
        let lids = gids.iter().enumerate().map(|(lid, &gid)| (gid, lid)).collect();
        Self { gids, lids }
    }

    /// Union of disjoint maps, concatenated in the given order
    pub fn merge(maps: &[&RowMap]) -> SstiResult<Self> {
        let gids: Vec<usize> = maps.iter().flat_map(|m| m.gids.iter().copied()).collect();
        Self::new(gids)
    }

    pub fn len(&self) -> usize {
        self.gids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gids.is_empty()
    }

    pub fn gids(&self) -> &[usize] {
        &self.gids
    }

    /// Global id of local index `lid`
    pub fn gid(&self, lid: usize) -> usize {
        self.gids[lid]
    }

    /// Local index of global id `gid`, if owned
    pub fn lid(&self, gid: usize) -> Option<usize> {
        self.lids.get(&gid).copied()
    }

    pub fn contains(&self, gid: usize) -> bool {
        self.lids.contains_key(&gid)
    }

    /// FNV-1a hash of the gid sequence
    ///
    /// Two maps have the same fingerprint iff they list the same gids in the
    /// same order (up to hash collisions). Used to validate restart data.
    pub fn fingerprint(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET;
        for &gid in &self.gids {
            for byte in (gid as u64).to_le_bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }
        hash
    }
}

/// Splits a full map into disjoint sub-maps and moves vectors between them
///
/// `extract_vector` and `insert_vector` are exact inverses on the entries of
/// one sub-map.
#[derive(Debug, Clone)]
pub struct MapExtractor {
    full: RowMap,
    maps: Vec<RowMap>,
    /// Full-map lid of every lid of every sub-map
    positions: Vec<Vec<usize>>,
    /// (sub-map, lid within sub-map) of every full-map lid
    owners: Vec<(usize, usize)>,
}

impl MapExtractor {
    /// Build an extractor; the sub-maps must partition `full`
    pub fn new(full: RowMap, maps: Vec<RowMap>) -> SstiResult<Self> {
        let mut owners = vec![(usize::MAX, usize::MAX); full.len()];
        let mut positions = Vec::with_capacity(maps.len());

        for (imap, map) in maps.iter().enumerate() {
            let mut pos = Vec::with_capacity(map.len());
            for (lid, &gid) in map.gids().iter().enumerate() {
                let full_lid = full.lid(gid).ok_or_else(|| {
                    SstiError::assembly_at_gid(None, gid, "sub-map gid missing from full map")
                })?;
                if owners[full_lid].0 != usize::MAX {
                    return Err(SstiError::assembly_at_gid(None, gid, "sub-maps overlap"));
                }
                owners[full_lid] = (imap, lid);
                pos.push(full_lid);
            }
            positions.push(pos);
        }

        if let Some(lid) = owners.iter().position(|o| o.0 == usize::MAX) {
            return Err(SstiError::assembly_at_gid(
                None,
                full.gid(lid),
                "full map gid not covered by any sub-map",
            ));
        }

        Ok(Self { full, maps, positions, owners })
    }

    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn full_map(&self) -> &RowMap {
        &self.full
    }

    pub fn map(&self, i: usize) -> &RowMap {
        &self.maps[i]
    }

    /// Full-map lids of the entries of sub-map `i`
    pub fn positions(&self, i: usize) -> &[usize] {
        &self.positions[i]
    }

    /// (sub-map, lid within sub-map) owning full-map lid `full_lid`
    pub fn owner(&self, full_lid: usize) -> (usize, usize) {
        self.owners[full_lid]
    }

    /// Copy the entries of sub-map `i` out of a full vector
    pub fn extract_vector(&self, full: &[f64], i: usize) -> Vec<f64> {
        assert_eq!(full.len(), self.full.len(), "full vector does not match full map");
        self.positions[i].iter().map(|&p| full[p]).collect()
    }

    /// Overwrite the entries of sub-map `i` inside a full vector
    pub fn insert_vector(&self, sub: &[f64], i: usize, full: &mut [f64]) {
        assert_eq!(sub.len(), self.maps[i].len(), "sub vector does not match sub-map {}", i);
        assert_eq!(full.len(), self.full.len(), "full vector does not match full map");
        for (&p, &v) in self.positions[i].iter().zip(sub) {
            full[p] = v;
        }
    }
}

/// Storage layout of the global system matrix, fixed at setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMatrixType {
    /// One monolithic sparse matrix
    #[default]
    Sparse,
    /// Block sparse matrix: one block for the structure, one per scalar/thermo block
    Block,
}

/// Global dof enumeration of the coupled problem
///
/// Holds the full map (structure, scatra, thermo in canonical order), the
/// per-field maps, and the block maps of the system matrix. Every split of
/// full vectors or matrices into field or block pieces goes through here.
#[derive(Debug, Clone)]
pub struct DofMap {
    fields: MapExtractor,
    blocks: MapExtractor,
    /// Sub-blocks of each field in canonical order (e.g. one per scalar species)
    field_blocks: [Vec<RowMap>; 3],
    /// Indices into `blocks` owned by each field
    block_positions: [Vec<usize>; 3],
    matrix_type: SystemMatrixType,
}

impl DofMap {
    /// Build the dof enumeration
    ///
    /// # Arguments
    /// * `field_maps` - row maps of structure, scatra, thermo (canonical order)
    /// * `field_blocks` - per-field sub-block maps; an empty list means "one block"
    /// * `matrix_type` - storage layout of the system matrix
    pub fn new(
        field_maps: [RowMap; 3],
        field_blocks: [Vec<RowMap>; 3],
        matrix_type: SystemMatrixType,
    ) -> SstiResult<Self> {
        for f in Subproblem::ALL {
            if field_maps[f.position()].is_empty() {
                return Err(SstiError::assembly(
                    Some(f),
                    "discretization does not have any degrees of freedom",
                ));
            }
        }

        let full = RowMap::merge(&[&field_maps[0], &field_maps[1], &field_maps[2]])?;
        let [structure, scatra, thermo] = field_maps;
        let maps = vec![structure, scatra, thermo];

        // every field is at least one block; sub-blocks must partition the field map
        let mut blocks_per_field: [Vec<RowMap>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for (i, sub) in field_blocks.into_iter().enumerate() {
            if sub.is_empty() {
                blocks_per_field[i] = vec![maps[i].clone()];
            } else {
                MapExtractor::new(maps[i].clone(), sub.clone())?;
                blocks_per_field[i] = sub;
            }
        }

        let fields = MapExtractor::new(full.clone(), maps)?;

        let (block_list, block_positions) = match matrix_type {
            SystemMatrixType::Sparse => (vec![full.clone()], [vec![0], vec![0], vec![0]]),
            SystemMatrixType::Block => {
                let mut list = Vec::new();
                let mut positions: [Vec<usize>; 3] = [Vec::new(), Vec::new(), Vec::new()];
                for (i, sub) in blocks_per_field.iter().enumerate() {
                    for map in sub {
                        positions[i].push(list.len());
                        list.push(map.clone());
                    }
                }
                (list, positions)
            }
        };
        let blocks = MapExtractor::new(full, block_list)?;

        Ok(Self {
            fields,
            blocks,
            field_blocks: blocks_per_field,
            block_positions,
            matrix_type,
        })
    }

    pub fn matrix_type(&self) -> SystemMatrixType {
        self.matrix_type
    }

    pub fn full_map(&self) -> &RowMap {
        self.fields.full_map()
    }

    pub fn field_map(&self, f: Subproblem) -> &RowMap {
        self.fields.map(f.position())
    }

    /// Number of sub-blocks of field `f`
    pub fn num_field_blocks(&self, f: Subproblem) -> usize {
        self.field_blocks[f.position()].len()
    }

    /// i-th sub-block map of field `f`, `0 <= i < num_field_blocks(f)`
    pub fn block_map(&self, f: Subproblem, i: usize) -> &RowMap {
        &self.field_blocks[f.position()][i]
    }

    /// Extractor between the full map and the field maps
    pub fn field_extractor(&self) -> &MapExtractor {
        &self.fields
    }

    /// Extractor between the full map and the system matrix blocks
    pub fn block_extractor(&self) -> &MapExtractor {
        &self.blocks
    }

    /// Total number of system matrix blocks (1 for sparse storage)
    pub fn num_blocks(&self) -> usize {
        self.blocks.num_maps()
    }

    /// System matrix block indices owned by field `f`
    pub fn block_positions(&self, f: Subproblem) -> &[usize] {
        &self.block_positions[f.position()]
    }

    /// Field owning full-map lid `full_lid`
    pub fn field_of(&self, full_lid: usize) -> Subproblem {
        Subproblem::from_position(self.fields.owner(full_lid).0)
    }

    pub fn extract(&self, full: &[f64], f: Subproblem) -> Vec<f64> {
        self.fields.extract_vector(full, f.position())
    }

    pub fn insert(&self, field: &[f64], f: Subproblem, full: &mut [f64]) {
        self.fields.insert_vector(field, f.position(), full)
    }

    /// Full-map lid of field `f`'s local index `lid`
    pub fn full_lid(&self, f: Subproblem, lid: usize) -> usize {
        self.fields.positions(f.position())[lid]
    }

    /// Cut the (row, col) field block out of a full-map sized matrix
    pub fn split(&self, full: &CsMat<f64>, row: Subproblem, col: Subproblem) -> CsMat<f64> {
        let n = self.full_map().len();
        assert_eq!((full.rows(), full.cols()), (n, n), "matrix does not match full map");

        let row_map = self.field_map(row);
        let col_map = self.field_map(col);
        let mut tri = TriMat::new((row_map.len(), col_map.len()));

        for &full_row in self.fields.positions(row.position()) {
            let (_, local_row) = self.fields.owner(full_row);
            if let Some(row_vec) = full.outer_view(full_row) {
                for (full_col, &val) in row_vec.iter() {
                    let (owner, local_col) = self.fields.owner(full_col);
                    if owner == col.position() {
                        tri.add_triplet(local_row, local_col, val);
                    }
                }
            }
        }

        tri.to_csr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_field_maps() -> [RowMap; 3] {
        [
            RowMap::contiguous(0, 4),
            RowMap::contiguous(4, 4),
            RowMap::contiguous(8, 2),
        ]
    }

    #[test]
    fn test_row_map_lookup() {
        let map = RowMap::new(vec![10, 3, 7]).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.lid(3), Some(1));
        assert_eq!(map.gid(2), 7);
        assert!(!map.contains(4));
    }

    #[test]
    fn test_row_map_rejects_duplicates() {
        assert!(RowMap::new(vec![1, 2, 1]).is_err());
    }

    #[test]
    fn test_fingerprint_depends_on_order() {
        let a = RowMap::new(vec![0, 1, 2]).unwrap();
        let b = RowMap::new(vec![0, 2, 1]).unwrap();
        assert_eq!(a.fingerprint(), RowMap::contiguous(0, 3).fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_extract_insert_round_trip() {
        let dofs = DofMap::new(three_field_maps(), [vec![], vec![], vec![]], SystemMatrixType::Sparse).unwrap();
        for f in Subproblem::ALL {
            let v: Vec<f64> = (0..dofs.field_map(f).len()).map(|i| 1.5 * i as f64 + 1.0).collect();
            let mut full = vec![0.0; dofs.full_map().len()];
            dofs.insert(&v, f, &mut full);
            assert_eq!(dofs.extract(&full, f), v);
        }
    }

    #[test]
    fn test_block_positions_with_species_blocks() {
        let species = vec![
            RowMap::new(vec![4, 6]).unwrap(),
            RowMap::new(vec![5, 7]).unwrap(),
        ];
        let dofs = DofMap::new(three_field_maps(), [vec![], species, vec![]], SystemMatrixType::Block).unwrap();

        assert_eq!(dofs.num_blocks(), 4);
        assert_eq!(dofs.block_positions(Subproblem::Structure), &[0]);
        assert_eq!(dofs.block_positions(Subproblem::ScalarTransport), &[1, 2]);
        assert_eq!(dofs.block_positions(Subproblem::Thermo), &[3]);
        assert_eq!(dofs.block_map(Subproblem::ScalarTransport, 1).gids(), &[5, 7]);
    }

    #[test]
    fn test_sparse_layout_has_one_block() {
        let dofs = DofMap::new(three_field_maps(), [vec![], vec![], vec![]], SystemMatrixType::Sparse).unwrap();
        assert_eq!(dofs.num_blocks(), 1);
        assert_eq!(dofs.block_extractor().map(0).len(), 10);
    }

    #[test]
    fn test_species_blocks_must_partition_field() {
        let species = vec![RowMap::new(vec![4, 6]).unwrap()];
        let result = DofMap::new(three_field_maps(), [vec![], species, vec![]], SystemMatrixType::Block);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_field_is_rejected() {
        let maps = [RowMap::contiguous(0, 4), RowMap::contiguous(4, 0), RowMap::contiguous(4, 2)];
        let result = DofMap::new(maps, [vec![], vec![], vec![]], SystemMatrixType::Sparse);
        assert!(result.is_err());
    }

    #[test]
    fn test_split_off_diagonal_cell() {
        let dofs = DofMap::new(three_field_maps(), [vec![], vec![], vec![]], SystemMatrixType::Sparse).unwrap();
        let mut tri = TriMat::new((10, 10));
        tri.add_triplet(1, 5, 2.0); // structure row 1, scatra col 1
        tri.add_triplet(9, 0, 3.0); // thermo row 1, structure col 0
        tri.add_triplet(2, 2, 1.0);
        let full: CsMat<f64> = tri.to_csr();

        let s_c = dofs.split(&full, Subproblem::Structure, Subproblem::ScalarTransport);
        assert_eq!((s_c.rows(), s_c.cols()), (4, 4));
        assert_eq!(s_c.get(1, 1), Some(&2.0));
        assert_eq!(s_c.nnz(), 1);

        let t_s = dofs.split(&full, Subproblem::Thermo, Subproblem::Structure);
        assert_eq!(t_s.get(1, 0), Some(&3.0));
    }
}
