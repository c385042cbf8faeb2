//! Matching-node interface mesh-tying
//!
//! On each interface the slave-side nodes coincide with master-side nodes.
//! The slave dofs are dependent: after every linear solve they are
//! reconstructed from their masters, and before the solve the slave rows of
//! the structural equations are folded into the master rows.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{SstiError, SstiResult};
use crate::fem::{ElementFace, Fields, InterfaceSide, RowMap, Subproblem, MESHTYING_CONDITION};

/// Default distance below which two interface nodes are considered matching
pub const MATCHING_TOLERANCE: f64 = 1e-10;

/// One (master dof, slave dof) pair of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshtyingPair {
    pub interface: usize,
    pub master_node: usize,
    pub slave_node: usize,
    pub master_dof: usize,
    pub slave_dof: usize,
}

/// Pairing of one field
#[derive(Debug, Clone, Default)]
struct FieldCoupling {
    pairs: Vec<MeshtyingPair>,
    /// Unique master dofs in first-seen order
    master_dofs: Vec<usize>,
    /// Index into `master_dofs` for every pair
    master_index: Vec<usize>,
}

impl FieldCoupling {
    fn new(pairs: Vec<MeshtyingPair>) -> Self {
        let mut master_dofs = Vec::new();
        let mut seen: HashMap<usize, usize> = HashMap::new();
        let mut master_index = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            let idx = *seen.entry(pair.master_dof).or_insert_with(|| {
                master_dofs.push(pair.master_dof);
                master_dofs.len() - 1
            });
            master_index.push(idx);
        }
        Self { pairs, master_dofs, master_index }
    }
}

/// Master/slave dof bijection on all matching-node interfaces, for all fields
#[derive(Debug, Clone, Default)]
pub struct InterfaceMeshtying {
    couplings: [FieldCoupling; 3],
    /// Slave nodes of the structure and whether they currently enforce the constraint
    active_set: BTreeMap<usize, bool>,
}

impl InterfaceMeshtying {
    /// Pair the interface nodes of every field's discretization
    pub fn setup(fields: &Fields, tolerance: f64) -> SstiResult<Self> {
        let mut meshtying = Self::default();
        for f in Subproblem::ALL {
            let faces = fields.get(f).discretization().condition_on(MESHTYING_CONDITION);
            let pairs = pair_matching_nodes(&faces, tolerance)?;
            meshtying.couplings[f.position()] = FieldCoupling::new(pairs);
        }
        if meshtying.pairs(Subproblem::Structure).is_empty() {
            return Err(SstiError::Config(format!(
                "interface mesh-tying requested but the structure has no '{}' condition",
                MESHTYING_CONDITION
            )));
        }
        meshtying.active_set = meshtying
            .pairs(Subproblem::Structure)
            .iter()
            .map(|p| (p.slave_node, true))
            .collect();
        Ok(meshtying)
    }

    /// Build directly from pairs (structure pairs in slot 0, etc.)
    pub fn from_pairs(pairs: [Vec<MeshtyingPair>; 3]) -> Self {
        let [s, c, t] = pairs;
        let active_set = s.iter().map(|p| (p.slave_node, true)).collect();
        Self {
            couplings: [FieldCoupling::new(s), FieldCoupling::new(c), FieldCoupling::new(t)],
            active_set,
        }
    }

    pub fn pairs(&self, f: Subproblem) -> &[MeshtyingPair] {
        &self.couplings[f.position()].pairs
    }

    pub fn is_empty(&self) -> bool {
        self.couplings.iter().all(|c| c.pairs.is_empty())
    }

    /// Project master values onto the slave side (1-to-1 lookup)
    ///
    /// `v_master` holds one value per unique master dof in first-seen pair
    /// order; the result holds one value per pair.
    pub fn master_to_slave(&self, f: Subproblem, v_master: &[f64]) -> Vec<f64> {
        let coupling = &self.couplings[f.position()];
        assert_eq!(v_master.len(), coupling.master_dofs.len(), "master vector does not match master map");
        coupling.master_index.iter().map(|&m| v_master[m]).collect()
    }

    /// Fold slave values into their masters
    ///
    /// A master shared by several interfaces receives the sum of its slaves.
    pub fn slave_to_master(&self, f: Subproblem, v_slave: &[f64]) -> Vec<f64> {
        let coupling = &self.couplings[f.position()];
        assert_eq!(v_slave.len(), coupling.pairs.len(), "slave vector does not match slave map");
        let mut v_master = vec![0.0; coupling.master_dofs.len()];
        for (&m, &v) in coupling.master_index.iter().zip(v_slave) {
            v_master[m] += v;
        }
        v_master
    }

    /// Overwrite slave entries of a field vector with their master values
    pub fn copy_master_to_slave(&self, f: Subproblem, map: &RowMap, values: &mut [f64]) -> SstiResult<()> {
        let coupling = &self.couplings[f.position()];
        let v_master = coupling
            .master_dofs
            .iter()
            .map(|&gid| lid_of(map, gid, f).map(|lid| values[lid]))
            .collect::<SstiResult<Vec<f64>>>()?;
        let v_slave = self.master_to_slave(f, &v_master);
        for (pair, v) in coupling.pairs.iter().zip(v_slave) {
            values[lid_of(map, pair.slave_dof, f)?] = v;
        }
        Ok(())
    }

    /// Add slave entries of a field vector onto their masters and zero the slaves
    pub fn fold_slave_into_master(&self, f: Subproblem, map: &RowMap, values: &mut [f64]) -> SstiResult<()> {
        let coupling = &self.couplings[f.position()];
        let mut v_slave = Vec::with_capacity(coupling.pairs.len());
        for pair in &coupling.pairs {
            let lid = lid_of(map, pair.slave_dof, f)?;
            v_slave.push(values[lid]);
            values[lid] = 0.0;
        }
        let v_master = self.slave_to_master(f, &v_slave);
        for (&gid, v) in coupling.master_dofs.iter().zip(v_master) {
            values[lid_of(map, gid, f)?] += v;
        }
        Ok(())
    }

    /// Vector with master-side interface values copied onto the slave side
    pub fn master_side_view(&self, f: Subproblem, map: &RowMap, values: &[f64]) -> SstiResult<Vec<f64>> {
        let mut view = vec![0.0; values.len()];
        let coupling = &self.couplings[f.position()];
        for pair in &coupling.pairs {
            let m = lid_of(map, pair.master_dof, f)?;
            let s = lid_of(map, pair.slave_dof, f)?;
            view[s] = values[m];
        }
        Ok(view)
    }

    /// Vector holding only the slave-side interface values
    pub fn slave_side_view(&self, f: Subproblem, map: &RowMap, values: &[f64]) -> SstiResult<Vec<f64>> {
        let mut view = vec![0.0; values.len()];
        for pair in self.pairs(f) {
            let s = lid_of(map, pair.slave_dof, f)?;
            view[s] = values[s];
        }
        Ok(view)
    }

    /// Record the structural Dirichlet dofs and reject slave dofs among them
    ///
    /// A slave dof with a Dirichlet condition would be constrained twice.
    pub fn store_dirichlet_status(&mut self, dbc_dofs: &[usize]) -> SstiResult<()> {
        let dbc: HashSet<usize> = dbc_dofs.iter().copied().collect();
        for pair in self.pairs(Subproblem::Structure) {
            if dbc.contains(&pair.slave_dof) {
                return Err(SstiError::MeshtyingConflict {
                    node: pair.slave_node,
                    dof: pair.slave_dof,
                    interface: pair.interface,
                });
            }
        }
        Ok(())
    }

    /// Active-set flags of the structural slave nodes
    pub fn active_set(&self) -> Vec<(usize, bool)> {
        self.active_set.iter().map(|(&n, &a)| (n, a)).collect()
    }

    /// Restore active-set flags; the slave node set must be unchanged
    pub fn restore_active_set(&mut self, flags: &[(usize, bool)]) -> SstiResult<()> {
        if flags.len() != self.active_set.len() {
            return Err(SstiError::Restart(format!(
                "mesh-tying active set has {} slave nodes, restart data {}",
                self.active_set.len(),
                flags.len()
            )));
        }
        for &(node, active) in flags {
            match self.active_set.get_mut(&node) {
                Some(flag) => *flag = active,
                None => {
                    return Err(SstiError::Restart(format!(
                        "restart data names unknown mesh-tying slave node {}",
                        node
                    )))
                }
            }
        }
        Ok(())
    }
}

fn lid_of(map: &RowMap, gid: usize, f: Subproblem) -> SstiResult<usize> {
    map.lid(gid)
        .ok_or_else(|| SstiError::assembly_at_gid(Some(f), gid, "mesh-tying dof not in field map"))
}

#[derive(Debug, Clone)]
struct InterfaceNode {
    gid: usize,
    coords: [f64; 3],
    dofs: Vec<usize>,
}

/// Pair every slave node with the coincident master node of the same interface
fn pair_matching_nodes(faces: &[ElementFace], tolerance: f64) -> SstiResult<Vec<MeshtyingPair>> {
    // (interface, node gid) -> node, deduplicated across faces
    let mut masters: BTreeMap<(usize, usize), InterfaceNode> = BTreeMap::new();
    let mut slaves: BTreeMap<(usize, usize), InterfaceNode> = BTreeMap::new();

    for face in faces {
        let target = match face.side {
            InterfaceSide::Master => &mut masters,
            InterfaceSide::Slave => &mut slaves,
        };
        for node in &face.nodes {
            target.entry((face.interface, node.gid)).or_insert_with(|| InterfaceNode {
                gid: node.gid,
                coords: node.coords,
                dofs: node.dofs.clone(),
            });
        }
    }

    let mut pairs = Vec::new();
    let mut slave_dofs_seen = HashSet::new();

    for (&(interface, slave_gid), slave) in &slaves {
        if masters.contains_key(&(interface, slave_gid)) {
            return Err(SstiError::Config(format!(
                "node {} is master and slave on interface {}",
                slave_gid, interface
            )));
        }

        let mut candidates = masters
            .range((interface, 0)..=(interface, usize::MAX))
            .map(|(_, m)| m)
            .filter(|m| distance(&m.coords, &slave.coords) < tolerance);

        let master = candidates.next().ok_or_else(|| {
            SstiError::Config(format!(
                "slave node {} on interface {} has no matching master node",
                slave_gid, interface
            ))
        })?;
        if candidates.next().is_some() {
            return Err(SstiError::Config(format!(
                "slave node {} on interface {} matches more than one master node",
                slave_gid, interface
            )));
        }
        if master.dofs.len() != slave.dofs.len() {
            return Err(SstiError::Config(format!(
                "slave node {} has {} dofs but master node {} has {}",
                slave_gid,
                slave.dofs.len(),
                master.gid,
                master.dofs.len()
            )));
        }

        for (&m_dof, &s_dof) in master.dofs.iter().zip(&slave.dofs) {
            if !slave_dofs_seen.insert(s_dof) {
                return Err(SstiError::Config(format!(
                    "slave dof {} is tied on more than one interface",
                    s_dof
                )));
            }
            pairs.push(MeshtyingPair {
                interface,
                master_node: master.gid,
                slave_node: slave_gid,
                master_dof: m_dof,
                slave_dof: s_dof,
            });
        }
    }

    Ok(pairs)
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}
