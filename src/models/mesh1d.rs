//! One-dimensional two-node mesh shared by the three reference fields
//!
//! All three fields live on the same nodes. Dofs are numbered field by
//! field: structure first (one displacement per node), then scalar transport
//! (`num_scal` species per node), then thermo (one temperature per node).

use std::collections::BTreeMap;

use crate::error::{SstiError, SstiResult};
use crate::fem::{ElementFace, FaceNode, InterfaceSide, RowMap, Subproblem};

/// Two-node line element
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Element1d {
    pub nodes: [usize; 2],
    /// Element block (material region) id
    pub block: usize,
}

/// Matching-node interface between two element blocks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterfaceCondition {
    pub id: usize,
    pub master_node: usize,
    pub master_element: usize,
    pub slave_node: usize,
    pub slave_element: usize,
}

#[derive(Debug, Clone)]
pub struct Mesh1d {
    coords: Vec<f64>,
    elements: Vec<Element1d>,
    node_sets: BTreeMap<String, Vec<usize>>,
    interfaces: Vec<InterfaceCondition>,
}

impl Mesh1d {
    /// `n_elements` equal elements on `[0, length]`
    ///
    /// Node sets: "left", "right", "all".
    pub fn uniform(n_elements: usize, length: f64) -> Self {
        assert!(n_elements > 0, "mesh needs at least one element");
        let h = length / n_elements as f64;
        let coords: Vec<f64> = (0..=n_elements).map(|i| i as f64 * h).collect();
        let elements = (0..n_elements)
            .map(|e| Element1d { nodes: [e, e + 1], block: 0 })
            .collect();

        let mut node_sets = BTreeMap::new();
        node_sets.insert("left".to_string(), vec![0]);
        node_sets.insert("right".to_string(), vec![n_elements]);
        node_sets.insert("all".to_string(), (0..=n_elements).collect());

        Self { coords, elements, node_sets, interfaces: Vec::new() }
    }

    /// Two element blocks on `[0, split]` and `[split, length]` with
    /// different element sizes, tied at `split` by a matching-node interface
    ///
    /// The interface node is duplicated: the last node of block 0 is the
    /// master, the first node of block 1 the slave. Node sets: "left",
    /// "right", "all", "master", "slave".
    pub fn two_blocks(n_left: usize, n_right: usize, split: f64, length: f64) -> Self {
        assert!(n_left > 0 && n_right > 0, "each block needs at least one element");
        assert!(split > 0.0 && split < length, "interface must lie inside the bar");

        let h_left = split / n_left as f64;
        let h_right = (length - split) / n_right as f64;

        let mut coords: Vec<f64> = (0..=n_left).map(|i| i as f64 * h_left).collect();
        let master = n_left;
        let slave = coords.len();
        coords.extend((0..=n_right).map(|i| split + i as f64 * h_right));
        coords[master] = split;
        coords[slave] = split;

        let mut elements: Vec<Element1d> = (0..n_left)
            .map(|e| Element1d { nodes: [e, e + 1], block: 0 })
            .collect();
        elements.extend((0..n_right).map(|e| Element1d { nodes: [slave + e, slave + e + 1], block: 1 }));

        let last = coords.len() - 1;
        let mut node_sets = BTreeMap::new();
        node_sets.insert("left".to_string(), vec![0]);
        node_sets.insert("right".to_string(), vec![last]);
        node_sets.insert("all".to_string(), (0..coords.len()).collect());
        node_sets.insert("master".to_string(), vec![master]);
        node_sets.insert("slave".to_string(), vec![slave]);

        let interfaces = vec![InterfaceCondition {
            id: 0,
            master_node: master,
            master_element: n_left - 1,
            slave_node: slave,
            slave_element: n_left,
        }];

        Self { coords, elements, node_sets, interfaces }
    }

    pub fn num_nodes(&self) -> usize {
        self.coords.len()
    }

    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }

    pub fn coord(&self, node: usize) -> f64 {
        self.coords[node]
    }

    pub fn coords(&self) -> &[f64] {
        &self.coords
    }

    pub fn elements(&self) -> &[Element1d] {
        &self.elements
    }

    /// Reference length of element `e`
    pub fn element_length(&self, e: usize) -> f64 {
        let [a, b] = self.elements[e].nodes;
        self.coords[b] - self.coords[a]
    }

    pub fn node_set(&self, name: &str) -> SstiResult<&[usize]> {
        self.node_sets
            .get(name)
            .map(|s| s.as_slice())
            .ok_or_else(|| SstiError::Config(format!("unknown node set '{}'", name)))
    }

    pub fn add_node_set(&mut self, name: &str, nodes: Vec<usize>) {
        self.node_sets.insert(name.to_string(), nodes);
    }

    pub fn interfaces(&self) -> &[InterfaceCondition] {
        &self.interfaces
    }

    /// Conditioned faces of all interfaces, carrying the dofs of field `f`
    pub fn interface_faces(&self, layout: &DofLayout, f: Subproblem) -> Vec<ElementFace> {
        let face = |interface: usize, element: usize, node: usize, side: InterfaceSide| ElementFace {
            element,
            interface,
            side,
            nodes: vec![FaceNode {
                gid: node,
                coords: [self.coords[node], 0.0, 0.0],
                dofs: layout.node_dofs(f, node),
            }],
        };
        self.interfaces
            .iter()
            .flat_map(|c| {
                [
                    face(c.id, c.master_element, c.master_node, InterfaceSide::Master),
                    face(c.id, c.slave_element, c.slave_node, InterfaceSide::Slave),
                ]
            })
            .collect()
    }
}

/// Dof numbering of the three fields on one mesh
#[derive(Debug, Clone)]
pub struct DofLayout {
    num_nodes: usize,
    num_scal: usize,
    maps: [RowMap; 3],
}

impl DofLayout {
    pub fn new(num_nodes: usize, num_scal: usize) -> Self {
        assert!(num_scal > 0, "scalar transport needs at least one species");
        let maps = [
            RowMap::contiguous(0, num_nodes),
            RowMap::contiguous(num_nodes, num_nodes * num_scal),
            RowMap::contiguous(num_nodes * (1 + num_scal), num_nodes),
        ];
        Self { num_nodes, num_scal, maps }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_scal(&self) -> usize {
        self.num_scal
    }

    pub fn map(&self, f: Subproblem) -> &RowMap {
        &self.maps[f.position()]
    }

    /// Field-local lid of `component` at `node`
    pub fn lid(&self, f: Subproblem, node: usize, component: usize) -> usize {
        match f {
            Subproblem::ScalarTransport => node * self.num_scal + component,
            Subproblem::Structure | Subproblem::Thermo => node,
        }
    }

    pub fn dofs_per_node(&self, f: Subproblem) -> usize {
        match f {
            Subproblem::ScalarTransport => self.num_scal,
            Subproblem::Structure | Subproblem::Thermo => 1,
        }
    }

    /// Dof gids of `node` in field `f`
    pub fn node_dofs(&self, f: Subproblem, node: usize) -> Vec<usize> {
        let map = self.map(f);
        (0..self.dofs_per_node(f)).map(|k| map.gid(self.lid(f, node, k))).collect()
    }

    /// One row map per scalar species
    pub fn species_maps(&self) -> SstiResult<Vec<RowMap>> {
        let map = self.map(Subproblem::ScalarTransport);
        (0..self.num_scal)
            .map(|k| RowMap::new((0..self.num_nodes).map(|n| map.gid(n * self.num_scal + k)).collect()))
            .collect()
    }
}

/// Prescribed value `value + rate * t` on a node set
#[derive(Debug, Clone, PartialEq)]
pub struct Dirichlet {
    pub nodes: Vec<usize>,
    /// Dof component at each node (species index for scalar transport)
    pub component: usize,
    pub value: f64,
    pub rate: f64,
}

impl Dirichlet {
    pub fn fixed(nodes: &[usize], component: usize, value: f64) -> Self {
        Self { nodes: nodes.to_vec(), component, value, rate: 0.0 }
    }

    pub fn ramp(nodes: &[usize], component: usize, value: f64, rate: f64) -> Self {
        Self { nodes: nodes.to_vec(), component, value, rate }
    }

    pub fn value_at(&self, time: f64) -> f64 {
        self.value + self.rate * time
    }
}

/// Dirichlet condition resolved to one field-local dof
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DirichletDof {
    pub gid: usize,
    pub lid: usize,
    pub value: f64,
    pub rate: f64,
}

/// Resolve node-set conditions to dofs of field `f`
pub(crate) fn resolve_dirichlet(
    conditions: &[Dirichlet],
    layout: &DofLayout,
    f: Subproblem,
) -> SstiResult<Vec<DirichletDof>> {
    let mut dofs: Vec<DirichletDof> = Vec::new();
    for c in conditions {
        if c.component >= layout.dofs_per_node(f) {
            return Err(SstiError::Config(format!(
                "Dirichlet component {} out of range for field '{}'",
                c.component, f
            )));
        }
        for &node in &c.nodes {
            if node >= layout.num_nodes() {
                return Err(SstiError::Config(format!("Dirichlet node {} does not exist", node)));
            }
            let lid = layout.lid(f, node, c.component);
            let dof = DirichletDof { gid: layout.map(f).gid(lid), lid, value: c.value, rate: c.rate };
            // a later condition on the same dof overrides the earlier one
            match dofs.iter_mut().find(|d| d.lid == lid) {
                Some(existing) => *existing = dof,
                None => dofs.push(dof),
            }
        }
    }
    dofs.sort_by_key(|d| d.lid);
    Ok(dofs)
}
