//! Problem builders shared by the integration tests
#![allow(dead_code)]

use ssti_solver::models::{
    Dirichlet, DofLayout, InterfaceKinetics, Mesh1d, PointLoad, ScalarTransportField, ScatraParams, StructureField,
    StructureParams, ThermoField, ThermoParams,
};
use ssti_solver::{Fields, SstiConfig};

pub fn config(dt: f64, max_time: f64) -> SstiConfig {
    let mut config = SstiConfig::default();
    config.time.dt = dt;
    config.time.max_time = max_time;
    config
}

/// Scatra with unit source between two homogeneous ends; clamped, unloaded bar
pub fn diffusion_fields(n: usize) -> Fields {
    let mesh = Mesh1d::uniform(n, 1.0);
    let layout = DofLayout::new(mesh.num_nodes(), 1);
    let ends = [0, n];
    let structure = StructureField::new(
        mesh.clone(),
        layout.clone(),
        StructureParams::default(),
        &[Dirichlet::fixed(&[0], 0, 0.0)],
        Vec::new(),
    )
    .unwrap();
    let scatra = ScalarTransportField::new(
        mesh.clone(),
        layout.clone(),
        ScatraParams { source: 1.0, ..Default::default() },
        &[Dirichlet::fixed(&ends, 0, 0.0)],
        None,
    )
    .unwrap();
    let thermo = ThermoField::new(mesh, layout, ThermoParams::default(), &[], None).unwrap();
    Fields::new(Box::new(structure), Box::new(scatra), Box::new(thermo)).unwrap()
}

/// 10-element bar, left end clamped, temperature ramped by 1 per unit time
pub fn thermoelastic_fields(alpha: f64) -> Fields {
    let mesh = Mesh1d::uniform(10, 1.0);
    let layout = DofLayout::new(mesh.num_nodes(), 1);
    let all = mesh.node_set("all").unwrap().to_vec();
    let structure = StructureField::new(
        mesh.clone(),
        layout.clone(),
        StructureParams { thermal_expansion: alpha, ..Default::default() },
        &[Dirichlet::fixed(&[0], 0, 0.0)],
        Vec::new(),
    )
    .unwrap();
    let scatra = ScalarTransportField::new(mesh.clone(), layout.clone(), ScatraParams::default(), &[], None).unwrap();
    let thermo = ThermoField::new(
        mesh,
        layout,
        ThermoParams::default(),
        &[Dirichlet::ramp(&all, 0, 0.0, 1.0)],
        None,
    )
    .unwrap();
    Fields::new(Box::new(structure), Box::new(scatra), Box::new(thermo)).unwrap()
}

/// Two non-matching blocks tied at x = 0.4, clamped left, unit tension right
pub fn patch_mesh() -> Mesh1d {
    Mesh1d::two_blocks(3, 5, 0.4, 1.0)
}

pub fn patch_fields(structure_dbc: &[Dirichlet]) -> Fields {
    let mesh = patch_mesh();
    let layout = DofLayout::new(mesh.num_nodes(), 1);
    let right = mesh.node_set("right").unwrap()[0];
    let structure = StructureField::new(
        mesh.clone(),
        layout.clone(),
        StructureParams::default(),
        structure_dbc,
        vec![PointLoad { node: right, value: 1.0 }],
    )
    .unwrap();
    let scatra = ScalarTransportField::new(mesh.clone(), layout.clone(), ScatraParams::default(), &[], None).unwrap();
    let thermo = ThermoField::new(mesh, layout, ThermoParams::default(), &[], None).unwrap();
    Fields::new(Box::new(structure), Box::new(scatra), Box::new(thermo)).unwrap()
}

pub fn kinetics() -> InterfaceKinetics {
    InterfaceKinetics {
        rate: 5.0,
        temperature_coefficient: 0.05,
        reaction_heat: 0.2,
        conductance: 50.0,
        reference_temperature: 0.0,
    }
}

/// Fully coupled two-block problem with interface kinetics and every
/// off-diagonal block populated
pub fn coupled_fields(num_scal: usize) -> (Mesh1d, Fields) {
    let mesh = Mesh1d::two_blocks(6, 4, 0.6, 1.0);
    let layout = DofLayout::new(mesh.num_nodes(), num_scal);
    let left = mesh.node_set("left").unwrap().to_vec();
    let right = mesh.node_set("right").unwrap().to_vec();
    let scatra_dbc: Vec<Dirichlet> = (0..num_scal).map(|k| Dirichlet::fixed(&left, k, 1.0)).collect();

    let structure = StructureField::new(
        mesh.clone(),
        layout.clone(),
        StructureParams { thermal_expansion: 1e-2, chemical_expansion: 5e-2, ..Default::default() },
        &[Dirichlet::fixed(&left, 0, 0.0)],
        vec![PointLoad { node: right[0], value: 0.02 }],
    )
    .unwrap();
    let scatra = ScalarTransportField::new(
        mesh.clone(),
        layout.clone(),
        ScatraParams {
            diffusivity: 0.5,
            temperature_coefficient: 0.1,
            block_per_species: num_scal > 1,
            ..Default::default()
        },
        &scatra_dbc,
        Some(kinetics()),
    )
    .unwrap();
    let thermo = ThermoField::new(
        mesh.clone(),
        layout,
        ThermoParams { reaction_heat: 0.3, ..Default::default() },
        &[Dirichlet::fixed(&right, 0, 0.0)],
        Some(kinetics()),
    )
    .unwrap();
    (mesh, Fields::new(Box::new(structure), Box::new(scatra), Box::new(thermo)).unwrap())
}

pub fn coupled_config() -> SstiConfig {
    let mut config = config(0.05, 0.3);
    config.coupling.interface_meshtying = true;
    config
}
