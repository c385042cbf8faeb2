mod common;

use approx::assert_relative_eq;
use ssti_solver::{EquilibrationMethod, FieldIntegrator, MonolithicDriver, RestartArchive, Subproblem};

use common::*;

fn coupled_driver() -> MonolithicDriver {
    let (_, fields) = coupled_fields(1);
    MonolithicDriver::new(coupled_config(), fields).unwrap()
}

#[test]
fn test_extract_insert_round_trip() {
    let driver = coupled_driver();
    let dofs = driver.dof_map();
    for f in Subproblem::ALL {
        let values: Vec<f64> = (0..dofs.field_map(f).len()).map(|i| 1.0 + i as f64).collect();
        let mut full = vec![0.0; dofs.full_map().len()];
        dofs.insert(&values, f, &mut full);
        assert_eq!(dofs.extract(&full, f), values);
        // nothing leaks into the other fields
        for other in Subproblem::ALL.into_iter().filter(|&o| o != f) {
            assert!(dofs.extract(&full, other).iter().all(|&v| v == 0.0));
        }
    }
}

#[test]
fn test_slave_and_dirichlet_rows() {
    let mut driver = coupled_driver();
    driver.prepare_time_loop().unwrap();
    driver.do_step().unwrap();

    let matrix = driver.system_matrix().merged().unwrap();
    let dofs = driver.dof_map();
    let structure = dofs.field_map(Subproblem::Structure);

    let meshtying = driver.meshtying().unwrap();
    assert!(!meshtying.pairs(Subproblem::Structure).is_empty());
    for pair in meshtying.pairs(Subproblem::Structure) {
        let s = dofs.full_lid(Subproblem::Structure, structure.lid(pair.slave_dof).unwrap());
        let m = dofs.full_lid(Subproblem::Structure, structure.lid(pair.master_dof).unwrap());
        let row = matrix.outer_view(s).unwrap();
        for (col, &val) in row.iter() {
            let expected = if col == s {
                1.0
            } else if col == m {
                -1.0
            } else {
                0.0
            };
            assert_eq!(val, expected, "slave row {} column {}", s, col);
        }
    }

    for f in Subproblem::ALL {
        let map = dofs.field_map(f);
        for &gid in driver.fields().get(f).dirichlet_dofs() {
            let d = dofs.full_lid(f, map.lid(gid).unwrap());
            for (col, &val) in matrix.outer_view(d).unwrap().iter() {
                assert_eq!(val, if col == d { 1.0 } else { 0.0 }, "Dirichlet row {} column {}", d, col);
            }
        }
    }
}

#[test]
fn test_converged_residuals_meet_tolerance() {
    let mut driver = coupled_driver();
    driver.run().unwrap();
    let newton = driver.config().newton.clone();
    for report in driver.history() {
        for norms in &report.final_norms {
            let bound = newton.abs_tol_res.max(newton.rel_tol_res * (1.0 + norms.state));
            assert!(norms.residual < bound, "step {} {}: {:e}", report.step, norms.field, norms.residual);
        }
    }
}

#[test]
fn test_slave_dofs_follow_masters() {
    let mut driver = coupled_driver();
    driver.prepare_time_loop().unwrap();
    for _ in 0..3 {
        driver.do_step().unwrap();
        let u = driver.fields().structure().state_np().to_vec();
        let map = driver.dof_map().field_map(Subproblem::Structure);
        for pair in driver.meshtying().unwrap().pairs(Subproblem::Structure) {
            let s = map.lid(pair.slave_dof).unwrap();
            let m = map.lid(pair.master_dof).unwrap();
            assert_relative_eq!(u[s], u[m], epsilon = 1e-14);
        }
    }
}

#[test]
fn test_interface_forces_balance_across_meshtying() {
    let mut driver = coupled_driver();
    driver.run().unwrap();

    // master and slave each carry the interface force; only their sum is
    // driven to zero once the slave row is folded onto the master row
    let r = driver.fields().structure().residual();
    let map = driver.dof_map().field_map(Subproblem::Structure);
    for pair in driver.meshtying().unwrap().pairs(Subproblem::Structure) {
        let s = map.lid(pair.slave_dof).unwrap();
        let m = map.lid(pair.master_dof).unwrap();
        assert!(r[m].abs() > 1e-3, "master force {:e}", r[m]);
        assert_relative_eq!(r[m] + r[s], 0.0, epsilon = 1e-7);
    }
}

#[test]
fn test_equilibration_does_not_change_the_solution() {
    let run = |method: EquilibrationMethod| {
        let (_, fields) = coupled_fields(1);
        let mut config = coupled_config();
        config.monolithic.equilibration = method;
        let mut driver = MonolithicDriver::new(config, fields).unwrap();
        driver.run().unwrap();
        Subproblem::ALL.map(|f| driver.fields().get(f).state_np().to_vec())
    };

    let plain = run(EquilibrationMethod::None);
    for method in [EquilibrationMethod::RowsMaxabs, EquilibrationMethod::RowsAndColumnsMaxabs] {
        let scaled = run(method);
        for (a, b) in plain.iter().zip(&scaled) {
            for (x, y) in a.iter().zip(b) {
                assert_relative_eq!(x, y, epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn test_restart_is_idempotent() {
    let mut config = coupled_config();
    config.time.restart_every = 1;
    let (_, fields) = coupled_fields(1);
    let mut reference = MonolithicDriver::new(config.clone(), fields).unwrap();
    reference.prepare_time_loop().unwrap();
    for _ in 0..3 {
        reference.do_step().unwrap();
    }

    // through JSON, as a restart file would be
    let json = reference.restart_archive().to_json().unwrap();
    let archive = RestartArchive::from_json(&json).unwrap();
    assert_eq!(archive.steps(), vec![1, 2, 3]);
    let group = archive.get(3).unwrap().clone();

    let expected = reference.do_step().unwrap().first_norms.clone();

    let (_, fields) = coupled_fields(1);
    let mut restarted = MonolithicDriver::new(config, fields).unwrap();
    restarted.read_restart(&group).unwrap();
    assert_eq!(restarted.step(), 3);
    let actual = restarted.do_step().unwrap().first_norms.clone();

    assert_eq!(expected.len(), actual.len());
    for (e, a) in expected.iter().zip(&actual) {
        assert_eq!(e.field, a.field);
        assert_relative_eq!(e.residual, a.residual, epsilon = 1e-12, max_relative = 1e-10);
        assert_relative_eq!(e.state, a.state, epsilon = 1e-12, max_relative = 1e-10);
    }
}

#[test]
fn test_restart_rejects_other_discretization() {
    let mut driver = coupled_driver();
    driver.prepare_time_loop().unwrap();
    driver.do_step().unwrap();
    let group = driver.write_restart();

    // a finer mesh has different dof row maps
    let mut other = MonolithicDriver::new(config(0.1, 1.0), diffusion_fields(30)).unwrap();
    let err = other.read_restart(&group).unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn test_field_contract_through_trait_objects() {
    let driver = coupled_driver();
    let scatra: &dyn FieldIntegrator = driver.fields().scatra();
    assert_eq!(scatra.kind(), Subproblem::ScalarTransport);
    assert_eq!(scatra.discretization().field(), Subproblem::ScalarTransport);
    assert_relative_eq!(scatra.dt(), 0.05);
    assert!(driver.fields().structure().velocity_np().is_some());
    assert!(driver.fields().thermo().velocity_np().is_none());
}
