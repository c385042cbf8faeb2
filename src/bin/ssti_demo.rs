use std::process::ExitCode;

use log::{error, info};
use ssti_solver::models::{
    Dirichlet, DofLayout, InterfaceKinetics, Mesh1d, PointLoad, ScalarTransportField, ScatraParams, StructureField,
    StructureParams, ThermoField, ThermoParams,
};
use ssti_solver::{FieldIntegrator, Fields, MonolithicDriver, SstiConfig, SstiResult};

/// Two-layer bar: an electrode-like left block tied to a right block
///
/// Species enter at the left end, cross the interface with a
/// temperature-dependent rate and release heat there. The bar swells with
/// concentration and temperature and is clamped at the left end.
fn build_fields(config: &SstiConfig) -> SstiResult<Fields> {
    let mesh = if config.coupling.interface_meshtying {
        Mesh1d::two_blocks(12, 6, 0.6, 1.0)
    } else {
        Mesh1d::uniform(18, 1.0)
    };
    let layout = DofLayout::new(mesh.num_nodes(), 1);
    let left = mesh.node_set("left")?.to_vec();
    let right = mesh.node_set("right")?.to_vec();

    let kinetics = InterfaceKinetics {
        rate: 5.0,
        temperature_coefficient: 0.05,
        reaction_heat: 0.2,
        conductance: 50.0,
        reference_temperature: 0.0,
    };

    let structure = StructureField::new(
        mesh.clone(),
        layout.clone(),
        StructureParams { thermal_expansion: 1e-3, chemical_expansion: 2e-2, ..Default::default() },
        &[Dirichlet::fixed(&left, 0, 0.0)],
        vec![PointLoad { node: right[0], value: 0.01 }],
    )?;
    let scatra = ScalarTransportField::new(
        mesh.clone(),
        layout.clone(),
        ScatraParams { diffusivity: 0.5, temperature_coefficient: 0.02, ..Default::default() },
        &[Dirichlet::fixed(&left, 0, 1.0)],
        Some(kinetics),
    )?;
    let thermo = ThermoField::new(
        mesh,
        layout,
        ThermoParams { reaction_heat: 0.1, ..Default::default() },
        &[Dirichlet::fixed(&right, 0, 0.0)],
        Some(kinetics),
    )?;

    Fields::new(Box::new(structure), Box::new(scatra), Box::new(thermo))
}

fn run(config: SstiConfig) -> SstiResult<()> {
    config.print_summary();
    let fields = build_fields(&config)?;
    let mut driver = MonolithicDriver::new(config, fields)?;
    info!("evaluation schedule: {}", driver.schedule());

    driver.run()?;

    println!("\n--- Steps ---");
    for report in driver.history() {
        println!(
            "  step {:4}  t = {:.4}  dt = {:.3e}  newton {:2}  dt reductions {}",
            report.step, report.time, report.dt, report.newton_iterations, report.dt_reductions
        );
    }

    let timing = driver.total_timing();
    println!("\n--- Timing ---");
    println!("  Evaluate: {:.3} s", timing.evaluate);
    println!("  Solve:    {:.3} s", timing.solve);
    println!("  Newton:   {:.3} s", timing.newton);

    let fields = driver.fields();
    let profile = |field: &dyn FieldIntegrator| {
        let values = field.state_np();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (min, max)
    };
    println!("\n--- Final state (t = {:.4}) ---", driver.time());
    for field in [fields.structure(), fields.scatra(), fields.thermo()] {
        let (min, max) = profile(field);
        println!("  {:9}: min {:+.6e}  max {:+.6e}", field.kind().to_string(), min, max);
    }

    if !driver.restart_archive().is_empty() {
        std::fs::create_dir_all("output/ssti_demo")?;
        let path = "output/ssti_demo/restart.json";
        driver.restart_archive().write_to(path)?;
        println!("\n  ✓ Wrote {} (steps {:?})", path, driver.restart_archive().steps());
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("=== Monolithic SSTI Demo ===\n");

    let config = match std::env::args().nth(1) {
        Some(path) => match SstiConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                return ExitCode::from(e.exit_code() as u8);
            }
        },
        None => {
            let mut config = SstiConfig::default();
            config.time.dt = 0.05;
            config.time.max_time = 1.0;
            config.coupling.interface_meshtying = true;
            config
        }
    };

    match run(config) {
        Ok(()) => {
            println!("\n=== Run Complete ===");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
