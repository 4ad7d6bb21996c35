// Ignore this lint otherwise many warnings are generated for common mathematical notation
#![allow(non_snake_case)]

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};

use controller::{MpcInput, MpcReference, RacingMpc, SolveStatus};
use prelude::*;
use vehicle_model::DoubleTrackModel;

fn main() {
    env_logger::init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    if let Err(err) = run(&config_path) {
        error!("simulation failed: {}", err);
        process::exit(1);
    }
}

fn run(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::Config::load(config_path)?;
    let model = Arc::new(DoubleTrackModel::new(
        config.vehicle.clone(),
        config.model.clone(),
    )?);
    let mpc = RacingMpc::new(config.mpc.clone(), Arc::clone(&model))?;

    let N = config.mpc.N;
    let dt = config.mpc.dt;
    let n_steps = (config.simulation.t / dt) as usize;

    let reference = MpcReference {
        speed: DVector::from_element(N + 1, config.simulation.v_ref),
        curvature: DVector::zeros(N + 1),
    };

    let mut x = Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, config.simulation.v_ref * 0.5);
    let mut u_prev: Option<Vector3<float>> = None;
    let mut prior = None;
    let mut solve_time_sum = 0.0;

    for i in 0..n_steps {
        let input = MpcInput {
            x0: x,
            reference: &reference,
            u_prev,
            prior: prior.as_ref(),
        };

        let start = Instant::now();
        let solution = mpc.solve(&input)?;
        let elapsed = start.elapsed().as_secs_f64();
        solve_time_sum += elapsed;

        let u = match solution.diagnostics.status {
            SolveStatus::Converged | SolveStatus::DidNotConverge => solution.first_control(),
            // Coast and re-seed from a fresh warm start next cycle.
            status => {
                warn!("step {}: solver returned {:?}, coasting", i, status);
                prior = None;
                u_prev = None;
                x = model.step(dt, &x, &Vector3::zeros());
                continue;
            }
        };

        info!(
            "step {}: {:?} in {} iterations ({:.1} ms), v = {:.2} m/s, \
             fd = {:.0} N, fb = {:.0} N, delta = {:.4} rad",
            i,
            solution.diagnostics.status,
            solution.diagnostics.sqp_iterations,
            elapsed * 1e3,
            x[5],
            u[0],
            u[1],
            u[2]
        );

        x = model.step(dt, &x, &u);
        u_prev = Some(u);
        prior = Some(solution);
    }

    info!(
        "simulated {} steps, final speed {:.2} m/s, mean solve time {:.1} ms",
        n_steps,
        x[5],
        solve_time_sum / n_steps as f64 * 1e3
    );
    Ok(())
}
