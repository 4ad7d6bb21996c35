#![allow(non_snake_case)]

use std::sync::Arc;

use approx::assert_abs_diff_eq;

use controller::{MpcInput, MpcReference, MpcSolution, RacingMpc, SolveStatus};
use prelude::*;
use vehicle_model::DoubleTrackModel;

fn setup() -> (config::Config, Arc<DoubleTrackModel>, RacingMpc) {
    let config = config::Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/../config.toml"))
        .expect("sample config must load");
    let model = Arc::new(
        DoubleTrackModel::new(config.vehicle.clone(), config.model.clone())
            .expect("model must compile"),
    );
    let mpc = RacingMpc::new(config.mpc.clone(), Arc::clone(&model)).expect("controller must build");
    (config, model, mpc)
}

fn constant_reference(n: usize, speed: float, curvature: float) -> MpcReference {
    MpcReference {
        speed: DVector::from_element(n, speed),
        curvature: DVector::from_element(n, curvature),
    }
}

fn solve_straight_line() -> (config::Config, Arc<DoubleTrackModel>, MpcSolution) {
    let (config, model, mpc) = setup();
    let reference = constant_reference(config.mpc.N + 1, 20.0, 0.0);
    let input = MpcInput {
        x0: Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 20.0),
        reference: &reference,
        u_prev: None,
        prior: None,
    };
    let solution = mpc.solve(&input).expect("solve must not error");
    (config, model, solution)
}

#[test]
fn straight_line_cruise_converges() {
    let (config, _, solution) = solve_straight_line();
    assert_eq!(
        solution.diagnostics.status,
        SolveStatus::Converged,
        "violation {:.3e} after {} iterations",
        solution.diagnostics.constraint_violation,
        solution.diagnostics.sqp_iterations
    );

    // At speed on a straight the car should hold its heading and speed.
    let N = config.mpc.N;
    for i in 0..=N {
        assert!(
            solution.x[(2, i)].abs() < 1e-3,
            "yaw at stage {} = {}",
            i,
            solution.x[(2, i)]
        );
        assert!(
            (solution.x[(5, i)] - 20.0).abs() < 0.5,
            "speed at stage {} = {}",
            i,
            solution.x[(5, i)]
        );
    }
    for i in 0..N {
        assert!(
            solution.u[(2, i)].abs() < 0.01,
            "steer at stage {} = {}",
            i,
            solution.u[(2, i)]
        );
    }
}

#[test]
fn solution_satisfies_friction_circles() {
    let (config, model, solution) = solve_straight_line();
    let mu = config.model.mu;
    let tol = config.mpc.constraint_tol;
    for i in 0..config.mpc.N {
        let x = Vector6::from_fn(|k, _| solution.x[(k, i)]);
        let u = Vector3::new(solution.u[(0, i)], solution.u[(1, i)], solution.u[(2, i)]);
        let out = model.dynamics().eval(&x, &u, solution.gamma[i]);
        for w in 0..4 {
            let fz = mu * out.Fz_ij[w];
            let usage = (out.Fx_ij[w] / fz).powi(2) + (out.Fy_ij[w] / fz).powi(2);
            assert!(
                usage <= 1.0 + 10.0 * tol,
                "friction usage {} at stage {} wheel {}",
                usage,
                i,
                w
            );
        }
    }
}

#[test]
fn solution_satisfies_integration_defects() {
    let (config, model, solution) = solve_straight_line();
    let dt = config.mpc.dt;
    for i in 0..config.mpc.N {
        let x = Vector6::from_fn(|k, _| solution.x[(k, i)]);
        let mut xn = Vector6::from_fn(|k, _| solution.x[(k, i + 1)]);
        xn[2] = phase_unwrap(x[2], xn[2]);
        let u = Vector3::new(solution.u[(0, i)], solution.u[(1, i)], solution.u[(2, i)]);
        let gamma = solution.gamma[i];

        let f1 = model.dynamics().eval(&x, &u, gamma).x_dot;
        let f2 = model.dynamics().eval(&xn, &u, gamma).x_dot;
        let xm = 0.5 * (x + xn) + (dt / 8.0) * (f1 - f2);
        let fm = model.dynamics().eval(&xm, &u, gamma).x_dot;
        let defect = x + (dt / 6.0) * (f1 + 4.0 * fm + f2) - xn;

        assert!(
            defect.amax() < 10.0 * config.mpc.constraint_tol,
            "defect {:.3e} at stage {}",
            defect.amax(),
            i
        );
    }
}

#[test]
fn solution_satisfies_load_transfer_equilibrium() {
    let (config, model, solution) = solve_straight_line();
    for i in 0..config.mpc.N {
        let x = Vector6::from_fn(|k, _| solution.x[(k, i)]);
        let u = Vector3::new(solution.u[(0, i)], solution.u[(1, i)], solution.u[(2, i)]);
        let out = model.dynamics().eval(&x, &u, solution.gamma[i]);
        let residual = solution.gamma[i] - model.dynamics().lateral_load_transfer(&out, u[2]);
        assert_abs_diff_eq!(residual, 0.0, epsilon = 10.0 * config.mpc.constraint_tol);
    }
}

#[test]
fn first_control_respects_static_bounds() {
    let (config, _, solution) = solve_straight_line();
    let u0 = solution.first_control();
    assert!(u0[0] >= -1e-6 && u0[0] <= config.model.Fd_max + 1e-6);
    assert!(u0[1] <= 1e-6 && u0[1] >= config.model.Fb_max - 1e-6);
    assert!(u0[2].abs() <= config.vehicle.steer.max_steer + 1e-9);
}

#[test]
fn prior_solution_seeds_a_fast_resolve() {
    let (config, model, mpc) = setup();
    let dt = config.mpc.dt;
    let reference = constant_reference(config.mpc.N + 1, 20.0, 0.0);

    let x0 = Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 20.0);
    let first = mpc
        .solve(&MpcInput {
            x0,
            reference: &reference,
            u_prev: None,
            prior: None,
        })
        .expect("first solve must not error");
    assert_eq!(first.diagnostics.status, SolveStatus::Converged);

    let u0 = first.first_control();
    let x1 = model.step(dt, &x0, &u0);
    let second = mpc
        .solve(&MpcInput {
            x0: x1,
            reference: &reference,
            u_prev: Some(u0),
            prior: Some(&first),
        })
        .expect("second solve must not error");
    assert_eq!(second.diagnostics.status, SolveStatus::Converged);

    // Rate limiting against the previously applied control.
    let (fd_rate, steer_rate) = (
        config.model.Fd_max / config.model.Td,
        config.vehicle.steer.max_steer_rate,
    );
    let u1 = second.first_control();
    assert!((u1[0] - u0[0]) / dt <= fd_rate + 1e-6);
    assert!(((u1[2] - u0[2]) / dt).abs() <= steer_rate + 1e-6);
}

#[test]
fn braking_to_a_slow_reference_keeps_speed_non_negative() {
    let (config, _, mpc) = setup();
    // Demands heavy braking over the whole horizon; the terminal stage is
    // where the tracking cost pushes the speed hardest.
    let reference = constant_reference(config.mpc.N + 1, 1.0, 0.0);
    let input = MpcInput {
        x0: Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 8.0),
        reference: &reference,
        u_prev: None,
        prior: None,
    };
    let solution = mpc.solve(&input).expect("solve must not error");
    for i in 0..=config.mpc.N {
        assert!(
            solution.x[(5, i)] >= -config.mpc.constraint_tol,
            "speed at stage {} = {}",
            i,
            solution.x[(5, i)]
        );
    }
}

#[test]
fn infeasible_reference_does_not_panic() {
    let (config, _, mpc) = setup();
    // Curvature far beyond the friction limit at this speed.
    let reference = constant_reference(config.mpc.N + 1, 30.0, 0.5);
    let input = MpcInput {
        x0: Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 30.0),
        reference: &reference,
        u_prev: None,
        prior: None,
    };
    let solution = mpc.solve(&input).expect("solve must not error");
    assert!(solution.x.iter().all(|v| v.is_finite()));
    assert!(solution.u.iter().all(|v| v.is_finite()));
}
