use std::sync::Arc;

use log::debug;

use config::MpcConfig;
use prelude::*;
use vehicle_model::{DoubleTrackModel, NlpBuilder, StageVars};

use crate::nlp::{SqpOptions, StageNlp};
use crate::{
    ControllerError, MpcInput, MpcReference, MpcSolution, SolveDiagnostics, SolveStatus,
};

/// Stage tracking cost compiled from the tuning weights at construction.
///
/// The cost residuals are weighted by the square roots of the configured
/// penalties so the Gauss-Newton objective recovers the quadratic weights.
#[derive(Clone, Copy, Debug)]
struct StageCost {
    sv: float,
    somega: float,
    sbeta: float,
    sv_terminal: float,
    sr: [float; 3],
}

impl StageCost {
    fn compile(config: &MpcConfig) -> StageCost {
        StageCost {
            sv: config.q_v.sqrt(),
            somega: config.q_omega.sqrt(),
            sbeta: config.q_beta.sqrt(),
            sv_terminal: config.Q_terminal_v.sqrt(),
            sr: [config.R[0].sqrt(), config.R[1].sqrt(), config.R[2].sqrt()],
        }
    }
}

/// Receding horizon trajectory optimiser over the double track model.
///
/// The scaling factors and the stage cost are fixed at construction; each
/// `solve` call assembles a fresh stage-structured NLP, so a single instance
/// holds no cross-call solver state and the compiled dynamics are shared
/// read-only through the `Arc`.
pub struct RacingMpc {
    config: MpcConfig,
    model: Arc<DoubleTrackModel>,
    scale: DVector<float>,
    cost: StageCost,
}

impl RacingMpc {
    pub fn new(
        config: MpcConfig,
        model: Arc<DoubleTrackModel>,
    ) -> Result<RacingMpc, ControllerError> {
        config.validate()?;

        let N = config.N;
        let mut scale = DVector::zeros(n_vars(N));
        for i in 0..=N {
            for k in 0..6 {
                scale[6 * i + k] = config.x_scale[k];
            }
        }
        for i in 0..N {
            for k in 0..3 {
                scale[6 * (N + 1) + 3 * i + k] = config.u_scale[k];
            }
        }
        for i in 0..N {
            scale[6 * (N + 1) + 3 * N + i] = config.gamma_scale;
        }

        let cost = StageCost::compile(&config);
        Ok(RacingMpc {
            config,
            model,
            scale,
            cost,
        })
    }

    pub fn config(&self) -> &MpcConfig {
        &self.config
    }

    pub fn N(&self) -> usize {
        self.config.N
    }

    /// Solves the horizon problem from `x0` against the reference.
    ///
    /// Blocks until the solver converges, proves infeasibility or exhausts
    /// its iteration budget; the returned diagnostics carry the distinction
    /// and non-converged solutions hold the best available iterate.
    pub fn solve(&self, input: &MpcInput) -> Result<MpcSolution, ControllerError> {
        let N = self.config.N;
        let dt = self.config.dt;
        self.check_reference(input.reference)?;

        let z0 = match input.prior {
            Some(prior) => self.scale_solution(prior)?,
            None => self.scale_solution(&self.create_warm_start(input)?)?,
        };

        let mut nlp = StageNlp::new(self.scale.clone());
        for k in 0..6 {
            nlp.fix(self.x_vars(0)[k], input.x0[k]);
        }
        for i in 0..N {
            let stage = StageVars {
                x: self.x_vars(i),
                u: self.u_vars(i),
                gamma: self.gamma_var(i),
                x_next: self.x_vars(i + 1),
                u_next: if i + 1 < N { Some(self.u_vars(i + 1)) } else { None },
            };
            self.model.append_stage_constraints(&mut nlp, &stage, dt);
        }
        // Stage N's speed otherwise enters only through the defect.
        nlp.bound(self.x_vars(N)[5], 0.0, INFINITY);
        if let Some(u_prev) = input.u_prev {
            self.model
                .append_initial_rate_constraints(&mut nlp, &u_prev, &self.u_vars(0), dt);
        }
        self.append_cost(&mut nlp, input);

        let (z, diagnostics) = nlp.solve(z0, &self.sqp_options());
        debug!(
            "solve finished: {:?} after {} iterations, violation {:.3e}",
            diagnostics.status, diagnostics.sqp_iterations, diagnostics.constraint_violation
        );
        Ok(self.unscale_solution(&z, diagnostics))
    }

    /// Produces a feasible-ish initial guess by propagating the forward
    /// dynamics under a saturated speed-tracking and curvature-steering
    /// policy. Controls stay inside the static actuator bounds; the result
    /// seeds the solver and is never a control output.
    pub fn create_warm_start(&self, input: &MpcInput) -> Result<MpcSolution, ControllerError> {
        let N = self.config.N;
        let dt = self.config.dt;
        self.check_reference(input.reference)?;

        let base = self.model.base_config();
        let model_config = self.model.config();
        let m = base.chassis.total_mass;
        let wheel_base = base.chassis.wheel_base;
        let delta_max = base.steer.max_steer;

        let mut x = DMatrix::zeros(6, N + 1);
        let mut u = DMatrix::zeros(3, N);
        let mut gamma = DVector::zeros(N);

        let mut x_i = input.x0;
        x.column_mut(0).copy_from(&x_i);
        for i in 0..N {
            let a_des = clamp(input.reference.speed[i] - x_i[5], -3.0, 3.0);
            let (fd, fb) = if a_des >= 0.0 {
                let fd_power = model_config.P_max / max(x_i[5], 1.0);
                (
                    clamp(m * a_des, 0.0, min(model_config.Fd_max, fd_power)),
                    0.0,
                )
            } else {
                (0.0, clamp(m * a_des, model_config.Fb_max, 0.0))
            };
            let delta = clamp(
                (wheel_base * input.reference.curvature[i]).atan(),
                -delta_max,
                delta_max,
            );
            let u_i = Vector3::new(fd, fb, delta);

            gamma[i] = self.model.forward_dynamics(&x_i, &u_i).gamma_y;
            u.column_mut(i).copy_from(&u_i);
            x_i = self.model.step(dt, &x_i, &u_i);
            x.column_mut(i + 1).copy_from(&x_i);
        }

        Ok(MpcSolution {
            x,
            u,
            gamma,
            diagnostics: SolveDiagnostics {
                status: SolveStatus::WarmStart,
                sqp_iterations: 0,
                constraint_violation: INFINITY,
                cost: INFINITY,
            },
        })
    }

    fn append_cost(&self, nlp: &mut StageNlp, input: &MpcInput) {
        let N = self.config.N;
        let cost = self.cost;

        // Tracking residuals on yaw rate, slip and speed per stage.
        for i in 1..=N {
            let x = self.x_vars(i);
            let v_ref = input.reference.speed[i];
            let kappa = input.reference.curvature[i];
            let terminal = i == N;
            nlp.cost(
                vec![x[3], x[4], x[5]],
                Box::new(move |z: &DVector<float>| {
                    let (omega, beta, v) = (z[0], z[1], z[2]);
                    let mut r = vec![
                        cost.sv * (v - v_ref),
                        cost.somega * (omega - kappa * v),
                        cost.sbeta * beta,
                    ];
                    if terminal {
                        r.push(cost.sv_terminal * (v - v_ref));
                    }
                    DVector::from_vec(r)
                }),
            );
        }

        // Control rate regularisation between consecutive stages.
        for i in 0..N.saturating_sub(1) {
            let mut vars = Vec::with_capacity(6);
            vars.extend_from_slice(&self.u_vars(i));
            vars.extend_from_slice(&self.u_vars(i + 1));
            nlp.cost(
                vars,
                Box::new(move |z: &DVector<float>| {
                    DVector::from_fn(3, |k, _| cost.sr[k] * (z[3 + k] - z[k]))
                }),
            );
        }
        if let Some(u_prev) = input.u_prev {
            nlp.cost(
                self.u_vars(0).to_vec(),
                Box::new(move |z: &DVector<float>| {
                    DVector::from_fn(3, |k, _| cost.sr[k] * (z[k] - u_prev[k]))
                }),
            );
        }
    }

    fn sqp_options(&self) -> SqpOptions {
        SqpOptions {
            constraint_tol: self.config.constraint_tol,
            step_tol: self.config.step_tol,
            max_sqp_iter: self.config.max_sqp_iter,
            max_qp_iter: self.config.max_qp_iter,
            trust_region: self.config.trust_region,
        }
    }

    fn check_reference(&self, reference: &MpcReference) -> Result<(), ControllerError> {
        let expected = self.config.N + 1;
        if reference.speed.len() < expected {
            return Err(ControllerError::DimensionMismatch {
                name: "reference.speed",
                expected,
                actual: reference.speed.len(),
            });
        }
        if reference.curvature.len() < expected {
            return Err(ControllerError::DimensionMismatch {
                name: "reference.curvature",
                expected,
                actual: reference.curvature.len(),
            });
        }
        Ok(())
    }

    /// Scales a solution into a flat decision variable vector.
    fn scale_solution(&self, solution: &MpcSolution) -> Result<DVector<float>, ControllerError> {
        let N = self.config.N;
        if solution.x.nrows() != 6 || solution.x.ncols() != N + 1 {
            return Err(ControllerError::DimensionMismatch {
                name: "solution.x",
                expected: 6 * (N + 1),
                actual: solution.x.nrows() * solution.x.ncols(),
            });
        }
        if solution.u.nrows() != 3 || solution.u.ncols() != N {
            return Err(ControllerError::DimensionMismatch {
                name: "solution.u",
                expected: 3 * N,
                actual: solution.u.nrows() * solution.u.ncols(),
            });
        }
        if solution.gamma.len() != N {
            return Err(ControllerError::DimensionMismatch {
                name: "solution.gamma",
                expected: N,
                actual: solution.gamma.len(),
            });
        }

        let mut z = DVector::zeros(n_vars(N));
        for i in 0..=N {
            for k in 0..6 {
                let var = self.x_vars(i)[k];
                z[var] = solution.x[(k, i)] / self.scale[var];
            }
        }
        for i in 0..N {
            for k in 0..3 {
                let var = self.u_vars(i)[k];
                z[var] = solution.u[(k, i)] / self.scale[var];
            }
            let var = self.gamma_var(i);
            z[var] = solution.gamma[i] / self.scale[var];
        }
        Ok(z)
    }

    fn unscale_solution(&self, z: &DVector<float>, diagnostics: SolveDiagnostics) -> MpcSolution {
        let N = self.config.N;
        let mut x = DMatrix::zeros(6, N + 1);
        let mut u = DMatrix::zeros(3, N);
        let mut gamma = DVector::zeros(N);
        for i in 0..=N {
            for k in 0..6 {
                let var = self.x_vars(i)[k];
                x[(k, i)] = z[var] * self.scale[var];
            }
        }
        for i in 0..N {
            for k in 0..3 {
                let var = self.u_vars(i)[k];
                u[(k, i)] = z[var] * self.scale[var];
            }
            let var = self.gamma_var(i);
            gamma[i] = z[var] * self.scale[var];
        }
        MpcSolution {
            x,
            u,
            gamma,
            diagnostics,
        }
    }

    fn x_vars(&self, i: usize) -> [usize; 6] {
        std::array::from_fn(|k| 6 * i + k)
    }

    fn u_vars(&self, i: usize) -> [usize; 3] {
        let offset = 6 * (self.config.N + 1) + 3 * i;
        std::array::from_fn(|k| offset + k)
    }

    fn gamma_var(&self, i: usize) -> usize {
        6 * (self.config.N + 1) + 3 * self.config.N + i
    }
}

fn n_vars(N: usize) -> usize {
    6 * (N + 1) + 3 * N + N
}
