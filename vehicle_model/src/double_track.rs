use config::{BaseVehicleConfig, DynamicsModelConfig};
use prelude::*;

use crate::{Dynamics, ModelError, NlpBuilder, StageVars};

/// Result of a single forward dynamics evaluation.
#[derive(Clone, Debug)]
pub struct ForwardDynamics {
    pub x_dot: Vector6<float>,
    pub Fx_ij: Vector4<float>,
    pub Fy_ij: Vector4<float>,
    pub Fz_ij: Vector4<float>,
    pub gamma_y: float,
}

/// Double track planar model with load sensitive tyres and load transfer.
pub struct DoubleTrackModel {
    base: BaseVehicleConfig,
    config: DynamicsModelConfig,
    dynamics: Dynamics,
}

impl DoubleTrackModel {
    /// Minimum speed at which the model is well defined. Below this the slip
    /// angle geometry and the slip derivative term `1 / (m v)` degenerate and
    /// derivatives are unspecified.
    pub const V_SPEED_FLOOR: float = 0.5;

    pub fn new(
        base: BaseVehicleConfig,
        config: DynamicsModelConfig,
    ) -> Result<DoubleTrackModel, ModelError> {
        base.validate()?;
        config.validate()?;
        let dynamics = Dynamics::compile(&base, &config)?;
        Ok(DoubleTrackModel {
            base,
            config,
            dynamics,
        })
    }

    pub fn nx(&self) -> usize {
        6
    }

    pub fn nu(&self) -> usize {
        3
    }

    pub fn base_config(&self) -> &BaseVehicleConfig {
        &self.base
    }

    pub fn config(&self) -> &DynamicsModelConfig {
        &self.config
    }

    /// The compiled dynamics mapping.
    pub fn dynamics(&self) -> &Dynamics {
        &self.dynamics
    }

    /// Evaluates the state derivative and tyre forces at `(x, u)`.
    ///
    /// The lateral load transfer is resolved by evaluating the closed-form
    /// equilibrium expression at `gamma_y = 0` and re-evaluating the dynamics
    /// at the resulting value. This is a one-shot substitution, not a fixed
    /// point iteration; inside the optimisation problem the equilibrium is
    /// instead enforced exactly as a constraint on the `gamma_y` variable.
    pub fn forward_dynamics(&self, x: &Vector6<float>, u: &Vector3<float>) -> ForwardDynamics {
        let at_zero = self.dynamics.eval(x, u, 0.0);
        let gamma_y = self.dynamics.lateral_load_transfer(&at_zero, u[2]);
        let out = self.dynamics.eval(x, u, gamma_y);
        ForwardDynamics {
            x_dot: out.x_dot,
            Fx_ij: out.Fx_ij,
            Fy_ij: out.Fy_ij,
            Fz_ij: out.Fz_ij,
            gamma_y,
        }
    }

    /// Integrates the forward dynamics over `dt`.
    pub fn step(&self, dt: float, x: &Vector6<float>, u: &Vector3<float>) -> Vector6<float> {
        rk4(dt, 5, x, |x| self.forward_dynamics(x, u).x_dot)
    }

    /// Appends this stage's constraint contribution to the problem builder:
    /// the Hermite-Simpson integration defect, the per-wheel friction circle,
    /// the lateral load transfer equilibrium and the static and rate actuator
    /// constraints.
    pub fn append_stage_constraints(
        &self,
        builder: &mut dyn NlpBuilder,
        stage: &StageVars,
        dt: float,
    ) {
        let mu = self.config.mu;
        let delta_max = self.base.steer.max_steer;

        // Integration defect: match the endpoint states against a Simpson
        // weighted combination of the start, midpoint and end derivatives.
        let dynamics = self.dynamics.clone();
        let mut vars = Vec::with_capacity(16);
        vars.extend_from_slice(&stage.x);
        vars.extend_from_slice(&stage.u);
        vars.push(stage.gamma);
        vars.extend_from_slice(&stage.x_next);
        builder.equality(
            vars,
            6,
            Box::new(move |z: &DVector<float>| {
                let (x, u, gamma) = unpack_stage(z);
                let mut xn = Vector6::from_fn(|i, _| z[10 + i]);
                xn[2] = phase_unwrap(x[2], xn[2]);

                let f1 = dynamics.eval(&x, &u, gamma).x_dot;
                let f2 = dynamics.eval(&xn, &u, gamma).x_dot;
                let xm = 0.5 * (x + xn) + (dt / 8.0) * (f1 - f2);
                let fm = dynamics.eval(&xm, &u, gamma).x_dot;

                let defect = x + (dt / 6.0) * (f1 + 4.0 * fm + f2) - xn;
                DVector::from_column_slice(defect.as_slice())
            }),
        );

        // Friction circle, one inequality per wheel.
        let dynamics = self.dynamics.clone();
        builder.constraint(
            stage_vars(stage),
            DVector::from_element(4, NEG_INFINITY),
            DVector::from_element(4, 1.0),
            Box::new(move |z: &DVector<float>| {
                let (x, u, gamma) = unpack_stage(z);
                let out = dynamics.eval(&x, &u, gamma);
                DVector::from_fn(4, |i, _| {
                    let fz = mu * out.Fz_ij[i];
                    let fx = out.Fx_ij[i] / fz;
                    let fy = out.Fy_ij[i] / fz;
                    fx * fx + fy * fy
                })
            }),
        );

        // Load transfer equilibrium: gamma_y must equal the closed-form
        // expression computed from the forces it influences.
        let dynamics = self.dynamics.clone();
        builder.equality(
            stage_vars(stage),
            1,
            Box::new(move |z: &DVector<float>| {
                let (x, u, gamma) = unpack_stage(z);
                let out = dynamics.eval(&x, &u, gamma);
                DVector::from_element(1, gamma - dynamics.lateral_load_transfer(&out, u[2]))
            }),
        );

        // Static actuator constraints.
        builder.bound(stage.x[5], 0.0, INFINITY);
        builder.bound(stage.u[0], 0.0, self.config.Fd_max);
        builder.bound(stage.u[1], self.config.Fb_max, 0.0);
        builder.bound(stage.u[2], -delta_max, delta_max);

        // Drive power limit: v * fd <= P_max.
        let P_max = self.config.P_max;
        builder.constraint(
            vec![stage.x[5], stage.u[0]],
            DVector::from_element(1, NEG_INFINITY),
            DVector::from_element(1, P_max),
            Box::new(|z: &DVector<float>| DVector::from_element(1, z[0] * z[1])),
        );

        // Throttle/brake mutual exclusion.
        builder.constraint(
            vec![stage.u[0], stage.u[1]],
            DVector::from_element(1, NEG_INFINITY),
            DVector::from_element(1, 1.0),
            Box::new(|z: &DVector<float>| {
                let p = z[0] * z[1];
                DVector::from_element(1, p * p)
            }),
        );

        // Actuator rate constraints against the next stage's controls.
        if let Some(u_next) = stage.u_next {
            let mut vars = Vec::with_capacity(6);
            vars.extend_from_slice(&stage.u);
            vars.extend_from_slice(&u_next);
            let (lower, upper) = self.rate_bounds();
            builder.constraint(
                vars,
                lower,
                upper,
                Box::new(move |z: &DVector<float>| {
                    DVector::from_fn(3, |i, _| (z[3 + i] - z[i]) / dt)
                }),
            );
        }
    }

    /// Rate-limits the first stage's controls against the control actually
    /// applied in the previous cycle, which lies outside the horizon.
    pub fn append_initial_rate_constraints(
        &self,
        builder: &mut dyn NlpBuilder,
        u_prev: &Vector3<float>,
        u: &[usize; 3],
        dt: float,
    ) {
        let u_prev = *u_prev;
        let (lower, upper) = self.rate_bounds();
        builder.constraint(
            u.to_vec(),
            lower,
            upper,
            Box::new(move |z: &DVector<float>| {
                DVector::from_fn(3, |i, _| (z[i] - u_prev[i]) / dt)
            }),
        );
    }

    /// First order lag rate limits per control. The drive rate is only
    /// bounded from above and the brake rate only from below, matching the
    /// sign conventions of the two forces.
    fn rate_bounds(&self) -> (DVector<float>, DVector<float>) {
        let delta_max = self.base.steer.max_steer;
        let t_delta = delta_max / self.base.steer.max_steer_rate;
        let lower = DVector::from_column_slice(&[
            NEG_INFINITY,
            self.config.Fb_max / self.config.Tb,
            -delta_max / t_delta,
        ]);
        let upper = DVector::from_column_slice(&[
            self.config.Fd_max / self.config.Td,
            INFINITY,
            delta_max / t_delta,
        ]);
        (lower, upper)
    }
}

fn stage_vars(stage: &StageVars) -> Vec<usize> {
    let mut vars = Vec::with_capacity(10);
    vars.extend_from_slice(&stage.x);
    vars.extend_from_slice(&stage.u);
    vars.push(stage.gamma);
    vars
}

fn unpack_stage(z: &DVector<float>) -> (Vector6<float>, Vector3<float>, float) {
    let x = Vector6::from_fn(|i, _| z[i]);
    let u = Vector3::new(z[6], z[7], z[8]);
    (x, u, z[9])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> DoubleTrackModel {
        let config = config::Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/../config.toml"))
            .expect("sample config must load");
        DoubleTrackModel::new(config.vehicle, config.model).expect("model must compile")
    }

    #[test]
    fn forward_dynamics_is_deterministic() {
        let model = sample_model();
        let x = Vector6::new(1.0, -2.0, 0.3, 0.1, 0.02, 30.0);
        let u = Vector3::new(800.0, 0.0, 0.05);

        let a = model.forward_dynamics(&x, &u);
        let b = model.forward_dynamics(&x, &u);
        assert_eq!(a.x_dot, b.x_dot);
        assert_eq!(a.Fy_ij, b.Fy_ij);
        assert_eq!(a.gamma_y, b.gamma_y);
    }

    #[test]
    fn accelerates_under_moderate_drive_force() {
        let model = sample_model();
        let x = Vector6::new(0.0, 0.0, 0.0, 0.1, 0.02, 40.0);
        let u = Vector3::new(500.0, 0.0, 0.1);

        let out = model.forward_dynamics(&x, &u);
        assert!(out.x_dot.iter().all(|v| v.is_finite()));
        assert!(
            out.x_dot[5] > 0.0,
            "net drive must exceed drag and rolling resistance, v_dot = {}",
            out.x_dot[5]
        );
        // Positive steer at positive speed yaws the car left.
        assert!(out.x_dot[3] > 0.0);
    }

    #[test]
    fn finite_at_the_speed_floor() {
        let model = sample_model();
        let u = Vector3::new(100.0, 0.0, 0.1);
        for omega in [0.0, 0.2, -0.2] {
            let x = Vector6::new(0.0, 0.0, 0.0, omega, 0.01, DoubleTrackModel::V_SPEED_FLOOR);
            let out = model.forward_dynamics(&x, &u);
            assert!(
                out.x_dot.iter().all(|v| v.is_finite()),
                "x_dot must stay finite at the speed floor, omega = {}",
                omega
            );
            assert!(out.Fz_ij.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn coasting_straight_decelerates() {
        let model = sample_model();
        let x = Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 20.0);
        let u = Vector3::zeros();

        let out = model.forward_dynamics(&x, &u);
        assert!(out.x_dot[5] < 0.0);
        assert_relative_eq!(out.x_dot[2], 0.0);
        assert_relative_eq!(out.gamma_y, 0.0, epsilon = 1e-9);

        let x_next = model.step(0.1, &x, &u);
        assert!(x_next[5] < 20.0 && x_next[5] > 19.9);
        assert_relative_eq!(x_next[1], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn straight_line_forces_balance() {
        let model = sample_model();
        let x = Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 20.0);
        let u = Vector3::zeros();

        let out = model.forward_dynamics(&x, &u);
        // No lateral force and symmetric vertical loads per axle.
        for fy in out.Fy_ij.iter() {
            assert_relative_eq!(*fy, 0.0, epsilon = 1e-9);
        }
        assert_relative_eq!(out.Fz_ij[0], out.Fz_ij[1], epsilon = 1e-9);
        assert_relative_eq!(out.Fz_ij[2], out.Fz_ij[3], epsilon = 1e-9);
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = config::Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/../config.toml"))
            .expect("sample config must load");
        let mut bad = config.model.clone();
        bad.mu = 0.0;
        assert!(matches!(
            DoubleTrackModel::new(config.vehicle, bad),
            Err(ModelError::Configuration(_))
        ));
    }
}
