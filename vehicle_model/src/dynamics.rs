use config::{BaseVehicleConfig, DynamicsModelConfig};
use prelude::*;

use crate::ModelError;

const GRAVITY: float = 9.8;

/// Extended magic formula lateral force curve for one axle.
#[derive(Clone, Debug)]
pub struct TyreCurve {
    b: float,
    c: float,
    e: float,
    fz0: float,
    eps: float,
    mu: float,
}

impl TyreCurve {
    fn new(config: &config::TyreConfig, mu: float) -> TyreCurve {
        TyreCurve {
            b: config.pacejka_b,
            c: config.pacejka_c,
            e: config.pacejka_e,
            fz0: config.pacejka_fz0,
            eps: config.pacejka_eps,
            mu,
        }
    }

    /// Load sensitive lateral force at vertical load `fz` and slip angle `alpha`.
    pub fn lateral_force(&self, fz: float, alpha: float) -> float {
        let ba = self.b * alpha;
        self.mu
            * fz
            * (1.0 + self.eps * fz / self.fz0)
            * (self.c * (ba - self.e * (ba - ba.atan())).atan()).sin()
    }
}

/// Output of one dynamics evaluation.
#[derive(Clone, Debug)]
pub struct DynamicsOutput {
    pub x_dot: Vector6<float>,
    pub Fx_ij: Vector4<float>,
    pub Fy_ij: Vector4<float>,
    pub Fz_ij: Vector4<float>,
}

/// The compiled dynamics mapping.
///
/// All parameter-derived constants are computed once at construction; [`eval`]
/// is a pure function of `(x, u, gamma_y)` and is safe to call concurrently.
///
/// [`eval`]: Dynamics::eval
#[derive(Clone, Debug)]
pub struct Dynamics {
    m: float,
    Jzz: float,
    lf: float,
    lr: float,
    twf: float,
    twr: float,
    kd: float,
    kb: float,
    kroll_f: float,
    /// Rolling resistance force per front/rear wheel.
    roll_res_f: float,
    roll_res_r: float,
    fr_mg: float,
    /// 0.5 * cd * rho * A
    drag: float,
    /// 0.25 * cl * rho * A per axle.
    down_f: float,
    down_r: float,
    /// Static vertical load per front/rear wheel.
    static_f: float,
    static_r: float,
    /// 0.5 * hcog / l * m
    long_transfer: float,
    /// hcog / (0.5 * (twf + twr))
    pub(crate) load_transfer_gain: float,
    front: TyreCurve,
    rear: TyreCurve,
}

impl Dynamics {
    /// Compiles the symbolic force/derivative formulation down to fixed
    /// numeric coefficients. Expects validated configs.
    pub fn compile(
        base: &BaseVehicleConfig,
        model: &DynamicsModelConfig,
    ) -> Result<Dynamics, ModelError> {
        let c = &base.chassis;
        let a = &base.aero;

        let l = c.wheel_base;
        let lf = c.cg_ratio * l;
        let lr = l - lf;
        let fr_mg = c.fr * c.total_mass * GRAVITY;

        let dynamics = Dynamics {
            m: c.total_mass,
            Jzz: c.moi,
            lf,
            lr,
            twf: c.tw_f,
            twr: c.tw_r,
            kd: base.powertrain.kd,
            kb: base.brakes.bias,
            kroll_f: model.kroll_f,
            roll_res_f: 0.5 * fr_mg * lr / l,
            roll_res_r: 0.5 * fr_mg * lf / l,
            fr_mg,
            drag: 0.5 * a.drag_coeff * a.air_density * a.frontal_area,
            down_f: 0.25 * a.cl_f * a.air_density * a.frontal_area,
            down_r: 0.25 * a.cl_r * a.air_density * a.frontal_area,
            static_f: 0.5 * c.total_mass * GRAVITY * lr / l,
            static_r: 0.5 * c.total_mass * GRAVITY * lf / l,
            long_transfer: 0.5 * c.cg_height / l * c.total_mass,
            load_transfer_gain: c.cg_height / (0.5 * (c.tw_f + c.tw_r)),
            front: TyreCurve::new(&base.front_tyre, model.mu),
            rear: TyreCurve::new(&base.rear_tyre, model.mu),
        };

        let coeffs = [
            dynamics.lf,
            dynamics.lr,
            dynamics.static_f,
            dynamics.static_r,
            dynamics.load_transfer_gain,
        ];
        if coeffs.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(ModelError::Compilation(
                "derived chassis coefficients must be finite and positive".to_string(),
            ));
        }
        Ok(dynamics)
    }

    /// Evaluates the state derivative and per-wheel tyre forces at a fixed
    /// lateral load transfer `gamma_y`.
    ///
    /// The tyre slip geometry divides by `v * cos(beta) -/+ 0.5 * tw * omega`
    /// and the slip angle derivative by `m * v`, so the mapping is only
    /// meaningful above a minimum speed; see
    /// [`DoubleTrackModel::V_SPEED_FLOOR`](crate::DoubleTrackModel::V_SPEED_FLOOR).
    pub fn eval(&self, x: &Vector6<float>, u: &Vector3<float>, gamma_y: float) -> DynamicsOutput {
        let phi = x[2];
        let omega = x[3];
        let beta = x[4];
        let v = x[5];
        let fd = u[0];
        let fb = u[1];
        let delta = u[2];
        let v_sq = v * v;

        // Longitudinal tyre force, split by drive and brake bias.
        let Fx_f = 0.5 * self.kd * fd + 0.5 * self.kb * fb - self.roll_res_f;
        let Fx_fl = Fx_f;
        let Fx_fr = Fx_f;
        let Fx_r = 0.5 * (1.0 - self.kd) * fd + 0.5 * (1.0 - self.kb) * fb - self.roll_res_r;
        let Fx_rl = Fx_r;
        let Fx_rr = Fx_r;

        // Longitudinal acceleration driving the fore/aft load transfer.
        let ax = (fd + fb - self.drag * v_sq - self.fr_mg) / self.m;

        // Vertical tyre force: static weight, longitudinal transfer, lateral
        // transfer via gamma_y and aerodynamic downforce.
        let Fz_f = self.static_f - self.long_transfer * ax + self.down_f * v_sq;
        let Fz_fl = Fz_f - self.kroll_f * gamma_y;
        let Fz_fr = Fz_f + self.kroll_f * gamma_y;
        let Fz_r = self.static_r + self.long_transfer * ax + self.down_r * v_sq;
        let Fz_rl = Fz_r - (1.0 - self.kroll_f) * gamma_y;
        let Fz_rr = Fz_r + (1.0 - self.kroll_f) * gamma_y;

        // Tyre sideslip angles from the body-frame velocity at each corner.
        let vx_body = v * beta.cos();
        let vy_body = v * beta.sin();
        let a_fl = delta - ((self.lf * omega + vy_body) / (vx_body - 0.5 * self.twf * omega)).atan();
        let a_fr = delta - ((self.lf * omega + vy_body) / (vx_body + 0.5 * self.twf * omega)).atan();
        let a_rl = ((self.lr * omega - vy_body) / (vx_body - 0.5 * self.twr * omega)).atan();
        let a_rr = ((self.lr * omega - vy_body) / (vx_body + 0.5 * self.twr * omega)).atan();

        let Fy_fl = self.front.lateral_force(Fz_fl, a_fl);
        let Fy_fr = self.front.lateral_force(Fz_fr, a_fr);
        let Fy_rl = self.rear.lateral_force(Fz_rl, a_rl);
        let Fy_rr = self.rear.lateral_force(Fz_rr, a_rr);

        // Planar rigid body equations of motion over all four corners.
        let (sin_b, cos_b) = beta.sin_cos();
        let (sin_d, cos_d) = delta.sin_cos();
        let (sin_db, cos_db) = (delta - beta).sin_cos();
        let drag_force = self.drag * v_sq;

        let v_dot = ((Fx_rl + Fx_rr) * cos_b + (Fx_fl + Fx_fr) * cos_db
            + (Fy_rl + Fy_rr) * sin_b
            - (Fy_fl + Fy_fr) * sin_db
            - drag_force * cos_b)
            / self.m;
        let beta_dot = -omega
            + (-(Fx_rl + Fx_rr) * sin_b + (Fx_fl + Fx_fr) * sin_db
                + (Fy_rl + Fy_rr) * cos_b
                + (Fy_fl + Fy_fr) * cos_db
                + drag_force * sin_b)
                / (self.m * v);
        let omega_dot = ((Fx_rr - Fx_rl) * self.twr / 2.0 - (Fy_rl + Fy_rr) * self.lr
            + ((Fx_fr - Fx_fl) * cos_d + (Fy_fl - Fy_fr) * sin_d) * self.twf / 2.0
            + ((Fy_fl + Fy_fr) * cos_d + (Fx_fl + Fx_fr) * sin_d) * self.lf)
            / self.Jzz;

        let x_dot = Vector6::new(v * phi.cos(), v * phi.sin(), omega, omega_dot, beta_dot, v_dot);

        DynamicsOutput {
            x_dot,
            Fx_ij: Vector4::new(Fx_fl, Fx_fr, Fx_rl, Fx_rr),
            Fy_ij: Vector4::new(Fy_fl, Fy_fr, Fy_rl, Fy_rr),
            Fz_ij: Vector4::new(Fz_fl, Fz_fr, Fz_rl, Fz_rr),
        }
    }

    /// Closed-form lateral load transfer implied by the tyre forces of `out`.
    pub fn lateral_load_transfer(&self, out: &DynamicsOutput, delta: float) -> float {
        use crate::Tyre::*;
        let Fx = &out.Fx_ij;
        let Fy = &out.Fy_ij;
        self.load_transfer_gain
            * (Fy[RL as usize]
                + Fy[RR as usize]
                + (Fx[FL as usize] + Fx[FR as usize]) * delta.sin()
                + (Fy[FL as usize] + Fy[FR as usize]) * delta.cos())
    }
}
