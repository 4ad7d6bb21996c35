#![allow(non_snake_case)]

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use prelude::float;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to deserialise config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn require(ok: bool, what: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(what.to_string()))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub vehicle: BaseVehicleConfig,
    pub model: DynamicsModelConfig,
    pub mpc: MpcConfig,
    pub simulation: SimulationConfig,
}

/// Immutable physical vehicle parameters.
#[derive(Clone, Debug, Deserialize)]
pub struct BaseVehicleConfig {
    pub chassis: ChassisConfig,
    pub aero: AeroConfig,
    pub front_tyre: TyreConfig,
    pub rear_tyre: TyreConfig,
    pub powertrain: PowertrainConfig,
    pub brakes: BrakeConfig,
    pub steer: SteerConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChassisConfig {
    pub total_mass: float,
    /// Moment of inertia about the vertical axis.
    pub moi: float,
    pub wheel_base: float,
    /// Fraction of the wheelbase between the front axle and the CG.
    pub cg_ratio: float,
    pub cg_height: float,
    pub tw_f: float,
    pub tw_r: float,
    /// Rolling resistance coefficient.
    pub fr: float,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AeroConfig {
    pub air_density: float,
    pub frontal_area: float,
    pub drag_coeff: float,
    pub cl_f: float,
    pub cl_r: float,
}

/// Extended magic formula coefficients for one axle.
#[derive(Clone, Debug, Deserialize)]
pub struct TyreConfig {
    pub pacejka_b: float,
    pub pacejka_c: float,
    pub pacejka_e: float,
    pub pacejka_fz0: float,
    pub pacejka_eps: float,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PowertrainConfig {
    /// Fraction of drive force applied to the front axle.
    pub kd: float,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrakeConfig {
    /// Fraction of brake force applied to the front axle.
    pub bias: float,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SteerConfig {
    pub max_steer: float,
    pub max_steer_rate: float,
}

/// Friction and actuator limits of the double track model.
#[derive(Clone, Debug, Deserialize)]
pub struct DynamicsModelConfig {
    pub mu: float,
    /// Fraction of the lateral load transfer carried by the front axle.
    pub kroll_f: float,
    pub P_max: float,
    pub Fd_max: float,
    /// Brake forces are negative by convention.
    pub Fb_max: float,
    pub Td: float,
    pub Tb: float,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MpcConfig {
    pub N: usize,
    pub dt: float,
    pub x_scale: Vec<float>,
    pub u_scale: Vec<float>,
    pub gamma_scale: float,
    pub q_v: float,
    pub q_omega: float,
    pub q_beta: float,
    pub Q_terminal_v: float,
    pub R: Vec<float>,
    pub constraint_tol: float,
    pub step_tol: float,
    pub max_sqp_iter: usize,
    pub max_qp_iter: u32,
    pub trust_region: float,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SimulationConfig {
    pub t: float,
    pub v_ref: float,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let mut config_str = String::new();
        File::open(path)?.read_to_string(&mut config_str)?;
        let config: Config = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vehicle.validate()?;
        self.model.validate()?;
        self.mpc.validate()?;
        require(self.simulation.t > 0.0, "simulation.t must be positive")?;
        Ok(())
    }
}

impl BaseVehicleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.chassis;
        require(c.total_mass > 0.0, "chassis.total_mass must be positive")?;
        require(c.moi > 0.0, "chassis.moi must be positive")?;
        require(c.wheel_base > 0.0, "chassis.wheel_base must be positive")?;
        require(
            c.cg_ratio > 0.0 && c.cg_ratio < 1.0,
            "chassis.cg_ratio must lie in (0, 1)",
        )?;
        require(c.cg_height > 0.0, "chassis.cg_height must be positive")?;
        require(
            c.tw_f > 0.0 && c.tw_r > 0.0,
            "chassis track widths must be positive",
        )?;
        require(c.fr >= 0.0, "chassis.fr must be non-negative")?;

        let a = &self.aero;
        require(a.air_density > 0.0, "aero.air_density must be positive")?;
        require(a.frontal_area > 0.0, "aero.frontal_area must be positive")?;
        require(a.drag_coeff >= 0.0, "aero.drag_coeff must be non-negative")?;

        for (tyre, name) in [(&self.front_tyre, "front_tyre"), (&self.rear_tyre, "rear_tyre")] {
            require(
                tyre.pacejka_fz0 > 0.0,
                &format!("{}.pacejka_fz0 must be positive", name),
            )?;
        }

        require(
            self.powertrain.kd >= 0.0 && self.powertrain.kd <= 1.0,
            "powertrain.kd must lie in [0, 1]",
        )?;
        require(
            self.brakes.bias >= 0.0 && self.brakes.bias <= 1.0,
            "brakes.bias must lie in [0, 1]",
        )?;
        require(self.steer.max_steer > 0.0, "steer.max_steer must be positive")?;
        require(
            self.steer.max_steer_rate > 0.0,
            "steer.max_steer_rate must be positive",
        )?;
        Ok(())
    }
}

impl DynamicsModelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(self.mu > 0.0, "model.mu must be positive")?;
        require(
            self.kroll_f >= 0.0 && self.kroll_f <= 1.0,
            "model.kroll_f must lie in [0, 1]",
        )?;
        require(self.P_max > 0.0, "model.P_max must be positive")?;
        require(self.Fd_max > 0.0, "model.Fd_max must be positive")?;
        require(self.Fb_max <= 0.0, "model.Fb_max must be non-positive")?;
        require(self.Td > 0.0, "model.Td must be positive")?;
        require(self.Tb > 0.0, "model.Tb must be positive")?;
        Ok(())
    }
}

impl MpcConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(self.N >= 1, "mpc.N must be at least 1")?;
        require(self.dt > 0.0, "mpc.dt must be positive")?;
        require(self.x_scale.len() == 6, "mpc.x_scale must have 6 entries")?;
        require(self.u_scale.len() == 3, "mpc.u_scale must have 3 entries")?;
        require(self.R.len() == 3, "mpc.R must have 3 entries")?;
        // Scale entries are used as divisors.
        require(
            self.x_scale.iter().chain(&self.u_scale).all(|&s| s > 0.0)
                && self.gamma_scale > 0.0,
            "mpc scale entries must be strictly positive",
        )?;
        require(
            self.q_v >= 0.0 && self.q_omega >= 0.0 && self.q_beta >= 0.0,
            "mpc tracking weights must be non-negative",
        )?;
        require(
            self.R.iter().all(|&r| r >= 0.0),
            "mpc.R entries must be non-negative",
        )?;
        require(
            self.constraint_tol > 0.0 && self.step_tol > 0.0,
            "mpc tolerances must be positive",
        )?;
        require(self.max_sqp_iter >= 1, "mpc.max_sqp_iter must be at least 1")?;
        require(self.max_qp_iter >= 1, "mpc.max_qp_iter must be at least 1")?;
        require(self.trust_region > 0.0, "mpc.trust_region must be positive")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/../config.toml"))
            .expect("sample config must load")
    }

    #[test]
    fn sample_config_loads_and_validates() {
        let config = sample();
        assert_eq!(config.mpc.x_scale.len(), 6);
        assert!(config.vehicle.chassis.total_mass > 0.0);
    }

    #[test]
    fn rejects_non_positive_mass() {
        let mut config = sample();
        config.vehicle.chassis.total_mass = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_non_positive_friction() {
        let mut config = sample();
        config.model.mu = -0.1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_scale_entry() {
        let mut config = sample();
        config.mpc.u_scale[1] = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_qp_iteration_cap() {
        let mut config = sample();
        config.mpc.max_qp_iter = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_positive_max_brake_force() {
        let mut config = sample();
        config.model.Fb_max = 100.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
