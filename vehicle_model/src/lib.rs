//! Double track planar vehicle dynamics for trajectory optimisation.
//!
//! The model is compiled once into a pure numeric mapping from
//! `(state, control, lateral load transfer)` to the state derivative and the
//! per-wheel tyre forces. The same mapping backs single-step evaluation
//! ([`DoubleTrackModel::forward_dynamics`]) and the per-stage constraint
//! contribution appended into an optimisation problem through the
//! [`NlpBuilder`] trait.

#![allow(non_snake_case)]

use prelude::*;
use thiserror::Error;

mod dynamics;
pub use dynamics::{Dynamics, DynamicsOutput, TyreCurve};

mod double_track;
pub use double_track::{DoubleTrackModel, ForwardDynamics};

/// State vector layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XIndex {
    X = 0,
    Y = 1,
    Yaw = 2,
    YawRate = 3,
    Slip = 4,
    Speed = 5,
}

/// Control vector layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UIndex {
    Drive = 0,
    Brake = 1,
    Steer = 2,
}

/// Per-wheel vector layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tyre {
    FL = 0,
    FR = 1,
    RL = 2,
    RR = 3,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Configuration(#[from] config::ConfigError),
    #[error("dynamics compilation failed: {0}")]
    Compilation(String),
}

/// Indices of one stage's decision variables within the optimisation problem.
///
/// The model only ever refers to variables through these indices; the actual
/// storage, scaling and solver representation belong to the problem builder.
#[derive(Clone, Debug)]
pub struct StageVars {
    pub x: [usize; 6],
    pub u: [usize; 3],
    pub gamma: usize,
    pub x_next: [usize; 6],
    pub u_next: Option<[usize; 3]>,
}

/// Evaluates one constraint block from the unscaled values of the decision
/// variables it was registered over, in registration order.
pub type ConstraintFn = Box<dyn Fn(&DVector<float>) -> DVector<float> + Send + Sync>;

/// Mutable problem builder receiving declarative constraint additions.
///
/// Equalities and inequalities are residual blocks over a subset of the
/// decision variables; simple box constraints go through [`NlpBuilder::bound`].
pub trait NlpBuilder {
    /// Adds the block `lower <= f(vars) <= upper`.
    fn constraint(
        &mut self,
        vars: Vec<usize>,
        lower: DVector<float>,
        upper: DVector<float>,
        f: ConstraintFn,
    );

    /// Adds the block `f(vars) == 0`.
    fn equality(&mut self, vars: Vec<usize>, rows: usize, f: ConstraintFn) {
        self.constraint(vars, DVector::zeros(rows), DVector::zeros(rows), f)
    }

    /// Tightens the box constraint on a single decision variable.
    fn bound(&mut self, var: usize, lower: float, upper: float);
}
