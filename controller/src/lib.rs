//! Receding horizon racing controller.
//!
//! [`RacingMpc`] assembles a multi-stage nonlinear program from the vehicle
//! model's per-stage constraint contribution, solves it by sequential
//! quadratic programming on OSQP and returns the unscaled trajectories. The
//! caller applies only the first control of the returned sequence each cycle.

#![allow(non_snake_case)]

use prelude::*;
use thiserror::Error;

mod nlp;
pub use nlp::{SqpOptions, StageNlp};

mod racing_mpc;
pub use racing_mpc::RacingMpc;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Configuration(#[from] config::ConfigError),
    #[error(transparent)]
    Model(#[from] vehicle_model::ModelError),
    #[error("dimension mismatch for {name}: expected {expected}, got {actual}")]
    DimensionMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Outcome of one `solve` call. Non-converged outcomes still carry the best
/// available iterate so the caller can pick a recovery strategy per status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveStatus {
    /// Constraint violation and step size are below tolerance.
    Converged,
    /// The solver proved the linearised subproblem infeasible at the current
    /// state and reference.
    Infeasible,
    /// The iteration budget ran out before meeting tolerance.
    DidNotConverge,
    /// Heuristic initial guess; never a control output.
    WarmStart,
}

#[derive(Clone, Copy, Debug)]
pub struct SolveDiagnostics {
    pub status: SolveStatus,
    pub sqp_iterations: usize,
    /// Infinity norm of the constraint violation at the returned iterate.
    pub constraint_violation: float,
    pub cost: float,
}

/// Per-stage reference data over the horizon; both vectors must hold at least
/// `N + 1` entries.
#[derive(Clone, Debug)]
pub struct MpcReference {
    pub speed: DVector<float>,
    pub curvature: DVector<float>,
}

pub struct MpcInput<'a> {
    pub x0: Vector6<float>,
    pub reference: &'a MpcReference,
    /// Control applied in the previous real-world cycle, used to rate-limit
    /// the first stage.
    pub u_prev: Option<Vector3<float>>,
    /// Prior solution used to seed the solver.
    pub prior: Option<&'a MpcSolution>,
}

/// State, control and load transfer trajectories over the horizon.
#[derive(Clone, Debug)]
pub struct MpcSolution {
    /// 6 x (N + 1)
    pub x: DMatrix<float>,
    /// 3 x N
    pub u: DMatrix<float>,
    /// N
    pub gamma: DVector<float>,
    pub diagnostics: SolveDiagnostics,
}

impl MpcSolution {
    pub fn first_control(&self) -> Vector3<float> {
        let u0 = self.u.column(0);
        Vector3::new(u0[0], u0[1], u0[2])
    }
}
