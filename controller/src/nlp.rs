//! Sequential quadratic programming on OSQP for stage-structured problems.
//!
//! [`StageNlp`] accumulates nonlinear constraint blocks through the
//! [`NlpBuilder`] interface. Each block owns the indices of the scaled
//! decision variables it touches, so Jacobians are differenced per block over
//! a handful of columns instead of the full variable vector. Every SQP
//! iteration linearises the blocks, assembles a sparse QP over the step and
//! solves it with OSQP, then applies a merit function line search.

use std::borrow::Cow;

use itertools::Itertools;
use log::{debug, warn};
use osqp::{CscMatrix, Problem, Settings, Status};

use prelude::*;
use vehicle_model::{ConstraintFn, NlpBuilder};

use crate::{SolveDiagnostics, SolveStatus};

/// Central difference step in scaled variable space.
const FD_STEP: float = 1e-5;
/// Levenberg damping keeping the Gauss-Newton Hessian positive definite.
const HESSIAN_DAMPING: float = 1e-8;
/// Constraint violation weight in the line search merit function.
const MERIT_NU: float = 1e4;

#[derive(Clone, Copy, Debug)]
pub struct SqpOptions {
    pub constraint_tol: float,
    pub step_tol: float,
    pub max_sqp_iter: usize,
    pub max_qp_iter: u32,
    pub trust_region: float,
}

struct Block {
    vars: Vec<usize>,
    lower: DVector<float>,
    upper: DVector<float>,
    f: ConstraintFn,
    row0: usize,
}

struct CostBlock {
    vars: Vec<usize>,
    f: ConstraintFn,
}

/// A stage-structured NLP over scaled decision variables.
///
/// Constraint and cost closures always receive unscaled (physical) values;
/// the builder owns the scale vector and converts at every evaluation.
pub struct StageNlp {
    scale: DVector<float>,
    blocks: Vec<Block>,
    n_rows: usize,
    // Scaled box bounds on the decision variables.
    var_lower: DVector<float>,
    var_upper: DVector<float>,
    cost_blocks: Vec<CostBlock>,
}

impl NlpBuilder for StageNlp {
    fn constraint(
        &mut self,
        vars: Vec<usize>,
        lower: DVector<float>,
        upper: DVector<float>,
        f: ConstraintFn,
    ) {
        assert_eq!(lower.len(), upper.len());
        assert!(vars.iter().all(|&v| v < self.scale.len()));
        let rows = lower.len();
        self.blocks.push(Block {
            vars,
            lower,
            upper,
            f,
            row0: self.n_rows,
        });
        self.n_rows += rows;
    }

    fn bound(&mut self, var: usize, lower: float, upper: float) {
        // Scales are strictly positive so the ordering is preserved.
        let s = self.scale[var];
        self.var_lower[var] = max(self.var_lower[var], lower / s);
        self.var_upper[var] = min(self.var_upper[var], upper / s);
    }
}

impl StageNlp {
    pub fn new(scale: DVector<float>) -> StageNlp {
        let n = scale.len();
        StageNlp {
            scale,
            blocks: Vec::new(),
            n_rows: 0,
            var_lower: DVector::from_element(n, NEG_INFINITY),
            var_upper: DVector::from_element(n, INFINITY),
            cost_blocks: Vec::new(),
        }
    }

    pub fn n_vars(&self) -> usize {
        self.scale.len()
    }

    /// Pins a decision variable to a physical value.
    pub fn fix(&mut self, var: usize, value: float) {
        let s = self.scale[var];
        self.var_lower[var] = value / s;
        self.var_upper[var] = value / s;
    }

    /// Adds the residual block `r(vars)`; the total cost is the sum of
    /// squared residuals over all blocks.
    pub fn cost(&mut self, vars: Vec<usize>, f: ConstraintFn) {
        assert!(vars.iter().all(|&v| v < self.scale.len()));
        self.cost_blocks.push(CostBlock { vars, f });
    }

    fn physical(&self, z: &DVector<float>, vars: &[usize]) -> DVector<float> {
        DVector::from_iterator(vars.len(), vars.iter().map(|&j| z[j] * self.scale[j]))
    }

    /// Evaluates all constraint blocks. Returns the per-block residuals, the
    /// infinity norm and the one-norm of the bound violations. Any non-finite
    /// residual poisons both norms.
    fn eval_constraints(&self, z: &DVector<float>) -> (Vec<DVector<float>>, float, float) {
        let mut residuals = Vec::with_capacity(self.blocks.len());
        let mut viol_inf = 0.0;
        let mut viol_sum = 0.0;
        for block in &self.blocks {
            let g = (block.f)(&self.physical(z, &block.vars));
            assert_eq!(g.len(), block.lower.len());
            for r in 0..g.len() {
                if !g[r].is_finite() {
                    viol_inf = INFINITY;
                    viol_sum = INFINITY;
                    continue;
                }
                let v = max(max(g[r] - block.upper[r], block.lower[r] - g[r]), 0.0);
                viol_inf = max(viol_inf, v);
                viol_sum += v;
            }
            residuals.push(g);
        }
        (residuals, viol_inf, viol_sum)
    }

    fn cost_value(&self, z: &DVector<float>) -> float {
        self.cost_blocks
            .iter()
            .map(|block| (block.f)(&self.physical(z, &block.vars)).norm_squared())
            .sum()
    }

    fn merit(&self, z: &DVector<float>) -> float {
        let (_, _, viol_sum) = self.eval_constraints(z);
        self.cost_value(z) + MERIT_NU * viol_sum
    }

    /// Central difference Jacobian of a residual closure over its own
    /// variables, differenced in scaled space.
    fn block_jacobian(
        &self,
        z: &DVector<float>,
        vars: &[usize],
        f: &ConstraintFn,
        rows: usize,
    ) -> DMatrix<float> {
        let phys0 = self.physical(z, vars);
        let mut jac = DMatrix::zeros(rows, vars.len());
        for (col, &var) in vars.iter().enumerate() {
            let s = self.scale[var];
            let mut phys = phys0.clone();
            phys[col] = s * (z[var] + FD_STEP);
            let g_plus = f(&phys);
            phys[col] = s * (z[var] - FD_STEP);
            let g_minus = f(&phys);
            for r in 0..rows {
                jac[(r, col)] = (g_plus[r] - g_minus[r]) / (2.0 * FD_STEP);
            }
        }
        jac
    }

    fn clamp_into_box(&self, z: &mut DVector<float>) {
        for j in 0..z.len() {
            z[j] = clamp(z[j], self.var_lower[j], self.var_upper[j]);
        }
    }

    /// Runs the SQP loop from the scaled initial iterate `z`.
    ///
    /// Always returns an iterate; the status distinguishes convergence,
    /// proven infeasibility of the linearised subproblem and an exhausted
    /// iteration budget.
    pub fn solve(&self, mut z: DVector<float>, opts: &SqpOptions) -> (DVector<float>, SolveDiagnostics) {
        assert_eq!(z.len(), self.n_vars());
        self.clamp_into_box(&mut z);

        let mut best = z.clone();
        let mut best_merit = self.merit(&best);
        let mut trust_region = opts.trust_region;
        let mut relaxed = false;
        let mut status = SolveStatus::DidNotConverge;
        let mut iterations = 0;

        for iter in 0..opts.max_sqp_iter {
            iterations = iter + 1;
            let (residuals, viol_inf, viol_sum) = self.eval_constraints(&z);
            let cost = self.cost_value(&z);
            let merit = cost + MERIT_NU * viol_sum;
            if merit < best_merit {
                best_merit = merit;
                best = z.clone();
            }
            debug!(
                "sqp iter {}: cost {:.6e} violation {:.3e} trust region {:.2e}",
                iter, cost, viol_inf, trust_region
            );

            let dz = match self.solve_qp(&z, &residuals, trust_region, opts) {
                QpOutcome::Step(dz) => dz,
                QpOutcome::PrimalInfeasible => {
                    if !relaxed {
                        // One shot: linearisation plus a tight trust region can
                        // cut off feasible points, so retry before giving up.
                        relaxed = true;
                        trust_region *= 10.0;
                        continue;
                    }
                    status = SolveStatus::Infeasible;
                    break;
                }
                QpOutcome::Failed => {
                    status = SolveStatus::DidNotConverge;
                    break;
                }
            };

            if viol_inf <= opts.constraint_tol && dz.amax() <= opts.step_tol {
                status = SolveStatus::Converged;
                break;
            }

            // Backtracking line search on the merit function.
            let mut accepted = false;
            for k in 0..5 {
                let alpha = 0.5f64.powi(k);
                let mut z_trial = &z + alpha * &dz;
                self.clamp_into_box(&mut z_trial);
                if self.merit(&z_trial) < merit {
                    z = z_trial;
                    accepted = true;
                    break;
                }
            }
            if !accepted {
                if viol_inf <= opts.constraint_tol {
                    // No descent direction left but the iterate is feasible.
                    status = SolveStatus::Converged;
                    break;
                }
                trust_region *= 0.5;
                if trust_region < 1e-6 {
                    status = SolveStatus::DidNotConverge;
                    break;
                }
            }
        }

        let (_, _, viol_sum) = self.eval_constraints(&z);
        if self.cost_value(&z) + MERIT_NU * viol_sum > best_merit {
            z = best;
        }
        let (_, constraint_violation, _) = self.eval_constraints(&z);
        let cost = self.cost_value(&z);
        (
            z,
            SolveDiagnostics {
                status,
                sqp_iterations: iterations,
                constraint_violation,
                cost,
            },
        )
    }

    /// Linearises the problem at `z` and solves the step QP.
    fn solve_qp(
        &self,
        z: &DVector<float>,
        residuals: &[DVector<float>],
        trust_region: float,
        opts: &SqpOptions,
    ) -> QpOutcome {
        let n = self.n_vars();
        let m = self.n_rows + n;

        // Constraint Jacobian triplets and linearised bounds.
        let mut triplets = Vec::new();
        let mut l = DVector::from_element(m, NEG_INFINITY);
        let mut u = DVector::from_element(m, INFINITY);
        for (block, g0) in self.blocks.iter().zip(residuals) {
            let jac = self.block_jacobian(z, &block.vars, &block.f, g0.len());
            for (col, &var) in block.vars.iter().enumerate() {
                for r in 0..g0.len() {
                    let v = jac[(r, col)];
                    if v != 0.0 {
                        triplets.push((block.row0 + r, var, v));
                    }
                }
            }
            for r in 0..g0.len() {
                l[block.row0 + r] = block.lower[r] - g0[r];
                u[block.row0 + r] = block.upper[r] - g0[r];
            }
        }

        // Box and trust region rows.
        for j in 0..n {
            triplets.push((self.n_rows + j, j, 1.0));
            let mut lo = max(self.var_lower[j] - z[j], -trust_region);
            let mut hi = min(self.var_upper[j] - z[j], trust_region);
            if lo > hi {
                lo = self.var_lower[j] - z[j];
                hi = self.var_upper[j] - z[j];
            }
            l[self.n_rows + j] = lo;
            u[self.n_rows + j] = hi;
        }

        // Gauss-Newton cost: H = sum J^T J, grad = sum J^T r.
        let mut hess = DMatrix::zeros(n, n);
        let mut grad = DVector::zeros(n);
        for block in &self.cost_blocks {
            let r0 = (block.f)(&self.physical(z, &block.vars));
            let jac = self.block_jacobian(z, &block.vars, &block.f, r0.len());
            let jtj = jac.transpose() * &jac;
            let jtr = jac.transpose() * &r0;
            for (a, &va) in block.vars.iter().enumerate() {
                grad[va] += jtr[a];
                for (b, &vb) in block.vars.iter().enumerate() {
                    hess[(va, vb)] += jtj[(a, b)];
                }
            }
        }
        for j in 0..n {
            hess[(j, j)] += HESSIAN_DAMPING;
        }

        let P = csc_upper_tri_from_dense(&hess);
        let A = csc_from_triplets(m, n, triplets);

        let settings = Settings::default()
            .verbose(false)
            .polish(true)
            .eps_abs(1e-7)
            .eps_rel(1e-7)
            .max_iter(opts.max_qp_iter);

        let mut problem = match Problem::new(P, grad.as_slice(), A, l.as_slice(), u.as_slice(), &settings)
        {
            Ok(problem) => problem,
            Err(err) => {
                warn!("qp setup failed: {:?}", err);
                return QpOutcome::Failed;
            }
        };

        match problem.solve() {
            Status::Solved(solution)
            | Status::SolvedInaccurate(solution)
            | Status::MaxIterationsReached(solution)
            | Status::TimeLimitReached(solution) => {
                QpOutcome::Step(DVector::from_column_slice(solution.x()))
            }
            Status::PrimalInfeasible(_) | Status::PrimalInfeasibleInaccurate(_) => {
                QpOutcome::PrimalInfeasible
            }
            Status::DualInfeasible(_) | Status::DualInfeasibleInaccurate(_) => {
                warn!("qp dual infeasible");
                QpOutcome::Failed
            }
            _ => QpOutcome::Failed,
        }
    }
}

enum QpOutcome {
    Step(DVector<float>),
    PrimalInfeasible,
    Failed,
}

/// Builds a CSC matrix from unordered triplets, summing duplicates.
fn csc_from_triplets(
    nrows: usize,
    ncols: usize,
    mut triplets: Vec<(usize, usize, float)>,
) -> CscMatrix<'static> {
    triplets.sort_unstable_by_key(|&(r, c, _)| (c, r));
    let coords: Vec<_> = triplets
        .into_iter()
        .coalesce(|a, b| {
            if a.0 == b.0 && a.1 == b.1 {
                Ok((a.0, a.1, a.2 + b.2))
            } else {
                Err((a, b))
            }
        })
        .collect();

    let mut indptr = vec![0; ncols + 1];
    let mut indices = Vec::with_capacity(coords.len());
    let mut data = Vec::with_capacity(coords.len());
    let mut last_c = 0;
    for (i, &(r, c, v)) in coords.iter().enumerate() {
        while last_c < c {
            last_c += 1;
            indptr[last_c] = i;
        }
        indices.push(r);
        data.push(v);
    }
    while last_c < ncols {
        last_c += 1;
        indptr[last_c] = coords.len();
    }

    CscMatrix {
        nrows,
        ncols,
        indptr: Cow::Owned(indptr),
        indices: Cow::Owned(indices),
        data: Cow::Owned(data),
    }
}

/// Upper triangle of a dense symmetric matrix in CSC form, keeping the full
/// diagonal as OSQP expects.
fn csc_upper_tri_from_dense(dense: &DMatrix<float>) -> CscMatrix<'static> {
    let n = dense.ncols();
    let mut indptr = Vec::with_capacity(n + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for c in 0..n {
        for r in 0..=c {
            let v = dense[(r, c)];
            if v != 0.0 || r == c {
                indices.push(r);
                data.push(v);
            }
        }
        indptr.push(indices.len());
    }
    CscMatrix {
        nrows: n,
        ncols: n,
        indptr: Cow::Owned(indptr),
        indices: Cow::Owned(indices),
        data: Cow::Owned(data),
    }
}
