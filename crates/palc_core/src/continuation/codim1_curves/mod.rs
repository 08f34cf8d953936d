//! Fold and Hopf points: refinement and two-parameter continuation.
//!
//! Both use the Minimally Augmented formulation: the singularity condition is
//! a scalar (Fold) or complex (Hopf) function `sigma` obtained from a bordered
//! system whose borders approximate the null vectors. Only bordered solves
//! with `J` (or its real `2n` complex-shifted form) are required, so the same
//! code works for dense, sparse and matrix-free Jacobians.

mod fold_curve;
mod hopf_curve;

pub use fold_curve::{
    continuation_fold, newton_fold, newton_fold_from_branch, Borders as FoldBorders,
    FoldCurveProblem, FoldOutcome,
};
pub use hopf_curve::{
    continuation_hopf, newton_hopf, newton_hopf_from_branch, HopfBorders, HopfCurveProblem,
    HopfOutcome,
};

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use nalgebra::DVector;
use num_complex::Complex;

use super::problem::{BifurcationProblem, ContinuationProblem};
use crate::jacobian::JacobianHandle;
use crate::solvers::LinearSolver;

/// Relative step of the finite differences used for second derivatives and
/// parameter derivatives of the Jacobian.
const FD_STEP: f64 = 1e-6;

static FD_HESSIAN_LOGGED: AtomicBool = AtomicBool::new(false);

/// A system `F(x, p1, p2) = 0` with two parameters.
pub trait TwoParameterProblem {
    fn residual(&mut self, x: &DVector<f64>, p1: f64, p2: f64) -> Result<DVector<f64>>;

    fn jacobian(&mut self, x: &DVector<f64>, p1: f64, p2: f64) -> Result<JacobianHandle>;

    fn jacobian_transpose(&mut self, x: &DVector<f64>, p1: f64, p2: f64) -> Result<JacobianHandle> {
        self.jacobian(x, p1, p2)?.transpose()
    }

    /// `d^2F[v1, v2]`, or `None` to fall back to finite differences.
    fn hessian(
        &mut self,
        _x: &DVector<f64>,
        _p1: f64,
        _p2: f64,
        _v1: &DVector<f64>,
        _v2: &DVector<f64>,
    ) -> Result<Option<DVector<f64>>> {
        Ok(None)
    }
}

/// `F(., ., p2)` as a one-parameter problem in `p1`.
pub struct FreezeSecond<'a, Q: ?Sized> {
    problem: &'a mut Q,
    p2: f64,
}

impl<'a, Q: TwoParameterProblem + ?Sized> FreezeSecond<'a, Q> {
    pub fn new(problem: &'a mut Q, p2: f64) -> Self {
        Self { problem, p2 }
    }
}

impl<Q: TwoParameterProblem + ?Sized> ContinuationProblem for FreezeSecond<'_, Q> {
    type State = DVector<f64>;
    type Jacobian = JacobianHandle;

    fn residual(&mut self, x: &DVector<f64>, p1: f64) -> Result<DVector<f64>> {
        self.problem.residual(x, p1, self.p2)
    }

    fn jacobian(&mut self, x: &DVector<f64>, p1: f64) -> Result<JacobianHandle> {
        self.problem.jacobian(x, p1, self.p2)
    }
}

impl<Q: TwoParameterProblem + ?Sized> BifurcationProblem for FreezeSecond<'_, Q> {
    fn jacobian_transpose(&mut self, x: &DVector<f64>, p1: f64) -> Result<JacobianHandle> {
        self.problem.jacobian_transpose(x, p1, self.p2)
    }

    fn hessian(
        &mut self,
        x: &DVector<f64>,
        p1: f64,
        v1: &DVector<f64>,
        v2: &DVector<f64>,
    ) -> Result<Option<DVector<f64>>> {
        self.problem.hessian(x, p1, self.p2, v1, v2)
    }
}

fn log_fd_hessian_once() {
    if !FD_HESSIAN_LOGGED.swap(true, Ordering::Relaxed) {
        log::info!(
            "No analytic second derivative supplied; using finite differences of the Jacobian"
        );
    }
}

fn fd_step(x: &DVector<f64>, direction: &DVector<f64>) -> Option<f64> {
    let norm = direction.norm();
    (norm > 0.0 && norm.is_finite()).then(|| FD_STEP * (1.0 + x.norm()) / norm)
}

/// `d^2F(x, p)[v1, v2]`.
pub(crate) fn second_derivative<P: BifurcationProblem + ?Sized>(
    problem: &mut P,
    x: &DVector<f64>,
    p: f64,
    v1: &DVector<f64>,
    v2: &DVector<f64>,
) -> Result<DVector<f64>> {
    if let Some(exact) = problem.hessian(x, p, v1, v2)? {
        return Ok(exact);
    }
    log_fd_hessian_once();
    let Some(h) = fd_step(x, v2) else {
        return Ok(DVector::zeros(x.len()));
    };
    let plus = problem.jacobian(&(x + v2 * h), p)?.apply(v1);
    let minus = problem.jacobian(&(x - v2 * h), p)?.apply(v1);
    Ok((plus - minus) / (2.0 * h))
}

/// `None` as soon as one Hessian column is unavailable.
fn analytic_contraction<P: BifurcationProblem + ?Sized>(
    problem: &mut P,
    x: &DVector<f64>,
    p: f64,
    w: &DVector<f64>,
    v: &DVector<f64>,
) -> Result<Option<DVector<f64>>> {
    let n = x.len();
    if n == 0 {
        return Ok(None);
    }
    let mut out = DVector::zeros(n);
    let mut unit = DVector::zeros(n);
    for k in 0..n {
        unit[k] = 1.0;
        let Some(column) = problem.hessian(x, p, v, &unit)? else {
            return Ok(None);
        };
        out[k] = w.dot(&column);
        unit[k] = 0.0;
    }
    Ok(Some(out))
}

/// The gradient `k -> w^T d^2F[v, e_k]`.
pub(crate) fn hessian_contraction<P: BifurcationProblem + ?Sized>(
    problem: &mut P,
    x: &DVector<f64>,
    p: f64,
    w: &DVector<f64>,
    v: &DVector<f64>,
) -> Result<DVector<f64>> {
    let n = x.len();
    if let Some(out) = analytic_contraction(problem, x, p, w, v)? {
        return Ok(out);
    }

    log_fd_hessian_once();
    let Some(h) = fd_step(x, v) else {
        return Ok(DVector::zeros(n));
    };
    let plus = problem.jacobian_transpose(&(x + v * h), p)?.apply(w);
    let minus = problem.jacobian_transpose(&(x - v * h), p)?.apply(w);
    Ok((plus - minus) / (2.0 * h))
}

/// `(dJ/dp) v` by a central difference in the parameter.
pub(crate) fn param_jacobian_action<P: BifurcationProblem + ?Sized>(
    problem: &mut P,
    x: &DVector<f64>,
    p: f64,
    v: &DVector<f64>,
) -> Result<DVector<f64>> {
    let h = FD_STEP * (1.0 + p.abs());
    let plus = problem.jacobian(x, p + h)?.apply(v);
    let minus = problem.jacobian(x, p - h)?.apply(v);
    Ok((plus - minus) / (2.0 * h))
}

/// Approximate null vector of `jac` from two steps of inverse iteration.
/// A step whose solve fails keeps the previous iterate.
pub(crate) fn inverse_iteration<L>(jac: &JacobianHandle, linsolve: &mut L) -> Result<DVector<f64>>
where
    L: LinearSolver<DVector<f64>, JacobianHandle>,
{
    let n = jac.dim();
    let mut x = DVector::from_fn(n, |i, _| 1.0 + 0.1 * (i as f64 + 1.0).sin());
    x /= x.norm();
    for _ in 0..2 {
        let solve = linsolve.solve(jac, &x)?;
        let norm = solve.solution.norm();
        if !solve.converged || !norm.is_finite() || norm == 0.0 {
            log::debug!("Inverse iteration stopped early: singular solve");
            break;
        }
        x = solve.solution / norm;
    }
    Ok(x)
}

pub(crate) fn split_complex(v: &DVector<Complex<f64>>) -> (DVector<f64>, DVector<f64>) {
    (v.map(|c| c.re), v.map(|c| c.im))
}

pub(crate) fn join_complex(re: &DVector<f64>, im: &DVector<f64>) -> DVector<Complex<f64>> {
    DVector::from_fn(re.len(), |i, _| Complex::new(re[i], im[i]))
}

/// Normalize to unit Euclidean norm; zero or non-finite vectors are left as is.
pub(crate) fn normalized(v: DVector<f64>) -> DVector<f64> {
    let norm = v.norm();
    if norm > 0.0 && norm.is_finite() {
        v / norm
    } else {
        v
    }
}

/// Split `z = (x, tail...)` into the state and the trailing scalars.
pub(crate) fn split_state(z: &DVector<f64>, tail: usize) -> Result<(DVector<f64>, Vec<f64>)> {
    if z.len() <= tail {
        anyhow::bail!(
            "Augmented state of length {} is too short for {} extra unknowns",
            z.len(),
            tail
        );
    }
    let n = z.len() - tail;
    Ok((z.rows(0, n).into_owned(), z.rows(n, tail).iter().copied().collect()))
}

pub(crate) fn stack(x: &DVector<f64>, tail: &[f64]) -> DVector<f64> {
    DVector::from_iterator(x.len() + tail.len(), x.iter().copied().chain(tail.iter().copied()))
}
