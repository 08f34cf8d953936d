//! Deflation of known solutions.
//!
//! Newton applied to `M(x) F(x)` with
//! `M(x) = prod_r (1 / |x - r|^p + shift)` cannot converge to any of the
//! roots `r`, which makes it possible to discover additional solutions from
//! the same initial guess.

use anyhow::{bail, Result};

use crate::error::SolveFailure;
use crate::newton::{log_header, log_row, NewtonOutcome, NewtonPar, NonlinearProblem};
use crate::solvers::LinearSolver;
use crate::traits::{difference, lincomb, VectorSpace};

pub struct DeflationOperator<V> {
    power: f64,
    shift: f64,
    roots: Vec<V>,
    inner: fn(&V, &V) -> f64,
}

impl<V: VectorSpace> DeflationOperator<V> {
    pub fn new(power: f64, shift: f64, roots: Vec<V>) -> Result<Self> {
        if !(power.is_finite() && power > 0.0) {
            bail!("Deflation power must be positive (got {}).", power);
        }
        if !(shift.is_finite() && shift >= 0.0) {
            bail!("Deflation shift must be non-negative (got {}).", shift);
        }
        Ok(Self {
            power,
            shift,
            roots,
            inner: V::inner,
        })
    }

    /// Replace the inner product used for the distances `|x - r|`.
    pub fn with_inner(mut self, inner: fn(&V, &V) -> f64) -> Self {
        self.inner = inner;
        self
    }

    pub fn push(&mut self, root: V) {
        self.roots.push(root);
    }

    pub fn roots(&self) -> &[V] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    fn distance_sq(&self, x: &V, root: &V) -> f64 {
        let delta = difference(x, root);
        (self.inner)(&delta, &delta)
    }

    fn factor_for(&self, distance_sq: f64) -> f64 {
        distance_sq.powf(-0.5 * self.power) + self.shift
    }

    /// `M(x)`. Infinite at a known root.
    pub fn factor(&self, x: &V) -> f64 {
        self.roots
            .iter()
            .map(|root| self.factor_for(self.distance_sq(x, root)))
            .product()
    }

    /// `M(x) * F(x)` given `F(x)`.
    pub fn apply(&self, x: &V, fx: &V) -> V {
        let mut out = fx.clone();
        out.scale_by(self.factor(x));
        out
    }

    /// `grad(M) . d / M`, the relative change of the deflation factor along `d`.
    fn log_derivative(&self, x: &V, d: &V) -> f64 {
        self.roots
            .iter()
            .map(|root| {
                let delta = difference(x, root);
                let dist_sq = (self.inner)(&delta, &delta);
                let m = self.factor_for(dist_sq);
                -self.power * dist_sq.powf(-0.5 * self.power - 1.0) * (self.inner)(&delta, d) / m
            })
            .sum()
    }
}

/// Newton iteration on the deflated residual `M(x) F(x)`.
///
/// Only solves with the undeflated Jacobian are needed: with `d = J^{-1} F`
/// the deflated Newton step is `d / (1 + grad(M) . d / M)`.
pub fn newton_deflated<P, L>(
    problem: &mut P,
    x0: P::State,
    par: &NewtonPar,
    deflation: &DeflationOperator<P::State>,
    linsolve: &mut L,
) -> Result<NewtonOutcome<P::State>>
where
    P: NonlinearProblem,
    L: LinearSolver<P::State, P::Jacobian>,
{
    newton_deflated_with_norm(problem, x0, par, deflation, linsolve, |r: &P::State| {
        r.norm()
    })
}

/// Deflated Newton with a caller-supplied residual norm. An iterate is a
/// root only when both `norm(M(x) F(x))` and `norm(F(x))` are below `tol`.
pub fn newton_deflated_with_norm<P, L, N>(
    problem: &mut P,
    x0: P::State,
    par: &NewtonPar,
    deflation: &DeflationOperator<P::State>,
    linsolve: &mut L,
    norm: N,
) -> Result<NewtonOutcome<P::State>>
where
    P: NonlinearProblem,
    L: LinearSolver<P::State, P::Jacobian>,
    N: Fn(&P::State) -> f64,
{
    par.validate()?;
    let level = par.log_level();

    let mut x = x0;
    let mut f = problem.residual(&x)?;
    let mut plain = norm(&f);
    let mut res = deflation.factor(&x) * plain;
    let mut residuals = vec![res];
    let mut iterations = 0usize;
    let mut linear_iterations = 0usize;

    log::log!(level, "Deflated Newton with {} known roots", deflation.len());
    log_header(level);
    log_row(level, 0, res, 0);

    let failure = loop {
        if !res.is_finite() {
            break Some(SolveFailure::NonFiniteResidual);
        }
        if res < par.tol && plain < par.tol {
            break None;
        }
        if iterations >= par.max_iter {
            break Some(SolveFailure::NewtonNonConvergence {
                iterations,
                residual: res,
            });
        }

        let jac = problem.jacobian(&x)?;
        let step = linsolve.solve(&jac, &f)?;
        linear_iterations += step.iterations;
        if !step.converged {
            break Some(SolveFailure::LinearSolveFailure {
                iterations: step.iterations,
            });
        }
        iterations += 1;

        let denominator = 1.0 + deflation.log_derivative(&x, &step.solution);
        if !denominator.is_finite() || denominator == 0.0 {
            break Some(SolveFailure::NonFiniteResidual);
        }
        let mut direction = step.solution;
        direction.scale_by(1.0 / denominator);

        match deflated_step(problem, deflation, &x, &direction, res, par, &norm)? {
            Ok(trial) => {
                x = trial.x;
                f = trial.f;
                plain = trial.plain;
                res = trial.deflated;
            }
            Err(failure) => break Some(failure),
        }
        residuals.push(res);
        log_row(level, iterations, res, step.iterations);
    };

    if let Some(failure) = failure {
        log::log!(level, "Deflated Newton failed: {}", failure);
    }

    Ok(NewtonOutcome {
        solution: x,
        residuals,
        converged: failure.is_none(),
        iterations,
        linear_iterations,
        failure,
    })
}

struct DeflatedTrial<V> {
    x: V,
    f: V,
    plain: f64,
    deflated: f64,
}

/// Full deflated step, or backtracking on `norm(M F)` in damped mode.
fn deflated_step<P, N>(
    problem: &mut P,
    deflation: &DeflationOperator<P::State>,
    x: &P::State,
    direction: &P::State,
    res: f64,
    par: &NewtonPar,
    norm: &N,
) -> Result<std::result::Result<DeflatedTrial<P::State>, SolveFailure>>
where
    P: NonlinearProblem,
    N: Fn(&P::State) -> f64,
{
    let mut alpha = 1.0;
    let mut halvings = 0usize;
    loop {
        let trial = lincomb(1.0, x, -alpha, direction);
        if problem.is_admissible(&trial) {
            let f_trial = problem.residual(&trial)?;
            let plain = norm(&f_trial);
            let deflated = deflation.factor(&trial) * plain;
            if !par.damped || (deflated.is_finite() && deflated < res) {
                return Ok(Ok(DeflatedTrial {
                    x: trial,
                    f: f_trial,
                    plain,
                    deflated,
                }));
            }
        } else if !par.damped {
            return Ok(Err(SolveFailure::Inadmissible));
        }

        if halvings >= par.max_halvings {
            return Ok(Err(SolveFailure::LineSearchFailure { halvings }));
        }
        halvings += 1;
        alpha *= 0.5;
    }
}
