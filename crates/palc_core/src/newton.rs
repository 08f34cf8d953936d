//! Newton corrector shared by every solve in the crate.

use std::marker::PhantomData;

use anyhow::{bail, Result};
use log::Level;
use serde::{Deserialize, Serialize};

use crate::error::{recoverable, SolveFailure};
use crate::solvers::LinearSolver;
use crate::traits::{lincomb, VectorSpace};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonPar {
    /// Convergence threshold on the residual norm.
    pub tol: f64,
    pub max_iter: usize,
    /// Log the iteration table at `info` level instead of `debug`.
    pub verbose: bool,
    /// Backtrack (halve the step) while the residual does not decrease.
    pub damped: bool,
    pub max_halvings: usize,
}

impl Default for NewtonPar {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_iter: 25,
            verbose: false,
            damped: false,
            max_halvings: 10,
        }
    }
}

impl NewtonPar {
    pub fn validate(&self) -> Result<()> {
        if self.tol.is_nan() || self.tol <= 0.0 {
            bail!("Newton tolerance must be positive (got {}).", self.tol);
        }
        if self.max_iter == 0 {
            bail!("Newton max_iter must be greater than zero.");
        }
        Ok(())
    }

    pub(crate) fn log_level(&self) -> Level {
        if self.verbose {
            Level::Info
        } else {
            Level::Debug
        }
    }
}

/// A square nonlinear system `F(x) = 0` in a fixed parameter.
pub trait NonlinearProblem {
    type State: VectorSpace;
    type Jacobian;

    fn residual(&mut self, x: &Self::State) -> Result<Self::State>;

    fn jacobian(&mut self, x: &Self::State) -> Result<Self::Jacobian>;

    /// Iterates outside the admissible set are rejected by the corrector.
    fn is_admissible(&self, _x: &Self::State) -> bool {
        true
    }
}

/// Closure-backed `NonlinearProblem`.
pub struct FnSystem<V, J, F, G> {
    residual: F,
    jacobian: G,
    _marker: PhantomData<fn(&V) -> J>,
}

impl<V, J, F, G> FnSystem<V, J, F, G>
where
    V: VectorSpace,
    F: FnMut(&V) -> Result<V>,
    G: FnMut(&V) -> Result<J>,
{
    pub fn new(residual: F, jacobian: G) -> Self {
        Self {
            residual,
            jacobian,
            _marker: PhantomData,
        }
    }
}

impl<V, J, F, G> NonlinearProblem for FnSystem<V, J, F, G>
where
    V: VectorSpace,
    F: FnMut(&V) -> Result<V>,
    G: FnMut(&V) -> Result<J>,
{
    type State = V;
    type Jacobian = J;

    fn residual(&mut self, x: &V) -> Result<V> {
        (self.residual)(x)
    }

    fn jacobian(&mut self, x: &V) -> Result<J> {
        (self.jacobian)(x)
    }
}

#[derive(Debug, Clone)]
pub struct NewtonOutcome<V> {
    pub solution: V,
    /// Residual norm history, starting with the initial guess.
    pub residuals: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub linear_iterations: usize,
    pub failure: Option<SolveFailure>,
}

impl<V> NewtonOutcome<V> {
    pub fn final_residual(&self) -> f64 {
        self.residuals.last().copied().unwrap_or(f64::NAN)
    }
}

pub fn newton<P, L>(
    problem: &mut P,
    x0: P::State,
    par: &NewtonPar,
    linsolve: &mut L,
) -> Result<NewtonOutcome<P::State>>
where
    P: NonlinearProblem,
    L: LinearSolver<P::State, P::Jacobian>,
{
    newton_with_norm(problem, x0, par, linsolve, |r: &P::State| r.norm())
}

/// Newton iteration `x <- x - J(x)^{-1} F(x)` with a caller-supplied norm
/// for the convergence test.
pub fn newton_with_norm<P, L, N>(
    problem: &mut P,
    x0: P::State,
    par: &NewtonPar,
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
    let mut res = norm(&f);
    let mut residuals = vec![res];
    let mut iterations = 0usize;
    let mut linear_iterations = 0usize;

    log_header(level);
    log_row(level, 0, res, 0);

    let failure = loop {
        if !res.is_finite() {
            break Some(SolveFailure::NonFiniteResidual);
        }
        if res < par.tol {
            break None;
        }
        if iterations >= par.max_iter {
            break Some(SolveFailure::NewtonNonConvergence {
                iterations,
                residual: res,
            });
        }

        let jac = match recoverable(problem.jacobian(&x))? {
            Ok(jac) => jac,
            Err(failure) => break Some(failure),
        };
        let step = linsolve.solve(&jac, &f)?;
        linear_iterations += step.iterations;
        if !step.converged {
            break Some(SolveFailure::LinearSolveFailure {
                iterations: step.iterations,
            });
        }
        iterations += 1;

        match take_step(problem, &x, &step.solution, res, par, &norm)? {
            Ok((next, f_next, res_next)) => {
                x = next;
                f = f_next;
                res = res_next;
            }
            Err(failure) => break Some(failure),
        }
        residuals.push(res);
        log_row(level, iterations, res, step.iterations);
    };

    if let Some(failure) = failure {
        log::log!(level, "Newton failed: {}", failure);
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

type Trial<V> = std::result::Result<(V, V, f64), SolveFailure>;

/// Full step, or backtracking along the Newton direction in damped mode.
fn take_step<P, N>(
    problem: &mut P,
    x: &P::State,
    direction: &P::State,
    res: f64,
    par: &NewtonPar,
    norm: &N,
) -> Result<Trial<P::State>>
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
            let res_trial = norm(&f_trial);
            if !par.damped || (res_trial.is_finite() && res_trial < res) {
                return Ok(Ok((trial, f_trial, res_trial)));
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

pub(crate) fn log_header(level: Level) {
    log::log!(level, "Newton Iterations");
    log::log!(
        level,
        "   Iterations      Func-count      f(x)      Linear-Iterations"
    );
}

pub(crate) fn log_row(level: Level, iteration: usize, residual: f64, linear: usize) {
    log::log!(
        level,
        "{:>9} {:>16} {:>14.4e} {:>9}",
        iteration,
        iteration + 1,
        residual,
        linear
    );
}
