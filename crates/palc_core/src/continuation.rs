//! Pseudo-arclength continuation of `F(u, p) = 0`.
//!
//! The stepper is an explicit state machine
//! `Predict -> Correct -> Classify -> Adapt -> Predict ...` that ends in
//! `Terminated(reason)`. Each accepted point appends one record to the
//! branch; detected special points are collected alongside.

pub mod bordered;
pub mod codim1_curves;
pub mod periodic;
pub mod problem;
pub mod types;
pub mod util;

pub use bordered::{solve_bordered, BorderedSolve, BorderedSystem};
pub use codim1_curves::{
    continuation_fold, continuation_hopf, newton_fold, newton_fold_from_branch, newton_hopf,
    newton_hopf_from_branch, FoldBorders, FoldCurveProblem, FoldOutcome, FreezeSecond,
    HopfBorders, HopfCurveProblem, HopfOutcome, TwoParameterProblem,
};
pub use periodic::{orbit_guess_from_hopf, OrbitGuess, OrbitJacobian, PeriodicOrbitTrap};
pub use problem::{
    AtParameter, BifurcationProblem, ContinuationProblem, FnProblem, TestFunctionValues,
};
pub use types::{
    BifurcationPoint, BifurcationType, BorderedStrategy, Branch, BranchRecord, ContinuationPar,
    ContinuationPoint, TerminationReason,
};

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use crate::eigen::{EigenSolver, Spectrum};
use crate::error::{recoverable, SolveFailure};
use crate::newton::{log_header, log_row, newton};
use crate::solvers::LinearSolver;
use crate::traits::{lincomb, VectorSpace};
use util::{
    arclength_constraint, classify_crossing, normalize_tangent, pair_crossing, secant_tangent,
    state_weight, step_size_after_failure, step_size_control, unstable_pair_count,
};

/// User callbacks invoked by the stepper.
pub trait ContinuationHooks<V: VectorSpace> {
    /// Scalar projection stored in every branch record.
    fn record(&mut self, state: &V) -> f64 {
        state.norm()
    }

    /// Called after every accepted step; returning `false` stops the run.
    fn finalize(
        &mut self,
        _point: &ContinuationPoint<V>,
        _step: usize,
        _branch: &Branch<V>,
    ) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl<V: VectorSpace> ContinuationHooks<V> for DefaultHooks {}

/// Records `f(state)` instead of the norm.
pub struct RecordWith<F>(pub F);

impl<V: VectorSpace, F: FnMut(&V) -> f64> ContinuationHooks<V> for RecordWith<F> {
    fn record(&mut self, state: &V) -> f64 {
        (self.0)(state)
    }
}

type Eigen<'e, P> = Option<
    &'e mut dyn EigenSolver<
        <P as ContinuationProblem>::State,
        <P as ContinuationProblem>::Jacobian,
    >,
>;

/// Continue a solution branch of `problem` starting near `(u0, p0)`.
///
/// A failure of either initial Newton solve is not an error: the returned
/// branch is terminated with `CorrectorFailure`. Spectral detection needs
/// `eigsolve`; without it only monotonicity folds are reported.
pub fn continuation<P, L, H>(
    problem: &mut P,
    u0: P::State,
    p0: f64,
    par: &ContinuationPar,
    linsolve: &mut L,
    mut eigsolve: Eigen<'_, P>,
    hooks: &mut H,
) -> Result<Branch<P::State>>
where
    P: ContinuationProblem,
    L: LinearSolver<P::State, P::Jacobian>,
    H: ContinuationHooks<P::State>,
{
    par.validate()?;
    if !(par.p_min..=par.p_max).contains(&p0) {
        bail!(
            "Initial parameter {} lies outside [{}, {}].",
            p0,
            par.p_min,
            par.p_max
        );
    }
    if par.natural && par.detect_fold {
        log::warn!("Fold detection is disabled under natural continuation");
    }
    if par.detect_bifurcation && eigsolve.is_none() {
        log::debug!("No eigen-solver supplied; spectral detection is skipped");
    }

    let mut branch = Branch::default();
    let first = newton(
        &mut AtParameter::new(problem, p0),
        u0,
        &par.newton,
        linsolve,
    )?;
    if !first.converged {
        log::warn!(
            "Initial Newton solve failed at p = {}: {}",
            p0,
            describe(first.failure)
        );
        branch.termination = Some(TerminationReason::CorrectorFailure);
        return Ok(branch);
    }
    let u_first = first.solution;

    let p1 = p0 + par.ds;
    let second = newton(
        &mut AtParameter::new(problem, p1),
        u_first.clone(),
        &par.newton,
        linsolve,
    )?;
    if !second.converged {
        log::warn!(
            "Second Newton solve failed at p = {}: {}",
            p1,
            describe(second.failure)
        );
        branch.termination = Some(TerminationReason::CorrectorFailure);
        return Ok(branch);
    }
    let u_second = second.solution;

    let (mut tu, mut tp) = secant_tangent(par.theta, &u_second, p1, &u_first, p0)?;

    let spectrum = compute_spectrum(problem, eigsolve.as_deref_mut(), par, par.nev, &u_first, p0)?;
    let start = ContinuationPoint {
        state: u_first,
        param: p0,
        tangent_state: tu.clone(),
        tangent_param: tp,
    };
    problem.update_after_step(&start.state, p0)?;
    append_record(
        &mut branch,
        hooks,
        par,
        &start,
        first.iterations,
        par.ds.abs(),
        spectrum.as_ref(),
        BifurcationType::None,
    );

    if !(par.p_min..=par.p_max).contains(&p1) {
        log::info!("Second point p = {} lies outside the parameter range", p1);
        branch.termination = Some(TerminationReason::ParameterOutOfRange);
        branch.last = Some(start);
        return Ok(branch);
    }

    if !par.secant && !par.natural {
        match bordered_tangent(problem, linsolve, par, &u_second, p1, &tu, tp)? {
            Some(tangent) => (tu, tp) = tangent,
            None => log::warn!("Bordered tangent failed at p = {}; using the secant", p1),
        }
    }
    let spectrum = compute_spectrum(problem, eigsolve.as_deref_mut(), par, par.nev, &u_second, p1)?;
    let prev_tests = problem.diagnostics(&u_second, p1)?;
    let current = ContinuationPoint {
        state: u_second,
        param: p1,
        tangent_state: tu,
        tangent_param: tp,
    };
    problem.update_after_step(&current.state, p1)?;
    append_record(
        &mut branch,
        hooks,
        par,
        &current,
        second.iterations,
        par.ds.abs(),
        spectrum.as_ref(),
        BifurcationType::None,
    );

    let mut stepper = Stepper {
        problem,
        linsolve,
        hooks,
        par: *par,
        branch,
        current,
        ds: par.ds.abs(),
        direction: par.ds.signum(),
        step: 0,
        failures: 0,
        nev: par.nev,
        prev_dp: p1 - p0,
        prev_unstable: spectrum.as_ref().map(Spectrum::unstable_count),
        prev_pairs: spectrum.as_ref().map(unstable_pair_count),
        prev_tests,
    };

    let mut state = StepState::Predict;
    loop {
        state = match state {
            StepState::Predict => stepper.predict(),
            StepState::Correct(predicted) => stepper.correct(predicted)?,
            StepState::Classify(corrected) => stepper.classify(corrected, eigsolve.as_deref_mut())?,
            StepState::Adapt(iterations) => stepper.adapt(iterations),
            StepState::Terminated(reason) => return Ok(stepper.finish(reason)),
        };
    }
}

fn describe(failure: Option<SolveFailure>) -> String {
    failure.map(|f| f.to_string()).unwrap_or_default()
}

struct Predicted<V> {
    state: V,
    param: f64,
}

struct Corrected<V> {
    state: V,
    param: f64,
    iterations: usize,
}

enum StepState<V> {
    Predict,
    Correct(Predicted<V>),
    Classify(Corrected<V>),
    /// Newton iterations of the accepted correction, `None` after a failure.
    Adapt(Option<usize>),
    Terminated(TerminationReason),
}

struct Stepper<'a, P: ContinuationProblem, L, H> {
    problem: &'a mut P,
    linsolve: &'a mut L,
    hooks: &'a mut H,
    par: ContinuationPar,
    branch: Branch<P::State>,
    current: ContinuationPoint<P::State>,
    /// Step magnitude; the orientation lives in the tangent.
    ds: f64,
    /// Sign of the parameter increments in natural continuation.
    direction: f64,
    step: usize,
    failures: usize,
    nev: usize,
    prev_dp: f64,
    prev_unstable: Option<usize>,
    prev_pairs: Option<usize>,
    prev_tests: TestFunctionValues,
}

impl<P, L, H> Stepper<'_, P, L, H>
where
    P: ContinuationProblem,
    L: LinearSolver<P::State, P::Jacobian>,
    H: ContinuationHooks<P::State>,
{
    fn predict(&self) -> StepState<P::State> {
        if self.step >= self.par.max_steps {
            return StepState::Terminated(TerminationReason::MaxSteps);
        }
        let point = &self.current;
        let predicted = if self.par.natural {
            Predicted {
                state: point.state.clone(),
                param: point.param + self.direction * self.ds,
            }
        } else {
            Predicted {
                state: lincomb(1.0, &point.state, self.ds, &point.tangent_state),
                param: point.param + self.ds * point.tangent_param,
            }
        };
        StepState::Correct(predicted)
    }

    fn correct(&mut self, predicted: Predicted<P::State>) -> Result<StepState<P::State>> {
        let outcome = if self.par.natural {
            let result = newton(
                &mut AtParameter::new(&mut *self.problem, predicted.param),
                predicted.state,
                &self.par.newton,
                &mut *self.linsolve,
            )?;
            match result.failure {
                None => Ok(Corrected {
                    state: result.solution,
                    param: predicted.param,
                    iterations: result.iterations,
                }),
                Some(failure) => Err(failure),
            }
        } else {
            self.correct_arclength(predicted)?
        };

        Ok(match outcome {
            Ok(corrected) => StepState::Classify(corrected),
            Err(failure) => {
                log::debug!(
                    "Corrector failed from p = {:.6e} with ds = {:.3e}: {}",
                    self.current.param,
                    self.ds,
                    failure
                );
                StepState::Adapt(None)
            }
        })
    }

    /// Newton on `(F(u, p), N(u, p)) = 0`, one bordered solve per iteration.
    fn correct_arclength(
        &mut self,
        predicted: Predicted<P::State>,
    ) -> Result<std::result::Result<Corrected<P::State>, SolveFailure>> {
        let par = &self.par;
        let level = par.newton.log_level();
        let theta = par.theta;
        let from = &self.current;

        let mut row = from.tangent_state.clone();
        row.scale_by(state_weight(theta, &from.tangent_state));
        let corner = DMatrix::from_element(1, 1, (1.0 - theta) * from.tangent_param);

        let Predicted {
            state: mut u,
            param: mut p,
        } = predicted;
        let mut iterations = 0usize;

        log_header(level);
        loop {
            if !self.problem.is_admissible(&u, p) {
                return Ok(Err(SolveFailure::Inadmissible));
            }
            let f = match recoverable(self.problem.residual(&u, p))? {
                Ok(f) => f,
                Err(failure) => return Ok(Err(failure)),
            };
            let n = arclength_constraint(theta, &u, p, from, self.ds);
            let res = f.norm().hypot(n);
            log_row(level, iterations, res, 0);

            if !res.is_finite() {
                return Ok(Err(SolveFailure::NonFiniteResidual));
            }
            if res < par.newton.tol {
                return Ok(Ok(Corrected {
                    state: u,
                    param: p,
                    iterations,
                }));
            }
            if iterations >= par.newton.max_iter {
                return Ok(Err(SolveFailure::NewtonNonConvergence {
                    iterations,
                    residual: res,
                }));
            }

            let jac = match recoverable(self.problem.jacobian(&u, p))? {
                Ok(jac) => jac,
                Err(failure) => return Ok(Err(failure)),
            };
            let dfdp = match recoverable(self.problem.param_derivative(&u, p))? {
                Ok(dfdp) => dfdp,
                Err(failure) => return Ok(Err(failure)),
            };
            let system = bordered::BorderedSystem {
                jac: &jac,
                cols: std::slice::from_ref(&dfdp),
                rows: std::slice::from_ref(&row),
                corner: &corner,
            };
            let step = solve_bordered(
                par.linear_algo,
                &mut *self.linsolve,
                &system,
                &f,
                &DVector::from_element(1, n),
            )?;
            if !step.converged {
                return Ok(Err(step.failure.unwrap_or(SolveFailure::BorderedSystemSingular)));
            }
            u.add_scaled(-1.0, &step.x);
            p -= step.y[0];
            iterations += 1;
        }
    }

    fn classify<E>(
        &mut self,
        corrected: Corrected<P::State>,
        eigsolve: Option<&mut E>,
    ) -> Result<StepState<P::State>>
    where
        E: EigenSolver<P::State, P::Jacobian> + ?Sized,
    {
        let par = self.par;
        let Corrected {
            state,
            param,
            iterations,
        } = corrected;

        let tangent = if par.secant || par.natural {
            secant_tangent(
                par.theta,
                &state,
                param,
                &self.current.state,
                self.current.param,
            )
            .ok()
        } else {
            bordered_tangent(
                &mut *self.problem,
                &mut *self.linsolve,
                &par,
                &state,
                param,
                &self.current.tangent_state,
                self.current.tangent_param,
            )?
        };
        let Some((tangent_state, tangent_param)) = tangent else {
            return Ok(StepState::Adapt(None));
        };

        if !(par.p_min..=par.p_max).contains(&param) {
            log::info!(
                "Parameter p = {:.6e} left [{}, {}]",
                param,
                par.p_min,
                par.p_max
            );
            return Ok(StepState::Terminated(TerminationReason::ParameterOutOfRange));
        }

        let index = self.branch.len();
        let dp = param - self.current.param;
        let fold = par.detect_fold && !par.natural && self.prev_dp * dp < 0.0;

        let spectrum =
            compute_spectrum(&mut *self.problem, eigsolve, &par, self.nev, &state, param)?;
        let crossing = match (&spectrum, self.prev_unstable) {
            (Some(spectrum), Some(prev)) => classify_crossing(prev, spectrum),
            _ => None,
        };
        // A pair may cross in the same step as a real mode or a fold.
        let pair = match (&spectrum, self.prev_pairs, crossing) {
            (_, _, Some((BifurcationType::Hopf, idx))) => Some(idx),
            (Some(spectrum), Some(prev), Some(_)) => pair_crossing(prev, spectrum),
            (Some(spectrum), Some(prev), None) if fold => pair_crossing(prev, spectrum),
            _ => None,
        };
        let tests = self.problem.diagnostics(&state, param)?;
        let codim2 = if tests.is_finite() {
            tests.detect_sign_changes(&self.prev_tests)
        } else {
            Vec::new()
        };

        let mut kind = BifurcationType::None;
        let real = match crossing {
            Some((BifurcationType::BranchPoint, idx)) => Some(idx),
            _ => None,
        };
        if fold {
            kind = BifurcationType::Fold;
            let (eigenvalue, eigenvector) = match (real, &spectrum) {
                (Some(idx), Some(spectrum)) => (
                    spectrum.values.get(idx).copied(),
                    spectrum.vectors.get(idx).cloned(),
                ),
                _ => (None, None),
            };
            log::info!("Fold detected near p = {:.6e}", self.current.param);
            self.branch.bifurcations.push(BifurcationPoint {
                index,
                kind,
                state: self.current.state.clone(),
                param: self.current.param,
                eigenvalue,
                eigenvector,
                omega: None,
            });
        }
        if let Some(spectrum) = &spectrum {
            if let Some(idx) = real.filter(|_| !fold) {
                kind = BifurcationType::BranchPoint;
                self.push_spectral(kind, idx, spectrum, index, &state, param);
            }
            if let Some(idx) = pair {
                if kind == BifurcationType::None {
                    kind = BifurcationType::Hopf;
                }
                self.push_spectral(BifurcationType::Hopf, idx, spectrum, index, &state, param);
            }
        }
        if crossing.is_some() && par.grow_nev {
            self.nev = (self.nev + 1).min(state.dimension());
        }
        for codim2_kind in codim2 {
            log::info!("{:?} detected near p = {:.6e}", codim2_kind, param);
            if kind == BifurcationType::None {
                kind = codim2_kind;
            }
            self.branch.bifurcations.push(BifurcationPoint {
                index,
                kind: codim2_kind,
                state: state.clone(),
                param,
                eigenvalue: None,
                eigenvector: None,
                omega: None,
            });
        }

        let point = ContinuationPoint {
            state,
            param,
            tangent_state,
            tangent_param,
        };
        self.problem.update_after_step(&point.state, param)?;
        append_record(
            &mut self.branch,
            &mut *self.hooks,
            &par,
            &point,
            iterations,
            self.ds,
            spectrum.as_ref(),
            kind,
        );
        log::debug!(
            "Step {:>4}: p = {:.6e}, ds = {:.3e}, newton iterations {}",
            self.step + 1,
            param,
            self.ds,
            iterations
        );

        if let Some(spectrum) = &spectrum {
            self.prev_unstable = Some(spectrum.unstable_count());
            self.prev_pairs = Some(unstable_pair_count(spectrum));
        }
        if tests.is_finite() {
            self.prev_tests = tests;
        }
        self.prev_dp = dp;
        self.current = point;
        Ok(StepState::Adapt(Some(iterations)))
    }

    fn push_spectral(
        &mut self,
        kind: BifurcationType,
        idx: usize,
        spectrum: &Spectrum,
        index: usize,
        state: &P::State,
        param: f64,
    ) {
        let eigenvalue = spectrum.values.get(idx).copied();
        log::info!(
            "{:?} detected near p = {:.6e} (eigenvalue {:?})",
            kind,
            param,
            eigenvalue
        );
        self.branch.bifurcations.push(BifurcationPoint {
            index,
            kind,
            state: state.clone(),
            param,
            eigenvalue,
            eigenvector: spectrum.vectors.get(idx).cloned(),
            omega: eigenvalue
                .filter(|_| kind == BifurcationType::Hopf)
                .map(|ev| ev.im),
        });
    }

    fn adapt(&mut self, iterations: Option<usize>) -> StepState<P::State> {
        match iterations {
            Some(iterations) => {
                self.failures = 0;
                self.step += 1;
                self.ds = step_size_control(&self.par, self.ds, iterations);
                if self.hooks.finalize(&self.current, self.step, &self.branch) {
                    StepState::Predict
                } else {
                    StepState::Terminated(TerminationReason::Cancelled)
                }
            }
            None => {
                self.failures += 1;
                if self.failures > self.par.max_failures {
                    return StepState::Terminated(TerminationReason::CorrectorFailure);
                }
                match step_size_after_failure(&self.par, self.ds) {
                    Some(ds) => {
                        self.ds = ds;
                        StepState::Predict
                    }
                    None => StepState::Terminated(TerminationReason::CorrectorFailure),
                }
            }
        }
    }

    fn finish(self, reason: TerminationReason) -> Branch<P::State> {
        log::info!(
            "Continuation stopped after {} steps at p = {:.6e}: {:?}",
            self.step,
            self.current.param,
            reason
        );
        let mut branch = self.branch;
        branch.termination = Some(reason);
        branch.last = Some(self.current);
        branch
    }
}

/// Tangent from `[[J, dF/dp], [theta/len * tu0^T, (1 - theta) * tp0]] [du; dp] = [0; 1]`,
/// which keeps the orientation of `(tu0, tp0)`.
fn bordered_tangent<P, L>(
    problem: &mut P,
    linsolve: &mut L,
    par: &ContinuationPar,
    u: &P::State,
    p: f64,
    reference_state: &P::State,
    reference_param: f64,
) -> Result<Option<(P::State, f64)>>
where
    P: ContinuationProblem,
    L: LinearSolver<P::State, P::Jacobian>,
{
    let Ok(jac) = recoverable(problem.jacobian(u, p))? else {
        return Ok(None);
    };
    let dfdp = problem.param_derivative(u, p)?;
    let mut row = reference_state.clone();
    row.scale_by(state_weight(par.theta, reference_state));
    let corner = DMatrix::from_element(1, 1, (1.0 - par.theta) * reference_param);
    let system = BorderedSystem {
        jac: &jac,
        cols: std::slice::from_ref(&dfdp),
        rows: std::slice::from_ref(&row),
        corner: &corner,
    };
    let solve = solve_bordered(
        par.linear_algo,
        linsolve,
        &system,
        &u.zeros_like(),
        &DVector::from_element(1, 1.0),
    )?;
    if !solve.converged {
        return Ok(None);
    }
    let mut du = solve.x;
    let mut dp = solve.y[0];
    if normalize_tangent(par.theta, &mut du, &mut dp).is_err() {
        return Ok(None);
    }
    Ok(Some((du, dp)))
}

fn compute_spectrum<P, E>(
    problem: &mut P,
    eigsolve: Option<&mut E>,
    par: &ContinuationPar,
    nev: usize,
    u: &P::State,
    p: f64,
) -> Result<Option<Spectrum>>
where
    P: ContinuationProblem,
    E: EigenSolver<P::State, P::Jacobian> + ?Sized,
{
    if !par.detect_bifurcation {
        return Ok(None);
    }
    let Some(eigsolve) = eigsolve else {
        return Ok(None);
    };
    let jac = problem.jacobian(u, p)?;
    let mut spectrum = eigsolve.eigen(&jac, nev)?;
    spectrum.sort_by_real_part();
    Ok(Some(spectrum))
}

#[allow(clippy::too_many_arguments)]
fn append_record<V: VectorSpace, H: ContinuationHooks<V>>(
    branch: &mut Branch<V>,
    hooks: &mut H,
    par: &ContinuationPar,
    point: &ContinuationPoint<V>,
    newton_iterations: usize,
    ds: f64,
    spectrum: Option<&Spectrum>,
    kind: BifurcationType,
) {
    branch.records.push(BranchRecord {
        step: branch.records.len(),
        param: point.param,
        value: hooks.record(&point.state),
        newton_iterations,
        ds,
        eigenvalues: spectrum.map(|s| s.values.clone()).unwrap_or_default(),
        stable: spectrum.map(|s| s.unstable_count() == 0),
        kind,
    });
    if par.save_solutions {
        branch.solutions.push(point.clone());
    }
}
