//! Fold (saddle-node) points.
//!
//! The defining system in the unknowns `(x, p)` is
//!
//! ```text
//! F(x, p) = 0
//! sigma(x, p) = 0,    [[J, a], [b^T, 0]] [v; sigma] = [0; 1]
//! ```
//!
//! with `a`, `b` approximate left/right null vectors, refreshed after every
//! Newton iteration (refinement) or accepted step (curve continuation).

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use super::{
    hessian_contraction, inverse_iteration, normalized, param_jacobian_action, second_derivative,
    split_state, stack, FreezeSecond, TwoParameterProblem,
};
use crate::continuation::bordered::{solve_bordered, BorderedSystem};
use crate::continuation::problem::{BifurcationProblem, ContinuationProblem, TestFunctionValues};
use crate::continuation::types::{
    BifurcationPoint, BifurcationType, BorderedStrategy, Branch, ContinuationPar,
};
use crate::continuation::{continuation, ContinuationHooks};
use crate::error::SolveFailure;
use crate::jacobian::JacobianHandle;
use crate::newton::{log_header, log_row, NewtonPar};
use crate::solvers::LinearSolver;

/// Borders of the fold test system.
#[derive(Debug, Clone)]
pub struct Borders {
    /// Column border, tracks the left null vector `w`.
    pub a: DVector<f64>,
    /// Row border, tracks the right null vector `v`.
    pub b: DVector<f64>,
}

impl Borders {
    fn from_null_vector(v: &DVector<f64>) -> Self {
        let v = normalized(v.clone());
        Self { a: v.clone(), b: v }
    }

    fn update(&mut self, test: &FoldTest) {
        self.a = normalized(test.w.clone());
        self.b = normalized(test.v.clone());
    }
}

struct FoldTest {
    sigma: f64,
    v: DVector<f64>,
    w: DVector<f64>,
}

fn fold_test<P, L>(
    problem: &mut P,
    linsolve: &mut L,
    strategy: BorderedStrategy,
    x: &DVector<f64>,
    p: f64,
    jac: &JacobianHandle,
    borders: &Borders,
) -> Result<std::result::Result<FoldTest, SolveFailure>>
where
    P: BifurcationProblem + ?Sized,
    L: LinearSolver<DVector<f64>, JacobianHandle>,
{
    let corner = DMatrix::zeros(1, 1);
    let zero = DVector::zeros(x.len());
    let one = DVector::from_element(1, 1.0);

    let right = solve_bordered(
        strategy,
        linsolve,
        &BorderedSystem {
            jac,
            cols: std::slice::from_ref(&borders.a),
            rows: std::slice::from_ref(&borders.b),
            corner: &corner,
        },
        &zero,
        &one,
    )?;
    if !right.converged {
        return Ok(Err(right.failure.unwrap_or(SolveFailure::BorderedSystemSingular)));
    }

    let jac_t = problem.jacobian_transpose(x, p)?;
    let left = solve_bordered(
        strategy,
        linsolve,
        &BorderedSystem {
            jac: &jac_t,
            cols: std::slice::from_ref(&borders.b),
            rows: std::slice::from_ref(&borders.a),
            corner: &corner,
        },
        &zero,
        &one,
    )?;
    if !left.converged {
        return Ok(Err(left.failure.unwrap_or(SolveFailure::BorderedSystemSingular)));
    }

    Ok(Ok(FoldTest {
        sigma: right.y[0],
        v: right.x,
        w: left.x,
    }))
}

/// `(d sigma / dx, d sigma / dp)`.
fn fold_gradient<P: BifurcationProblem + ?Sized>(
    problem: &mut P,
    x: &DVector<f64>,
    p: f64,
    test: &FoldTest,
) -> Result<(DVector<f64>, f64)> {
    let sigma_x = -hessian_contraction(problem, x, p, &test.w, &test.v)?;
    let sigma_p = -test.w.dot(&param_jacobian_action(problem, x, p, &test.v)?);
    Ok((sigma_x, sigma_p))
}

#[derive(Debug, Clone)]
pub struct FoldOutcome {
    pub state: DVector<f64>,
    pub param: f64,
    /// Right null vector at the last iterate.
    pub v: DVector<f64>,
    /// Left null vector at the last iterate.
    pub w: DVector<f64>,
    pub residuals: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub failure: Option<SolveFailure>,
}

/// Newton on the minimally augmented fold system from `(x0, p0)` with an
/// approximate null vector of `J(x0, p0)`.
pub fn newton_fold<P, L>(
    problem: &mut P,
    x0: DVector<f64>,
    p0: f64,
    eigenvector: &DVector<f64>,
    par: &NewtonPar,
    strategy: BorderedStrategy,
    linsolve: &mut L,
) -> Result<FoldOutcome>
where
    P: BifurcationProblem + ?Sized,
    L: LinearSolver<DVector<f64>, JacobianHandle>,
{
    par.validate()?;
    if eigenvector.len() != x0.len() {
        bail!(
            "Eigenvector length {} does not match the state dimension {}.",
            eigenvector.len(),
            x0.len()
        );
    }
    let level = par.log_level();
    let mut borders = Borders::from_null_vector(eigenvector);
    let (mut x, mut p) = (x0, p0);
    let mut residuals = Vec::new();
    let mut iterations = 0usize;

    log::log!(level, "Fold refinement from p = {:.8e}", p0);
    log_header(level);

    let (failure, v, w) = loop {
        let f = problem.residual(&x, p)?;
        let jac = problem.jacobian(&x, p)?;
        let test = match fold_test(problem, linsolve, strategy, &x, p, &jac, &borders)? {
            Ok(test) => test,
            Err(failure) => break (Some(failure), borders.b.clone(), borders.a.clone()),
        };
        let res = f.norm().hypot(test.sigma);
        residuals.push(res);
        log_row(level, iterations, res, 0);

        if !res.is_finite() {
            break (Some(SolveFailure::NonFiniteResidual), test.v, test.w);
        }
        if res < par.tol {
            break (None, test.v, test.w);
        }
        if iterations >= par.max_iter {
            break (
                Some(SolveFailure::NewtonNonConvergence {
                    iterations,
                    residual: res,
                }),
                test.v,
                test.w,
            );
        }

        let (sigma_x, sigma_p) = fold_gradient(problem, &x, p, &test)?;
        let dfdp = problem.param_derivative(&x, p)?;
        let corner = DMatrix::from_element(1, 1, sigma_p);
        let step = solve_bordered(
            strategy,
            linsolve,
            &BorderedSystem {
                jac: &jac,
                cols: std::slice::from_ref(&dfdp),
                rows: std::slice::from_ref(&sigma_x),
                corner: &corner,
            },
            &f,
            &DVector::from_element(1, test.sigma),
        )?;
        if !step.converged {
            let failure = step.failure.unwrap_or(SolveFailure::BorderedSystemSingular);
            break (Some(failure), test.v, test.w);
        }
        x -= &step.x;
        p -= step.y[0];
        iterations += 1;
        borders.update(&test);
    };

    match failure {
        None => log::info!("Fold refined at p = {:.10e} in {} iterations", p, iterations),
        Some(failure) => log::warn!("Fold refinement failed: {}", failure),
    }

    Ok(FoldOutcome {
        state: x,
        param: p,
        v,
        w,
        residuals,
        converged: failure.is_none(),
        iterations,
        failure,
    })
}

/// Refine `branch.bifurcations[which]` and, on success, append the refined
/// point to `branch.refined`.
pub fn newton_fold_from_branch<P, L>(
    problem: &mut P,
    branch: &mut Branch<DVector<f64>>,
    which: usize,
    par: &ContinuationPar,
    linsolve: &mut L,
) -> Result<FoldOutcome>
where
    P: BifurcationProblem + ?Sized,
    L: LinearSolver<DVector<f64>, JacobianHandle>,
{
    let Some(point) = branch.bifurcations.get(which) else {
        bail!(
            "No detected point {} (the branch has {}).",
            which,
            branch.bifurcations.len()
        );
    };
    if point.kind != BifurcationType::Fold {
        bail!("Detected point {} is a {:?}, not a fold.", which, point.kind);
    }
    let (x0, p0, index) = (point.state.clone(), point.param, point.index);

    let real_part = point
        .eigenvector
        .as_ref()
        .map(|v| v.map(|c| c.re))
        .filter(|v| v.len() == x0.len() && v.norm() > 0.0);
    let eigenvector = match real_part {
        Some(v) => v,
        None => {
            let jac = problem.jacobian(&x0, p0)?;
            inverse_iteration(&jac, linsolve)?
        }
    };

    let outcome = newton_fold(
        problem,
        x0,
        p0,
        &eigenvector,
        &par.newton,
        par.linear_algo,
        linsolve,
    )?;
    if outcome.converged {
        branch.refined.push(BifurcationPoint {
            index,
            kind: BifurcationType::Fold,
            state: outcome.state.clone(),
            param: outcome.param,
            eigenvalue: Some(Complex::new(0.0, 0.0)),
            eigenvector: Some(outcome.v.map(|r| Complex::new(r, 0.0))),
            omega: None,
        });
    }
    Ok(outcome)
}

/// Fold curve of a two-parameter problem: state `(x, p1)`, parameter `p2`.
pub struct FoldCurveProblem<'a, Q: ?Sized, L> {
    problem: &'a mut Q,
    linsolve: L,
    strategy: BorderedStrategy,
    borders: Borders,
}

impl<'a, Q, L> FoldCurveProblem<'a, Q, L>
where
    Q: TwoParameterProblem + ?Sized,
    L: LinearSolver<DVector<f64>, JacobianHandle>,
{
    pub fn new(
        problem: &'a mut Q,
        eigenvector: &DVector<f64>,
        strategy: BorderedStrategy,
        linsolve: L,
    ) -> Self {
        Self {
            problem,
            linsolve,
            strategy,
            borders: Borders::from_null_vector(eigenvector),
        }
    }

    pub fn borders(&self) -> &Borders {
        &self.borders
    }

    fn test_at(
        &mut self,
        x: &DVector<f64>,
        p1: f64,
        p2: f64,
    ) -> Result<(JacobianHandle, std::result::Result<FoldTest, SolveFailure>)> {
        let mut frozen = FreezeSecond::new(&mut *self.problem, p2);
        let jac = frozen.jacobian(x, p1)?;
        let test = fold_test(
            &mut frozen,
            &mut self.linsolve,
            self.strategy,
            x,
            p1,
            &jac,
            &self.borders,
        )?;
        Ok((jac, test))
    }
}

impl<Q, L> ContinuationProblem for FoldCurveProblem<'_, Q, L>
where
    Q: TwoParameterProblem + ?Sized,
    L: LinearSolver<DVector<f64>, JacobianHandle>,
{
    type State = DVector<f64>;
    type Jacobian = JacobianHandle;

    fn residual(&mut self, z: &DVector<f64>, p2: f64) -> Result<DVector<f64>> {
        let (x, tail) = split_state(z, 1)?;
        let f = self.problem.residual(&x, tail[0], p2)?;
        let sigma = match self.test_at(&x, tail[0], p2)?.1 {
            Ok(test) => test.sigma,
            Err(failure) => {
                log::debug!("Fold test system failed: {}", failure);
                f64::NAN
            }
        };
        Ok(stack(&f, &[sigma]))
    }

    fn jacobian(&mut self, z: &DVector<f64>, p2: f64) -> Result<JacobianHandle> {
        let (x, tail) = split_state(z, 1)?;
        let p1 = tail[0];
        let (jac, test) = self.test_at(&x, p1, p2)?;
        let test = match test {
            Ok(test) => test,
            Err(failure) => {
                log::debug!("Fold test system failed: {}", failure);
                return Err(failure.into());
            }
        };
        let mut frozen = FreezeSecond::new(&mut *self.problem, p2);
        let (sigma_x, sigma_p1) = fold_gradient(&mut frozen, &x, p1, &test)?;
        let dfdp1 = frozen.param_derivative(&x, p1)?;
        jac.with_borders(&[dfdp1], &[sigma_x], &DMatrix::from_element(1, 1, sigma_p1))
    }

    /// Cusp: `<w, d^2F[v, v]>`. Bogdanov-Takens: `<w, v>`.
    fn diagnostics(&mut self, z: &DVector<f64>, p2: f64) -> Result<TestFunctionValues> {
        let (x, tail) = split_state(z, 1)?;
        let Ok(test) = self.test_at(&x, tail[0], p2)?.1 else {
            return Ok(TestFunctionValues {
                cusp: f64::NAN,
                bogdanov_takens: f64::NAN,
            });
        };
        let mut frozen = FreezeSecond::new(&mut *self.problem, p2);
        let d2 = second_derivative(&mut frozen, &x, tail[0], &test.v, &test.v)?;
        Ok(TestFunctionValues {
            cusp: test.w.dot(&d2),
            bogdanov_takens: test.w.dot(&test.v),
        })
    }

    fn update_after_step(&mut self, z: &DVector<f64>, p2: f64) -> Result<()> {
        let (x, tail) = split_state(z, 1)?;
        match self.test_at(&x, tail[0], p2)?.1 {
            Ok(test) => self.borders.update(&test),
            Err(failure) => log::warn!("Fold borders not updated: {}", failure),
        }
        Ok(())
    }
}

/// Continue the fold curve through `(x0, p1, p2)` in `p2`. Branch states
/// are `(x, p1)`.
#[allow(clippy::too_many_arguments)]
pub fn continuation_fold<Q, L, H>(
    problem: &mut Q,
    x0: DVector<f64>,
    p1: f64,
    p2: f64,
    eigenvector: &DVector<f64>,
    par: &ContinuationPar,
    linsolve: &mut L,
    hooks: &mut H,
) -> Result<Branch<DVector<f64>>>
where
    Q: TwoParameterProblem + ?Sized,
    L: LinearSolver<DVector<f64>, JacobianHandle> + Clone,
    H: ContinuationHooks<DVector<f64>>,
{
    if eigenvector.len() != x0.len() {
        bail!(
            "Eigenvector length {} does not match the state dimension {}.",
            eigenvector.len(),
            x0.len()
        );
    }
    let mut curve = FoldCurveProblem::new(problem, eigenvector, par.linear_algo, linsolve.clone());
    let z0 = stack(&x0, &[p1]);
    continuation(&mut curve, z0, p2, par, linsolve, None, hooks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::DefaultHooks;
    use crate::solvers::DenseLu;
    use crate::test_problems::{chan_guess, Chan, CuspForm, SquareFold};

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn square_fold_branch() -> Branch<DVector<f64>> {
        let par = ContinuationPar {
            ds: -0.05,
            p_min: -1.0,
            p_max: 2.0,
            max_steps: 80,
            linear_algo: BorderedStrategy::Direct,
            ..ContinuationPar::default()
        };
        continuation(
            &mut SquareFold,
            DVector::from_element(1, 1.0),
            1.0,
            &par,
            &mut DenseLu,
            None,
            &mut DefaultHooks,
        )
        .expect("continuation")
    }

    #[test]
    fn refines_the_fold_of_a_parabola() {
        let mut branch = square_fold_branch();
        assert_eq!(branch.bifurcations[0].kind, BifurcationType::Fold);
        let par = ContinuationPar {
            linear_algo: BorderedStrategy::Direct,
            ..ContinuationPar::default()
        };
        let outcome = newton_fold_from_branch(&mut SquareFold, &mut branch, 0, &par, &mut DenseLu)
            .expect("refinement");
        assert!(outcome.converged, "failure: {:?}", outcome.failure);
        assert!(outcome.param.abs() < 1e-8);
        assert!(outcome.state[0].abs() < 1e-6);
        assert_eq!(branch.refined.len(), 1);
        assert_eq!(branch.refined[0].index, branch.bifurcations[0].index);
        assert_eq!(branch.bifurcations.len(), 1);
    }

    #[test]
    fn refines_the_lower_fold_of_the_chan_problem() {
        let mut chan = Chan::new(101, 0.01);
        let par = ContinuationPar {
            ds: 0.01,
            ds_min: 1e-3,
            ds_max: 0.15,
            p_min: 0.0,
            p_max: 4.1,
            max_steps: 150,
            linear_algo: BorderedStrategy::Direct,
            newton: NewtonPar {
                tol: 1e-8,
                ..NewtonPar::default()
            },
            ..ContinuationPar::default()
        };
        let mut branch = continuation(
            &mut chan,
            chan_guess(101),
            3.0,
            &par,
            &mut DenseLu,
            None,
            &mut DefaultHooks,
        )
        .expect("continuation");
        let lower = branch
            .bifurcations
            .iter()
            .position(|b| b.kind == BifurcationType::Fold && (b.param - 3.15).abs() < 0.05)
            .expect("lower fold detected");

        let refine = ContinuationPar {
            newton: NewtonPar {
                tol: 1e-8,
                max_iter: 30,
                ..NewtonPar::default()
            },
            ..par
        };
        let outcome = newton_fold_from_branch(&mut chan, &mut branch, lower, &refine, &mut DenseLu)
            .expect("refinement");
        assert!(outcome.converged, "failure: {:?}", outcome.failure);
        assert!((outcome.param - 3.1556507316).abs() < 1e-5, "p = {}", outcome.param);
    }

    #[test]
    fn cusp_is_reported_on_the_fold_curve() {
        let par = ContinuationPar {
            ds: -0.05,
            ds_max: 0.05,
            p_min: -1.0,
            p_max: 1.0,
            max_steps: 200,
            detect_fold: false,
            save_solutions: true,
            linear_algo: BorderedStrategy::Direct,
            ..ContinuationPar::default()
        };
        let branch = continuation_fold(
            &mut CuspForm,
            DVector::from_element(1, 0.5),
            -0.25,
            0.75,
            &DVector::from_element(1, 1.0),
            &par,
            &mut DenseLu,
            &mut DefaultHooks,
        )
        .expect("fold curve");

        let cusps: Vec<_> = branch.bifurcations_of(BifurcationType::Cusp).collect();
        assert_eq!(cusps.len(), 1);
        assert!(cusps[0].param.abs() < 0.1, "cusp at p2 = {}", cusps[0].param);
        assert_eq!(
            branch.bifurcations_of(BifurcationType::BogdanovTakens).count(),
            0
        );
        for point in &branch.solutions {
            let (x, p1, p2) = (point.state[0], point.state[1], point.param);
            assert!((p2 - 3.0 * x * x).abs() < 1e-8);
            assert!((p1 + 2.0 * x * x * x).abs() < 1e-8);
        }
        assert_eq!(
            branch.termination,
            Some(crate::continuation::TerminationReason::ParameterOutOfRange)
        );
    }

    #[test]
    fn rejects_mismatched_eigenvector_and_wrong_kind() {
        assert_err_contains(
            newton_fold(
                &mut SquareFold,
                DVector::from_element(1, 0.1),
                0.0,
                &DVector::zeros(2),
                &NewtonPar::default(),
                BorderedStrategy::Direct,
                &mut DenseLu,
            ),
            "does not match",
        );

        let mut branch = square_fold_branch();
        branch.bifurcations[0].kind = BifurcationType::Hopf;
        assert_err_contains(
            newton_fold_from_branch(
                &mut SquareFold,
                &mut branch,
                0,
                &ContinuationPar::default(),
                &mut DenseLu,
            ),
            "not a fold",
        );
        assert_err_contains(
            newton_fold_from_branch(
                &mut SquareFold,
                &mut branch,
                7,
                &ContinuationPar::default(),
                &mut DenseLu,
            ),
            "No detected point",
        );
    }
}
