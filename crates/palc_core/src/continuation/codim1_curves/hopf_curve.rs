//! Hopf points.
//!
//! Unknowns `(x, p, omega)`. The complex test function `sigma` comes from
//!
//! ```text
//! [[J - i omega, a], [b^H, 0]] [v; sigma] = [0; 1]
//! ```
//!
//! solved in its real `2n` form (`JacobianHandle::complex_shift`), so only
//! real bordered solves are needed. `Re sigma = Im sigma = 0` at a Hopf point.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use super::{
    hessian_contraction, inverse_iteration, join_complex, param_jacobian_action, split_complex,
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

type CVector = DVector<Complex<f64>>;

fn normalized_complex(v: &CVector) -> CVector {
    let norm = v.norm();
    if norm > 0.0 && norm.is_finite() {
        v.map(|c| c / norm)
    } else {
        v.clone()
    }
}

/// `w^H v`
fn hdot(w: &CVector, v: &CVector) -> Complex<f64> {
    w.iter().zip(v.iter()).map(|(a, b)| a.conj() * b).sum()
}

/// Real columns representing multiplication by a complex vector `c`:
/// `c * (s_r + i s_i) = s_r [Re c; Im c] + s_i [-Im c; Re c]`.
fn complex_columns(c: &CVector) -> [DVector<f64>; 2] {
    let (re, im) = split_complex(c);
    [stack(&re, im.as_slice()), stack(&-im, re.as_slice())]
}

/// Real rows of `c^H z`: real part `[Re c; Im c]`, imaginary part
/// `[-Im c; Re c]`.
fn complex_rows(c: &CVector) -> [DVector<f64>; 2] {
    complex_columns(c)
}

fn unstack(z: &DVector<f64>) -> CVector {
    let n = z.len() / 2;
    join_complex(&z.rows(0, n).into_owned(), &z.rows(n, n).into_owned())
}

/// Borders of the Hopf test system.
#[derive(Debug, Clone)]
pub struct HopfBorders {
    /// Column border, tracks the adjoint eigenvector `w`.
    pub a: CVector,
    /// Row border, tracks the eigenvector `v`.
    pub b: CVector,
}

impl HopfBorders {
    fn from_eigenvector(v: &CVector) -> Self {
        let v = normalized_complex(v);
        Self { a: v.clone(), b: v }
    }

    fn update(&mut self, test: &HopfTest) {
        self.a = normalized_complex(&test.w);
        self.b = normalized_complex(&test.v);
    }
}

struct HopfTest {
    sigma: Complex<f64>,
    v: CVector,
    w: CVector,
}

#[allow(clippy::too_many_arguments)]
fn hopf_test<P, L>(
    problem: &mut P,
    linsolve: &mut L,
    strategy: BorderedStrategy,
    x: &DVector<f64>,
    p: f64,
    omega: f64,
    jac: &JacobianHandle,
    borders: &HopfBorders,
) -> Result<std::result::Result<HopfTest, SolveFailure>>
where
    P: BifurcationProblem + ?Sized,
    L: LinearSolver<DVector<f64>, JacobianHandle>,
{
    let corner = DMatrix::zeros(2, 2);
    let zero = DVector::zeros(2 * x.len());
    let rhs_border = DVector::from_vec(vec![1.0, 0.0]);

    let shifted = jac.complex_shift(omega);
    let right = solve_bordered(
        strategy,
        linsolve,
        &BorderedSystem {
            jac: &shifted,
            cols: &complex_columns(&borders.a),
            rows: &complex_rows(&borders.b),
            corner: &corner,
        },
        &zero,
        &rhs_border,
    )?;
    if !right.converged {
        return Ok(Err(right.failure.unwrap_or(SolveFailure::BorderedSystemSingular)));
    }

    // Real form of J^T + i omega.
    let adjoint = problem.jacobian_transpose(x, p)?.complex_shift(-omega);
    let left = solve_bordered(
        strategy,
        linsolve,
        &BorderedSystem {
            jac: &adjoint,
            cols: &complex_columns(&borders.b),
            rows: &complex_rows(&borders.a),
            corner: &corner,
        },
        &zero,
        &rhs_border,
    )?;
    if !left.converged {
        return Ok(Err(left.failure.unwrap_or(SolveFailure::BorderedSystemSingular)));
    }

    Ok(Ok(HopfTest {
        sigma: Complex::new(right.y[0], right.y[1]),
        v: unstack(&right.x),
        w: unstack(&left.x),
    }))
}

struct HopfGradient {
    sigma_re_x: DVector<f64>,
    sigma_im_x: DVector<f64>,
    sigma_p: Complex<f64>,
    sigma_omega: Complex<f64>,
}

impl HopfGradient {
    fn corner(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(
            2,
            2,
            &[
                self.sigma_p.re,
                self.sigma_omega.re,
                self.sigma_p.im,
                self.sigma_omega.im,
            ],
        )
    }
}

fn hopf_gradient<P: BifurcationProblem + ?Sized>(
    problem: &mut P,
    x: &DVector<f64>,
    p: f64,
    test: &HopfTest,
) -> Result<HopfGradient> {
    let (vr, vi) = split_complex(&test.v);
    let (wr, wi) = split_complex(&test.w);

    // -w^H d^2F[v, e_k]
    let rr = hessian_contraction(problem, x, p, &wr, &vr)?;
    let ii = hessian_contraction(problem, x, p, &wi, &vi)?;
    let ri = hessian_contraction(problem, x, p, &wr, &vi)?;
    let ir = hessian_contraction(problem, x, p, &wi, &vr)?;

    let dj_v = join_complex(
        &param_jacobian_action(problem, x, p, &vr)?,
        &param_jacobian_action(problem, x, p, &vi)?,
    );

    Ok(HopfGradient {
        sigma_re_x: -(rr + ii),
        sigma_im_x: ir - ri,
        sigma_p: -hdot(&test.w, &dj_v),
        sigma_omega: Complex::<f64>::i() * hdot(&test.w, &test.v),
    })
}

#[derive(Debug, Clone)]
pub struct HopfOutcome {
    pub state: DVector<f64>,
    pub param: f64,
    pub omega: f64,
    /// Eigenvector for `i omega` at the last iterate.
    pub v: CVector,
    /// Adjoint eigenvector at the last iterate.
    pub w: CVector,
    pub residuals: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub failure: Option<SolveFailure>,
}

/// Newton on the minimally augmented Hopf system from `(x0, p0, omega0)`
/// with an approximate eigenvector for `i omega0`.
#[allow(clippy::too_many_arguments)]
pub fn newton_hopf<P, L>(
    problem: &mut P,
    x0: DVector<f64>,
    p0: f64,
    omega0: f64,
    eigenvector: &CVector,
    par: &NewtonPar,
    strategy: BorderedStrategy,
    linsolve: &mut L,
) -> Result<HopfOutcome>
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
    if !(omega0.is_finite() && omega0 > 0.0) {
        bail!("Hopf frequency must be positive and finite, got {}.", omega0);
    }
    let level = par.log_level();
    let mut borders = HopfBorders::from_eigenvector(eigenvector);
    let (mut x, mut p, mut omega) = (x0, p0, omega0);
    let mut residuals = Vec::new();
    let mut iterations = 0usize;

    log::log!(
        level,
        "Hopf refinement from p = {:.8e}, omega = {:.8e}",
        p0,
        omega0
    );
    log_header(level);

    let (failure, v, w) = loop {
        let f = problem.residual(&x, p)?;
        let jac = problem.jacobian(&x, p)?;
        let test = match hopf_test(problem, linsolve, strategy, &x, p, omega, &jac, &borders)? {
            Ok(test) => test,
            Err(failure) => break (Some(failure), borders.b.clone(), borders.a.clone()),
        };
        let res = f.norm().hypot(test.sigma.norm());
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

        let gradient = hopf_gradient(problem, &x, p, &test)?;
        let dfdp = problem.param_derivative(&x, p)?;
        let step = solve_bordered(
            strategy,
            linsolve,
            &BorderedSystem {
                jac: &jac,
                cols: &[dfdp, DVector::zeros(x.len())],
                rows: &[gradient.sigma_re_x.clone(), gradient.sigma_im_x.clone()],
                corner: &gradient.corner(),
            },
            &f,
            &DVector::from_vec(vec![test.sigma.re, test.sigma.im]),
        )?;
        if !step.converged {
            let failure = step.failure.unwrap_or(SolveFailure::BorderedSystemSingular);
            break (Some(failure), test.v, test.w);
        }
        x -= &step.x;
        p -= step.y[0];
        omega -= step.y[1];
        iterations += 1;
        borders.update(&test);
    };

    match failure {
        None => log::info!(
            "Hopf refined at p = {:.10e}, omega = {:.10e} in {} iterations",
            p,
            omega,
            iterations
        ),
        Some(failure) => log::warn!("Hopf refinement failed: {}", failure),
    }

    Ok(HopfOutcome {
        state: x,
        param: p,
        omega,
        v,
        w,
        residuals,
        converged: failure.is_none(),
        iterations,
        failure,
    })
}

/// Refine `branch.bifurcations[which]` and, on success, append the refined
/// point (with its frequency) to `branch.refined`.
pub fn newton_hopf_from_branch<P, L>(
    problem: &mut P,
    branch: &mut Branch<DVector<f64>>,
    which: usize,
    par: &ContinuationPar,
    linsolve: &mut L,
) -> Result<HopfOutcome>
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
    if point.kind != BifurcationType::Hopf {
        bail!("Detected point {} is a {:?}, not a Hopf point.", which, point.kind);
    }
    let Some(omega) = point
        .omega
        .or(point.eigenvalue.map(|ev| ev.im.abs()))
        .filter(|w| *w > 0.0)
    else {
        bail!("Detected point {} carries no Hopf frequency.", which);
    };
    let (x0, p0, index) = (point.state.clone(), point.param, point.index);

    let stored = point
        .eigenvector
        .clone()
        .filter(|v| v.len() == x0.len() && v.norm() > 0.0);
    let eigenvector = match stored {
        Some(v) => v,
        None => {
            let shifted = problem.jacobian(&x0, p0)?.complex_shift(omega);
            unstack(&inverse_iteration(&shifted, linsolve)?)
        }
    };

    let outcome = newton_hopf(
        problem,
        x0,
        p0,
        omega,
        &eigenvector,
        &par.newton,
        par.linear_algo,
        linsolve,
    )?;
    if outcome.converged {
        branch.refined.push(BifurcationPoint {
            index,
            kind: BifurcationType::Hopf,
            state: outcome.state.clone(),
            param: outcome.param,
            eigenvalue: Some(Complex::new(0.0, outcome.omega)),
            eigenvector: Some(outcome.v.clone()),
            omega: Some(outcome.omega),
        });
    }
    Ok(outcome)
}

/// Hopf curve of a two-parameter problem: state `(x, p1, omega)`, parameter
/// `p2`.
pub struct HopfCurveProblem<'a, Q: ?Sized, L> {
    problem: &'a mut Q,
    linsolve: L,
    strategy: BorderedStrategy,
    borders: HopfBorders,
}

impl<'a, Q, L> HopfCurveProblem<'a, Q, L>
where
    Q: TwoParameterProblem + ?Sized,
    L: LinearSolver<DVector<f64>, JacobianHandle>,
{
    pub fn new(
        problem: &'a mut Q,
        eigenvector: &CVector,
        strategy: BorderedStrategy,
        linsolve: L,
    ) -> Self {
        Self {
            problem,
            linsolve,
            strategy,
            borders: HopfBorders::from_eigenvector(eigenvector),
        }
    }

    pub fn borders(&self) -> &HopfBorders {
        &self.borders
    }

    fn test_at(
        &mut self,
        x: &DVector<f64>,
        p1: f64,
        omega: f64,
        p2: f64,
    ) -> Result<(JacobianHandle, std::result::Result<HopfTest, SolveFailure>)> {
        let mut frozen = FreezeSecond::new(&mut *self.problem, p2);
        let jac = frozen.jacobian(x, p1)?;
        let test = hopf_test(
            &mut frozen,
            &mut self.linsolve,
            self.strategy,
            x,
            p1,
            omega,
            &jac,
            &self.borders,
        )?;
        Ok((jac, test))
    }
}

impl<Q, L> ContinuationProblem for HopfCurveProblem<'_, Q, L>
where
    Q: TwoParameterProblem + ?Sized,
    L: LinearSolver<DVector<f64>, JacobianHandle>,
{
    type State = DVector<f64>;
    type Jacobian = JacobianHandle;

    fn residual(&mut self, z: &DVector<f64>, p2: f64) -> Result<DVector<f64>> {
        let (x, tail) = split_state(z, 2)?;
        let f = self.problem.residual(&x, tail[0], p2)?;
        let sigma = match self.test_at(&x, tail[0], tail[1], p2)?.1 {
            Ok(test) => test.sigma,
            Err(failure) => {
                log::debug!("Hopf test system failed: {}", failure);
                Complex::new(f64::NAN, f64::NAN)
            }
        };
        Ok(stack(&f, &[sigma.re, sigma.im]))
    }

    fn jacobian(&mut self, z: &DVector<f64>, p2: f64) -> Result<JacobianHandle> {
        let (x, tail) = split_state(z, 2)?;
        let p1 = tail[0];
        let (jac, test) = self.test_at(&x, p1, tail[1], p2)?;
        let test = match test {
            Ok(test) => test,
            Err(failure) => {
                log::debug!("Hopf test system failed: {}", failure);
                return Err(failure.into());
            }
        };
        let mut frozen = FreezeSecond::new(&mut *self.problem, p2);
        let gradient = hopf_gradient(&mut frozen, &x, p1, &test)?;
        let dfdp1 = frozen.param_derivative(&x, p1)?;
        jac.with_borders(
            &[dfdp1, DVector::zeros(x.len())],
            &[gradient.sigma_re_x.clone(), gradient.sigma_im_x.clone()],
            &gradient.corner(),
        )
    }

    /// Bogdanov-Takens: the frequency goes through zero.
    fn diagnostics(&mut self, z: &DVector<f64>, _p2: f64) -> Result<TestFunctionValues> {
        let (_, tail) = split_state(z, 2)?;
        Ok(TestFunctionValues {
            cusp: 0.0,
            bogdanov_takens: tail[1],
        })
    }

    fn update_after_step(&mut self, z: &DVector<f64>, p2: f64) -> Result<()> {
        let (x, tail) = split_state(z, 2)?;
        match self.test_at(&x, tail[0], tail[1], p2)?.1 {
            Ok(test) => self.borders.update(&test),
            Err(failure) => log::warn!("Hopf borders not updated: {}", failure),
        }
        Ok(())
    }
}

/// Continue the Hopf curve through `(x0, p1, omega, p2)` in `p2`. Branch
/// states are `(x, p1, omega)`.
#[allow(clippy::too_many_arguments)]
pub fn continuation_hopf<Q, L, H>(
    problem: &mut Q,
    x0: DVector<f64>,
    p1: f64,
    omega: f64,
    p2: f64,
    eigenvector: &CVector,
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
    let mut curve = HopfCurveProblem::new(problem, eigenvector, par.linear_algo, linsolve.clone());
    let z0 = stack(&x0, &[p1, omega]);
    continuation(&mut curve, z0, p2, par, linsolve, None, hooks)
}
