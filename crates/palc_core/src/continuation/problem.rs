use std::marker::PhantomData;

use anyhow::Result;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use super::types::BifurcationType;
use crate::jacobian::JacobianHandle;
use crate::newton::NonlinearProblem;
use crate::traits::{lincomb, LinearOperator, VectorSpace};

/// Relative step of the central difference used for `dF/dp`.
const PARAM_FD_STEP: f64 = 1e-6;

/// Scalar test functions monitored for sign changes between accepted points.
/// Problems without test functions report zeros, which never change sign.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TestFunctionValues {
    pub cusp: f64,
    pub bogdanov_takens: f64,
}

impl TestFunctionValues {
    pub fn is_finite(&self) -> bool {
        self.cusp.is_finite() && self.bogdanov_takens.is_finite()
    }

    pub fn detect_sign_changes(&self, prev: &Self) -> Vec<BifurcationType> {
        [
            (self.cusp, prev.cusp, BifurcationType::Cusp),
            (
                self.bogdanov_takens,
                prev.bogdanov_takens,
                BifurcationType::BogdanovTakens,
            ),
        ]
        .into_iter()
        .filter(|(current, previous, _)| {
            current.is_finite() && previous.is_finite() && current * previous < 0.0
        })
        .map(|(_, _, kind)| kind)
        .collect()
    }
}

/// Core interface implemented by any system `F(u, p) = 0` that can be
/// continued in the scalar parameter `p`.
pub trait ContinuationProblem {
    type State: VectorSpace;
    type Jacobian: LinearOperator<Self::State>;

    fn residual(&mut self, u: &Self::State, p: f64) -> Result<Self::State>;

    /// Jacobian with respect to the state.
    fn jacobian(&mut self, u: &Self::State, p: f64) -> Result<Self::Jacobian>;

    /// Derivative with respect to the parameter. Defaults to a central
    /// finite difference of the residual.
    fn param_derivative(&mut self, u: &Self::State, p: f64) -> Result<Self::State> {
        let h = PARAM_FD_STEP * (1.0 + p.abs());
        let plus = self.residual(u, p + h)?;
        let minus = self.residual(u, p - h)?;
        Ok(lincomb(0.5 / h, &plus, -0.5 / h, &minus))
    }

    fn diagnostics(&mut self, _u: &Self::State, _p: f64) -> Result<TestFunctionValues> {
        Ok(TestFunctionValues::default())
    }

    /// Called after every accepted step (border updates, phase references).
    fn update_after_step(&mut self, _u: &Self::State, _p: f64) -> Result<()> {
        Ok(())
    }

    fn is_admissible(&self, _u: &Self::State, _p: f64) -> bool {
        true
    }
}

/// Problems on dense vectors that also expose what the Fold/Hopf refiners
/// and periodic orbits need: the transposed Jacobian and, optionally, second
/// derivatives.
pub trait BifurcationProblem:
    ContinuationProblem<State = DVector<f64>, Jacobian = JacobianHandle>
{
    fn jacobian_transpose(&mut self, x: &DVector<f64>, p: f64) -> Result<JacobianHandle> {
        self.jacobian(x, p)?.transpose()
    }

    /// `d^2F(x, p)[v1, v2]`, or `None` to fall back to finite differences.
    fn hessian(
        &mut self,
        _x: &DVector<f64>,
        _p: f64,
        _v1: &DVector<f64>,
        _v2: &DVector<f64>,
    ) -> Result<Option<DVector<f64>>> {
        Ok(None)
    }
}

/// `F(., p)` at a frozen parameter, as a plain `NonlinearProblem`.
pub struct AtParameter<'a, P: ?Sized> {
    problem: &'a mut P,
    param: f64,
}

impl<'a, P: ContinuationProblem + ?Sized> AtParameter<'a, P> {
    pub fn new(problem: &'a mut P, param: f64) -> Self {
        Self { problem, param }
    }
}

impl<P: ContinuationProblem + ?Sized> NonlinearProblem for AtParameter<'_, P> {
    type State = P::State;
    type Jacobian = P::Jacobian;

    fn residual(&mut self, x: &P::State) -> Result<P::State> {
        self.problem.residual(x, self.param)
    }

    fn jacobian(&mut self, x: &P::State) -> Result<P::Jacobian> {
        self.problem.jacobian(x, self.param)
    }

    fn is_admissible(&self, x: &P::State) -> bool {
        self.problem.is_admissible(x, self.param)
    }
}

/// Closure-backed `ContinuationProblem`.
pub struct FnProblem<V, J, F, G> {
    residual: F,
    jacobian: G,
    _marker: PhantomData<fn(&V) -> J>,
}

impl<V, J, F, G> FnProblem<V, J, F, G>
where
    V: VectorSpace,
    J: LinearOperator<V>,
    F: FnMut(&V, f64) -> Result<V>,
    G: FnMut(&V, f64) -> Result<J>,
{
    pub fn new(residual: F, jacobian: G) -> Self {
        Self {
            residual,
            jacobian,
            _marker: PhantomData,
        }
    }
}

impl<V, J, F, G> ContinuationProblem for FnProblem<V, J, F, G>
where
    V: VectorSpace,
    J: LinearOperator<V>,
    F: FnMut(&V, f64) -> Result<V>,
    G: FnMut(&V, f64) -> Result<J>,
{
    type State = V;
    type Jacobian = J;

    fn residual(&mut self, u: &V, p: f64) -> Result<V> {
        (self.residual)(u, p)
    }

    fn jacobian(&mut self, u: &V, p: f64) -> Result<J> {
        (self.jacobian)(u, p)
    }
}

impl<F, G> BifurcationProblem for FnProblem<DVector<f64>, JacobianHandle, F, G>
where
    F: FnMut(&DVector<f64>, f64) -> Result<DVector<f64>>,
    G: FnMut(&DVector<f64>, f64) -> Result<JacobianHandle>,
{
}
