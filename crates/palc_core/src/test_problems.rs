//! Small systems shared by the unit tests.

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::continuation::{BifurcationProblem, ContinuationProblem, TwoParameterProblem};
use crate::jacobian::{JacobianHandle, MatrixFree};

/// Chan's reaction-diffusion problem on `[0, 1]` with Dirichlet data `beta`:
/// `u'' + alpha N(u) = 0`, `N(u) = 1 + (u + u^2/2) / (1 + beta u^2)`.
/// The continuation parameter is `alpha`.
pub struct Chan {
    n: usize,
    beta: f64,
    matrix_free: bool,
}

impl Chan {
    pub fn new(n: usize, beta: f64) -> Self {
        Self {
            n,
            beta,
            matrix_free: false,
        }
    }

    pub fn matrix_free(self) -> Self {
        Self {
            matrix_free: true,
            ..self
        }
    }

    fn source(&self, u: f64) -> f64 {
        1.0 + (u + 0.5 * u * u) / (1.0 + self.beta * u * u)
    }

    fn dsource(&self, u: f64) -> f64 {
        let d = 1.0 + self.beta * u * u;
        (1.0 + u - self.beta * u * u) / (d * d)
    }

    fn scale(&self) -> f64 {
        let s = (self.n - 1) as f64;
        s * s
    }
}

pub fn chan_guess(n: usize) -> DVector<f64> {
    let nf = n as f64;
    DVector::from_fn(n, |k, _| k as f64 * (nf - 1.0 - k as f64) / (nf * nf) + 0.1)
}

impl ContinuationProblem for Chan {
    type State = DVector<f64>;
    type Jacobian = JacobianHandle;

    fn residual(&mut self, x: &DVector<f64>, alpha: f64) -> Result<DVector<f64>> {
        let n = self.n;
        let s = self.scale();
        let mut f = DVector::zeros(n);
        f[0] = x[0] - self.beta;
        f[n - 1] = x[n - 1] - self.beta;
        for i in 1..n - 1 {
            f[i] = (x[i - 1] - 2.0 * x[i] + x[i + 1]) * s + alpha * self.source(x[i]);
        }
        Ok(f)
    }

    fn jacobian(&mut self, x: &DVector<f64>, alpha: f64) -> Result<JacobianHandle> {
        let n = self.n;
        let s = self.scale();
        let diag: Vec<f64> = (0..n)
            .map(|i| {
                if i == 0 || i == n - 1 {
                    1.0
                } else {
                    -2.0 * s + alpha * self.dsource(x[i])
                }
            })
            .collect();

        if self.matrix_free {
            let forward = diag.clone();
            let op = MatrixFree::new(n, move |v: &DVector<f64>| {
                let mut out = DVector::zeros(n);
                out[0] = v[0];
                out[n - 1] = v[n - 1];
                for i in 1..n - 1 {
                    out[i] = s * (v[i - 1] + v[i + 1]) + forward[i] * v[i];
                }
                out
            })
            .with_adjoint(move |y: &DVector<f64>| {
                let mut out = DVector::zeros(n);
                out[0] += y[0];
                out[n - 1] += y[n - 1];
                for i in 1..n - 1 {
                    out[i - 1] += s * y[i];
                    out[i] += diag[i] * y[i];
                    out[i + 1] += s * y[i];
                }
                out
            });
            return Ok(JacobianHandle::Operator(op));
        }

        let mut coo = CooMatrix::new(n, n);
        coo.push(0, 0, 1.0);
        coo.push(n - 1, n - 1, 1.0);
        for i in 1..n - 1 {
            coo.push(i, i - 1, s);
            coo.push(i, i, diag[i]);
            coo.push(i, i + 1, s);
        }
        Ok(JacobianHandle::Sparse(CsrMatrix::from(&coo)))
    }

    fn param_derivative(&mut self, x: &DVector<f64>, _alpha: f64) -> Result<DVector<f64>> {
        let n = self.n;
        Ok(DVector::from_fn(n, |i, _| {
            if i == 0 || i == n - 1 {
                0.0
            } else {
                self.source(x[i])
            }
        }))
    }
}

impl BifurcationProblem for Chan {}

/// `x^2 - p` componentwise; one fold at `p = 0`.
pub struct SquareFold;

impl ContinuationProblem for SquareFold {
    type State = DVector<f64>;
    type Jacobian = JacobianHandle;

    fn residual(&mut self, x: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        Ok(x.map(|v| v * v - p))
    }

    fn jacobian(&mut self, x: &DVector<f64>, _p: f64) -> Result<JacobianHandle> {
        Ok(JacobianHandle::Dense(DMatrix::from_diagonal(&(x * 2.0))))
    }

    fn param_derivative(&mut self, x: &DVector<f64>, _p: f64) -> Result<DVector<f64>> {
        Ok(DVector::from_element(x.len(), -1.0))
    }
}

impl BifurcationProblem for SquareFold {
    fn hessian(
        &mut self,
        _x: &DVector<f64>,
        _p: f64,
        v1: &DVector<f64>,
        v2: &DVector<f64>,
    ) -> Result<Option<DVector<f64>>> {
        Ok(Some(v1.component_mul(v2) * 2.0))
    }
}

/// Supercritical Hopf normal form in the plane:
/// `x' = p x - w y - x r^2`, `y' = w x + p y - y r^2`.
pub struct HopfNormalForm {
    omega: f64,
}

impl HopfNormalForm {
    pub fn new(omega: f64) -> Self {
        Self { omega }
    }
}

impl ContinuationProblem for HopfNormalForm {
    type State = DVector<f64>;
    type Jacobian = JacobianHandle;

    fn residual(&mut self, u: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        let (x, y) = (u[0], u[1]);
        let r2 = x * x + y * y;
        Ok(DVector::from_vec(vec![
            p * x - self.omega * y - x * r2,
            self.omega * x + p * y - y * r2,
        ]))
    }

    fn jacobian(&mut self, u: &DVector<f64>, p: f64) -> Result<JacobianHandle> {
        let (x, y) = (u[0], u[1]);
        let r2 = x * x + y * y;
        Ok(JacobianHandle::Dense(DMatrix::from_row_slice(
            2,
            2,
            &[
                p - r2 - 2.0 * x * x,
                -self.omega - 2.0 * x * y,
                self.omega - 2.0 * x * y,
                p - r2 - 2.0 * y * y,
            ],
        )))
    }

    fn param_derivative(&mut self, u: &DVector<f64>, _p: f64) -> Result<DVector<f64>> {
        Ok(u.clone())
    }
}

impl BifurcationProblem for HopfNormalForm {
    fn hessian(
        &mut self,
        u: &DVector<f64>,
        _p: f64,
        v1: &DVector<f64>,
        v2: &DVector<f64>,
    ) -> Result<Option<DVector<f64>>> {
        let (x, y) = (u[0], u[1]);
        let (a1, b1, a2, b2) = (v1[0], v1[1], v2[0], v2[1]);
        let mixed = a1 * b2 + b1 * a2;
        Ok(Some(DVector::from_vec(vec![
            -6.0 * x * a1 * a2 - 2.0 * y * mixed - 2.0 * x * b1 * b2,
            -2.0 * y * a1 * a2 - 2.0 * x * mixed - 6.0 * y * b1 * b2,
        ])))
    }
}

/// `x' = -x`: a stable node, no periodic orbits.
pub struct LinearDecay {
    n: usize,
}

impl LinearDecay {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl ContinuationProblem for LinearDecay {
    type State = DVector<f64>;
    type Jacobian = JacobianHandle;

    fn residual(&mut self, x: &DVector<f64>, _p: f64) -> Result<DVector<f64>> {
        Ok(-x)
    }

    fn jacobian(&mut self, _x: &DVector<f64>, _p: f64) -> Result<JacobianHandle> {
        Ok(JacobianHandle::Dense(-DMatrix::identity(self.n, self.n)))
    }
}

impl BifurcationProblem for LinearDecay {}

/// Cusp normal form `x^3 - p2 x - p1`. Folds lie on `p2 = 3x^2`,
/// `p1 = -2x^3`, with the cusp at the origin.
pub struct CuspForm;

impl TwoParameterProblem for CuspForm {
    fn residual(&mut self, x: &DVector<f64>, p1: f64, p2: f64) -> Result<DVector<f64>> {
        Ok(x.map(|v| v * v * v - p2 * v - p1))
    }

    fn jacobian(&mut self, x: &DVector<f64>, _p1: f64, p2: f64) -> Result<JacobianHandle> {
        Ok(JacobianHandle::Dense(DMatrix::from_diagonal(
            &x.map(|v| 3.0 * v * v - p2),
        )))
    }

    fn hessian(
        &mut self,
        x: &DVector<f64>,
        _p1: f64,
        _p2: f64,
        v1: &DVector<f64>,
        v2: &DVector<f64>,
    ) -> Result<Option<DVector<f64>>> {
        Ok(Some(x.component_mul(v1).component_mul(v2) * 6.0))
    }
}

/// Linear planar system with eigenvalues `(p1 - p2) +- i (1 + p2)`: the
/// Hopf curve is `p1 = p2` with frequency `1 + p2`.
pub struct HopfLocus;

impl HopfLocus {
    fn matrix(p1: f64, p2: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[p1 - p2, -(1.0 + p2), 1.0 + p2, p1 - p2])
    }
}

impl TwoParameterProblem for HopfLocus {
    fn residual(&mut self, x: &DVector<f64>, p1: f64, p2: f64) -> Result<DVector<f64>> {
        Ok(Self::matrix(p1, p2) * x)
    }

    fn jacobian(&mut self, _x: &DVector<f64>, p1: f64, p2: f64) -> Result<JacobianHandle> {
        Ok(JacobianHandle::Dense(Self::matrix(p1, p2)))
    }

    fn hessian(
        &mut self,
        x: &DVector<f64>,
        _p1: f64,
        _p2: f64,
        _v1: &DVector<f64>,
        _v2: &DVector<f64>,
    ) -> Result<Option<DVector<f64>>> {
        Ok(Some(DVector::zeros(x.len())))
    }
}
