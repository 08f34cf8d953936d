//! Periodic orbits by trapezoidal collocation.
//!
//! The orbit is sampled at `M` equally spaced times over one (unknown)
//! period `T`. With `h = T / M` and cyclic indices the unknown
//! `z = (x_1, ..., x_M, T)` satisfies
//!
//! ```text
//! x_{i+1} - x_i - h/2 (F(x_{i+1}) + F(x_i)) = 0,   i = 1..M
//! <x_1 - x_pi, phi> = 0
//! ```
//!
//! The last row fixes the phase. The resulting system is an ordinary
//! `ContinuationProblem`, so `newton` (through `AtParameter`) and
//! `continuation` apply unchanged.

use std::f64::consts::TAU;

use anyhow::{bail, Result};
use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use super::codim1_curves::split_complex;
use super::problem::{BifurcationProblem, ContinuationProblem};
use super::types::{BifurcationPoint, BifurcationType};
use crate::jacobian::{JacobianHandle, MatrixFree};

/// Orbits whose slices all lie within this (relative) distance of each other
/// are stationary points, not periodic orbits.
const COLLAPSE_TOL: f64 = 1e-10;

/// Representation of the orbit Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrbitJacobian {
    /// Assembled CSR matrix, for direct solvers.
    #[default]
    Sparse,
    /// Block action only, for Krylov solvers on large `M * n`.
    MatrixFree,
}

pub struct PeriodicOrbitTrap<'a, P: ?Sized> {
    problem: &'a mut P,
    slices: usize,
    reference: DVector<f64>,
    phase: DVector<f64>,
    jacobian: OrbitJacobian,
}

impl<'a, P: BifurcationProblem + ?Sized> PeriodicOrbitTrap<'a, P> {
    /// `reference` and `phase` define the section `<x_1 - reference, phase> = 0`.
    pub fn new(
        problem: &'a mut P,
        slices: usize,
        reference: DVector<f64>,
        phase: DVector<f64>,
        jacobian: OrbitJacobian,
    ) -> Result<Self> {
        if slices < 2 {
            bail!("A periodic orbit needs at least 2 time slices, got {}.", slices);
        }
        if reference.len() != phase.len() {
            bail!(
                "Phase reference has length {} but the phase vector has length {}.",
                reference.len(),
                phase.len()
            );
        }
        if !(phase.norm() > 0.0) {
            bail!("Phase vector must be non-zero.");
        }
        Ok(Self {
            problem,
            slices,
            reference,
            phase,
            jacobian,
        })
    }

    pub fn slices(&self) -> usize {
        self.slices
    }

    /// Dimension of one slice.
    pub fn state_dim(&self) -> usize {
        self.reference.len()
    }

    /// Length of the orbit unknown, `M * n + 1`.
    pub fn unknowns(&self) -> usize {
        self.slices * self.state_dim() + 1
    }

    pub fn period(&self, z: &DVector<f64>) -> f64 {
        z[z.len() - 1]
    }

    pub fn slice(&self, z: &DVector<f64>, i: usize) -> DVector<f64> {
        let n = self.state_dim();
        z.rows(i * n, n).into_owned()
    }

    fn check(&self, z: &DVector<f64>) -> Result<()> {
        if z.len() != self.unknowns() {
            bail!(
                "Orbit unknown has length {}, expected {} ({} slices of size {} and a period).",
                z.len(),
                self.unknowns(),
                self.slices,
                self.state_dim()
            );
        }
        Ok(())
    }

    fn split(&self, z: &DVector<f64>) -> Vec<DVector<f64>> {
        (0..self.slices).map(|i| self.slice(z, i)).collect()
    }

    /// Sum over neighbouring slices, `g(x_{i+1}) + g(x_i)`, scaled by `scale`.
    fn neighbour_sums(&self, values: &[DVector<f64>], scale: f64) -> DVector<f64> {
        let (m, n) = (self.slices, self.state_dim());
        let mut out = DVector::zeros(m * n);
        for i in 0..m {
            let j = (i + 1) % m;
            out.rows_mut(i * n, n)
                .copy_from(&((&values[j] + &values[i]) * scale));
        }
        out
    }

    fn assemble(
        &self,
        jacs: &[JacobianHandle],
        period_column: &DVector<f64>,
        h: f64,
    ) -> CsrMatrix<f64> {
        let (m, n) = (self.slices, self.state_dim());
        let size = m * n + 1;
        let mut coo = CooMatrix::new(size, size);
        for i in 0..m {
            let j = (i + 1) % m;
            let (row, col_i, col_j) = (i * n, i * n, j * n);
            for k in 0..n {
                coo.push(row + k, col_i + k, -1.0);
                coo.push(row + k, col_j + k, 1.0);
                coo.push(row + k, size - 1, period_column[row + k]);
            }
            for (r, c, v) in triplets(&jacs[i]) {
                coo.push(row + r, col_i + c, -0.5 * h * v);
            }
            for (r, c, v) in triplets(&jacs[j]) {
                coo.push(row + r, col_j + c, -0.5 * h * v);
            }
        }
        for k in 0..n {
            coo.push(size - 1, k, self.phase[k]);
        }
        CsrMatrix::from(&coo)
    }

    fn matrix_free(
        &self,
        jacs: Vec<JacobianHandle>,
        period_column: DVector<f64>,
        h: f64,
    ) -> JacobianHandle {
        let n = self.state_dim();
        let size = self.unknowns();
        let transposed: Option<Vec<JacobianHandle>> =
            jacs.iter().map(|jac| jac.transpose().ok()).collect();

        let (phase, column) = (self.phase.clone(), period_column.clone());
        let forward = MatrixFree::new(size, move |dz: &DVector<f64>| {
            orbit_action(&jacs, &column, &phase, h, n, dz)
        });
        match transposed {
            Some(jacs_t) => {
                let phase = self.phase.clone();
                JacobianHandle::Operator(forward.with_adjoint(move |y: &DVector<f64>| {
                    orbit_adjoint_action(&jacs_t, &period_column, &phase, h, n, y)
                }))
            }
            None => {
                log::debug!("Orbit Jacobian built without adjoint: slice Jacobians lack one");
                JacobianHandle::Operator(forward)
            }
        }
    }
}

fn triplets(jac: &JacobianHandle) -> Vec<(usize, usize, f64)> {
    match jac {
        JacobianHandle::Sparse(m) => m.triplet_iter().map(|(i, j, v)| (i, j, *v)).collect(),
        other => {
            let dense = other.to_dense();
            let mut out = Vec::new();
            for j in 0..dense.ncols() {
                for i in 0..dense.nrows() {
                    let v = dense[(i, j)];
                    if v != 0.0 {
                        out.push((i, j, v));
                    }
                }
            }
            out
        }
    }
}

fn orbit_action(
    jacs: &[JacobianHandle],
    period_column: &DVector<f64>,
    phase: &DVector<f64>,
    h: f64,
    n: usize,
    dz: &DVector<f64>,
) -> DVector<f64> {
    let m = jacs.len();
    let size = m * n + 1;
    let dt = dz[size - 1];
    let dx: Vec<DVector<f64>> = (0..m).map(|i| dz.rows(i * n, n).into_owned()).collect();
    let jdx: Vec<DVector<f64>> = jacs.iter().zip(&dx).map(|(jac, d)| jac.apply(d)).collect();

    let mut out = DVector::zeros(size);
    for i in 0..m {
        let j = (i + 1) % m;
        let block = &dx[j] - &dx[i] - (&jdx[j] + &jdx[i]) * (0.5 * h)
            + period_column.rows(i * n, n) * dt;
        out.rows_mut(i * n, n).copy_from(&block);
    }
    out[size - 1] = phase.dot(&dx[0]);
    out
}

fn orbit_adjoint_action(
    jacs_t: &[JacobianHandle],
    period_column: &DVector<f64>,
    phase: &DVector<f64>,
    h: f64,
    n: usize,
    y: &DVector<f64>,
) -> DVector<f64> {
    let m = jacs_t.len();
    let size = m * n + 1;
    let blocks: Vec<DVector<f64>> = (0..m).map(|i| y.rows(i * n, n).into_owned()).collect();

    let mut out = DVector::zeros(size);
    for j in 0..m {
        let prev = (j + m - 1) % m;
        let mut block =
            &blocks[prev] - &blocks[j] - jacs_t[j].apply(&(&blocks[j] + &blocks[prev])) * (0.5 * h);
        if j == 0 {
            block += phase * y[size - 1];
        }
        out.rows_mut(j * n, n).copy_from(&block);
    }
    out[size - 1] = period_column.dot(&y.rows(0, m * n));
    out
}

impl<P: BifurcationProblem + ?Sized> ContinuationProblem for PeriodicOrbitTrap<'_, P> {
    type State = DVector<f64>;
    type Jacobian = JacobianHandle;

    fn residual(&mut self, z: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        self.check(z)?;
        let (m, n) = (self.slices, self.state_dim());
        let h = self.period(z) / m as f64;
        let xs = self.split(z);
        let fs = xs
            .iter()
            .map(|x| self.problem.residual(x, p))
            .collect::<Result<Vec<_>>>()?;

        let mut out = DVector::zeros(m * n + 1);
        let drift = self.neighbour_sums(&fs, 0.5 * h);
        for i in 0..m {
            let j = (i + 1) % m;
            let block = &xs[j] - &xs[i] - drift.rows(i * n, n);
            out.rows_mut(i * n, n).copy_from(&block);
        }
        out[m * n] = (&xs[0] - &self.reference).dot(&self.phase);
        Ok(out)
    }

    fn jacobian(&mut self, z: &DVector<f64>, p: f64) -> Result<JacobianHandle> {
        self.check(z)?;
        let m = self.slices;
        let h = self.period(z) / m as f64;
        let xs = self.split(z);
        let mut jacs = Vec::with_capacity(m);
        let mut fs = Vec::with_capacity(m);
        for x in &xs {
            jacs.push(self.problem.jacobian(x, p)?);
            fs.push(self.problem.residual(x, p)?);
        }
        // d/dT of -h/2 (F_{i+1} + F_i)
        let period_column = self.neighbour_sums(&fs, -0.5 / m as f64);

        Ok(match self.jacobian {
            OrbitJacobian::Sparse => {
                JacobianHandle::Sparse(self.assemble(&jacs, &period_column, h))
            }
            OrbitJacobian::MatrixFree => self.matrix_free(jacs, period_column, h),
        })
    }

    fn param_derivative(&mut self, z: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        self.check(z)?;
        let m = self.slices;
        let h = self.period(z) / m as f64;
        let dps = self
            .split(z)
            .iter()
            .map(|x| self.problem.param_derivative(x, p))
            .collect::<Result<Vec<_>>>()?;
        let mut out = DVector::zeros(self.unknowns());
        out.rows_mut(0, m * self.state_dim())
            .copy_from(&self.neighbour_sums(&dps, -0.5 * h));
        Ok(out)
    }

    /// Positive period and a non-degenerate (not stationary) orbit.
    fn is_admissible(&self, z: &DVector<f64>, _p: f64) -> bool {
        if z.len() != self.unknowns() {
            return false;
        }
        let period = self.period(z);
        if !(period.is_finite() && period > 0.0) {
            return false;
        }
        let first = self.slice(z, 0);
        let spread = (1..self.slices)
            .map(|i| (self.slice(z, i) - &first).norm())
            .fold(0.0, f64::max);
        spread > COLLAPSE_TOL * (1.0 + first.norm())
    }
}

/// Initial data for a periodic orbit born at a Hopf point.
#[derive(Debug, Clone)]
pub struct OrbitGuess {
    /// `(x_1, ..., x_M, T)`.
    pub orbit: DVector<f64>,
    /// Phase reference `x_pi` (the Hopf state).
    pub reference: DVector<f64>,
    /// Unit phase vector, orthogonal to `Re v`.
    pub phase: DVector<f64>,
    pub period: f64,
}

/// Guess `x(t) = x_H + amplitude * Re(exp(i omega t) v)` sampled at
/// `slices` points over `T = 2 pi / omega`. The eigenvector is scaled so
/// that its largest component has unit modulus.
pub fn orbit_guess_from_hopf(
    point: &BifurcationPoint<DVector<f64>>,
    slices: usize,
    amplitude: f64,
) -> Result<OrbitGuess> {
    if point.kind != BifurcationType::Hopf {
        bail!("Orbit guesses start from a Hopf point, got {:?}.", point.kind);
    }
    if slices < 2 {
        bail!("A periodic orbit needs at least 2 time slices, got {}.", slices);
    }
    let Some(omega) = point
        .omega
        .or(point.eigenvalue.map(|ev| ev.im.abs()))
        .filter(|w| w.is_finite() && *w > 0.0)
    else {
        bail!("Hopf point carries no positive frequency.");
    };
    let Some(v) = point.eigenvector.as_ref() else {
        bail!("Hopf point carries no eigenvector.");
    };
    let n = point.state.len();
    if v.len() != n {
        bail!(
            "Eigenvector length {} does not match the state dimension {}.",
            v.len(),
            n
        );
    }

    let scale = v.iter().map(|c| c.norm()).fold(0.0, f64::max);
    if !(scale > 0.0) {
        bail!("Hopf eigenvector is zero.");
    }
    let (re, im) = split_complex(v);
    let (re, im) = (re / scale, im / scale);

    let re_sq = re.norm_squared();
    let mut phase = if re_sq > 0.0 {
        &im - &re * (im.dot(&re) / re_sq)
    } else {
        im.clone()
    };
    let phase_norm = phase.norm();
    if !(phase_norm > 1e-12) {
        bail!("Hopf eigenvector has no imaginary part independent of its real part.");
    }
    phase /= phase_norm;

    let period = TAU / omega;
    let mut orbit = DVector::zeros(slices * n + 1);
    for i in 0..slices {
        let theta = TAU * i as f64 / slices as f64;
        let x = &point.state + (&re * theta.cos() - &im * theta.sin()) * amplitude;
        orbit.rows_mut(i * n, n).copy_from(&x);
    }
    orbit[slices * n] = period;

    log::debug!(
        "Orbit guess from Hopf point at p = {:.6e}: {} slices, T = {:.6e}",
        point.param,
        slices,
        period
    );

    Ok(OrbitGuess {
        orbit,
        reference: point.state.clone(),
        phase,
        period,
    })
}
