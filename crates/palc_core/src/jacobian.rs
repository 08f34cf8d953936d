//! Jacobian handles for dense-vector states.
//!
//! A Jacobian is either an assembled dense matrix, an assembled CSR matrix or
//! a matrix-free action. The bordered and augmented systems built by the
//! Fold/Hopf machinery and by periodic orbits keep the representation of the
//! underlying Jacobian: dense stays dense, sparse is re-assembled through a
//! COO buffer, and matrix-free handles compose closures.

use std::fmt;
use std::rc::Rc;

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::traits::LinearOperator;

pub type Action = Rc<dyn Fn(&DVector<f64>) -> DVector<f64>>;

/// Jacobian known only through its action (and optionally its adjoint action).
#[derive(Clone)]
pub struct MatrixFree {
    dim: usize,
    action: Action,
    adjoint: Option<Action>,
}

impl MatrixFree {
    pub fn new(dim: usize, action: impl Fn(&DVector<f64>) -> DVector<f64> + 'static) -> Self {
        Self {
            dim,
            action: Rc::new(action),
            adjoint: None,
        }
    }

    pub fn with_adjoint(
        mut self,
        adjoint: impl Fn(&DVector<f64>) -> DVector<f64> + 'static,
    ) -> Self {
        self.adjoint = Some(Rc::new(adjoint));
        self
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        (self.action)(x)
    }

    pub fn apply_adjoint(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        self.adjoint.as_ref().map(|adjoint| adjoint(x))
    }

    fn transposed(&self) -> Option<Self> {
        self.adjoint.as_ref().map(|adjoint| Self {
            dim: self.dim,
            action: Rc::clone(adjoint),
            adjoint: Some(Rc::clone(&self.action)),
        })
    }
}

impl fmt::Debug for MatrixFree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixFree")
            .field("dim", &self.dim)
            .field("has_adjoint", &self.adjoint.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum JacobianHandle {
    Dense(DMatrix<f64>),
    Sparse(CsrMatrix<f64>),
    Operator(MatrixFree),
}

impl From<DMatrix<f64>> for JacobianHandle {
    fn from(matrix: DMatrix<f64>) -> Self {
        JacobianHandle::Dense(matrix)
    }
}

impl From<CsrMatrix<f64>> for JacobianHandle {
    fn from(matrix: CsrMatrix<f64>) -> Self {
        JacobianHandle::Sparse(matrix)
    }
}

impl JacobianHandle {
    pub fn matrix_free(
        dim: usize,
        action: impl Fn(&DVector<f64>) -> DVector<f64> + 'static,
    ) -> Self {
        JacobianHandle::Operator(MatrixFree::new(dim, action))
    }

    /// Number of rows (handles are always square).
    pub fn dim(&self) -> usize {
        match self {
            JacobianHandle::Dense(m) => m.nrows(),
            JacobianHandle::Sparse(m) => m.nrows(),
            JacobianHandle::Operator(op) => op.dim(),
        }
    }

    pub fn is_assembled(&self) -> bool {
        !matches!(self, JacobianHandle::Operator(_))
    }

    pub fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        match self {
            JacobianHandle::Dense(m) => m * x,
            JacobianHandle::Sparse(m) => m * x,
            JacobianHandle::Operator(op) => op.apply(x),
        }
    }

    pub fn apply_transpose(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        match self {
            JacobianHandle::Dense(m) => Ok(m.tr_mul(x)),
            JacobianHandle::Sparse(m) => Ok(&m.transpose() * x),
            JacobianHandle::Operator(op) => match op.apply_adjoint(x) {
                Some(out) => Ok(out),
                None => bail!("Matrix-free Jacobian has no adjoint action"),
            },
        }
    }

    pub fn transpose(&self) -> Result<JacobianHandle> {
        match self {
            JacobianHandle::Dense(m) => Ok(JacobianHandle::Dense(m.transpose())),
            JacobianHandle::Sparse(m) => Ok(JacobianHandle::Sparse(m.transpose())),
            JacobianHandle::Operator(op) => match op.transposed() {
                Some(t) => Ok(JacobianHandle::Operator(t)),
                None => bail!("Matrix-free Jacobian has no adjoint action"),
            },
        }
    }

    /// Dense copy of the operator. Matrix-free handles are materialized one
    /// column at a time.
    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            JacobianHandle::Dense(m) => m.clone(),
            JacobianHandle::Sparse(m) => DMatrix::from(m),
            JacobianHandle::Operator(op) => {
                let n = op.dim();
                let mut dense = DMatrix::zeros(n, n);
                let mut unit = DVector::zeros(n);
                for j in 0..n {
                    unit[j] = 1.0;
                    dense.set_column(j, &op.apply(&unit));
                    unit[j] = 0.0;
                }
                dense
            }
        }
    }

    /// The bordered operator `[[J, A], [B^T, C]]` with `A` given as columns and
    /// `B` as rows.
    pub fn with_borders(
        &self,
        cols: &[DVector<f64>],
        rows: &[DVector<f64>],
        corner: &DMatrix<f64>,
    ) -> Result<JacobianHandle> {
        let n = self.dim();
        let k = cols.len();
        if rows.len() != k || corner.nrows() != k || corner.ncols() != k {
            bail!(
                "Border shape mismatch: {} columns, {} rows, {}x{} corner",
                k,
                rows.len(),
                corner.nrows(),
                corner.ncols()
            );
        }
        if cols.iter().chain(rows.iter()).any(|b| b.len() != n) {
            bail!("Border vectors must have length {}", n);
        }

        Ok(match self {
            JacobianHandle::Dense(m) => {
                let mut out = DMatrix::zeros(n + k, n + k);
                out.view_mut((0, 0), (n, n)).copy_from(m);
                for (j, col) in cols.iter().enumerate() {
                    out.view_mut((0, n + j), (n, 1)).copy_from(col);
                }
                for (i, row) in rows.iter().enumerate() {
                    out.view_mut((n + i, 0), (1, n)).copy_from(&row.transpose());
                }
                out.view_mut((n, n), (k, k)).copy_from(corner);
                JacobianHandle::Dense(out)
            }
            JacobianHandle::Sparse(m) => {
                let mut coo = CooMatrix::new(n + k, n + k);
                for (i, j, v) in m.triplet_iter() {
                    coo.push(i, j, *v);
                }
                push_borders(&mut coo, n, cols, rows, corner);
                JacobianHandle::Sparse(CsrMatrix::from(&coo))
            }
            JacobianHandle::Operator(op) => {
                let inner = op.clone();
                let (c, r, d) = (cols.to_vec(), rows.to_vec(), corner.clone());
                let forward = MatrixFree::new(n + k, move |z: &DVector<f64>| {
                    bordered_action(&z.rows(0, n).into_owned(), z, &c, &r, &d, |x| inner.apply(x))
                });
                match op.transposed() {
                    Some(adjoint) => {
                        let (c, r, dt) = (rows.to_vec(), cols.to_vec(), corner.transpose());
                        JacobianHandle::Operator(forward.with_adjoint(move |z: &DVector<f64>| {
                            bordered_action(&z.rows(0, n).into_owned(), z, &c, &r, &dt, |x| {
                                adjoint.apply(x)
                            })
                        }))
                    }
                    None => JacobianHandle::Operator(forward),
                }
            }
        })
    }

    /// Real `2n` form of `J - i*omega*I`, i.e. `[[J, omega I], [-omega I, J]]`
    /// acting on `[Re v; Im v]`. Its transpose is the real form of the
    /// adjoint `J^T + i*omega*I`.
    pub fn complex_shift(&self, omega: f64) -> JacobianHandle {
        let n = self.dim();
        match self {
            JacobianHandle::Dense(m) => {
                let mut out = DMatrix::zeros(2 * n, 2 * n);
                out.view_mut((0, 0), (n, n)).copy_from(m);
                out.view_mut((n, n), (n, n)).copy_from(m);
                for i in 0..n {
                    out[(i, n + i)] = omega;
                    out[(n + i, i)] = -omega;
                }
                JacobianHandle::Dense(out)
            }
            JacobianHandle::Sparse(m) => {
                let mut coo = CooMatrix::new(2 * n, 2 * n);
                for (i, j, v) in m.triplet_iter() {
                    coo.push(i, j, *v);
                    coo.push(n + i, n + j, *v);
                }
                for i in 0..n {
                    coo.push(i, n + i, omega);
                    coo.push(n + i, i, -omega);
                }
                JacobianHandle::Sparse(CsrMatrix::from(&coo))
            }
            JacobianHandle::Operator(op) => {
                let inner = op.clone();
                let forward = MatrixFree::new(2 * n, move |z: &DVector<f64>| {
                    shifted_action(z, n, omega, |x| inner.apply(x))
                });
                match op.transposed() {
                    Some(adjoint) => JacobianHandle::Operator(forward.with_adjoint(
                        move |z: &DVector<f64>| shifted_action(z, n, -omega, |x| adjoint.apply(x)),
                    )),
                    None => JacobianHandle::Operator(forward),
                }
            }
        }
    }
}

impl LinearOperator<DVector<f64>> for JacobianHandle {
    fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        JacobianHandle::apply(self, x)
    }

    fn assemble(&self) -> Option<DMatrix<f64>> {
        self.is_assembled().then(|| self.to_dense())
    }
}

fn push_borders(
    coo: &mut CooMatrix<f64>,
    n: usize,
    cols: &[DVector<f64>],
    rows: &[DVector<f64>],
    corner: &DMatrix<f64>,
) {
    for (j, col) in cols.iter().enumerate() {
        for (i, &v) in col.iter().enumerate() {
            if v != 0.0 {
                coo.push(i, n + j, v);
            }
        }
    }
    for (i, row) in rows.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            if v != 0.0 {
                coo.push(n + i, j, v);
            }
        }
    }
    for i in 0..corner.nrows() {
        for j in 0..corner.ncols() {
            if corner[(i, j)] != 0.0 {
                coo.push(n + i, n + j, corner[(i, j)]);
            }
        }
    }
}

fn bordered_action(
    x: &DVector<f64>,
    z: &DVector<f64>,
    cols: &[DVector<f64>],
    rows: &[DVector<f64>],
    corner: &DMatrix<f64>,
    apply: impl Fn(&DVector<f64>) -> DVector<f64>,
) -> DVector<f64> {
    let n = x.len();
    let k = cols.len();
    let y = z.rows(n, k);
    let mut out = DVector::zeros(n + k);
    let mut top = apply(x);
    for (j, col) in cols.iter().enumerate() {
        top.axpy(y[j], col, 1.0);
    }
    out.rows_mut(0, n).copy_from(&top);
    for (i, row) in rows.iter().enumerate() {
        out[n + i] = row.dot(x) + (0..k).map(|j| corner[(i, j)] * y[j]).sum::<f64>();
    }
    out
}

fn shifted_action(
    z: &DVector<f64>,
    n: usize,
    omega: f64,
    apply: impl Fn(&DVector<f64>) -> DVector<f64>,
) -> DVector<f64> {
    let re = z.rows(0, n).into_owned();
    let im = z.rows(n, n).into_owned();
    let mut out = DVector::zeros(2 * n);
    out.rows_mut(0, n).copy_from(&(apply(&re) + &im * omega));
    out.rows_mut(n, n).copy_from(&(apply(&im) - &re * omega));
    out
}
