//! Linear solver port and the two reference backends.
//!
//! `DenseLu` factorizes an assembled Jacobian with nalgebra's LU. `Gmres` is a
//! restarted GMRES(m) that only needs the operator action and the
//! `VectorSpace` capabilities of the state, so it works for matrix-free
//! Jacobians and for states that cannot be flattened.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::traits::{LinearOperator, VectorSpace};

/// Result of one linear solve. `converged == false` is a recoverable failure.
#[derive(Debug, Clone)]
pub struct LinearSolve<V> {
    pub solution: V,
    pub converged: bool,
    pub iterations: usize,
}

pub trait LinearSolver<V, J> {
    /// Solve `jac * x = rhs`.
    fn solve(&mut self, jac: &J, rhs: &V) -> Result<LinearSolve<V>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenseLu;

impl<V: VectorSpace, J: LinearOperator<V>> LinearSolver<V, J> for DenseLu {
    fn solve(&mut self, jac: &J, rhs: &V) -> Result<LinearSolve<V>> {
        let (Some(matrix), Some(b)) = (jac.assemble(), rhs.to_dense()) else {
            bail!("Dense LU requires an assembled Jacobian and a state with a dense view");
        };
        if matrix.nrows() != b.len() || matrix.ncols() != b.len() {
            bail!(
                "Dense LU dimension mismatch: matrix is {}x{}, rhs has length {}",
                matrix.nrows(),
                matrix.ncols(),
                b.len()
            );
        }

        match matrix.lu().solve(&b) {
            Some(x) if x.iter().all(|v| v.is_finite()) => match rhs.from_dense(&x) {
                Some(solution) => Ok(LinearSolve {
                    solution,
                    converged: true,
                    iterations: 1,
                }),
                None => bail!("State rejected a dense vector of length {}", x.len()),
            },
            _ => Ok(LinearSolve {
                solution: rhs.zeros_like(),
                converged: false,
                iterations: 1,
            }),
        }
    }
}

/// Restarted GMRES with modified Gram-Schmidt and Givens rotations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Gmres {
    /// Krylov dimension before restart.
    pub restart: usize,
    /// Total number of operator applications allowed.
    pub max_iter: usize,
    /// Relative residual tolerance `|b - Ax| <= tol * |b|`.
    pub tol: f64,
}

impl Default for Gmres {
    fn default() -> Self {
        Self {
            restart: 40,
            max_iter: 400,
            tol: 1e-12,
        }
    }
}

impl<V: VectorSpace, J: LinearOperator<V>> LinearSolver<V, J> for Gmres {
    fn solve(&mut self, jac: &J, rhs: &V) -> Result<LinearSolve<V>> {
        if self.restart == 0 || self.max_iter == 0 {
            bail!("GMRES restart and max_iter must be positive");
        }
        if self.tol <= 0.0 {
            bail!("GMRES tolerance must be positive");
        }

        let mut x = rhs.zeros_like();
        let b_norm = rhs.norm();
        if b_norm == 0.0 {
            return Ok(LinearSolve {
                solution: x,
                converged: true,
                iterations: 0,
            });
        }
        let threshold = self.tol * b_norm;
        let m = self.restart;
        let mut iterations = 0usize;

        loop {
            let mut r = rhs.clone();
            r.add_scaled(-1.0, &jac.apply(&x));
            let beta = r.norm();
            if !beta.is_finite() {
                log::warn!("GMRES residual became non-finite after {} iterations", iterations);
                return Ok(LinearSolve {
                    solution: x,
                    converged: false,
                    iterations,
                });
            }
            if beta <= threshold {
                return Ok(LinearSolve {
                    solution: x,
                    converged: true,
                    iterations,
                });
            }
            if iterations >= self.max_iter {
                log::warn!(
                    "GMRES stopped after {} iterations with relative residual {:.3e}",
                    iterations,
                    beta / b_norm
                );
                return Ok(LinearSolve {
                    solution: x,
                    converged: false,
                    iterations,
                });
            }

            r.scale_by(1.0 / beta);
            let mut basis = vec![r];
            // Column j of the Hessenberg matrix lives in h[j].
            let mut h: Vec<Vec<f64>> = Vec::with_capacity(m);
            let mut cs = vec![0.0; m];
            let mut sn = vec![0.0; m];
            let mut g = vec![0.0; m + 1];
            g[0] = beta;
            let mut k = 0;

            for j in 0..m {
                iterations += 1;
                let mut w = jac.apply(&basis[j]);
                let mut column = vec![0.0; j + 2];
                for (i, q) in basis.iter().enumerate().take(j + 1) {
                    column[i] = w.inner(q);
                    w.add_scaled(-column[i], q);
                }
                column[j + 1] = w.norm();

                for i in 0..j {
                    let temp = cs[i] * column[i] + sn[i] * column[i + 1];
                    column[i + 1] = -sn[i] * column[i] + cs[i] * column[i + 1];
                    column[i] = temp;
                }
                let (a, b) = (column[j], column[j + 1]);
                let radius = a.hypot(b);
                let breakdown = b == 0.0;
                if radius == 0.0 {
                    break;
                }
                cs[j] = a / radius;
                sn[j] = b / radius;
                column[j] = radius;
                column[j + 1] = 0.0;
                g[j + 1] = -sn[j] * g[j];
                g[j] *= cs[j];
                h.push(column);
                k = j + 1;

                if breakdown || g[j + 1].abs() <= threshold || iterations >= self.max_iter {
                    break;
                }
                w.scale_by(1.0 / b);
                basis.push(w);
            }

            if k == 0 {
                log::warn!("GMRES encountered a singular Krylov subspace");
                return Ok(LinearSolve {
                    solution: x,
                    converged: false,
                    iterations,
                });
            }

            let mut y = vec![0.0; k];
            for i in (0..k).rev() {
                let tail: f64 = ((i + 1)..k).map(|l| h[l][i] * y[l]).sum();
                y[i] = (g[i] - tail) / h[i][i];
            }
            for (yi, q) in y.iter().zip(basis.iter()) {
                x.add_scaled(*yi, q);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jacobian::JacobianHandle;
    use nalgebra::{DMatrix, DVector};

    fn convection_diffusion(n: usize) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(n, n);
        for i in 0..n {
            m[(i, i)] = 4.0;
            if i > 0 {
                m[(i, i - 1)] = -1.5;
            }
            if i + 1 < n {
                m[(i, i + 1)] = -0.5;
            }
        }
        m
    }

    #[test]
    fn gmres_matches_lu_on_nonsymmetric_system() {
        let n = 60;
        let m = convection_diffusion(n);
        let rhs = DVector::from_fn(n, |i, _| (i as f64 * 0.37).sin());

        let direct = DenseLu.solve(&m, &rhs).expect("lu solve");
        assert!(direct.converged);

        let a = m.clone();
        let op = JacobianHandle::matrix_free(n, move |x| &a * x);
        let mut gmres = Gmres {
            restart: 10,
            ..Gmres::default()
        };
        let iterative = gmres.solve(&op, &rhs).expect("gmres solve");
        assert!(iterative.converged, "gmres should converge");
        assert!(iterative.iterations > 1);
        assert!((iterative.solution - direct.solution).norm() < 1e-9);
    }

    #[test]
    fn gmres_works_on_plain_vec_states() {
        let m = convection_diffusion(8);
        let rhs: Vec<f64> = (0..8).map(|i| 1.0 + i as f64).collect();
        let result = Gmres::default().solve(&m, &rhs).expect("gmres solve");
        assert!(result.converged);
        let check = LinearOperator::<Vec<f64>>::apply(&m, &result.solution);
        for (a, b) in check.iter().zip(rhs.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn gmres_zero_rhs_returns_zero_immediately() {
        let m = convection_diffusion(4);
        let result = Gmres::default()
            .solve(&m, &DVector::zeros(4))
            .expect("gmres solve");
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.solution, DVector::zeros(4));
    }

    #[test]
    fn lu_reports_singular_matrix_as_not_converged() {
        let m = DMatrix::<f64>::zeros(2, 2);
        let result = DenseLu.solve(&m, &DVector::from_vec(vec![1.0, 0.0])).expect("call");
        assert!(!result.converged);
    }

    #[test]
    fn lu_rejects_matrix_free_operator() {
        let op = JacobianHandle::matrix_free(2, |x| x.clone());
        let err = DenseLu
            .solve(&op, &DVector::from_vec(vec![1.0, 0.0]))
            .expect_err("needs assembly");
        assert!(err.to_string().contains("assembled Jacobian"));
    }
}
