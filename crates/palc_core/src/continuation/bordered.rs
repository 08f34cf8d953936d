//! Bordered linear systems
//!
//! ```text
//! [ J    A ] [X]   [R]
//! [ B^T  C ] [y] = [n]
//! ```
//!
//! with `k` border columns `A`, `k` border rows `B` and a `k x k` corner `C`.
//! The arclength corrector uses `k = 1`, the Hopf refiner `k = 2`.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use super::types::BorderedStrategy;
use crate::error::SolveFailure;
use crate::solvers::LinearSolver;
use crate::traits::{LinearOperator, VectorSpace};

static DIRECT_FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

pub struct BorderedSystem<'a, V, J> {
    pub jac: &'a J,
    pub cols: &'a [V],
    pub rows: &'a [V],
    pub corner: &'a DMatrix<f64>,
}

#[derive(Debug, Clone)]
pub struct BorderedSolve<V> {
    pub x: V,
    pub y: DVector<f64>,
    pub converged: bool,
    /// Linear solver iterations summed over all inner solves.
    pub iterations: usize,
    pub failure: Option<SolveFailure>,
}

impl<V> BorderedSolve<V> {
    fn failed(x: V, k: usize, iterations: usize, failure: SolveFailure) -> Self {
        Self {
            x,
            y: DVector::zeros(k),
            converged: false,
            iterations,
            failure: Some(failure),
        }
    }
}

pub fn solve_bordered<V, J, L>(
    strategy: BorderedStrategy,
    linsolve: &mut L,
    system: &BorderedSystem<'_, V, J>,
    rhs: &V,
    rhs_border: &DVector<f64>,
) -> Result<BorderedSolve<V>>
where
    V: VectorSpace,
    J: LinearOperator<V>,
    L: LinearSolver<V, J>,
{
    let k = system.cols.len();
    if system.rows.len() != k
        || system.corner.nrows() != k
        || system.corner.ncols() != k
        || rhs_border.len() != k
    {
        bail!(
            "Bordered system shape mismatch: {} columns, {} rows, {}x{} corner, {} border rhs",
            k,
            system.rows.len(),
            system.corner.nrows(),
            system.corner.ncols(),
            rhs_border.len()
        );
    }

    match strategy {
        BorderedStrategy::Bordering => bordering(linsolve, system, rhs, rhs_border),
        BorderedStrategy::Direct => match assemble(system, rhs, rhs_border) {
            Some((matrix, b)) => direct(matrix, b, rhs, k),
            None => {
                if !DIRECT_FALLBACK_WARNED.swap(true, Ordering::Relaxed) {
                    log::warn!(
                        "Direct bordered solve needs an assembled Jacobian and dense states; \
                         falling back to bordering"
                    );
                }
                bordering(linsolve, system, rhs, rhs_border)
            }
        },
    }
}

/// Block elimination: `k + 1` solves with `J` and a `k x k` Schur complement.
fn bordering<V, J, L>(
    linsolve: &mut L,
    system: &BorderedSystem<'_, V, J>,
    rhs: &V,
    rhs_border: &DVector<f64>,
) -> Result<BorderedSolve<V>>
where
    V: VectorSpace,
    J: LinearOperator<V>,
    L: LinearSolver<V, J>,
{
    let k = system.cols.len();
    let base = linsolve.solve(system.jac, rhs)?;
    let mut iterations = base.iterations;
    if !base.converged {
        return Ok(BorderedSolve::failed(
            base.solution,
            k,
            iterations,
            SolveFailure::LinearSolveFailure {
                iterations: base.iterations,
            },
        ));
    }

    let mut columns = Vec::with_capacity(k);
    for col in system.cols {
        let solve = linsolve.solve(system.jac, col)?;
        iterations += solve.iterations;
        if !solve.converged {
            return Ok(BorderedSolve::failed(
                base.solution,
                k,
                iterations,
                SolveFailure::LinearSolveFailure {
                    iterations: solve.iterations,
                },
            ));
        }
        columns.push(solve.solution);
    }

    let mut schur = system.corner.clone();
    let mut reduced = rhs_border.clone();
    for (i, row) in system.rows.iter().enumerate() {
        for (j, z) in columns.iter().enumerate() {
            schur[(i, j)] -= row.inner(z);
        }
        reduced[i] -= row.inner(&base.solution);
    }

    let y = match schur.lu().solve(&reduced) {
        Some(y) if y.iter().all(|v| v.is_finite()) => y,
        _ => {
            return Ok(BorderedSolve::failed(
                base.solution,
                k,
                iterations,
                SolveFailure::BorderedSystemSingular,
            ))
        }
    };

    let mut x = base.solution;
    for (j, z) in columns.iter().enumerate() {
        x.add_scaled(-y[j], z);
    }

    Ok(BorderedSolve {
        x,
        y,
        converged: true,
        iterations,
        failure: None,
    })
}

fn assemble<V, J>(
    system: &BorderedSystem<'_, V, J>,
    rhs: &V,
    rhs_border: &DVector<f64>,
) -> Option<(DMatrix<f64>, DVector<f64>)>
where
    V: VectorSpace,
    J: LinearOperator<V>,
{
    let jac = system.jac.assemble()?;
    let r = rhs.to_dense()?;
    let n = jac.nrows();
    let k = system.cols.len();
    if jac.ncols() != n || r.len() != n {
        return None;
    }

    let mut matrix = DMatrix::zeros(n + k, n + k);
    matrix.view_mut((0, 0), (n, n)).copy_from(&jac);
    for (j, col) in system.cols.iter().enumerate() {
        let dense = col.to_dense()?;
        if dense.len() != n {
            return None;
        }
        matrix.view_mut((0, n + j), (n, 1)).copy_from(&dense);
    }
    for (i, row) in system.rows.iter().enumerate() {
        let dense = row.to_dense()?;
        if dense.len() != n {
            return None;
        }
        matrix.view_mut((n + i, 0), (1, n)).copy_from(&dense.transpose());
    }
    matrix.view_mut((n, n), (k, k)).copy_from(system.corner);

    let mut b = DVector::zeros(n + k);
    b.rows_mut(0, n).copy_from(&r);
    b.rows_mut(n, k).copy_from(rhs_border);
    Some((matrix, b))
}

fn direct<V: VectorSpace>(
    matrix: DMatrix<f64>,
    b: DVector<f64>,
    rhs: &V,
    k: usize,
) -> Result<BorderedSolve<V>> {
    let n = matrix.nrows() - k;
    match matrix.lu().solve(&b) {
        Some(sol) if sol.iter().all(|v| v.is_finite()) => {
            let x = match rhs.from_dense(&sol.rows(0, n).into_owned()) {
                Some(x) => x,
                None => bail!("State rejected a dense vector of length {}", n),
            };
            Ok(BorderedSolve {
                x,
                y: sol.rows(n, k).into_owned(),
                converged: true,
                iterations: 1,
                failure: None,
            })
        }
        _ => Ok(BorderedSolve::failed(
            rhs.zeros_like(),
            k,
            1,
            SolveFailure::BorderedSystemSingular,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jacobian::JacobianHandle;
    use crate::solvers::{DenseLu, Gmres};

    fn system_matrix() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            4,
            4,
            &[
                4.0, 1.0, 0.0, 0.5, //
                1.0, 3.0, -1.0, 0.0, //
                0.0, -1.0, 5.0, 1.0, //
                0.2, 0.0, 1.0, 2.0,
            ],
        )
    }

    fn borders() -> (Vec<DVector<f64>>, Vec<DVector<f64>>, DMatrix<f64>) {
        let cols = vec![
            DVector::from_vec(vec![1.0, 0.0, -1.0, 2.0]),
            DVector::from_vec(vec![0.0, 1.0, 1.0, 0.0]),
        ];
        let rows = vec![
            DVector::from_vec(vec![0.5, 0.5, 0.0, 1.0]),
            DVector::from_vec(vec![-1.0, 0.0, 2.0, 0.0]),
        ];
        let corner = DMatrix::from_row_slice(2, 2, &[0.1, 0.0, 0.3, -0.2]);
        (cols, rows, corner)
    }

    #[test]
    fn strategies_agree_with_full_solve() {
        let jac = system_matrix();
        let (cols, rows, corner) = borders();
        let rhs = DVector::from_vec(vec![1.0, -2.0, 0.5, 3.0]);
        let rhs_border = DVector::from_vec(vec![0.25, -1.0]);
        let system = BorderedSystem {
            jac: &jac,
            cols: &cols,
            rows: &rows,
            corner: &corner,
        };

        let full = JacobianHandle::Dense(jac.clone())
            .with_borders(&cols, &rows, &corner)
            .expect("borders")
            .to_dense();
        let mut b = DVector::zeros(6);
        b.rows_mut(0, 4).copy_from(&rhs);
        b.rows_mut(4, 2).copy_from(&rhs_border);
        let expected = full.lu().solve(&b).expect("nonsingular");

        for strategy in [BorderedStrategy::Bordering, BorderedStrategy::Direct] {
            let solved = solve_bordered(strategy, &mut DenseLu, &system, &rhs, &rhs_border)
                .expect("bordered solve");
            assert!(solved.converged);
            assert!((solved.x.clone() - expected.rows(0, 4)).norm() < 1e-12);
            assert!((solved.y.clone() - expected.rows(4, 2)).norm() < 1e-12);
        }
        let bordering = solve_bordered(
            BorderedStrategy::Bordering,
            &mut DenseLu,
            &system,
            &rhs,
            &rhs_border,
        )
        .expect("bordered solve");
        assert_eq!(bordering.iterations, 3);
    }

    #[test]
    fn direct_falls_back_for_matrix_free_jacobians() {
        let dense = system_matrix();
        let a = dense.clone();
        let op = JacobianHandle::matrix_free(4, move |x| &a * x);
        let (cols, rows, corner) = borders();
        let rhs = DVector::from_vec(vec![0.0, 1.0, 0.0, -1.0]);
        let rhs_border = DVector::from_vec(vec![1.0, 0.0]);

        let system = BorderedSystem {
            jac: &op,
            cols: &cols,
            rows: &rows,
            corner: &corner,
        };
        let mut gmres = Gmres::default();
        let solved =
            solve_bordered(BorderedStrategy::Direct, &mut gmres, &system, &rhs, &rhs_border)
                .expect("fallback solve");
        assert!(solved.converged);

        let reference = BorderedSystem {
            jac: &dense,
            cols: &cols,
            rows: &rows,
            corner: &corner,
        };
        let exact = solve_bordered(
            BorderedStrategy::Direct,
            &mut DenseLu,
            &reference,
            &rhs,
            &rhs_border,
        )
        .expect("direct solve");
        assert!((solved.x - exact.x).norm() < 1e-8);
        assert!((solved.y - exact.y).norm() < 1e-8);
    }

    #[test]
    fn singular_border_is_reported() {
        let jac = DMatrix::<f64>::identity(2, 2);
        let cols = vec![DVector::zeros(2)];
        let rows = vec![DVector::zeros(2)];
        let corner = DMatrix::zeros(1, 1);
        let system = BorderedSystem {
            jac: &jac,
            cols: &cols,
            rows: &rows,
            corner: &corner,
        };
        let rhs = DVector::from_vec(vec![1.0, 1.0]);
        for strategy in [BorderedStrategy::Bordering, BorderedStrategy::Direct] {
            let solved = solve_bordered(strategy, &mut DenseLu, &system, &rhs, &DVector::zeros(1))
                .expect("call succeeds");
            assert!(!solved.converged);
            assert_eq!(solved.failure, Some(SolveFailure::BorderedSystemSingular));
        }
    }

    #[test]
    fn direct_handles_singular_jacobian_with_regular_borders() {
        // J is singular but the bordered matrix is not: the typical fold situation.
        let jac = DMatrix::<f64>::zeros(1, 1);
        let cols = vec![DVector::from_element(1, 1.0)];
        let rows = vec![DVector::from_element(1, 1.0)];
        let corner = DMatrix::zeros(1, 1);
        let system = BorderedSystem {
            jac: &jac,
            cols: &cols,
            rows: &rows,
            corner: &corner,
        };
        let solved = solve_bordered(
            BorderedStrategy::Direct,
            &mut DenseLu,
            &system,
            &DVector::zeros(1),
            &DVector::from_element(1, 1.0),
        )
        .expect("direct");
        assert!(solved.converged);
        assert!((solved.x[0] - 1.0).abs() < 1e-14);
        assert!(solved.y[0].abs() < 1e-14);
    }
}
