//! Eigen-solver port and the dense reference backend.

use std::cmp::Ordering;

use anyhow::{anyhow, bail, Result};
use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use crate::traits::LinearOperator;

/// Leading part of a spectrum, ordered by descending real part.
#[derive(Debug, Clone, Default)]
pub struct Spectrum {
    pub values: Vec<Complex<f64>>,
    /// Right eigenvectors matching `values`; may be empty when the backend
    /// only reports eigenvalues.
    pub vectors: Vec<DVector<Complex<f64>>>,
}

impl Spectrum {
    /// Re-establish the descending real-part order. Backends are asked to
    /// deliver it but the detection logic depends on it, so it is enforced.
    pub fn sort_by_real_part(&mut self) {
        let mut order: Vec<usize> = (0..self.values.len()).collect();
        order.sort_by(|&a, &b| {
            self.values[b]
                .re
                .partial_cmp(&self.values[a].re)
                .unwrap_or(Ordering::Equal)
        });
        self.values = order.iter().map(|&i| self.values[i]).collect();
        if self.vectors.len() == order.len() {
            self.vectors = order.iter().map(|&i| self.vectors[i].clone()).collect();
        }
    }

    /// Number of eigenvalues with non-negative real part.
    pub fn unstable_count(&self) -> usize {
        self.values.iter().filter(|ev| ev.re >= 0.0).count()
    }
}

pub trait EigenSolver<V, J> {
    /// Compute `nev` eigenvalues with the largest real parts.
    fn eigen(&mut self, jac: &J, nev: usize) -> Result<Spectrum>;
}

/// Full dense eigen-decomposition (real Schur form) followed by an SVD null
/// vector of `J - lambda I` for each requested eigenvalue.
#[derive(Debug, Clone, Copy)]
pub struct DenseEigen {
    pub compute_vectors: bool,
}

impl Default for DenseEigen {
    fn default() -> Self {
        Self {
            compute_vectors: true,
        }
    }
}

impl<V, J: LinearOperator<V>> EigenSolver<V, J> for DenseEigen {
    fn eigen(&mut self, jac: &J, nev: usize) -> Result<Spectrum> {
        let Some(matrix) = jac.assemble() else {
            bail!("Dense eigen-solver requires an assembled Jacobian");
        };
        if matrix.nrows() != matrix.ncols() {
            bail!("Jacobian must be square, got {}x{}", matrix.nrows(), matrix.ncols());
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            bail!("Jacobian contains non-finite entries");
        }

        let mut spectrum = Spectrum {
            values: matrix.complex_eigenvalues().iter().copied().collect(),
            vectors: Vec::new(),
        };
        spectrum.sort_by_real_part();
        spectrum.values.truncate(nev.min(matrix.nrows()));

        if self.compute_vectors {
            spectrum.vectors = spectrum
                .values
                .iter()
                .map(|&lambda| null_vector(&matrix, lambda))
                .collect::<Result<_>>()?;
        }
        Ok(spectrum)
    }
}

/// Unit vector spanning (approximately) the kernel of `matrix - lambda I`.
pub fn null_vector(matrix: &DMatrix<f64>, lambda: Complex<f64>) -> Result<DVector<Complex<f64>>> {
    let n = matrix.nrows();
    let mut shifted = matrix.map(|v| Complex::new(v, 0.0));
    for i in 0..n {
        shifted[(i, i)] -= lambda;
    }

    let svd = SVD::new(shifted, false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow!("Failed to compute eigenvector for eigenvalue {}", lambda))?;
    let smallest = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i)
        .ok_or_else(|| anyhow!("Empty singular value decomposition"))?;

    // Rows of V^H are conjugated right singular vectors.
    let mut vector: DVector<Complex<f64>> = v_t.row(smallest).adjoint();
    let norm = vector.norm();
    if norm > 0.0 {
        vector.unscale_mut(norm);
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spectrum_is_sorted_by_descending_real_part() {
        let m = DMatrix::from_row_slice(
            4,
            4,
            &[
                -3.0, 0.0, 0.0, 0.0, //
                0.0, 0.5, -2.0, 0.0, //
                0.0, 2.0, 0.5, 0.0, //
                0.0, 0.0, 0.0, -0.1,
            ],
        );
        let spectrum = EigenSolver::<DVector<f64>, _>::eigen(&mut DenseEigen::default(), &m, 3)
            .expect("spectrum");
        assert_eq!(spectrum.values.len(), 3);
        assert!((spectrum.values[0].re - 0.5).abs() < 1e-12);
        assert!((spectrum.values[1].re - 0.5).abs() < 1e-12);
        assert!((spectrum.values[2].re + 0.1).abs() < 1e-12);
        assert_eq!(spectrum.unstable_count(), 2);

        for (lambda, v) in spectrum.values.iter().zip(spectrum.vectors.iter()) {
            let mc = m.map(|x| Complex::new(x, 0.0));
            let residual = &mc * v - v * *lambda;
            assert!(residual.norm() < 1e-10, "eigenpair residual {}", residual.norm());
        }
    }

    #[test]
    fn manual_sort_reorders_vectors_with_values() {
        let mut spectrum = Spectrum {
            values: vec![Complex::new(-1.0, 0.0), Complex::new(2.0, 0.0)],
            vectors: vec![
                DVector::from_element(1, Complex::new(1.0, 0.0)),
                DVector::from_element(1, Complex::new(2.0, 0.0)),
            ],
        };
        spectrum.sort_by_real_part();
        assert_eq!(spectrum.values[0].re, 2.0);
        assert_eq!(spectrum.vectors[0][0].re, 2.0);
    }
}
