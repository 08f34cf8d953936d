//! Capability interfaces for states and linear operators.
//!
//! The continuation algorithms never index into a state. Everything they
//! need is expressed through `VectorSpace`, so a state can be a dense vector,
//! a distributed array or any user type that provides the few operations
//! below.

use nalgebra::{DMatrix, DVector};

/// Minimal vector-space capability required of a continuation state.
pub trait VectorSpace: Clone {
    /// Number of scalar unknowns (used to scale the arclength metric).
    fn dimension(&self) -> usize;

    fn inner(&self, other: &Self) -> f64;

    /// `self <- self + alpha * x`
    fn add_scaled(&mut self, alpha: f64, x: &Self);

    fn scale_by(&mut self, alpha: f64);

    /// A zero vector with the same layout as `self`.
    fn zeros_like(&self) -> Self;

    fn norm(&self) -> f64 {
        self.inner(self).sqrt()
    }

    fn is_finite(&self) -> bool {
        self.inner(self).is_finite()
    }

    /// Dense view used by direct factorizations. States that cannot be
    /// flattened return `None` and are solved matrix-free.
    fn to_dense(&self) -> Option<DVector<f64>> {
        None
    }

    /// Rebuild a state with the layout of `self` from dense values.
    fn from_dense(&self, _values: &DVector<f64>) -> Option<Self> {
        None
    }
}

/// Action of a linear operator (typically a Jacobian) on states.
pub trait LinearOperator<V> {
    fn apply(&self, x: &V) -> V;

    /// Dense matrix for direct factorizations, when one can be formed.
    fn assemble(&self) -> Option<DMatrix<f64>> {
        None
    }
}

/// `alpha * x + beta * y` without assuming arithmetic operators on `V`.
pub fn lincomb<V: VectorSpace>(alpha: f64, x: &V, beta: f64, y: &V) -> V {
    let mut out = x.clone();
    out.scale_by(alpha);
    out.add_scaled(beta, y);
    out
}

/// `x - y`
pub fn difference<V: VectorSpace>(x: &V, y: &V) -> V {
    let mut out = x.clone();
    out.add_scaled(-1.0, y);
    out
}

impl VectorSpace for DVector<f64> {
    fn dimension(&self) -> usize {
        self.len()
    }

    fn inner(&self, other: &Self) -> f64 {
        self.dot(other)
    }

    fn add_scaled(&mut self, alpha: f64, x: &Self) {
        self.axpy(alpha, x, 1.0);
    }

    fn scale_by(&mut self, alpha: f64) {
        self.scale_mut(alpha);
    }

    fn zeros_like(&self) -> Self {
        DVector::zeros(self.len())
    }

    fn norm(&self) -> f64 {
        nalgebra::Matrix::norm(self)
    }

    fn is_finite(&self) -> bool {
        self.iter().all(|v| v.is_finite())
    }

    fn to_dense(&self) -> Option<DVector<f64>> {
        Some(self.clone())
    }

    fn from_dense(&self, values: &DVector<f64>) -> Option<Self> {
        (values.len() == self.len()).then(|| values.clone())
    }
}

impl VectorSpace for Vec<f64> {
    fn dimension(&self) -> usize {
        self.len()
    }

    fn inner(&self, other: &Self) -> f64 {
        self.iter().zip(other.iter()).map(|(a, b)| a * b).sum()
    }

    fn add_scaled(&mut self, alpha: f64, x: &Self) {
        for (value, xi) in self.iter_mut().zip(x.iter()) {
            *value += alpha * xi;
        }
    }

    fn scale_by(&mut self, alpha: f64) {
        for value in self.iter_mut() {
            *value *= alpha;
        }
    }

    fn zeros_like(&self) -> Self {
        vec![0.0; self.len()]
    }

    fn is_finite(&self) -> bool {
        self.iter().all(|v| v.is_finite())
    }

    fn to_dense(&self) -> Option<DVector<f64>> {
        Some(DVector::from_column_slice(self))
    }

    fn from_dense(&self, values: &DVector<f64>) -> Option<Self> {
        (values.len() == self.len()).then(|| values.iter().copied().collect())
    }
}

impl LinearOperator<DVector<f64>> for DMatrix<f64> {
    fn apply(&self, x: &DVector<f64>) -> DVector<f64> {
        self * x
    }

    fn assemble(&self) -> Option<DMatrix<f64>> {
        Some(self.clone())
    }
}

impl LinearOperator<Vec<f64>> for DMatrix<f64> {
    fn apply(&self, x: &Vec<f64>) -> Vec<f64> {
        let product = self * DVector::from_column_slice(x);
        product.iter().copied().collect()
    }

    fn assemble(&self) -> Option<DMatrix<f64>> {
        Some(self.clone())
    }
}
