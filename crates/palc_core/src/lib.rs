//! The `palc_core` crate traces solution branches of parametrized nonlinear
//! systems `F(u, p) = 0` and analyses their bifurcations.
//!
//! Key components:
//! - **Traits**: `VectorSpace` (state abstraction), `LinearOperator`, and the
//!   `LinearSolver` / `EigenSolver` ports for user-supplied numerics.
//! - **Newton**: the corrector shared by every solve, plus deflation for
//!   finding several solutions from one guess.
//! - **Continuation**: the pseudo-arclength stepper, bordered solves, Fold and
//!   Hopf refinement, two-parameter curves and periodic orbits.
pub mod continuation;
pub mod deflation;
pub mod eigen;
pub mod error;
pub mod jacobian;
pub mod newton;
pub mod solvers;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_problems;
