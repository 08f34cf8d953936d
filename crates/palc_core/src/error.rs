//! Failure kinds reported by the iterative solvers.
//!
//! Numerical failures are data: they travel inside `NewtonOutcome`,
//! `BorderedSolve` and the refiner outcomes so the continuation loop can
//! react to them (halve the step, terminate the branch). Contract violations
//! such as malformed settings or dimension mismatches are raised as
//! `anyhow::Error` instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Error)]
pub enum SolveFailure {
    #[error("linear solver did not converge after {iterations} iterations")]
    LinearSolveFailure { iterations: usize },
    #[error("Newton iteration did not converge in {iterations} steps (residual {residual:.3e})")]
    NewtonNonConvergence { iterations: usize, residual: f64 },
    #[error("bordered system is singular")]
    BorderedSystemSingular,
    #[error("residual is not finite")]
    NonFiniteResidual,
    #[error("iterate left the admissible set")]
    Inadmissible,
    #[error("damped step failed to decrease the residual after {halvings} halvings")]
    LineSearchFailure { halvings: usize },
}

/// Split an error raised by user code: a `SolveFailure` becomes a
/// recoverable outcome, anything else stays fatal.
pub(crate) fn recoverable<T>(
    result: anyhow::Result<T>,
) -> anyhow::Result<Result<T, SolveFailure>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(err) => err.downcast::<SolveFailure>().map(Err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_messages_carry_context() {
        let failure = SolveFailure::NewtonNonConvergence {
            iterations: 7,
            residual: 1.5e-3,
        };
        let message = failure.to_string();
        assert!(message.contains("7 steps"), "unexpected message: {message}");
        assert!(message.contains("1.500e-3"), "unexpected message: {message}");
    }

    #[test]
    fn only_solve_failures_are_recoverable() {
        let soft: anyhow::Result<()> = Err(SolveFailure::BorderedSystemSingular.into());
        assert_eq!(
            recoverable(soft).expect("recoverable"),
            Err(SolveFailure::BorderedSystemSingular)
        );

        let hard: anyhow::Result<()> = Err(anyhow::anyhow!("dimension mismatch"));
        assert!(recoverable(hard).is_err());
        assert_eq!(recoverable(Ok(3)).expect("ok"), Ok(3));
    }
}
