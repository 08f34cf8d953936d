//! Core types for continuation runs.
//!
//! Settings and branch records are plain serde data so a run can be
//! configured from and persisted to JSON. Points and bifurcation points carry
//! the (possibly opaque) state type and stay in memory.

use anyhow::{bail, Result};
use nalgebra::DVector;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::newton::NewtonPar;

/// How bordered systems `[[J, A], [B^T, C]]` are solved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BorderedStrategy {
    /// Block elimination through the linear solver (matrix-free friendly).
    #[default]
    Bordering,
    /// Assemble the augmented matrix and factor it once.
    Direct,
}

/// Settings controlling the pseudo-arclength continuation algorithm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationPar {
    /// Initial step; its sign selects the direction of the first step in the parameter.
    pub ds: f64,
    pub ds_min: f64,
    pub ds_max: f64,
    pub p_min: f64,
    pub p_max: f64,
    pub max_steps: usize,
    /// Weight of the state part in the arclength metric, in `[0, 1]`.
    pub theta: f64,
    /// Step adaptation sensitivity.
    pub a: f64,
    /// Newton iteration count at which the step size is kept unchanged.
    pub target_newton_iterations: usize,
    /// Consecutive corrector failures tolerated before the run stops.
    pub max_failures: usize,
    pub detect_fold: bool,
    pub detect_bifurcation: bool,
    /// Number of leading eigenvalues monitored.
    pub nev: usize,
    /// Request one more eigenvalue after each spectral detection.
    pub grow_nev: bool,
    /// Natural continuation (fixed parameter per step) instead of arclength.
    pub natural: bool,
    /// Secant tangent; otherwise the tangent is obtained from a bordered solve.
    pub secant: bool,
    pub linear_algo: BorderedStrategy,
    /// Keep every accepted point (state and tangent) in the branch.
    pub save_solutions: bool,
    pub newton: NewtonPar,
}

impl Default for ContinuationPar {
    fn default() -> Self {
        Self {
            ds: 0.01,
            ds_min: 1e-3,
            ds_max: 0.1,
            p_min: -1.0,
            p_max: 1.0,
            max_steps: 100,
            theta: 0.5,
            a: 0.5,
            target_newton_iterations: 5,
            max_failures: 10,
            detect_fold: true,
            detect_bifurcation: false,
            nev: 3,
            grow_nev: true,
            natural: false,
            secant: true,
            linear_algo: BorderedStrategy::Bordering,
            save_solutions: false,
            newton: NewtonPar::default(),
        }
    }
}

impl ContinuationPar {
    pub fn validate(&self) -> Result<()> {
        if !self.ds.is_finite() || self.ds == 0.0 {
            bail!("ds must be finite and non-zero (got {}).", self.ds);
        }
        if !(self.ds_min > 0.0 && self.ds_min <= self.ds_max) {
            bail!(
                "Step bounds must satisfy 0 < ds_min <= ds_max (got {} and {}).",
                self.ds_min,
                self.ds_max
            );
        }
        if !(self.p_min < self.p_max) {
            bail!(
                "Parameter range must satisfy p_min < p_max (got {} and {}).",
                self.p_min,
                self.p_max
            );
        }
        if !(0.0..=1.0).contains(&self.theta) {
            bail!("theta must lie in [0, 1] (got {}).", self.theta);
        }
        if !(self.a >= 0.0) {
            bail!("Step adaptation factor a must be non-negative (got {}).", self.a);
        }
        if self.target_newton_iterations == 0 {
            bail!("target_newton_iterations must be greater than zero.");
        }
        if self.detect_bifurcation && self.nev == 0 {
            bail!("nev must be positive when bifurcation detection is enabled.");
        }
        self.newton.validate()
    }
}

/// Classification tag attached to branch records and bifurcation points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BifurcationType {
    None,
    Fold,
    Hopf,
    BranchPoint,
    Cusp,
    BogdanovTakens,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TerminationReason {
    ParameterOutOfRange,
    MaxSteps,
    CorrectorFailure,
    Cancelled,
}

/// An accepted point together with its unit tangent in the theta-metric.
#[derive(Debug, Clone)]
pub struct ContinuationPoint<V> {
    pub state: V,
    pub param: f64,
    pub tangent_state: V,
    pub tangent_param: f64,
}

/// Persisted summary of one accepted step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchRecord {
    pub step: usize,
    pub param: f64,
    /// User projection of the state (norm by default).
    pub value: f64,
    pub newton_iterations: usize,
    pub ds: f64,
    #[serde(default)]
    pub eigenvalues: Vec<Complex<f64>>,
    #[serde(default)]
    pub stable: Option<bool>,
    pub kind: BifurcationType,
}

/// A detected (or refined) special point.
#[derive(Debug, Clone)]
pub struct BifurcationPoint<V> {
    /// Index of the branch record at which the detection happened. For a
    /// `Fold` the state and parameter are those of the last point before
    /// the turn, i.e. of record `index - 1`.
    pub index: usize,
    pub kind: BifurcationType,
    pub state: V,
    pub param: f64,
    pub eigenvalue: Option<Complex<f64>>,
    pub eigenvector: Option<DVector<Complex<f64>>>,
    /// Frequency of a (refined) Hopf point.
    pub omega: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Branch<V> {
    pub records: Vec<BranchRecord>,
    pub bifurcations: Vec<BifurcationPoint<V>>,
    pub refined: Vec<BifurcationPoint<V>>,
    /// Accepted points, filled only when `save_solutions` is set.
    pub solutions: Vec<ContinuationPoint<V>>,
    pub last: Option<ContinuationPoint<V>>,
    pub termination: Option<TerminationReason>,
}

impl<V> Default for Branch<V> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            bifurcations: Vec::new(),
            refined: Vec::new(),
            solutions: Vec::new(),
            last: None,
            termination: None,
        }
    }
}

impl<V> Branch<V> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn params(&self) -> impl Iterator<Item = f64> + '_ {
        self.records.iter().map(|r| r.param)
    }

    pub fn bifurcations_of(
        &self,
        kind: BifurcationType,
    ) -> impl Iterator<Item = &BifurcationPoint<V>> {
        self.bifurcations.iter().filter(move |b| b.kind == kind)
    }

    pub fn records_to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.records)?)
    }

    pub fn records_from_json(json: &str) -> Result<Vec<BranchRecord>> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_through_json() {
        let mut branch: Branch<DVector<f64>> = Branch::default();
        branch.records.push(BranchRecord {
            step: 0,
            param: 0.25,
            value: 1.5,
            newton_iterations: 3,
            ds: 0.01,
            eigenvalues: vec![Complex::new(-1.0, 2.0), Complex::new(-1.0, -2.0)],
            stable: Some(true),
            kind: BifurcationType::None,
        });
        branch.records.push(BranchRecord {
            step: 1,
            param: 0.3,
            value: 1.4,
            newton_iterations: 2,
            ds: 0.05,
            eigenvalues: Vec::new(),
            stable: None,
            kind: BifurcationType::Hopf,
        });

        let json = branch.records_to_json().expect("serialize");
        let restored = Branch::<DVector<f64>>::records_from_json(&json).expect("deserialize");
        assert_eq!(restored, branch.records);
        assert_eq!(restored[1].kind, BifurcationType::Hopf);
    }

    #[test]
    fn settings_load_from_json_and_validate() {
        let par = ContinuationPar::default();
        let json = serde_json::to_string(&par).expect("serialize");
        let loaded: ContinuationPar = serde_json::from_str(&json).expect("deserialize");
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded.linear_algo, BorderedStrategy::Bordering);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let bad_theta = ContinuationPar {
            theta: 1.5,
            ..ContinuationPar::default()
        };
        assert!(bad_theta.validate().is_err());

        let bad_bounds = ContinuationPar {
            ds_min: 0.5,
            ds_max: 0.1,
            ..ContinuationPar::default()
        };
        let err = bad_bounds.validate().expect_err("bounds");
        assert!(err.to_string().contains("ds_min"));

        let zero_step = ContinuationPar {
            ds: 0.0,
            ..ContinuationPar::default()
        };
        assert!(zero_step.validate().is_err());
    }
}
