//! Helpers shared by the stepper: the theta-weighted arclength metric,
//! tangent construction, step-size control and classification of spectral
//! crossings.

use anyhow::{bail, Result};

use super::types::{BifurcationType, ContinuationPar, ContinuationPoint};
use crate::eigen::Spectrum;
use crate::traits::{difference, VectorSpace};

/// Eigenvalues with `|im|` below this are treated as real.
const IMAG_EPS: f64 = 1e-8;

/// Weight of the state part of the metric: `theta / len(u)`.
pub fn state_weight<V: VectorSpace>(theta: f64, u: &V) -> f64 {
    theta / u.dimension().max(1) as f64
}

/// `theta / len * <du1, du2> + (1 - theta) * dp1 * dp2`
pub fn theta_dot<V: VectorSpace>(theta: f64, du1: &V, dp1: f64, du2: &V, dp2: f64) -> f64 {
    state_weight(theta, du1) * du1.inner(du2) + (1.0 - theta) * dp1 * dp2
}

pub fn theta_norm<V: VectorSpace>(theta: f64, du: &V, dp: f64) -> f64 {
    theta_dot(theta, du, dp, du, dp).sqrt()
}

/// Scale `(du, dp)` to unit length in the theta-metric.
pub fn normalize_tangent<V: VectorSpace>(theta: f64, du: &mut V, dp: &mut f64) -> Result<()> {
    let norm = theta_norm(theta, du, *dp);
    if !norm.is_finite() || norm == 0.0 {
        bail!("Tangent has zero or non-finite theta-norm ({}).", norm);
    }
    du.scale_by(1.0 / norm);
    *dp /= norm;
    Ok(())
}

/// Normalised secant from `(u_old, p_old)` to `(u_new, p_new)`.
pub fn secant_tangent<V: VectorSpace>(
    theta: f64,
    u_new: &V,
    p_new: f64,
    u_old: &V,
    p_old: f64,
) -> Result<(V, f64)> {
    let mut du = difference(u_new, u_old);
    let mut dp = p_new - p_old;
    normalize_tangent(theta, &mut du, &mut dp)?;
    Ok((du, dp))
}

/// Pseudo-arclength constraint `N(u, p)` relative to the last accepted point.
pub fn arclength_constraint<V: VectorSpace>(
    theta: f64,
    u: &V,
    p: f64,
    from: &ContinuationPoint<V>,
    ds: f64,
) -> f64 {
    let du = difference(u, &from.state);
    theta_dot(
        theta,
        &du,
        p - from.param,
        &from.tangent_state,
        from.tangent_param,
    ) - ds
}

/// Step size after a successful correction that took `iterations` Newton
/// steps.
pub fn step_size_control(par: &ContinuationPar, ds: f64, iterations: usize) -> f64 {
    let target = par.target_newton_iterations as f64;
    let it = iterations as f64;
    let f = (target - it) / target;
    let factor = 1.0 + par.a * f * f;
    let next = if it < target {
        ds * factor
    } else if it > target {
        ds / factor
    } else {
        ds
    };
    next.clamp(par.ds_min, par.ds_max)
}

/// Step size after a failed correction, or `None` when the run must stop.
pub fn step_size_after_failure(par: &ContinuationPar, ds: f64) -> Option<f64> {
    if ds <= par.ds_min {
        None
    } else {
        Some((0.5 * ds).max(par.ds_min))
    }
}

/// Compare the unstable count of `spectrum` with the previous one and, if it
/// changed, classify the crossing. Returns the tag and the index of the
/// crossing eigenvalue (the one with positive imaginary part for a Hopf).
///
/// Only eigenvalues on the side the count moved to are candidates: the
/// least unstable ones when the count grew, the least stable ones when it
/// dropped. An odd change needs a real eigenvalue; an even change is a Hopf
/// when a complex eigenvalue is among the candidates.
pub fn classify_crossing(
    prev_unstable: usize,
    spectrum: &Spectrum,
) -> Option<(BifurcationType, usize)> {
    let unstable = spectrum.unstable_count();
    if unstable == prev_unstable || spectrum.values.is_empty() {
        return None;
    }

    let grew = unstable > prev_unstable;
    let on_crossing_side = |idx: &usize| (spectrum.values[*idx].re >= 0.0) == grew;
    let closest = |candidates: Vec<usize>| {
        candidates.into_iter().min_by(|&a, &b| {
            spectrum.values[a]
                .re
                .abs()
                .total_cmp(&spectrum.values[b].re.abs())
        })
    };

    let real: Vec<usize> = (0..spectrum.values.len())
        .filter(on_crossing_side)
        .filter(|&i| spectrum.values[i].im.abs() <= IMAG_EPS)
        .collect();
    let upper: Vec<usize> = (0..spectrum.values.len())
        .filter(on_crossing_side)
        .filter(|&i| spectrum.values[i].im > IMAG_EPS)
        .collect();

    let odd = unstable.abs_diff(prev_unstable) % 2 == 1;
    if !odd {
        if let Some(idx) = closest(upper) {
            return Some((BifurcationType::Hopf, idx));
        }
    }
    if let Some(idx) = closest(real) {
        return Some((BifurcationType::BranchPoint, idx));
    }

    // Numerical noise in the imaginary parts; fall back to the nearest
    // eigenvalue to the axis.
    let idx = closest((0..spectrum.values.len()).collect())?;
    let kind = if spectrum.values[idx].im.abs() > IMAG_EPS {
        BifurcationType::Hopf
    } else {
        BifurcationType::BranchPoint
    };
    let idx = if spectrum.values[idx].im < 0.0 {
        conjugate_partner(spectrum, idx)
    } else {
        idx
    };
    Some((kind, idx))
}

/// Unstable eigenvalues that belong to complex pairs.
pub fn unstable_pair_count(spectrum: &Spectrum) -> usize {
    spectrum
        .values
        .iter()
        .filter(|ev| ev.re >= 0.0 && ev.im.abs() > IMAG_EPS)
        .count()
}

/// Index (positive imaginary part) of a complex pair that crossed the
/// imaginary axis, judged by the change of `unstable_pair_count`.
pub fn pair_crossing(prev_pairs: usize, spectrum: &Spectrum) -> Option<usize> {
    let pairs = unstable_pair_count(spectrum);
    if pairs == prev_pairs {
        return None;
    }
    let grew = pairs > prev_pairs;
    (0..spectrum.values.len())
        .filter(|&i| {
            let ev = spectrum.values[i];
            ev.im > IMAG_EPS && (ev.re >= 0.0) == grew
        })
        .min_by(|&a, &b| {
            spectrum.values[a]
                .re
                .abs()
                .total_cmp(&spectrum.values[b].re.abs())
        })
}

fn conjugate_partner(spectrum: &Spectrum, idx: usize) -> usize {
    let target = spectrum.values[idx].conj();
    spectrum
        .values
        .iter()
        .enumerate()
        .filter(|(_, ev)| ev.im > 0.0)
        .min_by(|(_, a), (_, b)| (*a - target).norm().total_cmp(&(*b - target).norm()))
        .map(|(i, _)| i)
        .unwrap_or(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;
    use num_complex::Complex;
    use proptest::prelude::*;

    fn spectrum(values: &[(f64, f64)]) -> Spectrum {
        let mut s = Spectrum {
            values: values.iter().map(|&(re, im)| Complex::new(re, im)).collect(),
            vectors: Vec::new(),
        };
        s.sort_by_real_part();
        s
    }

    #[test]
    fn theta_metric_weights_state_by_dimension() {
        let du = DVector::from_vec(vec![1.0, 1.0, 1.0, 1.0]);
        let value = theta_dot(0.5, &du, 2.0, &du, 2.0);
        assert!((value - (0.5 / 4.0 * 4.0 + 0.5 * 4.0)).abs() < 1e-14);
    }

    #[test]
    fn secant_is_unit_and_points_forward() {
        let old = DVector::from_vec(vec![0.0, 1.0]);
        let new = DVector::from_vec(vec![0.1, 1.2]);
        let (du, dp) = secant_tangent(0.3, &new, 0.5, &old, 0.4).expect("secant");
        assert!((theta_norm(0.3, &du, dp) - 1.0).abs() < 1e-12);
        assert!(dp > 0.0);
        assert!(du[1] > 0.0);
    }

    #[test]
    fn zero_tangent_is_rejected() {
        let mut du = DVector::zeros(3);
        let mut dp = 0.0;
        assert!(normalize_tangent(0.5, &mut du, &mut dp).is_err());
    }

    #[test]
    fn constraint_vanishes_on_the_predictor() {
        let point = ContinuationPoint {
            state: DVector::from_vec(vec![1.0, -1.0]),
            param: 0.2,
            tangent_state: DVector::from_vec(vec![0.6, 0.8]),
            tangent_param: 1.1,
        };
        let mut tu = point.tangent_state.clone();
        let mut tp = point.tangent_param;
        normalize_tangent(0.5, &mut tu, &mut tp).expect("normalize");
        let point = ContinuationPoint {
            tangent_state: tu,
            tangent_param: tp,
            ..point
        };
        let ds = 0.05;
        let u = &point.state + &point.tangent_state * ds;
        let p = point.param + point.tangent_param * ds;
        assert!(arclength_constraint(0.5, &u, p, &point, ds).abs() < 1e-14);
    }

    #[test]
    fn step_grows_after_easy_steps_and_shrinks_after_hard_ones() {
        let par = ContinuationPar {
            ds_min: 1e-4,
            ds_max: 1.0,
            target_newton_iterations: 4,
            a: 0.5,
            ..ContinuationPar::default()
        };
        assert!(step_size_control(&par, 0.1, 1) > 0.1);
        assert_eq!(step_size_control(&par, 0.1, 4), 0.1);
        assert!(step_size_control(&par, 0.1, 7) < 0.1);
        assert_eq!(step_size_control(&par, 0.99, 0), 1.0);
        assert_eq!(step_size_control(&par, 1e-4, 20), 1e-4);
    }

    #[test]
    fn failure_halves_until_minimum() {
        let par = ContinuationPar {
            ds_min: 0.01,
            ..ContinuationPar::default()
        };
        assert_eq!(step_size_after_failure(&par, 0.08), Some(0.04));
        assert_eq!(step_size_after_failure(&par, 0.015), Some(0.01));
        assert_eq!(step_size_after_failure(&par, 0.01), None);
    }

    #[test]
    fn complex_pair_crossing_is_hopf() {
        let before = spectrum(&[(-0.1, 1.0), (-0.1, -1.0), (-2.0, 0.0)]);
        let after = spectrum(&[(0.05, -1.0), (0.05, 1.0), (-2.0, 0.0)]);
        assert_eq!(classify_crossing(before.unstable_count(), &before), None);
        let (kind, idx) = classify_crossing(0, &after).expect("crossing");
        assert_eq!(kind, BifurcationType::Hopf);
        assert!(after.values[idx].im > 0.0);
    }

    #[test]
    fn real_crossing_is_branch_point() {
        let after = spectrum(&[(0.01, 0.0), (-1.0, 0.5), (-1.0, -0.5)]);
        let (kind, idx) = classify_crossing(0, &after).expect("crossing");
        assert_eq!(kind, BifurcationType::BranchPoint);
        assert_eq!(idx, 0);

        let back = spectrum(&[(-0.01, 0.0), (-1.0, 0.5), (-1.0, -0.5)]);
        let (kind, _) = classify_crossing(1, &back).expect("crossing");
        assert_eq!(kind, BifurcationType::BranchPoint);
    }

    #[test]
    fn pair_crossing_beside_weak_real_mode_is_hopf() {
        let after = spectrum(&[(0.05, 1.0), (0.05, -1.0), (-0.01, 0.0), (-3.0, 0.0)]);
        let (kind, idx) = classify_crossing(0, &after).expect("crossing");
        assert_eq!(kind, BifurcationType::Hopf);
        assert_eq!(after.values[idx], Complex::new(0.05, 1.0));
    }

    #[test]
    fn real_crossing_beside_weak_pair_is_branch_point() {
        let after = spectrum(&[(-0.01, 2.0), (-0.01, -2.0), (-0.05, 0.0)]);
        let (kind, idx) = classify_crossing(1, &after).expect("crossing");
        assert_eq!(kind, BifurcationType::BranchPoint);
        assert_eq!(after.values[idx], Complex::new(-0.05, 0.0));

        let gained = spectrum(&[(0.2, 0.0), (0.01, 3.0), (0.01, -3.0), (-1.0, 0.0)]);
        let (kind, idx) = classify_crossing(2, &gained).expect("crossing");
        assert_eq!(kind, BifurcationType::BranchPoint);
        assert_eq!(gained.values[idx], Complex::new(0.2, 0.0));
    }

    #[test]
    fn pair_count_ignores_real_modes() {
        let before = spectrum(&[(0.3, 1.0), (0.3, -1.0), (0.6, 0.0)]);
        assert_eq!(unstable_pair_count(&before), 2);
        assert_eq!(pair_crossing(2, &before), None);

        let after = spectrum(&[(-0.3, 1.0), (-0.3, -1.0), (-0.6, 0.0)]);
        let idx = pair_crossing(2, &after).expect("pair crossed");
        assert_eq!(after.values[idx], Complex::new(-0.3, 1.0));
    }

    proptest! {
        #[test]
        fn normalized_tangents_have_unit_theta_norm(
            values in prop::collection::vec(-10.0f64..10.0, 1..8),
            dp in -10.0f64..10.0,
            theta in 0.05f64..0.95,
        ) {
            let mut du = DVector::from_vec(values);
            let mut dp = dp;
            prop_assume!(theta_norm(theta, &du, dp) > 1e-6);
            normalize_tangent(theta, &mut du, &mut dp).expect("normalize");
            prop_assert!((theta_norm(theta, &du, dp) - 1.0).abs() < 1e-12);
        }
    }
}
