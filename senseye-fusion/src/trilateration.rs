//! Robust weighted Gauss-Newton trilateration (C5).
//!
//! Ranges are weighted by a distance-dependent noise model and a Tukey
//! biweight that zeroes out gross outliers. For small anchor sets the
//! solver additionally evaluates leave-one-out and 3-anchor subsets and
//! keeps the candidate with the most inliers, then refits on the inlier
//! set.

use nalgebra::{Matrix2, Vector2};
use thiserror::Error;

use senseye_common::Point;

const EPS: f64 = 1e-9;
/// Levenberg damping added to the normal equations.
const DAMPING: f64 = 1e-6;
/// Normalized residual below which an observation is an inlier.
const INLIER_RHO: f64 = 2.5;
/// Cap on per-observation squared normalized residuals when scoring.
const SCORE_CAP: f64 = 9.0;
/// Weighted RMSE above which the solution is rejected as divergent.
const MAX_RMSE: f64 = 8.0;
/// Largest anchor count for which all 3-subsets are evaluated.
const FULL_SUBSET_LIMIT: usize = 6;

/// One anchor with a measured range.
#[derive(Debug, Clone, Copy)]
pub struct RangeObservation {
    /// Anchor position
    pub anchor: Point,
    /// Measured distance to the target (meters)
    pub distance: f64,
}

impl RangeObservation {
    /// Creates a range observation.
    pub fn new(anchor: Point, distance: f64) -> Self {
        Self { anchor, distance }
    }
}

/// Solved position with quality metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFix {
    /// Estimated position
    pub position: Point,
    /// Precision-weighted residual RMSE (meters)
    pub rmse: f64,
    /// Number of observations within the inlier threshold
    pub inliers: usize,
}

/// Trilateration failure modes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrilaterationError {
    /// Fewer than three usable anchors.
    #[error("insufficient anchors: need at least 3, got {0}")]
    InsufficientAnchors(usize),

    /// The iterative solve did not reach a finite, plausible solution.
    #[error("solver diverged")]
    Divergence,
}

/// Range uncertainty model (meters): error grows with distance in
/// RSSI-derived ranging.
fn range_sigma(distance: f64) -> f64 {
    (0.08 * distance + 0.2).max(0.35)
}

fn tukey_weight(residual: f64, sigma: f64) -> f64 {
    let cutoff = 2.5 * sigma;
    let ratio = residual.abs() / cutoff;
    if ratio >= 1.0 {
        0.0
    } else {
        let inner = 1.0 - ratio * ratio;
        inner * inner
    }
}

/// Linearized least-squares seed; falls back to the anchor centroid.
fn initial_guess(observations: &[RangeObservation]) -> Point {
    let first = &observations[0];
    let (x0, y0, d0) = (first.anchor.x, first.anchor.y, first.distance);

    let mut ata = Matrix2::zeros();
    let mut atb = Vector2::zeros();
    let mut rows = 0usize;
    for obs in &observations[1..] {
        let (xi, yi, di) = (obs.anchor.x, obs.anchor.y, obs.distance);
        let row = Vector2::new(2.0 * (xi - x0), 2.0 * (yi - y0));
        let rhs = (d0 * d0 - di * di) - (x0 * x0 - xi * xi) - (y0 * y0 - yi * yi);
        ata += row * row.transpose();
        atb += row * rhs;
        rows += 1;
    }

    if rows >= 2 {
        if let Some(solution) = ata.lu().solve(&atb) {
            if solution.x.is_finite() && solution.y.is_finite() {
                return Point::new(solution.x, solution.y);
            }
        }
    }
    centroid(observations)
}

fn centroid(observations: &[RangeObservation]) -> Point {
    let n = observations.len() as f64;
    let (sx, sy) = observations
        .iter()
        .fold((0.0, 0.0), |(sx, sy), o| (sx + o.anchor.x, sy + o.anchor.y));
    Point::new(sx / n, sy / n)
}

/// One IRLS solve from a seed. Tukey weights are recomputed each
/// iteration; if every observation is rejected the base weights keep the
/// step defined.
fn solve_position(
    observations: &[RangeObservation],
    seed: Point,
    max_iters: usize,
    tolerance: f64,
) -> Point {
    let mut x = seed.x;
    let mut y = seed.y;

    for _ in 0..max_iters {
        let mut jtj = Matrix2::zeros();
        let mut jtr = Vector2::zeros();
        let mut base_jtj = Matrix2::zeros();
        let mut base_jtr = Vector2::zeros();
        let mut max_weight = 0.0f64;

        for obs in observations {
            let dx = x - obs.anchor.x;
            let dy = y - obs.anchor.y;
            let predicted = dx.hypot(dy).max(EPS);
            let residual = predicted - obs.distance;

            let sigma = range_sigma(obs.distance);
            let base_weight = 1.0 / (sigma * sigma);
            let weight = base_weight * tukey_weight(residual, sigma);
            max_weight = max_weight.max(weight);

            let jac = Vector2::new(dx / predicted, dy / predicted);
            jtj += jac * jac.transpose() * weight;
            jtr += jac * (residual * weight);
            base_jtj += jac * jac.transpose() * base_weight;
            base_jtr += jac * (residual * base_weight);
        }

        if max_weight <= 1e-12 {
            jtj = base_jtj;
            jtr = base_jtr;
        }

        let damped = jtj + Matrix2::identity() * DAMPING;
        let step = match damped.lu().solve(&jtr) {
            Some(step) => step,
            None => damped.pseudo_inverse(EPS).map(|pinv| pinv * jtr).unwrap_or_default(),
        };

        x -= step.x;
        y -= step.y;

        if step.norm() < tolerance {
            break;
        }
    }

    Point::new(x, y)
}

fn normalized_residuals(position: Point, observations: &[RangeObservation]) -> Vec<f64> {
    observations
        .iter()
        .map(|obs| {
            let predicted = position.distance_to(&obs.anchor);
            (predicted - obs.distance).abs() / range_sigma(obs.distance)
        })
        .collect()
}

fn subset_candidates(n: usize) -> Vec<Vec<usize>> {
    let mut candidates = vec![(0..n).collect::<Vec<_>>()];
    if n > 3 {
        // Leave-one-out subsets.
        for skip in 0..n {
            candidates.push((0..n).filter(|&i| i != skip).collect());
        }
        // All 3-subsets for small anchor sets.
        if n <= FULL_SUBSET_LIMIT {
            for i in 0..n {
                for j in i + 1..n {
                    for k in j + 1..n {
                        candidates.push(vec![i, j, k]);
                    }
                }
            }
        }
    }
    candidates
}

/// Estimates a 2-D position from range observations.
///
/// # Errors
///
/// Returns [`TrilaterationError::InsufficientAnchors`] with fewer than
/// three finite positive ranges, and [`TrilaterationError::Divergence`]
/// when no candidate reaches a plausible weighted RMSE.
pub fn trilaterate(
    observations: &[RangeObservation],
    max_iters: usize,
    tolerance: f64,
) -> Result<PositionFix, TrilaterationError> {
    let valid: Vec<RangeObservation> = observations
        .iter()
        .filter(|o| o.distance.is_finite() && o.distance > 0.0)
        .copied()
        .collect();
    if valid.len() < 3 {
        return Err(TrilaterationError::InsufficientAnchors(valid.len()));
    }

    let mut best_position: Option<Point> = None;
    let mut best_residuals: Vec<f64> = Vec::new();
    let mut best_inliers = 0usize;
    let mut best_score = f64::INFINITY;

    for index_set in subset_candidates(valid.len()) {
        let subset: Vec<RangeObservation> = index_set.iter().map(|&i| valid[i]).collect();
        let seeds = [initial_guess(&subset), centroid(&subset)];

        for seed in seeds {
            let position = solve_position(&subset, seed, max_iters, tolerance);
            if !(position.x.is_finite() && position.y.is_finite()) {
                continue;
            }
            let residuals = normalized_residuals(position, &valid);
            let inliers = residuals.iter().filter(|&&r| r <= INLIER_RHO).count();
            let score = residuals
                .iter()
                .map(|r| (r * r).min(SCORE_CAP))
                .sum::<f64>()
                / residuals.len() as f64;

            if inliers > best_inliers || (inliers == best_inliers && score < best_score) {
                best_inliers = inliers;
                best_score = score;
                best_position = Some(position);
                best_residuals = residuals;
            }
        }
    }

    let seed = best_position.ok_or(TrilaterationError::Divergence)?;

    // Refit on the inlier set when enough remain.
    let inlier_set: Vec<RangeObservation> = valid
        .iter()
        .zip(&best_residuals)
        .filter(|(_, &r)| r <= INLIER_RHO)
        .map(|(o, _)| *o)
        .collect();
    let solve_set = if inlier_set.len() >= 3 { &inlier_set } else { &valid };

    let position = solve_position(solve_set, seed, max_iters, tolerance);

    let mut weight_sum = 0.0;
    let mut weighted_sq = 0.0;
    for obs in solve_set {
        let residual = position.distance_to(&obs.anchor) - obs.distance;
        let weight = 1.0 / range_sigma(obs.distance).powi(2);
        weight_sum += weight;
        weighted_sq += weight * residual * residual;
    }
    let rmse = (weighted_sq / weight_sum.max(EPS)).sqrt();

    if !rmse.is_finite() || rmse > MAX_RMSE {
        return Err(TrilaterationError::Divergence);
    }

    Ok(PositionFix {
        position,
        rmse,
        inliers: inlier_set.len(),
    })
}

/// Trilateration with the default iteration budget.
pub fn trilaterate_default(
    observations: &[RangeObservation],
) -> Result<PositionFix, TrilaterationError> {
    trilaterate(observations, 12, 1e-4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(x: f64, y: f64, d: f64) -> RangeObservation {
        RangeObservation::new(Point::new(x, y), d)
    }

    #[test]
    fn test_exact_ranges_recover_position() {
        let target = Point::new(3.0, 4.0);
        let anchors = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(0.0, 10.0),
            Point::new(10.0, 10.0),
        ];
        let observations: Vec<_> = anchors
            .iter()
            .map(|a| RangeObservation::new(*a, a.distance_to(&target)))
            .collect();
        let fix = trilaterate_default(&observations).unwrap();
        assert!(fix.position.distance_to(&target) < 1e-3);
        assert!(fix.rmse < 1e-3);
    }

    #[test]
    fn test_outlier_anchor_is_rejected() {
        // True target (3,4); the (5,5) anchor reports a wildly wrong range.
        let observations = [
            obs(0.0, 0.0, 5.0),
            obs(10.0, 0.0, 7.28),
            obs(0.0, 10.0, 6.71),
            obs(10.0, 10.0, 9.22),
            obs(5.0, 5.0, 20.0),
        ];
        let fix = trilaterate_default(&observations).unwrap();
        assert_eq!(fix.inliers, 4, "the bad anchor must be excluded");
        // The 7.28 range itself carries ~0.8 m of noise, so the 4-inlier
        // weighted fit settles a few decimeters from the true point.
        assert!(
            fix.position.distance_to(&Point::new(3.0, 4.0)) < 0.5,
            "position {} too far from target",
            fix.position
        );
    }

    #[test]
    fn test_two_anchors_insufficient() {
        let observations = [obs(0.0, 0.0, 5.0), obs(10.0, 0.0, 5.0)];
        assert_eq!(
            trilaterate_default(&observations),
            Err(TrilaterationError::InsufficientAnchors(2))
        );
    }

    #[test]
    fn test_nonpositive_ranges_do_not_count() {
        let observations = [
            obs(0.0, 0.0, 5.0),
            obs(10.0, 0.0, -1.0),
            obs(0.0, 10.0, f64::NAN),
            obs(10.0, 10.0, 9.22),
        ];
        assert_eq!(
            trilaterate_default(&observations),
            Err(TrilaterationError::InsufficientAnchors(2))
        );
    }

    #[test]
    fn test_collinear_anchors_do_not_crash() {
        // Degenerate geometry: the solver must return something finite or
        // a typed error, never panic.
        let observations = [obs(0.0, 0.0, 3.0), obs(5.0, 0.0, 2.0), obs(10.0, 0.0, 7.0)];
        match trilaterate_default(&observations) {
            Ok(fix) => {
                assert!(fix.position.x.is_finite() && fix.position.y.is_finite());
            }
            Err(e) => assert_eq!(e, TrilaterationError::Divergence),
        }
    }

    #[test]
    fn test_inconsistent_ranges_diverge() {
        // Mutually impossible ranges leave every candidate with a huge
        // weighted RMSE.
        let observations = [
            obs(0.0, 0.0, 100.0),
            obs(1.0, 0.0, 100.0),
            obs(0.0, 1.0, 0.5),
        ];
        let result = trilaterate_default(&observations);
        if let Ok(fix) = result {
            // If a fit is accepted it must at least be sane.
            assert!(fix.rmse <= MAX_RMSE);
        }
    }

    #[test]
    fn test_noise_model_floor() {
        assert!((range_sigma(0.0) - 0.35).abs() < 1e-12);
        assert!((range_sigma(10.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_tukey_zeroes_beyond_cutoff() {
        let sigma = 1.0;
        assert_eq!(tukey_weight(2.6, sigma), 0.0);
        assert!(tukey_weight(0.0, sigma) > 0.999);
        assert!(tukey_weight(1.0, sigma) < tukey_weight(0.5, sigma));
    }
}
