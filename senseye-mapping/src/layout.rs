//! MDS self-localization of fixed nodes from pairwise distances.

use nalgebra::{DMatrix, SymmetricEigen};

use senseye_common::Point;
use senseye_fusion::DistanceMatrix;

/// Classical multidimensional scaling: distance matrix → 2-D positions.
///
/// Double-centers the squared distances (`B = −½ J D² J`), takes the two
/// largest eigenpairs of the symmetrized `B` (negative eigenvalues are
/// clipped to zero before the square root), and returns positions centered
/// at the origin with arbitrary rotation/reflection.
pub fn mds_positions(distances: &DistanceMatrix) -> Vec<Point> {
    let n = distances.node_ids.len();
    match n {
        0 => return Vec::new(),
        1 => return vec![Point::default()],
        2 => {
            let d = distances.distances[(0, 1)];
            return vec![Point::default(), Point::new(d, 0.0)];
        }
        _ => {}
    }

    let d2 = distances.distances.map(|d| d * d);

    // Double centering.
    let row_means: Vec<f64> = (0..n).map(|i| d2.row(i).sum() / n as f64).collect();
    let col_means: Vec<f64> = (0..n).map(|j| d2.column(j).sum() / n as f64).collect();
    let grand_mean = d2.sum() / (n * n) as f64;

    let mut b = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            b[(i, j)] = -0.5 * (d2[(i, j)] - row_means[i] - col_means[j] + grand_mean);
        }
    }
    // Symmetrize against floating-point drift.
    let b = (&b + b.transpose()) * 0.5;

    let eigen = SymmetricEigen::new(b);

    // Two largest eigenpairs.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| eigen.eigenvalues[j].total_cmp(&eigen.eigenvalues[i]));
    let (i1, i2) = (order[0], order[1]);
    let l1 = eigen.eigenvalues[i1].max(0.0).sqrt();
    let l2 = eigen.eigenvalues[i2].max(0.0).sqrt();

    (0..n)
        .map(|row| {
            Point::new(
                eigen.eigenvectors[(row, i1)] * l1,
                eigen.eigenvectors[(row, i2)] * l2,
            )
        })
        .collect()
}

/// Transforms MDS positions to match known anchor coordinates.
///
/// One anchor translates the layout; two anchors additionally rotate and,
/// when it reduces the fit error, reflect it, canonicalizing orientation.
/// Anchors beyond the second are ignored.
pub fn apply_anchors(positions: &mut [Point], anchors: &[(usize, Point)]) {
    if positions.is_empty() || anchors.is_empty() {
        return;
    }

    let mut anchors: Vec<(usize, Point)> = anchors
        .iter()
        .filter(|(idx, _)| *idx < positions.len())
        .copied()
        .collect();
    anchors.sort_by_key(|(idx, _)| *idx);
    if anchors.is_empty() {
        return;
    }

    if anchors.len() >= 2 {
        let (i, target_i) = anchors[0];
        let (j, target_j) = anchors[1];

        let src = Point::new(
            positions[j].x - positions[i].x,
            positions[j].y - positions[i].y,
        );
        let tgt = Point::new(target_j.x - target_i.x, target_j.y - target_i.y);

        if src.magnitude() > 1e-12 && tgt.magnitude() > 1e-12 {
            let theta = tgt.y.atan2(tgt.x) - src.y.atan2(src.x);
            let (sin_t, cos_t) = theta.sin_cos();

            // Rotate around anchor i.
            let pivot = positions[i];
            for p in positions.iter_mut() {
                let dx = p.x - pivot.x;
                let dy = p.y - pivot.y;
                *p = Point::new(cos_t * dx - sin_t * dy, sin_t * dx + cos_t * dy);
            }

            // Reflect across the anchor axis when it fits anchor j better.
            let rotated = Point::new(positions[j].x - positions[i].x, positions[j].y - positions[i].y);
            let err_plain = (rotated.x - tgt.x).hypot(rotated.y - tgt.y);
            let err_flip = (rotated.x - tgt.x).hypot(-rotated.y - tgt.y);
            if err_flip < err_plain {
                for p in positions.iter_mut() {
                    p.y = -p.y;
                }
            }

            // Translate anchor i onto its target.
            let offset = Point::new(target_i.x - positions[i].x, target_i.y - positions[i].y);
            for p in positions.iter_mut() {
                p.x += offset.x;
                p.y += offset.y;
            }
            return;
        }
    }

    // Single (or degenerate) anchor: translate only.
    let (i, target) = anchors[0];
    let offset = Point::new(target.x - positions[i].x, target.y - positions[i].y);
    for p in positions.iter_mut() {
        p.x += offset.x;
        p.y += offset.y;
    }
}
