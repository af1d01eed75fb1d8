//! Confidence-weighted ridge tomography (C6).
//!
//! Radio Tomographic Imaging: the floorplan is gridded into cells, each
//! link contributes a row-normalized Gaussian kernel along its segment,
//! and the per-cell attenuation field is recovered from the whitened
//! normal equations with an adaptive ridge term. Ill-conditioned systems
//! degrade to a pseudoinverse solve; rank deficiency yields a typed error
//! so callers render an empty overlay instead of garbage.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use senseye_common::Point;

use crate::confidence::clamp_confidence;

/// Minimum ridge coefficient.
const ALPHA_MIN: f64 = 0.05;
/// Maximum ridge coefficient.
const ALPHA_MAX: f64 = 5.0;
/// Cap on the diagonal condition surrogate.
const COND_CAP: f64 = 1e12;

/// One link observation feeding the reconstruction.
#[derive(Debug, Clone, Copy)]
pub struct LinkSample {
    /// First endpoint position
    pub a: Point,
    /// Second endpoint position
    pub b: Point,
    /// Excess attenuation over free space (dB)
    pub excess_db: f64,
    /// Confidence of the fused link estimate
    pub confidence: f64,
}

/// Rectangular cell grid over the imaging bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    /// Minimum x of the imaged area (meters)
    pub x_min: f64,
    /// Minimum y of the imaged area (meters)
    pub y_min: f64,
    /// Maximum x of the imaged area (meters)
    pub x_max: f64,
    /// Maximum y of the imaged area (meters)
    pub y_max: f64,
    /// Cell edge length (meters)
    pub resolution: f64,
}

impl GridSpec {
    /// Creates a grid spec from bounds and resolution.
    pub fn new(bounds: (f64, f64, f64, f64), resolution: f64) -> Self {
        Self {
            x_min: bounds.0,
            y_min: bounds.1,
            x_max: bounds.2,
            y_max: bounds.3,
            resolution,
        }
    }

    /// Number of cell rows (along y).
    pub fn rows(&self) -> usize {
        (((self.y_max - self.y_min) / self.resolution).floor() as usize).max(1)
    }

    /// Number of cell columns (along x).
    pub fn cols(&self) -> usize {
        (((self.x_max - self.x_min) / self.resolution).floor() as usize).max(1)
    }

    /// Center of cell `(row, col)`.
    pub fn cell_center(&self, row: usize, col: usize) -> Point {
        Point::new(
            self.x_min + (col as f64 + 0.5) * self.resolution,
            self.y_min + (row as f64 + 0.5) * self.resolution,
        )
    }

    /// True when the bounds or resolution are degenerate.
    pub fn is_degenerate(&self) -> bool {
        self.x_max <= self.x_min || self.y_max <= self.y_min || self.resolution <= 0.0
    }
}

/// Reconstructed per-cell attenuation field.
#[derive(Debug, Clone)]
pub struct AttenuationField {
    /// Grid geometry
    pub spec: GridSpec,
    /// Cell values, `rows × cols`, rows along y
    pub values: DMatrix<f64>,
    /// Ridge coefficient used by the solve (0 when no solve ran)
    pub alpha: f64,
}

impl AttenuationField {
    /// An all-zero field over `spec`.
    pub fn empty(spec: GridSpec) -> Self {
        Self {
            values: DMatrix::zeros(spec.rows(), spec.cols()),
            spec,
            alpha: 0.0,
        }
    }

    /// True when every cell is zero.
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }

    /// Cells above `threshold` that are local maxima of their 4-neighborhood
    /// (morphological thinning), strongest first.
    pub fn peaks(&self, threshold: f64) -> Vec<(usize, usize, f64)> {
        let (rows, cols) = self.values.shape();
        let mut peaks = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let v = self.values[(r, c)];
                if v < threshold {
                    continue;
                }
                let mut is_peak = true;
                if r > 0 && self.values[(r - 1, c)] > v {
                    is_peak = false;
                }
                if r + 1 < rows && self.values[(r + 1, c)] > v {
                    is_peak = false;
                }
                if c > 0 && self.values[(r, c - 1)] > v {
                    is_peak = false;
                }
                if c + 1 < cols && self.values[(r, c + 1)] > v {
                    is_peak = false;
                }
                if is_peak {
                    peaks.push((r, c, v));
                }
            }
        }
        peaks.sort_by(|a, b| b.2.total_cmp(&a.2));
        peaks
    }
}

/// Tomography failure modes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TomographyError {
    /// `AᵀWA + αI` is rank deficient even for the pseudoinverse.
    #[error("normal equations are rank deficient")]
    IllConditioned,
}

/// Distance from a point to the segment `a`-`b`.
fn point_to_segment_distance(p: Point, a: Point, b: Point) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let seg_len_sq = dx * dx + dy * dy;
    if seg_len_sq == 0.0 {
        return p.distance_to(&a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / seg_len_sq).clamp(0.0, 1.0);
    let proj = Point::new(a.x + t * dx, a.y + t * dy);
    p.distance_to(&proj)
}

/// Builds the row-normalized influence matrix `A` (`n_links × n_cells`).
fn influence_matrix(links: &[LinkSample], spec: &GridSpec, radius: f64) -> DMatrix<f64> {
    let rows = spec.rows();
    let cols = spec.cols();
    let n_cells = rows * cols;
    let sigma_k = radius / 2.0;
    let denom = 2.0 * sigma_k * sigma_k;

    let mut a = DMatrix::zeros(links.len(), n_cells);
    for (i, link) in links.iter().enumerate() {
        let mut row_sum = 0.0;
        for r in 0..rows {
            for c in 0..cols {
                let d = point_to_segment_distance(spec.cell_center(r, c), link.a, link.b);
                if d <= radius {
                    let kernel = (-d * d / denom).exp();
                    a[(i, r * cols + c)] = kernel;
                    row_sum += kernel;
                }
            }
        }
        if row_sum > 0.0 {
            for j in 0..n_cells {
                a[(i, j)] /= row_sum;
            }
        }
    }
    a
}

/// Diagonal surrogate for the condition number of `AᵀWA`: the ratio of its
/// extreme positive diagonal entries, clamped to `[1, 1e12]`.
fn condition_surrogate(a: &DMatrix<f64>, w: &DVector<f64>) -> f64 {
    let n_cells = a.ncols();
    let mut max_diag = 0.0f64;
    let mut min_diag = f64::INFINITY;
    for j in 0..n_cells {
        let mut d = 0.0;
        for i in 0..a.nrows() {
            d += w[i] * a[(i, j)] * a[(i, j)];
        }
        if d > 0.0 {
            max_diag = max_diag.max(d);
            min_diag = min_diag.min(d);
        }
    }
    if max_diag == 0.0 || !min_diag.is_finite() {
        return COND_CAP;
    }
    (max_diag / min_diag).clamp(1.0, COND_CAP)
}

/// Adaptive ridge coefficient
/// `α = κ · (n_cells/n_links) · (1 + log₁₀ cond)`, clipped to `[0.05, 5.0]`.
fn adaptive_alpha(kappa: f64, n_cells: usize, n_links: usize, cond: f64) -> f64 {
    let raw = kappa * (n_cells as f64 / n_links as f64) * (1.0 + cond.log10());
    raw.clamp(ALPHA_MIN, ALPHA_MAX)
}

/// Reconstructs the per-cell attenuation field from fused link estimates.
///
/// Zero links yield an empty field without solving. The whitened normal
/// equations are solved by Cholesky; on failure the pseudoinverse is
/// tried, and rank deficiency surfaces as [`TomographyError::IllConditioned`].
pub fn reconstruct(
    links: &[LinkSample],
    spec: &GridSpec,
    influence_radius: f64,
    ridge_constant: f64,
) -> Result<AttenuationField, TomographyError> {
    if spec.is_degenerate() || links.is_empty() {
        return Ok(AttenuationField::empty(*spec));
    }

    let a = influence_matrix(links, spec, influence_radius);
    let n_cells = a.ncols();

    // W = diag(c_eff / (1 - c_eff)): the precision implied by each link's
    // confidence under the shared contract.
    let w = DVector::from_iterator(
        links.len(),
        links.iter().map(|l| {
            let c = clamp_confidence(l.confidence);
            c / (1.0 - c)
        }),
    );
    let b = DVector::from_iterator(links.len(), links.iter().map(|l| l.excess_db));

    let cond = condition_surrogate(&a, &w);
    let alpha = adaptive_alpha(ridge_constant, n_cells, links.len(), cond);

    // Whiten: Ā = W^{1/2} A, b̄ = W^{1/2} b.
    let sqrt_w = w.map(f64::sqrt);
    let mut a_bar = a;
    for i in 0..a_bar.nrows() {
        let s = sqrt_w[i];
        for j in 0..n_cells {
            a_bar[(i, j)] *= s;
        }
    }
    let b_bar = b.component_mul(&sqrt_w);

    let mut normal = a_bar.transpose() * &a_bar;
    for j in 0..n_cells {
        normal[(j, j)] += alpha;
    }
    let rhs = a_bar.transpose() * b_bar;

    let solution = match normal.clone().cholesky() {
        Some(chol) => chol.solve(&rhs),
        None => {
            tracing::debug!(alpha, "cholesky failed, falling back to pseudoinverse");
            let pinv = normal
                .pseudo_inverse(1e-12)
                .map_err(|_| TomographyError::IllConditioned)?;
            let solution = pinv * rhs;
            if solution.iter().any(|v| !v.is_finite()) {
                return Err(TomographyError::IllConditioned);
            }
            solution
        }
    };

    let rows = spec.rows();
    let cols = spec.cols();
    let mut values = DMatrix::zeros(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            values[(r, c)] = solution[r * cols + c].max(0.0);
        }
    }

    Ok(AttenuationField {
        spec: *spec,
        values,
        alpha,
    })
}
