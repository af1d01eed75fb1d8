//! Adaptive Kalman bank (C1): one 2-state filter per signal path.
//!
//! Each path tracks `[rssi, rssi_rate]` under a constant-velocity model.
//! The covariance update uses the Joseph form to stay symmetric and
//! non-negative under finite precision, and an innovation z-score gate
//! temporarily boosts the process noise so abrupt environmental shifts are
//! tracked within a couple of samples without destabilizing steady state.

use std::collections::{HashMap, VecDeque};

use nalgebra::{Matrix2, SymmetricEigen, Vector2};

use senseye_common::{FilterConfig, Measurement, NodeId, SignalKind};

/// Variance floor for the innovation variance `S`.
const S_FLOOR: f64 = 1e-9;
/// Initial variance on both state components.
const INITIAL_VARIANCE: f64 = 100.0;

/// Output of one filter step.
#[derive(Debug, Clone, Copy)]
pub struct FilterOutput {
    /// Smoothed RSSI (dBm) or distance, depending on the path kind
    pub filtered: f64,
    /// Innovation `y = z − Hx⁻`
    pub innovation: f64,
    /// Innovation variance `S`
    pub innovation_var: f64,
}

/// Per-path filter state.
#[derive(Debug, Clone)]
pub struct PathState {
    mean: Vector2<f64>,
    cov: Matrix2<f64>,
    last_update: f64,
    last_kind: SignalKind,
    history: VecDeque<f64>,
    window: usize,
    innovation: f64,
    innovation_var: f64,
    last_snr: Option<f64>,
}

impl PathState {
    fn new(measurement: &Measurement, window: usize) -> Self {
        let mut history = VecDeque::with_capacity(window);
        history.push_back(measurement.value);
        Self {
            mean: Vector2::new(measurement.value, 0.0),
            cov: Matrix2::identity() * INITIAL_VARIANCE,
            last_update: measurement.timestamp,
            last_kind: measurement.kind,
            history,
            window,
            innovation: 0.0,
            innovation_var: INITIAL_VARIANCE,
            last_snr: measurement.snr,
        }
    }

    /// Process covariance for a step of `dt` seconds.
    fn process_noise(dt: f64, q: f64) -> Matrix2<f64> {
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let dt4 = dt3 * dt;
        Matrix2::new(dt4 / 4.0, dt3 / 2.0, dt3 / 2.0, dt2) * q
    }

    /// Predicted state `dt` seconds ahead without mutating the filter.
    pub fn predict_ahead(&self, dt: f64, q: f64) -> (Vector2<f64>, Matrix2<f64>) {
        let f = Matrix2::new(1.0, dt, 0.0, 1.0);
        let mean = f * self.mean;
        let cov = f * self.cov * f.transpose() + Self::process_noise(dt, q);
        (mean, cov)
    }

    /// Applies one measurement. Returns `None` for out-of-order samples
    /// older than the last applied one.
    fn update(&mut self, measurement: &Measurement, config: &FilterConfig) -> Option<FilterOutput> {
        if measurement.timestamp < self.last_update {
            return None;
        }
        let dt = measurement.timestamp - self.last_update;
        self.last_update = measurement.timestamp;
        self.last_kind = measurement.kind;
        if measurement.snr.is_some() {
            self.last_snr = measurement.snr;
        }

        let r = measurement_noise(measurement.kind, config);
        let q = Self::process_noise(dt, config.process_noise);

        // Predict.
        let f = Matrix2::new(1.0, dt, 0.0, 1.0);
        let mean_pred = f * self.mean;
        let mut cov_pred = f * self.cov * f.transpose() + q;

        // Innovation.
        let z = measurement.value;
        let y = z - mean_pred.x;
        let mut s = (cov_pred[(0, 0)] + r).max(S_FLOOR);

        // Adaptive jump handling: a large z-score means the environment
        // shifted faster than the model, so the step gets extra process
        // noise instead of lagging for many samples.
        if y.abs() / s.sqrt() > config.jump_zscore {
            cov_pred += q * (config.jump_scale - 1.0);
            s = (cov_pred[(0, 0)] + r).max(S_FLOOR);
        }

        // Gain and Joseph-form update.
        let k = Vector2::new(cov_pred[(0, 0)] / s, cov_pred[(1, 0)] / s);
        self.mean = mean_pred + k * y;

        let i_kh = Matrix2::identity() - k * Vector2::new(1.0, 0.0).transpose();
        let cov = i_kh * cov_pred * i_kh.transpose() + (k * k.transpose()) * r;
        self.cov = sanitize_covariance(cov);

        self.innovation = y;
        self.innovation_var = s;

        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(self.mean.x);

        Some(FilterOutput {
            filtered: self.mean.x,
            innovation: y,
            innovation_var: s,
        })
    }

    /// Smoothed value (RSSI or distance).
    pub fn filtered(&self) -> f64 {
        self.mean.x
    }

    /// Smoothed rate of change.
    pub fn rate(&self) -> f64 {
        self.mean.y
    }

    /// Current covariance.
    pub fn covariance(&self) -> Matrix2<f64> {
        self.cov
    }

    /// Last innovation.
    pub fn innovation(&self) -> f64 {
        self.innovation
    }

    /// Last innovation variance.
    pub fn innovation_var(&self) -> f64 {
        self.innovation_var
    }

    /// Signal kind of the last applied measurement.
    pub fn kind(&self) -> SignalKind {
        self.last_kind
    }

    /// Matched-filter SNR of the most recent acoustic sample, if any.
    pub fn last_snr(&self) -> Option<f64> {
        self.last_snr
    }

    /// Timestamp of the last applied measurement.
    pub fn last_update(&self) -> f64 {
        self.last_update
    }

    /// Number of samples currently in the motion window.
    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    /// Variance of the filtered values in the motion window.
    pub fn window_variance(&self) -> f64 {
        let n = self.history.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.history.iter().sum::<f64>() / n as f64;
        self.history
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n as f64
    }
}

fn measurement_noise(kind: SignalKind, config: &FilterConfig) -> f64 {
    match kind {
        SignalKind::Wifi => config.measurement_noise_wifi,
        SignalKind::Ble => config.measurement_noise_ble,
        SignalKind::Acoustic => config.measurement_noise_acoustic,
    }
}

/// Re-symmetrizes the covariance and clips negative eigenvalues to zero.
fn sanitize_covariance(cov: Matrix2<f64>) -> Matrix2<f64> {
    let sym = (cov + cov.transpose()) * 0.5;
    // Cheap test first: a symmetric 2×2 is PSD iff both diagonal entries
    // and the determinant are non-negative.
    if sym[(0, 0)] >= 0.0 && sym[(1, 1)] >= 0.0 && sym.determinant() >= 0.0 {
        return sym;
    }
    let eigen = SymmetricEigen::new(sym);
    let clipped = eigen.eigenvalues.map(|v| v.max(0.0));
    eigen.eigenvectors * Matrix2::from_diagonal(&clipped) * eigen.eigenvectors.transpose()
}

/// Collection of per-path filters keyed by `(source, target)`.
#[derive(Debug)]
pub struct FilterBank {
    paths: HashMap<(NodeId, NodeId), PathState>,
    config: FilterConfig,
}

impl FilterBank {
    /// Creates an empty bank.
    pub fn new(config: FilterConfig) -> Self {
        Self {
            paths: HashMap::new(),
            config,
        }
    }

    /// Applies one measurement to its path, creating the path on first
    /// observation. Returns `None` when the sample was discarded as
    /// out-of-order.
    pub fn apply(&mut self, measurement: &Measurement) -> Option<FilterOutput> {
        let key = (measurement.source.clone(), measurement.target.clone());
        match self.paths.get_mut(&key) {
            Some(path) => path.update(measurement, &self.config),
            None => {
                let path = PathState::new(measurement, self.config.window);
                let output = FilterOutput {
                    filtered: path.filtered(),
                    innovation: 0.0,
                    innovation_var: path.innovation_var(),
                };
                self.paths.insert(key, path);
                Some(output)
            }
        }
    }

    /// Looks up a path state.
    pub fn path(&self, source: &str, target: &str) -> Option<&PathState> {
        self.paths
            .get(&(source.to_string(), target.to_string()))
    }

    /// Iterates all `(source, target)` paths.
    pub fn paths(&self) -> impl Iterator<Item = (&(NodeId, NodeId), &PathState)> {
        self.paths.iter()
    }

    /// Purges paths silent for longer than the configured TTL.
    pub fn purge_stale(&mut self, now: f64) {
        let ttl = self.config.path_ttl_s;
        self.paths.retain(|_, path| now - path.last_update() <= ttl);
    }

    /// Number of live paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// True when no paths are tracked.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Filter configuration.
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(value: f64, t: f64) -> Measurement {
        Measurement {
            source: "self".into(),
            target: "ap".into(),
            kind: SignalKind::Wifi,
            timestamp: t,
            value,
            snr: None,
        }
    }

    fn spec_config() -> FilterConfig {
        FilterConfig {
            process_noise: 0.1,
            measurement_noise_wifi: 4.0,
            jump_zscore: 3.0,
            jump_scale: 100.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_observation_initializes() {
        let mut bank = FilterBank::new(spec_config());
        let out = bank.apply(&measurement(-50.0, 0.0)).unwrap();
        assert_eq!(out.filtered, -50.0);
        assert_eq!(out.innovation, 0.0);
        assert_eq!(bank.path("self", "ap").unwrap().rate(), 0.0);
    }

    #[test]
    fn test_jump_tracked_within_two_samples() {
        // Steady around −51 dBm, then an abrupt shift to −80: the adaptive
        // process-noise boost must complete the transition within two
        // samples of the jump.
        let mut bank = FilterBank::new(spec_config());
        let sequence = [-50.0, -52.0, -51.0, -80.0, -79.0, -80.0];
        let mut outputs = Vec::new();
        for (i, &z) in sequence.iter().enumerate() {
            outputs.push(bank.apply(&measurement(z, i as f64)).unwrap().filtered);
        }
        // Before the jump the filter hugs the steady level.
        assert!((outputs[2] + 51.1).abs() < 1.0, "steady output {}", outputs[2]);
        // At the jump sample most of the shift is already absorbed.
        assert!(outputs[3] < -70.0, "jump sample output {}", outputs[3]);
        // Two samples later the filter sits at the new level.
        assert!((outputs[4] + 80.0).abs() < 3.0, "post-jump output {}", outputs[4]);
        assert!((outputs[5] + 80.0).abs() < 3.0, "settled output {}", outputs[5]);
    }

    #[test]
    fn test_small_noise_is_smoothed() {
        let mut bank = FilterBank::new(spec_config());
        for (i, &z) in [-50.0, -51.0, -49.0, -50.5, -49.5].iter().enumerate() {
            bank.apply(&measurement(z, i as f64)).unwrap();
        }
        let filtered = bank.path("self", "ap").unwrap().filtered();
        assert!((filtered + 50.0).abs() < 1.5);
    }

    #[test]
    fn test_covariance_stays_psd() {
        let mut bank = FilterBank::new(spec_config());
        for i in 0..200 {
            let z = -55.0 + if i % 17 == 0 { -30.0 } else { (i % 5) as f64 };
            bank.apply(&measurement(z, i as f64 * 0.5)).unwrap();
            let cov = bank.path("self", "ap").unwrap().covariance();
            assert!((cov[(0, 1)] - cov[(1, 0)]).abs() < 1e-9, "asymmetric at {i}");
            let trace = cov[(0, 0)] + cov[(1, 1)];
            let det = cov.determinant();
            // Both eigenvalues non-negative ⇔ trace ≥ 0 and det ≥ −ε.
            assert!(trace >= 0.0, "negative trace at {i}");
            assert!(det >= -1e-9, "negative determinant at {i}: {det}");
        }
    }

    #[test]
    fn test_predict_only_grows_uncertainty() {
        let mut bank = FilterBank::new(spec_config());
        for (i, &z) in [-50.0, -51.0, -50.0].iter().enumerate() {
            bank.apply(&measurement(z, i as f64)).unwrap();
        }
        let path = bank.path("self", "ap").unwrap();
        let (mean, cov) = path.predict_ahead(2.0, 0.1);

        // E[x_{k+1}] = F x_k
        assert!((mean.x - (path.filtered() + 2.0 * path.rate())).abs() < 1e-12);
        assert!((mean.y - path.rate()).abs() < 1e-12);
        // Uncertainty grows in every state component without a measurement.
        let diff = cov - path.covariance();
        assert!(diff[(0, 0)] > 0.0 && diff[(1, 1)] > 0.0);
        // The prediction itself stays a valid covariance.
        assert!(cov.determinant() >= 0.0);
    }

    #[test]
    fn test_out_of_order_measurement_discarded() {
        let mut bank = FilterBank::new(spec_config());
        bank.apply(&measurement(-50.0, 10.0)).unwrap();
        bank.apply(&measurement(-55.0, 11.0)).unwrap();
        assert!(bank.apply(&measurement(-90.0, 9.0)).is_none());
        // State untouched by the stale sample.
        assert!(bank.path("self", "ap").unwrap().filtered() > -60.0);
    }

    #[test]
    fn test_ttl_purges_silent_paths() {
        let mut bank = FilterBank::new(FilterConfig {
            path_ttl_s: 60.0,
            ..spec_config()
        });
        bank.apply(&measurement(-50.0, 0.0)).unwrap();
        let mut other = measurement(-60.0, 50.0);
        other.target = "ap2".into();
        bank.apply(&other).unwrap();

        bank.purge_stale(70.0);
        assert!(bank.path("self", "ap").is_none());
        assert!(bank.path("self", "ap2").is_some());
    }

    #[test]
    fn test_window_variance_detects_motion() {
        let mut bank = FilterBank::new(spec_config());
        for (i, &z) in [-50.0, -50.2, -50.1, -49.9, -50.0].iter().enumerate() {
            bank.apply(&measurement(z, i as f64)).unwrap();
        }
        let quiet = bank.path("self", "ap").unwrap().window_variance();

        let mut bank = FilterBank::new(spec_config());
        for (i, &z) in [-50.0, -58.0, -47.0, -60.0, -45.0].iter().enumerate() {
            bank.apply(&measurement(z, i as f64)).unwrap();
        }
        let busy = bank.path("self", "ap").unwrap().window_variance();
        assert!(busy > quiet * 10.0);
    }

    #[test]
    fn test_ring_buffer_bounded_by_window() {
        let mut bank = FilterBank::new(FilterConfig {
            window: 4,
            ..spec_config()
        });
        for i in 0..20 {
            bank.apply(&measurement(-50.0 - i as f64, i as f64)).unwrap();
        }
        assert_eq!(bank.path("self", "ap").unwrap().sample_count(), 4);
    }
}
