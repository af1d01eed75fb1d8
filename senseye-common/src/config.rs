//! Runtime configuration for a senseye node.
//!
//! Configuration is assembled from built-in defaults, an optional TOML file
//! under the data directory, and CLI overrides (CLI wins). Validation is
//! fail-fast: an invalid port or acoustic mode aborts startup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{NodeId, Point};

/// Role of a node in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Stationary anchor with a (calibrated) position
    #[default]
    Fixed,
    /// Mobile node; excluded from anchor duties
    Mobile,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Fixed => write!(f, "fixed"),
            NodeRole::Mobile => write!(f, "mobile"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(NodeRole::Fixed),
            "mobile" => Ok(NodeRole::Mobile),
            _ => Err(format!("unknown node role: {s}")),
        }
    }
}

/// Acoustic ranging mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcousticMode {
    /// Acoustic ranging disabled
    #[default]
    Off,
    /// Chirp only when a calibration is explicitly requested
    OnDemand,
    /// Chirp on a schedule (`acoustic.interval_s`)
    Interval,
}

impl fmt::Display for AcousticMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcousticMode::Off => write!(f, "off"),
            AcousticMode::OnDemand => write!(f, "on-demand"),
            AcousticMode::Interval => write!(f, "interval"),
        }
    }
}

/// Parses the CLI acoustic argument: `off`, `on-demand`, or an interval
/// such as `10m`, `1h`, `90s`.
///
/// Returns the mode and, for interval mode, the interval in seconds.
pub fn parse_acoustic_arg(s: &str) -> Result<(AcousticMode, Option<f64>), Error> {
    let s = s.trim().to_lowercase();
    match s.as_str() {
        "off" => Ok((AcousticMode::Off, None)),
        "on-demand" => Ok((AcousticMode::OnDemand, None)),
        _ => {
            let secs = parse_interval(&s)
                .ok_or_else(|| Error::Config(format!("unknown acoustic mode: {s}")))?;
            Ok((AcousticMode::Interval, Some(secs)))
        }
    }
}

/// Parses an interval string like `10m`, `1h` or `45s` into seconds.
pub fn parse_interval(s: &str) -> Option<f64> {
    let s = s.trim().to_lowercase();
    let (digits, scale) = match s.as_bytes().last()? {
        b'm' => (&s[..s.len() - 1], 60.0),
        b'h' => (&s[..s.len() - 1], 3600.0),
        b's' => (&s[..s.len() - 1], 1.0),
        _ => (s.as_str(), 1.0),
    };
    let value: f64 = digits.parse().ok()?;
    (value > 0.0).then_some(value * scale)
}

/// Adaptive Kalman filter parameters (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Process noise scalar `q`
    pub process_noise: f64,
    /// Measurement variance for WiFi RSSI (dB²)
    pub measurement_noise_wifi: f64,
    /// Measurement variance for BLE RSSI (dB²)
    pub measurement_noise_ble: f64,
    /// Measurement variance for acoustic distance (m²)
    pub measurement_noise_acoustic: f64,
    /// Innovation z-score above which the process noise is boosted
    pub jump_zscore: f64,
    /// Process-noise boost factor applied on a detected jump
    pub jump_scale: f64,
    /// Seconds of silence after which a path state is purged
    pub path_ttl_s: f64,
    /// Ring buffer length for variance-based motion detection
    pub window: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.1,
            measurement_noise_wifi: 4.0,
            measurement_noise_ble: 6.0,
            measurement_noise_acoustic: 0.25,
            jump_zscore: 3.0,
            jump_scale: 100.0,
            path_ttl_s: 60.0,
            window: 10,
        }
    }
}

/// Local inference parameters (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// RSSI variance (dB²) above which a path counts as moving
    pub motion_threshold: f64,
    /// Indoor path-loss exponent
    pub pathloss_n: f64,
    /// Path-loss reference attenuation `A` (dB at 1 m)
    pub pathloss_a: f64,
    /// Free-space exponent used during calibration wall detection
    pub pathloss_n_freespace: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            motion_threshold: 2.0,
            pathloss_n: 2.5,
            pathloss_a: 45.0,
            pathloss_n_freespace: 2.0,
        }
    }
}

/// Gossip mesh parameters (C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// TCP port for the peer mesh
    pub port: u16,
    /// Belief broadcast rate (Hz)
    pub belief_rate: f64,
    /// Initial hop TTL on emitted beliefs
    pub hop_limit: u8,
    /// Seconds after which a peer belief is considered stale
    pub staleness_s: f64,
    /// Bounded capacity of the (origin, sequence) dedup table
    pub dedup_capacity: usize,
    /// Maximum accepted wire frame length in bytes
    pub max_frame_len: usize,
    /// Reconnect backoff base (seconds)
    pub reconnect_base_s: f64,
    /// Reconnect backoff cap (seconds)
    pub reconnect_max_s: f64,
    /// Static peers (`node_id@host:port`) used when no registry browses
    /// for us
    pub static_peers: Vec<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            port: 5483,
            belief_rate: 1.0,
            hop_limit: 3,
            staleness_s: 10.0,
            dedup_capacity: 4096,
            max_frame_len: 256 * 1024,
            reconnect_base_s: 1.0,
            reconnect_max_s: 30.0,
            static_peers: Vec::new(),
        }
    }
}

/// Consensus fusion parameters (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Disagreement penalty scale `s` in `1/(1 + s·v)`
    pub disagreement_scale: f64,
    /// Minimum anchors required for trilateration
    pub min_anchors: usize,
    /// Device ranges beyond this are ignored as anchors (meters)
    pub max_device_range: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            disagreement_scale: 0.5,
            min_anchors: 3,
            max_device_range: 40.0,
        }
    }
}

/// Static map construction parameters (C6 + calibration).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Tomography cell size (meters)
    pub resolution: f64,
    /// Link influence radius `r` for the tomography kernel (meters)
    pub influence_radius: f64,
    /// Ridge constant κ
    pub ridge_constant: f64,
    /// Excess attenuation above which a link suggests a wall (dB)
    pub wall_threshold_db: f64,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            resolution: 0.5,
            influence_radius: 0.5,
            ridge_constant: 0.05,
            wall_threshold_db: 3.0,
        }
    }
}

/// World-state and recalibration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Motion intensity decay rate λ (1/s)
    pub motion_decay: f64,
    /// Mean RSSI drift (dB) that triggers recalibration
    pub drift_threshold_db: f64,
    /// Minimum common devices required for the drift check
    pub drift_min_devices: usize,
    /// Seconds without a belief before a node is shown offline
    pub node_offline_s: f64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            motion_decay: 0.3,
            drift_threshold_db: 6.0,
            drift_min_devices: 3,
            node_offline_s: 15.0,
        }
    }
}

/// Acoustic chirp parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcousticConfig {
    /// Ranging mode
    pub mode: AcousticMode,
    /// Interval between scheduled chirp rounds (seconds)
    pub interval_s: f64,
    /// Audio sample rate (Hz)
    pub sample_rate: u32,
    /// Chirp duration (seconds)
    pub chirp_duration: f64,
    /// Ping/pong round-trip timeout (seconds)
    pub exchange_timeout_s: f64,
}

impl Default for AcousticConfig {
    fn default() -> Self {
        Self {
            mode: AcousticMode::Off,
            interval_s: 600.0,
            sample_rate: 48_000,
            chirp_duration: 0.01,
            exchange_timeout_s: 5.0,
        }
    }
}

/// Full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenseyeConfig {
    /// Stable node identifier
    pub node_id: NodeId,
    /// Human-readable name (defaults to the node id)
    pub node_name: String,
    /// Node role
    pub role: NodeRole,
    /// Known position for fixed anchor nodes
    pub position: Option<Point>,
    /// Pipeline cycle interval (seconds)
    pub scan_interval_s: f64,
    /// Data directory (floorplan + config overrides)
    pub data_dir: PathBuf,
    /// Kalman filter parameters
    pub filter: FilterConfig,
    /// Inference parameters
    pub inference: InferenceConfig,
    /// Mesh parameters
    pub mesh: MeshConfig,
    /// Fusion parameters
    pub fusion: FusionConfig,
    /// Mapping parameters
    pub mapping: MappingConfig,
    /// World-state parameters
    pub world: WorldConfig,
    /// Acoustic parameters
    pub acoustic: AcousticConfig,
}

impl Default for SenseyeConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            node_id: random_node_id(),
            role: NodeRole::Fixed,
            position: None,
            scan_interval_s: 1.0,
            data_dir: default_data_dir(),
            filter: FilterConfig::default(),
            inference: InferenceConfig::default(),
            mesh: MeshConfig::default(),
            fusion: FusionConfig::default(),
            mapping: MappingConfig::default(),
            world: WorldConfig::default(),
            acoustic: AcousticConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".senseye")
}

fn random_node_id() -> NodeId {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect()
}

impl SenseyeConfig {
    /// Path of the persisted floorplan under the data directory.
    pub fn floorplan_path(&self) -> PathBuf {
        self.data_dir.join("floorplan.json")
    }

    /// Path of the optional TOML override file under the data directory.
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Validates the configuration, failing fast on invalid values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node_id must not be empty".into()));
        }
        if self.mesh.port == 0 {
            return Err(Error::Config("mesh.port must be non-zero".into()));
        }
        if self.scan_interval_s <= 0.0 {
            return Err(Error::Config("scan_interval_s must be positive".into()));
        }
        if self.mesh.belief_rate <= 0.0 {
            return Err(Error::Config("mesh.belief_rate must be positive".into()));
        }
        if self.mesh.dedup_capacity == 0 {
            return Err(Error::Config("mesh.dedup_capacity must be non-zero".into()));
        }
        if self.acoustic.mode == AcousticMode::Interval && self.acoustic.interval_s <= 0.0 {
            return Err(Error::Config(
                "acoustic.interval_s must be positive in interval mode".into(),
            ));
        }
        if self.filter.window < 2 {
            return Err(Error::Config("filter.window must be at least 2".into()));
        }
        if self.mapping.resolution <= 0.0 {
            return Err(Error::Config("mapping.resolution must be positive".into()));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file and validates it.
///
/// A missing file yields the defaults; a malformed file is an error.
pub fn load_and_validate_config(path: &Path) -> Result<SenseyeConfig, Error> {
    let mut config: SenseyeConfig = if path.exists() {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)?
    } else {
        SenseyeConfig::default()
    };
    if config.node_name.is_empty() {
        config.node_name = config.node_id.clone();
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SenseyeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("10m"), Some(600.0));
        assert_eq!(parse_interval("1h"), Some(3600.0));
        assert_eq!(parse_interval("45s"), Some(45.0));
        assert_eq!(parse_interval("90"), Some(90.0));
        assert_eq!(parse_interval("0m"), None);
        assert_eq!(parse_interval("bogus"), None);
    }

    #[test]
    fn test_parse_acoustic_arg() {
        assert_eq!(parse_acoustic_arg("off").unwrap(), (AcousticMode::Off, None));
        assert_eq!(
            parse_acoustic_arg("on-demand").unwrap(),
            (AcousticMode::OnDemand, None)
        );
        assert_eq!(
            parse_acoustic_arg("10m").unwrap(),
            (AcousticMode::Interval, Some(600.0))
        );
        assert!(parse_acoustic_arg("sometimes").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut config = SenseyeConfig::default();
        config.mesh.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_interval_mode() {
        let mut config = SenseyeConfig::default();
        config.acoustic.mode = AcousticMode::Interval;
        config.acoustic.interval_s = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_and_validate_config(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.mesh.port, 5483);
    }

    #[test]
    fn test_load_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "node_id = \"kitchen\"\nrole = \"mobile\"\n\n[mesh]\nport = 7000\n",
        )
        .unwrap();
        let config = load_and_validate_config(&path).unwrap();
        assert_eq!(config.node_id, "kitchen");
        assert_eq!(config.role, NodeRole::Mobile);
        assert_eq!(config.mesh.port, 7000);
        // Untouched sections keep defaults
        assert_eq!(config.filter.window, 10);
    }

    #[test]
    fn test_load_malformed_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mesh = [not toml").unwrap();
        assert!(load_and_validate_config(&path).is_err());
    }
}
