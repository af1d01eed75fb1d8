//! Local inference (C2): filtered paths → a confidence-annotated Belief.
//!
//! Motion comes from the variance of the filtered window; attenuation
//! compares the filtered RSSI against the log-distance expectation when
//! both endpoints have known positions; per-kind confidence formulas feed
//! the shared precision contract downstream.

use std::collections::BTreeMap;

use senseye_common::{InferenceConfig, NodeId, PairKey, Point, SignalKind};
use senseye_protocol::{Belief, DeviceBelief, LinkBelief, ZoneBelief};

use crate::filter::FilterBank;

/// Distance floor for RSSI-derived ranges (meters).
const MIN_DISTANCE: f64 = 0.1;
/// Average attenuation treated as full occlusion for zone occupancy (dB).
const OCCLUSION_DB: f64 = 20.0;
/// Matched-filter SNR mapped to zero acoustic confidence.
const SNR_FLOOR: f64 = 3.0;
/// Matched-filter SNR mapped to full acoustic confidence.
const SNR_CEIL: f64 = 15.0;

/// A zone definition: the links whose paths cross it.
#[derive(Debug, Clone)]
pub struct ZoneSpec {
    /// Zone name (room name from the floorplan)
    pub name: String,
    /// Links crossing this zone
    pub links: Vec<PairKey>,
}

/// Everything the inference step needs besides the filter bank.
#[derive(Debug)]
pub struct InferenceContext<'a> {
    /// This node's id
    pub node_id: &'a str,
    /// Known positions of fixed nodes
    pub node_positions: &'a BTreeMap<NodeId, Point>,
    /// Zone definitions
    pub zones: &'a [ZoneSpec],
    /// Inference parameters
    pub config: &'a InferenceConfig,
}

/// Expected RSSI at `distance` under the log-distance path-loss model:
/// `−(10·n·log₁₀(d) + A)`.
pub fn expected_rssi(distance: f64, n: f64, a: f64) -> f64 {
    if distance <= 0.0 {
        return 0.0;
    }
    -(10.0 * n * distance.log10() + a)
}

/// Inverts the path-loss model: `d = 10^((−rssi − A)/(10·n))`, floored at
/// 0.1 m.
pub fn distance_from_rssi(rssi: f64, n: f64, a: f64) -> f64 {
    let exponent = (-rssi - a) / (10.0 * n);
    10f64.powf(exponent).max(MIN_DISTANCE)
}

fn snr_confidence(snr: f64) -> f64 {
    ((snr - SNR_FLOOR) / (SNR_CEIL - SNR_FLOOR)).clamp(0.0, 1.0)
}

/// Produces this node's belief from the current filter bank state.
pub fn infer(
    bank: &FilterBank,
    ctx: &InferenceContext<'_>,
    timestamp: f64,
    sequence_number: u64,
    hop_limit: u8,
) -> Belief {
    let mut belief = Belief::new(ctx.node_id, timestamp, sequence_number);
    belief.hop_count = hop_limit;

    let window = bank.config().window as f64;
    let my_position = ctx.node_positions.get(ctx.node_id);

    for ((source, target), path) in bank.paths() {
        if source.as_str() != ctx.node_id {
            continue;
        }

        let moving = path.window_variance() > ctx.config.motion_threshold;
        let c_samples = (path.sample_count() as f64 / window).min(1.0);

        if path.kind() == SignalKind::Acoustic {
            // Acoustic paths carry a distance estimate directly.
            let c_snr = path.last_snr().map(snr_confidence).unwrap_or(0.0);
            let confidence = 0.4 * c_samples + 0.6 * c_snr;
            let distance = path.filtered().max(MIN_DISTANCE);
            belief.acoustic_ranges.insert(target.clone(), distance);
            belief.devices.insert(
                target.clone(),
                DeviceBelief {
                    rssi_dbm: 0.0,
                    distance_m: distance,
                    moving,
                    confidence,
                },
            );
            continue;
        }

        let rssi = path.filtered();
        let p_innov = 1.0 / (1.0 + path.innovation().abs() / 8.0);
        let confidence = c_samples * p_innov;

        // Link attenuation needs both endpoint positions.
        let attenuation_db = match (my_position, ctx.node_positions.get(target)) {
            (Some(mine), Some(theirs)) => {
                let dist = mine.distance_to(theirs);
                if dist > 0.0 {
                    let expected =
                        expected_rssi(dist, ctx.config.pathloss_n, ctx.config.pathloss_a);
                    (expected - rssi).max(0.0)
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        belief.links.insert(
            PairKey::new(ctx.node_id, target.as_str()),
            LinkBelief {
                attenuation_db,
                motion_prob: if moving { 1.0 } else { 0.0 },
                confidence,
            },
        );

        belief.devices.insert(
            target.clone(),
            DeviceBelief {
                rssi_dbm: rssi,
                distance_m: distance_from_rssi(rssi, ctx.config.pathloss_n, ctx.config.pathloss_a),
                moving,
                confidence,
            },
        );
    }

    // Zone inference over links crossing each zone.
    for zone in ctx.zones {
        let mut moving_links = 0usize;
        let mut attenuation_sum = 0.0;
        let mut link_count = 0usize;
        for key in &zone.links {
            let Some(link) = belief.links.get(key) else {
                continue;
            };
            link_count += 1;
            if link.motion_prob > 0.5 {
                moving_links += 1;
            }
            attenuation_sum += link.attenuation_db;
        }
        if link_count == 0 {
            continue;
        }
        let motion_prob = moving_links as f64 / link_count as f64;
        let avg_attenuation = attenuation_sum / link_count as f64;
        belief.zones.insert(
            zone.name.clone(),
            ZoneBelief {
                occupied_prob: (avg_attenuation / OCCLUSION_DB).min(1.0),
                motion_prob,
            },
        );
    }

    belief
}
