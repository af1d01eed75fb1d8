//! Inverse-variance consensus fusion of local and peer beliefs (C4).
//!
//! Every scalar is combined as a precision-weighted mean under the shared
//! confidence contract. Agreement between contributors raises the fused
//! confidence above any individual contribution; disagreement on link
//! attenuation is penalized by `1/(1 + s·v)` where `v` is the weighted
//! variance of the contributions.

use std::collections::BTreeSet;

use senseye_protocol::{Belief, DeviceBelief, LinkBelief, ZoneBelief};

use crate::confidence::{base_confidence, clamp_confidence, precision, WeightedMean};

/// Fuses the local belief with peer beliefs.
///
/// The caller is responsible for passing only the latest non-stale belief
/// per origin; ordering within the slice is irrelevant. The fused belief
/// keeps the local node's identity, timestamp and sequence number.
pub fn fuse_beliefs(local: &Belief, peers: &[Belief], disagreement_scale: f64) -> Belief {
    if peers.is_empty() {
        return local.clone();
    }

    let mut fused = Belief::new(local.node_id.clone(), local.timestamp, local.sequence_number);
    fused.hop_count = local.hop_count;

    let all: Vec<&Belief> = std::iter::once(local).chain(peers.iter()).collect();

    // Links
    let link_keys: BTreeSet<_> = all.iter().flat_map(|b| b.links.keys().cloned()).collect();
    for key in link_keys {
        let contributions: Vec<&LinkBelief> =
            all.iter().filter_map(|b| b.links.get(&key)).collect();
        fused
            .links
            .insert(key, fuse_link(&contributions, disagreement_scale));
    }

    // Devices
    let device_ids: BTreeSet<_> = all.iter().flat_map(|b| b.devices.keys().cloned()).collect();
    for id in device_ids {
        let contributions: Vec<&DeviceBelief> =
            all.iter().filter_map(|b| b.devices.get(&id)).collect();
        fused.devices.insert(id, fuse_device(&contributions));
    }

    // Zones
    let zone_ids: BTreeSet<_> = all.iter().flat_map(|b| b.zones.keys().cloned()).collect();
    for id in zone_ids {
        let contributions: Vec<&ZoneBelief> =
            all.iter().filter_map(|b| b.zones.get(&id)).collect();
        fused.zones.insert(id, fuse_zone(&contributions));
    }

    // Acoustic ranges: keep the local node's own measurements.
    fused.acoustic_ranges = local.acoustic_ranges.clone();

    fused
}

fn fuse_link(contributions: &[&LinkBelief], disagreement_scale: f64) -> LinkBelief {
    let mut attenuation = WeightedMean::new();
    let mut motion = WeightedMean::new();
    for link in contributions {
        let pi = precision(link.confidence);
        attenuation.add(link.attenuation_db, pi);
        motion.add(link.motion_prob, pi);
    }

    let c_base = base_confidence(attenuation.total_weight());
    let penalty = 1.0 / (1.0 + disagreement_scale * attenuation.dispersion());

    LinkBelief {
        attenuation_db: attenuation.mean().unwrap_or(0.0),
        motion_prob: motion.mean().unwrap_or(0.0).clamp(0.0, 1.0),
        confidence: clamp_confidence(c_base * penalty),
    }
}

fn fuse_device(contributions: &[&DeviceBelief]) -> DeviceBelief {
    let mut rssi = WeightedMean::new();
    let mut distance = WeightedMean::new();
    let mut moving = WeightedMean::new();
    for device in contributions {
        let pi = precision(device.confidence);
        rssi.add(device.rssi_dbm, pi);
        // Far-range RSSI distances are noisy; squash them quadratically so a
        // distant observer cannot dominate the fused range.
        let range_weight = pi / device.distance_m.max(1.0).powi(2);
        distance.add(device.distance_m, range_weight);
        moving.add(if device.moving { 1.0 } else { 0.0 }, pi);
    }

    DeviceBelief {
        rssi_dbm: rssi.mean().unwrap_or(0.0),
        distance_m: distance.mean().unwrap_or(0.1).max(0.1),
        moving: moving.mean().unwrap_or(0.0) > 0.5,
        confidence: clamp_confidence(base_confidence(rssi.total_weight())),
    }
}

/// Derived confidence of a zone contribution: certainty grows with the
/// distance of either probability from 0.5.
fn zone_confidence(zone: &ZoneBelief) -> f64 {
    let spread = (zone.occupied_prob - 0.5)
        .abs()
        .max((zone.motion_prob - 0.5).abs());
    (0.2 + 0.8 * 2.0 * spread).clamp(0.05, 0.99)
}

fn fuse_zone(contributions: &[&ZoneBelief]) -> ZoneBelief {
    let mut occupied = WeightedMean::new();
    let mut motion = WeightedMean::new();
    for zone in contributions {
        let pi = precision(zone_confidence(zone));
        occupied.add(zone.occupied_prob, pi);
        motion.add(zone.motion_prob, pi);
    }

    ZoneBelief {
        occupied_prob: occupied.mean().unwrap_or(0.0).clamp(0.0, 1.0),
        motion_prob: motion.mean().unwrap_or(0.0).clamp(0.0, 1.0),
    }
}
