//! Per-zone motion intensity with exponential decay.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use senseye_protocol::ZoneBelief;

/// Intensity below which a zone is considered quiet again.
const QUIET_FLOOR: f64 = 0.01;

/// Decayed per-zone motion intensities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionState {
    /// Zone name → intensity in [0, 1]
    pub zone_motion: BTreeMap<String, f64>,
    /// Zone name → last observation timestamp
    pub last_updated: BTreeMap<String, f64>,
}

impl MotionState {
    /// Applies exponential decay over `dt` seconds, then merges new zone
    /// observations: `I ← max(I·e^(−λ·dt), P_motion)`.
    pub fn update(
        &mut self,
        zone_beliefs: &BTreeMap<String, ZoneBelief>,
        dt: f64,
        decay: f64,
        now: f64,
    ) {
        let factor = (-decay * dt.max(0.0)).exp();
        for intensity in self.zone_motion.values_mut() {
            *intensity *= factor;
            if *intensity < QUIET_FLOOR {
                *intensity = 0.0;
            }
        }

        for (zone, belief) in zone_beliefs {
            let current = self.zone_motion.get(zone).copied().unwrap_or(0.0);
            self.zone_motion
                .insert(zone.clone(), current.max(belief.motion_prob));
            self.last_updated.insert(zone.clone(), now);
        }
    }

    /// Current intensity of a zone.
    pub fn intensity(&self, zone: &str) -> f64 {
        self.zone_motion.get(zone).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(motion: f64) -> ZoneBelief {
        ZoneBelief {
            occupied_prob: 0.5,
            motion_prob: motion,
        }
    }

    #[test]
    fn test_new_observation_raises_intensity() {
        let mut state = MotionState::default();
        let beliefs = BTreeMap::from([("hall".to_string(), zone(0.8))]);
        state.update(&beliefs, 1.0, 0.3, 100.0);
        assert!((state.intensity("hall") - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_decay_without_observation() {
        let mut state = MotionState::default();
        state.update(&BTreeMap::from([("hall".to_string(), zone(1.0))]), 0.0, 0.3, 100.0);
        state.update(&BTreeMap::new(), 2.0, 0.3, 102.0);
        let expected = (-0.3f64 * 2.0).exp();
        assert!((state.intensity("hall") - expected).abs() < 1e-9);
    }

    #[test]
    fn test_observation_keeps_maximum() {
        let mut state = MotionState::default();
        state.update(&BTreeMap::from([("hall".to_string(), zone(0.9))]), 0.0, 0.3, 100.0);
        // A weaker observation must not lower a fresher, stronger intensity.
        state.update(&BTreeMap::from([("hall".to_string(), zone(0.2))]), 0.1, 0.3, 100.1);
        assert!(state.intensity("hall") > 0.8);
    }

    #[test]
    fn test_near_zero_clamps_to_quiet() {
        let mut state = MotionState::default();
        state.update(&BTreeMap::from([("hall".to_string(), zone(0.05))]), 0.0, 0.3, 100.0);
        state.update(&BTreeMap::new(), 30.0, 0.3, 130.0);
        assert_eq!(state.intensity("hall"), 0.0);
    }
}
