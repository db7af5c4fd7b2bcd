//! RSSI to distance conversion
//!
//! Inverse log-distance path-loss model:
//! distance = 10 ^ ((cal_rssi - rssi) / (10 * absorption))

use tracing::debug;

/// Path-loss exponent used when the configured one is unusable
pub const DEFAULT_ABSORPTION: f64 = 3.5;

/// Absorption exponent with the `> 0` guard applied
#[inline]
pub fn effective_absorption(absorption: f64) -> f64 {
    if absorption.is_finite() && absorption > 0.0 {
        absorption
    } else {
        DEFAULT_ABSORPTION
    }
}

/// Distance in meters for a filtered RSSI against a 1 m calibration
pub fn distance(cal_rssi: f64, filtered_rssi: f64, absorption: f64) -> f64 {
    let exponent = (cal_rssi - filtered_rssi) / (10.0 * effective_absorption(absorption));
    let meters = 10f64.powf(exponent);
    if meters.is_finite() {
        meters.max(0.0)
    } else {
        f64::MAX
    }
}

/// Externally visible distance after guards
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceReading {
    pub meters: f64,
    /// Clamped to the max distance; treat as "left range"
    pub out_of_range: bool,
    /// Candidate was rejected as an outlier, previous reading kept
    pub held: bool,
}

/// Applies the max-distance clamp and the single-update skip-distance guard
#[derive(Debug, Clone, Default)]
pub struct DistanceGuard {
    accepted: Option<DistanceReading>,
    held_last: bool,
}

impl DistanceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a freshly computed distance.
    ///
    /// A jump larger than `skip_distance` from the last accepted reading is
    /// held back for one update; a second consecutive jump is accepted so a
    /// real move is followed one cycle late. `skip_distance <= 0` disables the
    /// guard and `max_distance <= 0` disables the clamp.
    pub fn update(&mut self, candidate: f64, skip_distance: f64, max_distance: f64) -> DistanceReading {
        let (meters, out_of_range) = if max_distance > 0.0 && candidate > max_distance {
            (max_distance, true)
        } else {
            (candidate.max(0.0), false)
        };

        if let Some(prev) = self.accepted {
            let jump = (meters - prev.meters).abs();
            if skip_distance > 0.0 && jump > skip_distance && !self.held_last {
                self.held_last = true;
                debug!(
                    previous = %format!("{:.2}", prev.meters),
                    candidate = %format!("{:.2}", meters),
                    "distance_outlier_held"
                );
                return DistanceReading { held: true, ..prev };
            }
        }

        let reading = DistanceReading { meters, out_of_range, held: false };
        self.accepted = Some(reading);
        self.held_last = false;
        reading
    }

    /// Last accepted reading; `None` until the first sample
    pub fn current(&self) -> Option<DistanceReading> {
        self.accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_meter_at_calibration() {
        let d = distance(-59.0, -59.0, 2.0);
        assert!((d - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ten_meters_for_20db_at_exponent_two() {
        let d = distance(-59.0, -79.0, 2.0);
        assert!((d - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_monotonic_in_rssi() {
        let mut last = f64::MAX;
        for rssi in -100..=-30 {
            let d = distance(-59.0, rssi as f64, 3.0);
            assert!(d < last, "distance not decreasing at {rssi}");
            assert!(d >= 0.0);
            last = d;
        }
    }

    #[test]
    fn test_bad_absorption_uses_default() {
        let expected = distance(-59.0, -75.0, DEFAULT_ABSORPTION);
        assert_eq!(distance(-59.0, -75.0, 0.0), expected);
        assert_eq!(distance(-59.0, -75.0, -2.0), expected);
        assert_eq!(distance(-59.0, -75.0, f64::NAN), expected);
    }

    #[test]
    fn test_guard_clamps_to_max() {
        let mut guard = DistanceGuard::new();
        let reading = guard.update(25.0, 0.0, 16.0);
        assert_eq!(reading.meters, 16.0);
        assert!(reading.out_of_range);

        let reading = guard.update(3.0, 0.0, 16.0);
        assert_eq!(reading.meters, 3.0);
        assert!(!reading.out_of_range);
    }

    #[test]
    fn test_guard_holds_single_jump() {
        let mut guard = DistanceGuard::new();
        assert_eq!(guard.current(), None);
        guard.update(1.0, 0.5, 0.0);

        let held = guard.update(4.0, 0.5, 0.0);
        assert!(held.held);
        assert_eq!(held.meters, 1.0);

        // Same trend next cycle is accepted
        let accepted = guard.update(4.1, 0.5, 0.0);
        assert!(!accepted.held);
        assert_eq!(accepted.meters, 4.1);
    }

    #[test]
    fn test_guard_small_moves_pass() {
        let mut guard = DistanceGuard::new();
        guard.update(1.0, 0.5, 0.0);
        assert_eq!(guard.update(1.3, 0.5, 0.0).meters, 1.3);
        assert_eq!(guard.update(1.6, 0.5, 0.0).meters, 1.6);
    }

    #[test]
    fn test_guard_disabled() {
        let mut guard = DistanceGuard::new();
        guard.update(1.0, 0.0, 0.0);
        assert_eq!(guard.update(9.0, 0.0, 0.0).meters, 9.0);
    }
}
