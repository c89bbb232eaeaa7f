//! Emitter sensor fusion — pure computation layer.
//!
//! Takes one raw [`SensorSnapshot`] per transmit tick and derives the
//! beacon flags and position fields. No async, no I/O, no platform types
//! beyond the sample structs: the whole module is unit-testable with
//! recorded or synthetic data.
//!
//! Derivations per tick:
//! - motion: accel magnitude departs 1 g by > 0.1 g (gyro > 0.5 rad/s as
//!   fallback when no accelerometer)
//! - fall: free-fall + impact in the recent accel window, plus a lying
//!   posture on the current sample; latched for the cooldown once raised
//! - unstable environment: sustained high, erratic rotation (gyro window
//!   mean > 1 rad/s and variance > 0.5)
//! - stationary: the instantaneous inverse of motion
//! - gps_valid: fix present and accuracy inside the configured bound;
//!   coordinates are zeroed when invalid, never back-filled from cache
//!   (the receiver retains last-known GPS, not the emitter)

use std::collections::VecDeque;

use phoenix_proto::FlagStates;

use crate::config::EmitterConfig;
use crate::platform::SensorSnapshot;

/// Accel magnitudes retained for fall detection.
const ACCEL_WINDOW_N: usize = 10;
/// Fall detection arms once this many accel samples exist.
const ACCEL_ARM_N: usize = 5;
/// Gyro magnitudes retained for unstable-environment detection.
const GYRO_WINDOW_N: usize = 20;
/// Unstable-environment detection arms at this many gyro samples.
const GYRO_ARM_N: usize = 10;

/// Motion when |accel magnitude - 1 g| exceeds this.
const MOTION_ACCEL_BAND_G: f64 = 0.1;
/// Motion (no accelerometer) when gyro magnitude exceeds this.
const MOTION_GYRO_RAD_S: f64 = 0.5;

/// Any window sample below this counts as free-fall.
const FREE_FALL_G: f64 = 0.5;
/// Any window sample above this counts as impact.
const IMPACT_G: f64 = 2.5;
/// Lying posture: |z| within this of 1 g...
const POSTURE_Z_BAND_G: f64 = 0.3;
/// ...and |x|, |y| below this.
const POSTURE_XY_MAX_G: f64 = 0.5;

/// Unstable environment: window mean above this...
const UNSTABLE_MEAN_RAD_S: f64 = 1.0;
/// ...and window variance above this.
const UNSTABLE_VARIANCE: f64 = 0.5;

/// Battery fraction below which the low-battery flag is set.
const LOW_BATTERY_FRACTION: f64 = 0.20;

/// Payload altitude bounds, metres MSL. The codec does not clamp; this
/// layer does.
const ALTITUDE_MIN_M: f64 = -500.0;
const ALTITUDE_MAX_M: f64 = 9000.0;

/// Per-tick fusion result, ready to become beacon fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionOutput {
    pub flags: FlagStates,
    /// Percent, 0..=100 (0 when the battery source is absent/unknown).
    pub battery_pct: f32,
    pub relative_altitude_cm: f32,
    /// Degrees; 0.0 when gps_valid is false.
    pub latitude: f32,
    /// Degrees; 0.0 when gps_valid is false.
    pub longitude: f32,
    /// Metres, clamped to the payload range; 0.0 when gps_valid is false.
    pub altitude_msl_m: f32,
}

pub struct SensorFusion {
    gps_valid_max_m: f64,
    fall_cooldown_ms: u64,

    accel_window: VecDeque<f64>,
    gyro_window: VecDeque<f64>,

    /// Baseline captured from the first altimeter reading.
    start_altitude_baro_m: Option<f64>,
    /// Baseline captured from the first GPS altitude.
    start_altitude_gps_m: Option<f64>,

    fall_until_ms: Option<u64>,
}

impl SensorFusion {
    pub fn new(cfg: &EmitterConfig) -> Self {
        Self {
            gps_valid_max_m: cfg.gps_valid_max_m,
            fall_cooldown_ms: cfg.fall_cooldown_ms,
            accel_window: VecDeque::with_capacity(ACCEL_WINDOW_N),
            gyro_window: VecDeque::with_capacity(GYRO_WINDOW_N),
            start_altitude_baro_m: None,
            start_altitude_gps_m: None,
            fall_until_ms: None,
        }
    }

    /// Fold one sensor snapshot into the windows and derive the beacon
    /// fields for this tick. `sos_activated` comes from the external SOS
    /// input, not from sensors.
    pub fn ingest(&mut self, snap: &SensorSnapshot, sos_activated: bool, now_ms: u64) -> FusionOutput {
        if let Some(accel) = snap.accel {
            self.accel_window.push_back(accel.magnitude());
            while self.accel_window.len() > ACCEL_WINDOW_N {
                self.accel_window.pop_front();
            }
        }
        if let Some(gyro) = snap.gyro {
            self.gyro_window.push_back(gyro.magnitude());
            while self.gyro_window.len() > GYRO_WINDOW_N {
                self.gyro_window.pop_front();
            }
        }

        let motion_detected = self.detect_motion(snap);
        let fall_detected = self.detect_fall(snap, now_ms);
        let unstable_environment = self.detect_unstable();

        let gps_valid = snap
            .location
            .map(|loc| loc.accuracy_m.is_finite() && loc.accuracy_m < self.gps_valid_max_m)
            .unwrap_or(false);
        let (latitude, longitude, altitude_msl_m) = match snap.location {
            Some(loc) if gps_valid => (
                loc.latitude as f32,
                loc.longitude as f32,
                loc.altitude_m.clamp(ALTITUDE_MIN_M, ALTITUDE_MAX_M) as f32,
            ),
            _ => (0.0, 0.0, 0.0),
        };

        let relative_altitude_cm = self.relative_altitude_cm(snap);

        let battery = snap.battery.unwrap_or_default();
        let low_battery = (0.0..LOW_BATTERY_FRACTION).contains(&battery.fraction);
        let battery_pct = if battery.fraction >= 0.0 {
            (battery.fraction.min(1.0) * 100.0) as f32
        } else {
            0.0
        };

        FusionOutput {
            flags: FlagStates {
                motion_detected,
                is_charging: battery.is_charging,
                sos_activated,
                low_battery,
                gps_valid,
                stationary: !motion_detected,
                fall_detected,
                unstable_environment,
            },
            battery_pct,
            relative_altitude_cm,
            latitude,
            longitude,
            altitude_msl_m,
        }
    }

    fn detect_motion(&self, snap: &SensorSnapshot) -> bool {
        if let Some(accel) = snap.accel {
            return (accel.magnitude() - 1.0).abs() > MOTION_ACCEL_BAND_G;
        }
        if let Some(gyro) = snap.gyro {
            return gyro.magnitude() > MOTION_GYRO_RAD_S;
        }
        false
    }

    /// Free-fall then impact in the window, lying posture now. Once raised,
    /// the flag is latched until `fall_until_ms` regardless of live input.
    fn detect_fall(&mut self, snap: &SensorSnapshot, now_ms: u64) -> bool {
        let latched = self.fall_until_ms.map_or(false, |until| now_ms < until);

        if self.accel_window.len() >= ACCEL_ARM_N && !latched {
            if let Some(accel) = snap.accel {
                let free_fall = self.accel_window.iter().any(|&m| m < FREE_FALL_G);
                let impact = self.accel_window.iter().any(|&m| m > IMPACT_G);
                let posture = (accel.z.abs() - 1.0).abs() <= POSTURE_Z_BAND_G
                    && accel.x.abs() < POSTURE_XY_MAX_G
                    && accel.y.abs() < POSTURE_XY_MAX_G;
                if free_fall && impact && posture {
                    self.fall_until_ms = Some(now_ms + self.fall_cooldown_ms);
                    return true;
                }
            }
        }

        latched
    }

    fn detect_unstable(&self) -> bool {
        if self.gyro_window.len() < GYRO_ARM_N {
            return false;
        }
        let n = self.gyro_window.len() as f64;
        let mean = self.gyro_window.iter().sum::<f64>() / n;
        let variance = self.gyro_window.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;
        mean > UNSTABLE_MEAN_RAD_S && variance > UNSTABLE_VARIANCE
    }

    /// Centimetres above the start altitude. Baselines are per source: the
    /// altimeter stream is session-relative while GPS altitude is MSL, so
    /// the two must never be subtracted from each other.
    fn relative_altitude_cm(&mut self, snap: &SensorSnapshot) -> f32 {
        if let Some(alt) = snap.altimeter {
            let start = *self.start_altitude_baro_m.get_or_insert(alt.relative_m);
            return ((alt.relative_m - start) * 100.0) as f32;
        }
        if let Some(loc) = snap.location {
            let start = *self.start_altitude_gps_m.get_or_insert(loc.altitude_m);
            return ((loc.altitude_m - start) * 100.0) as f32;
        }
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AccelSample, AltimeterSample, BatterySample, GyroSample, LocationSample};

    fn fusion() -> SensorFusion {
        SensorFusion::new(&EmitterConfig::default())
    }

    fn accel(x: f64, y: f64, z: f64) -> SensorSnapshot {
        SensorSnapshot { accel: Some(AccelSample { x, y, z }), ..SensorSnapshot::default() }
    }

    fn located(accuracy_m: f64) -> SensorSnapshot {
        SensorSnapshot {
            location: Some(LocationSample {
                latitude: 37.422,
                longitude: -122.084,
                altitude_m: 120.0,
                accuracy_m,
            }),
            ..SensorSnapshot::default()
        }
    }

    #[test]
    fn motion_from_accelerometer() {
        let mut f = fusion();
        assert!(!f.ingest(&accel(0.0, 0.0, 1.05), false, 0).flags.motion_detected);
        assert!(f.ingest(&accel(0.0, 0.0, 1.2), false, 0).flags.motion_detected);
        assert!(f.ingest(&accel(0.0, 0.0, 0.85), false, 0).flags.motion_detected);
    }

    #[test]
    fn motion_falls_back_to_gyro() {
        let mut f = fusion();
        let quiet = SensorSnapshot {
            gyro: Some(GyroSample { x: 0.1, y: 0.1, z: 0.1 }),
            ..SensorSnapshot::default()
        };
        let spinning = SensorSnapshot {
            gyro: Some(GyroSample { x: 0.5, y: 0.5, z: 0.5 }),
            ..SensorSnapshot::default()
        };
        assert!(!f.ingest(&quiet, false, 0).flags.motion_detected);
        assert!(f.ingest(&spinning, false, 0).flags.motion_detected);
        // No sensors at all: not moving
        assert!(!f.ingest(&SensorSnapshot::default(), false, 0).flags.motion_detected);
    }

    #[test]
    fn stationary_is_inverse_of_motion() {
        let mut f = fusion();
        let out = f.ingest(&accel(0.0, 0.0, 1.0), false, 0);
        assert!(out.flags.stationary && !out.flags.motion_detected);
        let out = f.ingest(&accel(0.0, 0.0, 1.5), false, 0);
        assert!(!out.flags.stationary && out.flags.motion_detected);
    }

    #[test]
    fn fall_pipeline_triggers_and_latches() {
        let mut f = fusion();
        // Free-fall then impact, ending lying flat
        let magnitudes = [1.0, 0.9, 0.3, 0.4, 3.1, 2.8, 1.0];
        let mut now = 0;
        for m in magnitudes {
            let out = f.ingest(&accel(0.0, 0.0, m), false, now);
            assert!(!out.flags.fall_detected || m == 1.0 && now > 0, "premature at m={m}");
            now += 100;
        }
        let out = f.ingest(&accel(0.1, 0.1, 1.0), false, now);
        assert!(out.flags.fall_detected);

        // Latched under quiescent sensors for the full cooldown
        let out = f.ingest(&accel(0.0, 0.0, 1.0), false, now + 59_000);
        assert!(out.flags.fall_detected);

        // Cleared once the deadline passes
        let out = f.ingest(&accel(0.0, 0.0, 1.0), false, now + 60_001);
        assert!(!out.flags.fall_detected);
    }

    #[test]
    fn fall_requires_posture() {
        let mut f = fusion();
        for m in [1.0, 0.9, 0.3, 0.4, 3.1, 2.8] {
            f.ingest(&accel(0.0, 0.0, m), false, 0);
        }
        // Window has free-fall and impact, but the device is upright-ish
        // on its side: |z| nowhere near 1 g
        let out = f.ingest(&accel(0.9, 0.1, 0.3), false, 700);
        assert!(!out.flags.fall_detected);
    }

    #[test]
    fn fall_not_armed_below_five_samples() {
        let mut f = fusion();
        f.ingest(&accel(0.0, 0.0, 0.3), false, 0);
        f.ingest(&accel(0.0, 0.0, 3.0), false, 100);
        let out = f.ingest(&accel(0.1, 0.1, 1.0), false, 200);
        assert!(!out.flags.fall_detected);
    }

    #[test]
    fn unstable_environment_from_gyro_statistics() {
        let mut f = fusion();
        let spin = |m: f64| SensorSnapshot {
            gyro: Some(GyroSample { x: 0.0, y: 0.0, z: m }),
            ..SensorSnapshot::default()
        };
        // Alternating 0.5 / 2.5 rad/s: mean 1.5, variance 1.0
        let mut out = f.ingest(&spin(0.5), false, 0);
        for i in 1..10 {
            out = f.ingest(&spin(if i % 2 == 0 { 0.5 } else { 2.5 }), false, i * 50);
        }
        assert!(out.flags.unstable_environment);

        // Steady high rotation: mean > 1 but variance ~0 — not unstable
        let mut f = fusion();
        let mut out = f.ingest(&spin(1.5), false, 0);
        for i in 1..10 {
            out = f.ingest(&spin(1.5), false, i * 50);
        }
        assert!(!out.flags.unstable_environment);
    }

    #[test]
    fn gps_gating_zeroes_invalid_coordinates() {
        let mut f = fusion();
        let out = f.ingest(&located(5.0), false, 0);
        assert!(out.flags.gps_valid);
        assert!((out.latitude - 37.422).abs() < 1e-4);
        assert!((out.altitude_msl_m - 120.0).abs() < 1e-4);

        let out = f.ingest(&located(250.0), false, 100);
        assert!(!out.flags.gps_valid);
        assert_eq!(out.latitude, 0.0);
        assert_eq!(out.longitude, 0.0);
        assert_eq!(out.altitude_msl_m, 0.0);

        let out = f.ingest(&located(f64::NAN), false, 200);
        assert!(!out.flags.gps_valid);
    }

    #[test]
    fn relative_altitude_prefers_altimeter() {
        let mut f = fusion();
        let baro = |rel: f64| SensorSnapshot {
            altimeter: Some(AltimeterSample { relative_m: rel }),
            ..SensorSnapshot::default()
        };
        assert_eq!(f.ingest(&baro(0.0), false, 0).relative_altitude_cm, 0.0);
        assert_eq!(f.ingest(&baro(2.5), false, 100).relative_altitude_cm, 250.0);
        assert_eq!(f.ingest(&baro(-1.0), false, 200).relative_altitude_cm, -100.0);
    }

    #[test]
    fn relative_altitude_from_gps_without_altimeter() {
        let mut f = fusion();
        let at_alt = |alt: f64| SensorSnapshot {
            location: Some(LocationSample {
                latitude: 0.0,
                longitude: 0.0,
                altitude_m: alt,
                accuracy_m: 5.0,
            }),
            ..SensorSnapshot::default()
        };
        assert_eq!(f.ingest(&at_alt(500.0), false, 0).relative_altitude_cm, 0.0);
        assert_eq!(f.ingest(&at_alt(498.0), false, 100).relative_altitude_cm, -200.0);
        // Neither source: zero
        assert_eq!(
            f.ingest(&SensorSnapshot::default(), false, 200).relative_altitude_cm,
            0.0
        );
    }

    #[test]
    fn battery_flags() {
        let mut f = fusion();
        let batt = |fraction: f64, is_charging: bool| SensorSnapshot {
            battery: Some(BatterySample { fraction, is_charging }),
            ..SensorSnapshot::default()
        };
        let out = f.ingest(&batt(0.87, false), false, 0);
        assert!(!out.flags.low_battery);
        assert_eq!(out.battery_pct, 87.0);

        let out = f.ingest(&batt(0.15, true), false, 0);
        assert!(out.flags.low_battery);
        assert!(out.flags.is_charging);

        // Unknown battery is not "low"
        let out = f.ingest(&batt(-1.0, false), false, 0);
        assert!(!out.flags.low_battery);
        assert_eq!(out.battery_pct, 0.0);
    }

    #[test]
    fn sos_passes_through() {
        let mut f = fusion();
        assert!(f.ingest(&SensorSnapshot::default(), true, 0).flags.sos_activated);
        assert!(!f.ingest(&SensorSnapshot::default(), false, 0).flags.sos_activated);
    }
}
