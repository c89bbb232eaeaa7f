//! Precision-finding engine.
//!
//! Driven at the 250 ms UI tick over a read-only snapshot of the chosen
//! emitter record plus receiver-local location and compass samples.
//! Produces one [`Guidance`] frame per tick:
//!
//! - distance: log-distance path loss while the BLE link is fresh,
//!   Haversine to the beacon's (live or cached) coordinates with a short
//!   closing-speed prediction once it lapses, last-known otherwise
//! - proximity: here/near/medium/far with 15 cm hysteresis against moving
//!   to a farther level — closing transitions are instant, chatter at a
//!   boundary is not
//! - bearing: initial great-circle bearing minus the smoothed compass
//!   heading, held inside a 5° deadzone
//! - haptics: cadence table over the smoothed distance, gated on the time
//!   since the last pulse

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::FinderConfig;
use crate::error::PhoenixError;
use crate::geo::{circular_diff_deg, haversine_m, initial_bearing_deg, normalize_deg};
use crate::platform::{HapticPattern, LocationSample};
use crate::receiver::EmitterRecord;

/// UI tick cadence the finder is designed to be driven at (ms).
pub const FINDER_TICK_MS: u64 = 250;

/// Haptics go silent beyond this distance (m).
const HAPTIC_SILENCE_M: f64 = 3.0;
/// Prediction horizon for the first fallback computation (s).
const GPS_PREDICT_FIRST_S: f64 = 0.5;
/// Prediction horizon for the periodic recomputations (s).
const GPS_PREDICT_PERIODIC_S: f64 = 0.125;
/// Haptic pulse shapes per cadence row.
const DOUBLE_PULSE: HapticPattern = HapticPattern::Double { first_ms: 80, gap_ms: 50, second_ms: 80 };
const SINGLE_PULSE: HapticPattern = HapticPattern::Single { duration_ms: 100 };

// ── Proximity levels ──────────────────────────────────────────────────────────

/// Ordered closest → farthest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ProximityLevel {
    Here,
    Near,
    Medium,
    Far,
}

impl ProximityLevel {
    /// The interval containing `d_m`, ignoring hysteresis.
    pub fn natural(d_m: f64, cfg: &FinderConfig) -> Self {
        if d_m < cfg.here_m {
            Self::Here
        } else if d_m < cfg.near_m {
            Self::Near
        } else if d_m < cfg.medium_m {
            Self::Medium
        } else {
            Self::Far
        }
    }

    /// The threshold separating this level from the next farther one.
    fn upper_bound_m(self, cfg: &FinderConfig) -> Option<f64> {
        match self {
            Self::Here => Some(cfg.here_m),
            Self::Near => Some(cfg.near_m),
            Self::Medium => Some(cfg.medium_m),
            Self::Far => None,
        }
    }
}

/// Proximity state machine. Moving closer transitions instantly; moving
/// farther demands the boundary plus the hysteresis margin, so a reading
/// hovering on a threshold cannot flap the level.
#[derive(Debug, Clone)]
pub struct ProximityTracker {
    level: ProximityLevel,
}

impl ProximityTracker {
    pub fn new() -> Self {
        Self { level: ProximityLevel::Far }
    }

    pub fn level(&self) -> ProximityLevel {
        self.level
    }

    pub fn observe(&mut self, d_m: f64, cfg: &FinderConfig) -> ProximityLevel {
        let natural = ProximityLevel::natural(d_m, cfg);
        if natural < self.level {
            self.level = natural;
        } else if natural > self.level {
            if let Some(bound) = self.level.upper_bound_m(cfg) {
                if d_m >= bound + cfg.hysteresis_m {
                    self.level = natural;
                }
            }
        }
        self.level
    }
}

impl Default for ProximityTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ── Display helpers ───────────────────────────────────────────────────────────

/// Imperial distance label: inches under 5 ft, tenths of feet under
/// 100 ft, whole feet beyond.
pub fn distance_text(d_m: f64, level: ProximityLevel) -> String {
    if level == ProximityLevel::Here {
        return "Here".to_string();
    }
    let feet = d_m * 3.28084;
    if feet < 5.0 {
        format!("{}\"", (feet * 12.0).round() as i64)
    } else if feet < 100.0 {
        format!("{feet:.1}ft")
    } else {
        format!("{}ft", feet.round() as i64)
    }
}

/// Haptic cadence for a smoothed distance: silent when on top of the
/// beacon or out of haptic range, urgent double pulses when near, slowing
/// single pulses through the medium band.
fn haptic_cadence(d_m: f64, cfg: &FinderConfig) -> Option<(u64, HapticPattern)> {
    if d_m < cfg.here_m || d_m >= HAPTIC_SILENCE_M {
        None
    } else if d_m < cfg.near_m {
        Some((700, DOUBLE_PULSE))
    } else {
        let t = (d_m - cfg.near_m) / cfg.near_m;
        Some(((1000.0 + 1000.0 * t).round() as u64, SINGLE_PULSE))
    }
}

// ── Guidance frame ────────────────────────────────────────────────────────────

/// One per finder tick.
#[derive(Debug, Clone, Serialize)]
pub struct Guidance {
    /// Smoothed distance estimate, metres.
    pub distance_m: f64,
    pub proximity: ProximityLevel,
    pub distance_text: String,
    /// Relative bearing for the arrow, degrees clockwise from the device
    /// heading. `None` while searching (no fix, no beacon coordinates or
    /// no compass).
    pub bearing_deg: Option<f64>,
    /// False renders the searching wiggle instead of the arrow.
    pub has_location: bool,
    pub using_gps_fallback: bool,
    /// Close enough for fine positioning cues.
    pub fine_tuning: bool,
    pub haptic_interval_ms: Option<u64>,
    /// Set when the cadence gate opened this tick; forward to the haptics
    /// adapter.
    pub pulse: Option<HapticPattern>,
}

// ── Finder ────────────────────────────────────────────────────────────────────

pub struct PrecisionFinder {
    cfg: FinderConfig,
    location: Option<LocationSample>,
    headings: VecDeque<f64>,
    distance_window: VecDeque<f64>,
    last_estimate_m: Option<f64>,
    /// Last raw GPS distance and when it was computed.
    gps_prev: Option<(f64, u64)>,
    predicted_once: bool,
    in_gps_fallback: bool,
    proximity: ProximityTracker,
    emitted_bearing: Option<f64>,
    last_pulse_ms: Option<u64>,
}

impl PrecisionFinder {
    pub fn new(cfg: FinderConfig) -> Self {
        Self {
            cfg,
            location: None,
            headings: VecDeque::new(),
            distance_window: VecDeque::new(),
            last_estimate_m: None,
            gps_prev: None,
            predicted_once: false,
            in_gps_fallback: false,
            proximity: ProximityTracker::new(),
            emitted_bearing: None,
            last_pulse_ms: None,
        }
    }

    /// Feed a receiver-local GPS fix.
    pub fn feed_location(&mut self, location: LocationSample) {
        self.location = Some(location);
    }

    /// Feed a compass heading sample, degrees clockwise from north.
    pub fn feed_heading(&mut self, heading_deg: f64) {
        self.headings.push_back(heading_deg);
        while self.headings.len() > self.cfg.compass_smoothing_n {
            self.headings.pop_front();
        }
    }

    /// The receiver fix, or [`PhoenixError::NoLocationYet`] while the UI
    /// should show searching mode.
    pub fn receiver_fix(&self) -> Result<&LocationSample, PhoenixError> {
        self.location.as_ref().ok_or(PhoenixError::NoLocationYet)
    }

    /// Smoothed compass heading. Samples arrive closely spaced, so a mean
    /// over values unwrapped around the newest sample is wrap-safe.
    pub fn heading(&self) -> Option<f64> {
        let newest = *self.headings.back()?;
        let n = self.headings.len() as f64;
        let sum: f64 = self
            .headings
            .iter()
            .map(|&h| {
                let mut delta = h - newest;
                while delta > 180.0 {
                    delta -= 360.0;
                }
                while delta < -180.0 {
                    delta += 360.0;
                }
                newest + delta
            })
            .sum();
        Some(normalize_deg(sum / n))
    }

    /// Forget per-target state when the user picks a different emitter.
    pub fn retarget(&mut self) {
        self.distance_window.clear();
        self.last_estimate_m = None;
        self.gps_prev = None;
        self.predicted_once = false;
        self.in_gps_fallback = false;
        self.proximity = ProximityTracker::new();
        self.emitted_bearing = None;
        self.last_pulse_ms = None;
    }

    /// One guidance tick over a record snapshot.
    pub fn update(&mut self, record: &EmitterRecord, now_ms: u64) -> Guidance {
        let ble_fresh = now_ms.saturating_sub(record.last_seen_ms) <= self.cfg.ble_fresh_ms;

        let estimate = if ble_fresh {
            self.in_gps_fallback = false;
            self.gps_prev = None;
            self.predicted_once = false;
            Some(self.ble_distance_m(record.rssi_smoothed))
        } else {
            self.gps_fallback_distance_m(record, now_ms)
        };

        if let Some(d) = estimate {
            self.last_estimate_m = Some(d);
            self.distance_window.push_back(d);
            while self.distance_window.len() > self.cfg.distance_smoothing_n {
                self.distance_window.pop_front();
            }
        }

        let d_smoothed = if self.distance_window.is_empty() {
            self.last_estimate_m.unwrap_or(0.0)
        } else {
            self.distance_window.iter().sum::<f64>() / self.distance_window.len() as f64
        };

        let proximity = self.proximity.observe(d_smoothed, &self.cfg);
        let has_location = self.location.is_some() && record.has_coordinates();
        let bearing_deg = self.relative_bearing(record);

        let cadence = haptic_cadence(d_smoothed, &self.cfg);
        let haptic_interval_ms = cadence.map(|(interval_ms, _)| interval_ms);
        let pulse = match cadence {
            Some((interval_ms, pattern))
                if self
                    .last_pulse_ms
                    .map_or(true, |last| now_ms.saturating_sub(last) >= interval_ms) =>
            {
                self.last_pulse_ms = Some(now_ms);
                Some(pattern)
            }
            _ => None,
        };

        Guidance {
            distance_m: d_smoothed,
            proximity,
            distance_text: distance_text(d_smoothed, proximity),
            bearing_deg,
            has_location,
            using_gps_fallback: self.in_gps_fallback,
            fine_tuning: d_smoothed < self.cfg.near_m,
            haptic_interval_ms,
            pulse,
        }
    }

    /// Log-distance path loss: `d = 10^((measuredPower - rssi) / (10 n))`.
    fn ble_distance_m(&self, rssi_smoothed_dbm: i32) -> f64 {
        let exponent = (self.cfg.measured_power_dbm - rssi_smoothed_dbm as f64)
            / (10.0 * self.cfg.path_loss_exponent);
        10f64.powf(exponent)
    }

    /// Haversine to the beacon's coordinates, with a short closing-speed
    /// prediction so the display keeps moving between 1 Hz GPS fixes.
    /// Returns `None` (hold the last estimate) without a receiver fix or
    /// beacon coordinates.
    fn gps_fallback_distance_m(&mut self, record: &EmitterRecord, now_ms: u64) -> Option<f64> {
        let loc = self.location.as_ref()?;
        let (beacon_lat, beacon_lon) = record.coordinates()?;
        let d_gps = haversine_m(loc.latitude, loc.longitude, beacon_lat, beacon_lon);

        let estimate = match self.gps_prev {
            Some((d_prev, t_prev)) if now_ms > t_prev && d_gps < d_prev => {
                let dt_s = (now_ms - t_prev) as f64 / 1000.0;
                let closing_mps = ((d_prev - d_gps) / dt_s).max(0.0);
                let horizon_s = if self.predicted_once {
                    GPS_PREDICT_PERIODIC_S
                } else {
                    GPS_PREDICT_FIRST_S
                };
                self.predicted_once = true;
                (d_gps - closing_mps * horizon_s).max(0.0)
            }
            _ => d_gps,
        };

        self.gps_prev = Some((d_gps, now_ms));
        self.in_gps_fallback = true;
        Some(estimate)
    }

    /// Arrow rotation: great-circle bearing to the beacon minus the
    /// smoothed device heading, emitted only when it moved past the
    /// deadzone.
    fn relative_bearing(&mut self, record: &EmitterRecord) -> Option<f64> {
        let loc = self.location.as_ref()?;
        let (beacon_lat, beacon_lon) = record.coordinates()?;
        let heading = self.heading()?;
        let absolute = initial_bearing_deg(loc.latitude, loc.longitude, beacon_lat, beacon_lon);
        let relative = normalize_deg(absolute - heading);

        let emitted = match self.emitted_bearing {
            Some(previous)
                if circular_diff_deg(previous, relative) <= self.cfg.bearing_deadzone_deg =>
            {
                previous
            }
            _ => {
                self.emitted_bearing = Some(relative);
                relative
            }
        };
        Some(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReceiverConfig;
    use crate::platform::Advertisement;
    use phoenix_proto::{encode, wrap, BeaconFields, BeaconFlags, DeviceId, FlagStates};

    fn record(rssi: i32, gps: Option<(f32, f32)>, last_seen_ms: u64) -> EmitterRecord {
        let (lat, lon) = gps.unwrap_or((0.0, 0.0));
        let fields = BeaconFields {
            device_id: DeviceId(0x0000_0042),
            latitude: lat,
            longitude: lon,
            altitude_msl_m: 10.0,
            relative_altitude_cm: 0.0,
            battery_pct: 90.0,
            timestamp_s: 1.0,
            flags: BeaconFlags::from(FlagStates {
                gps_valid: gps.is_some(),
                ..FlagStates::default()
            }),
        };
        let payload = phoenix_proto::BeaconPayload::decode(&encode(&fields)).unwrap();
        let adv = Advertisement {
            peer_id: "peer".into(),
            name: None,
            manufacturer_data: wrap(&encode(&fields), 0x004C).to_vec(),
            rssi_dbm: rssi,
            t_ms: last_seen_ms,
        };
        EmitterRecord::first(payload, &adv, &ReceiverConfig::default())
    }

    fn fix(lat: f64, lon: f64) -> LocationSample {
        LocationSample { latitude: lat, longitude: lon, altitude_m: 10.0, accuracy_m: 5.0 }
    }

    fn finder() -> PrecisionFinder {
        PrecisionFinder::new(FinderConfig::default())
    }

    // ── Distance model ────────────────────────────────────────────────────

    #[test]
    fn path_loss_distance_at_reference_points() {
        let f = finder();
        assert!((f.ble_distance_m(-59) - 1.0).abs() < 1e-9);
        assert!((f.ble_distance_m(-79) - 10.0).abs() < 1e-9);
        assert!((f.ble_distance_m(-39) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn fresh_ble_drives_distance() {
        let mut f = finder();
        let g = f.update(&record(-59, None, 1_000), 1_100);
        assert!(!g.using_gps_fallback);
        assert!((g.distance_m - 1.0).abs() < 1e-6);
        assert_eq!(g.proximity, ProximityLevel::Near);
        assert!(g.fine_tuning);
    }

    #[test]
    fn gps_fallback_predicts_while_closing() {
        let mut f = finder();
        // Beacon ~100 m north of origin, BLE stale for all updates
        let rec = record(-90, Some((0.0009, 0.0)), 0);

        f.feed_location(fix(0.0, 0.0));
        let g1 = f.update(&rec, 10_000);
        assert!(g1.using_gps_fallback);
        let d1 = g1.distance_m;
        assert!((d1 - 100.0).abs() < 1.0, "got {d1}");

        // Receiver walked ~10 m toward the beacon in 250 ms of ticks:
        // closing speed 40 m/s, first prediction horizon 0.5 s
        f.feed_location(fix(0.00009, 0.0));
        let g2 = f.update(&rec, 10_250);
        // window mean of [100.1, 70.1]
        assert!((g2.distance_m - 85.0).abs() < 1.0, "got {}", g2.distance_m);

        // Periodic recomputation uses the 0.125 s horizon
        f.feed_location(fix(0.00018, 0.0));
        let g3 = f.update(&rec, 10_500);
        assert!(g3.distance_m < g2.distance_m);
        assert!(g3.distance_m >= 0.0);
    }

    #[test]
    fn gps_prediction_never_goes_negative() {
        let mut f = finder();
        let rec = record(-90, Some((0.0009, 0.0)), 0);
        f.feed_location(fix(0.0, 0.0));
        f.update(&rec, 10_000);
        // Teleport next to the beacon: absurd closing speed, clamped at 0
        f.feed_location(fix(0.00089, 0.0));
        let g = f.update(&rec, 10_250);
        assert!(g.distance_m >= 0.0);
    }

    #[test]
    fn without_fix_or_coordinates_distance_holds() {
        let mut f = finder();
        let rec = record(-59, None, 1_000);
        let g1 = f.update(&rec, 1_100);
        let held = g1.distance_m;

        // Link lapses, beacon never had GPS, receiver has no fix either:
        // the estimate holds and nothing panics
        let g2 = f.update(&rec, 10_000);
        assert_eq!(g2.distance_m, held);
        assert!(!g2.has_location);
        assert_eq!(g2.bearing_deg, None);
    }

    #[test]
    fn returning_ble_leaves_fallback() {
        let mut f = finder();
        let stale = record(-69, Some((0.0001, 0.0)), 0);
        f.feed_location(fix(0.0, 0.0));
        assert!(f.update(&stale, 10_000).using_gps_fallback);

        let fresh = record(-69, Some((0.0001, 0.0)), 11_000);
        assert!(!f.update(&fresh, 11_100).using_gps_fallback);
    }

    // ── Proximity state machine ───────────────────────────────────────────

    #[test]
    fn receding_needs_hysteresis_closing_does_not() {
        let cfg = FinderConfig::default();
        let mut t = ProximityTracker::new();

        assert_eq!(t.observe(1.0, &cfg), ProximityLevel::Near);

        // Monotonic recede from 1.4: medium only fires at >= 1.65
        for d in [1.4, 1.5, 1.55, 1.6, 1.64] {
            assert_eq!(t.observe(d, &cfg), ProximityLevel::Near, "at {d}");
        }
        assert_eq!(t.observe(1.65, &cfg), ProximityLevel::Medium);

        // Closing transition is instant
        assert_eq!(t.observe(1.49, &cfg), ProximityLevel::Near);
    }

    #[test]
    fn medium_to_far_boundary() {
        let cfg = FinderConfig::default();
        let mut t = ProximityTracker::new();
        assert_eq!(t.observe(4.0, &cfg), ProximityLevel::Medium);

        // The dip below 5 m keeps medium; 5.12 is inside the hysteresis
        // band; 5.16 clears 5.15 and fires
        for d in [5.10, 4.95, 5.12] {
            assert_eq!(t.observe(d, &cfg), ProximityLevel::Medium, "at {d}");
        }
        assert_eq!(t.observe(5.16, &cfg), ProximityLevel::Far);
    }

    #[test]
    fn multi_level_close_is_instant() {
        let cfg = FinderConfig::default();
        let mut t = ProximityTracker::new();
        assert_eq!(t.level(), ProximityLevel::Far);
        assert_eq!(t.observe(0.3, &cfg), ProximityLevel::Here);
    }

    // ── Display ───────────────────────────────────────────────────────────

    #[test]
    fn distance_text_bands() {
        assert_eq!(distance_text(0.3, ProximityLevel::Here), "Here");
        assert_eq!(distance_text(1.0, ProximityLevel::Near), "39\"");
        assert_eq!(distance_text(10.0, ProximityLevel::Far), "32.8ft");
        assert_eq!(distance_text(50.0, ProximityLevel::Far), "164ft");
    }

    // ── Bearing ───────────────────────────────────────────────────────────

    #[test]
    fn bearing_relative_to_heading_with_deadzone() {
        let mut f = finder();
        let rec = record(-90, Some((0.0, 0.001)), 0); // due east
        f.feed_location(fix(0.0, 0.0));
        f.feed_heading(0.0);

        let g = f.update(&rec, 10_000);
        let b = g.bearing_deg.unwrap();
        assert!((b - 90.0).abs() < 0.5, "got {b}");

        // 2° of heading change stays inside the deadzone: bearing held
        f.feed_heading(2.0);
        f.feed_heading(2.0);
        f.feed_heading(2.0);
        f.feed_heading(2.0);
        f.feed_heading(2.0);
        let held = f.update(&rec, 10_250).bearing_deg.unwrap();
        assert_eq!(held, b);

        // 10° moves past it: new bearing emitted
        for _ in 0..5 {
            f.feed_heading(10.0);
        }
        let moved = f.update(&rec, 10_500).bearing_deg.unwrap();
        assert!((moved - 80.0).abs() < 0.5, "got {moved}");
    }

    #[test]
    fn heading_mean_is_wrap_safe() {
        let mut f = finder();
        f.feed_heading(350.0);
        f.feed_heading(10.0);
        let h = f.heading().unwrap();
        assert!(h < 1.0 || h > 359.0, "got {h}");
    }

    #[test]
    fn no_heading_means_searching() {
        let mut f = finder();
        let rec = record(-90, Some((0.0, 0.001)), 0);
        f.feed_location(fix(0.0, 0.0));
        let g = f.update(&rec, 10_000);
        // Fix and coordinates exist but there is no compass yet
        assert!(g.has_location);
        assert_eq!(g.bearing_deg, None);
    }

    #[test]
    fn receiver_fix_error_kind() {
        let f = finder();
        assert!(matches!(f.receiver_fix(), Err(PhoenixError::NoLocationYet)));
    }

    // ── Haptics ───────────────────────────────────────────────────────────

    #[test]
    fn haptic_cadence_table() {
        let cfg = FinderConfig::default();
        assert_eq!(haptic_cadence(0.3, &cfg), None);
        assert_eq!(haptic_cadence(1.0, &cfg), Some((700, DOUBLE_PULSE)));
        assert_eq!(haptic_cadence(1.5, &cfg), Some((1000, SINGLE_PULSE)));
        assert_eq!(haptic_cadence(2.25, &cfg), Some((1500, SINGLE_PULSE)));
        assert_eq!(haptic_cadence(2.999, &cfg).unwrap().0, 1999);
        assert_eq!(haptic_cadence(3.0, &cfg), None);
        assert_eq!(haptic_cadence(12.0, &cfg), None);
    }

    #[test]
    fn pulses_gate_on_elapsed_interval() {
        let mut f = finder();
        let near = record(-59, None, 1_000); // 1 m: double pulse at 700 ms

        let g = f.update(&near, 1_000);
        assert_eq!(g.haptic_interval_ms, Some(700));
        assert_eq!(g.pulse, Some(DOUBLE_PULSE));

        // 250 ms later the gate is still closed
        let g = f.update(&near, 1_250);
        assert_eq!(g.pulse, None);
        assert_eq!(g.haptic_interval_ms, Some(700));

        // 700 ms after the first pulse it fires again
        let g = f.update(&near, 1_700);
        assert_eq!(g.pulse, Some(DOUBLE_PULSE));
    }

    #[test]
    fn retarget_clears_per_target_state() {
        let mut f = finder();
        f.feed_location(fix(0.0, 0.0));
        f.feed_heading(0.0);
        f.update(&record(-59, None, 1_000), 1_000);
        f.retarget();
        assert_eq!(f.proximity.level(), ProximityLevel::Far);
        // Location and compass are receiver state, not target state
        assert!(f.receiver_fix().is_ok());
        assert!(f.heading().is_some());
    }
}
