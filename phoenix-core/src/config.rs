//! Configuration recognized by the core.
//!
//! Every tunable has a compiled-in default (the values the protocol was
//! characterized with) and an optional `PHOENIX_*` environment override,
//! applied in `Default::default()`.

use std::str::FromStr;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Emitter ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Company identifier written into the advertisement frame. Platform
    /// bound: systems that refuse arbitrary ids advertise under 0x004C.
    pub company_id: u16,
    /// Cadence when SOS, fall or unstable environment is raised (ms).
    pub interval_emergency_ms: u64,
    /// Cadence below 10% battery (ms).
    pub interval_critical_ms: u64,
    /// Cadence below 20% battery (ms).
    pub interval_power_save_ms: u64,
    /// Cadence while motion is detected (ms).
    pub interval_active_ms: u64,
    /// Cadence otherwise (ms).
    pub interval_normal_ms: u64,
    /// How long a detected fall stays latched in the flags (ms).
    pub fall_cooldown_ms: u64,
    /// GPS fixes with worse accuracy than this are not advertised (metres).
    pub gps_valid_max_m: f64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            company_id: env_or("PHOENIX_COMPANY_ID", 0x004C),
            interval_emergency_ms: env_or("PHOENIX_INTERVAL_EMERGENCY_MS", 1_000),
            interval_critical_ms: env_or("PHOENIX_INTERVAL_CRITICAL_MS", 15_000),
            interval_power_save_ms: env_or("PHOENIX_INTERVAL_POWER_SAVE_MS", 10_000),
            interval_active_ms: env_or("PHOENIX_INTERVAL_ACTIVE_MS", 3_000),
            interval_normal_ms: env_or("PHOENIX_INTERVAL_NORMAL_MS", 5_000),
            fall_cooldown_ms: env_or("PHOENIX_FALL_COOLDOWN_MS", 60_000),
            gps_valid_max_m: env_or("PHOENIX_GPS_VALID_MAX_METRES", 200.0),
        }
    }
}

// ── Receiver ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Records older than this are evicted on the receiver tick (ms).
    pub stale_timeout_ms: u64,
    /// RSSI samples retained per emitter.
    pub rssi_history_n: usize,
    /// Minimum history length before IQR outlier rejection arms.
    pub rssi_outlier_arm_n: usize,
    /// If fewer than this survive rejection, fall back to the full history.
    pub rssi_iqr_min_retained: usize,
    /// Minimum Haversine step between stored location-history points (m).
    pub gps_history_min_step_m: f64,
    /// Location-history points retained per emitter.
    pub location_history_n: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            stale_timeout_ms: env_or("PHOENIX_STALE_TIMEOUT_MS", 60_000),
            rssi_history_n: env_or("PHOENIX_RSSI_HISTORY_N", 10),
            rssi_outlier_arm_n: env_or("PHOENIX_RSSI_OUTLIER_ARM_N", 5),
            rssi_iqr_min_retained: env_or("PHOENIX_RSSI_IQR_MIN_RETAINED", 3),
            gps_history_min_step_m: env_or("PHOENIX_GPS_HISTORY_MIN_STEP_METRES", 5.0),
            location_history_n: env_or("PHOENIX_LOCATION_HISTORY_N", 10),
        }
    }
}

// ── Precision finder ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FinderConfig {
    /// A beacon seen within this window is ranged over BLE, not GPS (ms).
    pub ble_fresh_ms: u64,
    /// Expected RSSI at one metre (dBm).
    pub measured_power_dbm: f64,
    /// Log-distance path-loss exponent.
    pub path_loss_exponent: f64,
    /// Distance samples averaged before driving proximity/haptics.
    pub distance_smoothing_n: usize,
    /// Proximity thresholds, closest to farthest (m).
    pub here_m: f64,
    pub near_m: f64,
    pub medium_m: f64,
    /// Extra distance demanded before moving to a farther level (m).
    pub hysteresis_m: f64,
    /// Compass samples averaged for the displayed heading.
    pub compass_smoothing_n: usize,
    /// Bearing changes below this are held, not emitted (degrees).
    pub bearing_deadzone_deg: f64,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            ble_fresh_ms: env_or("PHOENIX_BLE_FRESH_MS", 3_000),
            measured_power_dbm: env_or("PHOENIX_MEASURED_POWER_DBM", -59.0),
            path_loss_exponent: env_or("PHOENIX_PATH_LOSS_EXPONENT", 2.0),
            distance_smoothing_n: env_or("PHOENIX_DISTANCE_SMOOTHING_N", 10),
            here_m: env_or("PHOENIX_HERE_M", 0.5),
            near_m: env_or("PHOENIX_NEAR_M", 1.5),
            medium_m: env_or("PHOENIX_MEDIUM_M", 5.0),
            hysteresis_m: env_or("PHOENIX_HYSTERESIS_M", 0.15),
            compass_smoothing_n: env_or("PHOENIX_COMPASS_SMOOTHING_N", 5),
            bearing_deadzone_deg: env_or("PHOENIX_BEARING_DEADZONE_DEG", 5.0),
        }
    }
}
