//! Platform adapter contract.
//!
//! The core depends on these traits, never on a concrete platform. A host
//! implements them over its BLE stack and sensor APIs; the simulator
//! implements them over an in-process air model. Callbacks (scan results)
//! are delivered through an `mpsc` channel so the owning task serializes
//! all mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::PhoenixError;

/// Radio availability, as reported by the platform BLE stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Resetting,
    Unknown,
}

/// Sensor stream identity, for degradation reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorModality {
    Location,
    Accelerometer,
    Gyroscope,
    Altimeter,
    Compass,
    Battery,
}

// ── Sensor samples ────────────────────────────────────────────────────────────

/// One GPS fix.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LocationSample {
    /// Degrees.
    pub latitude: f64,
    /// Degrees.
    pub longitude: f64,
    /// Metres above mean sea level.
    pub altitude_m: f64,
    /// Horizontal accuracy radius, metres.
    pub accuracy_m: f64,
}

/// Accelerometer sample, in g.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccelSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelSample {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Gyroscope sample, in rad/s.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GyroSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl GyroSample {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Barometric altimeter sample: altitude relative to the stream's start.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AltimeterSample {
    pub relative_m: f64,
}

/// Battery source reading.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BatterySample {
    /// State of charge, 0.0..=1.0. Negative means unknown.
    pub fraction: f64,
    pub is_charging: bool,
}

impl Default for BatterySample {
    fn default() -> Self {
        Self { fraction: -1.0, is_charging: false }
    }
}

/// Everything the emitter reads in one tick. Absent modalities degrade the
/// derived flags but never block a transmission.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorSnapshot {
    pub location: Option<LocationSample>,
    pub accel: Option<AccelSample>,
    pub gyro: Option<GyroSample>,
    pub altimeter: Option<AltimeterSample>,
    /// Compass heading, degrees clockwise from north.
    pub compass_deg: Option<f64>,
    pub battery: Option<BatterySample>,
}

// ── Scan results ──────────────────────────────────────────────────────────────

/// One advertisement as delivered by the platform central.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Platform peer identifier (address or UUID). Display/debug only —
    /// never used as emitter identity.
    pub peer_id: String,
    /// Device name from scan response, if any.
    pub name: Option<String>,
    /// Raw manufacturer-specific data.
    pub manufacturer_data: Vec<u8>,
    /// Received signal strength, dBm.
    pub rssi_dbm: i32,
    /// Arrival time on the receiver's monotonic clock, ms.
    pub t_ms: u64,
}

// ── Traits ────────────────────────────────────────────────────────────────────

/// BLE advertiser. Implementations advertise connectable=false, mode
/// low-latency, tx power high.
pub trait Peripheral: Send {
    fn initialize(&mut self) -> Result<(), PhoenixError>;
    fn state(&self) -> RadioState;
    fn start_advertising(
        &mut self,
        manufacturer_data: &[u8; phoenix_proto::FRAME_LEN],
    ) -> Result<(), PhoenixError>;
    fn stop_advertising(&mut self) -> Result<(), PhoenixError>;
}

/// BLE scanner. Duplicates must be allowed so a stationary emitter still
/// produces RSSI updates.
pub trait Central: Send {
    fn initialize(&mut self) -> Result<(), PhoenixError>;
    fn state(&self) -> RadioState;
    /// Begin scanning; every advertisement with manufacturer data is sent
    /// into `sink`. A full sink may drop: the beacon repeats.
    fn start_scanning(&mut self, sink: mpsc::Sender<Advertisement>) -> Result<(), PhoenixError>;
    fn stop_scanning(&mut self) -> Result<(), PhoenixError>;
}

/// Emitter-side sensor streams.
pub trait SensorSuite: Send {
    /// Start all streams. Returns the modalities that failed — each is a
    /// degradation, not an error.
    fn start(&mut self) -> Vec<SensorModality>;
    /// Read the latest value of every stream.
    fn snapshot(&mut self) -> SensorSnapshot;
    /// Best-effort stop of all streams.
    fn stop(&mut self);
}

/// Vibration pattern fired by the finder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HapticPattern {
    Single { duration_ms: u64 },
    Double { first_ms: u64, gap_ms: u64, second_ms: u64 },
}

pub trait Haptics: Send {
    fn pulse(&mut self, pattern: HapticPattern);
}

/// Monotonic time source. All core deadlines (fall latch, stale eviction,
/// BLE freshness) are measured on this clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

// ── Stock clocks ──────────────────────────────────────────────────────────────

/// Process-monotonic clock backed by `std::time::Instant`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for deterministic tests and replays.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_ms)) }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
