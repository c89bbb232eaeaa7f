//! radio.rs — Simulated BLE air between emitter and receiver
//!
//! Implements the core's `Peripheral`/`Central` adapter traits over a
//! shared in-process air state. A delivery task samples the currently
//! advertised frame at scan cadence, applies log-distance path loss with
//! Gaussian shadowing, drops packets with a range-dependent probability
//! and pushes the survivors into the receiver's scan channel — the same
//! path a platform BLE callback would take.

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use phoenix_core::error::PhoenixError;
use phoenix_core::platform::{Advertisement, Central, Peripheral, RadioState};
use phoenix_proto::FRAME_LEN;

#[derive(Debug, Clone, Deserialize)]
pub struct RadioConfig {
    /// RSSI at one metre (dBm)
    pub measured_power_dbm: f64,
    pub path_loss_exponent: f64,
    /// Shadowing sigma (dB)
    pub rssi_sigma_db: f64,
    /// Base packet-drop probability at close range
    pub drop_base: f64,
    /// Range where drops start climbing steeply (m)
    pub fade_range_m: f64,
    /// Hard reception limit (m)
    pub max_range_m: f64,
    /// Scan-event cadence (ms)
    pub deliver_interval_ms: u64,
}

/// What is currently on the air, plus where scan results go.
#[derive(Default)]
pub struct AirState {
    pub frame: Option<[u8; FRAME_LEN]>,
    pub advertising: bool,
    pub scan_sink: Option<mpsc::Sender<Advertisement>>,
}

pub type SharedAir = Arc<Mutex<AirState>>;

pub fn shared_air() -> SharedAir {
    Arc::new(Mutex::new(AirState::default()))
}

// ── Peripheral (emitter side) ─────────────────────────────────────────────────

pub struct SimPeripheral {
    air: SharedAir,
}

impl SimPeripheral {
    pub fn new(air: SharedAir) -> Self {
        Self { air }
    }
}

impl Peripheral for SimPeripheral {
    fn initialize(&mut self) -> Result<(), PhoenixError> {
        Ok(())
    }

    fn state(&self) -> RadioState {
        RadioState::PoweredOn
    }

    fn start_advertising(&mut self, manufacturer_data: &[u8; FRAME_LEN]) -> Result<(), PhoenixError> {
        let mut air = self.air.lock().unwrap();
        air.frame = Some(*manufacturer_data);
        air.advertising = true;
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), PhoenixError> {
        self.air.lock().unwrap().advertising = false;
        Ok(())
    }
}

// ── Central (receiver side) ───────────────────────────────────────────────────

pub struct SimCentral {
    air: SharedAir,
}

impl SimCentral {
    pub fn new(air: SharedAir) -> Self {
        Self { air }
    }
}

impl Central for SimCentral {
    fn initialize(&mut self) -> Result<(), PhoenixError> {
        Ok(())
    }

    fn state(&self) -> RadioState {
        RadioState::PoweredOn
    }

    fn start_scanning(&mut self, sink: mpsc::Sender<Advertisement>) -> Result<(), PhoenixError> {
        self.air.lock().unwrap().scan_sink = Some(sink);
        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), PhoenixError> {
        self.air.lock().unwrap().scan_sink = None;
        Ok(())
    }
}

// ── Propagation model ─────────────────────────────────────────────────────────

/// RSSI for a true distance: log-distance path loss plus Gaussian
/// shadowing, floored at 10 cm so a co-located pair does not blow up the
/// logarithm.
pub fn rssi_for_distance(distance_m: f64, cfg: &RadioConfig, rng: &mut StdRng) -> i32 {
    let d = distance_m.max(0.1);
    let mean = cfg.measured_power_dbm - 10.0 * cfg.path_loss_exponent * d.log10();
    let noise = Normal::new(0.0, cfg.rssi_sigma_db)
        .map(|n| n.sample(rng))
        .unwrap_or(0.0);
    (mean + noise).round() as i32
}

/// Probability that this advertisement never reaches the scanner.
pub fn drop_probability(distance_m: f64, cfg: &RadioConfig) -> f64 {
    if distance_m >= cfg.max_range_m {
        return 1.0;
    }
    let mut p = cfg.drop_base;
    if distance_m > cfg.fade_range_m {
        p += 0.9 * (distance_m - cfg.fade_range_m) / (cfg.max_range_m - cfg.fade_range_m);
    }
    p.min(1.0)
}

/// One delivery attempt: sample the air, roll the dice, push a scan event.
pub fn deliver(air: &SharedAir, distance_m: f64, now_ms: u64, cfg: &RadioConfig, rng: &mut StdRng) {
    let (frame, sink) = {
        let air = air.lock().unwrap();
        if !air.advertising {
            return;
        }
        match (air.frame, air.scan_sink.clone()) {
            (Some(frame), Some(sink)) => (frame, sink),
            _ => return,
        }
    };

    if rng.gen_bool(drop_probability(distance_m, cfg).clamp(0.0, 1.0)) {
        debug!(distance_m, "advertisement lost on the air");
        return;
    }

    let adv = Advertisement {
        peer_id: "sim-emitter".into(),
        name: Some("Phoenix Beacon".into()),
        manufacturer_data: frame.to_vec(),
        rssi_dbm: rssi_for_distance(distance_m, cfg, rng),
        t_ms: now_ms,
    };
    // try_send: a stalled receiver just misses a repeat of the beacon
    let _ = sink.try_send(adv);
}
