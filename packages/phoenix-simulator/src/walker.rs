//! walker.rs — Casualty and rescuer motion models
//!
//! The casualty wanders until a scripted event stops them; their sensor
//! state feeds the emitter through a [`SensorSuite`] adapter. The rescuer
//! starts a few hundred metres away and steers by the guidance frames the
//! finder produces, which closes the whole loop: a steering bug in the
//! core shows up as a rescuer that never arrives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use phoenix_core::finder::Guidance;
use phoenix_core::geo::{haversine_m, normalize_deg};
use phoenix_core::platform::{
    AccelSample, AltimeterSample, BatterySample, GyroSample, LocationSample, SensorModality,
    SensorSnapshot, SensorSuite,
};

use crate::scenario::{ScenarioConfig, ScenarioType};

/// Metres per degree of latitude.
const METRES_PER_DEG_LAT: f64 = 111_195.0;

#[derive(Debug, Clone, Deserialize)]
pub struct WalkerConfig {
    pub start_lat: f64,
    pub start_lon: f64,
    pub start_alt_m: f64,
    /// Wander speed before any incapacitating event (m/s)
    pub wander_speed_mps: f64,
    /// Reported GPS accuracy under a healthy fix (m)
    pub gps_accuracy_m: f64,
}

// ── Casualty ──────────────────────────────────────────────────────────────────

/// The person being located. Pure state machine over sim time; the radio
/// and emitter layers read it through [`SimSensors`].
pub struct Casualty {
    cfg: WalkerConfig,
    scenario: ScenarioConfig,
    rng: StdRng,

    pub t_s: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
    pub battery_frac: f64,
    wander_heading_deg: f64,

    /// Accel magnitudes queued by the fall event, consumed one per
    /// snapshot: free-fall, then impact, then lying still.
    fall_script: VecDeque<f64>,
    fall_fired: bool,
    pub fallen: bool,
}

impl Casualty {
    pub fn new(cfg: WalkerConfig, scenario: ScenarioConfig, seed: u64) -> Self {
        let battery = scenario.start_battery_frac;
        let mut rng = StdRng::seed_from_u64(seed);
        let wander_heading_deg = rng.gen_range(0.0..360.0);
        Self {
            cfg,
            scenario,
            rng,
            t_s: 0.0,
            lat: 0.0,
            lon: 0.0,
            alt_m: 0.0,
            battery_frac: battery,
            wander_heading_deg,
            fall_script: VecDeque::new(),
            fall_fired: false,
            fallen: false,
        }
        .at_start_position()
    }

    fn at_start_position(mut self) -> Self {
        self.lat = self.cfg.start_lat;
        self.lon = self.cfg.start_lon;
        self.alt_m = self.cfg.start_alt_m;
        self
    }

    /// Advance sim time: drift position, drain battery, fire the scripted
    /// fall when its time comes.
    pub fn tick(&mut self, dt_s: f64) {
        self.t_s += dt_s;
        self.battery_frac =
            (self.battery_frac - self.scenario.drain_per_min * dt_s / 60.0).max(0.02);

        if self.scenario.has(&ScenarioType::Fall) && !self.fall_fired && self.t_s >= self.scenario.fall_at_s
        {
            // Free-fall, impact, settle — consumed across the next ticks
            self.fall_script.extend([0.35, 0.30, 3.20, 2.90]);
            self.fall_fired = true;
        }

        if !self.fallen && self.fall_script.is_empty() && self.fall_fired {
            self.fallen = true;
        }

        if !self.fallen && self.fall_script.is_empty() {
            // Meandering walk
            self.wander_heading_deg =
                normalize_deg(self.wander_heading_deg + self.rng.gen_range(-15.0..15.0) * dt_s);
            let step = self.cfg.wander_speed_mps * dt_s;
            let course = self.wander_heading_deg.to_radians();
            self.lat += step * course.cos() / METRES_PER_DEG_LAT;
            self.lon += step * course.sin() / (METRES_PER_DEG_LAT * self.lat.to_radians().cos());
            self.alt_m += self.rng.gen_range(-0.05..0.05);
        }
    }

    /// Build the sensor view of the current instant.
    pub fn snapshot(&mut self) -> SensorSnapshot {
        let accel = if let Some(magnitude) = self.fall_script.pop_front() {
            AccelSample { x: 0.0, y: 0.0, z: magnitude }
        } else if self.fallen {
            // Lying on their back, barely breathing
            AccelSample {
                x: 0.05 + self.rng.gen_range(-0.02..0.02),
                y: -0.03,
                z: 1.0 + self.rng.gen_range(-0.02..0.02),
            }
        } else {
            // Walking bounce
            let bounce = 0.25 * (self.t_s * 6.0).sin();
            AccelSample { x: 0.05, y: 0.05, z: 1.0 + 0.15 + bounce }
        };

        let gyro = if self.scenario.has(&ScenarioType::RoughTerrain) && !self.fallen {
            // Tumbling through scree: high, erratic rotation
            let spin = if self.rng.gen_bool(0.5) { 0.5 } else { 2.6 };
            GyroSample { x: spin, y: 0.0, z: 0.0 }
        } else {
            GyroSample {
                x: self.rng.gen_range(-0.05..0.05),
                y: self.rng.gen_range(-0.05..0.05),
                z: self.rng.gen_range(-0.05..0.05),
            }
        };

        let accuracy_m = if self.scenario.gps_lost_at(self.t_s) {
            // Canyon walls: a fix exists but it is junk
            400.0
        } else {
            self.cfg.gps_accuracy_m
        };

        SensorSnapshot {
            location: Some(LocationSample {
                latitude: self.lat,
                longitude: self.lon,
                altitude_m: self.alt_m,
                accuracy_m,
            }),
            accel: Some(accel),
            gyro: Some(gyro),
            altimeter: Some(AltimeterSample { relative_m: self.alt_m - self.cfg.start_alt_m }),
            compass_deg: None,
            battery: Some(BatterySample { fraction: self.battery_frac, is_charging: false }),
        }
    }

    pub fn position(&self) -> (f64, f64) {
        (self.lat, self.lon)
    }

    pub fn sos_active(&self) -> bool {
        self.scenario.has(&ScenarioType::Sos) && self.t_s >= self.scenario.sos_at_s
    }
}

/// [`SensorSuite`] adapter over the shared casualty state.
pub struct SimSensors {
    casualty: Arc<Mutex<Casualty>>,
}

impl SimSensors {
    pub fn new(casualty: Arc<Mutex<Casualty>>) -> Self {
        Self { casualty }
    }
}

impl SensorSuite for SimSensors {
    fn start(&mut self) -> Vec<SensorModality> {
        Vec::new()
    }

    fn snapshot(&mut self) -> SensorSnapshot {
        self.casualty.lock().unwrap().snapshot()
    }

    fn stop(&mut self) {}
}

// ── Rescuer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RescuerConfig {
    /// Start offset from the casualty, metres on each axis
    pub start_offset_north_m: f64,
    pub start_offset_east_m: f64,
    pub walk_speed_mps: f64,
    pub gps_accuracy_m: f64,
}

/// The person searching. Steered purely by guidance frames.
pub struct Rescuer {
    cfg: RescuerConfig,
    rng: StdRng,
    pub lat: f64,
    pub lon: f64,
    /// Course over ground = compass heading (they walk where they face).
    pub heading_deg: f64,
}

impl Rescuer {
    pub fn new(cfg: RescuerConfig, origin_lat: f64, origin_lon: f64, seed: u64) -> Self {
        let lat = origin_lat + cfg.start_offset_north_m / METRES_PER_DEG_LAT;
        let lon = origin_lon
            + cfg.start_offset_east_m / (METRES_PER_DEG_LAT * origin_lat.to_radians().cos());
        Self { cfg, rng: StdRng::seed_from_u64(seed), lat, lon, heading_deg: 0.0 }
    }

    /// Turn toward the guidance arrow and advance one tick, stopping
    /// short when effectively on top of the beacon.
    pub fn steer(&mut self, guidance: &Guidance, dt_s: f64) {
        if let Some(relative_deg) = guidance.bearing_deg {
            self.heading_deg = normalize_deg(self.heading_deg + relative_deg);
        }
        if guidance.distance_m < 1.0 {
            return;
        }
        let step = (self.cfg.walk_speed_mps * dt_s).min(guidance.distance_m);
        let course = self.heading_deg.to_radians();
        self.lat += step * course.cos() / METRES_PER_DEG_LAT;
        self.lon += step * course.sin() / (METRES_PER_DEG_LAT * self.lat.to_radians().cos());
    }

    pub fn location_sample(&self) -> LocationSample {
        LocationSample {
            latitude: self.lat,
            longitude: self.lon,
            altitude_m: 0.0,
            accuracy_m: self.cfg.gps_accuracy_m,
        }
    }

    /// Compass with a touch of jitter, as real magnetometers have.
    pub fn compass_deg(&mut self) -> f64 {
        normalize_deg(self.heading_deg + self.rng.gen_range(-2.0..2.0))
    }

    pub fn distance_to(&self, lat: f64, lon: f64) -> f64 {
        haversine_m(self.lat, self.lon, lat, lon)
    }
}
