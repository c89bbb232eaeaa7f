//! scenario.rs — Injectable casualty scenarios for the simulator
//!
//! Each scenario exercises a specific core behavior end to end: the fall
//! pipeline and its latch, the SOS cadence override, cached-GPS retention
//! during fix loss, the power-save cadences, and the unstable-environment
//! flag under rough terrain.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioType {
    /// Scripted free-fall + impact + lying still at `fall_at_s`
    Fall,
    /// External SOS input raised at `sos_at_s`
    Sos,
    /// GPS accuracy degrades past the validity bound inside the window
    GpsLoss,
    /// Start with a nearly drained battery (power-save / critical cadence)
    LowBattery,
    /// Sustained erratic rotation (unstable-environment flag)
    RoughTerrain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub active: Vec<ScenarioType>,
    /// When the fall event starts (sim seconds)
    pub fall_at_s: f64,
    /// When the SOS input goes high (sim seconds)
    pub sos_at_s: f64,
    /// GPS-loss window (sim seconds)
    pub gps_loss_from_s: f64,
    pub gps_loss_until_s: f64,
    /// Battery fraction at boot
    pub start_battery_frac: f64,
    /// Battery drain per minute of sim time
    pub drain_per_min: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            active: vec![],
            fall_at_s: 15.0,
            sos_at_s: 10.0,
            gps_loss_from_s: 20.0,
            gps_loss_until_s: 40.0,
            start_battery_frac: 0.9,
            drain_per_min: 0.002,
        }
    }
}

impl ScenarioConfig {
    pub fn has(&self, s: &ScenarioType) -> bool {
        self.active.contains(s)
    }

    pub fn gps_lost_at(&self, t_s: f64) -> bool {
        self.has(&ScenarioType::GpsLoss)
            && t_s >= self.gps_loss_from_s
            && t_s < self.gps_loss_until_s
    }

    /// Named preset for the CLI.
    pub fn preset(name: &str) -> Option<Self> {
        let base = Self::default();
        match name {
            "default" => Some(base),
            "fall" => Some(Self { active: vec![ScenarioType::Fall], ..base }),
            "sos" => Some(Self { active: vec![ScenarioType::Sos], ..base }),
            "gps-loss" => Some(Self { active: vec![ScenarioType::GpsLoss], ..base }),
            "low-battery" => Some(Self {
                active: vec![ScenarioType::LowBattery],
                start_battery_frac: 0.12,
                ..base
            }),
            "rough" => Some(Self { active: vec![ScenarioType::RoughTerrain], ..base }),
            "mayday" => Some(Self {
                active: vec![ScenarioType::Fall, ScenarioType::Sos, ScenarioType::GpsLoss],
                ..base
            }),
            _ => None,
        }
    }
}
