//! # phoenix-core
//!
//! Core engine of the Phoenix peer-to-peer emergency locator.
//!
//! An emitter broadcasts a 24-byte BLE manufacturer-data beacon carrying
//! position, altitude, battery and condition flags; a receiver scans,
//! decodes and guides a user to a chosen emitter with distance, bearing
//! and haptics, degrading to GPS tracking when the BLE link lapses.
//!
//! ## Architecture
//!
//! - [`emitter`]: sensor acquisition → [`fusion`] → beacon build →
//!   peripheral advertisement, on an adaptive cadence (1 s emergency to
//!   15 s battery-critical)
//! - [`receiver`]: scan ingress → frame filter → per-emitter record store
//!   with RSSI smoothing, cached-GPS retention and location history
//! - [`finder`]: per-tick guidance (distance model, proximity hysteresis,
//!   bearing, haptic cadence) over read-only record snapshots
//! - [`platform`]: the adapter traits the host platform implements
//!   (BLE peripheral/central, sensors, haptics, monotonic clock)
//!
//! Each side runs as a single cooperative task; platform callbacks are
//! delivered through channels onto that task so all shared state is
//! mutated from one place.

pub mod config;
pub mod emitter;
pub mod error;
pub mod finder;
pub mod fusion;
pub mod geo;
pub mod platform;
pub mod receiver;
pub mod rssi;

pub use config::{EmitterConfig, FinderConfig, ReceiverConfig};
pub use error::PhoenixError;
