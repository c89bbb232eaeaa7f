//! # phoenix-proto
//!
//! Shared beacon wire types for the Phoenix emergency locator.
//!
//! These types are used by:
//! - `phoenix-core`: emitter side (encode + frame) and receiver side
//!   (unframe + decode + validate)
//! - `phoenix-simulator`: crafting and inspecting frames on the simulated air
//!
//! ## Wire format
//!
//! Manufacturer-specific advertisement data, 24 bytes total:
//!
//! ```text
//! [CompanyID:2 LE] [Magic:2 LE = 0x5048 "PH"] [Payload:20]
//! ```
//!
//! The 20-byte payload uses big-endian multi-byte fields:
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 4    | DeviceId         |
//! | 4      | 4    | Latitude (f32)   |
//! | 8      | 4    | Longitude (f32)  |
//! | 12     | 2    | AltitudeMSL (m)  |
//! | 14     | 2    | RelativeAlt (cm) |
//! | 16     | 1    | Battery (%)      |
//! | 17     | 2    | Timestamp (s)    |
//! | 19     | 1    | Flags            |
//!
//! There is no version byte; format changes must repurpose reserved flag
//! bits or change the magic.

use bytes::{Buf, BufMut};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Beacon payload length on the wire.
pub const PAYLOAD_LEN: usize = 20;
/// Full manufacturer-data frame length (company id + magic + payload).
pub const FRAME_LEN: usize = 24;
/// Frame magic, "PH" little-endian.
pub const MAGIC: u16 = 0x5048;
/// Company identifiers accepted on decode.
pub const ACCEPTED_COMPANY_IDS: [u16; 2] = [0x004C, 0x0075];

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Payload is not exactly [`PAYLOAD_LEN`] bytes.
    #[error("bad payload size: expected {expected} bytes, got {actual}")]
    BadSize { expected: usize, actual: usize },
    /// A decoded field violates its documented range.
    #[error("field out of range: {field}")]
    BadRange { field: &'static str },
    /// Manufacturer data is not a Phoenix frame (length, magic or company id).
    #[error("not a phoenix frame")]
    NotPhoenix,
}

// ── Device identity ───────────────────────────────────────────────────────────

/// Opaque 4-byte device identity carried in every beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Default identity for a factory-fresh emitter.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self(rng.gen())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

// ── Condition flags ───────────────────────────────────────────────────────────

/// Per-flag emitter condition, assembled into the payload flags byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagStates {
    pub motion_detected: bool,
    pub is_charging: bool,
    pub sos_activated: bool,
    pub low_battery: bool,
    pub gps_valid: bool,
    pub stationary: bool,
    pub fall_detected: bool,
    pub unstable_environment: bool,
}

/// Wire flags byte. Bit 0 is the LSB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconFlags(pub u8);

impl BeaconFlags {
    pub const MOTION_DETECTED: u8 = 1 << 0;
    pub const IS_CHARGING: u8 = 1 << 1;
    pub const SOS_ACTIVATED: u8 = 1 << 2;
    pub const LOW_BATTERY: u8 = 1 << 3;
    pub const GPS_VALID: u8 = 1 << 4;
    pub const STATIONARY: u8 = 1 << 5;
    pub const FALL_DETECTED: u8 = 1 << 6;
    pub const UNSTABLE_ENVIRONMENT: u8 = 1 << 7;

    pub fn motion_detected(self) -> bool { self.0 & Self::MOTION_DETECTED != 0 }
    pub fn is_charging(self) -> bool { self.0 & Self::IS_CHARGING != 0 }
    pub fn sos_activated(self) -> bool { self.0 & Self::SOS_ACTIVATED != 0 }
    pub fn low_battery(self) -> bool { self.0 & Self::LOW_BATTERY != 0 }
    pub fn gps_valid(self) -> bool { self.0 & Self::GPS_VALID != 0 }
    pub fn stationary(self) -> bool { self.0 & Self::STATIONARY != 0 }
    pub fn fall_detected(self) -> bool { self.0 & Self::FALL_DETECTED != 0 }
    pub fn unstable_environment(self) -> bool { self.0 & Self::UNSTABLE_ENVIRONMENT != 0 }

    /// True when any of the emergency conditions (SOS, fall, unstable
    /// environment) is raised.
    pub fn emergency(self) -> bool {
        self.sos_activated() || self.fall_detected() || self.unstable_environment()
    }
}

impl From<FlagStates> for BeaconFlags {
    fn from(s: FlagStates) -> Self {
        let mut bits = 0u8;
        if s.motion_detected { bits |= Self::MOTION_DETECTED; }
        if s.is_charging { bits |= Self::IS_CHARGING; }
        if s.sos_activated { bits |= Self::SOS_ACTIVATED; }
        if s.low_battery { bits |= Self::LOW_BATTERY; }
        if s.gps_valid { bits |= Self::GPS_VALID; }
        if s.stationary { bits |= Self::STATIONARY; }
        if s.fall_detected { bits |= Self::FALL_DETECTED; }
        if s.unstable_environment { bits |= Self::UNSTABLE_ENVIRONMENT; }
        BeaconFlags(bits)
    }
}

// ── Encoder input ─────────────────────────────────────────────────────────────

/// Rich-typed encoder input, as produced by emitter sensor fusion.
///
/// The encoder canonicalizes on the way to the wire: battery is clamped to
/// [0, 100] and rounded, altitudes are rounded (MSL to whole metres,
/// relative to whole centimetres), the timestamp is floored and saturates
/// at 65535 s. AltitudeMSL is NOT clamped here — the fusion layer is
/// expected to pre-clamp to [-500, 9000].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeaconFields {
    pub device_id: DeviceId,
    /// Degrees, [-90, 90]. Written as 0.0 when gps_valid is false.
    pub latitude: f32,
    /// Degrees, [-180, 180]. Written as 0.0 when gps_valid is false.
    pub longitude: f32,
    /// Metres above mean sea level.
    pub altitude_msl_m: f32,
    /// Centimetres from the emitter's start altitude.
    pub relative_altitude_cm: f32,
    /// Percent, [0, 100].
    pub battery_pct: f32,
    /// Seconds since emitter boot.
    pub timestamp_s: f64,
    pub flags: BeaconFlags,
}

impl BeaconFields {
    /// Apply the encoder's clamping and rounding without serializing.
    ///
    /// `decode(encode(f)) == f.canonicalize()` for all inputs.
    pub fn canonicalize(&self) -> BeaconPayload {
        BeaconPayload {
            device_id: self.device_id,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude_msl_m: self.altitude_msl_m.round() as i16,
            relative_altitude_cm: self.relative_altitude_cm.round() as i16,
            battery_pct: self.battery_pct.clamp(0.0, 100.0).round() as u8,
            timestamp_s: self.timestamp_s.max(0.0).floor().min(65535.0) as u16,
            flags: self.flags,
        }
    }
}

impl From<BeaconPayload> for BeaconFields {
    fn from(p: BeaconPayload) -> Self {
        Self {
            device_id: p.device_id,
            latitude: p.latitude,
            longitude: p.longitude,
            altitude_msl_m: p.altitude_msl_m as f32,
            relative_altitude_cm: p.relative_altitude_cm as f32,
            battery_pct: p.battery_pct as f32,
            timestamp_s: p.timestamp_s as f64,
            flags: p.flags,
        }
    }
}

// ── Decoded payload ───────────────────────────────────────────────────────────

/// A beacon payload exactly as carried on the wire.
///
/// `decode` performs no range enforcement; receivers call [`BeaconPayload::validate`]
/// before admitting a payload to the record store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeaconPayload {
    pub device_id: DeviceId,
    pub latitude: f32,
    pub longitude: f32,
    pub altitude_msl_m: i16,
    pub relative_altitude_cm: i16,
    pub battery_pct: u8,
    pub timestamp_s: u16,
    pub flags: BeaconFlags,
}

impl BeaconPayload {
    /// Deserialize a 20-byte payload. Fails with `BadSize` on any other length.
    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() != PAYLOAD_LEN {
            return Err(ProtoError::BadSize { expected: PAYLOAD_LEN, actual: data.len() });
        }
        let mut r = data;
        Ok(Self {
            device_id: DeviceId(r.get_u32()),
            latitude: r.get_f32(),
            longitude: r.get_f32(),
            altitude_msl_m: r.get_i16(),
            relative_altitude_cm: r.get_i16(),
            battery_pct: r.get_u8(),
            timestamp_s: r.get_u16(),
            flags: BeaconFlags(r.get_u8()),
        })
    }

    /// Serialize back to the exact wire bytes.
    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        encode(&BeaconFields::from(*self))
    }

    /// Range invariants, reported per field.
    ///
    /// NaN coordinates fail the range comparison and are rejected here.
    pub fn check(&self) -> Result<(), ProtoError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ProtoError::BadRange { field: "latitude" });
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ProtoError::BadRange { field: "longitude" });
        }
        if self.battery_pct > 100 {
            return Err(ProtoError::BadRange { field: "battery" });
        }
        if !(-500..=9000).contains(&self.altitude_msl_m) {
            return Err(ProtoError::BadRange { field: "altitude_msl" });
        }
        if self.flags.low_battery() && self.battery_pct >= 20 {
            return Err(ProtoError::BadRange { field: "low_battery" });
        }
        Ok(())
    }

    /// Receiver-side admission check.
    pub fn validate(&self) -> bool {
        self.check().is_ok()
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Serialize encoder fields into the 20-byte wire payload.
pub fn encode(f: &BeaconFields) -> [u8; PAYLOAD_LEN] {
    let canonical = f.canonicalize();
    let mut buf = [0u8; PAYLOAD_LEN];
    let mut w = &mut buf[..];
    w.put_u32(canonical.device_id.0);
    w.put_f32(canonical.latitude);
    w.put_f32(canonical.longitude);
    w.put_i16(canonical.altitude_msl_m);
    w.put_i16(canonical.relative_altitude_cm);
    w.put_u8(canonical.battery_pct);
    w.put_u16(canonical.timestamp_s);
    w.put_u8(canonical.flags.0);
    buf
}

/// Wrap a payload into the 24-byte manufacturer-data frame.
///
/// Framing fields are little-endian per BLE manufacturer-data convention;
/// the payload itself stays big-endian.
pub fn wrap(payload: &[u8; PAYLOAD_LEN], company_id: u16) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    let mut w = &mut buf[..];
    w.put_u16_le(company_id);
    w.put_u16_le(MAGIC);
    w.put_slice(payload);
    buf
}

/// Extract `(company_id, payload)` from manufacturer data.
///
/// Fails with `NotPhoenix` unless the length is exactly 24, the magic is
/// 0x5048 and the company id is one of [`ACCEPTED_COMPANY_IDS`].
pub fn unwrap(data: &[u8]) -> Result<(u16, [u8; PAYLOAD_LEN]), ProtoError> {
    if data.len() != FRAME_LEN {
        return Err(ProtoError::NotPhoenix);
    }
    let mut r = data;
    let company_id = r.get_u16_le();
    let magic = r.get_u16_le();
    if magic != MAGIC || !ACCEPTED_COMPANY_IDS.contains(&company_id) {
        return Err(ProtoError::NotPhoenix);
    }
    let mut payload = [0u8; PAYLOAD_LEN];
    payload.copy_from_slice(r);
    Ok((company_id, payload))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
