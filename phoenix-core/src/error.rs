//! Error kinds raised by the core.
//!
//! Codec errors stay local to the call site; BLE lifecycle errors surface
//! to the caller of start/stop; decode/validate failures in the scan hot
//! path are counted, not surfaced. Nothing here retries transparently —
//! the caller decides whether to restart.

use thiserror::Error;

use crate::platform::{RadioState, SensorModality};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhoenixError {
    /// The BLE peripheral/central cannot be used in its current state.
    #[error("bluetooth unavailable: {state:?}")]
    BleUnavailable { state: RadioState },

    /// The peripheral refused to start advertising.
    #[error("advertising failed: {cause}")]
    TransmissionError { cause: String },

    /// The central reported a scan failure.
    #[error("scan failed: {cause}")]
    ScanFailed { cause: String },

    /// A sensor stream could not be started. Non-fatal: fusion degrades.
    #[error("sensor unavailable: {modality:?}")]
    SensorUnavailable { modality: SensorModality },

    /// The precision finder has no receiver location fix yet.
    #[error("no receiver location yet")]
    NoLocationYet,

    /// Beacon codec failure.
    #[error(transparent)]
    Proto(#[from] phoenix_proto::ProtoError),
}
