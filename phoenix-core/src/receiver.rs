//! Receiver scan ingress and per-emitter record store.
//!
//! Runs as a single task: the platform central pushes advertisements into
//! an mpsc channel, a 250 ms housekeeping tick drives stale eviction, and
//! every mutation of the store happens here. The precision finder and any
//! UI read cloned snapshots, never the live records.
//!
//! Ingress pipeline per advertisement:
//! 1. unframe (company id + magic) — foreign frames dropped silently
//! 2. decode + validate — malformed beacons dropped and counted
//! 3. record create/update: RSSI smoothing, cached-GPS retention,
//!    location history, last-seen
//! 4. observers notified via a broadcast channel

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

use phoenix_proto::{unwrap, BeaconPayload, DeviceId};

use crate::config::ReceiverConfig;
use crate::error::PhoenixError;
use crate::geo::haversine_m;
use crate::platform::{Advertisement, Central, Clock, RadioState};
use crate::rssi::RssiFilter;

/// Housekeeping cadence: stale eviction and observer wakeups (ms).
const RECEIVER_TICK_MS: u64 = 250;
/// Advertisement channel depth. A full queue drops: the beacon repeats.
const ADVERTISEMENT_QUEUE: usize = 256;
/// Observer broadcast depth.
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverStatus {
    Idle,
    Scanning,
    Error,
}

/// One retained GPS point of an emitter's track.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LocationPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub t_ms: u64,
}

/// Everything known about one emitter. Created on first successful decode,
/// mutated on every subsequent decode for the same device id, evicted when
/// stale.
#[derive(Debug, Clone, Serialize)]
pub struct EmitterRecord {
    pub device_id: DeviceId,
    /// Platform peer identifier of the most recent advertisement.
    /// Display/debug only — addresses rotate.
    pub ble_peer_id: String,
    /// Device name from scan response, if the platform ever supplied one.
    pub display_name: Option<String>,
    /// Latest payload, with coordinates retained from the last GPS-valid
    /// one when the emitter has lost its fix.
    pub payload: BeaconPayload,
    pub rssi_raw: i32,
    pub rssi_smoothed: i32,
    #[serde(skip)]
    rssi: RssiFilter,
    pub using_cached_gps: bool,
    pub location_history: VecDeque<LocationPoint>,
    pub last_seen_ms: u64,
}

impl EmitterRecord {
    pub(crate) fn first(payload: BeaconPayload, adv: &Advertisement, cfg: &ReceiverConfig) -> Self {
        let mut rssi = RssiFilter::new(cfg);
        let rssi_smoothed = rssi.push(adv.rssi_dbm);
        let mut record = Self {
            device_id: payload.device_id,
            ble_peer_id: adv.peer_id.clone(),
            display_name: adv.name.clone(),
            payload,
            rssi_raw: adv.rssi_dbm,
            rssi_smoothed,
            rssi,
            using_cached_gps: false,
            location_history: VecDeque::new(),
            last_seen_ms: adv.t_ms,
        };
        if payload.flags.gps_valid() {
            record.push_location(&payload, adv.t_ms, cfg);
        }
        record
    }

    fn apply(&mut self, new_payload: BeaconPayload, adv: &Advertisement, cfg: &ReceiverConfig) {
        self.ble_peer_id = adv.peer_id.clone();
        if let Some(name) = &adv.name {
            self.display_name = Some(name.clone());
        }
        self.rssi_raw = adv.rssi_dbm;
        self.rssi_smoothed = self.rssi.push(adv.rssi_dbm);

        // The emitter zeroes coordinates when its fix lapses; the receiver
        // is the side that remembers where the beacon last was.
        let had_gps = self.payload.flags.gps_valid() || self.using_cached_gps;
        if !new_payload.flags.gps_valid() && had_gps {
            let mut merged = new_payload;
            merged.latitude = self.payload.latitude;
            merged.longitude = self.payload.longitude;
            merged.altitude_msl_m = self.payload.altitude_msl_m;
            self.payload = merged;
            self.using_cached_gps = true;
        } else {
            self.payload = new_payload;
            self.using_cached_gps = false;
        }

        if new_payload.flags.gps_valid() {
            self.push_location(&new_payload, adv.t_ms, cfg);
        }
        self.last_seen_ms = adv.t_ms;
    }

    fn push_location(&mut self, payload: &BeaconPayload, t_ms: u64, cfg: &ReceiverConfig) {
        let lat = payload.latitude as f64;
        let lon = payload.longitude as f64;
        let moved_enough = match self.location_history.back() {
            None => true,
            Some(last) => {
                haversine_m(last.latitude, last.longitude, lat, lon) > cfg.gps_history_min_step_m
            }
        };
        if moved_enough {
            self.location_history.push_back(LocationPoint {
                latitude: lat,
                longitude: lon,
                altitude_m: payload.altitude_msl_m as f64,
                t_ms,
            });
            while self.location_history.len() > cfg.location_history_n {
                self.location_history.pop_front();
            }
        }
    }

    /// Whether the stored payload carries usable coordinates, live or
    /// retained.
    pub fn has_coordinates(&self) -> bool {
        self.payload.flags.gps_valid() || self.using_cached_gps
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.has_coordinates()
            .then(|| (self.payload.latitude as f64, self.payload.longitude as f64))
    }

    pub fn rssi_history(&self) -> &VecDeque<i32> {
        self.rssi.history()
    }
}

/// Ingress counters, monotonically increasing for the life of the
/// receiver.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReceiverStats {
    pub frames_seen: u64,
    pub accepted: u64,
    pub dropped_not_phoenix: u64,
    pub dropped_invalid: u64,
}

/// Store change notifications for UI layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverEvent {
    Updated(DeviceId),
    Evicted(DeviceId),
}

pub struct Receiver<B: Central, C: Clock> {
    cfg: ReceiverConfig,
    central: B,
    clock: C,
    status: ReceiverStatus,
    records: HashMap<DeviceId, EmitterRecord>,
    stats: ReceiverStats,
    events: broadcast::Sender<ReceiverEvent>,
    adv_rx: Option<mpsc::Receiver<Advertisement>>,
}

impl<B: Central, C: Clock> Receiver<B, C> {
    pub fn new(cfg: ReceiverConfig, central: B, clock: C) -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        Self {
            cfg,
            central,
            clock,
            status: ReceiverStatus::Idle,
            records: HashMap::new(),
            stats: ReceiverStats::default(),
            events,
            adv_rx: None,
        }
    }

    pub fn status(&self) -> ReceiverStatus {
        self.status
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// Subscribe to store change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverEvent> {
        self.events.subscribe()
    }

    pub fn records(&self) -> impl Iterator<Item = &EmitterRecord> {
        self.records.values()
    }

    pub fn record(&self, device_id: DeviceId) -> Option<&EmitterRecord> {
        self.records.get(&device_id)
    }

    /// Cloned snapshot for a finder/UI tick.
    pub fn snapshot(&self, device_id: DeviceId) -> Option<EmitterRecord> {
        self.records.get(&device_id).cloned()
    }

    /// Bring up the central and start scanning (duplicates allowed, so a
    /// stationary emitter keeps producing RSSI updates). Idempotent while
    /// scanning.
    pub fn start(&mut self) -> Result<(), PhoenixError> {
        if self.status == ReceiverStatus::Scanning {
            return Ok(());
        }
        self.central.initialize()?;
        match self.central.state() {
            RadioState::PoweredOn => {}
            state => return Err(PhoenixError::BleUnavailable { state }),
        }
        let (tx, rx) = mpsc::channel(ADVERTISEMENT_QUEUE);
        self.central.start_scanning(tx)?;
        self.adv_rx = Some(rx);
        self.status = ReceiverStatus::Scanning;
        info!("receiver scanning");
        Ok(())
    }

    /// Take ownership of the scan stream after [`Receiver::start`], for
    /// hosts that drive their own cooperative loop instead of
    /// [`Receiver::run`]. The caller feeds each advertisement back through
    /// [`Receiver::ingest`] and drives [`Receiver::evict_stale`] on its
    /// tick.
    pub fn take_scan_stream(&mut self) -> Option<mpsc::Receiver<Advertisement>> {
        self.adv_rx.take()
    }

    /// Stop scanning. Best-effort and idempotent; records are kept so a
    /// restart resumes guidance immediately.
    pub fn stop(&mut self) {
        if self.status == ReceiverStatus::Idle {
            return;
        }
        let _ = self.central.stop_scanning();
        self.adv_rx = None;
        self.status = ReceiverStatus::Idle;
        info!("receiver stopped");
    }

    /// Process one advertisement. Late callbacks after stop are no-ops.
    pub fn ingest(&mut self, adv: Advertisement) {
        if self.status != ReceiverStatus::Scanning {
            return;
        }
        self.stats.frames_seen += 1;

        let (_company_id, payload_bytes) = match unwrap(&adv.manufacturer_data) {
            Ok(parts) => parts,
            Err(_) => {
                // Foreign manufacturer data is normal background noise.
                // Only a peer that calls itself Phoenix deserves a trace.
                if adv.name.as_deref().is_some_and(|n| n.to_ascii_lowercase().contains("phoenix")) {
                    debug!(peer = %adv.peer_id, "phoenix-named peer sent a foreign frame");
                }
                self.stats.dropped_not_phoenix += 1;
                return;
            }
        };

        let payload = match BeaconPayload::decode(&payload_bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!(peer = %adv.peer_id, error = %e, "undecodable beacon dropped");
                self.stats.dropped_invalid += 1;
                return;
            }
        };
        if let Err(e) = payload.check() {
            debug!(peer = %adv.peer_id, error = %e, "invalid beacon dropped");
            self.stats.dropped_invalid += 1;
            return;
        }

        let device_id = payload.device_id;
        match self.records.get_mut(&device_id) {
            Some(record) => record.apply(payload, &adv, &self.cfg),
            None => {
                info!(device_id = %device_id, rssi = adv.rssi_dbm, "emitter discovered");
                self.records
                    .insert(device_id, EmitterRecord::first(payload, &adv, &self.cfg));
            }
        }
        self.stats.accepted += 1;
        let _ = self.events.send(ReceiverEvent::Updated(device_id));
    }

    /// Drop records not heard from within the stale timeout.
    pub fn evict_stale(&mut self, now_ms: u64) {
        let timeout = self.cfg.stale_timeout_ms;
        let stale: Vec<DeviceId> = self
            .records
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.last_seen_ms) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for device_id in stale {
            self.records.remove(&device_id);
            info!(device_id = %device_id, "stale emitter record evicted");
            let _ = self.events.send(ReceiverEvent::Evicted(device_id));
        }
    }

    /// Drive ingress and housekeeping until `shutdown` flips true. If the
    /// scan stream ends underneath us the receiver lands in `Idle` and the
    /// failure is surfaced; the caller decides whether to restart.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PhoenixError> {
        self.start()?;
        let mut rx = match self.adv_rx.take() {
            Some(rx) => rx,
            None => return Ok(()),
        };
        let mut tick = tokio::time::interval(Duration::from_millis(RECEIVER_TICK_MS));
        let mut stream_err = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                maybe_adv = rx.recv() => match maybe_adv {
                    Some(adv) => self.ingest(adv),
                    None => {
                        self.status = ReceiverStatus::Error;
                        stream_err = Some(PhoenixError::ScanFailed {
                            cause: "scan stream ended".into(),
                        });
                        break;
                    }
                },
                _ = tick.tick() => {
                    let now_ms = self.clock.now_ms();
                    self.evict_stale(now_ms);
                }
            }
        }

        self.stop();
        match stream_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
