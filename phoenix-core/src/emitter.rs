//! Emitter transmit loop.
//!
//! `Idle → Starting → Advertising → Stopping → Idle`, with an `Error`
//! excursion that returns to `Idle` after a stop attempt. Each tick:
//! acquire a sensor snapshot, fuse it into beacon fields, rebuild the
//! advertisement (stop before start, so platforms that cache payloads
//! pick up the new data), then arm a single deferred tick at the adaptive
//! interval. Emergencies dominate battery saving: SOS/fall/unstable beat
//! every power state.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use phoenix_proto::{encode, wrap, BeaconFields, DeviceId};

use crate::config::EmitterConfig;
use crate::error::PhoenixError;
use crate::fusion::{FusionOutput, SensorFusion};
use crate::platform::{Clock, Peripheral, RadioState, SensorSuite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterStatus {
    Idle,
    Starting,
    Advertising,
    Stopping,
    Error,
}

pub struct Emitter<P: Peripheral, S: SensorSuite, C: Clock> {
    cfg: EmitterConfig,
    device_id: DeviceId,
    peripheral: P,
    sensors: S,
    clock: C,
    fusion: SensorFusion,
    status: EmitterStatus,
    boot_ms: u64,
    sos_activated: bool,
}

impl<P: Peripheral, S: SensorSuite, C: Clock> Emitter<P, S, C> {
    pub fn new(cfg: EmitterConfig, device_id: DeviceId, peripheral: P, sensors: S, clock: C) -> Self {
        let fusion = SensorFusion::new(&cfg);
        Self {
            cfg,
            device_id,
            peripheral,
            sensors,
            clock,
            fusion,
            status: EmitterStatus::Idle,
            boot_ms: 0,
            sos_activated: false,
        }
    }

    pub fn status(&self) -> EmitterStatus {
        self.status
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// External SOS input (button, companion app). Takes effect on the
    /// next tick.
    pub fn set_sos(&mut self, activated: bool) {
        self.sos_activated = activated;
    }

    /// Bring up the radio and the sensor streams. Idempotent while
    /// advertising. Individual sensor-stream failures are logged and
    /// tolerated; an unusable radio is not.
    pub fn start(&mut self) -> Result<(), PhoenixError> {
        if self.status == EmitterStatus::Advertising {
            return Ok(());
        }
        self.status = EmitterStatus::Starting;

        if let Err(e) = self.peripheral.initialize() {
            self.status = EmitterStatus::Idle;
            return Err(e);
        }
        match self.peripheral.state() {
            RadioState::PoweredOn => {}
            state => {
                self.status = EmitterStatus::Idle;
                return Err(PhoenixError::BleUnavailable { state });
            }
        }

        for modality in self.sensors.start() {
            let degraded = PhoenixError::SensorUnavailable { modality };
            warn!(error = %degraded, "sensor stream failed to start, continuing degraded");
        }

        self.boot_ms = self.clock.now_ms();
        self.fusion = SensorFusion::new(&self.cfg);
        self.status = EmitterStatus::Advertising;
        info!(device_id = %self.device_id, "emitter advertising");
        Ok(())
    }

    /// One transmit tick: snapshot → fuse → encode → advertise. Returns
    /// the delay until the next tick, or `None` when the emitter is no
    /// longer advertising (a late tick after stop is a no-op).
    pub fn tick(&mut self) -> Result<Option<Duration>, PhoenixError> {
        if self.status != EmitterStatus::Advertising {
            return Ok(None);
        }

        let now_ms = self.clock.now_ms();
        let snapshot = self.sensors.snapshot();
        let fused = self.fusion.ingest(&snapshot, self.sos_activated, now_ms);

        let fields = BeaconFields {
            device_id: self.device_id,
            latitude: fused.latitude,
            longitude: fused.longitude,
            altitude_msl_m: fused.altitude_msl_m,
            relative_altitude_cm: fused.relative_altitude_cm,
            battery_pct: fused.battery_pct,
            timestamp_s: now_ms.saturating_sub(self.boot_ms) as f64 / 1000.0,
            flags: fused.flags.into(),
        };
        let frame = wrap(&encode(&fields), self.cfg.company_id);

        // Stop first to force a payload refresh; a stop failure here only
        // means nothing was advertising yet.
        let _ = self.peripheral.stop_advertising();
        if let Err(e) = self.peripheral.start_advertising(&frame) {
            warn!(error = %e, "advertising refresh failed");
            self.status = EmitterStatus::Error;
            let _ = self.peripheral.stop_advertising();
            self.sensors.stop();
            self.status = EmitterStatus::Idle;
            return Err(e);
        }

        let interval_ms = self.next_interval_ms(&fused);
        debug!(
            device_id = %self.device_id,
            flags = fields.flags.0,
            battery = fused.battery_pct,
            interval_ms,
            "beacon refreshed"
        );
        Ok(Some(Duration::from_millis(interval_ms)))
    }

    /// Adaptive cadence, first match wins.
    fn next_interval_ms(&self, fused: &FusionOutput) -> u64 {
        let f = &fused.flags;
        if f.sos_activated || f.fall_detected || f.unstable_environment {
            self.cfg.interval_emergency_ms
        } else if fused.battery_pct < 10.0 {
            self.cfg.interval_critical_ms
        } else if f.low_battery {
            self.cfg.interval_power_save_ms
        } else if f.motion_detected {
            self.cfg.interval_active_ms
        } else {
            self.cfg.interval_normal_ms
        }
    }

    /// Cancel the pending tick (the run loop observes the status change),
    /// stop the radio and the sensor streams. Best-effort and idempotent.
    pub fn stop(&mut self) {
        if self.status == EmitterStatus::Idle {
            return;
        }
        self.status = EmitterStatus::Stopping;
        let _ = self.peripheral.stop_advertising();
        self.sensors.stop();
        self.status = EmitterStatus::Idle;
        info!(device_id = %self.device_id, "emitter stopped");
    }

    /// Drive the transmit loop until `shutdown` flips true or a
    /// transmission error surfaces. The caller decides whether to restart
    /// after an error.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PhoenixError> {
        self.start()?;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = match self.tick()? {
                Some(d) => d,
                None => break,
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::platform::{
        AccelSample, BatterySample, ManualClock, SensorModality, SensorSnapshot,
    };
    use phoenix_proto::{unwrap, BeaconPayload, FRAME_LEN};

    #[derive(Clone)]
    struct FakePeripheral {
        state: Arc<Mutex<RadioState>>,
        frames: Arc<Mutex<Vec<[u8; FRAME_LEN]>>>,
        stops: Arc<Mutex<u32>>,
        fail_start: Arc<Mutex<bool>>,
    }

    impl Default for FakePeripheral {
        fn default() -> Self {
            Self {
                state: Arc::new(Mutex::new(RadioState::PoweredOn)),
                frames: Arc::new(Mutex::new(Vec::new())),
                stops: Arc::new(Mutex::new(0)),
                fail_start: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl Peripheral for FakePeripheral {
        fn initialize(&mut self) -> Result<(), PhoenixError> {
            Ok(())
        }
        fn state(&self) -> RadioState {
            *self.state.lock().unwrap()
        }
        fn start_advertising(&mut self, frame: &[u8; FRAME_LEN]) -> Result<(), PhoenixError> {
            if *self.fail_start.lock().unwrap() {
                return Err(PhoenixError::TransmissionError { cause: "refused".into() });
            }
            self.frames.lock().unwrap().push(*frame);
            Ok(())
        }
        fn stop_advertising(&mut self) -> Result<(), PhoenixError> {
            *self.stops.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct ScriptedSensors {
        snapshot: Arc<Mutex<SensorSnapshot>>,
        failed: Vec<SensorModality>,
        stopped: Arc<Mutex<bool>>,
    }

    impl SensorSuite for ScriptedSensors {
        fn start(&mut self) -> Vec<SensorModality> {
            self.failed.clone()
        }
        fn snapshot(&mut self) -> SensorSnapshot {
            self.snapshot.lock().unwrap().clone()
        }
        fn stop(&mut self) {
            *self.stopped.lock().unwrap() = true;
        }
    }

    fn emitter_with(
        peripheral: FakePeripheral,
        sensors: ScriptedSensors,
        clock: ManualClock,
    ) -> Emitter<FakePeripheral, ScriptedSensors, ManualClock> {
        Emitter::new(
            EmitterConfig::default(),
            DeviceId(0x1234_5678),
            peripheral,
            sensors,
            clock,
        )
    }

    fn set_battery(sensors: &ScriptedSensors, fraction: f64) {
        sensors.snapshot.lock().unwrap().battery =
            Some(BatterySample { fraction, is_charging: false });
    }

    #[test]
    fn tick_emits_a_decodable_frame() {
        let peripheral = FakePeripheral::default();
        let sensors = ScriptedSensors::default();
        set_battery(&sensors, 0.87);
        let clock = ManualClock::new(0);
        let mut e = emitter_with(peripheral.clone(), sensors, clock.clone());

        e.start().unwrap();
        clock.advance(2_500);
        let delay = e.tick().unwrap().unwrap();
        assert_eq!(delay, Duration::from_millis(5_000));

        let frames = peripheral.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let (company_id, payload) = unwrap(&frames[0]).unwrap();
        assert_eq!(company_id, 0x004C);
        let p = BeaconPayload::decode(&payload).unwrap();
        assert_eq!(p.device_id, DeviceId(0x1234_5678));
        assert_eq!(p.battery_pct, 87);
        assert_eq!(p.timestamp_s, 2);
        assert!(p.flags.stationary());
        assert!(!p.flags.gps_valid());
    }

    #[test]
    fn emergency_dominates_battery() {
        // SOS with 5% battery chooses the 1 s emergency cadence, not the
        // 15 s critical one.
        let sensors = ScriptedSensors::default();
        set_battery(&sensors, 0.05);
        let mut e = emitter_with(FakePeripheral::default(), sensors, ManualClock::new(0));
        e.set_sos(true);
        e.start().unwrap();
        assert_eq!(e.tick().unwrap().unwrap(), Duration::from_millis(1_000));

        e.set_sos(false);
        assert_eq!(e.tick().unwrap().unwrap(), Duration::from_millis(15_000));
    }

    #[test]
    fn cadence_priority_order() {
        let sensors = ScriptedSensors::default();
        let mut e = emitter_with(FakePeripheral::default(), sensors.clone(), ManualClock::new(0));
        e.start().unwrap();

        set_battery(&sensors, 0.15);
        assert_eq!(e.tick().unwrap().unwrap(), Duration::from_millis(10_000));

        set_battery(&sensors, 0.80);
        sensors.snapshot.lock().unwrap().accel = Some(AccelSample { x: 0.0, y: 0.0, z: 1.4 });
        assert_eq!(e.tick().unwrap().unwrap(), Duration::from_millis(3_000));

        sensors.snapshot.lock().unwrap().accel = Some(AccelSample { x: 0.0, y: 0.0, z: 1.0 });
        assert_eq!(e.tick().unwrap().unwrap(), Duration::from_millis(5_000));
    }

    #[test]
    fn refuses_to_start_without_radio() {
        let peripheral = FakePeripheral::default();
        *peripheral.state.lock().unwrap() = RadioState::PoweredOff;
        let mut e = emitter_with(peripheral, ScriptedSensors::default(), ManualClock::new(0));
        assert_eq!(
            e.start(),
            Err(PhoenixError::BleUnavailable { state: RadioState::PoweredOff })
        );
        assert_eq!(e.status(), EmitterStatus::Idle);
    }

    #[test]
    fn degraded_sensors_still_transmit() {
        let peripheral = FakePeripheral::default();
        let sensors = ScriptedSensors {
            failed: vec![SensorModality::Location, SensorModality::Altimeter],
            ..ScriptedSensors::default()
        };
        let mut e = emitter_with(peripheral.clone(), sensors, ManualClock::new(0));
        e.start().unwrap();
        e.tick().unwrap().unwrap();
        let frames = peripheral.frames.lock().unwrap();
        let (_, payload) = unwrap(&frames[0]).unwrap();
        let p = BeaconPayload::decode(&payload).unwrap();
        assert!(!p.flags.gps_valid());
        assert_eq!(p.latitude, 0.0);
    }

    #[test]
    fn transmission_failure_lands_in_idle() {
        let peripheral = FakePeripheral::default();
        *peripheral.fail_start.lock().unwrap() = true;
        let sensors = ScriptedSensors::default();
        let mut e = emitter_with(peripheral, sensors.clone(), ManualClock::new(0));
        e.start().unwrap();
        assert!(matches!(e.tick(), Err(PhoenixError::TransmissionError { .. })));
        assert_eq!(e.status(), EmitterStatus::Idle);
        assert!(*sensors.stopped.lock().unwrap());
        // A late tick after the failure is a no-op
        assert_eq!(e.tick().unwrap(), None);
    }

    #[test]
    fn stop_is_idempotent_and_restartable() {
        let peripheral = FakePeripheral::default();
        let mut e = emitter_with(peripheral.clone(), ScriptedSensors::default(), ManualClock::new(0));
        e.start().unwrap();
        e.stop();
        e.stop();
        assert_eq!(e.status(), EmitterStatus::Idle);
        assert_eq!(e.tick().unwrap(), None);

        // Re-entry into Advertising works, and start while advertising is
        // a no-op
        e.start().unwrap();
        e.start().unwrap();
        assert_eq!(e.status(), EmitterStatus::Advertising);
    }

    #[tokio::test]
    async fn run_honors_shutdown() {
        let peripheral = FakePeripheral::default();
        let mut e = emitter_with(peripheral.clone(), ScriptedSensors::default(), ManualClock::new(0));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let _ = e.run(rx).await;
            e.status()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let status = handle.await.unwrap();
        assert_eq!(status, EmitterStatus::Idle);
        assert!(!peripheral.frames.lock().unwrap().is_empty());
    }
}
