//! main.rs — Phoenix end-to-end simulator
//!
//! Runs the whole locator pipeline in one process:
//!   1. Physics loop: advances the casualty at 20 Hz
//!   2. Emitter task: the real core transmit loop over a simulated
//!      peripheral, with scenario-scripted SOS input
//!   3. Air task: samples the advertised frame at scan cadence, applies
//!      path loss + drops, feeds the receiver's scan channel
//!   4. Main cooperative loop: scan ingress + 250 ms guidance tick, with
//!      the rescuer steering by the finder's output
//!
//! A run succeeds when the rescuer closes from a couple hundred metres to
//! arm's reach purely on beacon guidance.

mod radio;
mod scenario;
mod walker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

use phoenix_core::config::{EmitterConfig, FinderConfig, ReceiverConfig};
use phoenix_core::emitter::Emitter;
use phoenix_core::finder::{PrecisionFinder, FINDER_TICK_MS};
use phoenix_core::platform::{Clock, HapticPattern, Haptics, MonotonicClock};
use phoenix_core::receiver::Receiver;
use phoenix_proto::DeviceId;

use radio::{RadioConfig, SimCentral, SimPeripheral};
use scenario::ScenarioConfig;
use walker::{Casualty, Rescuer, RescuerConfig, SimSensors, WalkerConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "phoenix-sim", about = "Phoenix locator end-to-end simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Scenario preset: default, fall, sos, gps-loss, low-battery, rough,
    /// mayday (overrides the config file)
    #[arg(long)]
    scenario: Option<String>,
    /// Sim duration in seconds
    #[arg(long, default_value = "90")]
    duration_s: u64,
    /// RNG seed (wander, shadowing, drops)
    #[arg(long, default_value = "7")]
    seed: u64,
    /// Print guidance frames as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Debug, serde::Deserialize)]
struct FullConfig {
    walker: WalkerConfig,
    rescuer: RescuerConfig,
    radio: RadioConfig,
    #[serde(default)]
    scenario: ScenarioConfig,
}

/// Haptics adapter that narrates instead of vibrating.
struct LogHaptics;

impl Haptics for LogHaptics {
    fn pulse(&mut self, pattern: HapticPattern) {
        info!(?pattern, "📳 haptic pulse");
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "phoenix_simulator=info,phoenix_core=info".into()),
        )
        .init();

    let args = Args::parse();

    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str).context("invalid config.toml")?;

    let scenario = match &args.scenario {
        Some(name) => ScenarioConfig::preset(name)
            .with_context(|| format!("unknown scenario preset: {name}"))?,
        None => cfg.scenario.clone(),
    };

    info!(
        "🚁 Phoenix sim — scenario {:?}, {} s, seed {}",
        scenario.active, args.duration_s, args.seed
    );

    let clock = MonotonicClock::new();
    let casualty = Arc::new(Mutex::new(Casualty::new(
        cfg.walker.clone(),
        scenario.clone(),
        args.seed,
    )));
    let rescuer = Arc::new(Mutex::new(Rescuer::new(
        cfg.rescuer.clone(),
        cfg.walker.start_lat,
        cfg.walker.start_lon,
        args.seed + 1,
    )));
    let air = radio::shared_air();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Emitter task: the real core transmit loop with scenario SOS input
    let emitter = Emitter::new(
        EmitterConfig::default(),
        DeviceId::random(&mut StdRng::seed_from_u64(args.seed)),
        SimPeripheral::new(air.clone()),
        SimSensors::new(casualty.clone()),
        clock.clone(),
    );
    let emitter_handle =
        tokio::spawn(emitter_task(emitter, casualty.clone(), shutdown_rx.clone()));

    // Physics loop at 20 Hz
    {
        let casualty = casualty.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(50));
            loop {
                tick.tick().await;
                if *shutdown.borrow() {
                    break;
                }
                casualty.lock().unwrap().tick(0.05);
            }
        });
    }

    // Air delivery at scan cadence
    {
        let casualty = casualty.clone();
        let rescuer = rescuer.clone();
        let air = air.clone();
        let radio_cfg = cfg.radio.clone();
        let clock = clock.clone();
        let shutdown = shutdown_rx.clone();
        let mut rng = StdRng::seed_from_u64(args.seed + 2);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(radio_cfg.deliver_interval_ms));
            loop {
                tick.tick().await;
                if *shutdown.borrow() {
                    break;
                }
                let (clat, clon) = casualty.lock().unwrap().position();
                let distance_m = rescuer.lock().unwrap().distance_to(clat, clon);
                radio::deliver(&air, distance_m, clock.now_ms(), &radio_cfg, &mut rng);
            }
        });
    }

    // Receiver + finder: the main cooperative loop
    let mut receiver = Receiver::new(
        ReceiverConfig::default(),
        SimCentral::new(air.clone()),
        clock.clone(),
    );
    receiver.start()?;
    let mut scan_rx = receiver.take_scan_stream().context("scan stream missing")?;
    let mut finder = PrecisionFinder::new(FinderConfig::default());
    let mut haptics = LogHaptics;
    let mut ui_tick = interval(Duration::from_millis(FINDER_TICK_MS));
    let deadline = tokio::time::sleep(Duration::from_secs(args.duration_s));
    tokio::pin!(deadline);

    let mut target: Option<DeviceId> = None;
    let mut frames = 0u64;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Some(adv) = scan_rx.recv() => receiver.ingest(adv),
            _ = ui_tick.tick() => {
                let now_ms = clock.now_ms();
                receiver.evict_stale(now_ms);

                {
                    let mut r = rescuer.lock().unwrap();
                    finder.feed_location(r.location_sample());
                    let heading = r.compass_deg();
                    finder.feed_heading(heading);
                }

                if target.is_none() {
                    target = receiver.records().next().map(|r| r.device_id);
                    if let Some(device_id) = target {
                        info!(device_id = %device_id, "📡 tracking emitter");
                    }
                }
                let Some(snapshot) = target.and_then(|id| receiver.snapshot(id)) else {
                    continue;
                };

                let guidance = finder.update(&snapshot, now_ms);
                rescuer.lock().unwrap().steer(&guidance, FINDER_TICK_MS as f64 / 1000.0);
                if let Some(pattern) = guidance.pulse {
                    haptics.pulse(pattern);
                }

                frames += 1;
                if args.json {
                    println!("{}", serde_json::json!({
                        "t_ms": now_ms,
                        "guidance": guidance,
                        "flags": snapshot.payload.flags.0,
                        "cached_gps": snapshot.using_cached_gps,
                    }));
                } else if frames % 4 == 0 {
                    info!(
                        "🧭 {} | {:?} | bearing {} | {}{}",
                        guidance.distance_text,
                        guidance.proximity,
                        guidance.bearing_deg
                            .map(|b| format!("{b:.0}°"))
                            .unwrap_or_else(|| "searching".into()),
                        if guidance.using_gps_fallback { "GPS" } else { "BLE" },
                        if snapshot.using_cached_gps { " (cached fix)" } else { "" },
                    );
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = emitter_handle.await;
    receiver.stop();

    let (clat, clon) = casualty.lock().unwrap().position();
    let separation_m = rescuer.lock().unwrap().distance_to(clat, clon);
    let stats = receiver.stats();
    info!(
        "🏁 done — final separation {:.1} m | frames seen {} accepted {} dropped {}",
        separation_m,
        stats.frames_seen,
        stats.accepted,
        stats.dropped_not_phoenix + stats.dropped_invalid,
    );
    Ok(())
}

/// The core emitter loop plus scenario SOS injection. Mirrors
/// `Emitter::run`, unrolled so the scripted external input can be raised
/// between ticks.
async fn emitter_task(
    mut emitter: Emitter<SimPeripheral, SimSensors, MonotonicClock>,
    casualty: Arc<Mutex<Casualty>>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = emitter.start() {
        warn!(error = %e, "emitter failed to start");
        return;
    }
    loop {
        if *shutdown.borrow() {
            break;
        }
        let sos = casualty.lock().unwrap().sos_active();
        emitter.set_sos(sos);
        let delay = match emitter.tick() {
            Ok(Some(delay)) => delay,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "emitter transmission failed");
                break;
            }
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
    emitter.stop();
}
