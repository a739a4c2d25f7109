//! camerad - camera-side daemon.
//!
//! This daemon:
//! 1. Acquires a durable identity (cached, or via the registry handshake)
//! 2. Opens the durable bus session with a retained last-will status
//! 3. Runs the capture loop: frame -> inference -> decode -> NMS -> tracker
//! 4. Publishes confirmed detections as linked info + JPEG messages
//! 5. Calibrates the confirmation threshold once from measured frame rate

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::Parser;

use fleetwatch::config::CameradConfig;
use fleetwatch::detect::{
    class_maxima, correct_boxes, decode_grid, non_max_suppress, DetectionTracker,
    FrameRateCalibrator, InferenceBackend, StubBackend,
};
use fleetwatch::identity::{CameraSession, IdentityClient};
use fleetwatch::ingest::{FrameSource, StubSource};
use fleetwatch::transport::parse_mqtt_endpoint;
use fleetwatch::now_s;

/// Default confirmation threshold until calibration finishes.
const INITIAL_CONFIRMATION_THRESHOLD: usize = 5;
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Fleetwatch camera daemon")]
struct Args {
    /// Path to the camera config file (JSON). FLEET_CAMERA_CONFIG works too.
    #[arg(long)]
    config: Option<PathBuf>,

    /// MQTT broker address (host:port, optionally mqtt:// or mqtts://).
    #[arg(long)]
    broker_addr: Option<String>,

    /// Camera name; defaults to cam<id> after registration.
    #[arg(long)]
    name: Option<String>,

    /// Frame source URL. Only the synthetic stub source is built in;
    /// real capture drivers plug in behind the FrameSource trait.
    #[arg(long, env = "FLEET_FRAME_SOURCE", default_value = "stub://640x480")]
    source: String,

    /// Capture loop pacing in frames per second.
    #[arg(long, env = "FLEET_TARGET_FPS", default_value_t = 10)]
    target_fps: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = CameradConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.broker_addr {
        cfg.broker_addr = addr;
    }
    if let Some(name) = args.name {
        cfg.camera_name = Some(name);
    }
    if args.target_fps == 0 {
        return Err(anyhow!("target fps must be at least 1"));
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_handler = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_handler.store(true, Ordering::Relaxed);
    })?;

    let endpoint = parse_mqtt_endpoint(&cfg.broker_addr, false)?;
    log::info!("camerad starting");
    log::info!("  broker: {}:{} (tls: {})", endpoint.host, endpoint.port, endpoint.use_tls);
    log::info!("  identity file: {}", cfg.identity_path.display());
    log::info!("  classes: {}", cfg.class_names.join(", "));
    log::info!("  frame source: {}", args.source);

    let identity_client = IdentityClient {
        endpoint: endpoint.clone(),
        topics: cfg.topics.clone(),
        settings: cfg.registration.clone(),
        identity_path: cfg.identity_path.clone(),
        camera_name: cfg.camera_name.clone(),
        username: cfg.mqtt_username.clone(),
        password: cfg.mqtt_password.clone(),
    };
    let identity = identity_client.acquire(&cancel)?;

    // Inbound messages (remote config, commands) arrive on _inbound; the
    // capture loop below never blocks on it.
    let (session, _inbound) = CameraSession::connect(
        &endpoint,
        cfg.topics.clone(),
        identity,
        cfg.mqtt_username.clone(),
        cfg.mqtt_password.clone(),
    )?;
    log::info!(
        "camera {} ({}) online",
        session.identity().id,
        session.identity().name
    );

    let mut source = open_frame_source(&args.source)?;
    let mut backend = StubBackend::new();
    backend.warm_up()?;
    log::info!("inference backend: {}", backend.name());

    let mut tracker = DetectionTracker::new(INITIAL_CONFIRMATION_THRESHOLD);
    let mut calibrator = FrameRateCalibrator::new(
        cfg.calibration.warmup_frames,
        cfg.calibration.min_seconds_detected,
    );
    let frame_budget = Duration::from_secs_f32(1.0 / args.target_fps as f32);

    let mut frames_processed = 0u64;
    let mut detections_published = 0u64;
    let mut last_health_log = Instant::now();

    while !cancel.load(Ordering::Relaxed) {
        let started = Instant::now();
        let frame = source.next_frame()?;

        // An idle backend yields no grids at all; a model-backed one must
        // produce exactly one grid per anchor group.
        let grids = backend.infer(&frame)?;
        if !grids.is_empty() && grids.len() != cfg.detector.groups.len() {
            return Err(anyhow!(
                "inference returned {} output grids for {} anchor groups",
                grids.len(),
                cfg.detector.groups.len()
            ));
        }

        let mut boxes = Vec::new();
        for (grid, group) in grids.iter().zip(&cfg.detector.groups) {
            boxes.extend(decode_grid(
                &grid.data,
                grid.grid_h,
                grid.grid_w,
                group,
                cfg.detector.objectness_threshold,
                cfg.detector.input_size,
                cfg.class_names.len(),
            )?);
        }
        correct_boxes(&mut boxes, frame.height, frame.width);
        non_max_suppress(&mut boxes, cfg.detector.iou_threshold);
        let maxima = class_maxima(&boxes, cfg.detector.class_threshold);

        for detection in tracker.observe(&maxima, now_s()?) {
            let Some(class_name) = cfg.class_names.get(detection.class_id) else {
                log::warn!("dropping detection with unknown class {}", detection.class_id);
                continue;
            };
            let jpeg = frame.encode_jpeg()?;
            match session.publish_detection(class_name, &detection, &jpeg) {
                Ok(image_name) => {
                    detections_published += 1;
                    log::info!(
                        "published {} (p={:.2}) as {}",
                        class_name,
                        detection.median_probability,
                        image_name
                    );
                }
                Err(e) => log::warn!("detection publish failed: {}", e),
            }
        }

        frames_processed += 1;
        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            log::info!(
                "frames={} detections={} confirmation_threshold={}",
                frames_processed,
                detections_published,
                tracker.confirmation_threshold()
            );
            last_health_log = Instant::now();
        }

        let elapsed = started.elapsed();
        if elapsed < frame_budget {
            std::thread::sleep(frame_budget - elapsed);
        }

        // Calibrate from the full iteration latency, pacing included.
        if let Some(threshold) = calibrator.record(started.elapsed().as_secs_f32()) {
            tracker.set_confirmation_threshold(threshold);
            log::info!("objects are confirmed within {} frames", threshold);
        }
    }

    log::info!("shutting down");
    session.shutdown()?;
    Ok(())
}

fn open_frame_source(url: &str) -> Result<Box<dyn FrameSource>> {
    if let Some(rest) = url.strip_prefix("stub://") {
        let (width, height) = if rest.is_empty() {
            (640, 480)
        } else {
            let (w, h) = rest
                .split_once('x')
                .ok_or_else(|| anyhow!("stub source wants stub://<width>x<height>"))?;
            (w.parse()?, h.parse()?)
        };
        return Ok(Box::new(StubSource::new(width, height)));
    }
    Err(anyhow!(
        "unsupported frame source {:?}: only stub:// is built in",
        url
    ))
}
