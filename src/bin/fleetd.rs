//! fleetd - fleet registry daemon.
//!
//! Subscribes to all fleet configuration and device topics and reconciles
//! the traffic into SQLite: identity assignment, registrations, liveness,
//! detection records and their images. Messages are best-effort telemetry;
//! anything that fails to parse or store is logged and dropped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use fleetwatch::config::FleetdConfig;
use fleetwatch::notify::{LogNotifier, Notifier, WebhookNotifier};
use fleetwatch::registry::FleetRegistry;
use fleetwatch::storage::SqliteFleetStore;
use fleetwatch::transport::{parse_mqtt_endpoint, BusSession, SessionOptions};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about = "Fleetwatch registry daemon")]
struct Args {
    /// Path to the server config file (JSON). FLEET_SERVER_CONFIG works too.
    #[arg(long)]
    config: Option<PathBuf>,

    /// MQTT broker address (host:port, optionally mqtt:// or mqtts://).
    #[arg(long)]
    broker_addr: Option<String>,

    /// Path to the fleet database.
    #[arg(long)]
    db_path: Option<String>,

    /// Directory for detection images.
    #[arg(long)]
    image_dir: Option<PathBuf>,

    /// Webhook URL notified on each stored detection.
    #[arg(long)]
    webhook_url: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = FleetdConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.broker_addr {
        cfg.broker_addr = addr;
    }
    if let Some(path) = args.db_path {
        cfg.db_path = path;
    }
    if let Some(dir) = args.image_dir {
        cfg.image_dir = dir;
    }
    if let Some(url) = args.webhook_url {
        cfg.webhook_url = Some(url);
    }

    let endpoint = parse_mqtt_endpoint(&cfg.broker_addr, false)?;
    std::fs::create_dir_all(&cfg.image_dir)?;

    log::info!("fleetd starting");
    log::info!("  broker: {}:{} (tls: {})", endpoint.host, endpoint.port, endpoint.use_tls);
    log::info!("  database: {}", cfg.db_path);
    log::info!("  image dir: {}", cfg.image_dir.display());

    let store = SqliteFleetStore::open(&cfg.db_path)?;
    let notifier: Box<dyn Notifier> = match &cfg.webhook_url {
        Some(url) => {
            log::info!("  webhook: {}", url);
            Box::new(WebhookNotifier::new(url.clone()))
        }
        None => Box::new(LogNotifier),
    };
    let mut registry = FleetRegistry::new(
        store,
        notifier,
        cfg.topics.clone(),
        cfg.image_dir.clone(),
        cfg.server_handle.clone(),
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_handler = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_handler.store(true, Ordering::Relaxed);
    })?;

    while !cancel.load(Ordering::Relaxed) {
        let options = SessionOptions {
            client_id: cfg.server_handle.clone(),
            clean_start: true,
            username: cfg.mqtt_username.clone(),
            password: cfg.mqtt_password.clone(),
            last_will: None,
        };
        let (session, rx) = match BusSession::connect(&endpoint, options) {
            Ok(connected) => connected,
            Err(e) => {
                log::error!("broker connect failed: {}. Retrying...", e);
                std::thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };

        let subscribed = session
            .subscribe(&cfg.topics.cfg_subscription())
            .and_then(|_| session.subscribe(&cfg.topics.device_subscription()));
        if let Err(e) = subscribed {
            log::error!("subscribe failed: {}. Reconnecting...", e);
            let _ = session.disconnect();
            std::thread::sleep(RECONNECT_DELAY);
            continue;
        }
        log::info!(
            "subscribed to {} and {}",
            cfg.topics.cfg_subscription(),
            cfg.topics.device_subscription()
        );

        let mut connection_lost = false;
        while !cancel.load(Ordering::Relaxed) {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(msg) => match registry.handle_message(&msg.topic, &msg.payload) {
                    Ok(replies) => {
                        for reply in replies {
                            if let Err(e) =
                                session.publish_qos1(&reply.topic, &reply.payload, reply.retain)
                            {
                                log::warn!("reply publish failed: {}", e);
                            }
                        }
                    }
                    Err(e) => log::warn!("dropping message on {}: {}", msg.topic, e),
                },
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    connection_lost = true;
                    break;
                }
            }
        }

        let _ = session.disconnect();
        if connection_lost && !cancel.load(Ordering::Relaxed) {
            log::error!("broker connection lost. Reconnecting...");
            std::thread::sleep(RECONNECT_DELAY);
        }
    }

    log::info!("fleetd stopped");
    Ok(())
}
