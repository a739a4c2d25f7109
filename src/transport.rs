//! MQTT transport layer.
//!
//! Wraps the synchronous rumqttc v5 client: endpoint parsing, session setup
//! with an optional retained last-will, and a network thread that drains the
//! connection and forwards inbound publishes over a channel. Callers never
//! touch the socket; outbound publishes are fire-and-forget at the chosen
//! QoS and the client library handles reconnects and acknowledgements.

use std::sync::mpsc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{
    mqttbytes::v5::LastWill, mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions,
};
use rumqttc::Transport;

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(20);

#[derive(Clone, Debug)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host:port` with optional `mqtt://`/`mqtts://` scheme and IPv6
/// brackets.
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

/// An inbound publish delivered off the network thread.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub client_id: String,
    pub clean_start: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Retained QoS-1 last-will (topic, payload) the broker publishes on
    /// ungraceful disconnect.
    pub last_will: Option<(String, Vec<u8>)>,
}

/// A connected bus session plus its network thread.
///
/// The receiver returned by `connect` closes when the connection dies, which
/// is the caller's reconnect signal.
pub struct BusSession {
    client: Client,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl BusSession {
    pub fn connect(
        endpoint: &MqttEndpoint,
        options: SessionOptions,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>)> {
        let mut mqtt_options = MqttOptions::new(&options.client_id, &endpoint.host, endpoint.port);
        mqtt_options.set_keep_alive(DEFAULT_KEEP_ALIVE);
        mqtt_options.set_clean_start(options.clean_start);
        if let Some(user) = &options.username {
            mqtt_options.set_credentials(user, options.password.as_deref().unwrap_or_default());
        }
        if let Some((topic, payload)) = &options.last_will {
            let will = LastWill::new(topic, payload.clone(), QoS::AtLeastOnce, true, None);
            mqtt_options.set_last_will(will);
        }
        if endpoint.use_tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(mqtt_options, 10);
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || run_network_loop(connection, tx));

        log::info!(
            "connected to broker {}:{} (tls: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls
        );
        Ok((
            Self {
                client,
                handle: Some(handle),
            },
            rx,
        ))
    }

    pub fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    /// Non-blocking QoS-1 publish.
    pub fn publish_qos1(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())?;
        Ok(())
    }

    /// Clean disconnect: queued publishes are flushed before the DISCONNECT
    /// packet since the request channel is ordered.
    pub fn disconnect(mut self) -> Result<()> {
        self.client.disconnect()?;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn run_network_loop(mut connection: Connection, tx: mpsc::Sender<InboundMessage>) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = match std::str::from_utf8(&publish.topic) {
                    Ok(topic) => topic.to_string(),
                    Err(e) => {
                        log::warn!("skipping publish with non-utf8 topic: {}", e);
                        continue;
                    }
                };
                let inbound = InboundMessage {
                    topic,
                    payload: publish.payload.to_vec(),
                };
                if tx.send(inbound).is_err() {
                    // Receiver gone: the session owner is shutting down.
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("mqtt connection error: {}", e);
                break;
            }
        }
    }
}
