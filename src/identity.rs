//! Camera identity acquisition and the durable device session.
//!
//! A camera has no identity until the registry assigns one. The assignment
//! handshake runs over a transient clean-session bus connection: publish a
//! request carrying a transient handle, wait for an assignment naming that
//! handle, confirm with a registration message, persist the identity. A
//! persisted identity whose IP still matches the host skips all of this.
//!
//! No frames are processed before an identity exists, so the handshake
//! deliberately blocks startup; it backs off between retries and aborts
//! when the shutdown flag is raised.

use std::net::UdpSocket;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::detect::ConfirmedDetection;
use crate::now_s;
use crate::transport::{BusSession, InboundMessage, MqttEndpoint, SessionOptions};
use crate::wire::{
    image_file_name, DetectionInfo, IdentityAssignment, IdentityRequest, Registration,
    StatusUpdate, TopicConfig,
};

/// Durable camera identity, stored beside the camera as a JSON file.
///
/// `id` is stable for the camera's lifetime once assigned; 0 is a valid id,
/// so "unassigned" is a missing file, never a sentinel value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIdentity {
    pub id: u32,
    pub name: String,
    /// Epoch seconds of the most recent startup.
    pub uptime: u64,
    #[serde(rename = "ip")]
    pub ip_address: String,
}

pub fn load_identity(path: &Path) -> Result<Option<PersistedIdentity>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read identity {}", path.display()))
        }
    };
    let identity = serde_json::from_str(&raw)
        .with_context(|| format!("invalid identity file {}", path.display()))?;
    Ok(Some(identity))
}

pub fn store_identity(path: &Path, identity: &PersistedIdentity) -> Result<()> {
    let json = serde_json::to_string_pretty(identity)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write identity {}", path.display()))?;
    Ok(())
}

/// The cached identity is trusted only while the camera keeps the address
/// it registered with; a moved camera re-registers.
pub fn reusable_identity(
    persisted: Option<PersistedIdentity>,
    current_ip: &str,
) -> Option<PersistedIdentity> {
    persisted.filter(|identity| identity.ip_address == current_ip)
}

/// Best-effort primary address discovery: route a UDP socket at an
/// unroutable address and read back the chosen source address. No packets
/// are sent.
pub fn primary_ip() -> String {
    let fallback = || "127.0.0.1".to_string();
    let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)) else {
        return fallback();
    };
    if socket.connect(("10.255.255.255", 1)).is_err() {
        return fallback();
    }
    match socket.local_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => fallback(),
    }
}

fn transient_handle() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("cam-cfg-{:016x}", u64::from_le_bytes(bytes))
}

#[derive(Clone, Debug)]
pub struct RegistrationSettings {
    /// Initial delay between identity requests.
    pub retry_interval: Duration,
    /// Backoff ceiling.
    pub retry_max: Duration,
    /// Give up after this many requests; 0 retries until cancelled.
    pub max_attempts: usize,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            retry_max: Duration::from_secs(60),
            max_attempts: 0,
        }
    }
}

pub struct IdentityClient {
    pub endpoint: MqttEndpoint,
    pub topics: TopicConfig,
    pub settings: RegistrationSettings,
    pub identity_path: std::path::PathBuf,
    pub camera_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl IdentityClient {
    /// Acquire a durable identity: reuse the cache when the address still
    /// matches, otherwise run the assignment handshake. Blocks until an
    /// identity exists, the attempt budget runs out, or `cancel` is raised.
    pub fn acquire(&self, cancel: &AtomicBool) -> Result<PersistedIdentity> {
        let current_ip = primary_ip();
        let uptime = now_s()?;

        let persisted = load_identity(&self.identity_path)?;
        if let Some(mut identity) = reusable_identity(persisted, &current_ip) {
            identity.uptime = uptime;
            store_identity(&self.identity_path, &identity)?;
            log::info!(
                "camera {} reusing cached identity ({})",
                identity.id,
                identity.ip_address
            );
            return Ok(identity);
        }

        self.register_fresh(&current_ip, uptime, cancel)
    }

    fn register_fresh(
        &self,
        current_ip: &str,
        uptime: u64,
        cancel: &AtomicBool,
    ) -> Result<PersistedIdentity> {
        let handle = transient_handle();
        let options = SessionOptions {
            client_id: handle.clone(),
            clean_start: true,
            username: self.username.clone(),
            password: self.password.clone(),
            last_will: None,
        };
        let (session, rx) = BusSession::connect(&self.endpoint, options)?;
        session.subscribe(&self.topics.identity_assignment_topic())?;

        let assigned_id = self.await_assignment(&session, &rx, &handle, cancel)?;

        let name = self
            .camera_name
            .clone()
            .unwrap_or_else(|| format!("cam{}", assigned_id));
        let registration = Registration {
            uptime,
            camera_id: assigned_id,
            name: name.clone(),
            online: true,
            ip_address: current_ip.to_string(),
        };
        session.publish_qos1(
            &self.topics.registration_topic(),
            registration.encode()?.as_bytes(),
            false,
        )?;
        session.disconnect()?;
        log::info!("camera {} activated", assigned_id);

        let identity = PersistedIdentity {
            id: assigned_id,
            name,
            uptime,
            ip_address: current_ip.to_string(),
        };
        store_identity(&self.identity_path, &identity)?;
        Ok(identity)
    }

    /// At-least-once request/response over a channel whose only correlation
    /// id is the transient handle: keep publishing the request, accept the
    /// first assignment naming our handle, ignore everything else
    /// (including duplicate answers to stale handles).
    fn await_assignment(
        &self,
        session: &BusSession,
        rx: &mpsc::Receiver<InboundMessage>,
        handle: &str,
        cancel: &AtomicBool,
    ) -> Result<u32> {
        let assignment_topic = self.topics.identity_assignment_topic();
        let mut interval = self.settings.retry_interval;
        let mut attempts = 0usize;

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(anyhow!("registration cancelled"));
            }

            let request = IdentityRequest {
                timestamp: now_s()?,
                client_handle: handle.to_string(),
            };
            session.publish_qos1(
                &self.topics.identity_request_topic(),
                request.encode()?.as_bytes(),
                false,
            )?;

            let deadline = Instant::now() + interval;
            loop {
                if cancel.load(Ordering::Relaxed) {
                    return Err(anyhow!("registration cancelled"));
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let wait = (deadline - now).min(Duration::from_millis(250));
                match rx.recv_timeout(wait) {
                    Ok(msg) if msg.topic == assignment_topic => {
                        let Ok(text) = std::str::from_utf8(&msg.payload) else {
                            log::warn!("dropping non-utf8 assignment payload");
                            continue;
                        };
                        match IdentityAssignment::decode(text) {
                            Ok(assignment) if assignment.requester_handle == handle => {
                                return Ok(assignment.assigned_id);
                            }
                            Ok(assignment) => {
                                log::debug!(
                                    "ignoring assignment addressed to {}",
                                    assignment.requester_handle
                                );
                            }
                            Err(e) => log::warn!("dropping malformed assignment: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        return Err(anyhow!("lost bus connection during registration"));
                    }
                }
            }

            attempts += 1;
            if self.settings.max_attempts > 0 && attempts >= self.settings.max_attempts {
                return Err(anyhow!(
                    "no identity assignment after {} attempts",
                    attempts
                ));
            }
            interval = (interval * 2).min(self.settings.retry_max);
        }
    }
}

/// The camera's durable bus session.
///
/// Connecting arms a retained QoS-1 last-will carrying "offline" on the
/// status topic, then publishes a retained "online". The broker-held will is
/// the authoritative liveness fallback for ungraceful termination; the local
/// shutdown path publishes "offline" itself on the way out.
pub struct CameraSession {
    session: BusSession,
    topics: TopicConfig,
    identity: PersistedIdentity,
}

impl CameraSession {
    pub fn connect(
        endpoint: &MqttEndpoint,
        topics: TopicConfig,
        identity: PersistedIdentity,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>)> {
        let status_topic = topics.device_status_topic(identity.id);
        let offline = StatusUpdate {
            uptime: identity.uptime,
            name: identity.name.clone(),
            online: false,
        }
        .encode()?;

        let options = SessionOptions {
            client_id: identity.id.to_string(),
            clean_start: false,
            username,
            password,
            last_will: Some((status_topic.clone(), offline.into_bytes())),
        };
        let (session, rx) = BusSession::connect(endpoint, options)?;

        let online = StatusUpdate {
            uptime: identity.uptime,
            name: identity.name.clone(),
            online: true,
        }
        .encode()?;
        session.publish_qos1(&status_topic, online.as_bytes(), true)?;

        Ok((
            Self {
                session,
                topics,
                identity,
            },
            rx,
        ))
    }

    pub fn identity(&self) -> &PersistedIdentity {
        &self.identity
    }

    /// Publish a confirmed detection as the linked info + image pair.
    /// Both carry the same deterministic image name so the registry can
    /// correlate them without a handshake. Returns the image name.
    pub fn publish_detection(
        &self,
        class_name: &str,
        detection: &ConfirmedDetection,
        jpeg: &[u8],
    ) -> Result<String> {
        let image_name = image_file_name(&self.identity.name, class_name, detection.captured_at);
        let info = DetectionInfo {
            class_id: detection.class_id as u32,
            median_probability: detection.median_probability as f64,
            image_name: image_name.clone(),
            timestamp: detection.captured_at,
        };
        self.session.publish_qos1(
            &self.topics.detection_info_topic(self.identity.id, class_name),
            info.encode()?.as_bytes(),
            false,
        )?;
        self.session.publish_qos1(
            &self.topics.detection_image_topic(self.identity.id, &image_name),
            jpeg,
            false,
        )?;
        Ok(image_name)
    }

    /// Best-effort retained "offline"; the last-will covers the case where
    /// this never reaches the broker.
    pub fn publish_offline(&self) -> Result<()> {
        let offline = StatusUpdate {
            uptime: self.identity.uptime,
            name: self.identity.name.clone(),
            online: false,
        }
        .encode()?;
        self.session.publish_qos1(
            &self.topics.device_status_topic(self.identity.id),
            offline.as_bytes(),
            true,
        )
    }

    pub fn shutdown(self) -> Result<()> {
        if let Err(e) = self.publish_offline() {
            log::warn!("offline status publish failed: {}", e);
        }
        self.session.disconnect()
    }
}
