//! Server-side fleet reconciliation.
//!
//! A single dispatcher consumes every fleet topic and reconciles cameras
//! and detections into storage. The bus is best-effort telemetry, not a
//! transactional ledger: a message that fails to parse or store is logged
//! and dropped, and the dispatcher keeps running.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::notify::Notifier;
use crate::storage::{FleetStore, NewDetection};
use crate::wire::{
    is_safe_image_name, DetectionInfo, IdentityAssignment, IdentityRequest, Registration, Route,
    StatusUpdate, TopicConfig,
};
use crate::now_s;

/// A reply the dispatcher wants published. Returning these instead of
/// publishing directly keeps the registry free of any broker handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

pub struct FleetRegistry<S: FleetStore> {
    store: S,
    notifier: Box<dyn Notifier>,
    topics: TopicConfig,
    image_dir: PathBuf,
    server_handle: String,
}

impl<S: FleetStore> FleetRegistry<S> {
    pub fn new(
        store: S,
        notifier: Box<dyn Notifier>,
        topics: TopicConfig,
        image_dir: PathBuf,
        server_handle: String,
    ) -> Self {
        Self {
            store,
            notifier,
            topics,
            image_dir,
            server_handle,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Dispatch one inbound publish. Unroutable topics are ignored; handler
    /// errors bubble up for the caller to log before dropping the message.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<Vec<OutboundMessage>> {
        let Some(route) = self.topics.route(topic) else {
            log::debug!("ignoring unroutable topic {}", topic);
            return Ok(Vec::new());
        };

        match route {
            Route::IdentityRequest => self.handle_identity_request(payload),
            Route::Registration => self.handle_registration(payload).map(|_| Vec::new()),
            Route::DeviceStatus { camera_id } => {
                self.handle_status(camera_id, payload).map(|_| Vec::new())
            }
            Route::DetectionInfo {
                camera_id,
                class_name,
            } => self
                .handle_detection_info(camera_id, &class_name, payload)
                .map(|_| Vec::new()),
            Route::DetectionImage { image_name, .. } => self
                .handle_detection_image(&image_name, payload)
                .map(|_| Vec::new()),
            // Our own replies echo back over the wildcard subscription.
            Route::IdentityAssignment => Ok(Vec::new()),
        }
    }

    fn handle_identity_request(&mut self, payload: &[u8]) -> Result<Vec<OutboundMessage>> {
        let text = std::str::from_utf8(payload).context("identity request not utf-8")?;
        let request = IdentityRequest::decode(text)?;

        let assigned_id = self.store.allocate_camera_id()?;
        log::info!(
            "assigned camera id {} to handle {}",
            assigned_id,
            request.client_handle
        );

        let assignment = IdentityAssignment {
            timestamp: now_s()?,
            server_handle: self.server_handle.clone(),
            requester_handle: request.client_handle,
            assigned_id,
        };
        Ok(vec![OutboundMessage {
            topic: self.topics.identity_assignment_topic(),
            payload: assignment.encode()?.into_bytes(),
            retain: false,
        }])
    }

    fn handle_registration(&mut self, payload: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(payload).context("registration not utf-8")?;
        let registration = Registration::decode(text)?;
        self.store.update_camera_registration(
            registration.camera_id,
            registration.uptime,
            &registration.name,
            u8::from(registration.online),
            &registration.ip_address,
        )?;
        log::info!(
            "camera {} registered as {:?} at {}",
            registration.camera_id,
            registration.name,
            registration.ip_address
        );
        Ok(())
    }

    fn handle_status(&mut self, camera_id: u32, payload: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(payload).context("status update not utf-8")?;
        let status = StatusUpdate::decode(text)?;
        self.store
            .update_camera_status(camera_id, u8::from(status.online), status.uptime)?;
        log::info!(
            "camera {} ({}) is {}",
            camera_id,
            status.name,
            if status.online { "online" } else { "offline" }
        );
        Ok(())
    }

    fn handle_detection_info(
        &mut self,
        camera_id: u32,
        class_name: &str,
        payload: &[u8],
    ) -> Result<()> {
        let text = std::str::from_utf8(payload).context("detection info not utf-8")?;
        let info = DetectionInfo::decode(text)?;
        if !is_safe_image_name(&info.image_name) {
            return Err(anyhow!("rejecting unsafe image name {:?}", info.image_name));
        }

        let image_path = self.image_dir.join(&info.image_name);
        let detection = NewDetection {
            camera_id,
            class_id: info.class_id,
            class_name: class_name.to_string(),
            median_probability: info.median_probability,
            captured_at: info.timestamp,
            image_path: image_path.to_string_lossy().into_owned(),
        };
        let detection_id = self.store.insert_detection(&detection)?;
        log::info!(
            "detection {}: camera {} saw {} (p={:.2})",
            detection_id,
            camera_id,
            class_name,
            info.median_probability
        );

        self.notifier.notify_detection(&info.image_name);
        Ok(())
    }

    fn handle_detection_image(&mut self, image_name: &str, payload: &[u8]) -> Result<()> {
        if !is_safe_image_name(image_name) {
            return Err(anyhow!("rejecting unsafe image name {:?}", image_name));
        }
        // Decode before persisting so a corrupt payload never lands on disk.
        let decoded = image::load_from_memory(payload)
            .with_context(|| format!("undecodable image payload for {}", image_name))?;
        let path = self.image_dir.join(image_name);
        decoded
            .save(&path)
            .with_context(|| format!("failed to persist image {}", path.display()))?;
        log::info!("stored detection image {}", path.display());
        Ok(())
    }

    pub fn image_path(&self, image_name: &str) -> PathBuf {
        self.image_dir.join(image_name)
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{FrameSource, StubSource};
    use crate::storage::SqliteFleetStore;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        notified: Arc<Mutex<Vec<String>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify_detection(&self, image_name: &str) {
            self.notified.lock().unwrap().push(image_name.to_string());
        }
    }

    fn registry(image_dir: PathBuf) -> (FleetRegistry<SqliteFleetStore>, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        let registry = FleetRegistry::new(
            SqliteFleetStore::open_in_memory().unwrap(),
            Box::new(notifier.clone()),
            TopicConfig::default(),
            image_dir,
            "fleetd".to_string(),
        );
        (registry, notifier)
    }

    #[test]
    fn identity_request_assigns_lowest_free_id() {
        let (mut registry, _) = registry(PathBuf::from("/tmp"));
        let replies = registry
            .handle_message("fleet/cfg/request_id", b"1700000000<:>cam-cfg-1")
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].topic, "fleet/cfg/set_id");
        let reply =
            IdentityAssignment::decode(std::str::from_utf8(&replies[0].payload).unwrap()).unwrap();
        assert_eq!(reply.assigned_id, 0);
        assert_eq!(reply.requester_handle, "cam-cfg-1");

        // A second requester gets the next id.
        let replies = registry
            .handle_message("fleet/cfg/request_id", b"1700000001<:>cam-cfg-2")
            .unwrap();
        let reply =
            IdentityAssignment::decode(std::str::from_utf8(&replies[0].payload).unwrap()).unwrap();
        assert_eq!(reply.assigned_id, 1);
    }

    #[test]
    fn own_assignment_echo_is_ignored() {
        let (mut registry, _) = registry(PathBuf::from("/tmp"));
        let replies = registry
            .handle_message("fleet/cfg/set_id", b"1<:>fleetd<:>cam-cfg-1,0")
            .unwrap();
        assert!(replies.is_empty());
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_panic() {
        let (mut registry, _) = registry(PathBuf::from("/tmp"));
        assert!(registry
            .handle_message("fleet/cfg/request_id", b"no delimiter here")
            .is_err());
        assert!(registry
            .handle_message("fleet/cfg/register", &[0xff, 0xfe])
            .is_err());
    }

    #[test]
    fn unroutable_topic_is_dropped_silently() {
        let (mut registry, _) = registry(PathBuf::from("/tmp"));
        let replies = registry
            .handle_message("some/other/topic", b"whatever")
            .unwrap();
        assert!(replies.is_empty());
    }

    #[test]
    fn detection_info_stores_record_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, notifier) = registry(dir.path().to_path_buf());
        registry
            .handle_message("fleet/cfg/request_id", b"1<:>cam-cfg-1")
            .unwrap();

        registry
            .handle_message(
                "fleet/device/0/detection_info/person",
                b"1<:>0.8<:>cam0_person_1700000000.jpg<:>1700000000",
            )
            .unwrap();

        let stored = registry.store().detection(0).unwrap().unwrap();
        assert_eq!(stored.camera_id, 0);
        assert_eq!(stored.class_name, "person");
        assert_eq!(stored.captured_at, 1_700_000_000);
        assert_eq!(
            notifier.notified.lock().unwrap().as_slice(),
            ["cam0_person_1700000000.jpg"]
        );
    }

    #[test]
    fn unsafe_image_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, _) = registry(dir.path().to_path_buf());
        assert!(registry
            .handle_message(
                "fleet/device/0/detection_info/person",
                b"1<:>0.8<:>..\\escape.jpg<:>1700000000",
            )
            .is_err());
    }

    #[test]
    fn image_payload_is_decoded_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut registry, _) = registry(dir.path().to_path_buf());

        let mut source = StubSource::new(16, 16);
        let jpeg = source.next_frame().unwrap().encode_jpeg().unwrap();
        registry
            .handle_message("fleet/device/0/image/cam0_person_17.jpg", &jpeg)
            .unwrap();
        assert!(dir.path().join("cam0_person_17.jpg").exists());

        // Garbage bytes never land on disk.
        assert!(registry
            .handle_message("fleet/device/0/image/cam0_person_18.jpg", b"not a jpeg")
            .is_err());
        assert!(!dir.path().join("cam0_person_18.jpg").exists());
    }
}
