//! End-to-end registry flow: a camera with no identity requests one,
//! registers, reports liveness, then delivers a confirmed detection with
//! its image.

use std::sync::{Arc, Mutex};

use fleetwatch::notify::Notifier;
use fleetwatch::registry::FleetRegistry;
use fleetwatch::storage::{FleetStore, SqliteFleetStore};
use fleetwatch::wire::{
    DetectionInfo, IdentityAssignment, IdentityRequest, Registration, StatusUpdate, TopicConfig,
};
use fleetwatch::{Frame, FrameSource, StubSource};

#[derive(Clone, Default)]
struct RecordingNotifier {
    notified: Arc<Mutex<Vec<String>>>,
}

impl Notifier for RecordingNotifier {
    fn notify_detection(&self, image_name: &str) {
        self.notified.lock().unwrap().push(image_name.to_string());
    }
}

fn detection_frame() -> Frame {
    StubSource::new(32, 32).next_frame().unwrap()
}

#[test]
fn camera_lifecycle_request_register_detect() {
    let image_dir = tempfile::tempdir().unwrap();
    let topics = TopicConfig::default();
    let notifier = RecordingNotifier::default();

    let mut store = SqliteFleetStore::open_in_memory().unwrap();
    // One camera already exists, occupying id 0.
    assert_eq!(store.allocate_camera_id().unwrap(), 0);

    let mut registry = FleetRegistry::new(
        store,
        Box::new(notifier.clone()),
        topics.clone(),
        image_dir.path().to_path_buf(),
        "fleetd".to_string(),
    );

    // 1. Identity request: the lowest free id is 1.
    let request = IdentityRequest {
        timestamp: 1_700_000_000,
        client_handle: "cam-cfg-0000000000000001".to_string(),
    };
    let replies = registry
        .handle_message(
            &topics.identity_request_topic(),
            request.encode().unwrap().as_bytes(),
        )
        .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].topic, topics.identity_assignment_topic());
    let assignment =
        IdentityAssignment::decode(std::str::from_utf8(&replies[0].payload).unwrap()).unwrap();
    assert_eq!(assignment.assigned_id, 1);
    assert_eq!(assignment.requester_handle, "cam-cfg-0000000000000001");

    // 2. Registration confirmation fills in the provisional record.
    let registration = Registration {
        uptime: 1_700_000_001,
        camera_id: assignment.assigned_id,
        name: "cam1".to_string(),
        online: true,
        ip_address: "192.168.1.31".to_string(),
    };
    registry
        .handle_message(
            &topics.registration_topic(),
            registration.encode().unwrap().as_bytes(),
        )
        .unwrap();
    let cam = registry.store().camera(1).unwrap().unwrap();
    assert_eq!(cam.name.as_deref(), Some("cam1"));
    assert_eq!(cam.status, 1);
    assert_eq!(cam.ip_address.as_deref(), Some("192.168.1.31"));

    // 3. Retained status update refreshes liveness.
    let status = StatusUpdate {
        uptime: 1_700_000_002,
        name: "cam1".to_string(),
        online: true,
    };
    registry
        .handle_message(
            &topics.device_status_topic(1),
            status.encode().unwrap().as_bytes(),
        )
        .unwrap();
    let cam = registry.store().camera(1).unwrap().unwrap();
    assert_eq!(cam.status, 1);
    assert_eq!(cam.last_seen_at, Some(1_700_000_002));

    // 4. Detection info and image share one deterministic name.
    let image_name = fleetwatch::image_file_name("cam1", "person", 1_700_000_010);
    let info = DetectionInfo {
        class_id: 0,
        median_probability: 0.8,
        image_name: image_name.clone(),
        timestamp: 1_700_000_010,
    };
    registry
        .handle_message(
            &topics.detection_info_topic(1, "person"),
            info.encode().unwrap().as_bytes(),
        )
        .unwrap();

    let jpeg = detection_frame().encode_jpeg().unwrap();
    registry
        .handle_message(&topics.detection_image_topic(1, &image_name), &jpeg)
        .unwrap();

    // Exactly one detection, referencing the same image name as the stored
    // file and the fired notification.
    let detection = registry.store().detection(0).unwrap().unwrap();
    assert_eq!(detection.camera_id, 1);
    assert_eq!(detection.class_name, "person");
    assert!((detection.median_probability - 0.8).abs() < 1e-9);
    assert!(detection.image_path.ends_with(&image_name));
    assert!(registry.store().detection(1).unwrap().is_none());

    assert!(image_dir.path().join(&image_name).exists());
    assert_eq!(notifier.notified.lock().unwrap().as_slice(), [image_name]);
}

#[test]
fn last_will_offline_marks_camera_down() {
    let image_dir = tempfile::tempdir().unwrap();
    let topics = TopicConfig::default();
    let mut store = SqliteFleetStore::open_in_memory().unwrap();
    store.allocate_camera_id().unwrap();
    store
        .update_camera_registration(0, 1_700_000_000, "cam0", 1, "192.168.1.30")
        .unwrap();

    let mut registry = FleetRegistry::new(
        store,
        Box::new(RecordingNotifier::default()),
        topics.clone(),
        image_dir.path().to_path_buf(),
        "fleetd".to_string(),
    );

    // The broker delivers the retained last-will after an unclean drop.
    let will = StatusUpdate {
        uptime: 1_700_000_000,
        name: "cam0".to_string(),
        online: false,
    };
    registry
        .handle_message(
            &topics.device_status_topic(0),
            will.encode().unwrap().as_bytes(),
        )
        .unwrap();
    assert_eq!(registry.store().camera(0).unwrap().unwrap().status, 0);
}
