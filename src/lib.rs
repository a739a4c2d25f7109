//! Fleetwatch
//!
//! Coordinates a fleet of cameras that detect objects on-device and report
//! confirmed detections to a central registry over MQTT.
//!
//! Camera side, each frame flows decode -> suppress -> track: raw network
//! output grids become candidate boxes, class-wise non-max suppression
//! removes duplicates, and a per-class hysteresis tracker turns noisy
//! per-frame sightings into at most one confirmed event per episode. A
//! camera acquires a durable numeric identity from the registry through a
//! retried request/assignment handshake before it processes any frames, and
//! advertises liveness through a retained last-will status topic.
//!
//! Server side, a single dispatcher reconciles identity requests,
//! registrations, status updates and detection reports into SQLite.
//!
//! # Module Structure
//!
//! - `detect`: box decoding, NMS, detection hysteresis, inference boundary
//! - `ingest`: frame sources
//! - `identity`: camera-side registration and the durable device session
//! - `registry`: server-side message dispatcher
//! - `storage`: camera/detection records, gap-filling id assignment
//! - `transport`: MQTT session plumbing
//! - `wire`: topic layout and payload codec
//! - `notify`: detection alerting
//! - `config`: daemon configuration

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

pub mod config;
pub mod detect;
pub mod identity;
pub mod ingest;
pub mod notify;
pub mod registry;
pub mod storage;
pub mod transport;
pub mod wire;

pub use detect::{
    class_maxima, correct_boxes, decode_grid, iou, median, non_max_suppress, AnchorGroup,
    BoundingBox, ConfirmedDetection, DetectionTracker, FrameRateCalibrator, GridPrediction,
    InferenceBackend, StubBackend,
};
pub use identity::{
    load_identity, primary_ip, store_identity, CameraSession, IdentityClient, PersistedIdentity,
    RegistrationSettings,
};
pub use ingest::{Frame, FrameSource, StubSource};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use registry::{FleetRegistry, OutboundMessage};
pub use storage::{
    next_free_id, CameraRecord, DetectionRecord, FleetStore, NewDetection, SqliteFleetStore,
};
pub use transport::{parse_mqtt_endpoint, BusSession, InboundMessage, MqttEndpoint};
pub use wire::{image_file_name, Route, TopicConfig};

/// Seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
