//! Fleet wire protocol: topic layout and payload codec.
//!
//! Payloads are `<:>`-delimited text for compatibility with devices already
//! on the bus. The delimiter is not escapable, so the encoder refuses any
//! field containing it; the decoder rejects malformed payloads so the
//! dispatcher can drop them without crashing. Timestamps are epoch seconds.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const FIELD_DELIMITER: &str = "<:>";

fn check_field(value: &str) -> Result<&str> {
    if value.contains(FIELD_DELIMITER) {
        return Err(anyhow!(
            "field {:?} contains the payload delimiter and cannot be encoded",
            value
        ));
    }
    Ok(value)
}

fn split_fields(payload: &str, expected: usize) -> Result<Vec<&str>> {
    let fields: Vec<&str> = payload.split(FIELD_DELIMITER).collect();
    if fields.len() != expected {
        return Err(anyhow!(
            "expected {} fields, got {} in {:?}",
            expected,
            fields.len(),
            payload
        ));
    }
    Ok(fields)
}

/// Topic roots and literal suffixes, configurable per deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub cfg_root: String,
    pub device_root: String,
    pub request_id: String,
    pub set_id: String,
    pub register: String,
    pub status: String,
    pub detection_info: String,
    pub image: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            cfg_root: "fleet/cfg".to_string(),
            device_root: "fleet/device".to_string(),
            request_id: "request_id".to_string(),
            set_id: "set_id".to_string(),
            register: "register".to_string(),
            status: "status".to_string(),
            detection_info: "detection_info".to_string(),
            image: "image".to_string(),
        }
    }
}

/// A parsed inbound topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    IdentityRequest,
    IdentityAssignment,
    Registration,
    DeviceStatus { camera_id: u32 },
    DetectionInfo { camera_id: u32, class_name: String },
    DetectionImage { camera_id: u32, image_name: String },
}

impl TopicConfig {
    pub fn identity_request_topic(&self) -> String {
        format!("{}/{}", self.cfg_root, self.request_id)
    }

    pub fn identity_assignment_topic(&self) -> String {
        format!("{}/{}", self.cfg_root, self.set_id)
    }

    pub fn registration_topic(&self) -> String {
        format!("{}/{}", self.cfg_root, self.register)
    }

    pub fn device_status_topic(&self, camera_id: u32) -> String {
        format!("{}/{}/{}", self.device_root, camera_id, self.status)
    }

    pub fn detection_info_topic(&self, camera_id: u32, class_name: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.device_root, camera_id, self.detection_info, class_name
        )
    }

    pub fn detection_image_topic(&self, camera_id: u32, image_name: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.device_root, camera_id, self.image, image_name
        )
    }

    /// Wildcard subscription covering all configuration traffic.
    pub fn cfg_subscription(&self) -> String {
        format!("{}/#", self.cfg_root)
    }

    /// Wildcard subscription covering all device traffic.
    pub fn device_subscription(&self) -> String {
        format!("{}/#", self.device_root)
    }

    /// Classify an inbound topic. Unknown or malformed topics yield `None`.
    pub fn route(&self, topic: &str) -> Option<Route> {
        if topic == self.identity_request_topic() {
            return Some(Route::IdentityRequest);
        }
        if topic == self.identity_assignment_topic() {
            return Some(Route::IdentityAssignment);
        }
        if topic == self.registration_topic() {
            return Some(Route::Registration);
        }

        let rest = topic.strip_prefix(&format!("{}/", self.device_root))?;
        let (id_part, rest) = rest.split_once('/')?;
        let camera_id: u32 = id_part.parse().ok()?;

        if rest == self.status {
            return Some(Route::DeviceStatus { camera_id });
        }
        if let Some(class_name) = rest.strip_prefix(&format!("{}/", self.detection_info)) {
            if !class_name.is_empty() && !class_name.contains('/') {
                return Some(Route::DetectionInfo {
                    camera_id,
                    class_name: class_name.to_string(),
                });
            }
        }
        if let Some(image_name) = rest.strip_prefix(&format!("{}/", self.image)) {
            if !image_name.is_empty() && !image_name.contains('/') {
                return Some(Route::DetectionImage {
                    camera_id,
                    image_name: image_name.to_string(),
                });
            }
        }
        None
    }
}

/// `{cfg_root}/{request_id}` payload: a camera asking for an identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRequest {
    pub timestamp: u64,
    pub client_handle: String,
}

impl IdentityRequest {
    pub fn encode(&self) -> Result<String> {
        Ok(format!(
            "{}{}{}",
            self.timestamp,
            FIELD_DELIMITER,
            check_field(&self.client_handle)?
        ))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let fields = split_fields(payload, 2)?;
        Ok(Self {
            timestamp: fields[0].parse().context("identity request timestamp")?,
            client_handle: fields[1].to_string(),
        })
    }
}

/// `{cfg_root}/{set_id}` payload: the registry answering one request.
/// Correlation happens on `requester_handle`; other handles ignore it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityAssignment {
    pub timestamp: u64,
    pub server_handle: String,
    pub requester_handle: String,
    pub assigned_id: u32,
}

impl IdentityAssignment {
    pub fn encode(&self) -> Result<String> {
        let requester = check_field(&self.requester_handle)?;
        if requester.contains(',') {
            return Err(anyhow!("requester handle must not contain ','"));
        }
        Ok(format!(
            "{}{}{}{}{},{}",
            self.timestamp,
            FIELD_DELIMITER,
            check_field(&self.server_handle)?,
            FIELD_DELIMITER,
            requester,
            self.assigned_id
        ))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let fields = split_fields(payload, 3)?;
        let (requester, id) = fields[2]
            .split_once(',')
            .ok_or_else(|| anyhow!("assignment missing handle,id pair: {:?}", fields[2]))?;
        Ok(Self {
            timestamp: fields[0].parse().context("assignment timestamp")?,
            server_handle: fields[1].to_string(),
            requester_handle: requester.to_string(),
            assigned_id: id.parse().context("assigned id")?,
        })
    }
}

/// `{cfg_root}/{register}` payload: a camera confirming its assigned id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub uptime: u64,
    pub camera_id: u32,
    pub name: String,
    pub online: bool,
    pub ip_address: String,
}

impl Registration {
    pub fn encode(&self) -> Result<String> {
        Ok(format!(
            "{}{d}{}{d}{}{d}{}{d}{}",
            self.uptime,
            self.camera_id,
            check_field(&self.name)?,
            u8::from(self.online),
            check_field(&self.ip_address)?,
            d = FIELD_DELIMITER
        ))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let fields = split_fields(payload, 5)?;
        Ok(Self {
            uptime: fields[0].parse().context("registration uptime")?,
            camera_id: fields[1].parse().context("registration camera id")?,
            name: fields[2].to_string(),
            online: decode_status_flag(fields[3])?,
            ip_address: fields[4].to_string(),
        })
    }
}

/// `{device_root}/{id}/{status}` payload. Retained; also the last-will body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub uptime: u64,
    pub name: String,
    pub online: bool,
}

impl StatusUpdate {
    pub fn encode(&self) -> Result<String> {
        Ok(format!(
            "{}{d}{}{d}{}",
            self.uptime,
            check_field(&self.name)?,
            u8::from(self.online),
            d = FIELD_DELIMITER
        ))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let fields = split_fields(payload, 3)?;
        Ok(Self {
            uptime: fields[0].parse().context("status uptime")?,
            name: fields[1].to_string(),
            online: decode_status_flag(fields[2])?,
        })
    }
}

/// `{device_root}/{id}/{detection_info}/{class}` payload. The image name
/// links this message to the raw JPEG published on the image topic.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionInfo {
    pub class_id: u32,
    pub median_probability: f64,
    pub image_name: String,
    pub timestamp: u64,
}

impl DetectionInfo {
    pub fn encode(&self) -> Result<String> {
        Ok(format!(
            "{}{d}{}{d}{}{d}{}",
            self.class_id,
            self.median_probability,
            check_field(&self.image_name)?,
            self.timestamp,
            d = FIELD_DELIMITER
        ))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let fields = split_fields(payload, 4)?;
        Ok(Self {
            class_id: fields[0].parse().context("detection class id")?,
            median_probability: fields[1].parse().context("detection probability")?,
            image_name: fields[2].to_string(),
            timestamp: fields[3].parse().context("detection timestamp")?,
        })
    }
}

fn decode_status_flag(field: &str) -> Result<bool> {
    match field {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(anyhow!("status flag must be 0 or 1, got {:?}", other)),
    }
}

/// Deterministic image filename shared by the info and image messages.
pub fn image_file_name(camera_name: &str, class_name: &str, timestamp: u64) -> String {
    format!("{}_{}_{}.jpg", camera_name, class_name, timestamp)
}

/// Image names travel inside topics and become filesystem paths on the
/// server; anything that could escape the image directory is rejected.
pub fn is_safe_image_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_request_round_trips() {
        let msg = IdentityRequest {
            timestamp: 1_700_000_000,
            client_handle: "cam-cfg-00ab".to_string(),
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded, "1700000000<:>cam-cfg-00ab");
        assert_eq!(IdentityRequest::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn assignment_round_trips() {
        let msg = IdentityAssignment {
            timestamp: 1_700_000_001,
            server_handle: "fleetd".to_string(),
            requester_handle: "cam-cfg-00ab".to_string(),
            assigned_id: 2,
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded, "1700000001<:>fleetd<:>cam-cfg-00ab,2");
        assert_eq!(IdentityAssignment::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn registration_round_trips() {
        let msg = Registration {
            uptime: 1_700_000_002,
            camera_id: 0,
            name: "cam0".to_string(),
            online: true,
            ip_address: "192.168.1.20".to_string(),
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded, "1700000002<:>0<:>cam0<:>1<:>192.168.1.20");
        assert_eq!(Registration::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn status_round_trips_both_states() {
        for online in [true, false] {
            let msg = StatusUpdate {
                uptime: 77,
                name: "cam3".to_string(),
                online,
            };
            let encoded = msg.encode().unwrap();
            assert_eq!(StatusUpdate::decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn detection_info_round_trips() {
        let msg = DetectionInfo {
            class_id: 1,
            median_probability: 0.8,
            image_name: "cam0_person_1700000003.jpg".to_string(),
            timestamp: 1_700_000_003,
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(DetectionInfo::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn encoder_rejects_embedded_delimiter() {
        let msg = StatusUpdate {
            uptime: 1,
            name: "bad<:>name".to_string(),
            online: true,
        };
        assert!(msg.encode().is_err());
    }

    #[test]
    fn decoder_rejects_malformed_payloads() {
        assert!(IdentityRequest::decode("justonefield").is_err());
        assert!(IdentityAssignment::decode("1<:>srv<:>nohandlepair").is_err());
        assert!(StatusUpdate::decode("1<:>cam<:>2").is_err());
        assert!(DetectionInfo::decode("a<:>b<:>c<:>d").is_err());
    }

    #[test]
    fn routes_cfg_and_device_topics() {
        let topics = TopicConfig::default();
        assert_eq!(
            topics.route("fleet/cfg/request_id"),
            Some(Route::IdentityRequest)
        );
        assert_eq!(
            topics.route("fleet/cfg/set_id"),
            Some(Route::IdentityAssignment)
        );
        assert_eq!(topics.route("fleet/cfg/register"), Some(Route::Registration));
        assert_eq!(
            topics.route("fleet/device/4/status"),
            Some(Route::DeviceStatus { camera_id: 4 })
        );
        assert_eq!(
            topics.route("fleet/device/4/detection_info/person"),
            Some(Route::DetectionInfo {
                camera_id: 4,
                class_name: "person".to_string()
            })
        );
        assert_eq!(
            topics.route("fleet/device/4/image/cam4_person_17.jpg"),
            Some(Route::DetectionImage {
                camera_id: 4,
                image_name: "cam4_person_17.jpg".to_string()
            })
        );
    }

    #[test]
    fn rejects_unroutable_topics() {
        let topics = TopicConfig::default();
        assert_eq!(topics.route("fleet/device/notanumber/status"), None);
        assert_eq!(topics.route("fleet/device/4/unknown"), None);
        assert_eq!(topics.route("elsewhere/4/status"), None);
        assert_eq!(topics.route("fleet/device/4/image/"), None);
    }

    #[test]
    fn image_names_are_deterministic_and_screened() {
        assert_eq!(
            image_file_name("cam0", "person", 1_700_000_000),
            "cam0_person_1700000000.jpg"
        );
        assert!(is_safe_image_name("cam0_person_1700000000.jpg"));
        assert!(!is_safe_image_name("../../etc/passwd"));
        assert!(!is_safe_image_name("a/b.jpg"));
        assert!(!is_safe_image_name(""));
    }
}
