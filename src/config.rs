use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::detect::AnchorGroup;
use crate::identity::RegistrationSettings;
use crate::wire::TopicConfig;

const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_IDENTITY_PATH: &str = "camera_identity.json";
const DEFAULT_DB_PATH: &str = "fleet.db";
const DEFAULT_IMAGE_DIR: &str = "./images";
const DEFAULT_SERVER_HANDLE: &str = "fleetd";

const DEFAULT_OBJECTNESS_THRESHOLD: f32 = 0.5;
const DEFAULT_CLASS_THRESHOLD: f32 = 0.5;
const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
const DEFAULT_INPUT_SIZE: f32 = 416.0;
const DEFAULT_SCALE_XY: f32 = 1.05;

const DEFAULT_WARMUP_FRAMES: usize = 25;
const DEFAULT_MIN_SECONDS_DETECTED: f32 = 1.0;

const DEFAULT_RETRY_SECS: u64 = 5;
const DEFAULT_RETRY_MAX_SECS: u64 = 60;

fn default_anchor_groups() -> Vec<AnchorGroup> {
    vec![
        AnchorGroup {
            anchors: vec![(81.0, 82.0), (135.0, 169.0), (344.0, 319.0)],
            scale_xy: DEFAULT_SCALE_XY,
        },
        AnchorGroup {
            anchors: vec![(10.0, 14.0), (23.0, 27.0), (37.0, 58.0)],
            scale_xy: DEFAULT_SCALE_XY,
        },
    ]
}

fn default_class_names() -> Vec<String> {
    ["person", "chicken", "cat", "car"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// A conforming camera name is a short local identifier, not free text:
/// it is embedded in topics and image filenames.
pub fn validate_camera_name(name: &str) -> Result<()> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$").unwrap());
    if !re.is_match(name) {
        return Err(anyhow!(
            "camera name must match ^[a-z0-9_-]{{1,64}}$, got {:?}",
            name
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct CameradConfigFile {
    broker_addr: Option<String>,
    camera_name: Option<String>,
    identity_path: Option<PathBuf>,
    classes_path: Option<PathBuf>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    topics: Option<TopicConfig>,
    detector: Option<DetectorConfigFile>,
    calibration: Option<CalibrationConfigFile>,
    registration: Option<RegistrationConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    objectness_threshold: Option<f32>,
    class_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    input_size: Option<f32>,
    /// Flat (w, h, w, h, ...) anchor lists, one per output grid.
    anchors: Option<Vec<Vec<f32>>>,
    scales_xy: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationConfigFile {
    warmup_frames: Option<usize>,
    min_seconds_detected: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RegistrationConfigFile {
    retry_secs: Option<u64>,
    retry_max_secs: Option<u64>,
    max_attempts: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub objectness_threshold: f32,
    pub class_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: f32,
    pub groups: Vec<AnchorGroup>,
}

#[derive(Debug, Clone, Copy)]
pub struct CalibrationSettings {
    pub warmup_frames: usize,
    pub min_seconds_detected: f32,
}

#[derive(Debug, Clone)]
pub struct CameradConfig {
    pub broker_addr: String,
    pub camera_name: Option<String>,
    pub identity_path: PathBuf,
    pub class_names: Vec<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub topics: TopicConfig,
    pub detector: DetectorSettings,
    pub calibration: CalibrationSettings,
    pub registration: RegistrationSettings,
}

impl CameradConfig {
    /// Load from an explicit file, the FLEET_CAMERA_CONFIG file, or pure
    /// defaults, then apply environment overrides and validate.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("FLEET_CAMERA_CONFIG").ok().map(PathBuf::from);
        let path = explicit_path.map(Path::to_path_buf).or(env_path);
        let file_cfg = match path.as_deref() {
            Some(path) => read_config_file::<CameradConfigFile>(path)?,
            None => CameradConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CameradConfigFile) -> Result<Self> {
        let detector_file = file.detector.unwrap_or_default();
        let groups = anchor_groups_from_file(
            detector_file.anchors,
            detector_file.scales_xy,
        )?;
        let detector = DetectorSettings {
            objectness_threshold: detector_file
                .objectness_threshold
                .unwrap_or(DEFAULT_OBJECTNESS_THRESHOLD),
            class_threshold: detector_file
                .class_threshold
                .unwrap_or(DEFAULT_CLASS_THRESHOLD),
            iou_threshold: detector_file.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            input_size: detector_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            groups,
        };

        let calibration_file = file.calibration.unwrap_or_default();
        let calibration = CalibrationSettings {
            warmup_frames: calibration_file.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
            min_seconds_detected: calibration_file
                .min_seconds_detected
                .unwrap_or(DEFAULT_MIN_SECONDS_DETECTED),
        };

        let registration_file = file.registration.unwrap_or_default();
        let registration = RegistrationSettings {
            retry_interval: Duration::from_secs(
                registration_file.retry_secs.unwrap_or(DEFAULT_RETRY_SECS),
            ),
            retry_max: Duration::from_secs(
                registration_file
                    .retry_max_secs
                    .unwrap_or(DEFAULT_RETRY_MAX_SECS),
            ),
            max_attempts: registration_file.max_attempts.unwrap_or(0),
        };

        let class_names = match &file.classes_path {
            Some(path) => read_class_names(path)?,
            None => default_class_names(),
        };

        Ok(Self {
            broker_addr: file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
            camera_name: file.camera_name,
            identity_path: file
                .identity_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IDENTITY_PATH)),
            class_names,
            mqtt_username: file.mqtt_username,
            mqtt_password: file.mqtt_password,
            topics: file.topics.unwrap_or_default(),
            detector,
            calibration,
            registration,
        })
    }

    fn apply_env(&mut self) {
        if let Some(addr) = non_empty_env("FLEET_BROKER_ADDR") {
            self.broker_addr = addr;
        }
        if let Some(name) = non_empty_env("FLEET_CAMERA_NAME") {
            self.camera_name = Some(name);
        }
        if let Some(path) = non_empty_env("FLEET_IDENTITY_PATH") {
            self.identity_path = PathBuf::from(path);
        }
        if let Some(user) = non_empty_env("FLEET_MQTT_USERNAME") {
            self.mqtt_username = Some(user);
        }
        if let Some(pass) = non_empty_env("FLEET_MQTT_PASSWORD") {
            self.mqtt_password = Some(pass);
        }
    }

    fn validate(&mut self) -> Result<()> {
        if let Some(name) = &mut self.camera_name {
            *name = name.to_lowercase();
            validate_camera_name(name)?;
        }
        for (label, value) in [
            ("objectness_threshold", self.detector.objectness_threshold),
            ("class_threshold", self.detector.class_threshold),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1), got {}", label, value));
            }
        }
        if self.detector.input_size <= 0.0 {
            return Err(anyhow!("input_size must be positive"));
        }
        if self.detector.groups.is_empty() {
            return Err(anyhow!("at least one anchor group is required"));
        }
        for group in &self.detector.groups {
            if group.anchors.is_empty() {
                return Err(anyhow!("anchor group must not be empty"));
            }
            if group.scale_xy <= 0.0 {
                return Err(anyhow!("scale_xy must be positive"));
            }
        }
        if self.class_names.is_empty() {
            return Err(anyhow!("class name list must not be empty"));
        }
        if self.calibration.warmup_frames == 0 {
            return Err(anyhow!("warmup_frames must be at least 1"));
        }
        if self.calibration.min_seconds_detected <= 0.0 {
            return Err(anyhow!("min_seconds_detected must be positive"));
        }
        if self.registration.retry_interval.is_zero() {
            return Err(anyhow!("registration retry interval must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
struct FleetdConfigFile {
    broker_addr: Option<String>,
    db_path: Option<String>,
    image_dir: Option<PathBuf>,
    webhook_url: Option<String>,
    server_handle: Option<String>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    topics: Option<TopicConfig>,
}

#[derive(Debug, Clone)]
pub struct FleetdConfig {
    pub broker_addr: String,
    pub db_path: String,
    pub image_dir: PathBuf,
    pub webhook_url: Option<String>,
    pub server_handle: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub topics: TopicConfig,
}

impl FleetdConfig {
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("FLEET_SERVER_CONFIG").ok().map(PathBuf::from);
        let path = explicit_path.map(Path::to_path_buf).or(env_path);
        let file_cfg = match path.as_deref() {
            Some(path) => read_config_file::<FleetdConfigFile>(path)?,
            None => FleetdConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FleetdConfigFile) -> Self {
        Self {
            broker_addr: file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            image_dir: file
                .image_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_DIR)),
            webhook_url: file.webhook_url,
            server_handle: file
                .server_handle
                .unwrap_or_else(|| DEFAULT_SERVER_HANDLE.to_string()),
            mqtt_username: file.mqtt_username,
            mqtt_password: file.mqtt_password,
            topics: file.topics.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) {
        if let Some(addr) = non_empty_env("FLEET_BROKER_ADDR") {
            self.broker_addr = addr;
        }
        if let Some(path) = non_empty_env("FLEET_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = non_empty_env("FLEET_IMAGE_DIR") {
            self.image_dir = PathBuf::from(dir);
        }
        if let Some(url) = non_empty_env("FLEET_WEBHOOK_URL") {
            self.webhook_url = Some(url);
        }
        if let Some(user) = non_empty_env("FLEET_MQTT_USERNAME") {
            self.mqtt_username = Some(user);
        }
        if let Some(pass) = non_empty_env("FLEET_MQTT_PASSWORD") {
            self.mqtt_password = Some(pass);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server_handle.trim().is_empty() {
            return Err(anyhow!("server_handle must not be empty"));
        }
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// One class name per line; blank lines are skipped.
fn read_class_names(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read classes file {}: {}", path.display(), e))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn anchor_groups_from_file(
    anchors: Option<Vec<Vec<f32>>>,
    scales_xy: Option<Vec<f32>>,
) -> Result<Vec<AnchorGroup>> {
    let Some(anchors) = anchors else {
        if scales_xy.is_some() {
            return Err(anyhow!("scales_xy given without anchors"));
        }
        return Ok(default_anchor_groups());
    };

    let scales = match scales_xy {
        Some(scales) => {
            if scales.len() != anchors.len() {
                return Err(anyhow!(
                    "scales_xy has {} entries for {} anchor groups",
                    scales.len(),
                    anchors.len()
                ));
            }
            scales
        }
        None => vec![DEFAULT_SCALE_XY; anchors.len()],
    };

    anchors
        .into_iter()
        .zip(scales)
        .map(|(flat, scale_xy)| {
            if flat.is_empty() || flat.len() % 2 != 0 {
                return Err(anyhow!(
                    "anchor list must hold (w, h) pairs, got {} values",
                    flat.len()
                ));
            }
            let anchors = flat.chunks(2).map(|pair| (pair[0], pair[1])).collect();
            Ok(AnchorGroup { anchors, scale_xy })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_detector_matches_model_geometry() {
        let cfg = CameradConfig::from_file(CameradConfigFile::default()).unwrap();
        assert_eq!(cfg.detector.groups.len(), 2);
        assert_eq!(cfg.detector.groups[0].anchors[0], (81.0, 82.0));
        assert_eq!(cfg.detector.groups[1].anchors[2], (37.0, 58.0));
        assert!((cfg.detector.groups[0].scale_xy - 1.05).abs() < 1e-6);
        assert_eq!(cfg.class_names.len(), 4);
    }

    #[test]
    fn camera_name_allowlist() {
        assert!(validate_camera_name("cam0").is_ok());
        assert!(validate_camera_name("front-gate_2").is_ok());
        assert!(validate_camera_name("Front Gate").is_err());
        assert!(validate_camera_name("").is_err());
        assert!(validate_camera_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn anchor_groups_require_pairs() {
        assert!(anchor_groups_from_file(Some(vec![vec![81.0, 82.0, 135.0]]), None).is_err());
        assert!(anchor_groups_from_file(Some(vec![vec![]]), None).is_err());
        let groups =
            anchor_groups_from_file(Some(vec![vec![10.0, 14.0, 23.0, 27.0]]), Some(vec![1.1]))
                .unwrap();
        assert_eq!(groups[0].anchors, vec![(10.0, 14.0), (23.0, 27.0)]);
        assert!((groups[0].scale_xy - 1.1).abs() < 1e-6);
    }

    #[test]
    fn scales_without_anchors_is_rejected() {
        assert!(anchor_groups_from_file(None, Some(vec![1.05])).is_err());
    }

    #[test]
    fn mismatched_scales_length_is_rejected() {
        assert!(
            anchor_groups_from_file(Some(vec![vec![1.0, 2.0]]), Some(vec![1.0, 1.0])).is_err()
        );
    }
}
