mod backend;
mod decode;
mod nms;
mod tracker;

pub use backend::{GridPrediction, InferenceBackend, StubBackend};
pub use decode::{decode_grid, AnchorGroup, BoundingBox};
pub use nms::{class_maxima, correct_boxes, iou, non_max_suppress};
pub use tracker::{median, ConfirmedDetection, DetectionTracker, FrameRateCalibrator};
