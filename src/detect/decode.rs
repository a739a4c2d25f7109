//! Decoding of raw network output grids into candidate bounding boxes.
//!
//! The inference runtime hands us one flattened tensor per anchor group,
//! laid out row-major as grid_h x grid_w x anchors x (5 + num_classes) with
//! the per-anchor channels ordered [x, y, w, h, objectness, class...].

use anyhow::{anyhow, Result};

/// A candidate detection in normalized image coordinates.
///
/// Coordinates may fall outside [0, 1] before `correct_boxes` clamps them to
/// pixel space. Class scores are already multiplied by objectness; a score of
/// zero means the class was below threshold or suppressed.
#[derive(Clone, Debug)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub objectness: f32,
    pub class_scores: Vec<f32>,
}

impl BoundingBox {
    /// Index of the highest-scoring class (first one wins on ties).
    pub fn label(&self) -> usize {
        let mut best = 0;
        for (i, &score) in self.class_scores.iter().enumerate() {
            if score > self.class_scores[best] {
                best = i;
            }
        }
        best
    }

    /// Score of the highest-scoring class.
    pub fn score(&self) -> f32 {
        self.class_scores.get(self.label()).copied().unwrap_or(0.0)
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }
}

/// Anchor priors and the x/y rescale factor for one output grid.
#[derive(Clone, Debug)]
pub struct AnchorGroup {
    /// (width, height) priors in input-image pixels.
    pub anchors: Vec<(f32, f32)>,
    /// De-bias factor for the predicted cell-center offset.
    pub scale_xy: f32,
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Decode one output grid into candidate boxes.
///
/// `netout` must hold exactly grid_h x grid_w x anchors x (5 + num_classes)
/// values; anything else is a contract violation by the inference runtime and
/// fatal, since guessing a layout would corrupt all downstream geometry.
///
/// The objectness gate runs before any per-box allocation, so a pathological
/// grid where every cell fires cannot balloon beyond cells x anchors entries.
/// Output order is unspecified.
pub fn decode_grid(
    netout: &[f32],
    grid_h: usize,
    grid_w: usize,
    group: &AnchorGroup,
    objectness_threshold: f32,
    input_size: f32,
    num_classes: usize,
) -> Result<Vec<BoundingBox>> {
    let anchors_per_cell = group.anchors.len();
    let channels = 5 + num_classes;
    let expected = grid_h * grid_w * anchors_per_cell * channels;
    if netout.len() != expected {
        return Err(anyhow!(
            "malformed inference output: got {} values, expected {} ({}x{}x{}x{})",
            netout.len(),
            expected,
            grid_h,
            grid_w,
            anchors_per_cell,
            channels
        ));
    }

    let mut boxes = Vec::new();
    for row in 0..grid_h {
        for col in 0..grid_w {
            for b in 0..anchors_per_cell {
                let base = ((row * grid_w + col) * anchors_per_cell + b) * channels;
                let objectness = sigmoid(netout[base + 4]);
                if objectness <= objectness_threshold {
                    continue;
                }

                // Cell-center offset, de-biased: scale * v - 0.5 * (scale - 1).
                let x_off =
                    sigmoid(netout[base]) * group.scale_xy - 0.5 * (group.scale_xy - 1.0);
                let y_off =
                    sigmoid(netout[base + 1]) * group.scale_xy - 0.5 * (group.scale_xy - 1.0);

                let x = (col as f32 + x_off) / grid_w as f32;
                let y = (row as f32 + y_off) / grid_h as f32;
                let (anchor_w, anchor_h) = group.anchors[b];
                let w = anchor_w * netout[base + 2].exp() / input_size;
                let h = anchor_h * netout[base + 3].exp() / input_size;

                let mut class_scores = Vec::with_capacity(num_classes);
                for c in 0..num_classes {
                    let score = objectness * sigmoid(netout[base + 5 + c]);
                    class_scores.push(if score > objectness_threshold {
                        score
                    } else {
                        0.0
                    });
                }

                boxes.push(BoundingBox {
                    xmin: x - w / 2.0,
                    ymin: y - h / 2.0,
                    xmax: x + w / 2.0,
                    ymax: y + h / 2.0,
                    objectness,
                    class_scores,
                });
            }
        }
    }
    Ok(boxes)
}
