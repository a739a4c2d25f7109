//! Camera-side pipeline: scripted inference output flows through decode,
//! suppression and hysteresis exactly as the daemon wires them.

use std::collections::HashMap;

use fleetwatch::detect::{
    class_maxima, correct_boxes, decode_grid, non_max_suppress, AnchorGroup, DetectionTracker,
    GridPrediction, InferenceBackend, StubBackend,
};
use fleetwatch::{Frame, FrameSource, StubSource};

const NUM_CLASSES: usize = 2;

fn group() -> AnchorGroup {
    AnchorGroup {
        anchors: vec![(344.0, 319.0), (300.0, 280.0)],
        scale_xy: 1.0,
    }
}

/// 2x2 grid, two anchors: both anchors of the top-left cell fire for
/// class 0. Sharing a center, the two boxes nest (IoU well above 0.5), so
/// NMS must collapse them to the higher-scored one.
fn firing_grid(class_logit: f32) -> GridPrediction {
    let channels = 5 + NUM_CLASSES;
    let mut data = vec![0.0; 2 * 2 * 2 * channels];
    for (anchor, logit) in [(0, class_logit), (1, class_logit - 1.0)] {
        let base = anchor * channels;
        data[base + 4] = 4.0; // objectness
        data[base + 5] = logit; // class 0
        data[base + 6] = -6.0; // class 1 stays silent
    }
    GridPrediction {
        data,
        grid_h: 2,
        grid_w: 2,
    }
}

fn quiet_grid() -> GridPrediction {
    GridPrediction {
        data: vec![0.0; 2 * 2 * 2 * (5 + NUM_CLASSES)],
        grid_h: 2,
        grid_w: 2,
    }
}

fn process_frame(
    frame: &Frame,
    backend: &mut dyn InferenceBackend,
    group: &AnchorGroup,
) -> HashMap<usize, f32> {
    let grids = backend.infer(frame).unwrap();
    let mut boxes = Vec::new();
    for grid in &grids {
        boxes.extend(
            decode_grid(&grid.data, grid.grid_h, grid.grid_w, group, 0.5, 416.0, NUM_CLASSES)
                .unwrap(),
        );
    }
    correct_boxes(&mut boxes, frame.height, frame.width);
    non_max_suppress(&mut boxes, 0.5);
    class_maxima(&boxes, 0.5)
}

#[test]
fn sustained_sighting_confirms_exactly_once() {
    let mut source = StubSource::new(64, 64);
    let group = group();
    let mut backend = StubBackend::with_script(vec![
        vec![firing_grid(4.0)],
        vec![firing_grid(4.0)],
        vec![firing_grid(4.0)],
        vec![quiet_grid()],
        vec![quiet_grid()],
    ]);
    let mut tracker = DetectionTracker::new(3);

    let mut confirmed = Vec::new();
    for now in 1..=5u64 {
        let frame = source.next_frame().unwrap();
        let maxima = process_frame(&frame, &mut backend, &group);
        confirmed.extend(tracker.observe(&maxima, now));
    }

    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].class_id, 0);
    assert_eq!(confirmed[0].captured_at, 3);
    let sigmoid4 = 1.0 / (1.0 + (-4.0f32).exp());
    assert!((confirmed[0].median_probability - sigmoid4 * sigmoid4).abs() < 1e-4);
}

#[test]
fn overlapping_boxes_collapse_before_tracking() {
    let mut backend = StubBackend::with_script(vec![vec![firing_grid(4.0)]]);
    let frame = StubSource::new(64, 64).next_frame().unwrap();
    let grids = backend.infer(&frame).unwrap();
    let mut boxes = decode_grid(
        &grids[0].data,
        grids[0].grid_h,
        grids[0].grid_w,
        &group(),
        0.5,
        416.0,
        NUM_CLASSES,
    )
    .unwrap();
    assert_eq!(boxes.len(), 2);

    correct_boxes(&mut boxes, frame.height, frame.width);
    non_max_suppress(&mut boxes, 0.5);
    let survivors = boxes
        .iter()
        .filter(|b| b.class_scores[0] > 0.5)
        .count();
    assert_eq!(survivors, 1);
}

#[test]
fn interrupted_sighting_never_confirms() {
    let mut source = StubSource::new(64, 64);
    let group = group();
    let mut backend = StubBackend::with_script(vec![
        vec![firing_grid(4.0)],
        vec![firing_grid(4.0)],
        vec![quiet_grid()],
        vec![quiet_grid()],
        vec![quiet_grid()],
    ]);
    let mut tracker = DetectionTracker::new(3);

    for now in 1..=5u64 {
        let frame = source.next_frame().unwrap();
        let maxima = process_frame(&frame, &mut backend, &group);
        assert!(tracker.observe(&maxima, now).is_empty());
    }
}
