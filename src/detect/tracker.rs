//! Temporal hysteresis over per-frame class sightings.
//!
//! A single noisy frame must not reach the bus, and a sustained detection
//! must reach it exactly once. Each class carries a recent-hit counter and a
//! bounded window of confidence scores; crossing the confirmation threshold
//! emits one event and resets the class to dormant.

use std::collections::{HashMap, VecDeque};

/// A detection episode that crossed the confirmation threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmedDetection {
    pub class_id: usize,
    pub median_probability: f32,
    /// Epoch seconds of the last sighting that completed the episode.
    pub captured_at: u64,
}

#[derive(Debug)]
struct ClassState {
    hits: usize,
    window: VecDeque<f32>,
    touched: bool,
    last_seen: u64,
}

/// Per-camera detection hysteresis.
///
/// State is keyed by class id; a class absent from the map is dormant.
/// Owned exclusively by the capture thread.
pub struct DetectionTracker {
    confirmation_threshold: usize,
    states: HashMap<usize, ClassState>,
}

impl DetectionTracker {
    pub fn new(confirmation_threshold: usize) -> Self {
        Self {
            confirmation_threshold: confirmation_threshold.max(2),
            states: HashMap::new(),
        }
    }

    /// One-time recalibration after frame-rate measurement. The window
    /// capacity follows the threshold; existing windows are trimmed.
    pub fn set_confirmation_threshold(&mut self, threshold: usize) {
        self.confirmation_threshold = threshold.max(2);
        for state in self.states.values_mut() {
            while state.window.len() > self.confirmation_threshold {
                state.window.pop_front();
            }
        }
    }

    pub fn confirmation_threshold(&self) -> usize {
        self.confirmation_threshold
    }

    /// Feed one processed frame's per-class best scores and collect any
    /// confirmations. `now` stamps sightings with epoch seconds.
    pub fn observe(
        &mut self,
        frame_maxima: &HashMap<usize, f32>,
        now: u64,
    ) -> Vec<ConfirmedDetection> {
        for (&class_id, &score) in frame_maxima {
            match self.states.get_mut(&class_id) {
                Some(state) => {
                    state.hits += 1;
                    if state.window.len() >= self.confirmation_threshold {
                        state.window.pop_front();
                    }
                    state.window.push_back(score);
                    state.touched = true;
                    state.last_seen = now;
                }
                None => {
                    let mut window = VecDeque::with_capacity(self.confirmation_threshold);
                    window.push_back(score);
                    self.states.insert(
                        class_id,
                        ClassState {
                            hits: 1,
                            window,
                            touched: true,
                            last_seen: now,
                        },
                    );
                }
            }
        }

        let mut confirmed = Vec::new();
        let threshold = self.confirmation_threshold;
        self.states.retain(|&class_id, state| {
            if state.hits >= threshold {
                let probs: Vec<f32> = state.window.iter().copied().collect();
                confirmed.push(ConfirmedDetection {
                    class_id,
                    median_probability: median(&probs),
                    captured_at: state.last_seen,
                });
                // One event per episode: back to dormant.
                return false;
            }
            if !state.touched {
                state.hits = state.hits.saturating_sub(1);
                state.window.pop_front();
                if state.hits == 0 {
                    return false;
                }
            }
            state.touched = false;
            true
        });
        confirmed
    }
}

/// Median of a sample; even-length samples average the two middle values.
/// Returns 0 for an empty sample.
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// One-shot frame-rate calibration from startup iteration latencies.
///
/// Collects the first `capacity` per-frame latencies, then derives the
/// confirmation threshold as measured-fps x min-seconds-detected, floored at
/// 2 sightings. Yields exactly once; afterwards `record` is a no-op.
pub struct FrameRateCalibrator {
    samples: Vec<f32>,
    capacity: usize,
    min_seconds_detected: f32,
    done: bool,
}

impl FrameRateCalibrator {
    pub fn new(capacity: usize, min_seconds_detected: f32) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            min_seconds_detected,
            done: false,
        }
    }

    pub fn record(&mut self, frame_seconds: f32) -> Option<usize> {
        if self.done {
            return None;
        }
        if frame_seconds > 0.0 {
            self.samples.push(frame_seconds);
        }
        if self.samples.len() < self.capacity {
            return None;
        }
        self.done = true;
        let rates: Vec<f32> = self.samples.iter().map(|&t| 1.0 / t).collect();
        let fps = median(&rates).floor();
        let threshold = (fps * self.min_seconds_detected) as usize;
        self.samples = Vec::new();
        Some(threshold.max(2))
    }
}
