use anyhow::Result;

use crate::ingest::Frame;

/// One raw output grid from the network, flattened row-major as
/// grid_h x grid_w x anchors x (5 + num_classes).
#[derive(Clone, Debug)]
pub struct GridPrediction {
    pub data: Vec<f32>,
    pub grid_h: usize,
    pub grid_w: usize,
}

/// Inference runtime boundary.
///
/// Implementations wrap whatever runtime executes the detection model. The
/// contract is purely functional: one frame in, one output grid per anchor
/// group out, in the same order as the configured anchor groups. Tensor
/// layout violations are reported by the decoder, not here.
pub trait InferenceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run the model on a frame.
    fn infer(&mut self, frame: &Frame) -> Result<Vec<GridPrediction>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Stub backend producing scripted predictions.
///
/// With an empty script it predicts nothing, which keeps a camera daemon
/// runnable without a model. Tests enqueue grids to drive the pipeline.
pub struct StubBackend {
    script: Vec<Vec<GridPrediction>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { script: Vec::new() }
    }

    /// Queue per-frame predictions, served in order; once drained the
    /// backend predicts nothing again.
    pub fn with_script(mut script: Vec<Vec<GridPrediction>>) -> Self {
        script.reverse();
        Self { script }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, _frame: &Frame) -> Result<Vec<GridPrediction>> {
        Ok(self.script.pop().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_serves_script_in_order_then_empties() {
        let grid = GridPrediction {
            data: vec![0.0; 6],
            grid_h: 1,
            grid_w: 1,
        };
        let mut backend = StubBackend::with_script(vec![vec![grid.clone()], vec![]]);
        let frame = Frame::blank(4, 4);
        assert_eq!(backend.infer(&frame).unwrap().len(), 1);
        assert!(backend.infer(&frame).unwrap().is_empty());
        assert!(backend.infer(&frame).unwrap().is_empty());
    }
}
