//! Frame sources.
//!
//! Real capture drivers (RTSP, V4L2, ...) are external concerns; the
//! pipeline only needs a sequence of RGB frames. The stub source keeps a
//! camera daemon runnable end-to-end without hardware.

use std::io::Cursor;

use anyhow::{anyhow, Result};

/// One captured frame, tightly packed RGB8.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; (width * height * 3) as usize],
        }
    }

    /// Encode the frame as JPEG for publishing alongside a detection.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let buffer = image::RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))?;
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(buffer)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Jpeg)?;
        Ok(out)
    }
}

pub trait FrameSource: Send {
    fn name(&self) -> &'static str;

    fn next_frame(&mut self) -> Result<Frame>;
}

/// Synthetic frame source with a drifting gradient so consecutive frames
/// differ.
pub struct StubSource {
    width: u32,
    height: u32,
    counter: u64,
}

impl StubSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            counter: 0,
        }
    }
}

impl FrameSource for StubSource {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.counter = self.counter.wrapping_add(1);
        let mut pixels = Vec::with_capacity((self.width * self.height * 3) as usize);
        let shift = (self.counter % 256) as u8;
        for y in 0..self.height {
            for x in 0..self.width {
                pixels.push((x % 256) as u8 ^ shift);
                pixels.push((y % 256) as u8);
                pixels.push(shift);
            }
        }
        Ok(Frame {
            width: self.width,
            height: self.height,
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_frames_differ_between_calls() {
        let mut source = StubSource::new(8, 8);
        let a = source.next_frame().unwrap();
        let b = source.next_frame().unwrap();
        assert_eq!(a.pixels.len(), 8 * 8 * 3);
        assert_ne!(a.pixels, b.pixels);
    }

    #[test]
    fn encode_jpeg_produces_decodable_bytes() {
        let mut source = StubSource::new(16, 16);
        let frame = source.next_frame().unwrap();
        let jpeg = frame.encode_jpeg().unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 16);
    }
}
