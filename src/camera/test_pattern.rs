use super::device::{CaptureDevice, FrameReader};
use crate::error::CameraError;
use image::{Rgb, RgbImage};
use tracing::debug;

/// Synthetic device producing a moving gradient. Indices below `devices`
/// open successfully; the rest behave like absent hardware.
#[derive(Debug, Clone)]
pub struct TestPatternDevice {
    devices: u32,
}

impl TestPatternDevice {
    pub fn new(devices: u32) -> Self {
        Self { devices }
    }
}

impl Default for TestPatternDevice {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CaptureDevice for TestPatternDevice {
    fn backend(&self) -> &str {
        "test-pattern"
    }

    fn open(&self, index: u32, width: u32, height: u32) -> Result<Box<dyn FrameReader>, CameraError> {
        if index >= self.devices {
            return Err(CameraError::DeviceOpen {
                device: index,
                details: "no such test-pattern device".to_string(),
            });
        }
        debug!("Opened test-pattern device {} at {}x{}", index, width, height);
        Ok(Box::new(TestPatternReader {
            width: width.max(1),
            height: height.max(1),
            tick: 0,
        }))
    }
}

struct TestPatternReader {
    width: u32,
    height: u32,
    tick: u32,
}

impl FrameReader for TestPatternReader {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        self.tick = self.tick.wrapping_add(1);
        let tick = self.tick;
        Ok(RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                (x.wrapping_add(tick) % 256) as u8,
                (y % 256) as u8,
                ((x ^ y) % 256) as u8,
            ])
        }))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
