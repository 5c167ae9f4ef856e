use image::{GrayImage, RgbImage};
use std::time::SystemTime;

/// A decoded RGB frame. `Clone` is a deep copy, so every reader owns its
/// own pixels and never races the capture loop.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic identifier assigned by the capture loop
    pub id: u64,
    /// Timestamp when the frame was read from the device
    pub timestamp: SystemTime,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(id: u64, timestamp: SystemTime, image: RgbImage) -> Self {
        Self {
            id,
            timestamp,
            image,
        }
    }

    /// Build a frame from packed RGB24 bytes. Returns `None` when the buffer
    /// does not hold exactly `width * height * 3` bytes.
    pub fn from_rgb24(id: u64, width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(|image| Self::new(id, SystemTime::now(), image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Luma conversion used by the template matcher
    pub fn to_gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }
}
