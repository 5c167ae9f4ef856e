use crate::error::CameraError;
use image::RgbImage;
use serde::Serialize;

/// Display metadata returned by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// A family of capture devices addressed by index
pub trait CaptureDevice: Send + Sync {
    /// Backend name used in logs and device names
    fn backend(&self) -> &str;

    /// Open device `index` at (approximately) the requested resolution.
    /// Blocking; called from the capture worker.
    fn open(&self, index: u32, width: u32, height: u32) -> Result<Box<dyn FrameReader>, CameraError>;

    /// Open a device briefly to learn its reported resolution
    fn probe(&self, index: u32) -> Result<DeviceInfo, CameraError> {
        let reader = self.open(index, 640, 480)?;
        let (width, height) = reader.resolution();
        Ok(DeviceInfo {
            index,
            name: format!("{} device {}", self.backend(), index),
            width,
            height,
        })
    }
}

/// An open capture session. Dropping it releases the device.
pub trait FrameReader: Send {
    /// Block until the next frame is decoded
    fn read_frame(&mut self) -> Result<RgbImage, CameraError>;

    /// Resolution actually delivered by the device
    fn resolution(&self) -> (u32, u32);
}
