use super::device::CaptureDevice;
use super::source::FrameSource;
use super::test_pattern::TestPatternDevice;
use crate::config::{CameraConfig, CaptureBackend};
use crate::error::{CuewatchError, Result};
use std::sync::Arc;

/// Capture device for the configured backend
pub fn capture_device(backend: CaptureBackend) -> Result<Arc<dyn CaptureDevice>> {
    match backend {
        CaptureBackend::TestPattern => Ok(Arc::new(TestPatternDevice::default())),
        #[cfg(all(feature = "camera", target_os = "linux"))]
        CaptureBackend::Gstreamer => Ok(Arc::new(super::GstCaptureDevice::new()?)),
        #[cfg(not(all(feature = "camera", target_os = "linux")))]
        CaptureBackend::Gstreamer => Err(crate::error::CameraError::BackendUnavailable {
            backend: "gstreamer".to_string(),
        }
        .into()),
    }
}

/// Builder for the frame source
pub struct FrameSourceBuilder {
    config: Option<CameraConfig>,
    device: Option<Arc<dyn CaptureDevice>>,
}

impl FrameSourceBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            device: None,
        }
    }

    pub fn config(mut self, config: CameraConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an explicit device instead of the configured backend
    pub fn device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn build(self) -> Result<FrameSource> {
        let config = self
            .config
            .ok_or_else(|| CuewatchError::system("Camera configuration must be specified"))?;

        let device = match self.device {
            Some(device) => device,
            None => capture_device(config.backend)?,
        };

        Ok(FrameSource::with_fps(device, config.fps))
    }
}

impl Default for FrameSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
