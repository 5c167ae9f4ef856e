use super::device::{CaptureDevice, FrameReader};
use crate::error::CameraError;
use gstreamer::prelude::*;
use gstreamer::{ClockTime, Pipeline};
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use image::RgbImage;
use tracing::{debug, info, warn};

/// How long a single pull may block; keeps the capture loop responsive to
/// cancellation.
const PULL_TIMEOUT_MS: u64 = 500;
const STATE_CHANGE_TIMEOUT_SECS: u64 = 3;

/// V4L2 capture through a GStreamer pipeline delivering packed RGB
pub struct GstCaptureDevice;

impl GstCaptureDevice {
    pub fn new() -> Result<Self, CameraError> {
        gstreamer::init().map_err(|e| CameraError::Configuration {
            details: format!("Failed to initialize GStreamer: {}", e),
        })?;
        Ok(Self)
    }

    fn pipeline_description(index: u32, width: u32, height: u32) -> String {
        format!(
            "v4l2src device=/dev/video{} io-mode=mmap ! \
             videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=sink sync=false max-buffers=1 drop=true enable-last-sample=false",
            index, width, height
        )
    }
}

impl CaptureDevice for GstCaptureDevice {
    fn backend(&self) -> &str {
        "gstreamer"
    }

    fn open(&self, index: u32, width: u32, height: u32) -> Result<Box<dyn FrameReader>, CameraError> {
        let description = Self::pipeline_description(index, width, height);
        debug!("Creating GStreamer pipeline: {}", description);

        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| CameraError::DeviceOpen {
                device: index,
                details: format!("Failed to create pipeline: {}", e),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| CameraError::Configuration {
                details: "Failed to downcast to Pipeline".to_string(),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CameraError::Configuration {
                details: "Pipeline has no appsink".to_string(),
            })?
            .downcast::<AppSink>()
            .map_err(|_| CameraError::Configuration {
                details: "Failed to downcast to AppSink".to_string(),
            })?;

        let reader = GstFrameReader {
            pipeline,
            appsink,
            resolution: (width, height),
        };

        reader
            .pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| CameraError::DeviceOpen {
                device: index,
                details: format!("Failed to start pipeline: {}", e),
            })?;

        let (result, _, _) = reader
            .pipeline
            .state(ClockTime::from_seconds(STATE_CHANGE_TIMEOUT_SECS));
        result.map_err(|e| CameraError::DeviceOpen {
            device: index,
            details: format!("Pipeline did not reach PLAYING: {}", e),
        })?;

        info!("GStreamer pipeline playing for /dev/video{}", index);
        Ok(Box::new(reader))
    }
}

struct GstFrameReader {
    pipeline: Pipeline,
    appsink: AppSink,
    resolution: (u32, u32),
}

impl FrameReader for GstFrameReader {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        let sample = self
            .appsink
            .try_pull_sample(ClockTime::from_mseconds(PULL_TIMEOUT_MS))
            .ok_or_else(|| CameraError::Read {
                details: if self.appsink.is_eos() {
                    "end of stream".to_string()
                } else {
                    "no sample within timeout".to_string()
                },
            })?;

        let buffer = sample.buffer().ok_or_else(|| CameraError::Read {
            details: "No buffer in sample".to_string(),
        })?;
        let caps = sample.caps().ok_or_else(|| CameraError::Read {
            details: "No caps in sample".to_string(),
        })?;
        let info = VideoInfo::from_caps(caps).map_err(|e| CameraError::Read {
            details: format!("Failed to get video info: {}", e),
        })?;

        let width = info.width();
        let height = info.height();
        let stride = info.stride()[0] as usize;
        let row_bytes = width as usize * 3;

        let map = buffer.map_readable().map_err(|e| CameraError::Read {
            details: format!("Failed to map buffer: {}", e),
        })?;
        let data = map.as_slice();
        if data.len() < stride * (height as usize).saturating_sub(1) + row_bytes {
            return Err(CameraError::Read {
                details: format!("Short buffer: {} bytes for {}x{}", data.len(), width, height),
            });
        }

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(&data[start..start + row_bytes]);
        }

        if (width, height) != self.resolution {
            self.resolution = (width, height);
        }

        RgbImage::from_raw(width, height, pixels).ok_or_else(|| CameraError::Read {
            details: "Frame size mismatch".to_string(),
        })
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }
}

impl Drop for GstFrameReader {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            warn!("Failed to stop GStreamer pipeline: {}", e);
        }
    }
}
