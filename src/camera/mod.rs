mod builder;
mod device;
mod enumerate;
#[cfg(all(feature = "camera", target_os = "linux"))]
mod gst;
mod source;
mod test_pattern;


pub use builder::{capture_device, FrameSourceBuilder};
pub use device::{CaptureDevice, DeviceInfo, FrameReader};
pub use enumerate::enumerate_devices;
#[cfg(all(feature = "camera", target_os = "linux"))]
pub use gst::GstCaptureDevice;
pub use source::{FrameSource, FrameSourceStats, STOP_TIMEOUT, TARGET_FPS};
pub use test_pattern::TestPatternDevice;
