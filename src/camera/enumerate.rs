use super::device::{CaptureDevice, DeviceInfo};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Probe device indices `0..limit` and return the ones that open. Per-index
/// failures are swallowed; the device is simply omitted.
pub async fn enumerate_devices(device: Arc<dyn CaptureDevice>, limit: u32) -> Vec<DeviceInfo> {
    let result = tokio::task::spawn_blocking(move || {
        (0..limit)
            .filter_map(|index| match device.probe(index) {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!("Probe of device {} failed: {}", index, e);
                    None
                }
            })
            .collect::<Vec<_>>()
    })
    .await;

    match result {
        Ok(devices) => {
            info!("Found {} capture device(s)", devices.len());
            devices
        }
        Err(e) => {
            error!("Device enumeration task failed: {}", e);
            Vec::new()
        }
    }
}
