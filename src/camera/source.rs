use super::device::{CaptureDevice, FrameReader};
use crate::frame::Frame;
use crate::frame_slot::{FrameSlot, FrameSlotStatsSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Rate the capture loop throttles itself to
pub const TARGET_FPS: u32 = 30;

/// How long `stop()` waits for the capture loop to exit
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(20);
const SUBSCRIBER_CAPACITY: usize = 4;

/// Owns one capture session and publishes the most recent frame.
///
/// The capture loop runs on a blocking worker. Each frame replaces the
/// latest-frame slot and is fanned out to subscribers through a broadcast
/// channel, so a slow or dropped subscriber never stalls capture.
pub struct FrameSource {
    device: Arc<dyn CaptureDevice>,
    fps: u32,
    slot: Arc<FrameSlot>,
    frames: broadcast::Sender<Frame>,
    /// Id of the session whose loop currently holds an open device, 0 if none
    running_session: Arc<AtomicU64>,
    session_counter: AtomicU64,
    frame_counter: Arc<AtomicU64>,
    read_failures: Arc<AtomicU64>,
    session: Mutex<Option<CaptureSession>>,
}

struct CaptureSession {
    id: u64,
    device_index: u32,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Capture statistics
#[derive(Debug, Clone)]
pub struct FrameSourceStats {
    pub running: bool,
    pub frames_captured: u64,
    pub read_failures: u64,
    pub subscribers: usize,
    pub slot: FrameSlotStatsSnapshot,
}

struct CaptureLoop {
    session_id: u64,
    device: Arc<dyn CaptureDevice>,
    device_index: u32,
    width: u32,
    height: u32,
    frame_interval: Duration,
    slot: Arc<FrameSlot>,
    frames: broadcast::Sender<Frame>,
    running_session: Arc<AtomicU64>,
    frame_counter: Arc<AtomicU64>,
    read_failures: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl FrameSource {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self::with_fps(device, TARGET_FPS)
    }

    pub fn with_fps(device: Arc<dyn CaptureDevice>, fps: u32) -> Self {
        let (frames, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            device,
            fps: fps.max(1),
            slot: Arc::new(FrameSlot::new()),
            frames,
            running_session: Arc::new(AtomicU64::new(0)),
            session_counter: AtomicU64::new(0),
            frame_counter: Arc::new(AtomicU64::new(0)),
            read_failures: Arc::new(AtomicU64::new(0)),
            session: Mutex::new(None),
        }
    }

    /// Start capturing from `device_index`. A running session is fully
    /// stopped first. Returns without waiting for the device to open; if it
    /// cannot be opened the loop exits quietly and `is_running()` stays false.
    pub async fn start(&self, device_index: u32, width: u32, height: u32) {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            info!("Restarting capture (device {} -> {})", previous.device_index, device_index);
            self.shutdown_session(previous).await;
        }

        let id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let capture = CaptureLoop {
            session_id: id,
            device: Arc::clone(&self.device),
            device_index,
            width,
            height,
            frame_interval: Duration::from_secs_f64(1.0 / self.fps as f64),
            slot: Arc::clone(&self.slot),
            frames: self.frames.clone(),
            running_session: Arc::clone(&self.running_session),
            frame_counter: Arc::clone(&self.frame_counter),
            read_failures: Arc::clone(&self.read_failures),
            cancel: cancel.clone(),
        };

        info!(
            "Starting capture on {} device {} ({}x{} @ {}fps)",
            self.device.backend(),
            device_index,
            width,
            height,
            self.fps
        );
        let task = tokio::task::spawn_blocking(move || capture.run());

        *session = Some(CaptureSession {
            id,
            device_index,
            cancel,
            task,
        });
    }

    /// Cancel the capture loop, wait (bounded) for it to exit and release
    /// the latest frame.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        match session.take() {
            Some(previous) => self.shutdown_session(previous).await,
            None => debug!("Capture is not running"),
        }
    }

    async fn shutdown_session(&self, session: CaptureSession) {
        debug!("Stopping capture session {}", session.id);
        session.cancel.cancel();

        match tokio::time::timeout(STOP_TIMEOUT, session.task).await {
            Ok(Ok(())) => debug!("Capture session {} exited", session.id),
            Ok(Err(e)) => error!("Capture task failed: {}", e),
            Err(_) => warn!(
                "Capture session {} did not exit within {:?}; it will release the device when it does",
                session.id, STOP_TIMEOUT
            ),
        }

        let _ = self.running_session.compare_exchange(
            session.id,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.slot.clear();
        info!("Capture stopped");
    }

    /// True while a capture loop holds an open device
    pub fn is_running(&self) -> bool {
        self.running_session.load(Ordering::Acquire) != 0
    }

    /// Private copy of the most recent frame. Never waits on the capture loop.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.slot.latest()
    }

    /// Receive a copy of every captured frame. Lagging receivers skip frames.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.frames.subscribe()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> FrameSourceStats {
        FrameSourceStats {
            running: self.is_running(),
            frames_captured: self.frame_count(),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            subscribers: self.frames.receiver_count(),
            slot: self.slot.stats(),
        }
    }

    pub fn device(&self) -> Arc<dyn CaptureDevice> {
        Arc::clone(&self.device)
    }
}

impl CaptureLoop {
    fn run(self) {
        let mut reader = match self.device.open(self.device_index, self.width, self.height) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Capture device unavailable: {}", e);
                return;
            }
        };

        if self.cancel.is_cancelled() {
            debug!("Capture cancelled while opening device {}", self.device_index);
            return;
        }

        let (width, height) = reader.resolution();
        if (width, height) != (self.width, self.height) {
            warn!(
                "Capture resolution adjusted by device: requested {}x{}, got {}x{}",
                self.width, self.height, width, height
            );
        }

        self.running_session.store(self.session_id, Ordering::Release);
        self.capture(reader.as_mut());
        let _ = self.running_session.compare_exchange(
            self.session_id,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        drop(reader);
        info!("Capture loop for device {} ended", self.device_index);
    }

    fn capture(&self, reader: &mut dyn FrameReader) {
        let mut consecutive_failures = 0u32;

        while !self.cancel.is_cancelled() {
            let started = Instant::now();

            match reader.read_frame() {
                Ok(image) => {
                    consecutive_failures = 0;
                    let id = self.frame_counter.fetch_add(1, Ordering::Relaxed);
                    let frame = Frame::new(id, SystemTime::now(), image);
                    trace!("Captured frame {} ({}x{})", id, frame.width(), frame.height());

                    if self.frames.receiver_count() > 0 {
                        // Each receiver clones its own copy on receive
                        let _ = self.frames.send(frame.clone());
                    }
                    if !self.slot.publish_if(frame, || !self.cancel.is_cancelled()) {
                        break;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.read_failures.fetch_add(1, Ordering::Relaxed);
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            "Giving up after {} consecutive read failures: {}",
                            consecutive_failures, e
                        );
                        break;
                    }
                    debug!("Transient read failure ({}): {}", consecutive_failures, e);
                    std::thread::sleep(READ_RETRY_DELAY);
                    continue;
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.frame_interval {
                std::thread::sleep(self.frame_interval - elapsed);
            }
        }
    }
}
