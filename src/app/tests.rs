use super::*;
use crate::auth::MemoryTokenStore;
use crate::camera::{CaptureDevice, FrameReader, FrameSource};
use crate::config::CuewatchConfig;
use crate::detection::{
    Classification, Detection, DetectionState, DetectionStateMachine, MIN_RESOLVED_DELAY,
};
use crate::error::{CameraError, PredictionError};
use crate::events::{CuewatchEvent, EventBus, EventFilter, OperatorCommand};
use crate::history::MemoryHistorySink;
use crate::matcher::{Roi, Trigger, TriggerKind, TriggerMatch, TriggerSet};
use crate::prediction::{PredictionClient, PredictionRequest, PredictionStatus};
use crate::test_support::{eventually, token_expiring_in, MockService};
use image::{GrayImage, Luma, Rgb, RgbImage};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
const START_AT: (u32, u32) = (4, 4);

fn checker(size: u32) -> GrayImage {
    GrayImage::from_fn(size, size, |x, y| {
        Luma([if (x / 2 + y / 2) % 2 == 0 { 20 } else { 230 }])
    })
}

fn background() -> RgbImage {
    RgbImage::from_fn(WIDTH, HEIGHT, |x, y| Rgb([(x * 2) as u8, (y * 3) as u8, 90]))
}

fn scene_with(reference: &GrayImage, at: (u32, u32)) -> RgbImage {
    let mut image = background();
    for (x, y, pixel) in reference.enumerate_pixels() {
        let v = pixel.0[0];
        image.put_pixel(at.0 + x, at.1 + y, Rgb([v, v, v]));
    }
    image
}

fn start_triggers() -> TriggerSet {
    TriggerSet::new(vec![Trigger::new(
        TriggerKind::Start,
        Roi::new(0, 0, 24, 24),
        Some(checker(12)),
        0.8,
    )])
}

/// Device that keeps delivering whatever scene the test put up
#[derive(Clone)]
struct StaticDevice {
    scene: Arc<Mutex<RgbImage>>,
}

impl StaticDevice {
    fn new(scene: RgbImage) -> Self {
        Self {
            scene: Arc::new(Mutex::new(scene)),
        }
    }
}

struct StaticReader {
    scene: Arc<Mutex<RgbImage>>,
}

impl CaptureDevice for StaticDevice {
    fn backend(&self) -> &str {
        "static"
    }

    fn open(&self, _index: u32, _width: u32, _height: u32) -> Result<Box<dyn FrameReader>, CameraError> {
        Ok(Box::new(StaticReader {
            scene: Arc::clone(&self.scene),
        }))
    }
}

impl FrameReader for StaticReader {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        Ok(self.scene.lock().clone())
    }

    fn resolution(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }
}

async fn wait_for_state(machine: &DetectionStateMachine, state: DetectionState, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if machine.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    machine.state() == state
}

struct Harness {
    mock: MockService,
    machine: Arc<DetectionStateMachine>,
    actions: ActionOrchestrator,
    history: Arc<MemoryHistorySink>,
    events: EventBus,
}

async fn harness(authenticated: bool, stop_cancel_timeout: Duration) -> Harness {
    let mock = MockService::start().await;
    let credentials = if authenticated {
        mock.authenticated().await
    } else {
        mock.credentials(None).0
    };

    let machine = Arc::new(DetectionStateMachine::new(MIN_RESOLVED_DELAY, false));
    let history = Arc::new(MemoryHistorySink::new());
    let events = EventBus::new(64);
    let actions = ActionOrchestrator::new(
        Arc::clone(&machine),
        Some(PredictionClient::new(credentials)),
        history.clone(),
        events.clone(),
        PredictionRequest::new("Will we win?", "Win", "Lose", 60),
        stop_cancel_timeout,
    );
    actions.start();

    Harness {
        mock,
        machine,
        actions,
        history,
        events,
    }
}

impl Harness {
    /// Start detection and open a round; waits for the prediction
    async fn open_round(&self) {
        self.machine.start();
        self.machine.feed(Detection::new(Classification::Start, 0.95));
        assert_eq!(self.machine.state(), DetectionState::Voting);
        assert!(eventually(|| self.actions.live_prediction().is_some()).await);
    }
}

#[test]
fn test_classify_prefers_highest_matched_score() {
    let results = [
        TriggerMatch { kind: TriggerKind::Win, score: 0.85, matched: true },
        TriggerMatch { kind: TriggerKind::Lose, score: 0.95, matched: true },
    ];
    assert_eq!(classify(&results), Detection::new(Classification::Lose, 0.95));

    let tie = [
        TriggerMatch { kind: TriggerKind::Win, score: 0.9, matched: true },
        TriggerMatch { kind: TriggerKind::Lose, score: 0.9, matched: true },
    ];
    assert_eq!(classify(&tie).classification, Classification::Win);

    let unmatched = [TriggerMatch { kind: TriggerKind::Start, score: 0.99, matched: false }];
    assert_eq!(classify(&unmatched), Detection::none());
    assert_eq!(classify(&[]), Detection::none());
}

#[tokio::test]
async fn test_poller_feeds_state_machine() {
    let device = StaticDevice::new(scene_with(&checker(12), START_AT));
    let source = Arc::new(FrameSource::with_fps(Arc::new(device), 30));
    let machine = Arc::new(DetectionStateMachine::new(MIN_RESOLVED_DELAY, false));
    let poller = MatchPoller::new(
        Arc::clone(&source),
        Arc::clone(&machine),
        start_triggers(),
        Duration::from_millis(50),
    );

    // Stopped evaluates nothing
    assert!(poller.poll_once().await.is_none());

    source.start(0, WIDTH, HEIGHT).await;
    assert!(eventually(|| source.latest_frame().is_some()).await);
    machine.start();

    let transition = poller.poll_once().await.unwrap();
    assert_eq!(transition.state, DetectionState::Voting);
    assert_eq!(transition.classification(), Classification::Start);
    assert!(transition.detection.score >= 0.8);

    // Start triggers are not evaluated while voting
    assert!(poller.poll_once().await.is_none());
    assert_eq!(poller.poll_count(), 3);

    source.stop().await;
}

#[tokio::test]
async fn test_set_triggers_takes_effect_on_next_poll() {
    let device = StaticDevice::new(scene_with(&checker(12), START_AT));
    let source = Arc::new(FrameSource::with_fps(Arc::new(device), 30));
    let machine = Arc::new(DetectionStateMachine::new(MIN_RESOLVED_DELAY, false));
    let poller = MatchPoller::new(
        Arc::clone(&source),
        Arc::clone(&machine),
        TriggerSet::default(),
        Duration::from_millis(50),
    );

    source.start(0, WIDTH, HEIGHT).await;
    assert!(eventually(|| source.latest_frame().is_some()).await);
    machine.start();

    assert!(poller.poll_once().await.is_none());
    poller.set_triggers(start_triggers());
    assert_eq!(poller.triggers().len(), 1);
    assert!(poller.poll_once().await.is_some());

    source.stop().await;
}

#[tokio::test]
async fn test_matching_runs_on_blocking_pool() {
    const SCENE_WIDTH: u32 = 200;
    const SCENE_HEIGHT: u32 = 150;

    let cue = checker(32);
    let mut scene = RgbImage::from_fn(SCENE_WIDTH, SCENE_HEIGHT, |x, y| {
        Rgb([(x % 251) as u8, (y % 241) as u8, 90])
    });
    for (x, y, pixel) in cue.enumerate_pixels() {
        let v = pixel.0[0];
        scene.put_pixel(120 + x, 80 + y, Rgb([v, v, v]));
    }

    let source = Arc::new(FrameSource::with_fps(Arc::new(StaticDevice::new(scene)), 30));
    let machine = Arc::new(DetectionStateMachine::new(MIN_RESOLVED_DELAY, false));
    let poller = MatchPoller::new(
        Arc::clone(&source),
        Arc::clone(&machine),
        TriggerSet::new(vec![Trigger::new(
            TriggerKind::Start,
            Roi::new(0, 0, SCENE_WIDTH as i32, SCENE_HEIGHT as i32),
            Some(cue),
            0.8,
        )]),
        Duration::from_millis(50),
    );

    source.start(0, SCENE_WIDTH, SCENE_HEIGHT).await;
    assert!(eventually(|| source.latest_frame().is_some()).await);
    machine.start();

    // A full-frame search yields to the runtime instead of finishing inline
    let mut pass = Box::pin(poller.poll_once());
    assert!(futures::poll!(&mut pass).is_pending());

    let transition = pass.await.unwrap();
    assert_eq!(transition.classification(), Classification::Start);
    assert_eq!(machine.state(), DetectionState::Voting);

    source.stop().await;
}

#[tokio::test]
async fn test_poller_run_stops_on_cancel() {
    let device = StaticDevice::new(background());
    let source = Arc::new(FrameSource::with_fps(Arc::new(device), 30));
    let machine = Arc::new(DetectionStateMachine::new(MIN_RESOLVED_DELAY, false));
    let poller = Arc::new(MatchPoller::new(
        source,
        machine,
        start_triggers(),
        Duration::from_millis(50),
    ));

    let cancel = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn({
        let poller = Arc::clone(&poller);
        let cancel = cancel.clone();
        async move { poller.run(cancel).await }
    });

    assert!(eventually(|| poller.poll_count() >= 3).await);
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_start_opens_prediction() {
    let h = harness(true, Duration::from_secs(1)).await;
    h.open_round().await;

    let handle = h.actions.live_prediction().unwrap();
    assert_eq!(handle.id, "pred-1");
    assert_eq!(handle.status, PredictionStatus::Created);
    assert_eq!(h.actions.status(), PredictionStatus::Created);

    assert!(eventually(|| h.history.len() == 1).await);
    let record = &h.history.records()[0];
    assert_eq!(record.kind, TriggerKind::Start);
    assert_eq!(record.prediction_id, "pred-1");
    assert_eq!(record.status, PredictionStatus::Created);
    assert!((record.score - 0.95).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_win_resolves_and_rearms() {
    let h = harness(true, Duration::from_secs(1)).await;
    h.open_round().await;

    h.machine.feed(Detection::new(Classification::Win, 0.9));
    assert_eq!(h.machine.state(), DetectionState::Resolved);

    assert!(eventually(|| h.mock.state.patch_statuses() == vec!["RESOLVED:outcome-win"]).await);
    assert!(eventually(|| h.history.len() == 2).await);
    assert!(h.actions.live_prediction().is_none());
    assert_eq!(h.actions.status(), PredictionStatus::Resolved);

    let record = &h.history.records()[1];
    assert_eq!(record.kind, TriggerKind::Win);
    assert_eq!(record.status, PredictionStatus::Resolved);

    assert!(wait_for_state(&h.machine, DetectionState::Idle, Duration::from_secs(3)).await);
}

#[tokio::test]
async fn test_unauthenticated_round_is_local_only() {
    let h = harness(false, Duration::from_secs(1)).await;
    h.machine.start();
    h.machine.feed(Detection::new(Classification::Start, 0.95));
    h.machine.feed(Detection::new(Classification::Lose, 0.9));
    assert_eq!(h.machine.state(), DetectionState::Resolved);

    assert!(eventually(|| h.history.len() == 2).await);
    let records = h.history.records();
    assert_eq!(records[1].kind, TriggerKind::Lose);
    assert_eq!(records[1].status, PredictionStatus::None);
    assert_eq!(records[1].prediction_id, "");
    assert_eq!(h.actions.status(), PredictionStatus::None);
    assert_eq!(h.mock.state.api_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_cancels_live_prediction_even_when_cancel_fails() {
    let h = harness(true, Duration::from_secs(1)).await;
    h.open_round().await;
    h.mock.state.fail_predictions.store(true, Ordering::SeqCst);

    h.actions.stop().await;

    assert_eq!(h.mock.state.patch_statuses(), vec!["CANCELED"]);
    assert_eq!(h.machine.state(), DetectionState::Stopped);
    assert!(h.actions.live_prediction().is_none());
    assert_eq!(h.actions.status(), PredictionStatus::Failed);
}

#[tokio::test]
async fn test_stop_is_bounded_by_cancel_timeout() {
    let h = harness(true, Duration::from_millis(300)).await;
    h.open_round().await;
    h.mock.state.api_delay_ms.store(2_000, Ordering::SeqCst);

    let started = Instant::now();
    h.actions.stop().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.machine.state(), DetectionState::Stopped);

    // The cancel call keeps going in the background
    assert!(wait_for_patch(&h.mock, "CANCELED", Duration::from_secs(4)).await);
}

async fn wait_for_patch(mock: &MockService, status: &str, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if mock.state.patch_statuses().iter().any(|s| s == status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_create_straddling_stop_is_undone() {
    let h = harness(true, Duration::from_secs(2)).await;
    h.mock.state.api_delay_ms.store(300, Ordering::SeqCst);

    h.machine.start();
    h.machine.feed(Detection::new(Classification::Start, 0.95));
    assert!(eventually(|| h.mock.state.api_requests.load(Ordering::SeqCst) == 1).await);

    // Nothing live yet, so this only stops the machine
    h.actions.stop().await;
    assert_eq!(h.machine.state(), DetectionState::Stopped);

    assert!(wait_for_patch(&h.mock, "CANCELED", Duration::from_secs(3)).await);
    assert!(eventually(|| h.actions.status() == PredictionStatus::Canceled).await);
    assert!(h.actions.live_prediction().is_none());
}

#[tokio::test]
async fn test_missed_result_is_settled_after_lag() {
    let h = harness(true, Duration::from_secs(2)).await;
    h.mock.state.api_delay_ms.store(300, Ordering::SeqCst);

    h.machine.start();
    h.machine.feed(Detection::new(Classification::Start, 0.95));
    assert!(eventually(|| h.mock.state.api_requests.load(Ordering::SeqCst) == 1).await);

    // While the create is in flight the round ends and the feed overflows
    h.machine.feed(Detection::new(Classification::Win, 0.9));
    for _ in 0..40 {
        h.machine.stop();
        h.machine.start();
    }

    assert!(wait_for_patch(&h.mock, "RESOLVED:outcome-win", Duration::from_secs(3)).await);
    assert!(eventually(|| h.actions.live_prediction().is_none()).await);
    assert!(eventually(|| h.history.records().iter().any(|r| r.kind == TriggerKind::Win)).await);
    assert_eq!(h.mock.state.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_abandoned_round_is_canceled_after_lag() {
    let h = harness(true, Duration::from_secs(2)).await;
    h.mock.state.api_delay_ms.store(300, Ordering::SeqCst);

    h.machine.start();
    h.machine.feed(Detection::new(Classification::Start, 0.95));
    assert!(eventually(|| h.mock.state.api_requests.load(Ordering::SeqCst) == 1).await);

    // Voting ends without a result and the feed overflows
    for _ in 0..40 {
        h.machine.stop();
        h.machine.start();
    }

    assert!(wait_for_patch(&h.mock, "CANCELED", Duration::from_secs(3)).await);
    assert!(eventually(|| h.actions.status() == PredictionStatus::Canceled).await);
    assert!(h.actions.live_prediction().is_none());
    assert!(h.history.records().iter().all(|r| r.kind == TriggerKind::Start));
}

#[tokio::test]
async fn test_create_failure_is_recorded() {
    let h = harness(true, Duration::from_secs(1)).await;
    let mut failures = h.events.receiver(
        EventFilter::EventTypes(vec!["prediction_failed"]),
        "test",
    );
    h.mock.state.fail_predictions.store(true, Ordering::SeqCst);

    h.machine.start();
    h.machine.feed(Detection::new(Classification::Start, 0.95));

    assert!(eventually(|| h.history.len() == 1).await);
    assert_eq!(h.history.records()[0].status, PredictionStatus::Failed);
    assert_eq!(h.actions.status(), PredictionStatus::Failed);
    assert_eq!(h.machine.state(), DetectionState::Voting);

    let event = tokio::time::timeout(Duration::from_secs(1), failures.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        CuewatchEvent::PredictionFailed { operation, error } => {
            assert_eq!(operation, "create");
            assert!(error.contains("prediction already active"), "{}", error);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_lock_prediction() {
    let h = harness(true, Duration::from_secs(1)).await;
    assert!(matches!(
        h.actions.lock_prediction().await,
        Err(PredictionError::NoLivePrediction)
    ));

    h.open_round().await;
    h.actions.lock_prediction().await.unwrap();
    assert_eq!(h.mock.state.patch_statuses(), vec!["LOCKED"]);
    assert_eq!(h.actions.status(), PredictionStatus::Locked);
    assert_eq!(h.actions.live_prediction().unwrap().status, PredictionStatus::Locked);

    // A locked prediction still resolves
    h.machine.feed(Detection::new(Classification::Lose, 0.9));
    assert!(eventually(|| h.actions.status() == PredictionStatus::Resolved).await);
    assert_eq!(
        h.mock.state.patch_statuses(),
        vec!["LOCKED", "RESOLVED:outcome-lose"]
    );
}

#[tokio::test]
async fn test_dispatcher_shutdown() {
    let h = harness(true, Duration::from_secs(1)).await;
    assert!(h.actions.is_dispatching());
    h.actions.shutdown(Duration::from_secs(1)).await;
    assert!(!h.actions.is_dispatching());

    // Transitions after shutdown are no longer acted on
    h.machine.start();
    h.machine.feed(Detection::new(Classification::Start, 0.95));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.mock.state.creates.load(Ordering::SeqCst), 0);
}

fn app_config(mock: Option<&MockService>) -> CuewatchConfig {
    let mut config = CuewatchConfig::default();
    config.camera.resolution = (WIDTH, HEIGHT);
    config.detection.poll_interval_ms = 50;
    config.detection.resolved_delay_seconds = 1;
    if let Some(mock) = mock {
        config.auth = mock.auth_config();
        config.prediction.api_base_url = mock.api_base_url();
    }
    config
}

#[tokio::test]
async fn test_detection_only_app() {
    let device = StaticDevice::new(background());
    let mut app = CuewatchApp::with_components(
        app_config(None),
        Arc::new(device),
        Arc::new(MemoryTokenStore::new()),
        Arc::new(MemoryHistorySink::new()),
    )
    .unwrap();
    assert!(app.credentials().is_none());

    app.initialize().await.unwrap();
    app.start().await.unwrap();

    assert_eq!(app.get_component_state("auth").await, Some(ComponentState::Disabled));
    assert_eq!(app.get_component_state("camera").await, Some(ComponentState::Running));
    assert_eq!(app.machine().state(), DetectionState::Idle);

    app.handle_command(OperatorCommand::ToggleAlwaysVoting).await;
    assert_eq!(app.machine().state(), DetectionState::Voting);
    app.handle_command(OperatorCommand::ForceLose).await;
    assert_eq!(app.machine().state(), DetectionState::Resolved);
    app.handle_command(OperatorCommand::Reset).await;
    app.handle_command(OperatorCommand::Stop).await;
    assert_eq!(app.machine().state(), DetectionState::Stopped);
    app.handle_command(OperatorCommand::Start).await;
    assert_ne!(app.machine().state(), DetectionState::Stopped);

    assert_eq!(
        app.handle_command(OperatorCommand::Quit).await,
        Some(ShutdownReason::UserRequest)
    );

    assert_eq!(app.shutdown().await.unwrap(), 0);
    assert!(!app.frame_source().is_running());
    assert_eq!(app.machine().state(), DetectionState::Stopped);
    assert_eq!(app.get_component_state("camera").await, Some(ComponentState::Stopped));
}

#[tokio::test]
async fn test_app_round_trip() {
    let mock = MockService::start().await;
    let device = StaticDevice::new(background());
    let scene = Arc::clone(&device.scene);
    let history = Arc::new(MemoryHistorySink::new());

    let mut app = CuewatchApp::with_components(
        app_config(Some(&mock)),
        Arc::new(device),
        Arc::new(MemoryTokenStore::with_token(token_expiring_in(3600))),
        history.clone(),
    )
    .unwrap();
    app.set_triggers(start_triggers());

    app.initialize().await.unwrap();
    app.start().await.unwrap();
    assert!(app.credentials().unwrap().is_authenticated());
    assert_eq!(app.machine().state(), DetectionState::Idle);

    // Put the start cue on screen and let the poller find it
    *scene.lock() = scene_with(&checker(12), START_AT);
    assert!(wait_for_state(app.machine(), DetectionState::Voting, Duration::from_secs(2)).await);
    assert!(eventually(|| app.actions().live_prediction().is_some()).await);
    *scene.lock() = background();

    app.handle_command(OperatorCommand::ForceWin).await;
    assert!(eventually(|| history.kinds() == vec![TriggerKind::Start, TriggerKind::Win]).await);
    assert_eq!(mock.state.patch_statuses(), vec!["RESOLVED:outcome-win"]);

    assert_eq!(app.shutdown().await.unwrap(), 0);
    assert_eq!(app.machine().state(), DetectionState::Stopped);
}

#[tokio::test]
async fn test_shutdown_cancels_open_prediction() {
    let mock = MockService::start().await;
    let device = StaticDevice::new(background());
    let mut app = CuewatchApp::with_components(
        app_config(Some(&mock)),
        Arc::new(device),
        Arc::new(MemoryTokenStore::with_token(token_expiring_in(3600))),
        Arc::new(MemoryHistorySink::new()),
    )
    .unwrap();

    app.initialize().await.unwrap();
    app.start().await.unwrap();
    app.handle_command(OperatorCommand::ToggleAlwaysVoting).await;
    assert!(eventually(|| app.actions().live_prediction().is_some()).await);

    assert_eq!(app.shutdown().await.unwrap(), 0);
    assert_eq!(mock.state.patch_statuses(), vec!["CANCELED"]);
}
