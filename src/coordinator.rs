use crate::{
    activity::{ActivityGatePoller, ActivitySource},
    config::FramepulseConfig,
    events::{EventBus, FramepulseEvent},
    ingest::FrametimeIngestor,
    queue::TelemetryQueue,
    scheduler::{spawn_periodic, PeriodicTask},
    session::SessionAccumulator,
    stats::round1,
    upload::{CredentialProvider, MachineContext, SessionUploader, UploadOutcome, UploadTransport},
    wal::TelemetryRecord,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
struct LiveMetricValues {
    fps: f64,
    frametime_ms: f64,
    one_percent_low: f64,
}

struct CoordinatorShared {
    config: FramepulseConfig,
    event_bus: EventBus,
    queue: Arc<TelemetryQueue>,
    uploader: SessionUploader,
    accumulator: SessionAccumulator,
    context: Mutex<MachineContext>,
    game: Mutex<String>,
    session_seconds: AtomicU64,
    recording: AtomicBool,
    active: AtomicBool,
    live: Mutex<LiveMetricValues>,
}

impl CoordinatorShared {
    fn status(&self) -> String {
        if !self.recording.load(Ordering::SeqCst) {
            "Waiting for game".to_string()
        } else if self.active.load(Ordering::SeqCst) {
            "Active".to_string()
        } else {
            "Inactive".to_string()
        }
    }

    fn publish_live(&self) {
        let live = *self.live.lock();
        self.event_bus
            .publish_lossy(FramepulseEvent::LiveMetricsUpdated {
                fps: live.fps,
                frametime_ms: live.frametime_ms,
                one_percent_low: live.one_percent_low,
                status: self.status(),
            });
    }

    /// Finalize the current session: durable enqueue + best-effort upload.
    ///
    /// Session state is reset afterwards whether or not the direct upload
    /// succeeded; the durable queue path is what guarantees delivery.
    async fn upload_session(&self) -> UploadOutcome {
        let stats = self.accumulator.stats();
        let seconds = self.session_seconds.load(Ordering::SeqCst);
        let game = self.game.lock().clone();

        let outcome = if !stats.has_data() {
            debug!("Session upload skipped: no data recorded");
            UploadOutcome::NoData
        } else {
            let avg_frametime = if stats.avg_fps > 0.0 {
                round1(1000.0 / stats.avg_fps)
            } else {
                0.0
            };
            let record = TelemetryRecord {
                timestamp: Utc::now(),
                game: Some(game.clone()),
                avg_fps: stats.avg_fps,
                avg_frametime,
                one_percent_low: stats.one_percent_low,
                sample_count: stats.sample_count as u32,
            };
            if !self.queue.try_enqueue(record).await {
                warn!("Durable enqueue of session record did not land in memory");
            }

            let context = self.context.lock().clone();
            self.uploader
                .upload(&context, &game, stats, seconds)
                .await
        };

        // Give up and start fresh, regardless of the outcome
        self.accumulator.clear();
        self.session_seconds.store(0, Ordering::SeqCst);
        self.event_bus
            .publish_lossy(FramepulseEvent::SessionSecondsChanged { seconds: 0 });
        *self.live.lock() = LiveMetricValues::default();
        self.publish_live();

        match &outcome {
            UploadOutcome::Completed {
                avg_fps,
                one_percent_low,
            } => {
                self.event_bus
                    .publish_lossy(FramepulseEvent::SessionUploadCompleted {
                        timestamp: SystemTime::now(),
                        sample_count: stats.sample_count,
                        avg_fps: *avg_fps,
                        one_percent_low: *one_percent_low,
                    });
            }
            UploadOutcome::Failed { reason } => {
                self.event_bus
                    .publish_lossy(FramepulseEvent::UploadFailed {
                        reason: reason.clone(),
                    });
            }
            UploadOutcome::NoData => {}
        }

        outcome
    }
}

struct RunningTasks {
    poller: ActivityGatePoller,
    ingestor: FrametimeIngestor,
    session_timer: PeriodicTask,
    event_task: JoinHandle<()>,
    token: CancellationToken,
}

/// Orchestrates the telemetry pipeline for one tracked game.
///
/// Owns the activity gate poller, the frametime ingestor, the session
/// accumulator and the session timer; shares the process-scoped queue and
/// upload worker. Sample flow: capture stream -> ingestor -> accumulator
/// (while recording && active) -> finalized into the queue and the direct
/// uploader when the session ends.
pub struct UploadCoordinator {
    shared: Arc<CoordinatorShared>,
    running: Option<RunningTasks>,
}

impl UploadCoordinator {
    pub fn new(
        config: FramepulseConfig,
        event_bus: EventBus,
        queue: Arc<TelemetryQueue>,
        transport: Arc<dyn UploadTransport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let shared = Arc::new(CoordinatorShared {
            config,
            event_bus,
            queue,
            uploader: SessionUploader::new(transport, credentials),
            accumulator: SessionAccumulator::new(),
            context: Mutex::new(MachineContext::default()),
            game: Mutex::new("Unknown".to_string()),
            session_seconds: AtomicU64::new(0),
            recording: AtomicBool::new(false),
            active: AtomicBool::new(false),
            live: Mutex::new(LiveMetricValues::default()),
        });

        Self {
            shared,
            running: None,
        }
    }

    /// Set the hardware/settings context attached to uploaded payloads
    pub fn configure_environment(&self, context: MachineContext) {
        *self.shared.context.lock() = context;
    }

    /// Begin monitoring a game: spawns the gate poller, the ingestor and
    /// the session timer over the given collaborators.
    pub fn start(
        &mut self,
        game_name: &str,
        activity_source: Arc<dyn ActivitySource>,
        samples: mpsc::Receiver<f64>,
    ) {
        if self.running.is_some() {
            warn!("Coordinator already started, ignoring start request");
            return;
        }

        info!("Starting telemetry session tracking for '{}'", game_name);
        *self.shared.game.lock() = game_name.to_string();
        self.shared.accumulator.clear();
        self.shared.session_seconds.store(0, Ordering::SeqCst);
        self.shared
            .event_bus
            .publish_lossy(FramepulseEvent::SessionSecondsChanged { seconds: 0 });

        let token = CancellationToken::new();

        let ingestor =
            FrametimeIngestor::spawn(self.shared.config.ingest.clone(), samples, &token);
        let fps_rx = ingestor.subscribe();

        // Subscribe before the gate spawns so its initial foreground probe
        // is not published into a bus with no listeners
        let event_task = tokio::spawn(run_event_loop(
            Arc::clone(&self.shared),
            fps_rx,
            self.shared.event_bus.subscribe(),
            token.clone(),
        ));

        let poller = ActivityGatePoller::spawn(
            self.shared.config.activity.clone(),
            activity_source,
            self.shared.event_bus.clone(),
            &token,
        );

        // 1 s session counter, gated on recording && active (pause, not reset)
        let timer_shared = Arc::clone(&self.shared);
        let session_timer = spawn_periodic(
            "session_timer",
            Duration::from_secs(1),
            &token,
            move || {
                if timer_shared.recording.load(Ordering::SeqCst)
                    && timer_shared.active.load(Ordering::SeqCst)
                {
                    let seconds =
                        timer_shared.session_seconds.fetch_add(1, Ordering::SeqCst) + 1;
                    timer_shared
                        .event_bus
                        .publish_lossy(FramepulseEvent::SessionSecondsChanged { seconds });
                }
            },
        );

        self.running = Some(RunningTasks {
            poller,
            ingestor,
            session_timer,
            event_task,
            token,
        });
    }

    /// Stop monitoring without uploading
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            info!("Stopping telemetry session tracking");
            running.token.cancel();
            running.poller.stop().await;
            running.ingestor.stop().await;
            running.session_timer.stop().await;
            if running.event_task.await.is_err() {
                warn!("Coordinator event task aborted");
            }
        }
    }

    /// Stop monitoring and attempt a best-effort session upload.
    ///
    /// Returns a distinct no-data outcome when nothing was recorded; no
    /// HTTP call is made in that case.
    pub async fn stop_and_upload(&mut self) -> UploadOutcome {
        self.stop().await;
        self.shared.upload_session().await
    }

    /// Human-readable session status for display
    pub fn status(&self) -> String {
        self.shared.status()
    }

    /// Accumulated session seconds (pauses while inactive)
    pub fn session_seconds(&self) -> u64 {
        self.shared.session_seconds.load(Ordering::SeqCst)
    }

    /// Recent raw frametimes for graphing, if monitoring is running
    pub fn frametime_history(&self) -> Vec<f64> {
        self.running
            .as_ref()
            .map(|r| r.ingestor.frametime_history())
            .unwrap_or_default()
    }

    /// Latest smoothed metrics: (fps, frametime ms, 1% low)
    pub fn live_metrics(&self) -> (f64, f64, f64) {
        let live = *self.shared.live.lock();
        (live.fps, live.frametime_ms, live.one_percent_low)
    }
}

async fn run_event_loop(
    shared: Arc<CoordinatorShared>,
    mut fps_rx: tokio::sync::broadcast::Receiver<crate::ingest::LiveFps>,
    mut bus_rx: tokio::sync::broadcast::Receiver<FramepulseEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            reading = fps_rx.recv() => {
                let reading = match reading {
                    Ok(reading) => reading,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Live FPS consumer lagged by {} readings", skipped);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => continue,
                };

                {
                    let mut live = shared.live.lock();
                    live.fps = reading.fps;
                    live.frametime_ms = if reading.fps > 0.0 {
                        round1(1000.0 / reading.fps)
                    } else {
                        0.0
                    };
                    live.one_percent_low = reading.one_percent_low;
                }

                if shared.recording.load(Ordering::SeqCst)
                    && shared.active.load(Ordering::SeqCst)
                {
                    shared.accumulator.add_fps(reading.fps);
                }

                shared.publish_live();
            }

            event = bus_rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Coordinator event loop lagged by {} events", skipped);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    FramepulseEvent::RecordingStatusChanged { recording, .. } => {
                        shared.recording.store(recording, Ordering::SeqCst);
                        shared.publish_live();
                    }
                    FramepulseEvent::ActivityStatusChanged { active, .. } => {
                        shared.active.store(active, Ordering::SeqCst);
                        shared.publish_live();
                    }
                    FramepulseEvent::InactivityUploadTriggered { .. } => {
                        let seconds = shared.session_seconds.load(Ordering::SeqCst);
                        if seconds > shared.config.session.min_upload_seconds {
                            info!(
                                "Auto-uploading session after inactivity ({} s accumulated)",
                                seconds
                            );
                            shared.upload_session().await;
                        } else {
                            debug!(
                                "Inactivity trigger ignored: session too short ({} s)",
                                seconds
                            );
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ControllerState;
    use crate::error::Result;
    use crate::upload::UploadStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    struct MockSource {
        foreground: AtomicBool,
        key_down: AtomicBool,
    }

    impl MockSource {
        fn new(foreground: bool, key_down: bool) -> Arc<Self> {
            Arc::new(Self {
                foreground: AtomicBool::new(foreground),
                key_down: AtomicBool::new(key_down),
            })
        }
    }

    impl ActivitySource for MockSource {
        fn is_game_in_foreground(&self) -> bool {
            self.foreground.load(Ordering::SeqCst)
        }

        fn is_key_down(&self, _key: u16) -> bool {
            self.key_down.load(Ordering::SeqCst)
        }

        fn controller_state(&self, _index: usize) -> Option<ControllerState> {
            None
        }
    }

    struct MockTransport {
        responses: Mutex<VecDeque<UploadStatus>>,
        calls: Mutex<Vec<serde_json::Value>>,
    }

    impl MockTransport {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl UploadTransport for MockTransport {
        async fn post(
            &self,
            body: serde_json::Value,
            _bearer_token: Option<&str>,
        ) -> Result<UploadStatus> {
            self.calls.lock().push(body);
            Ok(self
                .responses
                .lock()
                .pop_front()
                .unwrap_or(UploadStatus::Accepted))
        }
    }

    struct TokenAlways;

    impl CredentialProvider for TokenAlways {
        fn bearer_token(&self) -> Option<String> {
            Some("device-token".to_string())
        }
    }

    fn fast_config() -> FramepulseConfig {
        let mut config = FramepulseConfig::default();
        config.ingest.emit_interval_ms = 10;
        config.activity.poll_interval_ms = 20;
        config
    }

    fn coordinator_parts(
        dir: &TempDir,
        config: FramepulseConfig,
    ) -> (UploadCoordinator, Arc<MockTransport>, EventBus) {
        let bus = EventBus::new(256);
        let queue = Arc::new(TelemetryQueue::new(dir.path().join("wal.jsonl"), 100));
        let transport = MockTransport::accepting();
        let coordinator = UploadCoordinator::new(
            config,
            bus.clone(),
            queue,
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
            Arc::new(TokenAlways),
        );
        (coordinator, transport, bus)
    }

    #[tokio::test]
    async fn test_stop_and_upload_with_no_data() {
        let dir = TempDir::new().unwrap();
        let (mut coordinator, transport, _bus) = coordinator_parts(&dir, fast_config());

        let (_tx, rx) = mpsc::channel(16);
        coordinator.start("cs2", MockSource::new(false, false), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = coordinator.stop_and_upload().await;
        assert_eq!(outcome, UploadOutcome::NoData);
        // No data means no HTTP call at all
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_active_session_accumulates_and_uploads() {
        let dir = TempDir::new().unwrap();
        let (mut coordinator, transport, _bus) = coordinator_parts(&dir, fast_config());

        let (tx, rx) = mpsc::channel(256);
        coordinator.start("cs2", MockSource::new(true, true), rx);

        // Let the gate see activity, then stream steady 60 FPS frametimes
        tokio::time::sleep(Duration::from_millis(60)).await;
        for _ in 0..30 {
            tx.send(16.6).await.unwrap();
            tokio::time::sleep(Duration::from_millis(12)).await;
        }

        assert_eq!(coordinator.status(), "Active");
        assert!(!coordinator.frametime_history().is_empty());

        let outcome = coordinator.stop_and_upload().await;
        match outcome {
            UploadOutcome::Completed { avg_fps, .. } => {
                assert!((avg_fps - 60.2).abs() < 1.0, "avg_fps = {}", avg_fps);
            }
            other => panic!("expected completed upload, got {:?}", other),
        }
        assert_eq!(transport.call_count(), 1);

        let body = transport.calls.lock()[0].clone();
        assert_eq!(body.get("deviceToken").unwrap(), "device-token");
        assert_eq!(body.get("game").unwrap(), "cs2");
    }

    #[tokio::test]
    async fn test_samples_ignored_while_waiting_for_game() {
        let dir = TempDir::new().unwrap();
        let (mut coordinator, transport, _bus) = coordinator_parts(&dir, fast_config());

        let (tx, rx) = mpsc::channel(256);
        coordinator.start("cs2", MockSource::new(false, false), rx);

        for _ in 0..10 {
            tx.send(16.6).await.unwrap();
            tokio::time::sleep(Duration::from_millis(12)).await;
        }

        assert_eq!(coordinator.status(), "Waiting for game");
        let outcome = coordinator.stop_and_upload().await;
        assert_eq!(outcome, UploadOutcome::NoData);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_session_state_reset_after_attempt() {
        let dir = TempDir::new().unwrap();
        let (mut coordinator, _transport, _bus) = coordinator_parts(&dir, fast_config());

        let (tx, rx) = mpsc::channel(256);
        coordinator.start("cs2", MockSource::new(true, true), rx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        for _ in 0..15 {
            tx.send(16.6).await.unwrap();
            tokio::time::sleep(Duration::from_millis(12)).await;
        }

        coordinator.stop_and_upload().await;

        assert_eq!(coordinator.session_seconds(), 0);
        assert_eq!(coordinator.live_metrics(), (0.0, 0.0, 0.0));
    }

    #[tokio::test]
    async fn test_finalized_session_lands_in_durable_queue() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(256);
        let queue = Arc::new(TelemetryQueue::new(dir.path().join("wal.jsonl"), 100));
        let transport = MockTransport::accepting();
        let mut coordinator = UploadCoordinator::new(
            fast_config(),
            bus,
            Arc::clone(&queue),
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
            Arc::new(TokenAlways),
        );

        let (tx, rx) = mpsc::channel(256);
        coordinator.start("cs2", MockSource::new(true, true), rx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        for _ in 0..15 {
            tx.send(16.6).await.unwrap();
            tokio::time::sleep(Duration::from_millis(12)).await;
        }

        coordinator.stop_and_upload().await;

        // The durable path got its own record, WAL-first
        assert_eq!(queue.pending_count(), 1);
        let records = queue.wal().replay().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].game.as_deref(), Some("cs2"));
        assert!(records[0].avg_fps > 0.0);
    }
}
