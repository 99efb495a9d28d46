use crate::{
    config::UploadConfig,
    error::Result,
    events::{EventBus, FramepulseEvent},
    queue::TelemetryQueue,
    session::SessionStats,
    stats::round1,
    wal::TelemetryRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How many recent upload timestamps are retained for display
const LAST_UPLOADS_KEPT: usize = 10;

/// External collaborator supplying the bearer token for uploads.
///
/// Queried again on every attempt; tokens rotate and a stale one must not
/// be pinned for the lifetime of the worker.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Reads the pairing token from a file on every query.
///
/// The pairing flow writes this file out of band; until it exists the
/// device is unpaired and uploads are skipped.
pub struct FileCredentials {
    path: std::path::PathBuf,
}

impl FileCredentials {
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl CredentialProvider for FileCredentials {
    fn bearer_token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                if token.is_empty() {
                    None
                } else {
                    Some(token.to_string())
                }
            }
            Err(_) => None,
        }
    }
}

/// Hardware and settings context attached to every outbound payload
#[derive(Debug, Clone)]
pub struct MachineContext {
    pub cpu_name: String,
    pub gpu_name: String,
    pub cpu_id: String,
    pub gpu_id: String,
    pub resolution: String,
    pub setting: String,
}

impl Default for MachineContext {
    fn default() -> Self {
        Self {
            cpu_name: "Unknown CPU".to_string(),
            gpu_name: "Unknown GPU".to_string(),
            cpu_id: "unknown-cpu".to_string(),
            gpu_id: "unknown-gpu".to_string(),
            resolution: "1920x1080".to_string(),
            setting: "Performance".to_string(),
        }
    }
}

/// Session-summary payload shipped by the batch worker
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummaryPayload {
    pub cpu: String,
    pub gpu: String,
    pub cpu_id: String,
    pub gpu_id: String,
    pub game: String,
    pub setting: String,
    pub resolution: String,
    pub avg_fps: f64,
    pub lows: f64,
    pub duration: i64,
}

/// Direct session report shipped by the best-effort path
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionReportPayload {
    pub device_token: String,
    pub cpu_id: String,
    pub gpu_id: String,
    pub cpu_name: String,
    pub gpu_name: String,
    pub game: String,
    pub setting: String,
    pub avg_fps: f64,
    pub lows: f64,
    pub resolution: String,
    pub duration: u64,
}

/// Classified result of one POST to the upload endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// 2xx
    Accepted,
    /// 429, retried with the longer attempt-scaled backoff
    RateLimited,
    /// Any other status code
    Rejected(u16),
}

/// Seam between the worker and the wire, mockable in tests
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn post(
        &self,
        body: serde_json::Value,
        bearer_token: Option<&str>,
    ) -> Result<UploadStatus>;
}

/// reqwest-backed transport used in production
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: String, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            url,
        }
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn post(
        &self,
        body: serde_json::Value,
        bearer_token: Option<&str>,
    ) -> Result<UploadStatus> {
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(UploadStatus::Accepted)
        } else if status.as_u16() == 429 {
            Ok(UploadStatus::RateLimited)
        } else {
            debug!(
                "Upload rejected with status {}: {}",
                status.as_u16(),
                response.text().await.unwrap_or_default()
            );
            Ok(UploadStatus::Rejected(status.as_u16()))
        }
    }
}

/// Backoff before the next attempt (zero-based `attempt`).
///
/// Rate limiting sleeps 5 s, 10 s, 15 s...; everything else doubles from
/// 1 s. Both get 0-500 ms of jitter so restarting clients don't stampede.
fn backoff_delay(attempt: u32, rate_limited: bool) -> Duration {
    let base = if rate_limited {
        Duration::from_secs(5 * (attempt as u64 + 1))
    } else {
        Duration::from_secs(1 << attempt.min(20))
    };
    base + Duration::from_millis(rand::rng().random_range(0..=500))
}

/// Outcome of a best-effort session upload
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// Delivered; carries the statistics that were reported
    Completed {
        avg_fps: f64,
        one_percent_low: f64,
    },
    /// Nothing was recorded; no HTTP call was made
    NoData,
    /// The attempt did not succeed
    Failed { reason: String },
}

/// Best-effort direct upload path for a finished session.
///
/// One POST, no retry; the caller resets its session state regardless of
/// the outcome. The durable queue path carries the stronger guarantee.
pub struct SessionUploader {
    transport: Arc<dyn UploadTransport>,
    credentials: Arc<dyn CredentialProvider>,
}

impl SessionUploader {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    pub async fn upload(
        &self,
        context: &MachineContext,
        game: &str,
        stats: SessionStats,
        duration_seconds: u64,
    ) -> UploadOutcome {
        if !stats.has_data() {
            return UploadOutcome::NoData;
        }

        let Some(token) = self.credentials.bearer_token() else {
            return UploadOutcome::Failed {
                reason: "Not paired: missing device token".to_string(),
            };
        };

        let payload = SessionReportPayload {
            device_token: token.clone(),
            cpu_id: context.cpu_id.clone(),
            gpu_id: context.gpu_id.clone(),
            cpu_name: context.cpu_name.clone(),
            gpu_name: context.gpu_name.clone(),
            game: game.to_string(),
            setting: context.setting.clone(),
            avg_fps: stats.avg_fps,
            lows: stats.one_percent_low,
            resolution: context.resolution.clone(),
            duration: duration_seconds,
        };

        let body = match serde_json::to_value(&payload) {
            Ok(body) => body,
            Err(e) => {
                return UploadOutcome::Failed {
                    reason: format!("Payload serialization failed: {}", e),
                }
            }
        };

        info!(
            "Uploading session report: game={} avgFps={:.1} lows={:.1} duration={}s",
            game, stats.avg_fps, stats.one_percent_low, duration_seconds
        );

        match self.transport.post(body, Some(&token)).await {
            Ok(UploadStatus::Accepted) => UploadOutcome::Completed {
                avg_fps: stats.avg_fps,
                one_percent_low: stats.one_percent_low,
            },
            Ok(UploadStatus::RateLimited) => UploadOutcome::Failed {
                reason: "Upload failed: rate limited".to_string(),
            },
            Ok(UploadStatus::Rejected(code)) => UploadOutcome::Failed {
                reason: format!("Upload failed: HTTP {}", code),
            },
            Err(e) => UploadOutcome::Failed {
                reason: format!("Upload error: {}", e),
            },
        }
    }
}

struct WorkerState {
    config: UploadConfig,
    queue: Arc<TelemetryQueue>,
    transport: Arc<dyn UploadTransport>,
    credentials: Arc<dyn CredentialProvider>,
    context: MachineContext,
    event_bus: EventBus,
    last_uploads: Mutex<Vec<DateTime<Utc>>>,
}

/// Handle to the background upload worker
pub struct UploadWorker {
    state: Arc<WorkerState>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl UploadWorker {
    /// Spawn the worker over an already-restored queue
    pub fn spawn(
        config: UploadConfig,
        queue: Arc<TelemetryQueue>,
        transport: Arc<dyn UploadTransport>,
        credentials: Arc<dyn CredentialProvider>,
        context: MachineContext,
        event_bus: EventBus,
        parent: &CancellationToken,
    ) -> Self {
        let state = Arc::new(WorkerState {
            config,
            queue,
            transport,
            credentials,
            context,
            event_bus,
            last_uploads: Mutex::new(Vec::new()),
        });

        let token = parent.child_token();
        let loop_state = Arc::clone(&state);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            worker_loop(loop_state, loop_token).await;
        });

        Self {
            state,
            token,
            handle,
        }
    }

    /// Timestamps of the most recent successful uploads, newest first
    pub fn last_uploads(&self) -> Vec<DateTime<Utc>> {
        self.state.last_uploads.lock().clone()
    }

    /// Cancel the worker and wait briefly for it to exit.
    ///
    /// In-flight HTTP calls are abandoned; after 2 s the task is left to
    /// the runtime rather than blocking shutdown.
    pub async fn shutdown(self) {
        self.token.cancel();
        match tokio::time::timeout(Duration::from_secs(2), self.handle).await {
            Ok(Ok(())) => info!("Upload worker stopped"),
            Ok(Err(e)) => warn!("Upload worker task error on shutdown: {}", e),
            Err(_) => warn!("Upload worker did not stop within 2s, abandoning"),
        }
    }
}

async fn worker_loop(state: Arc<WorkerState>, token: CancellationToken) {
    info!(
        "Upload worker started (batch={} flush={}s attempts={})",
        state.config.max_batch_size,
        state.config.flush_interval_secs,
        state.config.max_attempts
    );

    let flush_interval = Duration::from_secs(state.config.flush_interval_secs);

    while !token.is_cancelled() {
        let mut batch: Vec<TelemetryRecord> = Vec::new();
        let deadline = tokio::time::Instant::now() + flush_interval;

        'collect: while batch.len() < state.config.max_batch_size {
            while let Some(record) = state.queue.pop() {
                batch.push(record);
                if batch.len() >= state.config.max_batch_size {
                    break 'collect;
                }
            }

            if state.queue.take_flush_request() {
                debug!("Flush requested, closing batch of {}", batch.len());
                break 'collect;
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => break 'collect,
                _ = state.queue.wait_for_activity() => {}
            }
        }

        if batch.is_empty() {
            continue;
        }

        debug!("Processing batch of {} records", batch.len());
        process_batch(&state, &token, batch).await;
    }
}

/// Aggregate a batch into one summary payload and deliver it with retries
async fn process_batch(state: &WorkerState, token: &CancellationToken, batch: Vec<TelemetryRecord>) {
    let count = batch.len();
    let payload = aggregate_batch(&state.context, &batch);

    let body = match serde_json::to_value(&payload) {
        Ok(body) => body,
        Err(e) => {
            error!("Batch payload serialization failed, dropping batch: {}", e);
            return;
        }
    };

    let mut attempt = 0;
    while attempt < state.config.max_attempts && !token.is_cancelled() {
        // Token may have rotated since the previous attempt
        let bearer = state.credentials.bearer_token();

        let outcome = state.transport.post(body.clone(), bearer.as_deref()).await;

        let rate_limited = match outcome {
            Ok(UploadStatus::Accepted) => {
                if let Err(e) = state.queue.mark_delivered(count).await {
                    warn!("Failed to trim WAL after delivery: {}", e);
                }

                let now = Utc::now();
                {
                    let mut last = state.last_uploads.lock();
                    last.insert(0, now);
                    last.truncate(LAST_UPLOADS_KEPT);
                }

                state
                    .event_bus
                    .publish_lossy(FramepulseEvent::UploadCompleted {
                        timestamp: SystemTime::now(),
                        record_count: count,
                        avg_fps: payload.avg_fps,
                        one_percent_low: payload.lows,
                    });
                info!("Batch upload successful ({} records)", count);
                return;
            }
            Ok(UploadStatus::RateLimited) => {
                warn!("Upload rate limited on attempt {}", attempt + 1);
                true
            }
            Ok(UploadStatus::Rejected(code)) => {
                warn!("Upload rejected with HTTP {} on attempt {}", code, attempt + 1);
                false
            }
            Err(e) => {
                warn!("Upload transport error on attempt {}: {}", attempt + 1, e);
                false
            }
        };

        let delay = backoff_delay(attempt, rate_limited);
        debug!("Backing off {:?} before next attempt", delay);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }

    // Attempts exhausted: the records stay in the WAL for a later replay,
    // but are not re-queued in memory within this run
    state.event_bus.publish_lossy(FramepulseEvent::UploadFailed {
        reason: format!("Batch upload failed after {} attempts", attempt),
    });
    error!("Batch upload failed after {} attempts, WAL retained", attempt);
}

/// Mean-aggregate a batch into a single session summary
fn aggregate_batch(context: &MachineContext, batch: &[TelemetryRecord]) -> BatchSummaryPayload {
    let game = batch
        .iter()
        .find_map(|r| r.game.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    let avg_fps = round1(batch.iter().map(|r| r.avg_fps).sum::<f64>() / batch.len() as f64);
    let lows = round1(batch.iter().map(|r| r.one_percent_low).sum::<f64>() / batch.len() as f64);

    let duration = batch
        .last()
        .zip(batch.first())
        .map(|(last, first)| (last.timestamp - first.timestamp).num_seconds().max(0))
        .unwrap_or(0);

    BatchSummaryPayload {
        cpu: context.cpu_name.clone(),
        gpu: context.gpu_name.clone(),
        cpu_id: context.cpu_id.clone(),
        gpu_id: context.gpu_id.clone(),
        game,
        setting: context.setting.clone(),
        resolution: context.resolution.clone(),
        avg_fps,
        lows,
        duration,
    }
}
