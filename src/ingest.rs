use crate::{
    config::IngestConfig,
    stats::{round1, RollingStatsBuffer},
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A smoothed live FPS reading emitted at ~1 Hz
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveFps {
    /// FPS derived from the mean frametime of the sliding window
    pub fps: f64,
    /// 1% low of the recently emitted FPS values
    pub one_percent_low: f64,
}

struct IngestorShared {
    /// Sliding window of (frametime ms, arrival time) pairs
    window: Mutex<VecDeque<(f64, Instant)>>,
    /// Recent raw frametimes retained for graphing
    frametime_history: Mutex<RollingStatsBuffer>,
    /// Recent emitted FPS values, source of the live 1% low
    fps_history: Mutex<RollingStatsBuffer>,
}

/// Consumes a raw frametime stream and emits smoothed FPS readings.
///
/// Raw samples arrive at capture cadence (possibly hundreds of Hz); the
/// ingestor keeps a short sliding time window, discards implausible values,
/// and at most once per emit interval converts the window mean into an FPS
/// reading for subscribers. If the capture source goes away the stream
/// simply ends: no error is raised, subscribers see no further readings.
pub struct FrametimeIngestor {
    shared: Arc<IngestorShared>,
    fps_tx: broadcast::Sender<LiveFps>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl FrametimeIngestor {
    /// Spawn the ingestion task over a raw frametime sample stream
    pub fn spawn(
        config: IngestConfig,
        mut samples: mpsc::Receiver<f64>,
        parent: &CancellationToken,
    ) -> Self {
        let shared = Arc::new(IngestorShared {
            window: Mutex::new(VecDeque::with_capacity(256)),
            frametime_history: Mutex::new(RollingStatsBuffer::new(config.history_capacity)),
            fps_history: Mutex::new(RollingStatsBuffer::new(config.history_capacity)),
        });

        let (fps_tx, _) = broadcast::channel(16);
        let token = parent.child_token();

        let task_shared = Arc::clone(&shared);
        let task_tx = fps_tx.clone();
        let task_token = token.clone();
        let window_horizon = Duration::from_secs(config.window_seconds);
        let emit_interval = Duration::from_millis(config.emit_interval_ms);
        let max_frametime = config.max_frametime_ms;

        let task = tokio::spawn(async move {
            let mut last_emit: Option<Instant> = None;

            loop {
                let sample = tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!("Frametime ingestor cancelled");
                        break;
                    }
                    sample = samples.recv() => match sample {
                        Some(sample) => sample,
                        None => {
                            // Capture source gone; absence of readings is the signal
                            debug!("Frametime sample stream closed, ingestion stopped");
                            break;
                        }
                    },
                };

                // Stalls and clock skew produce values no real frame has;
                // the plausible range is exclusive on both ends
                if sample <= 0.0 || sample >= max_frametime {
                    trace!("Discarding implausible frametime {:.2} ms", sample);
                    continue;
                }

                let now = Instant::now();

                let window_mean = {
                    let mut window = task_shared.window.lock();
                    window.push_back((sample, now));
                    while let Some(&(_, arrived)) = window.front() {
                        if now.duration_since(arrived) > window_horizon {
                            window.pop_front();
                        } else {
                            break;
                        }
                    }
                    window.iter().map(|(v, _)| v).sum::<f64>() / window.len() as f64
                };

                task_shared.frametime_history.lock().add(sample);

                let due = match last_emit {
                    Some(at) => now.duration_since(at) >= emit_interval,
                    None => true,
                };
                if !due {
                    continue;
                }
                last_emit = Some(now);

                let fps = if window_mean > 0.0 {
                    1000.0 / window_mean
                } else {
                    0.0
                };
                if fps <= 0.0 {
                    continue;
                }

                let one_percent_low = {
                    let mut history = task_shared.fps_history.lock();
                    history.add(fps);
                    history.one_percent_low()
                };

                let reading = LiveFps {
                    fps: round1(fps),
                    one_percent_low,
                };
                trace!("Emitting live FPS {:.1}", reading.fps);
                if task_tx.send(reading).is_err() {
                    // No subscribers right now; keep ingesting regardless
                    trace!("No live FPS subscribers");
                }
            }
        });

        Self {
            shared,
            fps_tx,
            token,
            task,
        }
    }

    /// Subscribe to smoothed FPS readings
    pub fn subscribe(&self) -> broadcast::Receiver<LiveFps> {
        self.fps_tx.subscribe()
    }

    /// Recent raw frametimes in arrival order, for graphing
    pub fn frametime_history(&self) -> Vec<f64> {
        self.shared.frametime_history.lock().snapshot()
    }

    /// Number of samples currently inside the sliding window
    pub fn window_len(&self) -> usize {
        self.shared.window.lock().len()
    }

    /// Stop ingestion and wait for the task to exit
    pub async fn stop(self) {
        self.token.cancel();
        if self.task.await.is_err() {
            warn!("Frametime ingestor task aborted");
        }
    }
}
