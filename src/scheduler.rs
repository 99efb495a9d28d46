use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to a running periodic task.
///
/// The telemetry core never drives polling off a UI timer; anything that
/// needs a fixed cadence (the activity poller, the session-seconds counter)
/// runs as one of these.
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Request cancellation without waiting for the task to finish
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for the task to exit
    pub async fn stop(self) {
        self.token.cancel();
        if self.handle.await.is_err() {
            debug!("Periodic task '{}' aborted", self.name);
        }
        debug!("Periodic task '{}' stopped", self.name);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Spawn a cancellable task that invokes `tick` on a fixed cadence.
///
/// The first tick fires after one full interval, not immediately. The task
/// exits promptly when the returned handle (or `parent` token) is cancelled.
pub fn spawn_periodic<F>(
    name: &'static str,
    interval: Duration,
    parent: &CancellationToken,
    mut tick: F,
) -> PeriodicTask
where
    F: FnMut() + Send + 'static,
{
    let token = parent.child_token();
    let task_token = token.clone();

    let handle = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        // Skip the immediate first fire of tokio's interval
        timer.tick().await;
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = task_token.cancelled() => {
                    debug!("Periodic task '{}' cancelled", name);
                    break;
                }
                _ = timer.tick() => {
                    tick();
                }
            }
        }
    });

    debug!("Spawned periodic task '{}' every {:?}", name, interval);

    PeriodicTask {
        name,
        token,
        handle,
    }
}
