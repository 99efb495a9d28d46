use crate::error::{FramepulseError, Result};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events raised by the telemetry pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FramepulseEvent {
    /// The tracked game entered or left the foreground
    RecordingStatusChanged {
        recording: bool,
        timestamp: SystemTime,
    },
    /// The computed user-activity state flipped
    ActivityStatusChanged {
        active: bool,
        timestamp: SystemTime,
    },
    /// Sustained inactivity crossed the debounce threshold
    InactivityUploadTriggered { timestamp: SystemTime },
    /// Smoothed live metrics were recomputed
    LiveMetricsUpdated {
        fps: f64,
        frametime_ms: f64,
        one_percent_low: f64,
        status: String,
    },
    /// The session duration counter ticked or was reset
    SessionSecondsChanged { seconds: u64 },
    /// A queued batch upload was delivered
    UploadCompleted {
        timestamp: SystemTime,
        record_count: usize,
        avg_fps: f64,
        one_percent_low: f64,
    },
    /// A direct best-effort session report was delivered
    SessionUploadCompleted {
        timestamp: SystemTime,
        sample_count: usize,
        avg_fps: f64,
        one_percent_low: f64,
    },
    /// An upload exhausted its attempts or was rejected
    UploadFailed { reason: String },
    /// System shutdown requested
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl FramepulseEvent {
    /// Get the timestamp of the event
    pub fn timestamp(&self) -> SystemTime {
        match self {
            FramepulseEvent::RecordingStatusChanged { timestamp, .. } => *timestamp,
            FramepulseEvent::ActivityStatusChanged { timestamp, .. } => *timestamp,
            FramepulseEvent::InactivityUploadTriggered { timestamp } => *timestamp,
            FramepulseEvent::LiveMetricsUpdated { .. } => SystemTime::now(),
            FramepulseEvent::SessionSecondsChanged { .. } => SystemTime::now(),
            FramepulseEvent::UploadCompleted { timestamp, .. } => *timestamp,
            FramepulseEvent::SessionUploadCompleted { timestamp, .. } => *timestamp,
            FramepulseEvent::UploadFailed { .. } => SystemTime::now(),
            FramepulseEvent::ShutdownRequested { timestamp, .. } => *timestamp,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            FramepulseEvent::RecordingStatusChanged { recording, .. } => {
                format!(
                    "Game {}",
                    if *recording {
                        "entered foreground"
                    } else {
                        "left foreground"
                    }
                )
            }
            FramepulseEvent::ActivityStatusChanged { active, .. } => {
                format!("User {}", if *active { "active" } else { "inactive" })
            }
            FramepulseEvent::InactivityUploadTriggered { .. } => {
                "Inactivity upload triggered".to_string()
            }
            FramepulseEvent::LiveMetricsUpdated {
                fps,
                one_percent_low,
                ..
            } => {
                format!("Live metrics: {:.1} fps ({:.1} 1% low)", fps, one_percent_low)
            }
            FramepulseEvent::SessionSecondsChanged { seconds } => {
                format!("Session at {} seconds", seconds)
            }
            FramepulseEvent::UploadCompleted { record_count, .. } => {
                format!("Upload completed ({} records)", record_count)
            }
            FramepulseEvent::SessionUploadCompleted { sample_count, .. } => {
                format!("Session upload completed ({} samples)", sample_count)
            }
            FramepulseEvent::UploadFailed { reason } => {
                format!("Upload failed: {}", reason)
            }
            FramepulseEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            FramepulseEvent::RecordingStatusChanged { .. } => "recording_status_changed",
            FramepulseEvent::ActivityStatusChanged { .. } => "activity_status_changed",
            FramepulseEvent::InactivityUploadTriggered { .. } => "inactivity_upload_triggered",
            FramepulseEvent::LiveMetricsUpdated { .. } => "live_metrics_updated",
            FramepulseEvent::SessionSecondsChanged { .. } => "session_seconds_changed",
            FramepulseEvent::UploadCompleted { .. } => "upload_completed",
            FramepulseEvent::SessionUploadCompleted { .. } => "session_upload_completed",
            FramepulseEvent::UploadFailed { .. } => "upload_failed",
            FramepulseEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Async event bus for component coordination using broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<FramepulseEvent>,
    debug_logging: bool,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: false,
        }
    }

    /// Create a new event bus with debug logging enabled
    pub fn with_debug_logging(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: true,
        }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<FramepulseEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: FramepulseEvent) -> Result<usize> {
        if self.debug_logging {
            debug!("Publishing event: {}", event.description());
        }

        // Log important events at appropriate levels
        match &event {
            FramepulseEvent::RecordingStatusChanged { recording, .. } => {
                if *recording {
                    info!("Game entered foreground, recording");
                } else {
                    info!("Game left foreground, recording paused");
                }
            }
            FramepulseEvent::InactivityUploadTriggered { .. } => {
                info!("Sustained inactivity, upload triggered");
            }
            FramepulseEvent::UploadCompleted { record_count, .. } => {
                info!("Upload completed ({} records)", record_count);
            }
            FramepulseEvent::SessionUploadCompleted { sample_count, .. } => {
                info!("Session upload completed ({} samples)", sample_count);
            }
            FramepulseEvent::UploadFailed { reason } => {
                error!("Upload failed: {}", reason);
            }
            FramepulseEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
            _ => {
                if self.debug_logging {
                    debug!("Event: {}", event.description());
                }
            }
        }

        self.sender.send(event).map_err(|e| {
            FramepulseError::component("event_bus", format!("Publish failed: {}", e))
        })
    }

    /// Publish without surfacing a missing-subscriber error.
    ///
    /// Emitting telemetry events must never fail the hot path, so callers
    /// that don't care whether anyone is listening use this variant.
    pub fn publish_lossy(&self, event: FramepulseEvent) {
        if self.sender.receiver_count() == 0 {
            if self.debug_logging {
                debug!("Dropping event without subscribers: {}", event.event_type());
            }
            return;
        }
        if let Err(e) = self.publish(event) {
            warn!("Event publish failed: {}", e);
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            debug_logging: self.debug_logging,
        }
    }
}
