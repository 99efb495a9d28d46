pub mod config;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod stats;
pub mod ingest;
pub mod activity;
pub mod session;
pub mod wal;
pub mod queue;
pub mod upload;
pub mod coordinator;

pub use config::{
    ActivityConfig, FramepulseConfig, IngestConfig, QueueConfig, SessionConfig, SystemConfig,
    UploadConfig,
};
pub use error::{FramepulseError, Result};
pub use events::{EventBus, FramepulseEvent};
pub use scheduler::{spawn_periodic, PeriodicTask};
pub use stats::{round1, RollingStatsBuffer};
pub use ingest::{FrametimeIngestor, LiveFps};
pub use activity::{
    ActivityGate, ActivityGatePoller, ActivitySource, ActivityState, ControllerState,
    GAMEPLAY_KEYS, MAX_CONTROLLERS,
};
pub use session::{SessionAccumulator, SessionStats};
pub use wal::{TelemetryRecord, TelemetryWal};
pub use queue::TelemetryQueue;
pub use upload::{
    BatchSummaryPayload, CredentialProvider, FileCredentials, HttpTransport, MachineContext,
    SessionReportPayload, SessionUploader, UploadOutcome, UploadStatus, UploadTransport,
    UploadWorker,
};
pub use coordinator::UploadCoordinator;
