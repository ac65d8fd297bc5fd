//! Run-session tracking core.
//!
//! Fuses noisy, intermittent sensor signals (satellite-positioning speed,
//! step/cadence counts) into a stable live pace estimate and manages the
//! lifecycle of a recording session (start, pause, resume, end) with
//! durable, offline-tolerant persistence of the result.
//!
//! The surrounding application (screens, rendering, social features) stays
//! outside this crate; it talks to the [`session::SessionController`]
//! through the capability traits in [`collaborators`].

pub mod collaborators;
pub mod models;
pub mod offline;
pub mod pace;
pub mod segments;
pub mod session;
pub mod utils;

pub use collaborators::{
    BackgroundTasks, FinalizedSession, LocationTracker, Outcome, PermissionGate,
    PermissionStatus, RecordApi, SessionStats, StepTracker, StepUpdate, TrackingResult,
};
pub use models::{LocationSample, RunStatus, RunningRecord, RunningRecordItem};
pub use offline::{OfflineQueue, OfflineStore, PendingUpload, QueuedUpload};
pub use pace::{fuse, PaceFusionConfig, PaceFusionInput, PaceFusionState};
pub use segments::{SegmentRecorder, SegmentSnapshot};
pub use session::{Collaborators, SessionConfig, SessionController};
