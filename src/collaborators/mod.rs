//! Capability seams around the platform: positioning, step counting,
//! permissions, background keep-alive, and the network record API. The
//! lifecycle receives these as injected objects so sessions (and tests)
//! never share implicit process-wide state.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{LocationSample, RunningRecord, RunningRecordItem};

/// Result of a permission check. A shortfall disables the affected sensors
/// but never blocks a session from starting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionStatus {
    pub has_all_permissions: bool,
    pub location: bool,
    pub location_background: bool,
    pub motion: bool,
}

impl PermissionStatus {
    pub fn granted() -> Self {
        Self {
            has_all_permissions: true,
            location: true,
            location_background: true,
            motion: true,
        }
    }
}

/// Authoritative result of stopping location tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingResult {
    pub distance_m: f64,
    pub locations: Vec<LocationSample>,
}

/// One step-counter callback payload.
#[derive(Debug, Clone, Copy)]
pub struct StepUpdate {
    pub steps: u32,
    pub cadence: Option<u32>,
}

/// In-progress stats pushed to the record API on end and on periodic updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub distance_m: f64,
    pub duration_secs: u64,
    pub cadence: Option<u32>,
    pub heart_rate: Option<u32>,
    pub calories: f64,
}

/// Server response to ending a session, including any computed reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedSession {
    pub id: String,
    pub distance_m: f64,
    pub cadence: Option<u32>,
    pub heart_rate: Option<u32>,
    pub calories: f64,
    pub duration_secs: u64,
    pub reward_points: Option<u32>,
}

/// How a subsystem call went, interpreted uniformly by the lifecycle:
/// `Degraded` nulls the affected data and continues, `Failed` triggers the
/// subsystem's fallback (queue, log-and-drop, or propagate).
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Degraded { reason: String },
    Failed { error: anyhow::Error },
}

impl<T> Outcome<T> {
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(error) => Outcome::Failed { error },
        }
    }
}

/// Network persistence for sessions and their segments.
#[async_trait]
pub trait RecordApi: Send + Sync {
    /// Creates a session resource and returns its server-issued id.
    async fn start_session(&self, started_at_epoch_s: i64, timezone: &str) -> Result<String>;

    async fn end_session(&self, session_id: &str, stats: &SessionStats)
        -> Result<FinalizedSession>;

    async fn update_session(&self, session_id: &str, stats: &SessionStats) -> Result<()>;

    /// Uploads all segments of a session in one batch.
    async fn save_segments(&self, session_id: &str, items: &[RunningRecordItem]) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<RunningRecord>>;

    async fn get_session(&self, session_id: &str) -> Result<RunningRecord>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;
}

/// Satellite positioning stream keyed to a session id.
#[async_trait]
pub trait LocationTracker: Send + Sync {
    async fn start_tracking(&self, session_id: &str) -> Result<()>;

    /// Stops tracking and returns the authoritative final distance and the
    /// full trace.
    async fn stop_tracking(&self) -> Result<TrackingResult>;

    fn pause_tracking(&self);

    fn resume_tracking(&self);
}

pub type StepCallback = Box<dyn Fn(StepUpdate) + Send + Sync>;

/// Step/cadence counter. Starting it is best-effort; a failure only degrades
/// cadence data to unavailable.
#[async_trait]
pub trait StepTracker: Send + Sync {
    async fn start_tracking(&self, callback: StepCallback) -> Result<()>;

    async fn stop_tracking(&self) -> Result<()>;

    fn current_steps(&self) -> u32;

    fn current_cadence(&self) -> Option<u32>;
}

pub trait PermissionGate: Send + Sync {
    fn check_required_permissions(&self) -> PermissionStatus;
}

/// Background keep-alive teardown, always invoked during end/failure cleanup.
#[async_trait]
pub trait BackgroundTasks: Send + Sync {
    async fn stop_background_tracking(&self) -> Result<()>;

    async fn clear_background_data(&self) -> Result<()>;
}
