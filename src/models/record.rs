use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Stopped,
    Running,
    Paused,
    Finished,
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Stopped
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Stopped => "Stopped",
            RunStatus::Running => "Running",
            RunStatus::Paused => "Paused",
            RunStatus::Finished => "Finished",
        }
    }
}

/// A recording session. Owned exclusively by the lifecycle while active and
/// handed to the caller once finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningRecord {
    pub id: String,
    pub distance_m: f64,
    pub steps: u32,
    pub cadence: Option<u32>,
    pub heart_rate: Option<u32>,
    pub calories: f64,
    pub duration_secs: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reward_points: Option<u32>,
}

impl RunningRecord {
    pub fn new(id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            distance_m: 0.0,
            steps: 0,
            cadence: None,
            heart_rate: None,
            calories: 0.0,
            duration_secs: 0,
            started_at,
            ended_at: None,
            reward_points: None,
        }
    }
}
