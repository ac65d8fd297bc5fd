use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LocationSample;

/// A contiguous, application-bounded slice of a session with its own
/// sensor and location snapshot. `order_index` is contiguous from 0 in
/// finalization order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningRecordItem {
    pub id: String,
    /// Distance covered during this segment only, in meters.
    pub distance_m: f64,
    pub cadence: Option<u32>,
    pub heart_rate: Option<u32>,
    pub calories: f64,
    pub order_index: u32,
    pub duration_secs: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub locations: Vec<LocationSample>,
    pub is_uploaded: bool,
}
