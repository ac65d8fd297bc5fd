use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single positioning fix as delivered by the location collaborator.
/// Consumed read-only by pace fusion and the segment recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    /// Instantaneous ground speed in meters per second.
    pub speed_mps: f64,
    pub altitude_m: f64,
    /// Horizontal accuracy radius in meters; larger is worse.
    pub accuracy_m: f64,
}

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two samples in meters.
pub fn haversine_distance_m(a: &LocationSample, b: &LocationSample) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}
