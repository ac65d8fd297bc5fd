use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{LocationSample, RunningRecordItem};

/// Running totals at the moment a segment boundary fires; the recorder
/// derives per-segment deltas from consecutive snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentSnapshot {
    pub distance_m: f64,
    pub calories: f64,
    pub cadence: Option<u32>,
    pub heart_rate: Option<u32>,
}

#[derive(Debug)]
struct OpenSegment {
    started_at: DateTime<Utc>,
    start_distance_m: f64,
    start_calories: f64,
    locations: Vec<LocationSample>,
}

/// Ordered, append-only sequence of finalized segments for the active
/// session. Boundary triggers arrive from the application layer; each
/// finalized segment snapshots its own distance delta, duration, location
/// sub-trace, and sensor readings.
#[derive(Debug, Default)]
pub struct SegmentRecorder {
    segments: Vec<RunningRecordItem>,
    current: Option<OpenSegment>,
}

impl SegmentRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears any previous session's segments and opens the first segment.
    pub fn initialize_segment_tracking(&mut self, now: DateTime<Utc>) {
        self.segments.clear();
        self.current = Some(OpenSegment {
            started_at: now,
            start_distance_m: 0.0,
            start_calories: 0.0,
            locations: Vec::new(),
        });
    }

    /// Appends the sample to the in-progress segment's sub-trace.
    pub fn push_location(&mut self, sample: LocationSample) {
        if let Some(current) = &mut self.current {
            current.locations.push(sample);
        }
    }

    /// Closes the in-progress segment against the given running totals and
    /// opens the next one. No-op when tracking was never initialized.
    pub fn finalize_current_segment(&mut self, now: DateTime<Utc>, totals: SegmentSnapshot) {
        let Some(current) = self.current.take() else {
            return;
        };

        let duration = now.signed_duration_since(current.started_at);
        let item = RunningRecordItem {
            id: Uuid::new_v4().to_string(),
            distance_m: (totals.distance_m - current.start_distance_m).max(0.0),
            cadence: totals.cadence,
            heart_rate: totals.heart_rate,
            calories: (totals.calories - current.start_calories).max(0.0),
            order_index: self.segments.len() as u32,
            duration_secs: duration.num_seconds().max(0) as u64,
            started_at: current.started_at,
            ended_at: now,
            locations: current.locations,
            is_uploaded: false,
        };
        self.segments.push(item);

        self.current = Some(OpenSegment {
            started_at: now,
            start_distance_m: totals.distance_m,
            start_calories: totals.calories,
            locations: Vec::new(),
        });
    }

    pub fn segments(&self) -> &[RunningRecordItem] {
        &self.segments
    }

    pub fn reset_segments(&mut self) {
        self.segments.clear();
        self.current = None;
    }

    /// Flags every finalized segment as delivered to the server.
    pub fn mark_uploaded(&mut self) {
        for segment in &mut self.segments {
            segment.is_uploaded = true;
        }
    }
}
