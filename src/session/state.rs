use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collaborators::StepUpdate;
use crate::models::location::haversine_distance_m;
use crate::models::{LocationSample, RunStatus, RunningRecord};
use crate::pace::PaceFusionState;

/// Rough energy cost of running, independent of runner profile.
pub(crate) const KCAL_PER_METER: f64 = 0.06;

/// Trailing span over which the window speed is computed.
const SPEED_WINDOW_SECS: i64 = 10;

/// Fixes with a worse accuracy radius than this are excluded from distance
/// integration; they still reach the segment sub-trace.
const DISTANCE_ACCURACY_CUTOFF_M: f64 = 50.0;

/// Shared live statistics updated by the concurrent sensor producers. All
/// merges are idempotent so re-invoked or out-of-order callbacks cannot
/// corrupt the totals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStats {
    pub distance_m: f64,
    pub steps: u32,
    pub cadence: Option<u32>,
    pub heart_rate: Option<u32>,
    pub calories: f64,
    pub pace_secs: u32,
}

impl LiveStats {
    pub fn merge_steps(&mut self, update: StepUpdate) {
        self.steps = self.steps.max(update.steps);
        if update.cadence.is_some() {
            self.cadence = update.cadence;
        }
    }

    /// Raises the distance total to `total_m` if it is ahead of what we have.
    /// Distance never decreases for the life of a session.
    pub fn merge_distance(&mut self, total_m: f64) {
        if total_m.is_finite() && total_m > self.distance_m {
            self.distance_m = total_m;
            self.calories = total_m * KCAL_PER_METER;
        }
    }
}

/// The single mutable session context, exclusively owned by one lifecycle
/// instance and mutated only through its methods.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub status: RunStatus,
    pub record: Option<RunningRecord>,
    pub stats: LiveStats,
    pub fusion: PaceFusionState,
    started_anchor: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
    ending: bool,
    last_location: Option<LocationSample>,
    /// (timestamp, cumulative distance) pairs inside the trailing window.
    window: VecDeque<(DateTime<Utc>, f64)>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_session(&mut self, record: RunningRecord, now: Instant) {
        *self = Self {
            status: RunStatus::Running,
            record: Some(record),
            started_anchor: Some(now),
            ..Self::default()
        };
    }

    /// Records the pause instant. Idempotent: a duplicate `pause()` keeps the
    /// original instant so the accumulated total stays correct.
    pub fn mark_paused(&mut self, now: Instant) -> bool {
        if self.status != RunStatus::Running {
            return false;
        }
        self.status = RunStatus::Paused;
        self.paused_at = Some(now);
        true
    }

    /// Accumulates the elapsed pause gap. A spurious `resume()` without a
    /// prior `pause()` is a no-op.
    pub fn mark_resumed(&mut self, now: Instant) -> Option<Duration> {
        if self.status != RunStatus::Paused {
            return None;
        }
        let gap = self
            .paused_at
            .take()
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::ZERO);
        self.paused_total += gap;
        self.status = RunStatus::Running;
        Some(gap)
    }

    /// Claims the session for teardown. Returns false when there is no
    /// active session or another teardown is already in flight, so
    /// concurrent `end` calls cannot double-persist.
    pub fn try_begin_end(&mut self) -> bool {
        if self.ending || !matches!(self.status, RunStatus::Running | RunStatus::Paused) {
            return false;
        }
        self.ending = true;
        true
    }

    /// Releases the teardown claim so a failed `end` can be retried.
    pub fn abort_end(&mut self) {
        self.ending = false;
    }

    pub fn paused_total(&self) -> Duration {
        self.paused_total
    }

    /// Wall-clock time spent running, excluding accumulated pauses and any
    /// still-open pause.
    pub fn active_duration(&self, now: Instant) -> Duration {
        let Some(anchor) = self.started_anchor else {
            return Duration::ZERO;
        };
        let mut paused = self.paused_total;
        if let Some(at) = self.paused_at {
            paused += now.saturating_duration_since(at);
        }
        now.saturating_duration_since(anchor).saturating_sub(paused)
    }

    pub fn last_location(&self) -> Option<&LocationSample> {
        self.last_location.as_ref()
    }

    /// Integrates a location fix into the live distance. Returns false for
    /// samples that are replayed or out of order; re-delivered callbacks are
    /// therefore idempotent.
    pub fn merge_location(&mut self, sample: &LocationSample) -> bool {
        if !sample.latitude.is_finite() || !sample.longitude.is_finite() {
            return false;
        }

        if let Some(last) = &self.last_location {
            if sample.timestamp <= last.timestamp {
                return false;
            }
            let accurate = sample.accuracy_m.is_finite()
                && sample.accuracy_m <= DISTANCE_ACCURACY_CUTOFF_M
                && last.accuracy_m <= DISTANCE_ACCURACY_CUTOFF_M;
            if accurate {
                let delta = haversine_distance_m(last, sample);
                self.stats.merge_distance(self.stats.distance_m + delta);
            }
        }

        self.window.push_back((sample.timestamp, self.stats.distance_m));
        while let Some((oldest, _)) = self.window.front() {
            if sample.timestamp.signed_duration_since(*oldest).num_seconds() > SPEED_WINDOW_SECS {
                self.window.pop_front();
            } else {
                break;
            }
        }

        self.last_location = Some(sample.clone());
        true
    }

    /// Average speed over the trailing window, when enough fixes exist to
    /// estimate one.
    pub fn window_speed_mps(&self) -> Option<f64> {
        let (first_ts, first_dist) = self.window.front()?;
        let (last_ts, last_dist) = self.window.back()?;
        let span = last_ts.signed_duration_since(*first_ts);
        let span_secs = span.num_milliseconds() as f64 / 1_000.0;
        if span_secs < 1.0 {
            return None;
        }
        Some((last_dist - first_dist).max(0.0) / span_secs)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
