use serde::{Deserialize, Serialize};

use super::PaceFusionConfig;

/// Anything faster is treated as sensor garbage, not motion.
const MAX_PLAUSIBLE_SPEED_MPS: f64 = 50.0;

/// Smoothing state threaded explicitly between `fuse` calls. Never shared or
/// global; the caller owns it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaceFusionState {
    /// Last emitted pace in whole seconds per kilometer; 0 means unavailable.
    pub pace_secs: u32,
    /// Continuous pace estimate carried between updates.
    smoothed_pace: f64,
    /// Consecutive samples below the stationary speed threshold.
    low_speed_run: u32,
    /// Consecutive moving samples observed while stationary.
    moving_run: u32,
    pub last_update_ms: i64,
}

/// One tick of sensor input for the fusion engine.
#[derive(Debug, Clone, Copy)]
pub struct PaceFusionInput {
    /// Speed over a short trailing distance window, meters per second.
    pub window_speed_mps: f64,
    /// Raw instantaneous speed from the latest positioning fix.
    pub instant_speed_mps: f64,
    /// Horizontal accuracy of that fix in meters.
    pub instant_accuracy_m: f64,
    /// Timestamp of that fix, unix milliseconds.
    pub sample_timestamp_ms: i64,
    /// Current time, unix milliseconds.
    pub now_ms: i64,
}

/// Fuses a window speed and an instantaneous sample into a stable pace
/// estimate with stationary/motion hysteresis.
///
/// Total and side-effect-free: any malformed or extreme numeric input
/// repeats the previous pace instead of erroring. Pace is whole seconds per
/// kilometer; 0 is the reserved "no usable pace" sentinel.
pub fn fuse(
    input: &PaceFusionInput,
    state: PaceFusionState,
    config: &PaceFusionConfig,
) -> (u32, PaceFusionState) {
    let window = usable_speed(input.window_speed_mps);
    let instant = usable_speed(input.instant_speed_mps).filter(|_| {
        instant_sample_usable(input, config)
    });

    let speed = match (window, instant) {
        (Some(w), Some(i)) => w * config.window_weight + i * (1.0 - config.window_weight),
        (Some(w), None) => w,
        (None, Some(i)) => i,
        // Nothing usable this tick: hold the previous estimate untouched.
        (None, None) => return (state.pace_secs, state),
    };

    let mut next = state;
    next.last_update_ms = input.now_ms;

    let was_stationary = state.low_speed_run >= config.stationary_after_samples;

    if speed < config.stationary_speed_mps {
        next.low_speed_run = state.low_speed_run.saturating_add(1);
        next.moving_run = 0;
        if next.low_speed_run >= config.stationary_after_samples {
            next.smoothed_pace = 0.0;
            next.pace_secs = 0;
            return (0, next);
        }
        // Not yet a sustained stop: hold the last estimate rather than
        // integrating near-zero speed into the smoother.
        return (state.pace_secs, next);
    }

    if was_stationary {
        next.moving_run = state.moving_run.saturating_add(1);
        if next.moving_run < config.moving_after_samples {
            return (0, next);
        }
        // Sustained motion again: leave stationary and re-converge from
        // scratch (smoothed_pace was zeroed when we stopped).
        next.low_speed_run = 0;
        next.moving_run = 0;
    } else {
        next.low_speed_run = 0;
        next.moving_run = 0;
    }

    let raw_pace = (1000.0 / speed).min(f64::from(config.max_pace_secs));
    next.smoothed_pace = if state.smoothed_pace <= 0.0 {
        raw_pace
    } else {
        state.smoothed_pace + config.smoothing_alpha * (raw_pace - state.smoothed_pace)
    };

    let pace = next
        .smoothed_pace
        .round()
        .clamp(0.0, f64::from(config.max_pace_secs)) as u32;
    next.pace_secs = pace;
    (pace, next)
}

fn usable_speed(speed_mps: f64) -> Option<f64> {
    if speed_mps.is_finite() && (0.0..=MAX_PLAUSIBLE_SPEED_MPS).contains(&speed_mps) {
        Some(speed_mps)
    } else {
        None
    }
}

fn instant_sample_usable(input: &PaceFusionInput, config: &PaceFusionConfig) -> bool {
    let accuracy_ok = input.instant_accuracy_m.is_finite()
        && input.instant_accuracy_m >= 0.0
        && input.instant_accuracy_m <= config.accuracy_cutoff_m;
    let fresh = input.now_ms.saturating_sub(input.sample_timestamp_ms) <= config.max_sample_age_ms;
    accuracy_ok && fresh
}
