/// Tunable thresholds for the pace fusion engine.
#[derive(Debug, Clone)]
pub struct PaceFusionConfig {
    /// Weight of the trailing-window speed in the blend; the instantaneous
    /// sample gets the remainder.
    pub window_weight: f64,

    /// Instantaneous samples with worse horizontal accuracy than this are
    /// dropped from the blend.
    pub accuracy_cutoff_m: f64,

    /// Instantaneous samples older than this relative to `now` are dropped.
    pub max_sample_age_ms: i64,

    /// Exponential smoothing factor applied to the pace estimate.
    pub smoothing_alpha: f64,

    /// Below this blended speed a sample counts as stationary.
    pub stationary_speed_mps: f64,

    /// Consecutive low-speed samples before pace is forced to 0.
    pub stationary_after_samples: u32,

    /// Consecutive moving samples before a stationary run resumes a real pace.
    pub moving_after_samples: u32,

    /// Ceiling on the emitted pace, seconds per kilometer.
    pub max_pace_secs: u32,
}

impl Default for PaceFusionConfig {
    fn default() -> Self {
        Self {
            window_weight: 0.7,
            accuracy_cutoff_m: 25.0,
            max_sample_age_ms: 5_000,
            smoothing_alpha: 0.35,
            stationary_speed_mps: 0.4,
            stationary_after_samples: 3,
            moving_after_samples: 2,
            max_pace_secs: 1_800,
        }
    }
}
