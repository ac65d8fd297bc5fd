use std::{
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
    collaborators::{
        BackgroundTasks, LocationTracker, Outcome, PermissionGate, RecordApi, SessionStats,
        StepCallback, StepTracker, StepUpdate,
    },
    models::{LocationSample, RunStatus, RunningRecord, RunningRecordItem},
    offline::OfflineStore,
    pace::{fuse, PaceFusionConfig, PaceFusionInput},
    segments::{SegmentRecorder, SegmentSnapshot},
};

use super::state::RunState;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

type StepMailbox = Arc<StdMutex<Option<StepUpdate>>>;

/// The capability objects the lifecycle drives. Injected, never global, so
/// sessions and tests never share implicit state.
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn RecordApi>,
    pub location: Arc<dyn LocationTracker>,
    pub steps: Arc<dyn StepTracker>,
    pub permissions: Arc<dyn PermissionGate>,
    pub background: Arc<dyn BackgroundTasks>,
    pub offline: Arc<dyn OfflineStore>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tick_interval: Duration,
    /// Every N ticks the in-progress stats are synced to the server.
    pub heartbeat_every_ticks: u32,
    /// IANA timezone identifier reported when creating the session resource.
    pub timezone: String,
    /// Sessions shorter than this are never persisted.
    pub min_record_distance_m: f64,
    pub fusion: PaceFusionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let debug_mode = std::env::var("STRIDECORE_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            tick_interval: Duration::from_secs(1),
            heartbeat_every_ticks: if debug_mode { 1 } else { 10 },
            timezone: "UTC".to_string(),
            min_record_distance_m: 10.0,
            fusion: PaceFusionConfig::default(),
        }
    }
}

/// Orchestrates one recording session at a time: sensor collaborators, live
/// stats, segment boundaries, and persistence at session edges.
///
/// State machine: Stopped → Running ⇄ Paused → Finished, back to Stopped only
/// via `reset_running`. Exactly one active session; `start` on an active one
/// is an error.
#[derive(Clone)]
pub struct SessionController {
    state: Arc<Mutex<RunState>>,
    recorder: Arc<Mutex<SegmentRecorder>>,
    collaborators: Collaborators,
    config: SessionConfig,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    step_mailbox: StepMailbox,
}

impl SessionController {
    pub fn new(collaborators: Collaborators, config: SessionConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState::new())),
            recorder: Arc::new(Mutex::new(SegmentRecorder::new())),
            collaborators,
            config,
            ticker: Arc::new(Mutex::new(None)),
            step_mailbox: Arc::new(StdMutex::new(None)),
        }
    }

    pub async fn get_state(&self) -> RunState {
        let mut guard = self.state.lock().await;
        if matches!(guard.status, RunStatus::Running | RunStatus::Paused) {
            let duration = guard.active_duration(Instant::now());
            let stats = guard.stats;
            if let Some(record) = guard.record.as_mut() {
                record.duration_secs = duration.as_secs();
                record.distance_m = stats.distance_m;
            }
        }
        guard.clone()
    }

    pub async fn segments(&self) -> Vec<RunningRecordItem> {
        self.recorder.lock().await.segments().to_vec()
    }

    /// Starts a session. A permission shortfall disables the affected
    /// sensors but never blocks the start: the state is `Running` either
    /// way, possibly with a locally-issued placeholder id.
    pub async fn start(&self) -> Result<RunningRecord> {
        {
            let state = self.state.lock().await;
            if state.status != RunStatus::Stopped {
                bail!("session already active (state {})", state.status.as_str());
            }
        }

        let permissions = self.collaborators.permissions.check_required_permissions();
        let started_at = Utc::now();

        let session_outcome: Outcome<String> = if permissions.location {
            Outcome::from_result(
                self.collaborators
                    .api
                    .start_session(started_at.timestamp(), &self.config.timezone)
                    .await,
            )
        } else {
            Outcome::Degraded {
                reason: "location permission not granted".into(),
            }
        };

        let session_id = match session_outcome {
            Outcome::Ok(id) => id,
            Outcome::Degraded { reason } => {
                log_warn!("starting degraded session: {reason}");
                Uuid::new_v4().to_string()
            }
            Outcome::Failed { error } => {
                log_warn!("session resource creation failed, continuing locally: {error:#}");
                Uuid::new_v4().to_string()
            }
        };

        if permissions.location {
            if let Err(err) = self.collaborators.location.start_tracking(&session_id).await {
                log_warn!("location tracking unavailable for {session_id}: {err:#}");
            }
        }

        let record = RunningRecord::new(session_id.clone(), started_at);

        take_mailbox(&self.step_mailbox);
        {
            let mut state = self.state.lock().await;
            state.begin_session(record.clone(), Instant::now());
        }
        {
            let mut recorder = self.recorder.lock().await;
            recorder.initialize_segment_tracking(started_at);
        }

        // Best-effort: a step counter that cannot start only degrades
        // cadence data to unavailable.
        let step_outcome: Outcome<()> = if permissions.motion {
            let mailbox = self.step_mailbox.clone();
            let callback: StepCallback = Box::new(move |update| merge_mailbox(&mailbox, update));
            Outcome::from_result(self.collaborators.steps.start_tracking(callback).await)
        } else {
            Outcome::Degraded {
                reason: "motion permission not granted".into(),
            }
        };
        match step_outcome {
            Outcome::Ok(()) => {}
            Outcome::Degraded { reason } => log_info!("step tracking disabled: {reason}"),
            Outcome::Failed { error } => {
                log_warn!("step tracking failed to start, cadence unavailable: {error:#}");
            }
        }

        self.spawn_ticker().await;

        log_info!("session {session_id} started");
        Ok(record)
    }

    /// Records the pause instant and pauses the location stream. Duplicate
    /// calls are no-ops; no I/O happens here.
    pub async fn pause(&self) {
        let transitioned = {
            let mut state = self.state.lock().await;
            state.mark_paused(Instant::now())
        };
        if transitioned {
            self.collaborators.location.pause_tracking();
            log_info!("session paused");
        }
    }

    /// Accumulates the elapsed pause gap and resumes tracking. A spurious
    /// resume without a prior pause is a no-op.
    pub async fn resume(&self) {
        let gap = {
            let mut state = self.state.lock().await;
            state.mark_resumed(Instant::now())
        };
        if let Some(gap) = gap {
            self.collaborators.location.resume_tracking();
            log_info!("session resumed after {} ms paused", gap.as_millis());
        }
    }

    /// Ends the session. Returns the finalized record on successful
    /// persistence, or `None` when nothing was persisted: either because
    /// the run was too short to count or because the payload was queued for
    /// offline retry. Cleanup runs on every exit path.
    pub async fn end(&self) -> Result<Option<RunningRecord>> {
        let ended_at = Utc::now();

        {
            let mut state = self.state.lock().await;
            if !state.try_begin_end() {
                bail!("no active session to end");
            }
        }

        // The one failure with no safe default: without the authoritative
        // final distance the session outcome cannot be determined. Cleanup
        // still runs, the teardown claim is released so `end` can be
        // retried, then the error propagates.
        let tracking = match self.collaborators.location.stop_tracking().await {
            Ok(result) => result,
            Err(error) => {
                self.cleanup().await;
                self.state.lock().await.abort_end();
                return Err(error.context("failed to stop location tracking"));
            }
        };

        {
            let mut state = self.state.lock().await;
            let mut recorder = self.recorder.lock().await;

            // Fold the tracker's full trace in. Fixes that already arrived
            // live are dropped by the timestamp guard; the unseen tail
            // extends the distance and the final segment's sub-trace.
            for sample in tracking.locations {
                if state.merge_location(&sample) {
                    recorder.push_location(sample);
                }
            }

            if let Some(update) = take_mailbox(&self.step_mailbox) {
                state.stats.merge_steps(update);
            }
            state.stats.merge_steps(StepUpdate {
                steps: self.collaborators.steps.current_steps(),
                cadence: self.collaborators.steps.current_cadence(),
            });
            state.stats.merge_distance(tracking.distance_m);
        }

        // Close the in-progress segment against the final totals.
        self.finalize_current_segment().await;

        let (record, stats) = {
            let state = self.state.lock().await;
            let stats = session_stats(&state, Instant::now());
            let Some(mut record) = state.record.clone() else {
                drop(state);
                self.cleanup().await;
                bail!("active session has no record");
            };
            record.distance_m = stats.distance_m;
            record.steps = state.stats.steps;
            record.cadence = stats.cadence;
            record.heart_rate = stats.heart_rate;
            record.calories = stats.calories;
            record.duration_secs = stats.duration_secs;
            record.ended_at = Some(ended_at);
            (record, stats)
        };

        if record.distance_m < self.config.min_record_distance_m {
            log_info!(
                "session {} too short to record ({:.1} m), nothing persisted",
                record.id,
                record.distance_m
            );
            self.cleanup().await;
            self.finish(None).await;
            return Ok(None);
        }

        match self.collaborators.api.end_session(&record.id, &stats).await {
            Ok(finalized) => {
                let segments = { self.recorder.lock().await.segments().to_vec() };
                if !segments.is_empty() {
                    match self.collaborators.api.save_segments(&record.id, &segments).await {
                        Ok(()) => self.recorder.lock().await.mark_uploaded(),
                        Err(error) => {
                            log_warn!(
                                "segment upload failed, queueing {} segments: {error:#}",
                                segments.len()
                            );
                            if let Err(queue_err) = self
                                .collaborators
                                .offline
                                .add_pending_segment_upload(&record.id, &segments)
                                .await
                            {
                                log_error!(
                                    "failed to queue segments for {}: {queue_err:#}",
                                    record.id
                                );
                            }
                        }
                    }
                }

                let mut finalized_record = record;
                finalized_record.reward_points = finalized.reward_points;

                self.cleanup().await;
                self.finish(Some(finalized_record.clone())).await;

                log_info!(
                    "session {} finished: {:.0} m in {} s",
                    finalized_record.id,
                    finalized_record.distance_m,
                    finalized_record.duration_secs
                );
                Ok(Some(finalized_record))
            }
            Err(error) => {
                log_warn!("end-session persistence failed, queueing for retry: {error:#}");
                if let Err(queue_err) =
                    self.collaborators.offline.add_pending_upload(&record).await
                {
                    log_error!("failed to queue session {}: {queue_err:#}", record.id);
                }
                self.cleanup().await;
                self.finish(None).await;
                Ok(None)
            }
        }
    }

    /// Best-effort sync of in-progress stats to the server. Failures are
    /// logged and dropped; the session is never interrupted.
    pub async fn update_current_record(&self) {
        let snapshot = {
            let state = self.state.lock().await;
            if matches!(state.status, RunStatus::Running | RunStatus::Paused) {
                state
                    .record
                    .as_ref()
                    .map(|record| (record.id.clone(), session_stats(&state, Instant::now())))
            } else {
                None
            }
        };

        let Some((session_id, stats)) = snapshot else {
            return;
        };
        if let Err(error) = self.collaborators.api.update_session(&session_id, &stats).await {
            log_warn!("best-effort record sync failed for {session_id}: {error:#}");
        }
    }

    /// Clears the in-memory session, stats, and segment buffers and returns
    /// to `Stopped`.
    pub async fn reset_running(&self) {
        self.cancel_ticker().await;
        {
            let mut state = self.state.lock().await;
            state.reset();
        }
        {
            let mut recorder = self.recorder.lock().await;
            recorder.reset_segments();
        }
        take_mailbox(&self.step_mailbox);
        log_info!("session state reset");
    }

    /// Entry point for the location stream. Ignored while paused or stopped;
    /// replayed and out-of-order fixes are dropped so re-delivery is safe.
    pub async fn on_location_update(&self, sample: LocationSample) {
        let accepted = {
            let mut state = self.state.lock().await;
            if state.status != RunStatus::Running {
                return;
            }
            state.merge_location(&sample)
        };
        if accepted {
            self.recorder.lock().await.push_location(sample);
        }
    }

    /// Application-level segment boundary: finalize the current segment and
    /// open the next one against the running totals.
    pub async fn finalize_current_segment(&self) {
        let totals = {
            let state = self.state.lock().await;
            SegmentSnapshot {
                distance_m: state.stats.distance_m,
                calories: state.stats.calories,
                cadence: state.stats.cadence,
                heart_rate: state.stats.heart_rate,
            }
        };
        self.recorder
            .lock()
            .await
            .finalize_current_segment(Utc::now(), totals);
    }

    async fn finish(&self, finalized: Option<RunningRecord>) {
        let mut state = self.state.lock().await;
        state.status = RunStatus::Finished;
        if finalized.is_some() {
            state.record = finalized;
        }
    }

    /// Teardown that runs unconditionally on every `end` exit path. Each
    /// step is independent; a failing one is logged and the rest still run.
    async fn cleanup(&self) {
        self.cancel_ticker().await;

        if let Err(error) = self.collaborators.background.stop_background_tracking().await {
            log_warn!("failed to stop background tracking: {error:#}");
        }
        if let Err(error) = self.collaborators.background.clear_background_data().await {
            log_warn!("failed to clear background data: {error:#}");
        }
        if let Err(error) = self.collaborators.steps.stop_tracking().await {
            log_warn!("failed to stop step tracking: {error:#}");
        }
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let api = self.collaborators.api.clone();
        let mailbox = self.step_mailbox.clone();
        let fusion_config = self.config.fusion.clone();
        let tick_interval = self.config.tick_interval;
        let heartbeat_every = self.config.heartbeat_every_ticks.max(1);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u32 = 0;
            loop {
                interval.tick().await;

                let heartbeat = {
                    let mut guard = state.lock().await;
                    match guard.status {
                        RunStatus::Running => {}
                        RunStatus::Paused => continue,
                        _ => break,
                    }

                    if let Some(update) = take_mailbox(&mailbox) {
                        guard.stats.merge_steps(update);
                    }

                    let input = fusion_input(&guard, Utc::now());
                    let (pace, next) = fuse(&input, guard.fusion, &fusion_config);
                    guard.fusion = next;
                    guard.stats.pace_secs = pace;

                    guard
                        .record
                        .as_ref()
                        .map(|record| (record.id.clone(), session_stats(&guard, Instant::now())))
                };

                ticks = ticks.wrapping_add(1);

                if ticks % heartbeat_every == 0 {
                    if let Some((session_id, stats)) = heartbeat {
                        let api = api.clone();
                        tokio::spawn(async move {
                            if let Err(error) = api.update_session(&session_id, &stats).await {
                                log_warn!(
                                    "periodic record sync failed for {session_id}: {error:#}"
                                );
                            }
                        });
                    }
                }
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }
}

fn session_stats(state: &RunState, now: Instant) -> SessionStats {
    SessionStats {
        distance_m: state.stats.distance_m,
        duration_secs: state.active_duration(now).as_secs(),
        cadence: state.stats.cadence,
        heart_rate: state.stats.heart_rate,
        calories: state.stats.calories,
    }
}

fn fusion_input(state: &RunState, now: DateTime<Utc>) -> PaceFusionInput {
    let (instant_speed, accuracy, sample_ts) = state
        .last_location()
        .map(|loc| (loc.speed_mps, loc.accuracy_m, loc.timestamp.timestamp_millis()))
        .unwrap_or((f64::NAN, f64::NAN, 0));

    PaceFusionInput {
        window_speed_mps: state.window_speed_mps().unwrap_or(f64::NAN),
        instant_speed_mps: instant_speed,
        instant_accuracy_m: accuracy,
        sample_timestamp_ms: sample_ts,
        now_ms: now.timestamp_millis(),
    }
}

fn merge_mailbox(mailbox: &StdMutex<Option<StepUpdate>>, update: StepUpdate) {
    let mut guard = match mailbox.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let merged = match guard.take() {
        Some(previous) => StepUpdate {
            steps: previous.steps.max(update.steps),
            cadence: update.cadence.or(previous.cadence),
        },
        None => update,
    };
    *guard = Some(merged);
}

fn take_mailbox(mailbox: &StdMutex<Option<StepUpdate>>) -> Option<StepUpdate> {
    match mailbox.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FinalizedSession, PermissionStatus, TrackingResult};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct MockApi {
        fail_end: bool,
        fail_update: bool,
        fail_save: bool,
        start_calls: AtomicU32,
        end_calls: AtomicU32,
        update_calls: AtomicU32,
        save_calls: AtomicU32,
        saved_segment_count: AtomicU32,
    }

    #[async_trait]
    impl RecordApi for MockApi {
        async fn start_session(&self, _started_at_epoch_s: i64, _timezone: &str) -> Result<String> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            Ok("srv-123".to_string())
        }

        async fn end_session(
            &self,
            session_id: &str,
            stats: &SessionStats,
        ) -> Result<FinalizedSession> {
            self.end_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_end {
                return Err(anyhow!("network unreachable"));
            }
            Ok(FinalizedSession {
                id: session_id.to_string(),
                distance_m: stats.distance_m,
                cadence: stats.cadence,
                heart_rate: stats.heart_rate,
                calories: stats.calories,
                duration_secs: stats.duration_secs,
                reward_points: Some(25),
            })
        }

        async fn update_session(&self, _session_id: &str, _stats: &SessionStats) -> Result<()> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_update {
                return Err(anyhow!("network unreachable"));
            }
            Ok(())
        }

        async fn save_segments(
            &self,
            _session_id: &str,
            items: &[RunningRecordItem],
        ) -> Result<()> {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_save {
                return Err(anyhow!("network unreachable"));
            }
            self.saved_segment_count
                .fetch_add(items.len() as u32, Ordering::SeqCst);
            Ok(())
        }

        async fn list_sessions(&self) -> Result<Vec<RunningRecord>> {
            Ok(Vec::new())
        }

        async fn get_session(&self, session_id: &str) -> Result<RunningRecord> {
            Ok(RunningRecord::new(session_id.to_string(), Utc::now()))
        }

        async fn delete_session(&self, _session_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockLocation {
        final_distance_m: f64,
        final_locations: Vec<LocationSample>,
        fail_stop: bool,
        stop_delay: Duration,
        start_calls: AtomicU32,
        stop_calls: AtomicU32,
        pause_calls: AtomicU32,
        resume_calls: AtomicU32,
    }

    #[async_trait]
    impl LocationTracker for MockLocation {
        async fn start_tracking(&self, _session_id: &str) -> Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_tracking(&self) -> Result<TrackingResult> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            if !self.stop_delay.is_zero() {
                tokio::time::sleep(self.stop_delay).await;
            }
            if self.fail_stop {
                return Err(anyhow!("positioning service died"));
            }
            Ok(TrackingResult {
                distance_m: self.final_distance_m,
                locations: self.final_locations.clone(),
            })
        }

        fn pause_tracking(&self) {
            self.pause_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn resume_tracking(&self) {
            self.resume_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockSteps {
        fail_start: bool,
        stop_calls: AtomicU32,
        callback: StdMutex<Option<StepCallback>>,
    }

    impl MockSteps {
        fn emit(&self, update: StepUpdate) {
            let guard = match self.callback.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(callback) = guard.as_ref() {
                callback(update);
            }
        }
    }

    #[async_trait]
    impl StepTracker for MockSteps {
        async fn start_tracking(&self, callback: StepCallback) -> Result<()> {
            if self.fail_start {
                return Err(anyhow!("pedometer unavailable"));
            }
            *self.callback.lock().unwrap() = Some(callback);
            Ok(())
        }

        async fn stop_tracking(&self) -> Result<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn current_steps(&self) -> u32 {
            0
        }

        fn current_cadence(&self) -> Option<u32> {
            None
        }
    }

    struct MockPermissions(PermissionStatus);

    impl PermissionGate for MockPermissions {
        fn check_required_permissions(&self) -> PermissionStatus {
            self.0
        }
    }

    #[derive(Default)]
    struct MockBackground {
        stop_calls: AtomicU32,
        clear_calls: AtomicU32,
    }

    #[async_trait]
    impl BackgroundTasks for MockBackground {
        async fn stop_background_tracking(&self) -> Result<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn clear_background_data(&self) -> Result<()> {
            self.clear_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockOffline {
        sessions: StdMutex<Vec<RunningRecord>>,
        segment_batches: StdMutex<Vec<(String, Vec<RunningRecordItem>)>>,
    }

    #[async_trait]
    impl OfflineStore for MockOffline {
        async fn add_pending_upload(&self, record: &RunningRecord) -> Result<()> {
            self.sessions.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn add_pending_segment_upload(
            &self,
            session_id: &str,
            items: &[RunningRecordItem],
        ) -> Result<()> {
            self.segment_batches
                .lock()
                .unwrap()
                .push((session_id.to_string(), items.to_vec()));
            Ok(())
        }
    }

    struct Harness {
        controller: SessionController,
        api: Arc<MockApi>,
        location: Arc<MockLocation>,
        steps: Arc<MockSteps>,
        background: Arc<MockBackground>,
        offline: Arc<MockOffline>,
    }

    fn harness_with(
        api: MockApi,
        location: MockLocation,
        steps: MockSteps,
        permissions: PermissionStatus,
    ) -> Harness {
        let api = Arc::new(api);
        let location = Arc::new(location);
        let steps = Arc::new(steps);
        let background = Arc::new(MockBackground::default());
        let offline = Arc::new(MockOffline::default());

        let _ = env_logger::builder().is_test(true).try_init();

        let controller = SessionController::new(
            Collaborators {
                api: api.clone(),
                location: location.clone(),
                steps: steps.clone(),
                permissions: Arc::new(MockPermissions(permissions)),
                background: background.clone(),
                offline: offline.clone(),
            },
            SessionConfig {
                tick_interval: Duration::from_secs(1),
                heartbeat_every_ticks: 10,
                timezone: "UTC".to_string(),
                min_record_distance_m: 10.0,
                fusion: PaceFusionConfig::default(),
            },
        );

        Harness {
            controller,
            api,
            location,
            steps,
            background,
            offline,
        }
    }

    fn harness() -> Harness {
        harness_with(
            MockApi::default(),
            MockLocation::default(),
            MockSteps::default(),
            PermissionStatus::granted(),
        )
    }

    fn assert_cleanup_ran_once(h: &Harness) {
        assert_eq!(h.background.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.background.clear_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.steps.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_with_permissions_creates_server_session() {
        let h = harness();
        let record = h.controller.start().await.unwrap();

        assert_eq!(record.id, "srv-123");
        assert_eq!(h.api.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.location.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.get_state().await.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn start_without_permissions_still_runs_degraded() {
        let h = harness_with(
            MockApi::default(),
            MockLocation::default(),
            MockSteps::default(),
            PermissionStatus {
                has_all_permissions: false,
                location: false,
                location_background: false,
                motion: false,
            },
        );

        let record = h.controller.start().await.unwrap();

        assert_ne!(record.id, "srv-123");
        assert_eq!(h.api.start_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.location.start_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.controller.get_state().await.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn step_tracker_failure_degrades_cadence_only() {
        let h = harness_with(
            MockApi::default(),
            MockLocation::default(),
            MockSteps {
                fail_start: true,
                ..Default::default()
            },
            PermissionStatus::granted(),
        );

        h.controller.start().await.unwrap();

        let state = h.controller.get_state().await;
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.stats.cadence, None);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let h = harness();
        h.controller.start().await.unwrap();
        assert!(h.controller.start().await.is_err());
    }

    #[tokio::test]
    async fn end_below_minimum_distance_persists_nothing() {
        let h = harness();
        h.controller.start().await.unwrap();

        let result = h.controller.end().await.unwrap();

        assert!(result.is_none());
        assert_eq!(h.api.end_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.api.save_calls.load(Ordering::SeqCst), 0);
        assert_cleanup_ran_once(&h);
        assert_eq!(h.controller.get_state().await.status, RunStatus::Finished);
    }

    #[tokio::test]
    async fn end_with_distance_persists_and_uploads_segments_once() {
        let h = harness_with(
            MockApi::default(),
            MockLocation {
                final_distance_m: 120.0,
                ..Default::default()
            },
            MockSteps::default(),
            PermissionStatus::granted(),
        );
        h.controller.start().await.unwrap();

        let record = h.controller.end().await.unwrap().expect("record persisted");

        assert_eq!(record.reward_points, Some(25));
        assert_eq!(record.distance_m, 120.0);
        assert_eq!(h.api.end_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.api.save_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.api.saved_segment_count.load(Ordering::SeqCst), 1);
        assert!(h.offline.sessions.lock().unwrap().is_empty());
        assert_cleanup_ran_once(&h);
        assert_eq!(h.controller.get_state().await.status, RunStatus::Finished);

        let segments = h.controller.segments().await;
        assert_eq!(segments.len(), 1);
        assert!(segments[0].is_uploaded);
    }

    #[tokio::test]
    async fn segment_upload_failure_queues_batch_and_still_returns_record() {
        let h = harness_with(
            MockApi {
                fail_save: true,
                ..Default::default()
            },
            MockLocation {
                final_distance_m: 120.0,
                ..Default::default()
            },
            MockSteps::default(),
            PermissionStatus::granted(),
        );
        h.controller.start().await.unwrap();

        let record = h.controller.end().await.unwrap().expect("record persisted");

        assert_eq!(record.reward_points, Some(25));
        assert_eq!(h.api.save_calls.load(Ordering::SeqCst), 1);
        let batches = h.offline.segment_batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let (session_id, items) = &batches[0];
        assert_eq!(session_id, "srv-123");
        assert_eq!(items.len(), 1);
        assert!(items.iter().all(|item| !item.is_uploaded));
        drop(batches);

        // The local copies stay pending until a retry gets them through.
        assert!(h.controller.segments().await.iter().all(|s| !s.is_uploaded));
        assert_cleanup_ran_once(&h);
    }

    #[tokio::test]
    async fn concurrent_end_calls_persist_once() {
        let h = harness_with(
            MockApi::default(),
            MockLocation {
                final_distance_m: 120.0,
                stop_delay: Duration::from_millis(20),
                ..Default::default()
            },
            MockSteps::default(),
            PermissionStatus::granted(),
        );
        h.controller.start().await.unwrap();

        // The first call claims the teardown and parks in stop_tracking;
        // the duplicate must bail instead of persisting a second time.
        let (first, second) = tokio::join!(h.controller.end(), h.controller.end());

        assert!(first.unwrap().is_some());
        assert!(second.is_err());
        assert_eq!(h.location.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.api.end_calls.load(Ordering::SeqCst), 1);
        assert_cleanup_ran_once(&h);
    }

    #[tokio::test]
    async fn final_trace_from_stop_tracking_reaches_last_segment() {
        let t0 = Utc::now();
        let fix = |i: i64| LocationSample {
            latitude: 45.0 + 0.0005 * i as f64,
            longitude: 7.0,
            timestamp: t0 + chrono::Duration::seconds(i * 5),
            speed_mps: 3.0,
            altitude_m: 0.0,
            accuracy_m: 5.0,
        };
        let h = harness_with(
            MockApi::default(),
            MockLocation {
                final_locations: (0..4).map(fix).collect(),
                ..Default::default()
            },
            MockSteps::default(),
            PermissionStatus::granted(),
        );
        h.controller.start().await.unwrap();
        h.controller.on_location_update(fix(0)).await;
        h.controller.on_location_update(fix(1)).await;

        let record = h.controller.end().await.unwrap().expect("record persisted");

        // Two fixes arrived live; the replayed pair is dropped and the
        // unseen tail lands in the final segment's sub-trace.
        let segments = h.controller.segments().await;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].locations.len(), 4);
        // Three ~55.6 m hops.
        assert!(
            (160.0..175.0).contains(&record.distance_m),
            "distance {}",
            record.distance_m
        );
    }

    #[tokio::test]
    async fn end_persistence_failure_queues_exactly_one_payload() {
        let h = harness_with(
            MockApi {
                fail_end: true,
                ..Default::default()
            },
            MockLocation {
                final_distance_m: 120.0,
                ..Default::default()
            },
            MockSteps::default(),
            PermissionStatus::granted(),
        );
        h.controller.start().await.unwrap();

        let result = h.controller.end().await.unwrap();

        assert!(result.is_none());
        assert_eq!(h.api.save_calls.load(Ordering::SeqCst), 0);
        let queued = h.offline.sessions.lock().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, "srv-123");
        assert_eq!(queued[0].distance_m, 120.0);
        drop(queued);
        assert_cleanup_ran_once(&h);
        assert_eq!(h.controller.get_state().await.status, RunStatus::Finished);
    }

    #[tokio::test]
    async fn stop_tracking_failure_propagates_after_cleanup() {
        let h = harness_with(
            MockApi::default(),
            MockLocation {
                fail_stop: true,
                ..Default::default()
            },
            MockSteps::default(),
            PermissionStatus::granted(),
        );
        h.controller.start().await.unwrap();

        let result = h.controller.end().await;

        assert!(result.is_err());
        assert_eq!(h.api.end_calls.load(Ordering::SeqCst), 0);
        assert_cleanup_ran_once(&h);

        // The teardown claim is released, so the caller can try again.
        assert_eq!(h.controller.get_state().await.status, RunStatus::Running);
        assert!(h.controller.end().await.is_err());
        assert_eq!(h.location.stop_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn end_without_active_session_is_an_error() {
        let h = harness();
        assert!(h.controller.end().await.is_err());
    }

    #[tokio::test]
    async fn pause_resume_accumulates_wall_clock_gap() {
        let h = harness();
        h.controller.start().await.unwrap();

        h.controller.pause().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.controller.resume().await;

        let paused = h.controller.get_state().await.paused_total();
        assert!(
            paused >= Duration::from_millis(50) && paused < Duration::from_secs(2),
            "paused total {paused:?}"
        );
        assert_eq!(h.location.pause_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.location.resume_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_pause_and_spurious_resume_are_safe() {
        let h = harness();
        h.controller.start().await.unwrap();

        h.controller.resume().await;
        assert_eq!(h.location.resume_calls.load(Ordering::SeqCst), 0);

        h.controller.pause().await;
        h.controller.pause().await;
        assert_eq!(h.location.pause_calls.load(Ordering::SeqCst), 1);

        h.controller.resume().await;
        h.controller.resume().await;
        assert_eq!(h.location.resume_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.get_state().await.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn location_updates_accumulate_monotonic_distance() {
        let h = harness();
        h.controller.start().await.unwrap();

        let t0 = Utc::now();
        for i in 0..4 {
            h.controller
                .on_location_update(LocationSample {
                    latitude: 45.0 + 0.0005 * f64::from(i),
                    longitude: 7.0,
                    timestamp: t0 + chrono::Duration::seconds(i64::from(i) * 5),
                    speed_mps: 3.0,
                    altitude_m: 0.0,
                    accuracy_m: 5.0,
                })
                .await;
        }

        let state = h.controller.get_state().await;
        // Three ~55.6 m hops.
        assert!(
            (160.0..175.0).contains(&state.stats.distance_m),
            "distance {}",
            state.stats.distance_m
        );
    }

    #[tokio::test]
    async fn segment_boundaries_produce_ordered_segments() {
        let h = harness();
        h.controller.start().await.unwrap();

        h.controller.finalize_current_segment().await;
        h.controller.finalize_current_segment().await;

        let segments = h.controller.segments().await;
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].order_index, 0);
        assert_eq!(segments[1].order_index, 1);
    }

    #[tokio::test]
    async fn step_callback_feeds_final_record() {
        let h = harness_with(
            MockApi::default(),
            MockLocation {
                final_distance_m: 120.0,
                ..Default::default()
            },
            MockSteps::default(),
            PermissionStatus::granted(),
        );
        h.controller.start().await.unwrap();

        h.steps.emit(StepUpdate {
            steps: 480,
            cadence: Some(168),
        });

        let record = h.controller.end().await.unwrap().expect("record persisted");
        assert_eq!(record.steps, 480);
        assert_eq!(record.cadence, Some(168));
    }

    #[tokio::test]
    async fn update_current_record_failure_is_swallowed() {
        let h = harness_with(
            MockApi {
                fail_update: true,
                ..Default::default()
            },
            MockLocation::default(),
            MockSteps::default(),
            PermissionStatus::granted(),
        );
        h.controller.start().await.unwrap();

        h.controller.update_current_record().await;

        assert_eq!(h.api.update_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.get_state().await.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn reset_running_returns_to_stopped_and_clears_buffers() {
        let h = harness_with(
            MockApi::default(),
            MockLocation {
                final_distance_m: 120.0,
                ..Default::default()
            },
            MockSteps::default(),
            PermissionStatus::granted(),
        );
        h.controller.start().await.unwrap();
        h.controller.finalize_current_segment().await;
        h.controller.end().await.unwrap();

        h.controller.reset_running().await;

        let state = h.controller.get_state().await;
        assert_eq!(state.status, RunStatus::Stopped);
        assert!(state.record.is_none());
        assert_eq!(state.stats.distance_m, 0.0);
        assert_eq!(state.stats.pace_secs, 0);
        assert!(h.controller.segments().await.is_empty());

        // A fresh session can start again after the reset.
        h.controller.start().await.unwrap();
        assert_eq!(h.controller.get_state().await.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn finished_session_cannot_restart_without_reset() {
        let h = harness();
        h.controller.start().await.unwrap();
        h.controller.end().await.unwrap();

        assert!(h.controller.start().await.is_err());
    }
}
