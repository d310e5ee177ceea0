//! Background schedule evaluation daemon.
//!
//! The daemon periodically walks every RUNNING schedule, computes the
//! trigger instants that have come due since the schedule's last tick,
//! opens a tick for each, asks the launcher to dispatch, and closes the
//! tick with the outcome. Each instant carries a run key derived from the
//! origin and timestamp, so re-evaluating it never dispatches twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backends::JobStorage;
use crate::error::ErrorInfo;
use crate::job::{JobSpecificData, JobState, JobStatus, JobType, TickData, TickStatus};
use crate::trigger::{trigger_times, trigger_times_after};

type DaemonError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of asking the launcher to act on one trigger instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaunchDecision {
    /// A run was submitted under this id.
    Launched { run_id: String },
    /// The launcher declined the instant; the tick records a skip.
    Skipped,
}

/// Dispatch seam the daemon calls once per due trigger instant.
///
/// Implementations submit a run to whatever executes pipelines. A returned
/// error closes the tick as FAILURE with the error chain attached.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn launch(
        &self,
        state: &JobState,
        execution_time: DateTime<Utc>,
        run_key: &str,
    ) -> Result<LaunchDecision, DaemonError>;
}

/// Configuration for the evaluation daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// How often to evaluate running schedules.
    pub poll_interval: Duration,
    /// Maximum trigger instants opened per schedule per pass. Bounds the
    /// catch-up burst after downtime; the remainder fires on later passes.
    pub max_ticks_per_pass: usize,
    /// Age past which a STARTED tick counts as abandoned by a dead pass.
    pub stuck_tick_window: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_ticks_per_pass: 5,
            stuck_tick_window: Duration::from_secs(600),
        }
    }
}

/// Background evaluation task over one storage backend.
pub struct SchedulerDaemon<S> {
    storage: Arc<S>,
    launcher: Arc<dyn RunLauncher>,
    config: DaemonConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S> SchedulerDaemon<S>
where
    S: JobStorage + 'static,
{
    pub fn new(
        storage: Arc<S>,
        launcher: Arc<dyn RunLauncher>,
        config: DaemonConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            storage,
            launcher,
            config,
            shutdown_rx,
        }
    }

    /// Run the evaluation loop until shutdown.
    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            max_ticks_per_pass = self.config.max_ticks_per_pass,
            "scheduler daemon started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("scheduler daemon shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.evaluate_once(Utc::now()).await {
                        error!(error = ?e, "evaluation pass failed");
                    }
                }
            }
        }
    }

    /// One evaluation pass, as of `now`.
    ///
    /// A failure against one schedule is logged and does not stop the pass;
    /// a storage failure listing schedules aborts it.
    pub async fn evaluate_once(&self, now: DateTime<Utc>) -> Result<(), DaemonError> {
        self.resolve_stuck_ticks(now).await?;

        let states = self
            .storage
            .all_job_states(None, Some(JobType::Schedule))
            .await?;
        for state in states {
            if state.status() != JobStatus::Running {
                continue;
            }
            if let Err(e) = self.evaluate_schedule(&state, now).await {
                error!(job_name = %state.job_name(), error = ?e, "schedule evaluation failed");
            }
        }
        Ok(())
    }

    async fn evaluate_schedule(
        &self,
        state: &JobState,
        now: DateTime<Utc>,
    ) -> Result<(), DaemonError> {
        let Some(data) = state.schedule_data() else {
            return Ok(());
        };
        let timezone = data.timezone.as_deref().unwrap_or("UTC");
        let origin_id = state.origin_id();

        // Resume strictly after the newest tick. A schedule with no ticks
        // starts from its declared start timestamp; one with neither gets
        // anchored at this pass, persisted so later passes hold the point.
        let latest = self.storage.latest_tick(&origin_id).await?;
        let times = match &latest {
            Some(tick) => trigger_times_after(&data.cron_schedule, timezone, tick.timestamp())?,
            None => {
                let start = match data.start_timestamp {
                    Some(start) => start,
                    None => {
                        let mut anchored = data.clone();
                        anchored.start_timestamp = Some(now);
                        let updated =
                            state.with_data(Some(JobSpecificData::Schedule(anchored)))?;
                        self.storage.update_job_state(&updated).await?;
                        now
                    }
                };
                trigger_times(&data.cron_schedule, timezone, start)?
            }
        };

        for instant in times.take(self.config.max_ticks_per_pass) {
            let execution_time = instant.with_timezone(&Utc);
            if execution_time > now {
                break;
            }
            self.fire(state, execution_time).await?;
        }
        Ok(())
    }

    /// Open, dispatch, and close the tick for one due instant.
    async fn fire(
        &self,
        state: &JobState,
        execution_time: DateTime<Utc>,
    ) -> Result<(), DaemonError> {
        let origin_id = state.origin_id();
        let run_key = format!("{}:{}", origin_id, execution_time.timestamp());

        if self
            .storage
            .tick_by_run_key(&origin_id, &run_key)
            .await?
            .is_some()
        {
            debug!(job_name = %state.job_name(), run_key = %run_key, "run key already evaluated");
            return Ok(());
        }

        let tick = self
            .storage
            .create_tick(&TickData::started(
                origin_id,
                state.job_name(),
                state.job_type(),
                execution_time,
                Some(run_key.clone()),
            ))
            .await?;

        match self.launcher.launch(state, execution_time, &run_key).await {
            Ok(LaunchDecision::Launched { run_id }) => {
                let done = tick.with_status(TickStatus::Success, Some(run_id.clone()), None)?;
                self.storage.update_tick(&done).await?;
                info!(
                    job_name = %state.job_name(),
                    run_id = %run_id,
                    run_key = %run_key,
                    "launched scheduled run"
                );
            }
            Ok(LaunchDecision::Skipped) => {
                let done = tick.with_status(TickStatus::Skipped, None, None)?;
                self.storage.update_tick(&done).await?;
                debug!(job_name = %state.job_name(), run_key = %run_key, "schedule skipped instant");
            }
            Err(e) => {
                let info = ErrorInfo::from_error(e.as_ref());
                let done = tick.with_status(TickStatus::Failure, None, Some(info))?;
                self.storage.update_tick(&done).await?;
                warn!(
                    job_name = %state.job_name(),
                    run_key = %run_key,
                    error = ?e,
                    "scheduled launch failed"
                );
            }
        }
        Ok(())
    }

    /// Close out ticks abandoned in STARTED by a pass that died mid-flight.
    async fn resolve_stuck_ticks(&self, now: DateTime<Utc>) -> Result<(), DaemonError> {
        let window = chrono::Duration::from_std(self.config.stuck_tick_window)?;
        let cutoff = now - window;

        for tick in self.storage.stuck_ticks(cutoff).await? {
            let message = format!(
                "tick opened at {} never reached a terminal status",
                tick.timestamp()
            );
            let failed =
                tick.with_status(TickStatus::Failure, None, Some(ErrorInfo::new(message)))?;
            self.storage.update_tick(&failed).await?;
            warn!(
                job_name = %tick.job_name(),
                tick_id = tick.tick_id(),
                "resolved stuck tick as failed"
            );
        }
        Ok(())
    }
}

/// Convenience function to spawn the daemon.
pub fn spawn_daemon<S>(
    storage: Arc<S>,
    launcher: Arc<dyn RunLauncher>,
    config: DaemonConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>)
where
    S: JobStorage + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = SchedulerDaemon::new(storage, launcher, config, shutdown_rx);
    let handle = tokio::spawn(daemon.run());
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;
    use crate::backends::{MemoryBackend, TickFilter};
    use crate::job::ScheduleData;
    use crate::origin::{JobOrigin, RepositoryOrigin};

    #[derive(Clone, Copy)]
    enum LaunchMode {
        Launch,
        Skip,
        Fail,
    }

    struct StubLauncher {
        mode: LaunchMode,
        run_keys: Mutex<Vec<String>>,
    }

    impl StubLauncher {
        fn new(mode: LaunchMode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                run_keys: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.run_keys.lock().expect("run keys poisoned").clone()
        }
    }

    #[async_trait]
    impl RunLauncher for StubLauncher {
        async fn launch(
            &self,
            _state: &JobState,
            _execution_time: DateTime<Utc>,
            run_key: &str,
        ) -> Result<LaunchDecision, DaemonError> {
            let mut seen = self.run_keys.lock().expect("run keys poisoned");
            seen.push(run_key.to_string());
            match self.mode {
                LaunchMode::Launch => Ok(LaunchDecision::Launched {
                    run_id: format!("run-{}", seen.len()),
                }),
                LaunchMode::Skip => Ok(LaunchDecision::Skipped),
                LaunchMode::Fail => Err("launcher unavailable".into()),
            }
        }
    }

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn running_schedule(start: Option<DateTime<Utc>>) -> JobState {
        let origin = JobOrigin::new(RepositoryOrigin::new("grpc:3030", "analytics"), "nightly");
        let mut data = ScheduleData::new("*/5 * * * *");
        data.start_timestamp = start;
        JobState::for_schedule(origin, JobStatus::Running, data)
    }

    fn daemon(
        storage: Arc<MemoryBackend>,
        launcher: Arc<dyn RunLauncher>,
    ) -> SchedulerDaemon<MemoryBackend> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        SchedulerDaemon::new(storage, launcher, DaemonConfig::default(), shutdown_rx)
    }

    #[tokio::test]
    async fn test_due_instants_open_and_close_ticks() {
        let storage = Arc::new(MemoryBackend::new());
        let launcher = StubLauncher::new(LaunchMode::Launch);
        let state = running_schedule(Some(ts(10, 0)));
        storage.add_job_state(&state).await.unwrap();

        let daemon = daemon(storage.clone(), launcher.clone());
        daemon.evaluate_once(ts(10, 10)).await.unwrap();

        let ticks = storage
            .ticks(&state.origin_id(), &TickFilter::default())
            .await
            .unwrap();
        assert_eq!(ticks.len(), 3);
        for tick in &ticks {
            assert_eq!(tick.status(), TickStatus::Success);
            assert!(tick.run_id().is_some());
            let expected_key = format!(
                "{}:{}",
                state.origin_id(),
                tick.timestamp().timestamp()
            );
            assert_eq!(tick.run_key(), Some(expected_key.as_str()));
        }
        // Newest first: 10:10, 10:05, 10:00.
        assert_eq!(ticks[0].timestamp(), ts(10, 10));
        assert_eq!(ticks[2].timestamp(), ts(10, 0));
        assert_eq!(launcher.seen().len(), 3);
    }

    #[tokio::test]
    async fn test_repeated_pass_fires_nothing_new() {
        let storage = Arc::new(MemoryBackend::new());
        let launcher = StubLauncher::new(LaunchMode::Launch);
        let state = running_schedule(Some(ts(10, 0)));
        storage.add_job_state(&state).await.unwrap();

        let daemon = daemon(storage.clone(), launcher.clone());
        daemon.evaluate_once(ts(10, 10)).await.unwrap();
        daemon.evaluate_once(ts(10, 10)).await.unwrap();

        let ticks = storage
            .ticks(&state.origin_id(), &TickFilter::default())
            .await
            .unwrap();
        assert_eq!(ticks.len(), 3);
        assert_eq!(launcher.seen().len(), 3);
    }

    #[tokio::test]
    async fn test_later_pass_resumes_without_gap_or_duplicate() {
        let storage = Arc::new(MemoryBackend::new());
        let launcher = StubLauncher::new(LaunchMode::Launch);
        let state = running_schedule(Some(ts(10, 0)));
        storage.add_job_state(&state).await.unwrap();

        let daemon = daemon(storage.clone(), launcher.clone());
        daemon.evaluate_once(ts(10, 10)).await.unwrap();
        daemon.evaluate_once(ts(10, 20)).await.unwrap();

        let mut ticks = storage
            .ticks(&state.origin_id(), &TickFilter::default())
            .await
            .unwrap();
        ticks.reverse();
        let timestamps: Vec<_> = ticks.iter().map(|t| t.timestamp()).collect();
        assert_eq!(
            timestamps,
            vec![ts(10, 0), ts(10, 5), ts(10, 10), ts(10, 15), ts(10, 20)]
        );

        let mut run_keys = launcher.seen();
        run_keys.sort();
        run_keys.dedup();
        assert_eq!(run_keys.len(), 5);
    }

    #[tokio::test]
    async fn test_catchup_is_bounded_per_pass() {
        let storage = Arc::new(MemoryBackend::new());
        let launcher = StubLauncher::new(LaunchMode::Launch);
        let state = running_schedule(Some(ts(10, 0)));
        storage.add_job_state(&state).await.unwrap();

        // 10:00 through 11:00 is 13 due instants; each pass takes 5.
        let daemon = daemon(storage.clone(), launcher.clone());
        daemon.evaluate_once(ts(11, 0)).await.unwrap();
        assert_eq!(launcher.seen().len(), 5);

        daemon.evaluate_once(ts(11, 0)).await.unwrap();
        daemon.evaluate_once(ts(11, 0)).await.unwrap();
        assert_eq!(launcher.seen().len(), 13);

        let ticks = storage
            .ticks(&state.origin_id(), &TickFilter::default())
            .await
            .unwrap();
        assert_eq!(ticks.len(), 13);
        assert_eq!(ticks[0].timestamp(), ts(11, 0));
    }

    #[tokio::test]
    async fn test_unanchored_schedule_is_pinned_to_first_pass() {
        let storage = Arc::new(MemoryBackend::new());
        let launcher = StubLauncher::new(LaunchMode::Launch);
        let state = running_schedule(None);
        storage.add_job_state(&state).await.unwrap();

        let daemon = daemon(storage.clone(), launcher.clone());
        // 10:02 is not a */5 boundary, so nothing fires yet.
        daemon.evaluate_once(ts(10, 2)).await.unwrap();
        assert!(launcher.seen().is_empty());

        let stored = storage
            .get_job_state(&state.origin_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.schedule_data().unwrap().start_timestamp,
            Some(ts(10, 2))
        );

        // The 10:05 instant still fires even though a naive re-anchor at
        // 10:07 would have stepped past it.
        daemon.evaluate_once(ts(10, 7)).await.unwrap();
        let ticks = storage
            .ticks(&state.origin_id(), &TickFilter::default())
            .await
            .unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].timestamp(), ts(10, 5));
    }

    #[tokio::test]
    async fn test_stopped_schedules_are_not_evaluated() {
        let storage = Arc::new(MemoryBackend::new());
        let launcher = StubLauncher::new(LaunchMode::Launch);
        let state = running_schedule(Some(ts(10, 0))).with_status(JobStatus::Stopped);
        storage.add_job_state(&state).await.unwrap();

        let daemon = daemon(storage.clone(), launcher.clone());
        daemon.evaluate_once(ts(10, 10)).await.unwrap();

        assert!(launcher.seen().is_empty());
        let ticks = storage
            .ticks(&state.origin_id(), &TickFilter::default())
            .await
            .unwrap();
        assert!(ticks.is_empty());
    }

    #[tokio::test]
    async fn test_skip_decision_records_skipped_tick() {
        let storage = Arc::new(MemoryBackend::new());
        let launcher = StubLauncher::new(LaunchMode::Skip);
        let state = running_schedule(Some(ts(10, 0)));
        storage.add_job_state(&state).await.unwrap();

        let daemon = daemon(storage.clone(), launcher.clone());
        daemon.evaluate_once(ts(10, 0)).await.unwrap();

        let ticks = storage
            .ticks(&state.origin_id(), &TickFilter::default())
            .await
            .unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].status(), TickStatus::Skipped);
        assert!(ticks[0].run_id().is_none());
        assert!(ticks[0].error().is_none());
    }

    #[tokio::test]
    async fn test_launch_failure_records_failure_tick_once() {
        let storage = Arc::new(MemoryBackend::new());
        let launcher = StubLauncher::new(LaunchMode::Fail);
        let state = running_schedule(Some(ts(10, 0)));
        storage.add_job_state(&state).await.unwrap();

        let daemon = daemon(storage.clone(), launcher.clone());
        daemon.evaluate_once(ts(10, 0)).await.unwrap();
        // The failed instant is not re-dispatched.
        daemon.evaluate_once(ts(10, 0)).await.unwrap();

        let ticks = storage
            .ticks(&state.origin_id(), &TickFilter::default())
            .await
            .unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].status(), TickStatus::Failure);
        let error = ticks[0].error().expect("error payload");
        assert!(error.message.contains("launcher unavailable"));
        assert_eq!(launcher.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_started_tick_is_resolved_as_failure() {
        let storage = Arc::new(MemoryBackend::new());
        let launcher = StubLauncher::new(LaunchMode::Launch);
        let origin = JobOrigin::new(RepositoryOrigin::new("grpc:3030", "analytics"), "nightly");

        let stale = storage
            .create_tick(&TickData::started(
                origin.id(),
                "nightly",
                JobType::Schedule,
                ts(9, 0),
                Some("stale".to_string()),
            ))
            .await
            .unwrap();
        let fresh = storage
            .create_tick(&TickData::started(
                origin.id(),
                "nightly",
                JobType::Schedule,
                ts(10, 58),
                Some("fresh".to_string()),
            ))
            .await
            .unwrap();

        let daemon = daemon(storage.clone(), launcher);
        daemon.evaluate_once(ts(11, 0)).await.unwrap();

        let ticks = storage
            .ticks(&origin.id(), &TickFilter::default())
            .await
            .unwrap();
        let stale_after = ticks.iter().find(|t| t.tick_id() == stale.tick_id()).unwrap();
        assert_eq!(stale_after.status(), TickStatus::Failure);
        assert!(
            stale_after
                .error()
                .expect("error payload")
                .message
                .contains("never reached a terminal status")
        );

        let fresh_after = ticks.iter().find(|t| t.tick_id() == fresh.tick_id()).unwrap();
        assert_eq!(fresh_after.status(), TickStatus::Started);
    }
}
