//! Storage interface for job state rows and their evaluation ticks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{JobState, JobTick, JobType, TickData, TickStatsSnapshot, TickStatus};
use crate::origin::OriginId;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Narrowing criteria for tick queries. Unset fields match every tick.
#[derive(Clone, Debug, Default)]
pub struct TickFilter {
    pub run_key: Option<String>,
    pub statuses: Option<Vec<TickStatus>>,
    /// Inclusive lower bound on the tick timestamp.
    pub after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the tick timestamp.
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl TickFilter {
    pub fn with_run_key(run_key: impl Into<String>) -> Self {
        Self {
            run_key: Some(run_key.into()),
            ..Self::default()
        }
    }

    pub fn with_statuses(statuses: impl Into<Vec<TickStatus>>) -> Self {
        Self {
            statuses: Some(statuses.into()),
            ..Self::default()
        }
    }
}

/// Durable store for job states and ticks, keyed by origin id.
///
/// State rows are unique per origin; values are immutable, so every write
/// replaces the whole serialized body. A single origin's rows are written
/// by one evaluator at a time; writes to distinct origins may race freely.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Insert a state row for an origin that has none yet.
    async fn add_job_state(&self, state: &JobState) -> BackendResult<()>;

    /// Replace the state row of the origin the value carries.
    async fn update_job_state(&self, state: &JobState) -> BackendResult<()>;

    async fn get_job_state(&self, origin_id: &OriginId) -> BackendResult<Option<JobState>>;

    /// State rows in origin-id order, optionally narrowed to one repository
    /// and one job type.
    async fn all_job_states(
        &self,
        repository_origin_id: Option<&OriginId>,
        job_type: Option<JobType>,
    ) -> BackendResult<Vec<JobState>>;

    /// Remove the state row for an origin that has one.
    async fn delete_job_state(&self, origin_id: &OriginId) -> BackendResult<()>;

    /// Append a tick row and return it with its assigned id.
    async fn create_tick(&self, tick_data: &TickData) -> BackendResult<JobTick>;

    /// Replace the data of an existing tick row, keyed by its tick id.
    async fn update_tick(&self, tick: &JobTick) -> BackendResult<()>;

    /// Ticks for one origin, newest first, narrowed by `filter`.
    async fn ticks(&self, origin_id: &OriginId, filter: &TickFilter)
    -> BackendResult<Vec<JobTick>>;

    /// The tick with the most recent timestamp for one origin.
    async fn latest_tick(&self, origin_id: &OriginId) -> BackendResult<Option<JobTick>>;

    /// The most recent tick carrying `run_key` for one origin. This is the
    /// dedup lookup: a hit means the unit of work was already evaluated.
    async fn tick_by_run_key(
        &self,
        origin_id: &OriginId,
        run_key: &str,
    ) -> BackendResult<Option<JobTick>>;

    /// Ticks still STARTED with a timestamp at or before `cutoff`, oldest
    /// first, across all origins. Surfaced as data; the caller decides the
    /// recovery policy.
    async fn stuck_ticks(&self, cutoff: DateTime<Utc>) -> BackendResult<Vec<JobTick>>;

    /// Tick counts by current status for one origin.
    async fn tick_stats(&self, origin_id: &OriginId) -> BackendResult<TickStatsSnapshot>;

    /// Delete ticks for one origin older than `before` whose status is in
    /// `statuses`. Returns the number of deleted rows.
    async fn purge_ticks(
        &self,
        origin_id: &OriginId,
        before: DateTime<Utc>,
        statuses: &[TickStatus],
    ) -> BackendResult<u64>;
}
