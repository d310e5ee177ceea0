//! Postgres storage for job state and tick rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::base::{BackendError, BackendResult, JobStorage, TickFilter};
use crate::job::{JobState, JobTick, JobType, TickData, TickStatsSnapshot, TickStatus};
use crate::origin::OriginId;

/// Persist job states and ticks in Postgres.
///
/// Rows hold the full serialized body next to the columns queries filter
/// on, so reads never reconstruct values from columns.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str) -> BackendResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        let backend = Self::new(pool);
        backend.init_schema().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize database schema.
    pub async fn init_schema(&self) -> BackendResult<()> {
        sqlx::raw_sql(
            r#"
            -- Job state rows, one per origin
            CREATE TABLE IF NOT EXISTS jobs (
                id BIGSERIAL PRIMARY KEY,
                job_origin_id TEXT NOT NULL UNIQUE,
                repository_origin_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                job_body TEXT NOT NULL,
                create_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                update_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_repository
                ON jobs(repository_origin_id);

            -- Evaluation ticks, append-then-update
            CREATE TABLE IF NOT EXISTS job_ticks (
                id BIGSERIAL PRIMARY KEY,
                job_origin_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                run_key TEXT,
                timestamp TIMESTAMPTZ NOT NULL,
                tick_body TEXT NOT NULL,
                create_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                update_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_job_ticks_origin
                ON job_ticks(job_origin_id);

            -- Dedup lookup by run key
            CREATE INDEX IF NOT EXISTS idx_job_ticks_run_key
                ON job_ticks(job_origin_id, run_key);

            CREATE INDEX IF NOT EXISTS idx_job_ticks_status
                ON job_ticks(job_origin_id, status);

            -- Chronological scans
            CREATE INDEX IF NOT EXISTS idx_job_ticks_timestamp
                ON job_ticks(job_origin_id, timestamp);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete all persisted rows for a clean test run.
    pub async fn clear_all(&self) -> BackendResult<()> {
        sqlx::raw_sql("TRUNCATE jobs, job_ticks RESTART IDENTITY")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TickRow {
    id: i64,
    tick_body: String,
}

impl TickRow {
    fn into_tick(self) -> BackendResult<JobTick> {
        let data: TickData = serde_json::from_str(&self.tick_body)?;
        Ok(JobTick::new(self.id, data))
    }
}

#[derive(sqlx::FromRow)]
struct StatusCountRow {
    status: String,
    count: i64,
}

fn decode_state(body: &str) -> BackendResult<JobState> {
    Ok(serde_json::from_str(body)?)
}

fn status_strings(statuses: &[TickStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl JobStorage for PostgresBackend {
    async fn add_job_state(&self, state: &JobState) -> BackendResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (job_origin_id, repository_origin_id, job_type, status, job_body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_origin_id) DO NOTHING
            "#,
        )
        .bind(state.origin_id().as_str())
        .bind(state.origin().repository_id().as_str())
        .bind(state.job_type().as_str())
        .bind(state.status().as_str())
        .bind(serde_json::to_string(state)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::Message(format!(
                "job state already exists for origin {}",
                state.origin_id()
            )));
        }
        Ok(())
    }

    async fn update_job_state(&self, state: &JobState) -> BackendResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, job_body = $3, update_timestamp = NOW()
            WHERE job_origin_id = $1
            "#,
        )
        .bind(state.origin_id().as_str())
        .bind(state.status().as_str())
        .bind(serde_json::to_string(state)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::Message(format!(
                "no job state for origin {}",
                state.origin_id()
            )));
        }
        Ok(())
    }

    async fn get_job_state(&self, origin_id: &OriginId) -> BackendResult<Option<JobState>> {
        let body = sqlx::query_scalar::<_, String>(
            "SELECT job_body FROM jobs WHERE job_origin_id = $1",
        )
        .bind(origin_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        body.as_deref().map(decode_state).transpose()
    }

    async fn all_job_states(
        &self,
        repository_origin_id: Option<&OriginId>,
        job_type: Option<JobType>,
    ) -> BackendResult<Vec<JobState>> {
        let bodies = sqlx::query_scalar::<_, String>(
            r#"
            SELECT job_body FROM jobs
            WHERE ($1::text IS NULL OR repository_origin_id = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY job_origin_id
            "#,
        )
        .bind(repository_origin_id.map(OriginId::as_str))
        .bind(job_type.as_ref().map(JobType::as_str))
        .fetch_all(&self.pool)
        .await?;

        bodies.iter().map(|body| decode_state(body)).collect()
    }

    async fn delete_job_state(&self, origin_id: &OriginId) -> BackendResult<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_origin_id = $1")
            .bind(origin_id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::Message(format!(
                "no job state for origin {}",
                origin_id
            )));
        }
        Ok(())
    }

    async fn create_tick(&self, tick_data: &TickData) -> BackendResult<JobTick> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_ticks (job_origin_id, job_type, status, run_key, timestamp, tick_body)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(tick_data.job_origin_id().as_str())
        .bind(tick_data.job_type().as_str())
        .bind(tick_data.status().as_str())
        .bind(tick_data.run_key())
        .bind(tick_data.timestamp())
        .bind(serde_json::to_string(tick_data)?)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.get("id");
        Ok(JobTick::new(id, tick_data.clone()))
    }

    async fn update_tick(&self, tick: &JobTick) -> BackendResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_ticks
            SET status = $2, run_key = $3, timestamp = $4, tick_body = $5,
                update_timestamp = NOW()
            WHERE id = $1
            "#,
        )
        .bind(tick.tick_id())
        .bind(tick.status().as_str())
        .bind(tick.run_key())
        .bind(tick.timestamp())
        .bind(serde_json::to_string(tick.tick_data())?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::Message(format!(
                "tick not found: {}",
                tick.tick_id()
            )));
        }
        Ok(())
    }

    async fn ticks(
        &self,
        origin_id: &OriginId,
        filter: &TickFilter,
    ) -> BackendResult<Vec<JobTick>> {
        let rows = sqlx::query_as::<_, TickRow>(
            r#"
            SELECT id, tick_body FROM job_ticks
            WHERE job_origin_id = $1
              AND ($2::text IS NULL OR run_key = $2)
              AND ($3::text[] IS NULL OR status = ANY($3))
              AND ($4::timestamptz IS NULL OR timestamp >= $4)
              AND ($5::timestamptz IS NULL OR timestamp <= $5)
            ORDER BY id DESC
            LIMIT $6
            "#,
        )
        .bind(origin_id.as_str())
        .bind(filter.run_key.as_deref())
        .bind(filter.statuses.as_deref().map(status_strings))
        .bind(filter.after)
        .bind(filter.before)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TickRow::into_tick).collect()
    }

    async fn latest_tick(&self, origin_id: &OriginId) -> BackendResult<Option<JobTick>> {
        let row = sqlx::query_as::<_, TickRow>(
            r#"
            SELECT id, tick_body FROM job_ticks
            WHERE job_origin_id = $1
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(origin_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TickRow::into_tick).transpose()
    }

    async fn tick_by_run_key(
        &self,
        origin_id: &OriginId,
        run_key: &str,
    ) -> BackendResult<Option<JobTick>> {
        let row = sqlx::query_as::<_, TickRow>(
            r#"
            SELECT id, tick_body FROM job_ticks
            WHERE job_origin_id = $1 AND run_key = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(origin_id.as_str())
        .bind(run_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TickRow::into_tick).transpose()
    }

    async fn stuck_ticks(&self, cutoff: DateTime<Utc>) -> BackendResult<Vec<JobTick>> {
        let rows = sqlx::query_as::<_, TickRow>(
            r#"
            SELECT id, tick_body FROM job_ticks
            WHERE status = $1 AND timestamp <= $2
            ORDER BY timestamp
            "#,
        )
        .bind(TickStatus::Started.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TickRow::into_tick).collect()
    }

    async fn tick_stats(&self, origin_id: &OriginId) -> BackendResult<TickStatsSnapshot> {
        let rows = sqlx::query_as::<_, StatusCountRow>(
            r#"
            SELECT status, COUNT(*) AS count FROM job_ticks
            WHERE job_origin_id = $1
            GROUP BY status
            "#,
        )
        .bind(origin_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TickStatsSnapshot::default();
        for row in rows {
            // Rows written by a newer build may carry statuses this build
            // does not know; they are not counted.
            if let Some(status) = TickStatus::parse(&row.status) {
                stats.record(status, row.count);
            }
        }
        Ok(stats)
    }

    async fn purge_ticks(
        &self,
        origin_id: &OriginId,
        before: DateTime<Utc>,
        statuses: &[TickStatus],
    ) -> BackendResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_ticks
            WHERE job_origin_id = $1 AND timestamp < $2 AND status = ANY($3)
            "#,
        )
        .bind(origin_id.as_str())
        .bind(before)
        .bind(status_strings(statuses))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serial_test::serial;

    use super::*;
    use crate::job::{JobStatus, ScheduleData};
    use crate::origin::{JobOrigin, RepositoryOrigin};

    async fn setup_backend() -> Option<PostgresBackend> {
        let database_url = match std::env::var("SWITCHBACK_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("skipping test: SWITCHBACK_DATABASE_URL not set");
                return None;
            }
        };
        let backend = PostgresBackend::connect(&database_url)
            .await
            .expect("connect postgres");
        backend.clear_all().await.expect("clear tables");
        Some(backend)
    }

    fn origin(job_name: &str) -> JobOrigin {
        JobOrigin::new(RepositoryOrigin::new("grpc:3030", "analytics"), job_name)
    }

    fn schedule_state(job_name: &str) -> JobState {
        JobState::for_schedule(
            origin(job_name),
            JobStatus::Stopped,
            ScheduleData::new("0 2 * * *"),
        )
    }

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, minute, 0).unwrap()
    }

    fn started_tick(job_name: &str, at: DateTime<Utc>, run_key: Option<&str>) -> TickData {
        TickData::started(
            origin(job_name).id(),
            job_name,
            JobType::Schedule,
            at,
            run_key.map(str::to_string),
        )
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn postgres_job_state_round_trip() {
        let Some(backend) = setup_backend().await else {
            return;
        };

        let state = schedule_state("nightly");
        let origin_id = state.origin_id();

        backend.add_job_state(&state).await.expect("add state");
        let loaded = backend
            .get_job_state(&origin_id)
            .await
            .expect("get state")
            .expect("state exists");
        assert_eq!(loaded, state);

        let err = backend.add_job_state(&state).await.unwrap_err();
        assert!(matches!(err, BackendError::Message(_)));

        let running = state.with_status(JobStatus::Running);
        backend.update_job_state(&running).await.expect("update");
        let loaded = backend
            .get_job_state(&origin_id)
            .await
            .expect("get state")
            .expect("state exists");
        assert_eq!(loaded.status(), JobStatus::Running);

        backend.delete_job_state(&origin_id).await.expect("delete");
        assert!(
            backend
                .get_job_state(&origin_id)
                .await
                .expect("get state")
                .is_none()
        );
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn postgres_all_job_states_filters() {
        let Some(backend) = setup_backend().await else {
            return;
        };

        backend
            .add_job_state(&schedule_state("nightly"))
            .await
            .expect("add schedule");
        backend
            .add_job_state(&JobState::for_sensor(
                origin("watcher"),
                JobStatus::Running,
                None,
            ))
            .await
            .expect("add sensor");

        let repo_id = RepositoryOrigin::new("grpc:3030", "analytics").id();
        let all = backend
            .all_job_states(Some(&repo_id), None)
            .await
            .expect("all states");
        assert_eq!(all.len(), 2);

        let sensors = backend
            .all_job_states(Some(&repo_id), Some(JobType::Sensor))
            .await
            .expect("sensors");
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].job_name(), "watcher");

        let other_repo = RepositoryOrigin::new("grpc:4040", "ops").id();
        let none = backend
            .all_job_states(Some(&other_repo), None)
            .await
            .expect("empty");
        assert!(none.is_empty());
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn postgres_tick_lifecycle() {
        let Some(backend) = setup_backend().await else {
            return;
        };

        let origin_id = origin("nightly").id();
        let tick = backend
            .create_tick(&started_tick("nightly", ts(0), Some("nightly:0")))
            .await
            .expect("create tick");
        assert_eq!(tick.status(), TickStatus::Started);

        let done = tick
            .with_status(TickStatus::Success, Some("run-1".to_string()), None)
            .expect("transition");
        backend.update_tick(&done).await.expect("update tick");

        let ticks = backend
            .ticks(&origin_id, &TickFilter::default())
            .await
            .expect("ticks");
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].tick_id(), tick.tick_id());
        assert_eq!(ticks[0].status(), TickStatus::Success);
        assert_eq!(ticks[0].run_id(), Some("run-1"));
        assert_eq!(ticks[0].run_key(), Some("nightly:0"));

        let missing = JobTick::new(999_999, started_tick("nightly", ts(9), None));
        assert!(backend.update_tick(&missing).await.is_err());
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn postgres_tick_filters_and_lookups() {
        let Some(backend) = setup_backend().await else {
            return;
        };

        let origin_id = origin("nightly").id();
        for minute in [0, 5, 10] {
            let tick = backend
                .create_tick(&started_tick(
                    "nightly",
                    ts(minute),
                    Some(&format!("nightly:{minute}")),
                ))
                .await
                .expect("create tick");
            if minute == 5 {
                let skipped = tick
                    .with_status(TickStatus::Skipped, None, None)
                    .expect("skip");
                backend.update_tick(&skipped).await.expect("update");
            }
        }
        backend
            .create_tick(&started_tick("hourly", ts(2), Some("hourly:2")))
            .await
            .expect("create other origin tick");

        let all = backend
            .ticks(&origin_id, &TickFilter::default())
            .await
            .expect("ticks");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp(), ts(10));

        let skipped = backend
            .ticks(&origin_id, &TickFilter::with_statuses([TickStatus::Skipped]))
            .await
            .expect("skipped ticks");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].timestamp(), ts(5));

        let windowed = backend
            .ticks(
                &origin_id,
                &TickFilter {
                    after: Some(ts(5)),
                    before: Some(ts(10)),
                    limit: Some(1),
                    ..TickFilter::default()
                },
            )
            .await
            .expect("windowed ticks");
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].timestamp(), ts(10));

        let latest = backend
            .latest_tick(&origin_id)
            .await
            .expect("latest")
            .expect("tick exists");
        assert_eq!(latest.timestamp(), ts(10));

        let by_key = backend
            .tick_by_run_key(&origin_id, "nightly:5")
            .await
            .expect("run key lookup")
            .expect("tick exists");
        assert_eq!(by_key.status(), TickStatus::Skipped);
        assert!(
            backend
                .tick_by_run_key(&origin_id, "hourly:2")
                .await
                .expect("run key lookup")
                .is_none()
        );
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn postgres_stuck_ticks_stats_and_purge() {
        let Some(backend) = setup_backend().await else {
            return;
        };

        let origin_id = origin("nightly").id();
        let first = backend
            .create_tick(&started_tick("nightly", ts(0), None))
            .await
            .expect("create");
        backend
            .create_tick(&started_tick("nightly", ts(5), None))
            .await
            .expect("create");
        backend
            .create_tick(&started_tick("nightly", ts(30), None))
            .await
            .expect("create");

        let done = first
            .with_status(TickStatus::Success, Some("run-1".to_string()), None)
            .expect("transition");
        backend.update_tick(&done).await.expect("update");

        let stuck = backend.stuck_ticks(ts(10)).await.expect("stuck");
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].timestamp(), ts(5));

        let stats = backend.tick_stats(&origin_id).await.expect("stats");
        assert_eq!(stats.ticks_succeeded, 1);
        assert_eq!(stats.ticks_started, 2);

        let purged = backend
            .purge_ticks(
                &origin_id,
                ts(30) + Duration::minutes(1),
                &[TickStatus::Success],
            )
            .await
            .expect("purge");
        assert_eq!(purged, 1);

        let remaining = backend
            .ticks(&origin_id, &TickFilter::default())
            .await
            .expect("ticks");
        assert_eq!(remaining.len(), 2);
    }
}
