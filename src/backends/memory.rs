//! In-memory storage for tests and local runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::base::{BackendError, BackendResult, JobStorage, TickFilter};
use crate::job::{JobState, JobTick, JobType, TickData, TickStatsSnapshot, TickStatus};
use crate::origin::OriginId;

#[derive(Default)]
struct TickTable {
    rows: BTreeMap<i64, JobTick>,
    next_id: i64,
}

/// Storage that keeps everything in process memory.
///
/// Rows live in ordered maps, so queries observe the same ordering the
/// Postgres implementation produces.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    job_states: Arc<Mutex<BTreeMap<OriginId, JobState>>>,
    ticks: Arc<Mutex<TickTable>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_filter(tick: &JobTick, filter: &TickFilter) -> bool {
    if let Some(run_key) = &filter.run_key
        && tick.run_key() != Some(run_key.as_str())
    {
        return false;
    }
    if let Some(statuses) = &filter.statuses
        && !statuses.contains(&tick.status())
    {
        return false;
    }
    if let Some(after) = filter.after
        && tick.timestamp() < after
    {
        return false;
    }
    if let Some(before) = filter.before
        && tick.timestamp() > before
    {
        return false;
    }
    true
}

#[async_trait]
impl JobStorage for MemoryBackend {
    async fn add_job_state(&self, state: &JobState) -> BackendResult<()> {
        let mut states = self.job_states.lock().expect("job states poisoned");
        let origin_id = state.origin_id();
        if states.contains_key(&origin_id) {
            return Err(BackendError::Message(format!(
                "job state already exists for origin {}",
                origin_id
            )));
        }
        states.insert(origin_id, state.clone());
        Ok(())
    }

    async fn update_job_state(&self, state: &JobState) -> BackendResult<()> {
        let mut states = self.job_states.lock().expect("job states poisoned");
        let origin_id = state.origin_id();
        match states.get_mut(&origin_id) {
            Some(existing) => {
                *existing = state.clone();
                Ok(())
            }
            None => Err(BackendError::Message(format!(
                "no job state for origin {}",
                origin_id
            ))),
        }
    }

    async fn get_job_state(&self, origin_id: &OriginId) -> BackendResult<Option<JobState>> {
        let states = self.job_states.lock().expect("job states poisoned");
        Ok(states.get(origin_id).cloned())
    }

    async fn all_job_states(
        &self,
        repository_origin_id: Option<&OriginId>,
        job_type: Option<JobType>,
    ) -> BackendResult<Vec<JobState>> {
        let states = self.job_states.lock().expect("job states poisoned");
        Ok(states
            .values()
            .filter(|state| {
                repository_origin_id
                    .map(|repo| state.origin().repository_id() == *repo)
                    .unwrap_or(true)
                    && job_type.map(|ty| state.job_type() == ty).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn delete_job_state(&self, origin_id: &OriginId) -> BackendResult<()> {
        let mut states = self.job_states.lock().expect("job states poisoned");
        match states.remove(origin_id) {
            Some(_) => Ok(()),
            None => Err(BackendError::Message(format!(
                "no job state for origin {}",
                origin_id
            ))),
        }
    }

    async fn create_tick(&self, tick_data: &TickData) -> BackendResult<JobTick> {
        let mut table = self.ticks.lock().expect("ticks poisoned");
        table.next_id += 1;
        let tick = JobTick::new(table.next_id, tick_data.clone());
        table.rows.insert(tick.tick_id(), tick.clone());
        Ok(tick)
    }

    async fn update_tick(&self, tick: &JobTick) -> BackendResult<()> {
        let mut table = self.ticks.lock().expect("ticks poisoned");
        match table.rows.get_mut(&tick.tick_id()) {
            Some(existing) => {
                *existing = tick.clone();
                Ok(())
            }
            None => Err(BackendError::Message(format!(
                "tick not found: {}",
                tick.tick_id()
            ))),
        }
    }

    async fn ticks(
        &self,
        origin_id: &OriginId,
        filter: &TickFilter,
    ) -> BackendResult<Vec<JobTick>> {
        let table = self.ticks.lock().expect("ticks poisoned");
        let matching = table
            .rows
            .values()
            .rev()
            .filter(|tick| tick.job_origin_id() == origin_id && matches_filter(tick, filter));
        Ok(match filter.limit {
            Some(limit) => matching.take(limit.max(0) as usize).cloned().collect(),
            None => matching.cloned().collect(),
        })
    }

    async fn latest_tick(&self, origin_id: &OriginId) -> BackendResult<Option<JobTick>> {
        let table = self.ticks.lock().expect("ticks poisoned");
        Ok(table
            .rows
            .values()
            .filter(|tick| tick.job_origin_id() == origin_id)
            .max_by_key(|tick| tick.timestamp())
            .cloned())
    }

    async fn tick_by_run_key(
        &self,
        origin_id: &OriginId,
        run_key: &str,
    ) -> BackendResult<Option<JobTick>> {
        let table = self.ticks.lock().expect("ticks poisoned");
        Ok(table
            .rows
            .values()
            .rev()
            .find(|tick| tick.job_origin_id() == origin_id && tick.run_key() == Some(run_key))
            .cloned())
    }

    async fn stuck_ticks(&self, cutoff: DateTime<Utc>) -> BackendResult<Vec<JobTick>> {
        let table = self.ticks.lock().expect("ticks poisoned");
        let mut stuck: Vec<JobTick> = table
            .rows
            .values()
            .filter(|tick| tick.status() == TickStatus::Started && tick.timestamp() <= cutoff)
            .cloned()
            .collect();
        stuck.sort_by_key(|tick| tick.timestamp());
        Ok(stuck)
    }

    async fn tick_stats(&self, origin_id: &OriginId) -> BackendResult<TickStatsSnapshot> {
        let table = self.ticks.lock().expect("ticks poisoned");
        let mut stats = TickStatsSnapshot::default();
        for tick in table.rows.values() {
            if tick.job_origin_id() == origin_id {
                stats.record(tick.status(), 1);
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
        let mut table = self.ticks.lock().expect("ticks poisoned");
        let doomed: Vec<i64> = table
            .rows
            .values()
            .filter(|tick| {
                tick.job_origin_id() == origin_id
                    && tick.timestamp() < before
                    && statuses.contains(&tick.status())
            })
            .map(|tick| tick.tick_id())
            .collect();
        for id in &doomed {
            table.rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
