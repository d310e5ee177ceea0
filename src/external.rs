//! Projections of definitions living in a separate user-code process.
//!
//! The control plane never holds live pipeline, schedule, sensor, or
//! partition-set objects. It works against serialized data payloads paired
//! with origins, loaded into an [`ExternalRepository`] for name lookups.
//! Pipeline identity across processes is the snapshot id, so definitions
//! compare by hash instead of by structure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::job::{JobState, JobStatus, ScheduleData};
use crate::origin::{JobOrigin, OriginId, RepositoryOrigin};
use crate::snapshot::{PipelineIndex, PipelineSnapshot};

/// Serialized pipeline definition as shipped by a user-code process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalPipelineData {
    pub pipeline_snapshot: PipelineSnapshot,
}

/// Serialized schedule definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalScheduleData {
    pub name: String,
    pub cron_schedule: String,
    /// IANA timezone the cron expression is evaluated in; UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub pipeline_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Serialized sensor definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalSensorData {
    pub name: String,
    pub pipeline_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Serialized partition-set definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalPartitionSetData {
    pub name: String,
    pub pipeline_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_selection: Option<Vec<String>>,
}

/// Everything a repository ships in one payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalRepositoryData {
    pub name: String,
    #[serde(default)]
    pub pipelines: Vec<ExternalPipelineData>,
    #[serde(default)]
    pub schedules: Vec<ExternalScheduleData>,
    #[serde(default)]
    pub sensors: Vec<ExternalSensorData>,
    #[serde(default)]
    pub partition_sets: Vec<ExternalPartitionSetData>,
}

/// Pipeline projection: the indexed snapshot plus its origin.
#[derive(Clone, Debug)]
pub struct ExternalPipeline {
    index: PipelineIndex,
    origin: JobOrigin,
}

impl ExternalPipeline {
    pub fn new(data: ExternalPipelineData, repository: RepositoryOrigin) -> CoreResult<Self> {
        let origin = JobOrigin::new(repository, data.pipeline_snapshot.name.clone());
        let index = PipelineIndex::new(data.pipeline_snapshot)?;
        Ok(Self { index, origin })
    }

    pub fn name(&self) -> &str {
        self.index.name()
    }

    pub fn pipeline_index(&self) -> &PipelineIndex {
        &self.index
    }

    /// Identifying content hash. Two processes hold the same definition
    /// exactly when their snapshot ids are equal.
    pub fn snapshot_id(&self) -> &str {
        self.index.snapshot_id()
    }

    pub fn parent_snapshot_id(&self) -> Option<&str> {
        self.index.parent_snapshot_id()
    }

    pub fn origin(&self) -> &JobOrigin {
        &self.origin
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin.id()
    }
}

/// Schedule projection.
#[derive(Clone, Debug)]
pub struct ExternalSchedule {
    data: ExternalScheduleData,
    origin: JobOrigin,
}

impl ExternalSchedule {
    pub fn new(data: ExternalScheduleData, repository: RepositoryOrigin) -> Self {
        let origin = JobOrigin::new(repository, data.name.clone());
        Self { data, origin }
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn cron_schedule(&self) -> &str {
        &self.data.cron_schedule
    }

    pub fn timezone(&self) -> Option<&str> {
        self.data.timezone.as_deref()
    }

    pub fn pipeline_name(&self) -> &str {
        &self.data.pipeline_name
    }

    pub fn mode(&self) -> Option<&str> {
        self.data.mode.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.data.description.as_deref()
    }

    pub fn origin(&self) -> &JobOrigin {
        &self.origin
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin.id()
    }

    /// State a never-evaluated schedule is presumed to hold: STOPPED, the
    /// declared cron expression and timezone, and no start timestamp.
    pub fn default_job_state(&self) -> JobState {
        let mut data = ScheduleData::new(self.data.cron_schedule.clone());
        data.timezone = self.data.timezone.clone();
        JobState::for_schedule(self.origin.clone(), JobStatus::Stopped, data)
    }
}

/// Sensor projection.
#[derive(Clone, Debug)]
pub struct ExternalSensor {
    data: ExternalSensorData,
    origin: JobOrigin,
}

impl ExternalSensor {
    pub fn new(data: ExternalSensorData, repository: RepositoryOrigin) -> Self {
        let origin = JobOrigin::new(repository, data.name.clone());
        Self { data, origin }
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn pipeline_name(&self) -> &str {
        &self.data.pipeline_name
    }

    pub fn mode(&self) -> Option<&str> {
        self.data.mode.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.data.description.as_deref()
    }

    pub fn origin(&self) -> &JobOrigin {
        &self.origin
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin.id()
    }

    /// State a never-evaluated sensor is presumed to hold: STOPPED with no
    /// evaluation data.
    pub fn default_job_state(&self) -> JobState {
        JobState::for_sensor(self.origin.clone(), JobStatus::Stopped, None)
    }
}

/// Partition-set projection.
#[derive(Clone, Debug)]
pub struct ExternalPartitionSet {
    data: ExternalPartitionSetData,
    origin: JobOrigin,
}

impl ExternalPartitionSet {
    pub fn new(data: ExternalPartitionSetData, repository: RepositoryOrigin) -> Self {
        let origin = JobOrigin::new(repository, data.name.clone());
        Self { data, origin }
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn pipeline_name(&self) -> &str {
        &self.data.pipeline_name
    }

    pub fn mode(&self) -> Option<&str> {
        self.data.mode.as_deref()
    }

    pub fn step_selection(&self) -> Option<&[String]> {
        self.data.step_selection.as_deref()
    }

    pub fn origin(&self) -> &JobOrigin {
        &self.origin
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin.id()
    }
}

/// A loaded repository: projections indexed by definition name.
///
/// Loading hashes every pipeline snapshot once, so a malformed snapshot
/// fails the whole load instead of a later lookup.
#[derive(Clone, Debug)]
pub struct ExternalRepository {
    name: String,
    origin: RepositoryOrigin,
    pipelines: BTreeMap<String, ExternalPipeline>,
    schedules: BTreeMap<String, ExternalSchedule>,
    sensors: BTreeMap<String, ExternalSensor>,
    partition_sets: BTreeMap<String, ExternalPartitionSet>,
}

impl ExternalRepository {
    pub fn from_data(
        location_name: impl Into<String>,
        data: ExternalRepositoryData,
    ) -> CoreResult<Self> {
        let origin = RepositoryOrigin::new(location_name, data.name.clone());

        let mut pipelines = BTreeMap::new();
        for pipeline in data.pipelines {
            let projection = ExternalPipeline::new(pipeline, origin.clone())?;
            pipelines.insert(projection.name().to_string(), projection);
        }
        let mut schedules = BTreeMap::new();
        for schedule in data.schedules {
            let projection = ExternalSchedule::new(schedule, origin.clone());
            schedules.insert(projection.name().to_string(), projection);
        }
        let mut sensors = BTreeMap::new();
        for sensor in data.sensors {
            let projection = ExternalSensor::new(sensor, origin.clone());
            sensors.insert(projection.name().to_string(), projection);
        }
        let mut partition_sets = BTreeMap::new();
        for partition_set in data.partition_sets {
            let projection = ExternalPartitionSet::new(partition_set, origin.clone());
            partition_sets.insert(projection.name().to_string(), projection);
        }

        Ok(Self {
            name: data.name,
            origin,
            pipelines,
            schedules,
            sensors,
            partition_sets,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> &RepositoryOrigin {
        &self.origin
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin.id()
    }

    pub fn get_pipeline(&self, name: &str) -> CoreResult<&ExternalPipeline> {
        self.pipelines
            .get(name)
            .ok_or_else(|| self.unknown("pipeline", name))
    }

    pub fn get_schedule(&self, name: &str) -> CoreResult<&ExternalSchedule> {
        self.schedules
            .get(name)
            .ok_or_else(|| self.unknown("schedule", name))
    }

    pub fn get_sensor(&self, name: &str) -> CoreResult<&ExternalSensor> {
        self.sensors
            .get(name)
            .ok_or_else(|| self.unknown("sensor", name))
    }

    pub fn get_partition_set(&self, name: &str) -> CoreResult<&ExternalPartitionSet> {
        self.partition_sets
            .get(name)
            .ok_or_else(|| self.unknown("partition set", name))
    }

    /// Pipelines in name order.
    pub fn pipelines(&self) -> impl Iterator<Item = &ExternalPipeline> {
        self.pipelines.values()
    }

    /// Schedules in name order.
    pub fn schedules(&self) -> impl Iterator<Item = &ExternalSchedule> {
        self.schedules.values()
    }

    /// Sensors in name order.
    pub fn sensors(&self) -> impl Iterator<Item = &ExternalSensor> {
        self.sensors.values()
    }

    /// Partition sets in name order.
    pub fn partition_sets(&self) -> impl Iterator<Item = &ExternalPartitionSet> {
        self.partition_sets.values()
    }

    fn unknown(&self, kind: &'static str, name: &str) -> CoreError {
        CoreError::UnknownDefinition {
            kind,
            name: name.to_string(),
            repository: self.name.clone(),
        }
    }
}
