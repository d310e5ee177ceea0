//! Job state machine for schedules and sensors.
//!
//! A "job" is a schedule or sensor the control plane tracks. Its persisted
//! state and every evaluation tick are immutable values: a status change
//! constructs a new value, and construction validates the type/data pairing
//! and the tick payload rules, so an invalid state never reaches storage.
//! Deserialization routes through the same constructors, so a body written
//! by another process is validated again when it is read back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ErrorInfo};
use crate::origin::{JobOrigin, OriginId};

/// Kind of job a state row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    Schedule,
    Sensor,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "SCHEDULE",
            Self::Sensor => "SENSOR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULE" => Some(Self::Schedule),
            "SENSOR" => Some(Self::Sensor),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a job is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Running,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of one evaluation tick.
///
/// STARTED is the initial status; the other three are terminal for that
/// tick. The next evaluation opens a fresh tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TickStatus {
    Started,
    Skipped,
    Success,
    Failure,
}

impl TickStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Skipped => "SKIPPED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTED" => Some(Self::Started),
            "SKIPPED" => Some(Self::Skipped),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for TickStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Evaluation data a schedule job carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleData {
    pub cron_schedule: String,
    /// IANA timezone the cron expression is evaluated in; UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,
}

impl ScheduleData {
    pub fn new(cron_schedule: impl Into<String>) -> Self {
        Self {
            cron_schedule: cron_schedule.into(),
            timezone: None,
            start_timestamp: None,
        }
    }
}

/// Evaluation data a sensor job carries, all of it optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_key: Option<String>,
}

/// Closed sum of job-specific data, tagged in the serialized body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobSpecificData {
    #[serde(rename = "SCHEDULE")]
    Schedule(ScheduleData),
    #[serde(rename = "SENSOR")]
    Sensor(SensorData),
}

fn check_job_data(
    origin: &JobOrigin,
    job_type: JobType,
    data: Option<&JobSpecificData>,
) -> CoreResult<()> {
    let reason = match (job_type, data) {
        (JobType::Schedule, Some(JobSpecificData::Schedule(_))) => return Ok(()),
        (JobType::Schedule, Some(JobSpecificData::Sensor(_))) => {
            "expected schedule data, found sensor data"
        }
        (JobType::Schedule, None) => "schedule jobs require schedule data",
        (JobType::Sensor, None | Some(JobSpecificData::Sensor(_))) => return Ok(()),
        (JobType::Sensor, Some(JobSpecificData::Schedule(_))) => {
            "sensor jobs cannot carry schedule data"
        }
    };
    Err(CoreError::InvalidJobData {
        job_name: origin.job_name().to_string(),
        job_type: job_type.as_str().to_string(),
        reason: reason.to_string(),
    })
}

/// Persistent state of one schedule or sensor, keyed by its origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawJobState")]
pub struct JobState {
    origin: JobOrigin,
    job_type: JobType,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_specific_data: Option<JobSpecificData>,
}

impl JobState {
    /// Construct a state value, validating the type/data pairing: schedules
    /// require `ScheduleData`, sensors take `SensorData` or nothing.
    pub fn new(
        origin: JobOrigin,
        job_type: JobType,
        status: JobStatus,
        job_specific_data: Option<JobSpecificData>,
    ) -> CoreResult<Self> {
        check_job_data(&origin, job_type, job_specific_data.as_ref())?;
        Ok(Self {
            origin,
            job_type,
            status,
            job_specific_data,
        })
    }

    /// Schedule state; the pairing is correct by construction.
    pub fn for_schedule(origin: JobOrigin, status: JobStatus, data: ScheduleData) -> Self {
        Self {
            origin,
            job_type: JobType::Schedule,
            status,
            job_specific_data: Some(JobSpecificData::Schedule(data)),
        }
    }

    /// Sensor state; the pairing is correct by construction.
    pub fn for_sensor(origin: JobOrigin, status: JobStatus, data: Option<SensorData>) -> Self {
        Self {
            origin,
            job_type: JobType::Sensor,
            status,
            job_specific_data: data.map(JobSpecificData::Sensor),
        }
    }

    pub fn origin(&self) -> &JobOrigin {
        &self.origin
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin.id()
    }

    pub fn job_name(&self) -> &str {
        self.origin.job_name()
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn job_specific_data(&self) -> Option<&JobSpecificData> {
        self.job_specific_data.as_ref()
    }

    pub fn schedule_data(&self) -> Option<&ScheduleData> {
        match &self.job_specific_data {
            Some(JobSpecificData::Schedule(data)) => Some(data),
            _ => None,
        }
    }

    pub fn sensor_data(&self) -> Option<&SensorData> {
        match &self.job_specific_data {
            Some(JobSpecificData::Sensor(data)) => Some(data),
            _ => None,
        }
    }

    /// New value with a different status; origin, type, and data carry over.
    pub fn with_status(&self, status: JobStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// New value with replaced data, re-validated against the job type.
    pub fn with_data(&self, data: Option<JobSpecificData>) -> CoreResult<Self> {
        check_job_data(&self.origin, self.job_type, data.as_ref())?;
        Ok(Self {
            job_specific_data: data,
            ..self.clone()
        })
    }
}

/// Wire shape of [`JobState`]; decoding converts through [`JobState::new`],
/// so stored bodies obey the same pairing rules.
#[derive(Deserialize)]
struct RawJobState {
    origin: JobOrigin,
    job_type: JobType,
    status: JobStatus,
    #[serde(default)]
    job_specific_data: Option<JobSpecificData>,
}

impl TryFrom<RawJobState> for JobState {
    type Error = CoreError;

    fn try_from(raw: RawJobState) -> CoreResult<Self> {
        Self::new(raw.origin, raw.job_type, raw.status, raw.job_specific_data)
    }
}

fn validate_tick(
    status: TickStatus,
    run_id: Option<&str>,
    error: Option<&ErrorInfo>,
) -> CoreResult<()> {
    let reason = match status {
        TickStatus::Success => {
            if run_id.map(str::is_empty).unwrap_or(true) {
                "a non-empty run id is required"
            } else if error.is_some() {
                "an error payload is not allowed"
            } else {
                return Ok(());
            }
        }
        TickStatus::Failure => {
            if error.is_none() {
                "a structured error payload is required"
            } else {
                return Ok(());
            }
        }
        TickStatus::Started | TickStatus::Skipped => {
            if error.is_some() {
                "an error payload is not allowed"
            } else {
                return Ok(());
            }
        }
    };
    Err(CoreError::InvalidTick {
        status: status.as_str().to_string(),
        reason: reason.to_string(),
    })
}

/// One evaluation attempt of a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTickData")]
pub struct TickData {
    job_origin_id: OriginId,
    job_name: String,
    job_type: JobType,
    status: TickStatus,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

impl TickData {
    /// Construct a tick value, enforcing the payload rules for its status:
    /// SUCCESS requires a run id and forbids an error, FAILURE requires an
    /// error, STARTED and SKIPPED forbid one.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_origin_id: OriginId,
        job_name: impl Into<String>,
        job_type: JobType,
        status: TickStatus,
        timestamp: DateTime<Utc>,
        run_id: Option<String>,
        run_key: Option<String>,
        error: Option<ErrorInfo>,
    ) -> CoreResult<Self> {
        validate_tick(status, run_id.as_deref(), error.as_ref())?;
        Ok(Self {
            job_origin_id,
            job_name: job_name.into(),
            job_type,
            status,
            timestamp,
            run_id,
            run_key,
            error,
        })
    }

    /// Freshly opened tick, optionally carrying an idempotency run key.
    pub fn started(
        job_origin_id: OriginId,
        job_name: impl Into<String>,
        job_type: JobType,
        timestamp: DateTime<Utc>,
        run_key: Option<String>,
    ) -> Self {
        Self {
            job_origin_id,
            job_name: job_name.into(),
            job_type,
            status: TickStatus::Started,
            timestamp,
            run_id: None,
            run_key,
            error: None,
        }
    }

    pub fn job_origin_id(&self) -> &OriginId {
        &self.job_origin_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn status(&self) -> TickStatus {
        self.status
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn run_key(&self) -> Option<&str> {
        self.run_key.as_deref()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    /// New value with the given status. The run id and error are replaced
    /// with the supplied values; timestamp and run key carry over. The same
    /// validation as `new` applies.
    pub fn with_status(
        &self,
        status: TickStatus,
        run_id: Option<String>,
        error: Option<ErrorInfo>,
    ) -> CoreResult<Self> {
        Self::new(
            self.job_origin_id.clone(),
            self.job_name.clone(),
            self.job_type,
            status,
            self.timestamp,
            run_id,
            self.run_key.clone(),
            error,
        )
    }
}

/// Wire shape of [`TickData`]; decoding converts through [`TickData::new`],
/// so stored bodies obey the same payload rules.
#[derive(Deserialize)]
struct RawTickData {
    job_origin_id: OriginId,
    job_name: String,
    job_type: JobType,
    status: TickStatus,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    run_key: Option<String>,
    #[serde(default)]
    error: Option<ErrorInfo>,
}

impl TryFrom<RawTickData> for TickData {
    type Error = CoreError;

    fn try_from(raw: RawTickData) -> CoreResult<Self> {
        Self::new(
            raw.job_origin_id,
            raw.job_name,
            raw.job_type,
            raw.status,
            raw.timestamp,
            raw.run_id,
            raw.run_key,
            raw.error,
        )
    }
}

/// A persisted tick: the store-assigned id plus its immutable data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobTick {
    tick_id: i64,
    tick_data: TickData,
}

impl JobTick {
    pub fn new(tick_id: i64, tick_data: TickData) -> Self {
        Self { tick_id, tick_data }
    }

    pub fn tick_id(&self) -> i64 {
        self.tick_id
    }

    pub fn tick_data(&self) -> &TickData {
        &self.tick_data
    }

    pub fn job_origin_id(&self) -> &OriginId {
        self.tick_data.job_origin_id()
    }

    pub fn job_name(&self) -> &str {
        self.tick_data.job_name()
    }

    pub fn job_type(&self) -> JobType {
        self.tick_data.job_type()
    }

    pub fn status(&self) -> TickStatus {
        self.tick_data.status()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.tick_data.timestamp()
    }

    pub fn run_id(&self) -> Option<&str> {
        self.tick_data.run_id()
    }

    pub fn run_key(&self) -> Option<&str> {
        self.tick_data.run_key()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.tick_data.error()
    }

    /// New tick with transitioned data and the same tick id.
    pub fn with_status(
        &self,
        status: TickStatus,
        run_id: Option<String>,
        error: Option<ErrorInfo>,
    ) -> CoreResult<Self> {
        Ok(Self {
            tick_id: self.tick_id,
            tick_data: self.tick_data.with_status(status, run_id, error)?,
        })
    }
}

/// Tick counts for one origin, each tick counted once by current status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickStatsSnapshot {
    pub ticks_started: i64,
    pub ticks_skipped: i64,
    pub ticks_succeeded: i64,
    pub ticks_failed: i64,
}

impl TickStatsSnapshot {
    pub fn record(&mut self, status: TickStatus, count: i64) {
        match status {
            TickStatus::Started => self.ticks_started += count,
            TickStatus::Skipped => self.ticks_skipped += count,
            TickStatus::Success => self.ticks_succeeded += count,
            TickStatus::Failure => self.ticks_failed += count,
        }
    }
}
