//! Switchback - control-plane core for schedule and sensor driven runs.

pub mod backends;
pub mod config;
pub mod daemon;
pub mod error;
pub mod external;
pub mod job;
pub mod origin;
pub mod plan;
pub mod snapshot;
pub mod trigger;

pub use backends::{
    BackendError, BackendResult, JobStorage, MemoryBackend, PostgresBackend, TickFilter,
};
pub use daemon::{DaemonConfig, LaunchDecision, RunLauncher, SchedulerDaemon, spawn_daemon};
pub use error::{CoreError, CoreResult, ErrorInfo};
pub use external::{
    ExternalPartitionSet, ExternalPartitionSetData, ExternalPipeline, ExternalPipelineData,
    ExternalRepository, ExternalRepositoryData, ExternalSchedule, ExternalScheduleData,
    ExternalSensor, ExternalSensorData,
};
pub use job::{
    JobSpecificData, JobState, JobStatus, JobTick, JobType, ScheduleData, SensorData, TickData,
    TickStatsSnapshot, TickStatus,
};
pub use origin::{JobOrigin, OriginId, RepositoryOrigin};
pub use plan::ExecutionPlan;
pub use snapshot::{
    ExecutionPlanSnapshot, ExecutionStepSnapshot, PipelineIndex, PipelineLineage,
    PipelineSnapshot, StepInputSnapshot, StepOutputHandle, StepOutputSnapshot,
};
pub use trigger::{TriggerTimes, trigger_times, trigger_times_after, validate_cron};
