//! Immutable snapshots of compiled pipelines and execution plans.
//!
//! Snapshots are the serialized artifacts a host process hands to the
//! control plane. They never change after construction; identity is a
//! content hash, so equal definitions hash to equal ids in any process.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Snapshot of a compiled pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub mode_names: Vec<String>,
    pub step_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<PipelineLineage>,
}

/// Ancestry for a pipeline built by subsetting another pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLineage {
    pub parent_snapshot_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_selection: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_subset: Option<BTreeSet<String>>,
}

/// Index over a pipeline snapshot with its identifying snapshot id.
///
/// The id is the SHA-256 digest of the canonical JSON encoding. Lineage is
/// part of the hashed content, so a subsetted pipeline never shares an id
/// with its parent.
#[derive(Debug, Clone)]
pub struct PipelineIndex {
    snapshot: PipelineSnapshot,
    snapshot_id: String,
}

impl PipelineIndex {
    pub fn new(snapshot: PipelineSnapshot) -> CoreResult<Self> {
        let encoded = serde_json::to_vec(&snapshot)
            .map_err(|err| CoreError::SnapshotEncoding(err.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        let snapshot_id = format!("{:x}", hasher.finalize());
        Ok(Self {
            snapshot,
            snapshot_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.snapshot.name
    }

    pub fn snapshot(&self) -> &PipelineSnapshot {
        &self.snapshot
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn parent_snapshot_id(&self) -> Option<&str> {
        self.snapshot
            .lineage
            .as_ref()
            .map(|lineage| lineage.parent_snapshot_id.as_str())
    }
}

/// Snapshot of a fully resolved execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlanSnapshot {
    /// Identifying snapshot id of the pipeline this plan was compiled from.
    pub pipeline_snapshot_id: String,
    pub steps: Vec<ExecutionStepSnapshot>,
    /// Explicit subset to execute; `None` means every step in the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_keys_to_execute: Option<Vec<String>>,
}

/// One step of an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStepSnapshot {
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<StepInputSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<StepOutputSnapshot>,
    pub kind: String,
}

/// A declared step input and the upstream outputs that feed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInputSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream_output_handles: Vec<StepOutputHandle>,
}

/// Address of one output of one step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepOutputHandle {
    pub step_key: String,
    pub output_name: String,
}

/// A declared step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutputSnapshot {
    pub name: String,
}
