//! Execution plan resolution.
//!
//! Wraps an `ExecutionPlanSnapshot` and derives the executable view: which
//! steps are in the plan, the dependency graph restricted to those steps,
//! and a deterministic topological ordering in levels. Derived views are
//! computed once and cached for the lifetime of the plan.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::error::{CoreError, CoreResult};
use crate::snapshot::{ExecutionPlanSnapshot, ExecutionStepSnapshot, PipelineIndex};

/// Resolved view over an execution plan snapshot.
#[derive(Debug)]
pub struct ExecutionPlan {
    snapshot: ExecutionPlanSnapshot,
    step_keys: BTreeSet<String>,
    dependencies: OnceLock<BTreeMap<String, BTreeSet<String>>>,
    levels: OnceLock<CoreResult<Vec<Vec<String>>>>,
}

impl ExecutionPlan {
    /// Resolve a plan snapshot against the pipeline index it was compiled
    /// from. The snapshot ids must agree; a mismatch means the caller paired
    /// a plan with the wrong pipeline and is rejected outright. An explicit
    /// subset may only name steps the snapshot contains.
    pub fn new(snapshot: ExecutionPlanSnapshot, index: &PipelineIndex) -> CoreResult<Self> {
        if snapshot.pipeline_snapshot_id != index.snapshot_id() {
            return Err(CoreError::SnapshotMismatch {
                plan: snapshot.pipeline_snapshot_id.clone(),
                index: index.snapshot_id().to_string(),
            });
        }
        let step_keys = match &snapshot.step_keys_to_execute {
            Some(keys) => {
                let known: BTreeSet<&str> =
                    snapshot.steps.iter().map(|step| step.key.as_str()).collect();
                for key in keys {
                    if !known.contains(key.as_str()) {
                        return Err(CoreError::UnknownStepKey {
                            step_key: key.clone(),
                        });
                    }
                }
                keys.iter().cloned().collect()
            }
            None => snapshot.steps.iter().map(|step| step.key.clone()).collect(),
        };
        Ok(Self {
            snapshot,
            step_keys,
            dependencies: OnceLock::new(),
            levels: OnceLock::new(),
        })
    }

    /// Step keys the plan will execute: the explicit subset when one was
    /// requested, otherwise every step in the snapshot.
    pub fn step_keys_in_plan(&self) -> &BTreeSet<String> {
        &self.step_keys
    }

    /// Whether the snapshot contains a step, in the plan subset or not.
    pub fn has_step(&self, key: &str) -> bool {
        self.snapshot.steps.iter().any(|step| step.key == key)
    }

    pub fn get_step(&self, key: &str) -> CoreResult<&ExecutionStepSnapshot> {
        self.snapshot
            .steps
            .iter()
            .find(|step| step.key == key)
            .ok_or_else(|| CoreError::UnknownStepKey {
                step_key: key.to_string(),
            })
    }

    /// Map from each in-plan step to its in-plan upstream steps.
    ///
    /// Edges that leave the plan subset are dropped, so a subset plan never
    /// references steps it will not run.
    pub fn dependencies(&self) -> &BTreeMap<String, BTreeSet<String>> {
        self.dependencies.get_or_init(|| self.compute_dependencies())
    }

    fn compute_dependencies(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for step in &self.snapshot.steps {
            if !self.step_keys.contains(&step.key) {
                continue;
            }
            let upstream = dependencies.entry(step.key.clone()).or_default();
            for input in &step.inputs {
                for handle in &input.upstream_output_handles {
                    if self.step_keys.contains(&handle.step_key) {
                        upstream.insert(handle.step_key.clone());
                    }
                }
            }
        }
        dependencies
    }

    /// Topological levels of the in-plan dependency graph.
    ///
    /// Every dependency of a step in level `n` lives in a level before `n`,
    /// and keys within a level are sorted, so equal snapshots always resolve
    /// to the same ordering. A cycle fails the whole plan.
    pub fn topological_levels(&self) -> CoreResult<&[Vec<String>]> {
        self.levels
            .get_or_init(|| self.compute_levels())
            .as_ref()
            .map(|levels| levels.as_slice())
            .map_err(|err| err.clone())
    }

    /// Concatenation of the topological levels.
    pub fn topological_order(&self) -> CoreResult<Vec<String>> {
        Ok(self
            .topological_levels()?
            .iter()
            .flatten()
            .cloned()
            .collect())
    }

    fn compute_levels(&self) -> CoreResult<Vec<Vec<String>>> {
        let dependencies = self.dependencies();
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (key, upstream) in dependencies {
            in_degree.entry(key.as_str()).or_insert(0);
            for up in upstream {
                *in_degree.entry(key.as_str()).or_insert(0) += 1;
                dependents.entry(up.as_str()).or_default().push(key.as_str());
            }
        }

        // Kahn's algorithm, peeled one level at a time. BTreeMap iteration
        // keeps each level lexicographic without an explicit sort of roots.
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(key, _)| *key)
            .collect();
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut resolved = 0usize;
        while !ready.is_empty() {
            resolved += ready.len();
            let mut next: Vec<&str> = Vec::new();
            for key in &ready {
                if let Some(children) = dependents.get(key) {
                    for child in children {
                        if let Some(degree) = in_degree.get_mut(child) {
                            *degree -= 1;
                            if *degree == 0 {
                                next.push(child);
                            }
                        }
                    }
                }
            }
            next.sort_unstable();
            levels.push(ready.iter().map(|key| key.to_string()).collect());
            ready = next;
        }

        if resolved != in_degree.len() {
            let remaining: Vec<String> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(key, _)| key.to_string())
                .collect();
            return Err(CoreError::CycleDetected { remaining });
        }
        Ok(levels)
    }
}
