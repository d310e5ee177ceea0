//! Stable addressing for job definitions across processes.
//!
//! An origin records where a definition lives (repository location,
//! repository name, job name). Its id is a SHA-256 digest of that content,
//! so two processes looking at the same definition derive the same id
//! without sharing a database.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-derived identity for an origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OriginId(pub String);

impl OriginId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn digest_parts(parts: &[&str]) -> OriginId {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        // NUL keeps ("ab","c") and ("a","bc") from colliding
        hasher.update([0u8]);
    }
    OriginId(format!("{:x}", hasher.finalize()))
}

/// Where a repository of definitions is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryOrigin {
    pub location_name: String,
    pub repository_name: String,
}

impl RepositoryOrigin {
    pub fn new(location_name: impl Into<String>, repository_name: impl Into<String>) -> Self {
        Self {
            location_name: location_name.into(),
            repository_name: repository_name.into(),
        }
    }

    pub fn id(&self) -> OriginId {
        digest_parts(&[&self.location_name, &self.repository_name])
    }
}

/// A schedule, sensor, or partition set within a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobOrigin {
    pub repository: RepositoryOrigin,
    pub job_name: String,
}

impl JobOrigin {
    pub fn new(repository: RepositoryOrigin, job_name: impl Into<String>) -> Self {
        Self {
            repository,
            job_name: job_name.into(),
        }
    }

    pub fn id(&self) -> OriginId {
        digest_parts(&[
            &self.repository.location_name,
            &self.repository.repository_name,
            &self.job_name,
        ])
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn repository_id(&self) -> OriginId {
        self.repository.id()
    }
}
