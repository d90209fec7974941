pub mod kubectl;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use kubectl::KubectlClient;

/// Stable identity of a workload: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadId {
    pub namespace: String,
    pub name: String,
}

impl WorkloadId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle phase reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The orchestrator lost contact with the workload's node.
    Unknown,
}

impl WorkloadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }

    /// Only running workloads can be exec'd into.
    pub fn is_sampleable(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workload as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub id: WorkloadId,
    pub created_at: DateTime<Utc>,
    pub phase: WorkloadPhase,
}

impl WorkloadRef {
    pub fn running(id: WorkloadId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            phase: WorkloadPhase::Running,
        }
    }
}

/// Failure of a remote command inside a workload.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("spawning exec for {workload}: {source}")]
    Spawn {
        workload: WorkloadId,
        #[source]
        source: std::io::Error,
    },

    #[error("exec in {workload} timed out after {timeout:?}")]
    Timeout {
        workload: WorkloadId,
        timeout: Duration,
    },

    #[error("exec in {workload} exited with {code:?}: {stderr}")]
    NonZeroExit {
        workload: WorkloadId,
        code: Option<i32>,
        stderr: String,
    },

    #[error("exec output from {workload} is not valid UTF-8")]
    InvalidUtf8 { workload: WorkloadId },
}

/// The container orchestrator the garbage collector drives.
///
/// Implementations do not retry; a failed call is reported and the caller
/// reconsiders the workload on the next cycle.
pub trait Orchestrator: Send + Sync + 'static {
    /// Lists every workload in a namespace with its phase. A workload absent
    /// from the listing no longer exists.
    fn list_workloads(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<WorkloadRef>>> + Send;

    /// Runs a shell script inside the workload and returns its stdout.
    fn exec(
        &self,
        workload: &WorkloadId,
        script: &str,
    ) -> impl Future<Output = std::result::Result<String, ExecError>> + Send;

    /// Requests deletion of the workload.
    fn delete_workload(&self, workload: &WorkloadId) -> impl Future<Output = Result<()>> + Send;
}
