//! Persistence of snapshots, workload lifecycles and shell history.
//!
//! The poller never sees archive errors: every call goes through
//! [`ArchiveHandle`], which bounds it with a timeout, logs failures and
//! counts them in the health metrics. The poller reaches the handle through
//! the queued [`ArchiveWriter`].

pub mod clickhouse;
pub mod memory;
pub mod writer;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::activity::ClassificationResult;
use crate::export::health::HealthMetrics;
use crate::orchestrator::{WorkloadId, WorkloadRef};
use crate::proc::ProcessSnapshot;

pub use self::clickhouse::ClickHouseArchive;
pub use memory::MemoryArchive;
pub use writer::ArchiveWriter;

/// Deletion reason recorded for workloads that vanished without us.
pub const DISAPPEARED_REASON: &str = "UNKNOWN - disappeared externally";

/// Finalization of a workload lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub deleted_at: DateTime<Utc>,
    pub reason: String,
    /// The shell-history signal contributed to the eviction.
    pub shell_idle: bool,
}

/// One process observation with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub observed_at: DateTime<Utc>,
    pub workload: WorkloadId,
    pub process: ProcessSnapshot,
    pub kind: &'static str,
    pub reason: &'static str,
    pub cpu_delta_ticks: u64,
}

impl SnapshotRow {
    /// Pairs snapshots with their classifications by pid.
    pub fn build(
        workload: &WorkloadId,
        observed_at: DateTime<Utc>,
        snapshots: &[ProcessSnapshot],
        results: &[ClassificationResult],
    ) -> Vec<Self> {
        snapshots
            .iter()
            .zip(results)
            .filter(|(s, r)| s.pid == r.pid)
            .map(|(s, r)| Self {
                observed_at,
                workload: workload.clone(),
                process: s.clone(),
                kind: r.classification.kind(),
                reason: r.classification.reason_code(),
                cpu_delta_ticks: r.deltas.map_or(0, |d| d.cpu_ticks),
            })
            .collect()
    }
}

/// Persistence collaborator.
pub trait Archive: Send + Sync + 'static {
    /// Returns the backend's name for logging.
    fn name(&self) -> &str;

    /// Any lifecycle record exists for this workload name.
    fn is_workload_known(&self, workload: &WorkloadId)
        -> impl Future<Output = Result<bool>> + Send;

    /// The latest lifecycle record for this name is finalized.
    fn is_workload_deleted(
        &self,
        workload: &WorkloadId,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Opens a new lifecycle record.
    fn record_created(&self, workload: &WorkloadRef) -> impl Future<Output = Result<()>> + Send;

    /// Finalizes the latest lifecycle record.
    fn record_deleted(
        &self,
        workload: &WorkloadId,
        deletion: &Deletion,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Clears the finalization of the latest lifecycle record, used when the
    /// recorded delete never happened. A no-op for unknown names.
    fn reopen(&self, workload: &WorkloadId) -> impl Future<Output = Result<()>> + Send;

    fn save_snapshots(&self, rows: &[SnapshotRow]) -> impl Future<Output = Result<()>> + Send;

    fn save_shell_history(
        &self,
        workload: &WorkloadId,
        last_modified: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Last persisted shell-history mtime, if any.
    fn last_shell_history(
        &self,
        workload: &WorkloadId,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;
}

/// Timeout-bounded, error-swallowing access to an [`Archive`].
pub struct ArchiveHandle<A> {
    inner: Arc<A>,
    timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl<A> Clone for ArchiveHandle<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            timeout: self.timeout,
            health: self.health.clone(),
        }
    }
}

impl<A: Archive> ArchiveHandle<A> {
    pub fn new(inner: Arc<A>, timeout: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            inner,
            timeout,
            health,
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    async fn guarded<T>(
        &self,
        op: &'static str,
        workload: Option<&WorkloadId>,
        fut: impl Future<Output = Result<T>>,
    ) -> Option<T> {
        let outcome = tokio::time::timeout(self.timeout, fut).await;
        let err = match outcome {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => e,
            Err(_) => anyhow::anyhow!("timed out after {:?}", self.timeout),
        };

        match workload {
            Some(w) => warn!(
                archive = self.inner.name(),
                op,
                workload = %w,
                error = %err,
                "archive call failed"
            ),
            None => warn!(archive = self.inner.name(), op, error = %err, "archive call failed"),
        }
        if let Some(health) = &self.health {
            health.archive_errors.with_label_values(&[op]).inc();
        }

        None
    }

    /// `None` when the archive could not answer.
    pub async fn is_workload_known(&self, workload: &WorkloadId) -> Option<bool> {
        self.guarded(
            "is_workload_known",
            Some(workload),
            self.inner.is_workload_known(workload),
        )
        .await
    }

    pub async fn is_workload_deleted(&self, workload: &WorkloadId) -> Option<bool> {
        self.guarded(
            "is_workload_deleted",
            Some(workload),
            self.inner.is_workload_deleted(workload),
        )
        .await
    }

    pub async fn record_created(&self, workload: &WorkloadRef) -> bool {
        self.guarded(
            "record_created",
            Some(&workload.id),
            self.inner.record_created(workload),
        )
        .await
        .is_some()
    }

    pub async fn record_deleted(&self, workload: &WorkloadId, deletion: &Deletion) -> bool {
        self.guarded(
            "record_deleted",
            Some(workload),
            self.inner.record_deleted(workload, deletion),
        )
        .await
        .is_some()
    }

    pub async fn reopen(&self, workload: &WorkloadId) -> bool {
        self.guarded("reopen", Some(workload), self.inner.reopen(workload))
            .await
            .is_some()
    }

    pub async fn save_snapshots(&self, rows: &[SnapshotRow]) -> bool {
        if rows.is_empty() {
            return true;
        }
        self.guarded("save_snapshots", None, self.inner.save_snapshots(rows))
            .await
            .is_some()
    }

    pub async fn save_shell_history(
        &self,
        workload: &WorkloadId,
        last_modified: DateTime<Utc>,
    ) -> bool {
        self.guarded(
            "save_shell_history",
            Some(workload),
            self.inner.save_shell_history(workload, last_modified),
        )
        .await
        .is_some()
    }

    pub async fn last_shell_history(&self, workload: &WorkloadId) -> Option<DateTime<Utc>> {
        self.guarded(
            "last_shell_history",
            Some(workload),
            self.inner.last_shell_history(workload),
        )
        .await
        .flatten()
    }
}
