//! Background archive writer.
//!
//! The control task only awaits the pre-delete audit record. Every other
//! write is queued on a bounded channel and applied in order by one task, so
//! a slow or hung archive never stretches a cycle. A full queue drops the
//! write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Archive, ArchiveHandle, Deletion, SnapshotRow};
use crate::config::ArchiveConfig;
use crate::export::health::HealthMetrics;
use crate::orchestrator::{WorkloadId, WorkloadRef};

enum WriteOp {
    /// Opens a lifecycle record unless an open one already exists.
    Track(WorkloadRef),
    /// Finalizes the lifecycle unless a deletion is already recorded.
    Disappeared(WorkloadId, Deletion),
    Evicting {
        workload: WorkloadId,
        deletion: Deletion,
        done: oneshot::Sender<bool>,
    },
    Reopen(WorkloadId),
    Snapshots(Vec<SnapshotRow>),
    ShellHistory(WorkloadId, DateTime<Utc>),
    Flush(oneshot::Sender<()>),
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Track(_) => "record_created",
            Self::Disappeared(..) | Self::Evicting { .. } => "record_deleted",
            Self::Reopen(_) => "reopen",
            Self::Snapshots(_) => "save_snapshots",
            Self::ShellHistory(..) => "save_shell_history",
            Self::Flush(_) => "flush",
        }
    }
}

/// Queue in front of an [`ArchiveHandle`].
pub struct ArchiveWriter {
    tx: mpsc::Sender<WriteOp>,
    task: JoinHandle<()>,
    timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl ArchiveWriter {
    /// Spawns the writer task. Must be called within a Tokio runtime.
    pub fn spawn<A: Archive>(
        archive: ArchiveHandle<A>,
        cfg: &ArchiveConfig,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.max_queue_size.max(1));
        let task = tokio::spawn(drain(archive, rx));

        Self {
            tx,
            task,
            timeout: cfg.timeout,
            health,
        }
    }

    /// Returns false when the write was dropped.
    fn submit(&self, op: WriteOp) -> bool {
        let name = op.name();
        match self.tx.try_send(op) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(op = name, "archive queue full, dropping write");
                if let Some(health) = &self.health {
                    health.archive_errors.with_label_values(&["enqueue"]).inc();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(op = name, "archive writer stopped, dropping write");
                false
            }
        }
    }

    pub fn track(&self, workload: &WorkloadRef) -> bool {
        self.submit(WriteOp::Track(workload.clone()))
    }

    pub fn record_disappeared(&self, workload: &WorkloadId, deletion: Deletion) -> bool {
        self.submit(WriteOp::Disappeared(workload.clone(), deletion))
    }

    pub fn reopen(&self, workload: &WorkloadId) -> bool {
        self.submit(WriteOp::Reopen(workload.clone()))
    }

    pub fn save_snapshots(&self, rows: Vec<SnapshotRow>) -> bool {
        if rows.is_empty() {
            return true;
        }
        self.submit(WriteOp::Snapshots(rows))
    }

    pub fn save_shell_history(&self, workload: &WorkloadId, last_modified: DateTime<Utc>) -> bool {
        self.submit(WriteOp::ShellHistory(workload.clone(), last_modified))
    }

    /// Records an eviction and waits for it to be written, behind every
    /// write queued before it. Gives up after the archive timeout; the
    /// record is still written later if it made it into the queue.
    pub async fn record_deleted(&self, workload: &WorkloadId, deletion: Deletion) -> bool {
        let (done, written) = oneshot::channel();
        let op = WriteOp::Evicting {
            workload: workload.clone(),
            deletion,
            done,
        };

        let audit = async {
            self.tx.send(op).await.ok()?;
            written.await.ok()
        };

        match tokio::time::timeout(self.timeout, audit).await {
            Ok(Some(ok)) => ok,
            Ok(None) => {
                warn!(workload = %workload, "archive writer stopped before recording deletion");
                false
            }
            Err(_) => {
                warn!(
                    workload = %workload,
                    timeout = ?self.timeout,
                    "deletion record not confirmed in time"
                );
                false
            }
        }
    }

    /// Waits until every write queued so far has been applied.
    pub async fn flush(&self) -> bool {
        let (done, flushed) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done)).await.is_err() {
            return false;
        }
        flushed.await.is_ok()
    }

    /// Stops accepting writes and gives the queue one archive timeout to
    /// drain.
    pub async fn close(self) {
        let Self {
            tx,
            mut task,
            timeout,
            ..
        } = self;
        drop(tx);

        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!("archive writer still busy at shutdown, dropping queued writes");
            task.abort();
        }
    }
}

async fn drain<A: Archive>(archive: ArchiveHandle<A>, mut rx: mpsc::Receiver<WriteOp>) {
    // Last shell-history mtime known to be persisted, per workload.
    let mut persisted_shell: HashMap<WorkloadId, DateTime<Utc>> = HashMap::new();

    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Track(workload) => {
                let open = archive.is_workload_known(&workload.id).await == Some(true)
                    && archive.is_workload_deleted(&workload.id).await == Some(false);

                if open {
                    if let Some(mtime) = archive.last_shell_history(&workload.id).await {
                        persisted_shell.insert(workload.id.clone(), mtime);
                    }
                    debug!(workload = %workload.id, "resuming open lifecycle record");
                } else {
                    archive.record_created(&workload).await;
                }
            }
            WriteOp::Disappeared(workload, deletion) => {
                persisted_shell.remove(&workload);
                if archive.is_workload_deleted(&workload).await != Some(true) {
                    archive.record_deleted(&workload, &deletion).await;
                }
            }
            WriteOp::Evicting {
                workload,
                deletion,
                done,
            } => {
                persisted_shell.remove(&workload);
                let ok = archive.record_deleted(&workload, &deletion).await;
                let _ = done.send(ok);
            }
            WriteOp::Reopen(workload) => {
                archive.reopen(&workload).await;
            }
            WriteOp::Snapshots(rows) => {
                archive.save_snapshots(&rows).await;
            }
            WriteOp::ShellHistory(workload, mtime) => {
                if persisted_shell.get(&workload) == Some(&mtime) {
                    continue;
                }
                if archive.save_shell_history(&workload, mtime).await {
                    persisted_shell.insert(workload, mtime);
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!(archive = archive.inner().name(), "archive writer stopped");
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::archive::tests::BrokenArchive;
    use crate::archive::{MemoryArchive, DISAPPEARED_REASON};

    fn cfg(max_queue_size: usize) -> ArchiveConfig {
        ArchiveConfig {
            timeout: Duration::from_secs(5),
            max_queue_size,
            ..Default::default()
        }
    }

    fn workload() -> WorkloadRef {
        WorkloadRef::running(
            WorkloadId::new("hub", "jupyter-alice"),
            DateTime::from_timestamp(1_717_200_000, 0).unwrap_or_default(),
        )
    }

    fn deletion(reason: &str) -> Deletion {
        Deletion {
            deleted_at: DateTime::from_timestamp(1_717_300_000, 0).unwrap_or_default(),
            reason: reason.into(),
            shell_idle: false,
        }
    }

    fn memory_writer() -> (Arc<MemoryArchive>, ArchiveWriter) {
        let archive = Arc::new(MemoryArchive::new());
        let handle = ArchiveHandle::new(Arc::clone(&archive), Duration::from_secs(5), None);
        (archive, ArchiveWriter::spawn(handle, &cfg(16), None))
    }

    #[tokio::test]
    async fn test_writes_apply_in_order() {
        let (archive, writer) = memory_writer();
        let w = workload();

        assert!(writer.track(&w));
        assert!(writer.record_deleted(&w.id, deletion("inactive for 5m")).await);

        let records = archive.lifecycles(&w.id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].created_at, w.created_at);
        assert_eq!(
            records[0].deletion.as_ref().map(|d| d.reason.as_str()),
            Some("inactive for 5m")
        );
    }

    #[tokio::test]
    async fn test_open_lifecycle_is_resumed() {
        let (archive, writer) = memory_writer();
        let w = workload();

        writer.track(&w);
        writer.track(&w);
        assert!(writer.flush().await);
        assert_eq!(archive.lifecycles(&w.id).len(), 1);
    }

    #[tokio::test]
    async fn test_disappearance_keeps_recorded_eviction() {
        let (archive, writer) = memory_writer();
        let w = workload();

        writer.track(&w);
        writer.record_deleted(&w.id, deletion("inactive for 5m")).await;
        writer.record_disappeared(&w.id, deletion(DISAPPEARED_REASON));
        writer.flush().await;

        let records = archive.lifecycles(&w.id);
        assert_eq!(
            records[0].deletion.as_ref().map(|d| d.reason.as_str()),
            Some("inactive for 5m")
        );
    }

    #[tokio::test]
    async fn test_reopen_then_disappearance_records_real_outcome() {
        let (archive, writer) = memory_writer();
        let w = workload();

        writer.track(&w);
        writer.record_deleted(&w.id, deletion("inactive for 5m")).await;
        writer.reopen(&w.id);
        writer.record_disappeared(&w.id, deletion(DISAPPEARED_REASON));
        writer.flush().await;

        let records = archive.lifecycles(&w.id);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].deletion.as_ref().map(|d| d.reason.as_str()),
            Some(DISAPPEARED_REASON)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_without_waiting() {
        let handle = ArchiveHandle::new(
            Arc::new(BrokenArchive { hang: true }),
            Duration::from_secs(5),
            None,
        );
        let writer = ArchiveWriter::spawn(handle, &cfg(1), None);
        let w = workload();

        let started = Instant::now();
        assert!(writer.track(&w));
        assert!(!writer.track(&w));
        assert!(!writer.save_shell_history(&w.id, w.created_at));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_deleted_is_bounded_when_archive_hangs() {
        let handle = ArchiveHandle::new(
            Arc::new(BrokenArchive { hang: true }),
            Duration::from_secs(5),
            None,
        );
        let writer = ArchiveWriter::spawn(handle, &cfg(16), None);
        let w = workload();
        for _ in 0..10 {
            writer.track(&w);
        }

        let started = Instant::now();
        assert!(!writer.record_deleted(&w.id, deletion("inactive for 5m")).await);
        assert!(started.elapsed() <= Duration::from_secs(5));

        writer.close().await;
    }
}
