use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Archive, Deletion, SnapshotRow};
use crate::orchestrator::{WorkloadId, WorkloadRef};

/// One incarnation of a workload name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRecord {
    pub created_at: DateTime<Utc>,
    pub deletion: Option<Deletion>,
}

#[derive(Debug, Default)]
struct State {
    lifecycles: HashMap<WorkloadId, Vec<LifecycleRecord>>,
    shell_history: HashMap<WorkloadId, DateTime<Utc>>,
    snapshot_rows: HashMap<WorkloadId, usize>,
}

/// Archive kept in process memory. Used when ClickHouse is disabled and in
/// tests.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    state: Mutex<State>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// All lifecycle records of a workload name, oldest first.
    pub fn lifecycles(&self, workload: &WorkloadId) -> Vec<LifecycleRecord> {
        self.state
            .lock()
            .lifecycles
            .get(workload)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of snapshot rows stored for a workload.
    pub fn snapshot_rows(&self, workload: &WorkloadId) -> usize {
        self.state
            .lock()
            .snapshot_rows
            .get(workload)
            .copied()
            .unwrap_or(0)
    }
}

impl Archive for MemoryArchive {
    fn name(&self) -> &str {
        "memory"
    }

    async fn is_workload_known(&self, workload: &WorkloadId) -> Result<bool> {
        Ok(self.state.lock().lifecycles.contains_key(workload))
    }

    async fn is_workload_deleted(&self, workload: &WorkloadId) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .lifecycles
            .get(workload)
            .and_then(|records| records.last())
            .is_some_and(|r| r.deletion.is_some()))
    }

    async fn record_created(&self, workload: &WorkloadRef) -> Result<()> {
        self.state
            .lock()
            .lifecycles
            .entry(workload.id.clone())
            .or_default()
            .push(LifecycleRecord {
                created_at: workload.created_at,
                deletion: None,
            });
        Ok(())
    }

    async fn record_deleted(&self, workload: &WorkloadId, deletion: &Deletion) -> Result<()> {
        let mut state = self.state.lock();
        let records = state.lifecycles.entry(workload.clone()).or_default();
        match records.last_mut() {
            // A repeated deletion replaces the earlier one, as in the
            // ReplacingMergeTree table.
            Some(latest) => latest.deletion = Some(deletion.clone()),
            None => records.push(LifecycleRecord {
                created_at: deletion.deleted_at,
                deletion: Some(deletion.clone()),
            }),
        }
        Ok(())
    }

    async fn reopen(&self, workload: &WorkloadId) -> Result<()> {
        if let Some(latest) = self
            .state
            .lock()
            .lifecycles
            .get_mut(workload)
            .and_then(|records| records.last_mut())
        {
            latest.deletion = None;
        }
        Ok(())
    }

    async fn save_snapshots(&self, rows: &[SnapshotRow]) -> Result<()> {
        let mut state = self.state.lock();
        for row in rows {
            *state.snapshot_rows.entry(row.workload.clone()).or_default() += 1;
        }
        Ok(())
    }

    async fn save_shell_history(
        &self,
        workload: &WorkloadId,
        last_modified: DateTime<Utc>,
    ) -> Result<()> {
        self.state
            .lock()
            .shell_history
            .insert(workload.clone(), last_modified);
        Ok(())
    }

    async fn last_shell_history(&self, workload: &WorkloadId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().shell_history.get(workload).copied())
    }
}
