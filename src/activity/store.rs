use std::collections::HashMap;

use dashmap::DashMap;

use super::ActivityBaseline;
use crate::orchestrator::WorkloadId;

/// Baselines of one workload, keyed by pid.
pub type BaselineTable = HashMap<u32, ActivityBaseline>;

/// Workload-keyed baseline tables.
///
/// Sharded so that concurrent sampling tasks for different workloads never
/// contend. Each workload's table is replaced wholesale on commit.
#[derive(Debug, Default)]
pub struct ActivityStore {
    tables: DashMap<WorkloadId, BaselineTable>,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against the workload's current table, if any.
    ///
    /// The shard lock is held only for the duration of `f`; `f` must not
    /// call back into the store.
    pub fn with_baselines<R>(
        &self,
        workload: &WorkloadId,
        f: impl FnOnce(Option<&BaselineTable>) -> R,
    ) -> R {
        match self.tables.get(workload) {
            Some(table) => f(Some(table.value())),
            None => f(None),
        }
    }

    /// Replaces the workload's table with this cycle's baselines.
    pub fn commit(&self, workload: &WorkloadId, table: BaselineTable) {
        self.tables.insert(workload.clone(), table);
    }

    /// Returns a copy of one pid's baseline.
    pub fn baseline(&self, workload: &WorkloadId, pid: u32) -> Option<ActivityBaseline> {
        self.tables
            .get(workload)
            .and_then(|table| table.get(&pid).copied())
    }

    /// Drops all state of a workload that is gone.
    pub fn remove(&self, workload: &WorkloadId) -> bool {
        self.tables.remove(workload).is_some()
    }

    pub fn contains(&self, workload: &WorkloadId) -> bool {
        self.tables.contains_key(workload)
    }

    /// Number of workloads with a committed table.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
