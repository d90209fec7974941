//! Fixed-rate garbage-collection loop.
//!
//! Each cycle re-lists the namespace, samples every tracked workload on a
//! bounded pool, joins, then runs the decision pass sequentially on the
//! control task. Baselines live in the shared [`ActivityStore`]; timers,
//! shell states and membership are owned here. The only archive write the
//! control task waits for is the audit record ahead of a delete.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::{ActivityStore, ClassificationResult, Classifier, WorkloadSummary};
use crate::archive::{
    Archive, ArchiveHandle, ArchiveWriter, Deletion, SnapshotRow, DISAPPEARED_REASON,
};
use crate::clock::{Clock, FixedRateSchedule, Pacing};
use crate::config::{Config, SamplingConfig};
use crate::decision::{policy, DecisionEngine, EvictionVerdict, Trigger};
use crate::export::health::HealthMetrics;
use crate::orchestrator::{Orchestrator, WorkloadId, WorkloadRef};
use crate::proc::remote::collect_snapshot;
use crate::proc::ProcessSnapshot;
use crate::shell::{self, ShellIdleDetector};

/// Outcome of the shell history read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryRead {
    /// `None` means the artifact does not exist.
    Observed(Option<DateTime<Utc>>),
    /// The read failed; the shell signal is absent this cycle.
    Failed,
}

/// One successfully sampled and classified workload.
#[derive(Debug)]
struct Sampled {
    observed_at: DateTime<Utc>,
    snapshots: Vec<ProcessSnapshot>,
    results: Vec<ClassificationResult>,
    history: HistoryRead,
}

/// Everything a sampling task needs, shared across tasks.
struct Sampler<O> {
    orchestrator: Arc<O>,
    store: Arc<ActivityStore>,
    classifier: Classifier,
    clock: Arc<dyn Clock>,
    sampling: SamplingConfig,
    health: Option<Arc<HealthMetrics>>,
}

impl<O: Orchestrator> Sampler<O> {
    /// Reads the process table and shell history, then classifies.
    ///
    /// Only the remote reads are under the sampling timeout. Classification
    /// and the baseline commit run after every read has returned and never
    /// suspend, so a timed-out sample leaves the baselines untouched.
    async fn sample(&self, workload: &WorkloadId) -> Result<Sampled> {
        let reads = async {
            let snapshots =
                collect_snapshot(&*self.orchestrator, workload, self.sampling.resolve_cmdline)
                    .await?;

            let history = match shell::read_history_mtime(
                &*self.orchestrator,
                workload,
                &self.sampling.shell_history_path,
            )
            .await
            {
                Ok(mtime) => HistoryRead::Observed(mtime),
                Err(e) => {
                    warn!(workload = %workload, error = %e, "shell history read failed");
                    if let Some(health) = &self.health {
                        health.sample_failures.with_label_values(&["shell"]).inc();
                    }
                    HistoryRead::Failed
                }
            };

            Ok::<_, anyhow::Error>((snapshots, history))
        };

        let (snapshots, history) = tokio::time::timeout(self.sampling.timeout, reads)
            .await
            .map_err(|_| anyhow!("sampling timed out after {:?}", self.sampling.timeout))??;

        let observed_at = self.clock.now();
        let results =
            self.classifier
                .classify_workload(&self.store, workload, &snapshots, observed_at);

        Ok(Sampled {
            observed_at,
            snapshots,
            results,
            history,
        })
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Workloads listed after exclusion.
    pub listed: usize,
    pub sampled: usize,
    pub failed: usize,
    /// Listed but not running, so not sampled.
    pub skipped: usize,
    /// Evicted workloads with their trigger (also filled in dry-run mode).
    pub evicted: Vec<(WorkloadId, Trigger)>,
    pub disappeared: Vec<WorkloadId>,
    /// Listing failed and the cycle was aborted.
    pub listing_failed: bool,
}

/// The control task state.
pub struct Poller<O> {
    cfg: Config,
    orchestrator: Arc<O>,
    archive: ArchiveWriter,
    store: Arc<ActivityStore>,
    sampler: Arc<Sampler<O>>,
    decisions: DecisionEngine,
    shell: ShellIdleDetector,
    clock: Arc<dyn Clock>,
    health: Option<Arc<HealthMetrics>>,
    tracked: HashMap<WorkloadId, WorkloadRef>,
    /// Names we evicted that the orchestrator may still list (terminating),
    /// keyed to the creation time of the evicted incarnation.
    evicted: HashMap<WorkloadId, DateTime<Utc>>,
}

impl<O: Orchestrator> Poller<O> {
    /// Spawns the archive writer, so it must be called within a Tokio
    /// runtime.
    pub fn new<A: Archive>(
        cfg: Config,
        orchestrator: Arc<O>,
        archive: ArchiveHandle<A>,
        clock: Arc<dyn Clock>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let store = Arc::new(ActivityStore::new());
        let sampler = Arc::new(Sampler {
            orchestrator: Arc::clone(&orchestrator),
            store: Arc::clone(&store),
            classifier: Classifier::new(cfg.classifier, cfg.interval),
            clock: Arc::clone(&clock),
            sampling: cfg.sampling.clone(),
            health: health.clone(),
        });

        let archive = ArchiveWriter::spawn(archive, &cfg.archive, health.clone());

        Self {
            decisions: DecisionEngine::new(cfg.policy.inactive_duration),
            shell: ShellIdleDetector::new(cfg.policy.shell_idle_threshold),
            cfg,
            orchestrator,
            archive,
            store,
            sampler,
            clock,
            health,
            tracked: HashMap::new(),
            evicted: HashMap::new(),
        }
    }

    pub fn store(&self) -> &ActivityStore {
        &self.store
    }

    pub fn decisions(&self) -> &DecisionEngine {
        &self.decisions
    }

    pub fn shell(&self) -> &ShellIdleDetector {
        &self.shell
    }

    pub fn is_tracked(&self, workload: &WorkloadId) -> bool {
        self.tracked.contains_key(workload)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Waits until every archive write queued so far has been applied.
    pub async fn flush_archive(&self) -> bool {
        self.archive.flush().await
    }

    /// Runs cycles at a fixed rate until cancelled.
    ///
    /// Cancellation is observed between cycles and interrupts the sleep; a
    /// cycle in progress always finishes.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut schedule = FixedRateSchedule::new(Instant::now(), self.cfg.interval)
            .context("creating poll schedule")?;

        info!(
            namespace = %self.cfg.namespace,
            interval = ?self.cfg.interval,
            workers = self.cfg.workers,
            dry_run = self.cfg.policy.dry_run,
            "poller started"
        );

        loop {
            let started = Instant::now();
            let report = self.run_cycle().await;
            let took = started.elapsed();

            if let Some(health) = &self.health {
                health.cycles.inc();
                health.cycle_duration.observe(took.as_secs_f64());
            }
            info!(
                cycle = schedule.cycle(),
                listed = report.listed,
                sampled = report.sampled,
                failed = report.failed,
                skipped = report.skipped,
                evicted = report.evicted.len(),
                took = ?took,
                "cycle finished"
            );

            if cancel.is_cancelled() {
                break;
            }

            match schedule.finish_cycle(Instant::now()) {
                Pacing::Sleep { until, remaining } => {
                    debug!(remaining = ?remaining, "sleeping until next tick");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                Pacing::Overrun { late, skipped } => {
                    warn!(
                        late = ?late,
                        skipped,
                        "cycle overran its tick, starting next cycle immediately"
                    );
                    if let Some(health) = &self.health {
                        health.cycle_overruns.inc();
                    }
                }
            }
        }

        self.archive.close().await;
        info!("poller stopped");
        Ok(())
    }

    /// One full cycle: membership, sampling, decisions, evictions.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let listed = match self.orchestrator.list_workloads(&self.cfg.namespace).await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(namespace = %self.cfg.namespace, error = %e, "listing workloads failed, skipping cycle");
                if let Some(health) = &self.health {
                    health.list_failures.inc();
                }
                report.listing_failed = true;
                return report;
            }
        };

        let current: HashMap<WorkloadId, WorkloadRef> = listed
            .into_iter()
            .filter(|w| !self.cfg.is_excluded(&w.id.name))
            .map(|w| (w.id.clone(), w))
            .collect();
        report.listed = current.len();

        report.disappeared = self.update_membership(&current);

        let mut ids = Vec::with_capacity(self.tracked.len());
        for workload in self.tracked.values() {
            if workload.phase.is_sampleable() {
                ids.push(workload.id.clone());
            } else {
                debug!(
                    workload = %workload.id,
                    phase = %workload.phase,
                    "workload not running, skipping sample"
                );
                report.skipped += 1;
            }
        }
        ids.sort();
        let outcomes = self.sample_all(ids).await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(sampled) => {
                    report.sampled += 1;
                    if let Some(trigger) = self.evaluate(&id, sampled).await {
                        report.evicted.push((id, trigger));
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(workload = %id, error = %e, "sampling failed, skipping workload this cycle");
                    if let Some(health) = &self.health {
                        health.sample_failures.with_label_values(&["process"]).inc();
                    }
                }
            }
        }

        if let Some(health) = &self.health {
            health.workloads_tracked.set(self.tracked.len() as f64);
        }

        report
    }

    /// Applies a fresh listing to the tracked set. Returns the workloads that
    /// disappeared since the last cycle. Any listed phase counts as present.
    fn update_membership(
        &mut self,
        current: &HashMap<WorkloadId, WorkloadRef>,
    ) -> Vec<WorkloadId> {
        // Forget evictions once the orchestrator no longer lists that
        // incarnation.
        self.evicted
            .retain(|id, created_at| current.get(id).is_some_and(|w| w.created_at == *created_at));

        // A name listed with a different creation time is a new incarnation.
        let mut gone: Vec<WorkloadRef> = self
            .tracked
            .values()
            .filter(|w| {
                current
                    .get(&w.id)
                    .map_or(true, |listed| listed.created_at != w.created_at)
            })
            .cloned()
            .collect();
        gone.sort_by(|a, b| a.id.cmp(&b.id));

        let now = self.clock.now();
        let mut disappeared = Vec::with_capacity(gone.len());
        for workload in gone {
            self.record_disappeared(&workload.id, now);
            disappeared.push(workload.id);
        }

        for (id, tracked) in self.tracked.iter_mut() {
            if let Some(listed) = current.get(id) {
                tracked.phase = listed.phase;
            }
        }

        let mut fresh: Vec<&WorkloadRef> = current
            .values()
            .filter(|w| !self.tracked.contains_key(&w.id) && !self.evicted.contains_key(&w.id))
            .collect();
        fresh.sort_by(|a, b| a.id.cmp(&b.id));
        for workload in fresh {
            self.track(workload.clone());
        }

        disappeared
    }

    /// Starts tracking a workload. The writer opens a lifecycle record
    /// unless the archive already holds an open one for this name.
    fn track(&mut self, workload: WorkloadRef) {
        self.archive.track(&workload);
        info!(
            workload = %workload.id,
            created_at = %workload.created_at,
            phase = %workload.phase,
            "tracking workload"
        );
        self.tracked.insert(workload.id.clone(), workload);
    }

    /// Finalizes a workload that vanished without us evicting it.
    fn record_disappeared(&mut self, workload: &WorkloadId, now: DateTime<Utc>) {
        let deletion = Deletion {
            deleted_at: now,
            reason: DISAPPEARED_REASON.to_string(),
            shell_idle: false,
        };
        self.archive.record_disappeared(workload, deletion);

        info!(workload = %workload, "workload disappeared");
        if let Some(health) = &self.health {
            health.workloads_disappeared.inc();
        }
        self.forget(workload);
    }

    fn forget(&mut self, workload: &WorkloadId) {
        self.tracked.remove(workload);
        self.store.remove(workload);
        self.decisions.forget(workload);
        self.shell.forget(workload);
    }

    /// Samples all workloads on at most `workers` concurrent tasks and
    /// waits for every one of them. Results are ordered by workload.
    async fn sample_all(&self, ids: Vec<WorkloadId>) -> Vec<(WorkloadId, Result<Sampled>)> {
        let semaphore = Arc::new(Semaphore::new(self.cfg.workers.max(1)));
        let mut in_flight = JoinSet::new();

        for id in ids {
            let sampler = Arc::clone(&self.sampler);
            let semaphore = Arc::clone(&semaphore);

            in_flight.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (id, Err(anyhow!("sampling pool closed: {e}"))),
                };

                let started = Instant::now();
                let outcome = sampler.sample(&id).await;
                if let Some(health) = &sampler.health {
                    health.sample_duration.observe(started.elapsed().as_secs_f64());
                }

                (id, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(in_flight.len());
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "sampling task failed to complete"),
            }
        }

        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// Decision pass for one sampled workload. Returns the trigger when the
    /// workload was evicted.
    async fn evaluate(&mut self, id: &WorkloadId, sampled: Sampled) -> Option<Trigger> {
        let workload = self.tracked.get(id)?.clone();
        let now = sampled.observed_at;

        if let Some(health) = &self.health {
            for r in &sampled.results {
                health
                    .classifications
                    .with_label_values(&[r.classification.kind()])
                    .inc();
            }
        }

        let decision = self.decisions.decide(id, &sampled.results, now);

        let shell_check = match sampled.history {
            HistoryRead::Observed(mtime) => Some(self.shell.check(&workload, mtime, now)),
            HistoryRead::Failed => None,
        };
        if let Some(ts) = shell_check
            .filter(|c| c.changed)
            .and_then(|c| c.last_modified)
        {
            self.archive.save_shell_history(id, ts);
        }

        self.archive.save_snapshots(SnapshotRow::build(
            id,
            now,
            &sampled.snapshots,
            &sampled.results,
        ));

        let Some(verdict) = policy::evaluate(shell_check.as_ref(), &decision) else {
            debug!(
                workload = %id,
                summary = %decision.summary,
                reason = %decision.reason,
                shell_idle = ?shell_check.map(|c| c.idle),
                "retaining workload"
            );
            return None;
        };

        self.evict(&workload, verdict, decision.summary, now)
            .await
    }

    /// Records the deletion, then deletes. A failed delete reopens the
    /// lifecycle record and keeps the workload tracked so it is reconsidered
    /// next cycle.
    async fn evict(
        &mut self,
        workload: &WorkloadRef,
        verdict: EvictionVerdict,
        summary: WorkloadSummary,
        now: DateTime<Utc>,
    ) -> Option<Trigger> {
        let id = &workload.id;
        info!(
            workload = %id,
            trigger = %verdict.trigger,
            reason = %verdict.reason,
            summary = %summary,
            "evicting workload"
        );

        let deletion = Deletion {
            deleted_at: now,
            reason: verdict.reason.clone(),
            shell_idle: verdict.trigger.includes_shell(),
        };
        if !self.archive.record_deleted(id, deletion).await {
            warn!(workload = %id, "deletion not confirmed by the archive, deleting anyway");
        }

        if self.cfg.policy.dry_run {
            info!(workload = %id, "dry run, delete skipped");
        } else if let Err(e) = self.orchestrator.delete_workload(id).await {
            warn!(workload = %id, error = %e, "deleting workload failed, retrying next cycle");
            self.archive.reopen(id);
            if let Some(health) = &self.health {
                health.eviction_failures.inc();
            }
            return None;
        }

        if let Some(health) = &self.health {
            health
                .evictions
                .with_label_values(&[verdict.trigger.as_str()])
                .inc();
        }
        self.forget(id);
        self.evicted.insert(id.clone(), workload.created_at);

        Some(verdict.trigger)
    }
}
