pub mod store;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::orchestrator::WorkloadId;
use crate::proc::ProcessSnapshot;

pub use store::ActivityStore;

/// Why a process was judged active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveReason {
    /// First sighting of the pid (or a reused pid).
    NoBaseline,
    /// Running or in uninterruptible sleep at sample time.
    RunningState,
    /// A cumulative counter went backwards since the baseline.
    CounterReset,
    CpuTimeHigh,
    CtxSwitchHigh,
    ResidentMemoryChanged,
    IoBytesIncreased,
    PageFaultsIncreased,
}

impl ActiveReason {
    /// Returns the stable reason code used in logs and the archive.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoBaseline => "no-baseline",
            Self::RunningState => "running-state",
            Self::CounterReset => "counter-reset",
            Self::CpuTimeHigh => "cpu-time-high",
            Self::CtxSwitchHigh => "ctx-switch-high",
            Self::ResidentMemoryChanged => "resident-memory-changed",
            Self::IoBytesIncreased => "io-bytes-increased",
            Self::PageFaultsIncreased => "page-faults-increased",
        }
    }
}

/// Why a process was judged inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InactiveReason {
    /// Zombie or dead; reported as a zombie.
    TerminalState,
    NoActivityDelta,
}

impl InactiveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TerminalState => "terminal-state",
            Self::NoActivityDelta => "no-activity-delta",
        }
    }
}

/// Verdict for one process in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Active(ActiveReason),
    Inactive(InactiveReason),
}

impl Classification {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn is_zombie(self) -> bool {
        matches!(self, Self::Inactive(InactiveReason::TerminalState))
    }

    /// Reason code of either variant.
    pub fn reason_code(self) -> &'static str {
        match self {
            Self::Active(r) => r.as_str(),
            Self::Inactive(r) => r.as_str(),
        }
    }

    /// Coarse kind: "active", "inactive" or "zombie".
    pub fn kind(self) -> &'static str {
        if self.is_active() {
            "active"
        } else if self.is_zombie() {
            "zombie"
        } else {
            "inactive"
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.reason_code())
    }
}

/// Previous cycle's cumulative counters for one pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityBaseline {
    pub cpu_ticks: u64,
    pub voluntary_ctx_switches: Option<u64>,
    pub nonvoluntary_ctx_switches: Option<u64>,
    pub resident_bytes: Option<u64>,
    pub minor_faults: u64,
    pub io_bytes: Option<u64>,
    /// Distinguishes a reused pid from the process the baseline describes.
    pub start_ticks: u64,
    pub observed_at: DateTime<Utc>,
}

impl ActivityBaseline {
    pub fn from_snapshot(snapshot: &ProcessSnapshot, observed_at: DateTime<Utc>) -> Self {
        Self {
            cpu_ticks: snapshot.cpu_ticks(),
            voluntary_ctx_switches: snapshot.extended.voluntary_ctx_switches,
            nonvoluntary_ctx_switches: snapshot.extended.nonvoluntary_ctx_switches,
            resident_bytes: snapshot.extended.resident_bytes,
            minor_faults: snapshot.minor_faults,
            io_bytes: snapshot.extended.io_bytes(),
            start_ticks: snapshot.start_ticks,
            observed_at,
        }
    }
}

/// Counter changes between a baseline and the current snapshot.
///
/// Decreasing counters clamp to zero and set `rolled_back`. Optional deltas
/// are `None` unless both sides reported the metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deltas {
    pub cpu_ticks: u64,
    pub voluntary_ctx_switches: Option<u64>,
    pub nonvoluntary_ctx_switches: Option<u64>,
    pub resident_bytes: Option<i64>,
    pub minor_faults: u64,
    pub io_bytes: Option<u64>,
    pub elapsed: Duration,
    pub rolled_back: bool,
}

impl Deltas {
    pub fn between(base: &ActivityBaseline, current: &ProcessSnapshot, elapsed: Duration) -> Self {
        let mut rolled_back = false;
        let mut counter = |prev: u64, now: u64| -> u64 {
            if now < prev {
                rolled_back = true;
            }
            now.saturating_sub(prev)
        };

        let cpu_ticks = counter(base.cpu_ticks, current.cpu_ticks());
        let minor_faults = counter(base.minor_faults, current.minor_faults);
        let voluntary = base
            .voluntary_ctx_switches
            .zip(current.extended.voluntary_ctx_switches)
            .map(|(p, n)| counter(p, n));
        let nonvoluntary = base
            .nonvoluntary_ctx_switches
            .zip(current.extended.nonvoluntary_ctx_switches)
            .map(|(p, n)| counter(p, n));
        let io_bytes = base
            .io_bytes
            .zip(current.extended.io_bytes())
            .map(|(p, n)| counter(p, n));

        let resident_bytes = base
            .resident_bytes
            .zip(current.extended.resident_bytes)
            .map(|(p, n)| (n as i128 - p as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64);

        Self {
            cpu_ticks,
            voluntary_ctx_switches: voluntary,
            nonvoluntary_ctx_switches: nonvoluntary,
            resident_bytes,
            minor_faults,
            io_bytes,
            elapsed,
            rolled_back,
        }
    }
}

/// Result of classifying one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub pid: u32,
    pub command: String,
    pub classification: Classification,
    /// `None` when no usable baseline existed.
    pub deltas: Option<Deltas>,
}

/// Per-workload counts for one cycle. `inactive` excludes zombies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadSummary {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub zombie: usize,
}

impl WorkloadSummary {
    pub fn from_results(results: &[ClassificationResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for r in results {
            if r.classification.is_active() {
                summary.active += 1;
            } else if r.classification.is_zombie() {
                summary.zombie += 1;
            } else {
                summary.inactive += 1;
            }
        }
        summary
    }
}

impl fmt::Display for WorkloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} active, {} inactive, {} zombie",
            self.total, self.active, self.inactive, self.zombie
        )
    }
}

/// Classifies processes from counter deltas.
#[derive(Debug, Clone)]
pub struct Classifier {
    thresholds: ClassifierConfig,
    interval: Duration,
}

impl Classifier {
    /// `interval` is the polling interval the thresholds are expressed in.
    pub fn new(thresholds: ClassifierConfig, interval: Duration) -> Self {
        Self {
            thresholds,
            interval,
        }
    }

    /// Converts clock ticks to seconds at the configured tick rate.
    pub fn ticks_to_secs(&self, ticks: u64) -> f64 {
        ticks as f64 / self.thresholds.ticks_per_second.max(1) as f64
    }

    /// Classify one process against its (old) baseline. First match wins.
    pub fn classify(
        &self,
        snapshot: &ProcessSnapshot,
        baseline: Option<&ActivityBaseline>,
        elapsed: Duration,
    ) -> ClassificationResult {
        let result = |classification: Classification, deltas: Option<Deltas>| ClassificationResult {
            pid: snapshot.pid,
            command: snapshot.command.clone(),
            classification,
            deltas,
        };

        if snapshot.state.is_terminal() {
            return result(Classification::Inactive(InactiveReason::TerminalState), None);
        }

        let Some(base) = baseline.filter(|b| b.start_ticks == snapshot.start_ticks) else {
            return result(Classification::Active(ActiveReason::NoBaseline), None);
        };

        let deltas = Deltas::between(base, snapshot, elapsed);
        result(self.judge(snapshot, &deltas), Some(deltas))
    }

    fn judge(&self, snapshot: &ProcessSnapshot, d: &Deltas) -> Classification {
        use ActiveReason::*;

        if snapshot.state.is_busy() {
            return Classification::Active(RunningState);
        }
        if d.rolled_back {
            return Classification::Active(CounterReset);
        }
        if self.meets(d.cpu_ticks, self.thresholds.cpu_time_delta_threshold, d.elapsed) {
            return Classification::Active(CpuTimeHigh);
        }

        let voluntary = d
            .voluntary_ctx_switches
            .is_some_and(|v| self.meets(v, self.thresholds.voluntary_ctx_threshold, d.elapsed));
        let nonvoluntary = d
            .nonvoluntary_ctx_switches
            .is_some_and(|v| self.meets(v, self.thresholds.nonvoluntary_ctx_threshold, d.elapsed));
        if voluntary || nonvoluntary {
            return Classification::Active(CtxSwitchHigh);
        }

        if d.resident_bytes.is_some_and(|r| r != 0) {
            return Classification::Active(ResidentMemoryChanged);
        }
        if d.io_bytes.is_some_and(|io| io > 0) {
            return Classification::Active(IoBytesIncreased);
        }
        if d.minor_faults > 0 {
            return Classification::Active(PageFaultsIncreased);
        }

        Classification::Inactive(InactiveReason::NoActivityDelta)
    }

    /// Rate threshold check, normalized to one interval when the real
    /// elapsed time is longer (e.g. after a skipped cycle).
    fn meets(&self, delta: u64, threshold: u64, elapsed: Duration) -> bool {
        if elapsed <= self.interval {
            return delta >= threshold;
        }
        u128::from(delta) * self.interval.as_millis() >= u128::from(threshold) * elapsed.as_millis()
    }

    /// Classify every process of a workload against the old baselines, then
    /// replace the workload's baselines with this cycle's counters.
    ///
    /// Runs without suspension points, so the commit cannot be interrupted
    /// halfway.
    pub fn classify_workload(
        &self,
        store: &ActivityStore,
        workload: &WorkloadId,
        snapshots: &[ProcessSnapshot],
        observed_at: DateTime<Utc>,
    ) -> Vec<ClassificationResult> {
        let results = store.with_baselines(workload, |old| {
            snapshots
                .iter()
                .map(|snap| {
                    let base = old.and_then(|m| m.get(&snap.pid));
                    let elapsed = base
                        .and_then(|b| (observed_at - b.observed_at).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    self.classify(snap, base, elapsed)
                })
                .collect::<Vec<_>>()
        });

        store.commit(
            workload,
            snapshots
                .iter()
                .map(|s| (s.pid, ActivityBaseline::from_snapshot(s, observed_at)))
                .collect(),
        );

        for r in &results {
            debug!(
                workload = %workload,
                pid = r.pid,
                command = %r.command,
                classification = %r.classification,
                cpu_secs = ?r.deltas.map(|d| self.ticks_to_secs(d.cpu_ticks)),
                "classified process"
            );
        }

        results
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::proc::{ExtendedMetrics, ProcessState, SchedPolicy};

    pub(crate) fn snapshot(pid: u32, state: ProcessState) -> ProcessSnapshot {
        ProcessSnapshot {
            pid,
            command: format!("proc-{pid}"),
            state,
            parent_pid: 1,
            user_ticks: 1000,
            system_ticks: 200,
            minor_faults: 5000,
            major_faults: 10,
            resident_pages: 2048,
            virtual_size: 1 << 30,
            start_ticks: 4242,
            thread_count: 1,
            policy: SchedPolicy::Normal,
            extended: ExtendedMetrics {
                voluntary_ctx_switches: Some(100),
                nonvoluntary_ctx_switches: Some(20),
                resident_bytes: Some(8 << 20),
                io_read_bytes: Some(4096),
                io_write_bytes: Some(0),
            },
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .expect("valid date")
    }

    fn classifier() -> Classifier {
        Classifier::new(ClassifierConfig::default(), Duration::from_secs(60))
    }

    fn baseline_of(snap: &ProcessSnapshot) -> ActivityBaseline {
        ActivityBaseline::from_snapshot(snap, t0())
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_running_without_extended_metrics_is_active() {
        let mut snap = snapshot(1, ProcessState::Running);
        snap.extended = ExtendedMetrics::default();
        let base = baseline_of(&snap);

        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(r.classification, Classification::Active(ActiveReason::RunningState));
        let d = r.deltas.expect("deltas computed for running process");
        assert_eq!(d.cpu_ticks, 0);
        assert_eq!(d.io_bytes, None);
    }

    #[test]
    fn test_sleeping_with_zero_deltas_is_inactive() {
        let snap = snapshot(1, ProcessState::Sleeping);
        let base = baseline_of(&snap);

        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(
            r.classification,
            Classification::Inactive(InactiveReason::NoActivityDelta)
        );
    }

    #[test]
    fn test_terminal_state_first() {
        let snap = snapshot(1, ProcessState::Zombie);
        let r = classifier().classify(&snap, None, MINUTE);
        assert_eq!(
            r.classification,
            Classification::Inactive(InactiveReason::TerminalState)
        );
        assert!(r.classification.is_zombie());
        assert_eq!(r.classification.kind(), "zombie");
    }

    #[test]
    fn test_no_baseline_is_active() {
        let snap = snapshot(1, ProcessState::Sleeping);
        let r = classifier().classify(&snap, None, Duration::ZERO);
        assert_eq!(r.classification, Classification::Active(ActiveReason::NoBaseline));
        assert_eq!(r.deltas, None);
    }

    #[test]
    fn test_reused_pid_treated_as_no_baseline() {
        let snap = snapshot(1, ProcessState::Sleeping);
        let mut base = baseline_of(&snap);
        base.start_ticks = 1;

        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(r.classification, Classification::Active(ActiveReason::NoBaseline));
    }

    #[test]
    fn test_counter_reset_is_active() {
        let snap = snapshot(1, ProcessState::Sleeping);
        let mut base = baseline_of(&snap);
        base.cpu_ticks += 50;

        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(r.classification, Classification::Active(ActiveReason::CounterReset));
        let d = r.deltas.expect("deltas");
        assert!(d.rolled_back);
        assert_eq!(d.cpu_ticks, 0);
    }

    #[test]
    fn test_any_counter_going_backwards_is_reset() {
        let snap = snapshot(1, ProcessState::Sleeping);
        let rollbacks: [(&str, fn(&mut ActivityBaseline)); 4] = [
            ("voluntary", |b| {
                b.voluntary_ctx_switches = b.voluntary_ctx_switches.map(|v| v + 7)
            }),
            ("nonvoluntary", |b| {
                b.nonvoluntary_ctx_switches = b.nonvoluntary_ctx_switches.map(|v| v + 7)
            }),
            ("io", |b| b.io_bytes = b.io_bytes.map(|v| v + 512)),
            ("minor_faults", |b| b.minor_faults += 3),
        ];

        for (counter, roll_back) in rollbacks {
            let mut base = baseline_of(&snap);
            roll_back(&mut base);

            let r = classifier().classify(&snap, Some(&base), MINUTE);
            assert_eq!(
                r.classification,
                Classification::Active(ActiveReason::CounterReset),
                "{counter}"
            );
            let d = r.deltas.expect("deltas");
            assert!(d.rolled_back, "{counter}");
            assert_eq!(d.cpu_ticks, 0, "{counter}");
        }
    }

    #[test]
    fn test_metric_missing_on_one_side_is_not_a_reset() {
        let snap = snapshot(1, ProcessState::Sleeping);
        let mut base = baseline_of(&snap);
        base.voluntary_ctx_switches = None;
        base.io_bytes = Some(u64::MAX);

        let mut current = snap.clone();
        current.extended.io_write_bytes = None;

        let r = classifier().classify(&current, Some(&base), MINUTE);
        let d = r.deltas.expect("deltas");
        assert_eq!(d.voluntary_ctx_switches, None);
        assert_eq!(d.io_bytes, None);
        assert_eq!(d.nonvoluntary_ctx_switches, Some(0));
        assert!(!d.rolled_back);
        assert_eq!(
            r.classification,
            Classification::Inactive(InactiveReason::NoActivityDelta)
        );
    }

    #[test]
    fn test_cpu_threshold_boundary() {
        let base_snap = snapshot(1, ProcessState::Sleeping);
        let base = baseline_of(&base_snap);

        let mut snap = base_snap.clone();
        snap.user_ticks += 214;
        let r = classifier().classify(&snap, Some(&base), MINUTE);
        // 214 ticks is below threshold; no other counter moved.
        assert_eq!(
            r.classification,
            Classification::Inactive(InactiveReason::NoActivityDelta)
        );

        snap.user_ticks += 1;
        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(r.classification, Classification::Active(ActiveReason::CpuTimeHigh));
    }

    #[test]
    fn test_cpu_threshold_normalized_over_long_gap() {
        let base_snap = snapshot(1, ProcessState::Sleeping);
        let base = baseline_of(&base_snap);
        let mut snap = base_snap.clone();
        snap.system_ticks += 300;

        // 300 ticks over two intervals is 150/interval: below 215.
        let r = classifier().classify(&snap, Some(&base), 2 * MINUTE);
        assert!(!r.classification.is_active());

        // The same 300 ticks inside one interval is active.
        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(r.classification, Classification::Active(ActiveReason::CpuTimeHigh));
    }

    #[test]
    fn test_ctx_switch_thresholds() {
        let base_snap = snapshot(1, ProcessState::Sleeping);
        let base = baseline_of(&base_snap);

        let mut snap = base_snap.clone();
        snap.extended.voluntary_ctx_switches = Some(100 + 716);
        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(r.classification, Classification::Active(ActiveReason::CtxSwitchHigh));

        let mut snap = base_snap.clone();
        snap.extended.nonvoluntary_ctx_switches = Some(20 + 157);
        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert!(!r.classification.is_active());

        snap.extended.nonvoluntary_ctx_switches = Some(20 + 158);
        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(r.classification, Classification::Active(ActiveReason::CtxSwitchHigh));
    }

    #[test]
    fn test_resident_change_either_direction() {
        let base_snap = snapshot(1, ProcessState::Sleeping);
        let base = baseline_of(&base_snap);

        let mut snap = base_snap.clone();
        snap.extended.resident_bytes = Some((8 << 20) - 4096);
        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(
            r.classification,
            Classification::Active(ActiveReason::ResidentMemoryChanged)
        );
        assert_eq!(r.deltas.and_then(|d| d.resident_bytes), Some(-4096));
    }

    #[test]
    fn test_io_then_page_faults() {
        let base_snap = snapshot(1, ProcessState::Sleeping);
        let base = baseline_of(&base_snap);

        let mut snap = base_snap.clone();
        snap.extended.io_write_bytes = Some(1);
        snap.minor_faults += 1;
        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(
            r.classification,
            Classification::Active(ActiveReason::IoBytesIncreased)
        );

        let mut snap = base_snap.clone();
        snap.minor_faults += 1;
        let r = classifier().classify(&snap, Some(&base), MINUTE);
        assert_eq!(
            r.classification,
            Classification::Active(ActiveReason::PageFaultsIncreased)
        );
    }

    #[test]
    fn test_classify_workload_commits_after_classification() {
        let store = ActivityStore::new();
        let id = WorkloadId::new("ns", "pod");
        let c = classifier();
        let snaps = vec![
            snapshot(1, ProcessState::Sleeping),
            snapshot(2, ProcessState::Sleeping),
        ];

        let first = c.classify_workload(&store, &id, &snaps, t0());
        assert!(first
            .iter()
            .all(|r| r.classification == Classification::Active(ActiveReason::NoBaseline)));

        let second = c.classify_workload(&store, &id, &snaps, t0() + chrono::Duration::seconds(60));
        assert!(second.iter().all(|r| r.classification
            == Classification::Inactive(InactiveReason::NoActivityDelta)));
        assert_eq!(
            second[0].deltas.map(|d| d.elapsed),
            Some(Duration::from_secs(60))
        );

        // pid 2 vanished: its baseline is dropped with the replaced table.
        c.classify_workload(&store, &id, &snaps[..1], t0() + chrono::Duration::seconds(120));
        assert!(store.baseline(&id, 1).is_some());
        assert!(store.baseline(&id, 2).is_none());
    }

    #[test]
    fn test_summary_counts() {
        let c = classifier();
        let results = vec![
            c.classify(&snapshot(1, ProcessState::Running), None, MINUTE),
            c.classify(&snapshot(2, ProcessState::Zombie), None, MINUTE),
            ClassificationResult {
                pid: 3,
                command: "sleep".into(),
                classification: Classification::Inactive(InactiveReason::NoActivityDelta),
                deltas: None,
            },
        ];
        let s = WorkloadSummary::from_results(&results);
        assert_eq!(
            s,
            WorkloadSummary {
                total: 3,
                active: 1,
                inactive: 1,
                zombie: 1
            }
        );
        assert_eq!(s.to_string(), "3 total, 1 active, 1 inactive, 1 zombie");
    }

    #[test]
    fn test_ticks_to_secs() {
        assert!((classifier().ticks_to_secs(250) - 2.5).abs() < f64::EPSILON);
    }
}
