//! Per-workload eviction decisions with inactivity hysteresis.
//!
//! A workload must be observed fully inactive across consecutive cycles for
//! at least the configured duration before it is flagged. Any active
//! process resets the timer.

pub mod policy;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::activity::{ClassificationResult, WorkloadSummary};
use crate::orchestrator::WorkloadId;

pub use policy::{EvictionVerdict, Trigger};

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    ActiveProcesses(usize),
    TimerStarted,
    Waiting { remaining: Duration },
    Expired { elapsed: Duration, threshold: Duration },
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActiveProcesses(n) => write!(f, "{n} active process(es)"),
            Self::TimerStarted => f.write_str("inactivity timer started"),
            Self::Waiting { remaining } => {
                write!(f, "inactive, waiting {}", format_secs(*remaining))
            }
            Self::Expired { elapsed, threshold } => write!(
                f,
                "inactive for {}, >= threshold {}",
                format_secs(*elapsed),
                format_secs(*threshold)
            ),
        }
    }
}

/// Human-readable duration, truncated to whole seconds.
pub(crate) fn format_secs(d: Duration) -> humantime::FormattedDuration {
    humantime::format_duration(Duration::from_secs(d.as_secs()))
}

/// Outcome of [`DecisionEngine::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub should_evict: bool,
    pub reason: DecisionReason,
    pub summary: WorkloadSummary,
}

/// Owns the inactivity timers of all tracked workloads.
#[derive(Debug)]
pub struct DecisionEngine {
    threshold: Duration,
    timers: HashMap<WorkloadId, DateTime<Utc>>,
}

impl DecisionEngine {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            timers: HashMap::new(),
        }
    }

    /// Decide for one workload from this cycle's classifications.
    /// A workload with zero processes counts as fully inactive.
    pub fn decide(
        &mut self,
        workload: &WorkloadId,
        classifications: &[ClassificationResult],
        now: DateTime<Utc>,
    ) -> Decision {
        let summary = WorkloadSummary::from_results(classifications);

        if summary.active > 0 {
            self.timers.remove(workload);
            return Decision {
                should_evict: false,
                reason: DecisionReason::ActiveProcesses(summary.active),
                summary,
            };
        }

        let Some(&since) = self.timers.get(workload) else {
            self.timers.insert(workload.clone(), now);
            return Decision {
                should_evict: false,
                reason: DecisionReason::TimerStarted,
                summary,
            };
        };

        let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= self.threshold {
            Decision {
                should_evict: true,
                reason: DecisionReason::Expired {
                    elapsed,
                    threshold: self.threshold,
                },
                summary,
            }
        } else {
            Decision {
                should_evict: false,
                reason: DecisionReason::Waiting {
                    remaining: self.threshold - elapsed,
                },
                summary,
            }
        }
    }

    /// When the workload first became fully inactive, if it still is.
    pub fn inactive_since(&self, workload: &WorkloadId) -> Option<DateTime<Utc>> {
        self.timers.get(workload).copied()
    }

    /// Drops the timer of a workload that is gone or evicted.
    pub fn forget(&mut self, workload: &WorkloadId) {
        self.timers.remove(workload);
    }
}
