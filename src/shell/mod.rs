//! Shell-usage idleness from the age of the shell history artifact.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::orchestrator::{Orchestrator, WorkloadId, WorkloadRef};

/// Printed by the remote check when the artifact does not exist.
pub const MISSING_MARKER: &str = "missing";

/// Remote check printing the artifact's mtime in epoch seconds.
/// The path is expanded by the remote shell, so `$HOME` works.
pub fn mtime_script(path: &str) -> String {
    format!("stat -c %Y \"{path}\" 2>/dev/null || echo {MISSING_MARKER}")
}

/// Parse the remote check output. `None` means the artifact does not exist.
pub fn parse_mtime(output: &str) -> Result<Option<DateTime<Utc>>> {
    let value = output.trim();
    if value == MISSING_MARKER {
        return Ok(None);
    }

    let secs: i64 = value
        .parse()
        .with_context(|| format!("unexpected history mtime output {value:?}"))?;
    match DateTime::from_timestamp(secs, 0) {
        Some(ts) => Ok(Some(ts)),
        None => bail!("history mtime {secs} out of range"),
    }
}

/// Reads the history artifact's mtime inside a workload.
pub async fn read_history_mtime<O: Orchestrator>(
    orchestrator: &O,
    workload: &WorkloadId,
    path: &str,
) -> Result<Option<DateTime<Utc>>> {
    let output = orchestrator
        .exec(workload, &mtime_script(path))
        .await
        .with_context(|| format!("probing shell history of {workload}"))?;
    parse_mtime(&output)
}

/// Last known shell state of one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellIdleState {
    pub last_modified: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Result of one shell check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellCheck {
    pub idle: bool,
    pub last_modified: Option<DateTime<Utc>>,
    /// The observed mtime differs from the last stored one.
    pub changed: bool,
}

/// Tracks shell idleness per workload.
#[derive(Debug)]
pub struct ShellIdleDetector {
    threshold: Duration,
    states: HashMap<WorkloadId, ShellIdleState>,
}

impl ShellIdleDetector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            states: HashMap::new(),
        }
    }

    /// Idle iff the artifact and the workload are both older than the
    /// threshold. A missing artifact is treated as never used.
    pub fn check(
        &mut self,
        workload: &WorkloadRef,
        observed: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ShellCheck {
        let older_than_threshold =
            |ts: DateTime<Utc>| (now - ts).to_std().is_ok_and(|age| age > self.threshold);

        let workload_old = older_than_threshold(workload.created_at);
        let artifact_old = observed.map_or(true, older_than_threshold);
        let idle = workload_old && artifact_old;

        let changed = self
            .states
            .get(&workload.id)
            .map_or(true, |prev| prev.last_modified != observed);

        self.states.insert(
            workload.id.clone(),
            ShellIdleState {
                last_modified: observed,
                active: !idle,
            },
        );

        ShellCheck {
            idle,
            last_modified: observed,
            changed,
        }
    }

    pub fn state(&self, workload: &WorkloadId) -> Option<ShellIdleState> {
        self.states.get(workload).copied()
    }

    pub fn forget(&mut self, workload: &WorkloadId) {
        self.states.remove(workload);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const DAY: i64 = 86_400;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0)
            .single()
            .expect("valid date")
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        now() - chrono::Duration::seconds(days * DAY)
    }

    fn workload(age_days: i64) -> WorkloadRef {
        WorkloadRef::running(WorkloadId::new("hub", "jupyter-alice"), days_ago(age_days))
    }

    fn detector() -> ShellIdleDetector {
        ShellIdleDetector::new(Duration::from_secs(7 * DAY as u64))
    }

    #[test]
    fn test_old_history_on_old_workload_is_idle() {
        let check = detector().check(&workload(10), Some(days_ago(8)), now());
        assert!(check.idle);
        assert!(check.changed);
        assert_eq!(check.last_modified, Some(days_ago(8)));
    }

    #[test]
    fn test_recent_history_is_not_idle() {
        let check = detector().check(&workload(10), Some(days_ago(1)), now());
        assert!(!check.idle);
    }

    #[test]
    fn test_young_workload_is_not_idle() {
        let check = detector().check(&workload(3), Some(days_ago(8)), now());
        assert!(!check.idle);
    }

    #[test]
    fn test_missing_history_counts_as_never_used() {
        let mut d = detector();
        assert!(!d.check(&workload(2), None, now()).idle);
        assert!(d.check(&workload(9), None, now()).idle);
    }

    #[test]
    fn test_changed_only_when_mtime_moves() {
        let mut d = detector();
        let w = workload(10);
        assert!(d.check(&w, Some(days_ago(2)), now()).changed);
        assert!(!d.check(&w, Some(days_ago(2)), now()).changed);
        assert!(d.check(&w, Some(days_ago(1)), now()).changed);
        assert_eq!(
            d.state(&w.id),
            Some(ShellIdleState {
                last_modified: Some(days_ago(1)),
                active: true
            })
        );

        d.forget(&w.id);
        assert!(d.state(&w.id).is_none());
    }

    #[test]
    fn test_parse_mtime() {
        assert_eq!(parse_mtime("missing\n").expect("missing"), None);
        assert_eq!(
            parse_mtime("1718442000\n").expect("epoch"),
            DateTime::from_timestamp(1_718_442_000, 0)
        );
        assert!(parse_mtime("stat: cannot stat").is_err());
    }

    #[test]
    fn test_mtime_script() {
        assert_eq!(
            mtime_script("$HOME/.bash_history"),
            "stat -c %Y \"$HOME/.bash_history\" 2>/dev/null || echo missing"
        );
    }
}
