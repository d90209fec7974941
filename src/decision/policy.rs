//! OR-combination of the process-inactivity and shell-idleness signals.

use std::fmt;

use super::Decision;
use crate::shell::ShellCheck;

/// Which signal(s) flagged a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    ShellIdle,
    ProcessInactivity,
    Both,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShellIdle => "shell-idle",
            Self::ProcessInactivity => "process-inactivity",
            Self::Both => "both",
        }
    }

    pub fn includes_shell(self) -> bool {
        matches!(self, Self::ShellIdle | Self::Both)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workload flagged for eviction, with its audit text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionVerdict {
    pub trigger: Trigger,
    pub reason: String,
}

/// Evict iff the shell signal is idle or the decision engine flagged the
/// workload. `shell` is `None` when the shell history read failed this cycle.
pub fn evaluate(shell: Option<&ShellCheck>, decision: &Decision) -> Option<EvictionVerdict> {
    let shell_idle = shell.is_some_and(|s| s.idle);

    let trigger = match (shell_idle, decision.should_evict) {
        (true, true) => Trigger::Both,
        (true, false) => Trigger::ShellIdle,
        (false, true) => Trigger::ProcessInactivity,
        (false, false) => return None,
    };

    let shell_text = || match shell.and_then(|s| s.last_modified) {
        Some(ts) => format!("shell history untouched since {}", ts.to_rfc3339()),
        None => "shell history never written".to_string(),
    };

    let reason = match trigger {
        Trigger::ShellIdle => shell_text(),
        Trigger::ProcessInactivity => format!("{} ({})", decision.reason, decision.summary),
        Trigger::Both => format!(
            "{}; {} ({})",
            shell_text(),
            decision.reason,
            decision.summary
        ),
    };

    Some(EvictionVerdict { trigger, reason })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::activity::WorkloadSummary;
    use crate::decision::DecisionReason;

    fn decision(should_evict: bool) -> Decision {
        Decision {
            should_evict,
            reason: if should_evict {
                DecisionReason::Expired {
                    elapsed: Duration::from_secs(300),
                    threshold: Duration::from_secs(300),
                }
            } else {
                DecisionReason::ActiveProcesses(1)
            },
            summary: WorkloadSummary {
                total: 2,
                active: usize::from(!should_evict),
                inactive: 1 + usize::from(should_evict),
                zombie: 0,
            },
        }
    }

    fn shell(idle: bool, last_modified: Option<DateTime<Utc>>) -> ShellCheck {
        ShellCheck {
            idle,
            last_modified,
            changed: false,
        }
    }

    #[test]
    fn test_neither_signal_retains() {
        assert_eq!(evaluate(Some(&shell(false, None)), &decision(false)), None);
        assert_eq!(evaluate(None, &decision(false)), None);
    }

    #[test]
    fn test_process_inactivity_alone_evicts() {
        let v = evaluate(None, &decision(true)).expect("flagged");
        assert_eq!(v.trigger, Trigger::ProcessInactivity);
        assert_eq!(
            v.reason,
            "inactive for 5m, >= threshold 5m (2 total, 0 active, 2 inactive, 0 zombie)"
        );
        assert!(!v.trigger.includes_shell());
    }

    #[test]
    fn test_shell_idle_alone_evicts() {
        let ts = DateTime::from_timestamp(1_700_000_000, 0);
        let v = evaluate(Some(&shell(true, ts)), &decision(false)).expect("flagged");
        assert_eq!(v.trigger, Trigger::ShellIdle);
        assert!(v.reason.starts_with("shell history untouched since 2023-11-14"));
        assert!(v.trigger.includes_shell());
    }

    #[test]
    fn test_both_signals() {
        let v = evaluate(Some(&shell(true, None)), &decision(true)).expect("flagged");
        assert_eq!(v.trigger, Trigger::Both);
        assert!(v.reason.starts_with("shell history never written; inactive for 5m"));
    }
}
