pub mod parse;
pub mod remote;

use std::fmt;

/// Scheduler state of a process, from field 3 of `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Running,
    Sleeping,
    UninterruptibleSleep,
    Stopped,
    Zombie,
    Dead,
    /// A state letter this parser does not know, kept verbatim.
    Unknown(char),
}

impl ProcessState {
    /// Convert from the single-letter kernel code.
    pub fn from_code(code: char) -> Self {
        match code {
            'R' => Self::Running,
            'S' => Self::Sleeping,
            'D' => Self::UninterruptibleSleep,
            'T' | 't' => Self::Stopped,
            'Z' => Self::Zombie,
            'X' | 'x' => Self::Dead,
            other => Self::Unknown(other),
        }
    }

    /// Returns the kernel letter for this state.
    pub fn code(self) -> char {
        match self {
            Self::Running => 'R',
            Self::Sleeping => 'S',
            Self::UninterruptibleSleep => 'D',
            Self::Stopped => 'T',
            Self::Zombie => 'Z',
            Self::Dead => 'X',
            Self::Unknown(c) => c,
        }
    }

    /// Zombie and dead processes can never become active again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Zombie | Self::Dead)
    }

    /// States that are on (or waiting for) a CPU right now.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Running | Self::UninterruptibleSleep)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("Running"),
            Self::Sleeping => f.write_str("Sleeping"),
            Self::UninterruptibleSleep => f.write_str("UninterruptibleSleep"),
            Self::Stopped => f.write_str("Stopped"),
            Self::Zombie => f.write_str("Zombie"),
            Self::Dead => f.write_str("Dead"),
            Self::Unknown(c) => write!(f, "Unknown({c})"),
        }
    }
}

/// Scheduling policy, from field 41 of `/proc/<pid>/stat`.
/// Values match `SCHED_*` in `include/uapi/linux/sched.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedPolicy {
    Normal,
    Fifo,
    RoundRobin,
    Batch,
    Iso,
    Idle,
    Deadline,
    Unknown(u32),
}

impl SchedPolicy {
    /// Convert from the raw policy number.
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Normal,
            1 => Self::Fifo,
            2 => Self::RoundRobin,
            3 => Self::Batch,
            4 => Self::Iso,
            5 => Self::Idle,
            6 => Self::Deadline,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("SCHED_NORMAL"),
            Self::Fifo => f.write_str("SCHED_FIFO"),
            Self::RoundRobin => f.write_str("SCHED_RR"),
            Self::Batch => f.write_str("SCHED_BATCH"),
            Self::Iso => f.write_str("SCHED_ISO"),
            Self::Idle => f.write_str("SCHED_IDLE"),
            Self::Deadline => f.write_str("SCHED_DEADLINE"),
            Self::Unknown(v) => write!(f, "Unknown({v})"),
        }
    }
}

/// Optional per-process metrics read from `/proc/<pid>/status` and
/// `/proc/<pid>/io`. Any of them may be missing (permissions, old kernels).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedMetrics {
    pub voluntary_ctx_switches: Option<u64>,
    pub nonvoluntary_ctx_switches: Option<u64>,
    pub resident_bytes: Option<u64>,
    pub io_read_bytes: Option<u64>,
    pub io_write_bytes: Option<u64>,
}

impl ExtendedMetrics {
    /// Combined read+write bytes, only when both counters were reported.
    pub fn io_bytes(&self) -> Option<u64> {
        match (self.io_read_bytes, self.io_write_bytes) {
            (Some(r), Some(w)) => Some(r.saturating_add(w)),
            _ => None,
        }
    }
}

/// One process observed in one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub command: String,
    pub state: ProcessState,
    pub parent_pid: u32,
    pub user_ticks: u64,
    pub system_ticks: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub resident_pages: u64,
    pub virtual_size: u64,
    /// Process start time in clock ticks since boot.
    pub start_ticks: u64,
    pub thread_count: u64,
    pub policy: SchedPolicy,
    pub extended: ExtendedMetrics,
}

impl ProcessSnapshot {
    /// Total CPU time (user + system) in clock ticks.
    pub fn cpu_ticks(&self) -> u64 {
        self.user_ticks.saturating_add(self.system_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_code_known() {
        assert_eq!(ProcessState::from_code('R'), ProcessState::Running);
        assert_eq!(ProcessState::from_code('S'), ProcessState::Sleeping);
        assert_eq!(
            ProcessState::from_code('D'),
            ProcessState::UninterruptibleSleep
        );
        assert_eq!(ProcessState::from_code('T'), ProcessState::Stopped);
        assert_eq!(ProcessState::from_code('t'), ProcessState::Stopped);
        assert_eq!(ProcessState::from_code('Z'), ProcessState::Zombie);
        assert_eq!(ProcessState::from_code('X'), ProcessState::Dead);
    }

    #[test]
    fn test_state_unknown_preserved() {
        let state = ProcessState::from_code('I');
        assert_eq!(state, ProcessState::Unknown('I'));
        assert_eq!(state.to_string(), "Unknown(I)");
        assert_eq!(state.code(), 'I');
        assert!(!state.is_terminal());
        assert!(!state.is_busy());
    }

    #[test]
    fn test_state_predicates() {
        assert!(ProcessState::Zombie.is_terminal());
        assert!(ProcessState::Dead.is_terminal());
        assert!(!ProcessState::Sleeping.is_terminal());
        assert!(ProcessState::Running.is_busy());
        assert!(ProcessState::UninterruptibleSleep.is_busy());
        assert!(!ProcessState::Stopped.is_busy());
    }

    #[test]
    fn test_policy_from_u32() {
        assert_eq!(SchedPolicy::from_u32(0), SchedPolicy::Normal);
        assert_eq!(SchedPolicy::from_u32(6), SchedPolicy::Deadline);
        assert_eq!(SchedPolicy::from_u32(42), SchedPolicy::Unknown(42));
        assert_eq!(SchedPolicy::Unknown(42).to_string(), "Unknown(42)");
    }

    #[test]
    fn test_io_bytes_requires_both_counters() {
        let mut ext = ExtendedMetrics {
            io_read_bytes: Some(10),
            ..Default::default()
        };
        assert_eq!(ext.io_bytes(), None);

        ext.io_write_bytes = Some(5);
        assert_eq!(ext.io_bytes(), Some(15));
    }
}
