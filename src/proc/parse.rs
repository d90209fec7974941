//! Parsing of remote `/proc` dumps into typed [`ProcessSnapshot`] values.
//!
//! The stat dump is one `/proc/<pid>/stat` line per process. The detail
//! dumps (`status`, `io`, `cmdline`) are sectioned per pid by a
//! `==> <pid> <==` header line. Malformed stat lines are rejected one at a
//! time; missing detail keys simply leave the field empty.

use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

use super::{ExtendedMetrics, ProcessSnapshot, ProcessState, SchedPolicy};

/// Minimum number of stat fields required (through field 41, `policy`).
pub const MIN_STAT_FIELDS: usize = 41;

/// Marker line the sampling script prints with its own pid.
pub const HELPER_MARKER: &str = "#helper";

const SECTION_OPEN: &str = "==> ";
const SECTION_CLOSE: &str = " <==";

/// Errors that can occur while parsing a single stat line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing parenthesized command field")]
    MissingCommand,

    #[error("too few fields: {count} (need {MIN_STAT_FIELDS})")]
    TooFewFields { count: usize },

    #[error("invalid {field} value {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Result of parsing one full stat dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatDump {
    /// Pid of the sampling helper shell, when the marker was present.
    pub helper_pid: Option<u32>,
    /// Processes in dump order, helper and its children removed.
    pub processes: Vec<ProcessSnapshot>,
    /// Number of lines dropped as malformed.
    pub rejected: usize,
}

/// Parse a single `/proc/<pid>/stat` line.
///
/// The command is taken between the first `(` and the *last* `)` because
/// process names may themselves contain spaces and parentheses.
pub fn parse_stat_line(line: &str) -> Result<ProcessSnapshot, ParseError> {
    let open = line.find('(').ok_or(ParseError::MissingCommand)?;
    let close = line.rfind(')').ok_or(ParseError::MissingCommand)?;
    if close < open {
        return Err(ParseError::MissingCommand);
    }

    let pid_str = line[..open].trim();
    let command = &line[open + 1..close];
    let rest: Vec<&str> = line[close + 1..].split_whitespace().collect();

    // pid and comm are fields 1 and 2; `rest` starts at field 3.
    let count = rest.len() + 2;
    if count < MIN_STAT_FIELDS {
        return Err(ParseError::TooFewFields { count });
    }

    let pid = parse_num::<u32>("pid", pid_str)?;

    let state_str = field(&rest, 3);
    let mut chars = state_str.chars();
    let state = match (chars.next(), chars.next()) {
        (Some(c), None) => ProcessState::from_code(c),
        _ => {
            return Err(ParseError::InvalidField {
                field: "state",
                value: state_str.to_string(),
            })
        }
    };

    Ok(ProcessSnapshot {
        pid,
        command: command.to_string(),
        state,
        parent_pid: parse_num("ppid", field(&rest, 4))?,
        minor_faults: parse_num("minflt", field(&rest, 10))?,
        major_faults: parse_num("majflt", field(&rest, 12))?,
        user_ticks: parse_num("utime", field(&rest, 14))?,
        system_ticks: parse_num("stime", field(&rest, 15))?,
        thread_count: parse_num("num_threads", field(&rest, 20))?,
        start_ticks: parse_num("starttime", field(&rest, 22))?,
        virtual_size: parse_num("vsize", field(&rest, 23))?,
        resident_pages: parse_num("rss", field(&rest, 24))?,
        policy: SchedPolicy::from_u32(parse_num("policy", field(&rest, 41))?),
        extended: ExtendedMetrics::default(),
    })
}

/// Returns stat field `n` (1-based, as documented in proc(5)).
/// Callers have already checked the field count.
fn field<'a>(rest: &[&'a str], n: usize) -> &'a str {
    rest.get(n - 3).copied().unwrap_or_default()
}

fn parse_num<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// Parse a whole stat dump, dropping malformed lines with a warning.
pub fn parse_stat_dump(raw: &str) -> StatDump {
    let mut dump = StatDump::default();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(marker) = line.strip_prefix(HELPER_MARKER) {
            match marker.trim().parse() {
                Ok(pid) => dump.helper_pid = Some(pid),
                Err(_) => warn!(line, "unparseable helper marker"),
            }
            continue;
        }

        match parse_stat_line(line) {
            Ok(proc) => dump.processes.push(proc),
            Err(e) => {
                let preview: String = line.chars().take(80).collect();
                warn!(line = %preview, error = %e, "dropping malformed stat line");
                dump.rejected += 1;
            }
        }
    }

    if let Some(helper) = dump.helper_pid {
        dump.processes
            .retain(|p| p.pid != helper && p.parent_pid != helper);
    }

    dump
}

/// Split a sectioned dump into `(pid, lines)` groups.
/// Lines before the first header, and sections with a bad pid, are ignored.
fn split_sections(raw: &str) -> Vec<(u32, Vec<&str>)> {
    let mut sections: Vec<(u32, Vec<&str>)> = Vec::new();
    let mut current: Option<usize> = None;

    for line in raw.lines() {
        if let Some(header) = line
            .strip_prefix(SECTION_OPEN)
            .and_then(|h| h.strip_suffix(SECTION_CLOSE))
        {
            current = match header.trim().parse::<u32>() {
                Ok(pid) => {
                    sections.push((pid, Vec::new()));
                    Some(sections.len() - 1)
                }
                Err(_) => None,
            };
            continue;
        }

        if let Some(section) = current.and_then(|idx| sections.get_mut(idx)) {
            section.1.push(line);
        }
    }

    sections
}

/// Find `key` by line prefix and parse the first number after it.
fn prefixed_u64(lines: &[&str], key: &str) -> Option<u64> {
    lines.iter().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse().ok())
    })
}

/// Parse a sectioned `/proc/<pid>/status` dump.
///
/// Only the context-switch counters and `VmRSS` (converted from kB to
/// bytes) are extracted.
pub fn parse_status_dump(raw: &str) -> HashMap<u32, ExtendedMetrics> {
    split_sections(raw)
        .into_iter()
        .map(|(pid, lines)| {
            let metrics = ExtendedMetrics {
                voluntary_ctx_switches: prefixed_u64(&lines, "voluntary_ctxt_switches:"),
                nonvoluntary_ctx_switches: prefixed_u64(&lines, "nonvoluntary_ctxt_switches:"),
                resident_bytes: prefixed_u64(&lines, "VmRSS:").map(|kb| kb.saturating_mul(1024)),
                ..Default::default()
            };
            (pid, metrics)
        })
        .collect()
}

/// Parse a sectioned `/proc/<pid>/io` dump.
pub fn parse_io_dump(raw: &str) -> HashMap<u32, ExtendedMetrics> {
    split_sections(raw)
        .into_iter()
        .map(|(pid, lines)| {
            let metrics = ExtendedMetrics {
                io_read_bytes: prefixed_u64(&lines, "read_bytes:"),
                io_write_bytes: prefixed_u64(&lines, "write_bytes:"),
                ..Default::default()
            };
            (pid, metrics)
        })
        .collect()
}

/// Parse a sectioned `/proc/<pid>/cmdline` dump into full command lines.
/// NUL separators become spaces; empty command lines (kernel threads,
/// zombies) are omitted.
pub fn parse_cmdline_dump(raw: &str) -> HashMap<u32, String> {
    split_sections(raw)
        .into_iter()
        .filter_map(|(pid, lines)| {
            let joined = lines.join(" ").replace('\0', " ");
            let cmdline = joined.split_whitespace().collect::<Vec<_>>().join(" ");
            if cmdline.is_empty() {
                None
            } else {
                Some((pid, cmdline))
            }
        })
        .collect()
}

/// Merge extended metrics and optional command lines into the stat records.
pub fn assemble(
    dump: StatDump,
    status: &HashMap<u32, ExtendedMetrics>,
    io: &HashMap<u32, ExtendedMetrics>,
    cmdlines: Option<&HashMap<u32, String>>,
) -> Vec<ProcessSnapshot> {
    dump.processes
        .into_iter()
        .map(|mut proc| {
            if let Some(s) = status.get(&proc.pid) {
                proc.extended.voluntary_ctx_switches = s.voluntary_ctx_switches;
                proc.extended.nonvoluntary_ctx_switches = s.nonvoluntary_ctx_switches;
                proc.extended.resident_bytes = s.resident_bytes;
            }
            if let Some(i) = io.get(&proc.pid) {
                proc.extended.io_read_bytes = i.io_read_bytes;
                proc.extended.io_write_bytes = i.io_write_bytes;
            }
            if let Some(cmdline) = cmdlines.and_then(|c| c.get(&proc.pid)) {
                proc.command = cmdline.clone();
            }
            proc
        })
        .collect()
}
