//! Remote `/proc` collection through an [`Orchestrator`] exec.
//!
//! The stat, status and io reads are separate execs so that each one is
//! bounded by the orchestrator's per-call timeout. Nothing is parsed until
//! all reads have returned.

use tracing::debug;

use super::parse::{self, HELPER_MARKER};
use super::ProcessSnapshot;
use crate::orchestrator::{ExecError, Orchestrator, WorkloadId};

/// Dumps every stat line, prefixed by the helper shell's own pid.
pub fn stat_script() -> String {
    format!(
        "echo \"{HELPER_MARKER} $$\"; \
         for f in /proc/[0-9]*/stat; do cat \"$f\" 2>/dev/null; done"
    )
}

/// Dumps `/proc/<pid>/<file>` for every pid, one `==> <pid> <==` section each.
pub fn sectioned_script(file: &str) -> String {
    format!(
        "for d in /proc/[0-9]*; do echo \"==> ${{d#/proc/}} <==\"; \
         cat \"$d/{file}\" 2>/dev/null; echo; done"
    )
}

/// Collects and parses one process-table snapshot of a workload.
///
/// Any failed read fails the whole snapshot; the caller then treats the
/// workload as "no data" for this cycle.
pub async fn collect_snapshot<O: Orchestrator>(
    orchestrator: &O,
    workload: &WorkloadId,
    resolve_cmdline: bool,
) -> Result<Vec<ProcessSnapshot>, ExecError> {
    let stat_raw = orchestrator.exec(workload, &stat_script()).await?;
    let status_raw = orchestrator
        .exec(workload, &sectioned_script("status"))
        .await?;
    let io_raw = orchestrator.exec(workload, &sectioned_script("io")).await?;
    let cmdline_raw = if resolve_cmdline {
        Some(
            orchestrator
                .exec(workload, &sectioned_script("cmdline"))
                .await?,
        )
    } else {
        None
    };

    let dump = parse::parse_stat_dump(&stat_raw);
    if dump.rejected > 0 {
        debug!(
            workload = %workload,
            rejected = dump.rejected,
            "stat dump contained malformed lines"
        );
    }

    let status = parse::parse_status_dump(&status_raw);
    let io = parse::parse_io_dump(&io_raw);
    let cmdlines = cmdline_raw.as_deref().map(parse::parse_cmdline_dump);

    Ok(parse::assemble(dump, &status, &io, cmdlines.as_ref()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use parking_lot::Mutex;

    use super::*;
    use crate::orchestrator::WorkloadRef;
    use crate::proc::parse::tests::stat_line;
    use crate::proc::ProcessState;

    /// Answers execs by matching a substring of the script.
    struct ScriptedExec {
        replies: HashMap<&'static str, String>,
        scripts: Mutex<Vec<String>>,
    }

    impl ScriptedExec {
        fn new(replies: &[(&'static str, String)]) -> Self {
            Self {
                replies: replies.iter().cloned().collect(),
                scripts: Mutex::new(Vec::new()),
            }
        }
    }

    impl Orchestrator for ScriptedExec {
        async fn list_workloads(&self, _namespace: &str) -> Result<Vec<WorkloadRef>> {
            Ok(Vec::new())
        }

        async fn exec(&self, workload: &WorkloadId, script: &str) -> Result<String, ExecError> {
            self.scripts.lock().push(script.to_string());
            self.replies
                .iter()
                .find(|(needle, _)| script.contains(*needle))
                .map(|(_, reply)| reply.clone())
                .ok_or_else(|| ExecError::NonZeroExit {
                    workload: workload.clone(),
                    code: Some(1),
                    stderr: "no such file".into(),
                })
        }

        async fn delete_workload(&self, _workload: &WorkloadId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_scripts_reference_expected_files() {
        assert!(stat_script().starts_with("echo \"#helper $$\""));
        assert!(stat_script().contains("/proc/[0-9]*/stat"));
        let status = sectioned_script("status");
        assert!(status.contains("==> ${d#/proc/} <=="));
        assert!(status.contains("$d/status"));
    }

    #[tokio::test]
    async fn test_collect_snapshot_merges_reads() {
        let stat = format!(
            "#helper 90\n{}\n{}\n",
            stat_line(1, "bash", 'S', 0, 5),
            stat_line(91, "cat", 'R', 90, 0)
        );
        let orch = ScriptedExec::new(&[
            ("*/stat;", stat),
            ("/status\"", "==> 1 <==\nVmRSS:\t100 kB\n".to_string()),
            ("/io\"", "==> 1 <==\nread_bytes: 7\nwrite_bytes: 3\n".to_string()),
        ]);

        let procs = collect_snapshot(&orch, &WorkloadId::new("ns", "pod"), false)
            .await
            .expect("snapshot");
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 1);
        assert_eq!(procs[0].state, ProcessState::Sleeping);
        assert_eq!(procs[0].extended.resident_bytes, Some(102400));
        assert_eq!(procs[0].extended.io_bytes(), Some(10));
        assert_eq!(orch.scripts.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_collect_snapshot_resolves_cmdline() {
        let orch = ScriptedExec::new(&[
            ("*/stat;", stat_line(4, "python3", 'S', 1, 0)),
            ("/status\"", String::new()),
            ("/io\"", String::new()),
            ("/cmdline\"", "==> 4 <==\npython3\0serve.py\0\n".to_string()),
        ]);

        let procs = collect_snapshot(&orch, &WorkloadId::new("ns", "pod"), true)
            .await
            .expect("snapshot");
        assert_eq!(procs[0].command, "python3 serve.py");
        assert_eq!(orch.scripts.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_collect_snapshot_fails_when_any_read_fails() {
        let orch = ScriptedExec::new(&[("*/stat;", stat_line(1, "bash", 'S', 0, 0))]);
        let err = collect_snapshot(&orch, &WorkloadId::new("ns", "pod"), false)
            .await
            .expect_err("status read fails");
        assert!(matches!(err, ExecError::NonZeroExit { .. }));
    }
}
