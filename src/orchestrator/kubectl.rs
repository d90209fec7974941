//! [`Orchestrator`] backed by the `kubectl` binary.

use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::error::Elapsed;
use tracing::{debug, warn};

use super::{ExecError, Orchestrator, WorkloadId, WorkloadPhase, WorkloadRef};
use crate::config::OrchestratorConfig;

/// Shells out to `kubectl` for listing, exec and deletion.
pub struct KubectlClient {
    cfg: OrchestratorConfig,
}

impl KubectlClient {
    pub fn new(cfg: OrchestratorConfig) -> Self {
        Self { cfg }
    }

    /// Global flags prepended to every invocation.
    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if !self.cfg.context.is_empty() {
            args.push("--context".to_string());
            args.push(self.cfg.context.clone());
        }
        if !self.cfg.kubeconfig.is_empty() {
            args.push("--kubeconfig".to_string());
            args.push(self.cfg.kubeconfig.clone());
        }
        args
    }

    async fn run(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> std::result::Result<std::io::Result<Output>, Elapsed> {
        let mut cmd = Command::new(&self.cfg.kubectl_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tokio::time::timeout(timeout, cmd.output()).await
    }

    fn exec_args(&self, workload: &WorkloadId, script: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "exec".to_string(),
            workload.name.clone(),
            "-n".to_string(),
            workload.namespace.clone(),
        ]);
        if !self.cfg.container.is_empty() {
            args.push("-c".to_string());
            args.push(self.cfg.container.clone());
        }
        args.extend([
            "--".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]);
        args
    }
}

impl Orchestrator for KubectlClient {
    async fn list_workloads(&self, namespace: &str) -> Result<Vec<WorkloadRef>> {
        let mut args = self.base_args();
        args.extend([
            "get".to_string(),
            "pods".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ]);

        let output = self
            .run(&args, self.cfg.list_timeout)
            .await
            .map_err(|_| anyhow::anyhow!("listing pods timed out after {:?}", self.cfg.list_timeout))?
            .context("spawning kubectl get pods")?;

        if !output.status.success() {
            bail!(
                "kubectl get pods exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let body = std::str::from_utf8(&output.stdout).context("decoding pod list as UTF-8")?;
        parse_pod_list(body, namespace)
    }

    async fn exec(
        &self,
        workload: &WorkloadId,
        script: &str,
    ) -> std::result::Result<String, ExecError> {
        let args = self.exec_args(workload, script);
        let timeout = self.cfg.exec_timeout;

        let output = self
            .run(&args, timeout)
            .await
            .map_err(|_| ExecError::Timeout {
                workload: workload.clone(),
                timeout,
            })?
            .map_err(|source| ExecError::Spawn {
                workload: workload.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExecError::NonZeroExit {
                workload: workload.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout).map_err(|_| ExecError::InvalidUtf8 {
            workload: workload.clone(),
        })
    }

    async fn delete_workload(&self, workload: &WorkloadId) -> Result<()> {
        let mut args = self.base_args();
        args.extend([
            "delete".to_string(),
            "pod".to_string(),
            workload.name.clone(),
            "-n".to_string(),
            workload.namespace.clone(),
            "--wait=false".to_string(),
        ]);

        let output = self
            .run(&args, self.cfg.exec_timeout)
            .await
            .map_err(|_| anyhow::anyhow!("deleting {workload} timed out"))?
            .with_context(|| format!("spawning kubectl delete for {workload}"))?;

        if !output.status.success() {
            bail!(
                "kubectl delete {workload} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        debug!(workload = %workload, "delete requested");
        Ok(())
    }
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMetadata {
    name: String,
    #[serde(default)]
    namespace: String,
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(default)]
    phase: String,
}

fn parse_phase(phase: &str) -> WorkloadPhase {
    match phase {
        "Pending" => WorkloadPhase::Pending,
        "Running" => WorkloadPhase::Running,
        "Succeeded" => WorkloadPhase::Succeeded,
        "Failed" => WorkloadPhase::Failed,
        _ => WorkloadPhase::Unknown,
    }
}

/// Decode `kubectl get pods -o json`. Every pod with a creation time is
/// kept, whatever its phase.
pub(crate) fn parse_pod_list(body: &str, namespace: &str) -> Result<Vec<WorkloadRef>> {
    let list: PodList = serde_json::from_str(body).context("decoding pod list JSON")?;

    let mut workloads = Vec::with_capacity(list.items.len());
    for pod in list.items {
        let Some(created_at) = pod.metadata.creation_timestamp else {
            warn!(pod = %pod.metadata.name, "pod without creationTimestamp, skipping");
            continue;
        };

        let ns = if pod.metadata.namespace.is_empty() {
            namespace.to_string()
        } else {
            pod.metadata.namespace
        };

        workloads.push(WorkloadRef {
            id: WorkloadId::new(ns, pod.metadata.name),
            created_at,
            phase: parse_phase(&pod.status.phase),
        });
    }

    Ok(workloads)
}
