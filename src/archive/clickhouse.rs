use std::fmt::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use tracing::info;

use super::{Archive, Deletion, SnapshotRow};
use crate::config::ClickHouseConfig;
use crate::orchestrator::{WorkloadId, WorkloadRef};

/// Archive backed by ClickHouse over the native protocol.
///
/// Tables are created by the embedded migrations. `workload_lifecycle` is a
/// ReplacingMergeTree keyed by (namespace, name, created_at), so finalizing
/// a lifecycle is an insert of the same key with a newer `updated_at`.
pub struct ClickHouseArchive {
    pool: Pool,
    database: String,
}

impl ClickHouseArchive {
    /// Opens the pool and verifies connectivity with a ping.
    pub async fn connect(cfg: &ClickHouseConfig) -> Result<Self> {
        let dsn = format!("{}?compression=lz4&pool_min=2&pool_max=5", cfg.dsn());
        let pool = Pool::new(dsn);

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;
        handle.ping().await.context("pinging ClickHouse")?;

        info!(endpoint = %cfg.endpoint, database = %cfg.database, "ClickHouse archive connected");

        Ok(Self {
            pool,
            database: cfg.database.clone(),
        })
    }

    async fn execute(&self, sql: String, what: &'static str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {what}"))?;
        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("executing {what}"))?;
        Ok(())
    }

    /// Creation time of the latest lifecycle, in epoch milliseconds.
    async fn latest_lifecycle_created_ms(&self, workload: &WorkloadId) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT toUnixTimestamp64Milli(created_at) AS created_ms FROM {}.workload_lifecycle FINAL \
             WHERE {} ORDER BY created_at DESC LIMIT 1",
            self.database,
            workload_filter(workload)
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for lifecycle lookup")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying latest lifecycle")?;

        match block.rows().next() {
            Some(row) => Ok(Some(row.get::<i64, _>("created_ms").context("reading created_ms")?)),
            None => Ok(None),
        }
    }
}

impl Archive for ClickHouseArchive {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn is_workload_known(&self, workload: &WorkloadId) -> Result<bool> {
        let sql = format!(
            "SELECT count() AS c FROM {}.workload_lifecycle WHERE {}",
            self.database,
            workload_filter(workload)
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for lifecycle count")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("counting lifecycle records")?;

        match block.rows().next() {
            Some(row) => Ok(row.get::<u64, _>("c").context("reading count")? > 0),
            None => Ok(false),
        }
    }

    async fn is_workload_deleted(&self, workload: &WorkloadId) -> Result<bool> {
        let sql = format!(
            "SELECT deleted FROM {}.workload_lifecycle FINAL WHERE {} ORDER BY created_at DESC LIMIT 1",
            self.database,
            workload_filter(workload)
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for lifecycle state")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying lifecycle state")?;

        match block.rows().next() {
            Some(row) => Ok(row.get::<u8, _>("deleted").context("reading deleted flag")? != 0),
            None => Ok(false),
        }
    }

    async fn record_created(&self, workload: &WorkloadRef) -> Result<()> {
        let sql = lifecycle_insert_sql(
            &self.database,
            &workload.id,
            workload.created_at,
            None,
            Utc::now(),
        );
        self.execute(sql, "workload_lifecycle insert").await
    }

    async fn record_deleted(&self, workload: &WorkloadId, deletion: &Deletion) -> Result<()> {
        let created_at = self
            .latest_lifecycle_created_ms(workload)
            .await?
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(deletion.deleted_at);

        let sql = lifecycle_insert_sql(
            &self.database,
            workload,
            created_at,
            Some(deletion),
            Utc::now(),
        );
        self.execute(sql, "workload_lifecycle finalize").await
    }

    async fn reopen(&self, workload: &WorkloadId) -> Result<()> {
        let Some(created_at) = self
            .latest_lifecycle_created_ms(workload)
            .await?
            .and_then(DateTime::from_timestamp_millis)
        else {
            return Ok(());
        };

        let sql = lifecycle_insert_sql(&self.database, workload, created_at, None, Utc::now());
        self.execute(sql, "workload_lifecycle reopen").await
    }

    async fn save_snapshots(&self, rows: &[SnapshotRow]) -> Result<()> {
        match snapshots_insert_sql(&self.database, rows) {
            Some(sql) => self.execute(sql, "process_snapshots insert").await,
            None => Ok(()),
        }
    }

    async fn save_shell_history(
        &self,
        workload: &WorkloadId,
        last_modified: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.shell_history (observed_at, namespace, name, last_modified) \
             VALUES ({}, '{}', '{}', {})",
            self.database,
            format_datetime(Utc::now()),
            escape_sql(&workload.namespace),
            escape_sql(&workload.name),
            format_datetime(last_modified),
        );
        self.execute(sql, "shell_history insert").await
    }

    async fn last_shell_history(&self, workload: &WorkloadId) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT toUnixTimestamp64Milli(last_modified) AS ts FROM {}.shell_history \
             WHERE {} ORDER BY observed_at DESC LIMIT 1",
            self.database,
            workload_filter(workload)
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for shell history lookup")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying shell history")?;

        match block.rows().next() {
            Some(row) => {
                let ms: i64 = row.get("ts").context("reading shell history mtime")?;
                Ok(DateTime::from_timestamp_millis(ms))
            }
            None => Ok(None),
        }
    }
}

fn workload_filter(workload: &WorkloadId) -> String {
    format!(
        "namespace = '{}' AND name = '{}'",
        escape_sql(&workload.namespace),
        escape_sql(&workload.name)
    )
}

fn lifecycle_insert_sql(
    database: &str,
    workload: &WorkloadId,
    created_at: DateTime<Utc>,
    deletion: Option<&Deletion>,
    updated_at: DateTime<Utc>,
) -> String {
    let (deleted, deleted_at, reason, shell_idle) = match deletion {
        Some(d) => (
            1,
            format_datetime(d.deleted_at),
            escape_sql(&d.reason),
            u8::from(d.shell_idle),
        ),
        None => (0, "NULL".to_string(), String::new(), 0),
    };

    format!(
        "INSERT INTO {database}.workload_lifecycle \
         (namespace, name, created_at, deleted, deleted_at, delete_reason, shell_idle, updated_at) \
         VALUES ('{}', '{}', {}, {deleted}, {deleted_at}, '{reason}', {shell_idle}, {})",
        escape_sql(&workload.namespace),
        escape_sql(&workload.name),
        format_datetime(created_at),
        format_datetime(updated_at),
    )
}

fn snapshots_insert_sql(database: &str, rows: &[SnapshotRow]) -> Option<String> {
    if rows.is_empty() {
        return None;
    }

    let columns = "observed_at, namespace, name, pid, parent_pid, command, state, policy, \
         user_ticks, system_ticks, minor_faults, major_faults, resident_pages, virtual_size, \
         start_ticks, thread_count, voluntary_ctx_switches, nonvoluntary_ctx_switches, \
         resident_bytes, io_read_bytes, io_write_bytes, classification, reason, cpu_delta_ticks";

    let mut sql = String::with_capacity(128 + columns.len() + rows.len() * 256);
    let _ = write!(
        sql,
        "INSERT INTO {database}.process_snapshots ({columns}) VALUES "
    );

    for (idx, row) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let p = &row.process;
        let ext = &p.extended;
        let _ = write!(
            sql,
            "({}, '{}', '{}', {}, {}, '{}', '{}', '{}', {}, {}, {}, {}, {}, {}, {}, {}, \
             {}, {}, {}, {}, {}, '{}', '{}', {})",
            format_datetime(row.observed_at),
            escape_sql(&row.workload.namespace),
            escape_sql(&row.workload.name),
            p.pid,
            p.parent_pid,
            escape_sql(&p.command),
            escape_sql(&p.state.code().to_string()),
            p.policy,
            p.user_ticks,
            p.system_ticks,
            p.minor_faults,
            p.major_faults,
            p.resident_pages,
            p.virtual_size,
            p.start_ticks,
            p.thread_count,
            nullable(ext.voluntary_ctx_switches),
            nullable(ext.nonvoluntary_ctx_switches),
            nullable(ext.resident_bytes),
            nullable(ext.io_read_bytes),
            nullable(ext.io_write_bytes),
            row.kind,
            row.reason,
            row.cpu_delta_ticks,
        );
    }

    Some(sql)
}

fn nullable(v: Option<u64>) -> String {
    v.map_or_else(|| "NULL".to_string(), |v| v.to_string())
}

/// Formats a timestamp as a quoted DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
