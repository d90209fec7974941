use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;
use tracing::info;

use crate::config::ClickHouseConfig;

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Latest embedded schema version.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Migrations newer than `current`, in order.
fn pending(current: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

/// The version a rollback from `current` lands on.
fn previous_version(current: u32) -> u32 {
    MIGRATIONS
        .iter()
        .filter(|m| m.version < current)
        .map(|m| m.version)
        .max()
        .unwrap_or(0)
}

/// Manages the archive's ClickHouse schema.
///
/// Compatible with golang-migrate's `schema_migrations` table format.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// ClickHouse migration runner.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    /// Creates a new migrator using the given connection pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Creates a migrator connected to the configured archive database.
    pub fn from_config(cfg: &ClickHouseConfig) -> Self {
        Self::new(Pool::new(cfg.dsn()))
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations table")?;

        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        match block.rows().next() {
            Some(row) => {
                let version: i64 = row.get("version").context("reading version")?;
                let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
                let version = u32::try_from(version)
                    .with_context(|| format!("schema version {version} out of range"))?;
                Ok((version, dirty != 0))
            }
            None => Ok((0, false)),
        }
    }

    /// Records `version`, or clears the table for version 0.
    /// Truncate-and-insert matches golang-migrate.
    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version update")?;

        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if version == 0 {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty)
        );
        handle
            .execute(sql.as_str())
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for SQL execution")?;

        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current, dirty) = self.current_version().await?;
        if dirty {
            bail!("migration version {current} is dirty, manual intervention required");
        }

        info!(current_version = current, latest = latest_version(), "running migrations");

        let mut applied = 0u32;
        for migration in pending(current) {
            info!(version = migration.version, "applying migration");

            self.set_version(migration.version, true).await?;
            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;
            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            info!("no pending migrations");
        } else {
            info!(version = latest_version(), applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current, _) = self.current_version().await?;
        if current == 0 {
            info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current)
            .with_context(|| format!("migration version {current} not found"))?;

        info!(version = current, "rolling back migration");

        self.set_version(current, true).await?;
        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current}"))?;

        let prev = previous_version(current);
        self.set_version(prev, false).await?;

        info!(version = prev, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

/// Splits SQL text into individual statements by semicolons.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
