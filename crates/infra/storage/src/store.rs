//! SQLite store handle

use crate::error::{StoreError, StoreResult};
use crate::schema::{MIGRATIONS, REQUIRED_TABLES};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Shared handle to the agent database
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Connection-level settings as reported by SQLite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PragmaStatus {
    /// `journal_mode`, lowercase
    pub journal_mode: String,
    /// `foreign_keys` enabled
    pub foreign_keys: bool,
    /// `busy_timeout` in ms
    pub busy_timeout_ms: i64,
}

impl Store {
    /// Open (creating if missing) with WAL, foreign keys and `busy_timeout_ms`
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the parent
    /// directory cannot be created.
    pub async fn open(path: &Path, busy_timeout_ms: u64) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(busy_timeout_ms.max(1)));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "store opened");
        Ok(Self { pool })
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply every pending migration
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the failing migration is rolled back.
    pub async fn migrate(&self) -> StoreResult<usize> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_ms INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        let current: i64 = sqlx::query("SELECT COALESCE(MAX(version), 0) AS v FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?
            .try_get("v")?;

        let mut applied = 0;
        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let mut tx = self.pool.begin().await?;
            for statement in migration.statements {
                sqlx::query(*statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Migration {
                        version: migration.version,
                        detail: e.to_string(),
                    })?;
            }
            sqlx::query("INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (?, ?, ?)")
                .bind(migration.version)
                .bind(migration.name)
                .bind(chrono::Utc::now().timestamp_millis())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!(version = migration.version, name = migration.name, "migration applied");
            applied += 1;
        }
        if applied > 0 {
            info!(applied, "schema migrated");
        }
        Ok(applied)
    }

    /// Tables from the required set that do not exist
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be queried.
    pub async fn missing_tables(&self) -> StoreResult<Vec<&'static str>> {
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&self.pool)
            .await?;
        let present: Vec<String> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()?;
        Ok(REQUIRED_TABLES
            .iter()
            .copied()
            .filter(|t| !present.iter().any(|p| p == t))
            .collect())
    }

    /// Journal mode, foreign keys and busy timeout of a pooled connection
    ///
    /// # Errors
    ///
    /// Returns an error if a pragma cannot be read.
    pub async fn pragma_status(&self) -> StoreResult<PragmaStatus> {
        let mut conn = self.pool.acquire().await?;
        let journal_mode: String = sqlx::query("PRAGMA journal_mode")
            .fetch_one(&mut *conn)
            .await?
            .try_get(0)?;
        let foreign_keys: i64 = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(&mut *conn)
            .await?
            .try_get(0)?;
        let busy_timeout_ms: i64 = sqlx::query("PRAGMA busy_timeout")
            .fetch_one(&mut *conn)
            .await?
            .try_get(0)?;
        Ok(PragmaStatus {
            journal_mode: journal_mode.to_lowercase(),
            foreign_keys: foreign_keys == 1,
            busy_timeout_ms,
        })
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
