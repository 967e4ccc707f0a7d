//! The server of record: a pooled SQLite store holding the authoritative
//! feeding records and the tombstones of deleted ones.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    FeedingPayload, FeedingRecord, ListQuery, Page, PullBatch, Tombstone, UpdateOutcome,
};
use crate::time::{MonotonicClock, format_timestamp, parse_stored};

const RECORD_COLUMNS: &str =
    "id, client_id, feeding_time, food_type, notes, created_at, updated_at";
const SEARCH_FILTER: &str = "(?1 IS NULL OR LOWER(food_type) LIKE ?1 ESCAPE '\\' \
                             OR LOWER(notes) LIKE ?1 ESCAPE '\\')";
const RECENT_FOOD_TYPE_DAYS: i64 = 30;

/// Pool tuning for [`ServerStore::connect`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            acquire_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to the server database. Cheap to clone; every clone shares one
/// pool, one clock and one write gate.
///
/// Writes hold the gate while they draw a timestamp from the clock and
/// commit, so `updated_at` order is commit order and a pull never skips a
/// row that commits late.
#[derive(Debug, Clone)]
pub struct ServerStore {
    pool: SqlitePool,
    clock: Arc<MonotonicClock>,
    writes: Arc<Mutex<()>>,
    acquire_timeout: Duration,
    client_ids_ready: Arc<AtomicBool>,
}

impl ServerStore {
    pub async fn connect(path: &Path, config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Database(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            clock: Arc::new(MonotonicClock::new()),
            writes: Arc::new(Mutex::new(())),
            acquire_timeout: config.acquire_timeout,
            client_ids_ready: Arc::new(AtomicBool::new(false)),
        };
        store.ensure_schema().await?;
        store.restore_clock().await?;

        info!(
            path = %path.display(),
            max_connections = config.max_connections,
            "server store connected"
        );
        Ok(store)
    }

    /// Create the base tables if missing. A fresh `feeding_records` table has
    /// no `client_id` column until the migrator adds it.
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS feeding_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feeding_time TEXT NOT NULL,
                food_type TEXT NOT NULL DEFAULT '',
                notes TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS feeding_tombstones (
                client_id TEXT NOT NULL,
                deleted_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feeding_tombstones_deleted_at
             ON feeding_tombstones(deleted_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Seed the clock from persisted timestamps so a restarted server never
    /// issues an `updated_at` at or below one it already handed out.
    async fn restore_clock(&self) -> Result<()> {
        let latest: Option<String> = sqlx::query_scalar(
            "SELECT MAX(ts) FROM (
                SELECT MAX(updated_at) AS ts FROM feeding_records
                UNION ALL
                SELECT MAX(deleted_at) AS ts FROM feeding_tombstones
            )",
        )
        .fetch_one(&self.pool)
        .await?;

        if let Some(latest) = latest {
            let ts = parse_stored(&latest)
                .map_err(|e| Error::Database(format!("corrupt timestamp '{latest}': {e}")))?;
            self.clock.observe(ts);
        }
        Ok(())
    }

    /// Drain and close the pool. Later calls fail with `Unavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("server store closed");
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    /// Wait for the write gate, giving up after the pool's acquire timeout
    /// so a queue of writers fails as fast as a starved pool does.
    pub(crate) async fn write_gate(&self) -> Result<MutexGuard<'_, ()>> {
        tokio::time::timeout(self.acquire_timeout, self.writes.lock())
            .await
            .map_err(|_| Error::Unavailable("timed out waiting for the write lock".to_string()))
    }

    pub async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn client_id_column_exists(&self) -> Result<bool> {
        if self.client_ids_ready.load(Ordering::Acquire) {
            return Ok(true);
        }
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pragma_table_info('feeding_records') WHERE name = 'client_id')",
        )
        .fetch_one(&self.pool)
        .await?;
        if exists {
            self.mark_client_ids_ready();
        }
        Ok(exists)
    }

    pub(crate) fn mark_client_ids_ready(&self) {
        self.client_ids_ready.store(true, Ordering::Release);
    }

    async fn require_client_ids(&self) -> Result<()> {
        if self.client_id_column_exists().await? {
            Ok(())
        } else {
            Err(Error::MigrationRequired)
        }
    }

    // --- Reads ---

    pub async fn get_by_id(&self, id: i64) -> Result<Option<FeedingRecord>> {
        self.require_client_ids().await?;
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM feeding_records WHERE id = ?1 AND client_id IS NOT NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn get_by_client_id(&self, client_id: Uuid) -> Result<Option<FeedingRecord>> {
        self.require_client_ids().await?;
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM feeding_records WHERE client_id = ?1"
        ))
        .bind(client_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Rows still waiting for a client id are not listed.
    pub async fn list(&self, query: &ListQuery) -> Result<Page<FeedingRecord>> {
        self.require_client_ids().await?;
        let pattern = query.search_pattern();

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM feeding_records WHERE client_id IS NOT NULL AND {SEARCH_FILTER}"
        ))
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM feeding_records
             WHERE client_id IS NOT NULL AND {SEARCH_FILTER}
             ORDER BY feeding_time {sort}, id {sort}
             LIMIT ?2 OFFSET ?3",
            sort = query.sort.as_sql(),
        ))
        .bind(&pattern)
        .bind(query.limit())
        .bind(query.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            feedings: rows.iter().map(record_from_row).collect::<Result<_>>()?,
            total,
            limit: query.limit(),
            offset: query.offset(),
        })
    }

    /// Records and tombstones changed after `since`, oldest first.
    ///
    /// With a `limit`, at most that many items come back in total, cut at a
    /// timestamp so that everything at or before the last returned item is
    /// included. Rows without a client id are excluded; backfill bumps their
    /// `updated_at`, so they surface once identified.
    pub async fn changes_since(
        &self,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<PullBatch> {
        self.require_client_ids().await?;
        let server_time = Utc::now();
        let since_str = format_timestamp(since);
        let fetch_limit = limit.map_or(-1, |l| l.max(1));

        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM feeding_records
             WHERE updated_at > ?1 AND client_id IS NOT NULL
             ORDER BY updated_at ASC, id ASC
             LIMIT ?2"
        ))
        .bind(&since_str)
        .bind(fetch_limit)
        .fetch_all(&self.pool)
        .await?;
        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;

        let rows = sqlx::query(
            "SELECT client_id, deleted_at FROM feeding_tombstones
             WHERE deleted_at > ?1
             ORDER BY deleted_at ASC
             LIMIT ?2",
        )
        .bind(&since_str)
        .bind(fetch_limit)
        .fetch_all(&self.pool)
        .await?;
        let mut deleted = rows
            .iter()
            .map(tombstone_from_row)
            .collect::<Result<Vec<_>>>()?;

        if let Some(limit) = limit {
            let limit = usize::try_from(limit.max(1)).unwrap_or(usize::MAX);
            truncate_to_limit(&mut records, &mut deleted, limit);
        }

        debug!(
            since = %since_str,
            records = records.len(),
            deleted = deleted.len(),
            "changes since watermark"
        );
        Ok(PullBatch {
            records,
            deleted,
            since,
            server_time,
        })
    }

    /// Distinct non-empty food types, most used first.
    pub async fn food_types(&self, search: Option<&str>, limit: i64) -> Result<Vec<String>> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(crate::models::like_pattern);
        let types = sqlx::query_scalar(
            "SELECT food_type FROM feeding_records
             WHERE food_type != '' AND (?1 IS NULL OR LOWER(food_type) LIKE ?1 ESCAPE '\\')
             GROUP BY food_type
             ORDER BY COUNT(*) DESC, food_type ASC
             LIMIT ?2",
        )
        .bind(pattern)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(types)
    }

    /// Most used food types among feedings created in the last 30 days.
    pub async fn recent_food_types(&self, limit: i64) -> Result<Vec<String>> {
        let cutoff = format_timestamp(Utc::now() - chrono::Duration::days(RECENT_FOOD_TYPE_DAYS));
        let types = sqlx::query_scalar(
            "SELECT food_type FROM feeding_records
             WHERE food_type != '' AND created_at >= ?1
             GROUP BY food_type
             ORDER BY COUNT(*) DESC, MAX(created_at) DESC
             LIMIT ?2",
        )
        .bind(cutoff)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(types)
    }

    // --- Writes ---

    /// Insert a record under the caller's client id (or a fresh one).
    pub async fn create(
        &self,
        client_id: Option<Uuid>,
        payload: &FeedingPayload,
    ) -> Result<FeedingRecord> {
        self.require_client_ids().await?;
        let client_id = client_id.unwrap_or_else(Uuid::new_v4);

        let _gate = self.write_gate().await?;
        let now = format_timestamp(self.clock.tick());
        let row = sqlx::query(&format!(
            "INSERT INTO feeding_records (client_id, feeding_time, food_type, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(client_id.to_string())
        .bind(format_timestamp(payload.feeding_time))
        .bind(&payload.food_type)
        .bind(&payload.notes)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::DuplicateClientId(client_id)
            }
            other => Error::from(other),
        })?;

        let record = record_from_row(&row)?;
        debug!(id = record.server_id, client_id = %client_id, "created feeding");
        Ok(record)
    }

    /// Unconditional update addressed by server id. `None` when absent.
    pub async fn update_by_id(
        &self,
        id: i64,
        payload: &FeedingPayload,
    ) -> Result<Option<FeedingRecord>> {
        self.require_client_ids().await?;
        let _gate = self.write_gate().await?;
        let now = format_timestamp(self.clock.tick());
        let row = sqlx::query(&format!(
            "UPDATE feeding_records
             SET feeding_time = ?1, food_type = ?2, notes = ?3, updated_at = ?4
             WHERE id = ?5 AND client_id IS NOT NULL
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(format_timestamp(payload.feeding_time))
        .bind(&payload.food_type)
        .bind(&payload.notes)
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Compare-and-swap update addressed by client id.
    ///
    /// The write applies only if the stored `updated_at` is at or before
    /// `base`; otherwise nothing is written and the current server record
    /// comes back as a conflict. A `None` base updates unconditionally.
    pub async fn update_by_client_id(
        &self,
        client_id: Uuid,
        payload: &FeedingPayload,
        base: Option<DateTime<Utc>>,
    ) -> Result<UpdateOutcome> {
        self.require_client_ids().await?;
        let base = base.map(format_timestamp);

        let _gate = self.write_gate().await?;
        let now = format_timestamp(self.clock.tick());
        let row = sqlx::query(&format!(
            "UPDATE feeding_records
             SET feeding_time = ?1, food_type = ?2, notes = ?3, updated_at = ?4
             WHERE client_id = ?5 AND (?6 IS NULL OR updated_at <= ?6)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(format_timestamp(payload.feeding_time))
        .bind(&payload.food_type)
        .bind(&payload.notes)
        .bind(now)
        .bind(client_id.to_string())
        .bind(&base)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(UpdateOutcome::Updated {
                feeding: record_from_row(&row)?,
            });
        }

        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM feeding_records WHERE client_id = ?1"
        ))
        .bind(client_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let server_record = record_from_row(&row)?;
                debug!(
                    client_id = %client_id,
                    base = ?base,
                    server_updated_at = %format_timestamp(server_record.updated_at),
                    "update rejected as conflict"
                );
                Ok(UpdateOutcome::Conflict { server_record })
            }
            None => Err(Error::not_found(format!("Feeding {client_id} not found"))),
        }
    }

    pub async fn delete_by_id(&self, id: i64) -> Result<bool> {
        self.delete_where("id = ?1", id.to_string()).await
    }

    pub async fn delete_by_client_id(&self, client_id: Uuid) -> Result<bool> {
        self.delete_where("client_id = ?1", client_id.to_string()).await
    }

    /// Remove a row and record its tombstone in one transaction.
    async fn delete_where(&self, predicate: &str, key: String) -> Result<bool> {
        self.require_client_ids().await?;
        let _gate = self.write_gate().await?;
        let mut tx = self.pool.begin().await?;

        let deleted: Option<Option<String>> = sqlx::query_scalar(&format!(
            "DELETE FROM feeding_records WHERE {predicate} RETURNING client_id"
        ))
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(client_id) = deleted else {
            return Ok(false);
        };
        if let Some(client_id) = client_id {
            sqlx::query("INSERT INTO feeding_tombstones (client_id, deleted_at) VALUES (?1, ?2)")
                .bind(&client_id)
                .bind(format_timestamp(self.clock.tick()))
                .execute(&mut *tx)
                .await?;
            debug!(client_id = %client_id, "deleted feeding");
        }
        tx.commit().await?;
        Ok(true)
    }
}

/// Keep the `limit` oldest items across both lists.
fn truncate_to_limit(records: &mut Vec<FeedingRecord>, deleted: &mut Vec<Tombstone>, limit: usize) {
    if records.len() + deleted.len() <= limit {
        return;
    }
    let mut stamps: Vec<DateTime<Utc>> = records
        .iter()
        .map(|r| r.updated_at)
        .chain(deleted.iter().map(|t| t.deleted_at))
        .collect();
    stamps.sort_unstable();
    let cutoff = stamps[limit - 1];
    records.retain(|r| r.updated_at <= cutoff);
    deleted.retain(|t| t.deleted_at <= cutoff);
}

fn record_from_row(row: &SqliteRow) -> Result<FeedingRecord> {
    let client_id: String = row.try_get("client_id")?;
    Ok(FeedingRecord {
        server_id: row.try_get("id")?,
        client_id: Uuid::parse_str(&client_id)
            .map_err(|e| Error::Database(format!("corrupt client_id '{client_id}': {e}")))?,
        feeding_time: timestamp(row, "feeding_time")?,
        food_type: row.try_get("food_type")?,
        notes: row.try_get("notes")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

fn tombstone_from_row(row: &SqliteRow) -> Result<Tombstone> {
    let client_id: String = row.try_get("client_id")?;
    Ok(Tombstone {
        client_id: Uuid::parse_str(&client_id)
            .map_err(|e| Error::Database(format!("corrupt client_id '{client_id}': {e}")))?,
        deleted_at: timestamp(row, "deleted_at")?,
    })
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let value: String = row.try_get(column)?;
    parse_stored(&value)
        .map_err(|e| Error::Database(format!("corrupt {column} '{value}': {e}")))
}
