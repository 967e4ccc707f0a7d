use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::migration::MigrationStatus;
use crate::models::{
    ConflictRecord, DatabaseStats, FeedingEdit, FeedingPayload, FeedingRecord, ListQuery,
    LocalRecord, MergeSummary, OutboxEntry, OutboxOperation, Page, PullBatch, Resolution,
};
use crate::time::{MonotonicClock, epoch, format_timestamp, parse_stored};

const WATERMARK_KEY: &str = "watermark";
const LAST_PULL_SERVER_TIME_KEY: &str = "last_pull_server_time";
const LAST_SYNC_KEY: &str = "last_sync_at";
const MIGRATION_STATUS_KEY: &str = "migration_status";
const MIGRATION_CHECKED_KEY: &str = "migration_checked_at";

const RECORD_COLUMNS: &str = "id, client_id, server_id, feeding_time, food_type, notes, \
                              created_at, updated_at, server_updated_at";
const OUTBOX_COLUMNS: &str =
    "id, client_id, operation, payload, base_updated_at, created_at, retry_count, last_error";
const CONFLICT_COLUMNS: &str =
    "id, client_id, local_data, server_data, timestamp, resolved, resolved_at, resolution";

/// The per-device store: feeding records, the sync outbox, the conflict log
/// and sync bookkeeping.
pub struct Database {
    conn: Connection,
    clock: MonotonicClock,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database {
            conn,
            clock: MonotonicClock::new(),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn,
            clock: MonotonicClock::new(),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS feeding_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    client_id TEXT NOT NULL UNIQUE,
                    server_id INTEGER,
                    feeding_time TEXT NOT NULL,
                    food_type TEXT NOT NULL DEFAULT '',
                    notes TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    server_updated_at TEXT
                );

                CREATE TABLE IF NOT EXISTS sync_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    client_id TEXT NOT NULL,
                    operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
                    payload TEXT,
                    base_updated_at TEXT,
                    created_at TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT
                );

                CREATE TABLE IF NOT EXISTS conflicts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    client_id TEXT NOT NULL,
                    local_data TEXT NOT NULL,
                    server_data TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    resolved INTEGER NOT NULL DEFAULT 0,
                    resolved_at TEXT,
                    resolution TEXT
                );

                CREATE TABLE IF NOT EXISTS sync_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_feeding_records_feeding_time ON feeding_records(feeding_time);
                CREATE INDEX IF NOT EXISTS idx_sync_queue_client_id ON sync_queue(client_id);
                CREATE INDEX IF NOT EXISTS idx_conflicts_resolved ON conflicts(resolved);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.tick()
    }

    // --- Row mapping helpers ---

    fn record_from_row(row: &rusqlite::Row) -> rusqlite::Result<LocalRecord> {
        Ok(LocalRecord {
            id: row.get(0)?,
            client_id: uuid_at(row, 1)?,
            server_id: row.get(2)?,
            feeding_time: timestamp_at(row, 3)?,
            food_type: row.get(4)?,
            notes: row.get(5)?,
            created_at: timestamp_at(row, 6)?,
            updated_at: timestamp_at(row, 7)?,
            server_updated_at: opt_timestamp_at(row, 8)?,
        })
    }

    fn outbox_from_row(row: &rusqlite::Row) -> rusqlite::Result<OutboxEntry> {
        let operation: String = row.get(2)?;
        Ok(OutboxEntry {
            id: row.get(0)?,
            client_id: uuid_at(row, 1)?,
            operation: operation
                .parse()
                .map_err(|e| conversion_error(2, e))?,
            payload: row
                .get::<_, Option<String>>(3)?
                .map(|json| serde_json::from_str(&json).map_err(|e| conversion_error(3, e)))
                .transpose()?,
            base_updated_at: opt_timestamp_at(row, 4)?,
            created_at: timestamp_at(row, 5)?,
            retry_count: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn conflict_from_row(row: &rusqlite::Row) -> rusqlite::Result<ConflictRecord> {
        Ok(ConflictRecord {
            id: row.get(0)?,
            client_id: uuid_at(row, 1)?,
            local_data: json_at(row, 2)?,
            server_data: json_at(row, 3)?,
            timestamp: timestamp_at(row, 4)?,
            resolved: row.get(5)?,
            resolved_at: opt_timestamp_at(row, 6)?,
            resolution: row
                .get::<_, Option<String>>(7)?
                .map(|r| r.parse::<Resolution>().map_err(|e| conversion_error(7, e)))
                .transpose()?,
        })
    }

    // --- Feeding records ---

    /// Create a record with a fresh client id and queue it for push.
    pub fn create_feeding(&self, payload: &FeedingPayload) -> Result<LocalRecord> {
        let client_id = Uuid::new_v4();
        let now = format_timestamp(self.now());
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO feeding_records (client_id, feeding_time, food_type, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                client_id.to_string(),
                format_timestamp(payload.feeding_time),
                payload.food_type,
                payload.notes,
                now,
            ],
        )?;
        enqueue(&tx, client_id, OutboxOperation::Create, Some(payload), None, &now)?;
        tx.commit()?;
        self.get_feeding(client_id)?
            .context("Feeding record missing after insert")
    }

    pub fn get_feeding(&self, client_id: Uuid) -> Result<Option<LocalRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM feeding_records WHERE client_id = ?1"),
                params![client_id.to_string()],
                Self::record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Apply an edit locally and queue an update based on the last server
    /// version this device has seen.
    pub fn update_feeding(&self, client_id: Uuid, edit: &FeedingEdit) -> Result<LocalRecord> {
        let Some(existing) = self.get_feeding(client_id)? else {
            bail!("Feeding record not found: {client_id}");
        };
        if edit.is_empty() {
            return Ok(existing);
        }

        let payload = FeedingPayload {
            feeding_time: edit.feeding_time.unwrap_or(existing.feeding_time),
            food_type: edit.food_type.clone().unwrap_or(existing.food_type),
            notes: edit.notes.clone().unwrap_or(existing.notes),
        };
        let now = format_timestamp(self.now());
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE feeding_records SET feeding_time = ?1, food_type = ?2, notes = ?3, updated_at = ?4
             WHERE client_id = ?5",
            params![
                format_timestamp(payload.feeding_time),
                payload.food_type,
                payload.notes,
                now,
                client_id.to_string(),
            ],
        )?;
        enqueue(
            &tx,
            client_id,
            OutboxOperation::Update,
            Some(&payload),
            existing.server_updated_at,
            &now,
        )?;
        tx.commit()?;
        self.get_feeding(client_id)?
            .context("Feeding record missing after update")
    }

    /// Delete locally. A record the server has never seen just drops its
    /// queued create; otherwise a delete is queued.
    pub fn delete_feeding(&self, client_id: Uuid) -> Result<bool> {
        let id = client_id.to_string();
        let tx = self.conn.unchecked_transaction()?;
        let rows = tx.execute("DELETE FROM feeding_records WHERE client_id = ?1", params![id])?;
        if rows == 0 {
            return Ok(false);
        }

        let pending_create: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sync_queue WHERE client_id = ?1 AND operation = 'create')",
            params![id],
            |row| row.get(0),
        )?;
        if pending_create {
            tx.execute("DELETE FROM sync_queue WHERE client_id = ?1", params![id])?;
        } else {
            let now = format_timestamp(self.now());
            enqueue(&tx, client_id, OutboxOperation::Delete, None, None, &now)?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn list_feedings(&self, query: &ListQuery) -> Result<Page<LocalRecord>> {
        let pattern = query.search_pattern();
        let filter = "(?1 IS NULL OR LOWER(food_type) LIKE ?1 ESCAPE '\\' OR LOWER(notes) LIKE ?1 ESCAPE '\\')";

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM feeding_records WHERE {filter}"),
            params![pattern],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM feeding_records WHERE {filter}
             ORDER BY feeding_time {sort}, id {sort} LIMIT ?2 OFFSET ?3",
            sort = query.sort.as_sql(),
        ))?;
        let feedings = stmt
            .query_map(
                params![pattern, query.limit(), query.offset()],
                Self::record_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            feedings,
            total,
            limit: query.limit(),
            offset: query.offset(),
        })
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(DatabaseStats {
            feeding_records: count("SELECT COUNT(*) FROM feeding_records")?,
            unresolved_conflicts: count("SELECT COUNT(*) FROM conflicts WHERE resolved = 0")?,
            queued_operations: count("SELECT COUNT(*) FROM sync_queue")?,
        })
    }

    /// Wipe every local table, including sync bookkeeping.
    pub fn clear_all(&self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
             DELETE FROM feeding_records;
             DELETE FROM sync_queue;
             DELETE FROM conflicts;
             DELETE FROM sync_state;
             COMMIT;",
        )?;
        Ok(())
    }

    // --- Outbox ---

    /// Queued operations in creation order.
    pub fn pending_operations(&self) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM sync_queue ORDER BY id ASC"
        ))?;
        let entries = stmt
            .query_map([], Self::outbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn record_failure(&self, entry_id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ?1 WHERE id = ?2",
            params![error, entry_id],
        )?;
        Ok(())
    }

    pub fn remove_operation(&self, entry_id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM sync_queue WHERE id = ?1", params![entry_id])?;
        Ok(rows > 0)
    }

    /// Settle a pushed create or update: drop the entry, adopt the server's
    /// id and version, and move later entries for the record that were based
    /// on the version this push replaced onto the new one.
    pub fn acknowledge_push(&self, entry: &OutboxEntry, server: &FeedingRecord) -> Result<()> {
        let id = entry.client_id.to_string();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![entry.id])?;
        tx.execute(
            "UPDATE feeding_records SET server_id = ?1, server_updated_at = ?2 WHERE client_id = ?3",
            params![server.server_id, format_timestamp(server.updated_at), id],
        )?;
        tx.execute(
            "UPDATE sync_queue SET base_updated_at = ?1
             WHERE client_id = ?2 AND operation = 'update' AND base_updated_at IS ?3",
            params![
                format_timestamp(server.updated_at),
                id,
                entry.base_updated_at.map(format_timestamp),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- Pull merge ---

    /// Merge one pull page in a single transaction and advance the
    /// watermark past everything it contained.
    ///
    /// Records with queued local operations keep their local fields; the
    /// queued push settles them against the server version.
    pub fn apply_pull(&self, batch: &PullBatch) -> Result<MergeSummary> {
        let mut summary = MergeSummary::default();
        let tx = self.conn.unchecked_transaction()?;

        for record in &batch.records {
            let pending: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM sync_queue WHERE client_id = ?1)",
                params![record.client_id.to_string()],
                |row| row.get(0),
            )?;
            if pending {
                summary.deferred += 1;
                continue;
            }
            upsert_server_record(&tx, record)?;
            summary.applied += 1;
        }

        let now = format_timestamp(self.now());
        for tombstone in &batch.deleted {
            let id = tombstone.client_id.to_string();
            let rows = tx.execute("DELETE FROM feeding_records WHERE client_id = ?1", params![id])?;
            tx.execute("DELETE FROM sync_queue WHERE client_id = ?1", params![id])?;
            tx.execute(
                "UPDATE conflicts SET resolved = 1, resolved_at = ?1, resolution = ?2
                 WHERE client_id = ?3 AND resolved = 0",
                params![now, Resolution::DeletedOnServer.as_str(), id],
            )?;
            summary.deleted += rows;
        }

        if let Some(mark) = batch.high_water_mark() {
            let current = read_timestamp(&tx, WATERMARK_KEY)?.unwrap_or_else(epoch);
            if mark > current {
                write_state(&tx, WATERMARK_KEY, &format_timestamp(mark))?;
            }
        }
        write_state(
            &tx,
            LAST_PULL_SERVER_TIME_KEY,
            &format_timestamp(batch.server_time),
        )?;
        tx.commit()?;
        Ok(summary)
    }

    /// Latest server `updated_at`/`deleted_at` consumed; the epoch before the
    /// first pull.
    pub fn watermark(&self) -> Result<DateTime<Utc>> {
        Ok(read_timestamp(&self.conn, WATERMARK_KEY)?.unwrap_or_else(epoch))
    }

    pub fn last_pull_server_time(&self) -> Result<Option<DateTime<Utc>>> {
        read_timestamp(&self.conn, LAST_PULL_SERVER_TIME_KEY)
    }

    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        read_timestamp(&self.conn, LAST_SYNC_KEY)
    }

    pub fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        write_state(&self.conn, LAST_SYNC_KEY, &format_timestamp(at))
    }

    // --- Conflicts ---

    /// Log a conflict and drop the outbox entry that raised it.
    pub fn record_conflict(
        &self,
        entry_id: i64,
        client_id: Uuid,
        local: &FeedingPayload,
        server: &FeedingRecord,
    ) -> Result<ConflictRecord> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO conflicts (client_id, local_data, server_data, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                client_id.to_string(),
                serde_json::to_string(local)?,
                serde_json::to_string(server)?,
                format_timestamp(self.now()),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![entry_id])?;
        tx.commit()?;
        self.get_conflict(id)
    }

    pub fn get_conflict(&self, id: i64) -> Result<ConflictRecord> {
        self.conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1"),
                params![id],
                Self::conflict_from_row,
            )
            .with_context(|| format!("Conflict not found: {id}"))
    }

    pub fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE ?1 OR resolved = 0 ORDER BY id ASC"
        ))?;
        let conflicts = stmt
            .query_map(params![include_resolved], Self::conflict_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    /// Replace the local copy with the server's version.
    pub fn resolve_keep_server(&self, conflict: &ConflictRecord) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        upsert_server_record(&tx, &conflict.server_data)?;
        mark_resolved(&tx, conflict.id, Resolution::KeepServer, self.now())?;
        tx.commit()?;
        Ok(())
    }

    /// Restore the local version and queue it as an update based on the
    /// server version that won the conflict.
    pub fn resolve_keep_local(&self, conflict: &ConflictRecord) -> Result<()> {
        let server = &conflict.server_data;
        let local = &conflict.local_data;
        let now = format_timestamp(self.now());
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO feeding_records (client_id, server_id, feeding_time, food_type, notes,
                                          created_at, updated_at, server_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(client_id) DO UPDATE SET
                server_id = excluded.server_id,
                feeding_time = excluded.feeding_time,
                food_type = excluded.food_type,
                notes = excluded.notes,
                updated_at = excluded.updated_at,
                server_updated_at = excluded.server_updated_at",
            params![
                conflict.client_id.to_string(),
                server.server_id,
                format_timestamp(local.feeding_time),
                local.food_type,
                local.notes,
                format_timestamp(server.created_at),
                now,
                format_timestamp(server.updated_at),
            ],
        )?;
        enqueue(
            &tx,
            conflict.client_id,
            OutboxOperation::Update,
            Some(local),
            Some(server.updated_at),
            &now,
        )?;
        mark_resolved(&tx, conflict.id, Resolution::KeepLocal, self.now())?;
        tx.commit()?;
        Ok(())
    }

    // --- Migration status cache ---

    pub fn cached_migration_status(&self) -> Result<Option<(MigrationStatus, DateTime<Utc>)>> {
        let Some(status) = read_state(&self.conn, MIGRATION_STATUS_KEY)? else {
            return Ok(None);
        };
        let Some(checked_at) = read_timestamp(&self.conn, MIGRATION_CHECKED_KEY)? else {
            return Ok(None);
        };
        Ok(Some((status.parse()?, checked_at)))
    }

    pub fn cache_migration_status(
        &self,
        status: MigrationStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        write_state(&tx, MIGRATION_STATUS_KEY, status.as_str())?;
        write_state(&tx, MIGRATION_CHECKED_KEY, &format_timestamp(checked_at))?;
        tx.commit()?;
        Ok(())
    }

    pub fn clear_migration_cache(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_state WHERE key IN (?1, ?2)",
            params![MIGRATION_STATUS_KEY, MIGRATION_CHECKED_KEY],
        )?;
        Ok(())
    }
}

fn enqueue(
    conn: &Connection,
    client_id: Uuid,
    operation: OutboxOperation,
    payload: Option<&FeedingPayload>,
    base_updated_at: Option<DateTime<Utc>>,
    now: &str,
) -> Result<()> {
    let payload = payload.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO sync_queue (client_id, operation, payload, base_updated_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            client_id.to_string(),
            operation.as_str(),
            payload,
            base_updated_at.map(format_timestamp),
            now,
        ],
    )?;
    Ok(())
}

/// Overwrite or insert the local copy from a server record. The local
/// `created_at` of an existing row is kept.
fn upsert_server_record(conn: &Connection, record: &FeedingRecord) -> Result<()> {
    let updated_at = format_timestamp(record.updated_at);
    conn.execute(
        "INSERT INTO feeding_records (client_id, server_id, feeding_time, food_type, notes,
                                      created_at, updated_at, server_updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(client_id) DO UPDATE SET
            server_id = excluded.server_id,
            feeding_time = excluded.feeding_time,
            food_type = excluded.food_type,
            notes = excluded.notes,
            updated_at = excluded.updated_at,
            server_updated_at = excluded.server_updated_at",
        params![
            record.client_id.to_string(),
            record.server_id,
            format_timestamp(record.feeding_time),
            record.food_type,
            record.notes,
            format_timestamp(record.created_at),
            updated_at,
        ],
    )?;
    Ok(())
}

fn mark_resolved(
    conn: &Connection,
    id: i64,
    resolution: Resolution,
    at: DateTime<Utc>,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE conflicts SET resolved = 1, resolved_at = ?1, resolution = ?2
         WHERE id = ?3 AND resolved = 0",
        params![format_timestamp(at), resolution.as_str(), id],
    )?;
    if rows == 0 {
        bail!("Conflict {id} is already resolved");
    }
    Ok(())
}

fn read_state(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn write_state(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn read_timestamp(conn: &Connection, key: &str) -> Result<Option<DateTime<Utc>>> {
    read_state(conn, key)?
        .map(|value| {
            parse_stored(&value).with_context(|| format!("Corrupt timestamp in sync_state.{key}"))
        })
        .transpose()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_stored(&value).map_err(|e| conversion_error(idx, e))
}

fn opt_timestamp_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|value| parse_stored(&value).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn uuid_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Uuid> {
    let value: String = row.get(idx)?;
    Uuid::parse_str(&value).map_err(|e| conversion_error(idx, e))
}

fn json_at<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    serde_json::from_str(&value).map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SortOrder, Tombstone};
    use chrono::{Duration, TimeZone};

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn payload(food: &str) -> FeedingPayload {
        FeedingPayload::new(ts(10, 0), Some(food.to_string()), None)
    }

    fn server_record(client_id: Uuid, food: &str, updated_at: DateTime<Utc>) -> FeedingRecord {
        FeedingRecord {
            server_id: 7,
            client_id,
            feeding_time: ts(10, 0),
            food_type: food.to_string(),
            notes: String::new(),
            created_at: ts(9, 0),
            updated_at,
        }
    }

    fn batch(records: Vec<FeedingRecord>, deleted: Vec<Tombstone>) -> PullBatch {
        PullBatch {
            records,
            deleted,
            since: epoch(),
            server_time: ts(12, 0),
        }
    }

    #[test]
    fn test_create_queues_outbox_entry() {
        let db = Database::open_in_memory().unwrap();
        let record = db.create_feeding(&payload("formula")).unwrap();

        assert_eq!(record.client_id.get_version_num(), 4);
        assert_eq!(record.food_type, "formula");
        assert_eq!(record.notes, "");
        assert!(record.server_id.is_none());

        let ops = db.pending_operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, OutboxOperation::Create);
        assert_eq!(ops[0].client_id, record.client_id);
        assert_eq!(ops[0].payload.as_ref().unwrap().food_type, "formula");
        assert_eq!(ops[0].base_updated_at, None);
        assert_eq!(ops[0].retry_count, 0);
    }

    #[test]
    fn test_update_bases_on_server_version() {
        let db = Database::open_in_memory().unwrap();
        let record = db.create_feeding(&payload("formula")).unwrap();
        let create = db.pending_operations().unwrap().remove(0);
        let server = server_record(record.client_id, "formula", ts(11, 0));
        db.acknowledge_push(&create, &server).unwrap();

        let edit = FeedingEdit {
            notes: Some("spit up".to_string()),
            ..FeedingEdit::default()
        };
        let updated = db.update_feeding(record.client_id, &edit).unwrap();
        assert_eq!(updated.notes, "spit up");
        assert_eq!(updated.food_type, "formula");
        assert!(updated.updated_at > record.updated_at);
        assert_eq!(updated.server_id, Some(7));

        let ops = db.pending_operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, OutboxOperation::Update);
        assert_eq!(ops[0].base_updated_at, Some(ts(11, 0)));
    }

    #[test]
    fn test_update_missing_record_fails() {
        let db = Database::open_in_memory().unwrap();
        let edit = FeedingEdit {
            notes: Some("x".to_string()),
            ..FeedingEdit::default()
        };
        assert!(db.update_feeding(Uuid::new_v4(), &edit).is_err());
    }

    #[test]
    fn test_delete_unpushed_record_drops_queue() {
        let db = Database::open_in_memory().unwrap();
        let record = db.create_feeding(&payload("formula")).unwrap();
        assert!(db.delete_feeding(record.client_id).unwrap());
        assert!(db.pending_operations().unwrap().is_empty());
        assert!(!db.delete_feeding(record.client_id).unwrap());
    }

    #[test]
    fn test_delete_pushed_record_queues_delete() {
        let db = Database::open_in_memory().unwrap();
        let record = db.create_feeding(&payload("formula")).unwrap();
        let create = db.pending_operations().unwrap().remove(0);
        db.acknowledge_push(&create, &server_record(record.client_id, "formula", ts(11, 0)))
            .unwrap();

        assert!(db.delete_feeding(record.client_id).unwrap());
        let ops = db.pending_operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, OutboxOperation::Delete);
        assert!(ops[0].payload.is_none());
        assert!(db.get_feeding(record.client_id).unwrap().is_none());
    }

    #[test]
    fn test_acknowledge_rebases_later_updates() {
        let db = Database::open_in_memory().unwrap();
        let record = db.create_feeding(&payload("formula")).unwrap();
        let edit = FeedingEdit {
            food_type: Some("breast milk".to_string()),
            ..FeedingEdit::default()
        };
        db.update_feeding(record.client_id, &edit).unwrap();

        let ops = db.pending_operations().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].base_updated_at, None);

        db.acknowledge_push(&ops[0], &server_record(record.client_id, "formula", ts(11, 0)))
            .unwrap();
        let ops = db.pending_operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].base_updated_at, Some(ts(11, 0)));

        let local = db.get_feeding(record.client_id).unwrap().unwrap();
        assert_eq!(local.server_id, Some(7));
        assert_eq!(local.server_updated_at, Some(ts(11, 0)));
    }

    #[test]
    fn test_record_failure_increments_retry() {
        let db = Database::open_in_memory().unwrap();
        db.create_feeding(&payload("formula")).unwrap();
        let entry = db.pending_operations().unwrap().remove(0);
        db.record_failure(entry.id, "boom").unwrap();
        db.record_failure(entry.id, "boom again").unwrap();

        let entry = db.pending_operations().unwrap().remove(0);
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn test_list_sort_search_and_paging() {
        let db = Database::open_in_memory().unwrap();
        for (i, food) in ["Formula", "Banana", "formula 50%"].iter().enumerate() {
            let mut p = payload(food);
            p.feeding_time = ts(8, 0) + Duration::hours(i64::try_from(i).unwrap());
            db.create_feeding(&p).unwrap();
        }

        let page = db.list_feedings(&ListQuery::default()).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.limit, 50);
        assert_eq!(page.feedings[0].food_type, "formula 50%");

        let page = db
            .list_feedings(&ListQuery {
                sort: SortOrder::Asc,
                limit: Some(1),
                offset: Some(1),
                ..ListQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.feedings.len(), 1);
        assert_eq!(page.feedings[0].food_type, "Banana");

        let page = db
            .list_feedings(&ListQuery {
                search: Some("FORMULA".to_string()),
                ..ListQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 2);

        let page = db
            .list_feedings(&ListQuery {
                search: Some("50%".to_string()),
                ..ListQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn test_apply_pull_inserts_updates_and_deletes() {
        let db = Database::open_in_memory().unwrap();
        let remote_id = Uuid::new_v4();
        let summary = db
            .apply_pull(&batch(vec![server_record(remote_id, "formula", ts(11, 0))], vec![]))
            .unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(db.watermark().unwrap(), ts(11, 0));
        assert_eq!(db.last_pull_server_time().unwrap(), Some(ts(12, 0)));

        let local = db.get_feeding(remote_id).unwrap().unwrap();
        assert_eq!(local.server_id, Some(7));
        assert_eq!(local.server_updated_at, Some(ts(11, 0)));
        assert!(db.pending_operations().unwrap().is_empty());

        db.apply_pull(&batch(vec![server_record(remote_id, "solids", ts(11, 30))], vec![]))
            .unwrap();
        assert_eq!(db.get_feeding(remote_id).unwrap().unwrap().food_type, "solids");

        let summary = db
            .apply_pull(&batch(
                vec![],
                vec![Tombstone {
                    client_id: remote_id,
                    deleted_at: ts(11, 45),
                }],
            ))
            .unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(db.get_feeding(remote_id).unwrap().is_none());
        assert_eq!(db.watermark().unwrap(), ts(11, 45));
    }

    #[test]
    fn test_apply_pull_defers_records_with_local_edits() {
        let db = Database::open_in_memory().unwrap();
        let record = db.create_feeding(&payload("formula")).unwrap();
        let summary = db
            .apply_pull(&batch(
                vec![server_record(record.client_id, "server", ts(11, 0))],
                vec![],
            ))
            .unwrap();
        assert_eq!(summary.deferred, 1);
        assert_eq!(
            db.get_feeding(record.client_id).unwrap().unwrap().food_type,
            "formula"
        );
    }

    #[test]
    fn test_watermark_never_moves_backwards() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.watermark().unwrap(), epoch());
        db.apply_pull(&batch(vec![server_record(Uuid::new_v4(), "a", ts(11, 0))], vec![]))
            .unwrap();
        db.apply_pull(&batch(vec![server_record(Uuid::new_v4(), "b", ts(10, 0))], vec![]))
            .unwrap();
        assert_eq!(db.watermark().unwrap(), ts(11, 0));
    }

    #[test]
    fn test_conflict_keep_server() {
        let db = Database::open_in_memory().unwrap();
        let record = db.create_feeding(&payload("formula")).unwrap();
        let entry = db.pending_operations().unwrap().remove(0);
        let server = server_record(record.client_id, "server wins", ts(11, 0));

        let conflict = db
            .record_conflict(entry.id, record.client_id, &record.payload(), &server)
            .unwrap();
        assert!(!conflict.resolved);
        assert_eq!(conflict.server_data, server);
        assert!(db.pending_operations().unwrap().is_empty());
        assert_eq!(db.stats().unwrap().unresolved_conflicts, 1);

        db.resolve_keep_server(&conflict).unwrap();
        let local = db.get_feeding(record.client_id).unwrap().unwrap();
        assert_eq!(local.food_type, "server wins");
        assert_eq!(local.server_updated_at, Some(ts(11, 0)));

        let resolved = db.get_conflict(conflict.id).unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution, Some(Resolution::KeepServer));
        assert!(resolved.resolved_at.is_some());
        assert!(db.list_conflicts(false).unwrap().is_empty());
        assert_eq!(db.list_conflicts(true).unwrap().len(), 1);

        assert!(db.resolve_keep_server(&conflict).is_err());
    }

    #[test]
    fn test_conflict_keep_local_requeues_update() {
        let db = Database::open_in_memory().unwrap();
        let record = db.create_feeding(&payload("mine")).unwrap();
        let entry = db.pending_operations().unwrap().remove(0);
        let server = server_record(record.client_id, "theirs", ts(11, 0));
        let conflict = db
            .record_conflict(entry.id, record.client_id, &record.payload(), &server)
            .unwrap();

        db.resolve_keep_local(&conflict).unwrap();
        let local = db.get_feeding(record.client_id).unwrap().unwrap();
        assert_eq!(local.food_type, "mine");
        assert_eq!(local.server_id, Some(7));

        let ops = db.pending_operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, OutboxOperation::Update);
        assert_eq!(ops[0].base_updated_at, Some(ts(11, 0)));
        assert_eq!(
            db.get_conflict(conflict.id).unwrap().resolution,
            Some(Resolution::KeepLocal)
        );
    }

    #[test]
    fn test_stats_and_clear_all() {
        let db = Database::open_in_memory().unwrap();
        db.create_feeding(&payload("a")).unwrap();
        db.create_feeding(&payload("b")).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.feeding_records, 2);
        assert_eq!(stats.queued_operations, 2);
        assert_eq!(stats.unresolved_conflicts, 0);

        db.set_last_sync_at(ts(12, 0)).unwrap();
        db.clear_all().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.feeding_records, 0);
        assert_eq!(stats.queued_operations, 0);
        assert_eq!(db.last_sync_at().unwrap(), None);
    }

    #[test]
    fn test_migration_cache_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.cached_migration_status().unwrap().is_none());
        db.cache_migration_status(MigrationStatus::Complete, ts(9, 0))
            .unwrap();
        assert_eq!(
            db.cached_migration_status().unwrap(),
            Some((MigrationStatus::Complete, ts(9, 0)))
        );
        db.clear_migration_cache().unwrap();
        assert!(db.cached_migration_status().unwrap().is_none());
    }

    #[test]
    fn test_reopen_on_disk_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedlog.db");
        let client_id = {
            let db = Database::open(&path).unwrap();
            db.create_feeding(&payload("formula")).unwrap().client_id
        };
        let db = Database::open(&path).unwrap();
        assert!(db.get_feeding(client_id).unwrap().is_some());
        assert_eq!(db.pending_operations().unwrap().len(), 1);
    }
}
