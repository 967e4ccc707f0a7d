//! Evolution of the server's `feeding_records` table to carry client
//! identifiers, and the backfill of rows written before it did.
//!
//! Every entry point is safe to run repeatedly and concurrently: the DDL is
//! skipped once the column exists, and each backfilled row is guarded by
//! `client_id IS NULL`.

use std::fmt;
use std::str::FromStr;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::server::ServerStore;
use crate::time::format_timestamp;

pub const BACKFILL_BATCH_SIZE: i64 = 100;
const BACKFILL_SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    NoData,
}

impl MigrationStatus {
    /// Status from live counts. Never persisted on the server.
    #[must_use]
    pub fn derive(column_exists: bool, total: i64, migrated: i64) -> Self {
        if !column_exists {
            Self::NotStarted
        } else if total == 0 {
            Self::NoData
        } else if migrated >= total {
            Self::Complete
        } else if migrated == 0 {
            Self::NotStarted
        } else {
            Self::InProgress
        }
    }

    /// Whether sync can run without further migration.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Complete | Self::NoData)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::NoData => "no_data",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "no_data" => Ok(Self::NoData),
            _ => Err(Error::validation(format!("Unknown migration status '{s}'"))),
        }
    }
}

/// Live migration counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigrationCounts {
    pub migration_status: MigrationStatus,
    pub column_exists: bool,
    pub total_records: i64,
    pub migrated_records: i64,
    pub remaining_records: i64,
    pub progress_percentage: i64,
}

impl MigrationCounts {
    #[must_use]
    pub fn new(column_exists: bool, total: i64, migrated: i64) -> Self {
        let (total, migrated) = if column_exists { (total, migrated) } else { (0, 0) };
        Self {
            migration_status: MigrationStatus::derive(column_exists, total, migrated),
            column_exists,
            total_records: total,
            migrated_records: migrated,
            remaining_records: total - migrated,
            progress_percentage: progress_percentage(migrated, total),
        }
    }
}

/// `round(migrated / total * 100)`, 0 when there is nothing to migrate.
fn progress_percentage(migrated: i64, total: i64) -> i64 {
    if total <= 0 {
        0
    } else {
        (migrated * 200 + total) / (total * 2)
    }
}

/// Outcome of [`run_migration`]. Failures are reported here, never raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub counts: MigrationCounts,
    #[serde(default)]
    pub column_added: bool,
    #[serde(default)]
    pub backfilled: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfilledRow {
    pub id: i64,
    pub client_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillReport {
    pub success: bool,
    pub message: String,
    pub updated_count: i64,
    pub remaining_records: i64,
    /// Up to ten of the identifiers assigned.
    pub sample: Vec<BackfilledRow>,
}

/// Read-only status from live counts.
pub async fn migration_status(store: &ServerStore) -> Result<MigrationCounts> {
    if !store.client_id_column_exists().await? {
        return Ok(MigrationCounts::new(false, 0, 0));
    }
    let (total, migrated): (i64, i64) =
        sqlx::query_as("SELECT COUNT(*), COUNT(client_id) FROM feeding_records")
            .fetch_one(store.pool())
            .await?;
    Ok(MigrationCounts::new(true, total, migrated))
}

/// Add the column and indexes if needed, then backfill every row that lacks
/// a client id.
pub async fn run_migration(store: &ServerStore) -> MigrationReport {
    match try_run_migration(store).await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "client_id migration failed");
            let counts = migration_status(store).await.unwrap_or_default();
            MigrationReport {
                success: false,
                message: "Migration failed".to_string(),
                counts,
                column_added: false,
                backfilled: 0,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn try_run_migration(store: &ServerStore) -> Result<MigrationReport> {
    let column_added = add_client_id_column(store).await?;
    let (backfilled, _) = backfill(store).await?;
    let counts = migration_status(store).await?;

    let message = if !column_added && backfilled == 0 {
        "Migration already complete".to_string()
    } else {
        format!(
            "Migration finished: {} of {} records have client ids",
            counts.migrated_records, counts.total_records
        )
    };
    info!(
        column_added,
        backfilled,
        remaining = counts.remaining_records,
        status = %counts.migration_status,
        "client_id migration finished"
    );

    Ok(MigrationReport {
        success: true,
        message,
        counts,
        column_added,
        backfilled,
        error: None,
    })
}

/// Backfill only. The column must already exist.
pub async fn backfill_client_ids(store: &ServerStore) -> Result<BackfillReport> {
    if !store.client_id_column_exists().await? {
        return Err(Error::MigrationRequired);
    }
    let (updated_count, sample) = backfill(store).await?;
    let counts = migration_status(store).await?;
    Ok(BackfillReport {
        success: true,
        message: format!("Backfilled {updated_count} records"),
        updated_count,
        remaining_records: counts.remaining_records,
        sample,
    })
}

/// Returns whether this call added the column.
async fn add_client_id_column(store: &ServerStore) -> Result<bool> {
    let _gate = store.write_gate().await?;
    if store.client_id_column_exists().await? {
        debug!("client_id column already present");
        return Ok(false);
    }

    let mut tx = store.pool().begin().await?;
    if let Err(e) = apply_client_id_ddl(&mut tx).await {
        if let Err(rollback) = tx.rollback().await {
            warn!(error = %rollback, "rollback of client_id DDL failed");
        }
        return Err(e);
    }
    tx.commit().await?;
    store.mark_client_ids_ready();
    info!("added client_id column to feeding_records");
    Ok(true)
}

async fn apply_client_id_ddl(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    for statement in [
        "ALTER TABLE feeding_records ADD COLUMN client_id TEXT",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_feeding_records_client_id ON feeding_records(client_id)",
        "CREATE INDEX IF NOT EXISTS idx_feeding_records_updated_at ON feeding_records(updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_feeding_records_feeding_time ON feeding_records(feeding_time)",
    ] {
        sqlx::query(statement).execute(&mut **tx).await?;
    }
    Ok(())
}

/// Assign client ids batch by batch, oldest rows first. Each batch takes
/// the first still-null rows, so rows identified meanwhile are never
/// skipped over.
async fn backfill(store: &ServerStore) -> Result<(i64, Vec<BackfilledRow>)> {
    let mut updated = 0;
    let mut sample = Vec::new();

    loop {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM feeding_records
             WHERE client_id IS NULL
             ORDER BY created_at ASC, id ASC
             LIMIT ?1",
        )
        .bind(BACKFILL_BATCH_SIZE)
        .fetch_all(store.pool())
        .await?;
        if ids.is_empty() {
            break;
        }

        // Each update takes the write gate, so the fan-out is serialized at
        // the gate.
        let assigned: Vec<BackfilledRow> =
            try_join_all(ids.iter().map(|&id| assign_client_id(store, id)))
                .await?
                .into_iter()
                .flatten()
                .collect();
        if assigned.is_empty() {
            break;
        }

        updated += i64::try_from(assigned.len()).unwrap_or(i64::MAX);
        let room = BACKFILL_SAMPLE_SIZE.saturating_sub(sample.len());
        sample.extend(assigned.into_iter().take(room));
        debug!(batch = ids.len(), updated, "backfilled client_id batch");
    }

    Ok((updated, sample))
}

async fn assign_client_id(store: &ServerStore, id: i64) -> Result<Option<BackfilledRow>> {
    let client_id = Uuid::new_v4();
    let _gate = store.write_gate().await?;
    let now = format_timestamp(store.clock().tick());
    let result = sqlx::query(
        "UPDATE feeding_records SET client_id = ?1, updated_at = ?2
         WHERE id = ?3 AND client_id IS NULL",
    )
    .bind(client_id.to_string())
    .bind(now)
    .bind(id)
    .execute(store.pool())
    .await?;
    Ok((result.rows_affected() > 0).then_some(BackfilledRow { id, client_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::{insert_legacy_row, legacy_store, payload};
    use std::collections::HashSet;

    #[test]
    fn test_derive_status() {
        assert_eq!(MigrationStatus::derive(false, 10, 0), MigrationStatus::NotStarted);
        assert_eq!(MigrationStatus::derive(true, 0, 0), MigrationStatus::NoData);
        assert_eq!(MigrationStatus::derive(true, 10, 10), MigrationStatus::Complete);
        assert_eq!(MigrationStatus::derive(true, 10, 0), MigrationStatus::NotStarted);
        assert_eq!(MigrationStatus::derive(true, 10, 4), MigrationStatus::InProgress);
        assert!(MigrationStatus::NoData.is_ready());
        assert!(!MigrationStatus::InProgress.is_ready());
    }

    #[test]
    fn test_progress_percentage_rounds() {
        assert_eq!(progress_percentage(0, 0), 0);
        assert_eq!(progress_percentage(1, 3), 33);
        assert_eq!(progress_percentage(2, 3), 67);
        assert_eq!(progress_percentage(1, 200), 1);
        assert_eq!(progress_percentage(1, 201), 0);
        assert_eq!(progress_percentage(5, 5), 100);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_value(MigrationCounts::new(false, 0, 0)).unwrap();
        assert_eq!(json["migration_status"], "not_started");
        assert_eq!(json["column_exists"], false);
        assert_eq!("in_progress".parse::<MigrationStatus>().unwrap(), MigrationStatus::InProgress);
    }

    #[tokio::test]
    async fn test_status_without_column_is_not_started_with_zero_counts() {
        let (_dir, store) = legacy_store().await;
        insert_legacy_row(&store, "formula", "2024-01-01T08:00:00.000000Z").await;

        let counts = migration_status(&store).await.unwrap();
        assert_eq!(counts.migration_status, MigrationStatus::NotStarted);
        assert!(!counts.column_exists);
        assert_eq!(counts.total_records, 0);
        assert_eq!(counts.migrated_records, 0);
        assert_eq!(counts.remaining_records, 0);
        assert_eq!(counts.progress_percentage, 0);
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let (_dir, store) = legacy_store().await;
        for hour in 0..5 {
            insert_legacy_row(&store, "formula", &format!("2024-01-01T0{hour}:00:00.000000Z")).await;
        }

        let first = run_migration(&store).await;
        assert!(first.success, "{first:?}");
        assert!(first.column_added);
        assert_eq!(first.backfilled, 5);
        assert_eq!(first.counts.remaining_records, 0);
        assert_eq!(first.counts.migration_status, MigrationStatus::Complete);
        assert_eq!(first.counts.progress_percentage, 100);

        let second = run_migration(&store).await;
        assert!(second.success);
        assert!(!second.column_added);
        assert_eq!(second.backfilled, 0);
        assert_eq!(second.message, "Migration already complete");
        assert_eq!(second.counts, first.counts);
    }

    #[tokio::test]
    async fn test_backfill_assigns_distinct_v4_ids_across_batches() {
        let (_dir, store) = legacy_store().await;
        for i in 0..250 {
            insert_legacy_row(&store, "formula", &format!("2024-01-01T10:00:00.{i:06}Z")).await;
        }
        let report = run_migration(&store).await;
        assert!(report.success, "{report:?}");
        assert_eq!(report.backfilled, 250);

        let ids: Vec<Option<String>> = sqlx::query_scalar("SELECT client_id FROM feeding_records")
            .fetch_all(store.pool())
            .await
            .unwrap();
        let parsed: HashSet<Uuid> = ids
            .into_iter()
            .map(|id| Uuid::parse_str(&id.expect("every row identified")).unwrap())
            .collect();
        assert_eq!(parsed.len(), 250);
        assert!(parsed.iter().all(|id| id.get_version_num() == 4));
    }

    #[tokio::test]
    async fn test_backfill_requires_column() {
        let (_dir, store) = legacy_store().await;
        let err = backfill_client_ids(&store).await.unwrap_err();
        assert!(matches!(err, Error::MigrationRequired));
        assert_eq!(
            err.to_string(),
            "client_id column does not exist. Run migration first."
        );
    }

    #[tokio::test]
    async fn test_backfill_bumps_updated_at_and_reports_sample() {
        let (_dir, store) = legacy_store().await;
        assert!(run_migration(&store).await.success);
        for i in 0..12 {
            insert_legacy_row(&store, "banana", &format!("2023-06-01T10:{i:02}:00.000000Z")).await;
        }
        let counts = migration_status(&store).await.unwrap();
        assert_eq!(counts.migration_status, MigrationStatus::NotStarted);

        let report = backfill_client_ids(&store).await.unwrap();
        assert_eq!(report.updated_count, 12);
        assert_eq!(report.remaining_records, 0);
        assert_eq!(report.sample.len(), 10);

        let batch = store
            .changes_since(crate::time::parse_timestamp("2024-01-01T00:00:00Z").unwrap(), None)
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 12);
    }

    #[tokio::test]
    async fn test_partial_backfill_is_in_progress() {
        let (_dir, store) = legacy_store().await;
        assert!(run_migration(&store).await.success);
        store.create(None, &payload("formula")).await.unwrap();
        insert_legacy_row(&store, "banana", "2023-06-01T10:00:00.000000Z").await;

        let counts = migration_status(&store).await.unwrap();
        assert_eq!(counts.migration_status, MigrationStatus::InProgress);
        assert_eq!(counts.total_records, 2);
        assert_eq!(counts.remaining_records, 1);
        assert_eq!(counts.progress_percentage, 50);
    }

    #[tokio::test]
    async fn test_concurrent_runs_never_reassign() {
        let (_dir, store) = legacy_store().await;
        for i in 0..30 {
            insert_legacy_row(&store, "formula", &format!("2024-01-01T10:00:{i:02}.000000Z")).await;
        }
        let (a, b) = tokio::join!(run_migration(&store), run_migration(&store));
        assert!(a.success && b.success);
        assert_eq!(a.backfilled + b.backfilled, 30);
        assert_eq!(
            migration_status(&store).await.unwrap().migration_status,
            MigrationStatus::Complete
        );
    }
}
