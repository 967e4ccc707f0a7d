use std::path::Path;

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::conflict::ConflictResolver;
use crate::db::Database;
use crate::migration::MigrationStatus;
use crate::models::{
    ConflictRecord, DatabaseStats, FeedingEdit, FeedingInput, ListQuery, LocalRecord, Page,
    Resolution, parse_client_id,
};
use crate::sync::{SyncEngine, SyncRemote, SyncSummary};
use crate::time::parse_timestamp;

/// How long a device trusts a cached "migration complete" answer before
/// asking the server again.
pub const MIGRATION_CACHE_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Full,
    PushOnly,
    PullOnly,
}

/// Device-side facade: feeding CRUD against the local store, conflict
/// resolution, and sync sessions against a remote.
pub struct FeedlogService {
    db: Database,
}

impl FeedlogService {
    pub fn new(db_path: &Path) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self { db })
    }

    pub fn new_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self { db })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // --- Feedings ---

    pub fn add_feeding(
        &self,
        feeding_time: &str,
        food_type: Option<String>,
        notes: Option<String>,
    ) -> Result<LocalRecord> {
        let payload = FeedingInput {
            feeding_time: Some(feeding_time.to_string()),
            food_type,
            notes,
        }
        .into_payload()?;
        self.db.create_feeding(&payload)
    }

    pub fn get_feeding(&self, client_id: &str) -> Result<Option<LocalRecord>> {
        self.db.get_feeding(parse_client_id(client_id)?)
    }

    pub fn edit_feeding(
        &self,
        client_id: &str,
        feeding_time: Option<&str>,
        food_type: Option<String>,
        notes: Option<String>,
    ) -> Result<LocalRecord> {
        let edit = FeedingEdit {
            feeding_time: feeding_time.map(parse_timestamp).transpose()?,
            food_type,
            notes,
        };
        if edit.is_empty() {
            bail!("Nothing to update. Pass --time, --food or --notes.");
        }
        self.db.update_feeding(parse_client_id(client_id)?, &edit)
    }

    pub fn delete_feeding(&self, client_id: &str) -> Result<bool> {
        self.db.delete_feeding(parse_client_id(client_id)?)
    }

    pub fn list_feedings(&self, query: &ListQuery) -> Result<Page<LocalRecord>> {
        self.db.list_feedings(query)
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        self.db.stats()
    }

    pub fn clear_all(&self) -> Result<()> {
        self.db.clear_all()
    }

    // --- Conflicts ---

    pub fn conflicts(&self, include_resolved: bool) -> Result<Vec<ConflictRecord>> {
        let resolver = ConflictResolver::new(&self.db);
        if include_resolved {
            resolver.all()
        } else {
            resolver.unresolved()
        }
    }

    pub fn resolve_conflict(&self, id: i64, resolution: Resolution) -> Result<ConflictRecord> {
        ConflictResolver::new(&self.db).resolve(id, resolution)
    }

    pub fn resolve_all_conflicts(&self, resolution: Resolution) -> Result<usize> {
        ConflictResolver::new(&self.db).resolve_all(resolution)
    }

    // --- Sync ---

    /// Make sure the server can accept client ids before syncing. A cached
    /// ready status is trusted for 24 hours; otherwise the server is asked,
    /// and migrated when it is not ready.
    pub async fn ensure_server_migrated<R: SyncRemote + ?Sized>(
        &self,
        remote: &R,
    ) -> Result<MigrationStatus> {
        let now = Utc::now();
        if let Some((status, checked_at)) = self.db.cached_migration_status()? {
            if status.is_ready() && cache_is_fresh(checked_at, now) {
                debug!(%status, "using cached migration status");
                return Ok(status);
            }
        }

        let counts = remote.migration_status().await?;
        let status = if counts.migration_status.is_ready() {
            counts.migration_status
        } else {
            info!(
                status = %counts.migration_status,
                remaining = counts.remaining_records,
                "server needs migration; running it"
            );
            let report = remote.run_migration().await?;
            if !report.success {
                bail!(
                    "Server migration failed: {}",
                    report.error.unwrap_or(report.message)
                );
            }
            report.counts.migration_status
        };

        if status.is_ready() {
            self.db.cache_migration_status(status, now)?;
        } else {
            self.db.clear_migration_cache()?;
        }
        Ok(status)
    }

    pub async fn sync<R: SyncRemote + ?Sized>(
        &self,
        remote: &R,
        mode: SyncMode,
    ) -> Result<SyncSummary> {
        let status = self.ensure_server_migrated(remote).await?;
        if !status.is_ready() {
            bail!("Server migration is {status}; sync needs it complete");
        }

        let engine = SyncEngine::new(&self.db, remote);
        match mode {
            SyncMode::Full => engine.sync().await,
            SyncMode::PushOnly => Ok(SyncSummary {
                push: engine.push().await?,
                pull: None,
            }),
            SyncMode::PullOnly => Ok(SyncSummary {
                push: crate::sync::PushSummary::default(),
                pull: Some(engine.pull().await?),
            }),
        }
    }
}

fn cache_is_fresh(checked_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(checked_at) < Duration::hours(MIGRATION_CACHE_TTL_HOURS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::{insert_legacy_row, legacy_store};

    #[test]
    fn test_add_feeding_validates_and_defaults() {
        let service = FeedlogService::new_in_memory().unwrap();
        let record = service
            .add_feeding("2024-01-01T10:00:00Z", None, None)
            .unwrap();
        assert_eq!(record.food_type, "");
        assert_eq!(record.notes, "");
        assert_eq!(service.stats().unwrap().queued_operations, 1);

        assert!(service.add_feeding("", None, None).is_err());
        assert!(service.add_feeding("last tuesday", None, None).is_err());
        assert_eq!(service.stats().unwrap().feeding_records, 1);
    }

    #[test]
    fn test_edit_and_delete_by_client_id_string() {
        let service = FeedlogService::new_in_memory().unwrap();
        let record = service
            .add_feeding("2024-01-01T10:00:00Z", Some("formula".to_string()), None)
            .unwrap();
        let id = record.client_id.to_string();

        assert!(service.edit_feeding(&id, None, None, None).is_err());
        let edited = service
            .edit_feeding(&id, Some("2024-01-01T11:00:00Z"), None, Some("fussy".to_string()))
            .unwrap();
        assert_eq!(edited.notes, "fussy");
        assert_eq!(edited.food_type, "formula");
        assert_eq!(
            edited.feeding_time,
            parse_timestamp("2024-01-01T11:00:00Z").unwrap()
        );

        assert!(service.edit_feeding("nope", None, None, Some("x".to_string())).is_err());
        assert!(service.delete_feeding(&id).unwrap());
        assert!(service.get_feeding(&id).unwrap().is_none());
    }

    #[test]
    fn test_cache_freshness_window() {
        let checked = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        assert!(cache_is_fresh(checked, checked + Duration::hours(23)));
        assert!(!cache_is_fresh(checked, checked + Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_sync_auto_migrates_legacy_server() {
        let (_dir, server) = legacy_store().await;
        insert_legacy_row(&server, "formula", "2023-12-31T08:00:00.000000Z").await;
        let service = FeedlogService::new_in_memory().unwrap();
        service
            .add_feeding("2024-01-01T10:00:00Z", Some("banana".to_string()), None)
            .unwrap();

        let summary = service.sync(&server, SyncMode::Full).await.unwrap();
        assert_eq!(summary.push.pushed, 1);
        assert_eq!(summary.pull.unwrap().applied, 2);
        assert_eq!(service.stats().unwrap().feeding_records, 2);

        let (status, _) = service.db().cached_migration_status().unwrap().unwrap();
        assert_eq!(status, MigrationStatus::Complete);
    }

    #[tokio::test]
    async fn test_stale_cache_is_revalidated() {
        let (_dir, server) = legacy_store().await;
        let service = FeedlogService::new_in_memory().unwrap();
        let long_ago = Utc::now() - Duration::hours(25);
        service
            .db()
            .cache_migration_status(MigrationStatus::Complete, long_ago)
            .unwrap();

        let status = service.ensure_server_migrated(&server).await.unwrap();
        assert_eq!(status, MigrationStatus::NoData);
        assert!(server.client_id_column_exists().await.unwrap());
        let (_, checked_at) = service.db().cached_migration_status().unwrap().unwrap();
        assert!(checked_at > long_ago);
    }

    #[tokio::test]
    async fn test_pull_only_leaves_outbox_alone() {
        let (_dir, server) = legacy_store().await;
        let service = FeedlogService::new_in_memory().unwrap();
        service
            .add_feeding("2024-01-01T10:00:00Z", None, None)
            .unwrap();
        let summary = service.sync(&server, SyncMode::PullOnly).await.unwrap();
        assert_eq!(summary.push.pushed, 0);
        assert!(summary.pull.is_some());
        assert_eq!(service.stats().unwrap().queued_operations, 1);

        let summary = service.sync(&server, SyncMode::PushOnly).await.unwrap();
        assert_eq!(summary.push.pushed, 1);
        assert!(summary.pull.is_none());
    }
}
