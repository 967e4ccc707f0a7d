//! Offline-first sync: drain the local outbox to a remote, then pull what
//! changed on the server since this device's watermark.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::Error;
use crate::migration::{self, MigrationCounts, MigrationReport};
use crate::models::{
    DeleteOutcome, FeedingPayload, FeedingRecord, OutboxEntry, OutboxOperation, PullBatch,
    UpdateOutcome,
};
use crate::server::ServerStore;

pub const DEFAULT_PAGE_SIZE: usize = 500;

/// The server side of a sync session.
#[async_trait]
pub trait SyncRemote: Send + Sync {
    async fn push_create(
        &self,
        client_id: Uuid,
        payload: &FeedingPayload,
    ) -> crate::Result<FeedingRecord>;

    async fn push_update(
        &self,
        client_id: Uuid,
        payload: &FeedingPayload,
        base: Option<DateTime<Utc>>,
    ) -> crate::Result<UpdateOutcome>;

    async fn push_delete(&self, client_id: Uuid) -> crate::Result<DeleteOutcome>;

    async fn pull(&self, since: DateTime<Utc>, limit: Option<i64>) -> crate::Result<PullBatch>;

    async fn migration_status(&self) -> crate::Result<MigrationCounts>;

    async fn run_migration(&self) -> crate::Result<MigrationReport>;
}

#[async_trait]
impl SyncRemote for ServerStore {
    async fn push_create(
        &self,
        client_id: Uuid,
        payload: &FeedingPayload,
    ) -> crate::Result<FeedingRecord> {
        self.create(Some(client_id), payload).await
    }

    async fn push_update(
        &self,
        client_id: Uuid,
        payload: &FeedingPayload,
        base: Option<DateTime<Utc>>,
    ) -> crate::Result<UpdateOutcome> {
        self.update_by_client_id(client_id, payload, base).await
    }

    async fn push_delete(&self, client_id: Uuid) -> crate::Result<DeleteOutcome> {
        Ok(if self.delete_by_client_id(client_id).await? {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    async fn pull(&self, since: DateTime<Utc>, limit: Option<i64>) -> crate::Result<PullBatch> {
        self.changes_since(since, limit).await
    }

    async fn migration_status(&self) -> crate::Result<MigrationCounts> {
        migration::migration_status(self).await
    }

    async fn run_migration(&self) -> crate::Result<MigrationReport> {
        Ok(migration::run_migration(self).await)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub pushed: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Entries held back because an earlier entry for the same record failed.
    pub skipped: usize,
    /// The remote was unavailable and the cycle stopped early.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    pub pages: usize,
    pub applied: usize,
    pub deleted: usize,
    pub deferred: usize,
    pub watermark: DateTime<Utc>,
    pub server_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub push: PushSummary,
    /// `None` when the push found the remote unavailable.
    pub pull: Option<PullSummary>,
}

enum EntryOutcome {
    Acknowledged,
    Conflict,
    Failed(Error),
}

/// Drives push and pull for one local store against one remote.
pub struct SyncEngine<'a, R: SyncRemote + ?Sized> {
    db: &'a Database,
    remote: &'a R,
    page_size: usize,
}

impl<'a, R: SyncRemote + ?Sized> SyncEngine<'a, R> {
    pub fn new(db: &'a Database, remote: &'a R) -> Self {
        Self {
            db,
            remote,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Push, then pull unless the push found the remote unavailable.
    pub async fn sync(&self) -> Result<SyncSummary> {
        let push = self.push().await?;
        let pull = if push.interrupted {
            None
        } else {
            Some(self.pull().await?)
        };
        self.db.set_last_sync_at(Utc::now())?;
        Ok(SyncSummary { push, pull })
    }

    /// Send queued operations in creation order.
    ///
    /// Local store failures abort the cycle; remote failures are recorded on
    /// the entry. An unavailable remote stops the cycle, any other failure
    /// holds back later entries for the same record only.
    pub async fn push(&self) -> Result<PushSummary> {
        let mut summary = PushSummary::default();
        let mut blocked: HashSet<Uuid> = HashSet::new();

        for entry in self.db.pending_operations()? {
            if blocked.contains(&entry.client_id) {
                summary.skipped += 1;
                continue;
            }

            match self.push_entry(&entry).await? {
                EntryOutcome::Acknowledged => summary.pushed += 1,
                EntryOutcome::Conflict => summary.conflicts += 1,
                EntryOutcome::Failed(err) => {
                    summary.failed += 1;
                    self.db.record_failure(entry.id, &err.to_string())?;
                    warn!(
                        client_id = %entry.client_id,
                        operation = %entry.operation,
                        retry_count = entry.retry_count + 1,
                        error = %err,
                        "push failed"
                    );
                    if err.is_retryable() {
                        summary.interrupted = true;
                        break;
                    }
                    blocked.insert(entry.client_id);
                }
            }
        }

        info!(
            pushed = summary.pushed,
            conflicts = summary.conflicts,
            failed = summary.failed,
            skipped = summary.skipped,
            "push finished"
        );
        Ok(summary)
    }

    async fn push_entry(&self, entry: &OutboxEntry) -> Result<EntryOutcome> {
        debug!(
            id = entry.id,
            client_id = %entry.client_id,
            operation = %entry.operation,
            "pushing outbox entry"
        );

        if entry.operation == OutboxOperation::Delete {
            return match self.remote.push_delete(entry.client_id).await {
                Ok(outcome) => {
                    if outcome == DeleteOutcome::NotFound {
                        debug!(client_id = %entry.client_id, "already deleted on server");
                    }
                    self.db.remove_operation(entry.id)?;
                    Ok(EntryOutcome::Acknowledged)
                }
                Err(e) => Ok(EntryOutcome::Failed(e)),
            };
        }

        let Some(payload) = entry.payload.as_ref() else {
            return Ok(EntryOutcome::Failed(Error::validation(format!(
                "{} entry {} has no payload",
                entry.operation, entry.id
            ))));
        };

        let result = if entry.operation == OutboxOperation::Create {
            self.remote
                .push_create(entry.client_id, payload)
                .await
                .map(|feeding| UpdateOutcome::Updated { feeding })
        } else {
            let base = match entry.base_updated_at {
                Some(base) => Some(base),
                None => self
                    .db
                    .get_feeding(entry.client_id)?
                    .and_then(|local| local.server_updated_at),
            };
            self.remote
                .push_update(entry.client_id, payload, base)
                .await
        };

        match result {
            Ok(UpdateOutcome::Updated { feeding }) => {
                self.db.acknowledge_push(entry, &feeding)?;
                Ok(EntryOutcome::Acknowledged)
            }
            Ok(UpdateOutcome::Conflict { server_record }) => {
                let conflict = self
                    .db
                    .record_conflict(entry.id, entry.client_id, payload, &server_record)?;
                warn!(
                    conflict_id = conflict.id,
                    client_id = %entry.client_id,
                    "server copy changed since last sync; conflict recorded"
                );
                Ok(EntryOutcome::Conflict)
            }
            Err(e) => Ok(EntryOutcome::Failed(e)),
        }
    }

    /// Fetch pages after the watermark until a short page, merging each one
    /// in its own local transaction.
    pub async fn pull(&self) -> Result<PullSummary> {
        let limit = i64::try_from(self.page_size).unwrap_or(i64::MAX);
        let mut since = self.db.watermark()?;
        let mut summary = PullSummary {
            pages: 0,
            applied: 0,
            deleted: 0,
            deferred: 0,
            watermark: since,
            server_time: None,
        };

        loop {
            let batch = self
                .remote
                .pull(since, Some(limit))
                .await
                .with_context(|| format!("Failed to pull changes since {since}"))?;
            let merged = self.db.apply_pull(&batch)?;

            summary.pages += 1;
            summary.applied += merged.applied;
            summary.deleted += merged.deleted;
            summary.deferred += merged.deferred;
            summary.server_time = Some(batch.server_time);

            let next = self.db.watermark()?;
            debug!(
                page = summary.pages,
                items = batch.len(),
                watermark = %next,
                "pulled page"
            );
            if batch.len() < self.page_size || next <= since {
                since = next;
                break;
            }
            since = next;
        }

        summary.watermark = since;
        info!(
            applied = summary.applied,
            deleted = summary.deleted,
            deferred = summary.deferred,
            pages = summary.pages,
            "pull finished"
        );
        Ok(summary)
    }
}

/// Capped exponential delay for callers that re-run sync after an
/// unavailable remote.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `base * 2^attempt`, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
