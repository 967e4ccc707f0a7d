//! Durable conflict log and human-chosen resolution. Nothing here resolves a
//! conflict on its own.

use anyhow::{Result, bail};
use tracing::info;

use crate::db::Database;
use crate::models::{ConflictRecord, Resolution};

pub struct ConflictResolver<'a> {
    db: &'a Database,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn unresolved(&self) -> Result<Vec<ConflictRecord>> {
        self.db.list_conflicts(false)
    }

    pub fn all(&self) -> Result<Vec<ConflictRecord>> {
        self.db.list_conflicts(true)
    }

    /// Apply the chosen side. `KeepServer` overwrites the local copy;
    /// `KeepLocal` queues the local version as an update on top of the
    /// server version, to be pushed on the next sync.
    ///
    /// Conflicts on records the server has since deleted are closed by the
    /// pull that delivers the tombstone and cannot be resolved here.
    pub fn resolve(&self, conflict_id: i64, resolution: Resolution) -> Result<ConflictRecord> {
        let conflict = self.db.get_conflict(conflict_id)?;
        if conflict.resolved {
            bail!("Conflict {conflict_id} is already resolved");
        }

        match resolution {
            Resolution::KeepServer => self.db.resolve_keep_server(&conflict)?,
            Resolution::KeepLocal => self.db.resolve_keep_local(&conflict)?,
            Resolution::DeletedOnServer => {
                bail!("Conflicts can only be resolved by keeping the local or server version")
            }
        }
        info!(
            conflict_id,
            client_id = %conflict.client_id,
            resolution = resolution.as_str(),
            "conflict resolved"
        );
        self.db.get_conflict(conflict_id)
    }

    /// Resolve every open conflict the same way. Returns how many were
    /// resolved.
    pub fn resolve_all(&self, resolution: Resolution) -> Result<usize> {
        let open = self.unresolved()?;
        for conflict in &open {
            self.resolve(conflict.id, resolution)?;
        }
        Ok(open.len())
    }
}
