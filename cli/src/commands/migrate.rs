use anyhow::Result;

use feedlog_core::migration::{
    self, BackfillReport, MigrationCounts, MigrationReport, MigrationStatus,
};
use feedlog_core::server::ServerStore;
use feedlog_core::sync::SyncRemote;

use crate::remote::HttpRemote;

/// Where a migration command runs: through a server's API, or directly on a
/// server database file.
pub(crate) enum MigrationTarget {
    Remote(HttpRemote),
    Direct(ServerStore),
}

impl MigrationTarget {
    async fn status(&self) -> feedlog_core::Result<MigrationCounts> {
        match self {
            Self::Remote(remote) => remote.migration_status().await,
            Self::Direct(store) => migration::migration_status(store).await,
        }
    }

    async fn run(&self) -> feedlog_core::Result<MigrationReport> {
        match self {
            Self::Remote(remote) => remote.run_migration().await,
            Self::Direct(store) => Ok(migration::run_migration(store).await),
        }
    }

    async fn backfill(&self) -> feedlog_core::Result<BackfillReport> {
        match self {
            Self::Remote(remote) => remote.backfill_client_ids().await,
            Self::Direct(store) => migration::backfill_client_ids(store).await,
        }
    }

    async fn close(&self) {
        if let Self::Direct(store) = self {
            store.close().await;
        }
    }
}

fn print_counts(counts: &MigrationCounts) {
    let label = match counts.migration_status {
        MigrationStatus::NotStarted => "not started",
        MigrationStatus::InProgress => "in progress",
        MigrationStatus::Complete => "complete",
        MigrationStatus::NoData => "no data",
    };
    println!("Status:    {label}");
    println!("Column:    {}", if counts.column_exists { "present" } else { "missing" });
    println!(
        "Records:   {} of {} migrated ({}%)",
        counts.migrated_records, counts.total_records, counts.progress_percentage
    );
    if counts.remaining_records > 0 {
        println!("Remaining: {}", counts.remaining_records);
    }
}

pub(crate) async fn cmd_migrate_status(target: &MigrationTarget, json: bool) -> Result<()> {
    let counts = target.status().await;
    target.close().await;
    let counts = counts?;

    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        print_counts(&counts);
    }
    Ok(())
}

pub(crate) async fn cmd_migrate_run(target: &MigrationTarget, json: bool) -> Result<()> {
    let report = target.run().await;
    target.close().await;
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.message);
        if report.column_added {
            println!("Added client_id column and indexes.");
        }
        if report.backfilled > 0 {
            println!("Assigned client ids to {} record(s).", report.backfilled);
        }
        print_counts(&report.counts);
    }

    if !report.success {
        anyhow::bail!(
            "Migration failed: {}",
            report.error.unwrap_or(report.message)
        );
    }
    Ok(())
}

pub(crate) async fn cmd_migrate_backfill(target: &MigrationTarget, json: bool) -> Result<()> {
    let report = target.backfill().await;
    target.close().await;
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.message);
        for row in &report.sample {
            println!("  {} -> {}", row.id, row.client_id);
        }
        if report.remaining_records > 0 {
            println!("{} record(s) still without a client id.", report.remaining_records);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::store;

    #[tokio::test]
    async fn direct_target_migrates_database_file() {
        let (_dir, server) = store(false).await;
        let target = MigrationTarget::Direct(server.clone());

        let counts = target.status().await.unwrap();
        assert_eq!(counts.migration_status, MigrationStatus::NotStarted);
        assert!(target.backfill().await.is_err());

        let report = target.run().await.unwrap();
        assert!(report.success);
        assert_eq!(report.counts.migration_status, MigrationStatus::NoData);
        assert_eq!(target.backfill().await.unwrap().updated_count, 0);
    }
}
