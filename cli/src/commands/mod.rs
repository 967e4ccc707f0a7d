mod conflicts;
mod helpers;
mod migrate;
mod records;
mod sync;

pub(crate) use conflicts::{cmd_conflicts_list, cmd_conflicts_resolve};
pub(crate) use migrate::{
    MigrationTarget, cmd_migrate_backfill, cmd_migrate_run, cmd_migrate_status,
};
pub(crate) use records::{cmd_add, cmd_delete, cmd_edit, cmd_list, cmd_reset, cmd_stats};
pub(crate) use sync::{cmd_sync, cmd_sync_watch};
