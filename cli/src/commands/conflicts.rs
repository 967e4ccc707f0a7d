use anyhow::{Result, bail};

use feedlog_core::models::Resolution;
use feedlog_core::service::FeedlogService;

use super::helpers::{format_local, print_conflict_table};

pub(crate) fn cmd_conflicts_list(service: &FeedlogService, all: bool, json: bool) -> Result<()> {
    let conflicts = service.conflicts(all)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }
    print_conflict_table(&conflicts);
    Ok(())
}

pub(crate) fn cmd_conflicts_resolve(
    service: &FeedlogService,
    id: Option<i64>,
    all: bool,
    keep: &str,
    json: bool,
) -> Result<()> {
    let resolution: Resolution = keep.parse()?;

    match (id, all) {
        (Some(id), false) => {
            let conflict = service.resolve_conflict(id, resolution)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&conflict)?);
            } else {
                let resolved_at = conflict.resolved_at.map(format_local).unwrap_or_default();
                println!(
                    "Resolved conflict {id} ({}) at {resolved_at}",
                    resolution.as_str()
                );
                if resolution == Resolution::KeepLocal {
                    println!("The local version will be pushed on the next sync.");
                }
            }
        }
        (None, true) => {
            let count = service.resolve_all_conflicts(resolution)?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "resolved": count, "resolution": resolution })
                );
            } else {
                println!("Resolved {count} conflict(s) ({})", resolution.as_str());
            }
        }
        _ => bail!("Pass either a conflict id or --all"),
    }
    Ok(())
}
