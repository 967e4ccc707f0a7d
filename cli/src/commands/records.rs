use anyhow::Result;
use chrono::Utc;
use std::process;

use feedlog_core::models::{ListQuery, SortOrder};
use feedlog_core::service::FeedlogService;
use feedlog_core::time::format_timestamp;

use super::helpers::{format_local, json_error, print_feeding_table};

pub(crate) fn cmd_add(
    service: &FeedlogService,
    time: Option<String>,
    food: Option<String>,
    notes: Option<String>,
    json: bool,
) -> Result<()> {
    let time = time.unwrap_or_else(|| format_timestamp(Utc::now()));
    let record = service.add_feeding(&time, food, notes)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        let food = if record.food_type.is_empty() {
            "feeding"
        } else {
            record.food_type.as_str()
        };
        println!(
            "Logged {food} at {} ({})",
            format_local(record.feeding_time),
            record.client_id
        );
    }
    Ok(())
}

pub(crate) fn cmd_edit(
    service: &FeedlogService,
    id: &str,
    time: Option<&str>,
    food: Option<String>,
    notes: Option<String>,
    json: bool,
) -> Result<()> {
    if service.get_feeding(id)?.is_none() {
        not_found(id, json);
    }
    let record = service.edit_feeding(id, time, food, notes)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!(
            "Updated feeding {}: {} {}",
            record.client_id,
            format_local(record.feeding_time),
            record.food_type
        );
    }
    Ok(())
}

pub(crate) fn cmd_delete(service: &FeedlogService, id: &str, json: bool) -> Result<()> {
    if service.delete_feeding(id)? {
        if json {
            println!("{}", serde_json::json!({ "deleted": id }));
        } else {
            println!("Deleted feeding {id}");
        }
        Ok(())
    } else {
        not_found(id, json)
    }
}

pub(crate) fn cmd_list(
    service: &FeedlogService,
    sort: &str,
    limit: i64,
    offset: i64,
    search: Option<String>,
    json: bool,
) -> Result<()> {
    let query = ListQuery {
        sort: sort.parse::<SortOrder>()?,
        limit: Some(limit),
        offset: Some(offset),
        search,
    };
    let page = service.list_feedings(&query)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    if page.feedings.is_empty() {
        println!("No feedings found.");
        return Ok(());
    }
    print_feeding_table(&page.feedings);
    let last = page.offset + i64::try_from(page.feedings.len())?;
    println!("Showing {}-{last} of {}", page.offset + 1, page.total);
    Ok(())
}

pub(crate) fn cmd_stats(service: &FeedlogService, json: bool) -> Result<()> {
    let stats = service.stats()?;
    let last_sync = service.db().last_sync_at()?;
    let last_pull = service.db().last_pull_server_time()?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "feeding_records": stats.feeding_records,
                "unresolved_conflicts": stats.unresolved_conflicts,
                "queued_operations": stats.queued_operations,
                "last_sync_at": last_sync,
                "last_pull_server_time": last_pull,
            })
        );
    } else {
        println!("Feedings:             {}", stats.feeding_records);
        println!("Queued operations:    {}", stats.queued_operations);
        println!("Unresolved conflicts: {}", stats.unresolved_conflicts);
        match last_sync {
            Some(ts) => println!("Last sync:            {}", format_local(ts)),
            None => println!("Last sync:            never"),
        }
        if let Some(ts) = last_pull {
            println!("Server time at pull:  {}", format_local(ts));
        }
    }
    Ok(())
}

/// Wipe every local record, queued change, conflict and sync marker. The
/// next sync pulls everything from the server again.
pub(crate) fn cmd_reset(service: &FeedlogService, yes: bool, json: bool) -> Result<()> {
    if !yes {
        let stats = service.stats()?;
        anyhow::bail!(
            "This deletes {} feeding(s) and {} unsynced change(s) from this device. \
             Re-run with --yes to confirm.",
            stats.feeding_records,
            stats.queued_operations
        );
    }
    service.clear_all()?;
    if json {
        println!("{}", serde_json::json!({ "reset": true }));
    } else {
        println!("Local data cleared. Run `feedlog sync` to pull from the server.");
    }
    Ok(())
}

fn not_found(id: &str, json: bool) -> ! {
    if json {
        println!("{}", json_error(&format!("Feeding {id} not found")));
    } else {
        eprintln!("Feeding {id} not found");
    }
    process::exit(2);
}
