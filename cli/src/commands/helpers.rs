use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use feedlog_core::models::{ConflictRecord, LocalRecord};

/// Render a UTC timestamp in the user's timezone.
pub(crate) fn format_local(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

pub(crate) fn print_feeding_table(records: &[LocalRecord]) {
    #[derive(Tabled)]
    struct FeedingRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "Food")]
        food: String,
        #[tabled(rename = "Notes")]
        notes: String,
        #[tabled(rename = "Server ID")]
        server_id: String,
    }

    let rows: Vec<FeedingRow> = records
        .iter()
        .map(|r| FeedingRow {
            id: short_id(&r.client_id),
            time: format_local(r.feeding_time),
            food: truncate(&r.food_type, 20),
            notes: truncate(&r.notes, 35),
            server_id: r.server_id.map_or("-".into(), |id| id.to_string()),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(4..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_conflict_table(conflicts: &[ConflictRecord]) {
    #[derive(Tabled)]
    struct ConflictRow {
        #[tabled(rename = "#")]
        id: i64,
        #[tabled(rename = "Feeding")]
        feeding: String,
        #[tabled(rename = "Local")]
        local: String,
        #[tabled(rename = "Server")]
        server: String,
        #[tabled(rename = "Detected")]
        detected: String,
        #[tabled(rename = "Status")]
        status: String,
    }

    let side = |time: DateTime<Utc>, food: &str, notes: &str| {
        let mut text = format_local(time);
        if !food.is_empty() {
            text.push(' ');
            text.push_str(&truncate(food, 15));
        }
        if !notes.is_empty() {
            text.push_str(&format!(" ({})", truncate(notes, 20)));
        }
        text
    };

    let rows: Vec<ConflictRow> = conflicts
        .iter()
        .map(|c| ConflictRow {
            id: c.id,
            feeding: short_id(&c.client_id),
            local: side(
                c.local_data.feeding_time,
                &c.local_data.food_type,
                &c.local_data.notes,
            ),
            server: side(
                c.server_data.feeding_time,
                &c.server_data.food_type,
                &c.server_data.notes,
            ),
            detected: format_local(c.timestamp),
            status: c
                .resolution
                .map_or("open".into(), |r| r.as_str().to_string()),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
