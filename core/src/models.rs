use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::time::parse_timestamp;

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// A feeding as held by the server of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedingRecord {
    #[serde(rename = "id")]
    pub server_id: i64,
    pub client_id: Uuid,
    pub feeding_time: DateTime<Utc>,
    pub food_type: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeedingRecord {
    #[must_use]
    pub fn payload(&self) -> FeedingPayload {
        FeedingPayload {
            feeding_time: self.feeding_time,
            food_type: self.food_type.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// The user-editable fields of a feeding. Also the body of every create and
/// update that travels through the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedingPayload {
    pub feeding_time: DateTime<Utc>,
    #[serde(default)]
    pub food_type: String,
    #[serde(default)]
    pub notes: String,
}

impl FeedingPayload {
    pub fn new(
        feeding_time: DateTime<Utc>,
        food_type: Option<String>,
        notes: Option<String>,
    ) -> Self {
        Self {
            feeding_time,
            food_type: food_type.unwrap_or_default(),
            notes: notes.unwrap_or_default(),
        }
    }
}

/// Raw feeding fields as received from a client, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedingInput {
    pub feeding_time: Option<String>,
    pub food_type: Option<String>,
    pub notes: Option<String>,
}

impl FeedingInput {
    /// Normalize into a payload. `feeding_time` is required; `food_type` and
    /// `notes` default to empty strings.
    pub fn into_payload(self) -> Result<FeedingPayload> {
        let feeding_time = validate_feeding_time(self.feeding_time.as_deref())?;
        Ok(FeedingPayload::new(feeding_time, self.food_type, self.notes))
    }
}

/// A server-side deletion, pulled by other devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub client_id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Updated { feeding: FeedingRecord },
    /// The server copy changed after the caller's base version. Nothing was
    /// written; the server's current record is returned for reconciliation.
    Conflict { server_record: FeedingRecord },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// One page of a pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullBatch {
    pub records: Vec<FeedingRecord>,
    #[serde(default)]
    pub deleted: Vec<Tombstone>,
    pub since: DateTime<Utc>,
    pub server_time: DateTime<Utc>,
}

impl PullBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len() + self.deleted.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.deleted.is_empty()
    }

    /// Highest `updated_at` / `deleted_at` in this batch.
    #[must_use]
    pub fn high_water_mark(&self) -> Option<DateTime<Utc>> {
        let updated = self.records.iter().map(|r| r.updated_at);
        let deleted = self.deleted.iter().map(|t| t.deleted_at);
        updated.chain(deleted).max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(Error::validation(format!(
                "Invalid sort '{s}'. Must be asc or desc"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub sort: SortOrder,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub search: Option<String>,
}

impl ListQuery {
    #[must_use]
    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    /// Lowercased `LIKE` pattern for a non-blank search. Wildcards in the
    /// term are escaped with a backslash.
    #[must_use]
    pub fn search_pattern(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub feedings: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

// --- Local (device) shapes ---

/// A feeding as held on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: i64,
    pub client_id: Uuid,
    pub server_id: Option<i64>,
    pub feeding_time: DateTime<Utc>,
    pub food_type: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last server version this device has seen; the base for conflict
    /// detection. `None` until the record has been pushed or pulled.
    pub server_updated_at: Option<DateTime<Utc>>,
}

impl LocalRecord {
    #[must_use]
    pub fn payload(&self) -> FeedingPayload {
        FeedingPayload {
            feeding_time: self.feeding_time,
            food_type: self.food_type.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// Partial edit of a local record; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct FeedingEdit {
    pub feeding_time: Option<DateTime<Utc>>,
    pub food_type: Option<String>,
    pub notes: Option<String>,
}

impl FeedingEdit {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.feeding_time.is_none() && self.food_type.is_none() && self.notes.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxOperation {
    Create,
    Update,
    Delete,
}

impl OutboxOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OutboxOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(Error::validation(format!("Unknown outbox operation '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub client_id: Uuid,
    pub operation: OutboxOperation,
    /// Record fields at mutation time; `None` for deletes.
    pub payload: Option<FeedingPayload>,
    pub base_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub retry_count: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepServer,
    /// Closed by a pull: the server deleted the record, so neither side is
    /// left to keep.
    DeletedOnServer,
}

impl Resolution {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepServer => "keep_server",
            Self::DeletedOnServer => "deleted_on_server",
        }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "keep_local" | "local" => Ok(Self::KeepLocal),
            "keep_server" | "server" => Ok(Self::KeepServer),
            "deleted_on_server" => Ok(Self::DeletedOnServer),
            _ => Err(Error::validation(format!(
                "Invalid resolution '{s}'. Must be local or server"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub client_id: Uuid,
    pub local_data: FeedingPayload,
    pub server_data: FeedingRecord,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub feeding_records: i64,
    pub unresolved_conflicts: i64,
    pub queued_operations: i64,
}

/// Outcome of merging one pull page into the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub applied: usize,
    pub deleted: usize,
    /// Records left untouched because local edits are still queued.
    pub deferred: usize,
}

// --- Validation ---

/// `%term%` for a case-insensitive `LIKE` match with backslash escapes.
#[must_use]
pub fn like_pattern(term: &str) -> String {
    let escaped = term
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

pub fn validate_feeding_time(value: Option<&str>) -> Result<DateTime<Utc>> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::validation("feeding_time is required"))?;
    parse_timestamp(value)
        .map_err(|_| Error::validation(format!("Invalid feeding_time '{value}'")))
}

/// Client identifiers are caller-supplied: validated as a non-nil UUID, then
/// trusted.
pub fn parse_client_id(value: &str) -> Result<Uuid> {
    let id = Uuid::parse_str(value.trim())
        .map_err(|_| Error::validation(format!("Invalid client_id '{value}'")))?;
    if id.is_nil() {
        return Err(Error::validation("client_id must not be the nil UUID"));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(updated_at: DateTime<Utc>) -> FeedingRecord {
        FeedingRecord {
            server_id: 1,
            client_id: Uuid::new_v4(),
            feeding_time: updated_at,
            food_type: "formula".to_string(),
            notes: String::new(),
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn test_feeding_input_defaults_empty_strings() {
        let payload = FeedingInput {
            feeding_time: Some("2024-01-01T10:00:00Z".to_string()),
            food_type: None,
            notes: None,
        }
        .into_payload()
        .unwrap();
        assert_eq!(payload.food_type, "");
        assert_eq!(payload.notes, "");
        assert_eq!(
            payload.feeding_time,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_feeding_time_required() {
        let err = FeedingInput::default().into_payload().unwrap_err();
        assert_eq!(err.to_string(), "feeding_time is required");
        assert!(validate_feeding_time(Some("  ")).is_err());
        assert!(validate_feeding_time(Some("yesterday-ish")).is_err());
    }

    #[test]
    fn test_parse_client_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_client_id(&id.to_string()).unwrap(), id);
        assert!(parse_client_id("not-a-uuid").is_err());
        assert!(parse_client_id(&Uuid::nil().to_string()).is_err());
    }

    #[test]
    fn test_record_serializes_server_id_as_id() {
        let rec = record(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["id"], 1);
        assert!(json.get("server_id").is_none());
        assert_eq!(json["client_id"], rec.client_id.to_string());
    }

    #[test]
    fn test_update_outcome_tagging() {
        let rec = record(Utc::now());
        let json = serde_json::to_value(UpdateOutcome::Conflict {
            server_record: rec.clone(),
        })
        .unwrap();
        assert_eq!(json["result"], "conflict");
        assert_eq!(json["server_record"]["client_id"], rec.client_id.to_string());
    }

    #[test]
    fn test_high_water_mark_spans_records_and_tombstones() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
        let batch = PullBatch {
            records: vec![record(t1)],
            deleted: vec![Tombstone {
                client_id: Uuid::new_v4(),
                deleted_at: t2,
            }],
            since: t1,
            server_time: t2,
        };
        assert_eq!(batch.high_water_mark(), Some(t2));
        assert_eq!(batch.len(), 2);

        let empty = PullBatch {
            records: vec![],
            deleted: vec![],
            since: t1,
            server_time: t2,
        };
        assert!(empty.is_empty());
        assert_eq!(empty.high_water_mark(), None);
    }

    #[test]
    fn test_list_query_bounds() {
        let q = ListQuery {
            limit: Some(0),
            offset: Some(-5),
            search: Some("  ".to_string()),
            ..ListQuery::default()
        };
        assert_eq!(q.limit(), 1);
        assert_eq!(q.offset(), 0);
        assert_eq!(q.search_pattern(), None);
        assert_eq!(ListQuery::default().limit(), DEFAULT_PAGE_LIMIT);

        let q = ListQuery {
            search: Some("Formula".to_string()),
            ..ListQuery::default()
        };
        assert_eq!(q.search_pattern().as_deref(), Some("%formula%"));
        assert_eq!(like_pattern("50%_x"), "%50\\%\\_x%");
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("ASC".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert!("sideways".parse::<SortOrder>().is_err());
        assert_eq!(
            "update".parse::<OutboxOperation>().unwrap(),
            OutboxOperation::Update
        );
        assert_eq!(
            "keep-server".parse::<Resolution>().unwrap(),
            Resolution::KeepServer
        );
        assert_eq!("local".parse::<Resolution>().unwrap(), Resolution::KeepLocal);
        let closed: Resolution = Resolution::DeletedOnServer.as_str().parse().unwrap();
        assert_eq!(closed, Resolution::DeletedOnServer);
    }
}
