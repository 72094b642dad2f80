//! Append-only change history for assets and counterparties.

pub mod audit;

use crate::changes::{ChangeSet, display_value};
use crate::core::types::{parse_timestamp, timestamp_value};
use crate::core::{FieldMap, RecordId, RecordKind, Result, Row, StoreError, UserId};
use crate::storage::{Filter, RecordStore, SortDirection};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use audit::{AuditTrail, DeadLetter};

pub const USERS_TABLE: &str = "users";
const UNKNOWN_USER: &str = "Unknown user";

/// Closed set of history event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
    StatusChange,
    ComplianceUpdate,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::StatusChange => "status_change",
            Self::ComplianceUpdate => "compliance_update",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            "status_change" => Ok(Self::StatusChange),
            "compliance_update" => Ok(Self::ComplianceUpdate),
            other => Err(format!("unknown change type '{other}'")),
        }
    }
}

/// What a history entry records. The variant determines the change type.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryPayload {
    Created { snapshot: FieldMap },
    Updated { changes: ChangeSet },
    Deleted,
    StatusChange {
        previous_status: Option<String>,
        new_status: String,
    },
    ComplianceUpdate { details: Value },
}

impl HistoryPayload {
    pub fn change_type(&self) -> ChangeType {
        match self {
            Self::Created { .. } => ChangeType::Created,
            Self::Updated { .. } => ChangeType::Updated,
            Self::Deleted => ChangeType::Deleted,
            Self::StatusChange { .. } => ChangeType::StatusChange,
            Self::ComplianceUpdate { .. } => ChangeType::ComplianceUpdate,
        }
    }

    /// Body of the `changes` column.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Created { snapshot } => json!({ "snapshot": snapshot }),
            Self::Updated { changes } => {
                serde_json::to_value(changes).unwrap_or_else(|_| Value::Object(FieldMap::new()))
            }
            Self::Deleted => Value::Object(FieldMap::new()),
            Self::StatusChange {
                previous_status,
                new_status,
            } => json!({ "previous_status": previous_status, "new_status": new_status }),
            Self::ComplianceUpdate { details } => json!({ "details": details }),
        }
    }

    pub fn from_value(change_type: ChangeType, value: Value) -> std::result::Result<Self, String> {
        let payload = match change_type {
            ChangeType::Created => Self::Created {
                snapshot: value
                    .get("snapshot")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            },
            ChangeType::Updated => Self::Updated {
                changes: serde_json::from_value(value).map_err(|e| e.to_string())?,
            },
            ChangeType::Deleted => Self::Deleted,
            ChangeType::StatusChange => Self::StatusChange {
                previous_status: value
                    .get("previous_status")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                new_status: value
                    .get("new_status")
                    .and_then(Value::as_str)
                    .ok_or("status change without new_status")?
                    .to_string(),
            },
            ChangeType::ComplianceUpdate => Self::ComplianceUpdate {
                details: value.get("details").cloned().unwrap_or(Value::Null),
            },
        };
        Ok(payload)
    }
}

/// Immutable history row
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: RecordId,
    pub kind: RecordKind,
    pub record_id: RecordId,
    pub user_id: UserId,
    pub payload: HistoryPayload,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn change_type(&self) -> ChangeType {
        self.payload.change_type()
    }

    /// Timeline text, one line per statement.
    pub fn describe(&self) -> Vec<String> {
        let noun = capitalize(self.kind.noun());
        match &self.payload {
            HistoryPayload::Created { .. } => vec![format!("{noun} created")],
            HistoryPayload::Deleted => vec![format!("{noun} deleted")],
            HistoryPayload::StatusChange {
                previous_status,
                new_status,
            } => vec![format!(
                "Status changed from \"{}\" to \"{}\"",
                previous_status.as_deref().unwrap_or("empty"),
                new_status
            )],
            HistoryPayload::ComplianceUpdate { .. } => {
                vec!["Compliance information updated".to_string()]
            }
            HistoryPayload::Updated { changes } => changes
                .iter()
                .map(|c| {
                    format!(
                        "Changed {} from \"{}\" to \"{}\"",
                        c.field.replace('_', " "),
                        timeline_value(c.old.as_ref()),
                        timeline_value(c.new.as_ref())
                    )
                })
                .collect(),
        }
    }

    fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(self.kind.history_key().to_string(), self.record_id.to_value());
        row.insert("user_id".to_string(), self.user_id.to_value());
        row.insert(
            "change_type".to_string(),
            Value::String(self.change_type().as_str().to_string()),
        );
        row.insert("changes".to_string(), self.payload.to_value());
        row.insert(
            "reason".to_string(),
            self.reason.clone().map(Value::String).unwrap_or(Value::Null),
        );
        row.insert("created_at".to_string(), timestamp_value(self.created_at));
        row
    }

    fn from_row(kind: RecordKind, row: &Row) -> std::result::Result<Self, StoreError> {
        let decode = |what: &str| StoreError::Decode(format!("{}: {what}", kind.history_table()));

        let change_type = row
            .get("change_type")
            .and_then(Value::as_str)
            .ok_or_else(|| decode("missing change_type"))?
            .parse::<ChangeType>()
            .map_err(StoreError::Decode)?;
        let payload = HistoryPayload::from_value(
            change_type,
            row.get("changes").cloned().unwrap_or(Value::Null),
        )
        .map_err(StoreError::Decode)?;

        Ok(Self {
            id: row
                .get("id")
                .and_then(RecordId::from_value)
                .ok_or_else(|| decode("missing id"))?,
            kind,
            record_id: row
                .get(kind.history_key())
                .and_then(RecordId::from_value)
                .ok_or_else(|| decode("missing record reference"))?,
            user_id: row
                .get("user_id")
                .and_then(UserId::from_value)
                .ok_or_else(|| decode("missing user_id"))?,
            payload,
            reason: row.get("reason").and_then(Value::as_str).map(str::to_string),
            created_at: row
                .get("created_at")
                .and_then(parse_timestamp)
                .ok_or_else(|| decode("missing created_at"))?,
        })
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn timeline_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if s.is_empty() => "empty".to_string(),
        other => display_value(other, "empty"),
    }
}

/// History entry paired with the acting user's display name
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryView {
    pub entry: HistoryEntry,
    pub user_display: String,
}

/// Reads and appends history rows for one record kind.
#[derive(Clone)]
pub struct HistoryLog {
    store: Arc<dyn RecordStore>,
    kind: RecordKind,
    page_size: Option<usize>,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn RecordStore>, kind: RecordKind) -> Self {
        Self {
            store,
            kind,
            page_size: None,
        }
    }

    pub fn with_page_size(mut self, page_size: Option<usize>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Inserts a new entry stamped now. Existing entries are never touched.
    pub async fn append(
        &self,
        record_id: &RecordId,
        user_id: &UserId,
        payload: HistoryPayload,
        reason: Option<&str>,
    ) -> Result<HistoryEntry> {
        self.append_at(record_id, user_id, payload, reason, Utc::now())
            .await
    }

    /// Inserts a new entry for a change that happened at `created_at`.
    pub async fn append_at(
        &self,
        record_id: &RecordId,
        user_id: &UserId,
        payload: HistoryPayload,
        reason: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<HistoryEntry> {
        let draft = HistoryEntry {
            id: RecordId::new(""),
            kind: self.kind,
            record_id: record_id.clone(),
            user_id: user_id.clone(),
            payload,
            reason: reason.map(str::to_string),
            created_at,
        };

        let row = self
            .store
            .insert(self.kind.history_table(), draft.to_row())
            .await?;
        let id = row
            .get("id")
            .and_then(RecordId::from_value)
            .ok_or_else(|| StoreError::Decode("history insert returned no id".to_string()))?;

        Ok(HistoryEntry { id, ..draft })
    }

    /// Entries for a record, newest first, with user names resolved in a
    /// single batched lookup.
    pub async fn list(&self, record_id: &RecordId) -> Result<Vec<HistoryView>> {
        let mut filter = Filter::new()
            .eq(self.kind.history_key(), record_id.to_value())
            .order_by("created_at", SortDirection::Descending);
        if let Some(size) = self.page_size {
            filter = filter.limit(size);
        }

        let rows = self.store.select(self.kind.history_table(), &filter).await?;
        let entries = rows
            .iter()
            .map(|row| HistoryEntry::from_row(self.kind, row))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let names = self.resolve_users(&entries).await;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let user_display = names
                    .get(&entry.user_id)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_USER.to_string());
                HistoryView {
                    entry,
                    user_display,
                }
            })
            .collect())
    }

    async fn resolve_users(&self, entries: &[HistoryEntry]) -> HashMap<UserId, String> {
        let mut ids: Vec<&UserId> = Vec::new();
        for entry in entries {
            if !ids.contains(&&entry.user_id) {
                ids.push(&entry.user_id);
            }
        }
        if ids.is_empty() {
            return HashMap::new();
        }

        let filter = Filter::new().in_list("id", ids.iter().map(|id| id.to_value()).collect());
        let rows = match self.store.select(USERS_TABLE, &filter).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("could not resolve history users: {}", err);
                return HashMap::new();
            }
        };

        rows.iter()
            .filter_map(|row| {
                let id = row.get("id").and_then(UserId::from_value)?;
                let name = ["full_name", "email"]
                    .iter()
                    .filter_map(|col| row.get(*col).and_then(Value::as_str))
                    .find(|s| !s.trim().is_empty())?;
                Some((id, name.to_string()))
            })
            .collect()
    }
}
