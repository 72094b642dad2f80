use crate::core::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Field name → value mapping. Insertion order is preserved.
pub type FieldMap = serde_json::Map<String, Value>;

/// A row as returned by the record store.
pub type Row = FieldMap;

/// Identifier of a record, normalized to its string form.
///
/// The backing store may hand out integer or UUID keys; both compare equal
/// to their textual rendering so `RecordId::from(1)` matches a row whose
/// `id` column is `1` or `"1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads an id out of a JSON cell. Only strings and numbers qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for RecordId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Names of the lock RPCs exposed by the store for one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRpc {
    pub acquire: &'static str,
    pub release: &'static str,
    pub holder: &'static str,
    /// Argument carrying the record id. The user goes in `p_user_id`.
    pub id_arg: &'static str,
}

pub const LOCK_USER_ARG: &str = "p_user_id";

/// The shared business entities that are edited through a detail screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Asset,
    Counterparty,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Asset, RecordKind::Counterparty];

    pub fn table(self) -> &'static str {
        match self {
            Self::Asset => "assets",
            Self::Counterparty => "counterparties",
        }
    }

    pub fn history_table(self) -> &'static str {
        match self {
            Self::Asset => "asset_history",
            Self::Counterparty => "counterparty_history",
        }
    }

    /// Column of the history table that references the record.
    pub fn history_key(self) -> &'static str {
        match self {
            Self::Asset => "asset_id",
            Self::Counterparty => "counterparty_id",
        }
    }

    /// Entity name as used in audit text and system logs.
    pub fn noun(self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Counterparty => "counterparty",
        }
    }

    pub fn lock_rpc(self) -> LockRpc {
        match self {
            Self::Asset => LockRpc {
                acquire: "lock_asset",
                release: "unlock_asset",
                holder: "get_asset_lock",
                id_arg: "p_asset_id",
            },
            Self::Counterparty => LockRpc {
                acquire: "lock_counterparty",
                release: "unlock_counterparty",
                holder: "get_counterparty_lock",
                id_arg: "p_counterparty_id",
            },
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.noun())
    }
}

/// Transient copy of a stored asset or counterparty.
///
/// `fields` never contains `id` or `updated_at`; those live in their own
/// members so that they cannot show up in a change set.
#[derive(Debug, Clone, PartialEq)]
pub struct EditableRecord {
    pub kind: RecordKind,
    pub id: RecordId,
    pub fields: FieldMap,
    pub updated_at: DateTime<Utc>,
}

impl EditableRecord {
    pub fn new(kind: RecordKind, id: impl Into<RecordId>, fields: FieldMap) -> Self {
        Self {
            kind,
            id: id.into(),
            fields,
            updated_at: Utc::now(),
        }
    }

    /// Builds a record from a store row. `updated_at` falls back to
    /// `created_at` for rows that were never updated.
    pub fn from_row(kind: RecordKind, mut row: Row) -> StoreResult<Self> {
        let id = row
            .remove("id")
            .as_ref()
            .and_then(RecordId::from_value)
            .ok_or_else(|| StoreError::Decode(format!("{} row without a usable id", kind)))?;

        let stamp = match row.remove("updated_at") {
            Some(Value::Null) | None => row.get("created_at").cloned(),
            Some(value) => Some(value),
        };
        let updated_at = stamp
            .as_ref()
            .and_then(parse_timestamp)
            .ok_or_else(|| {
                StoreError::Decode(format!("{} '{}' has no valid updated_at", kind, id))
            })?;

        Ok(Self {
            kind,
            id,
            fields: row,
            updated_at,
        })
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), self.id.to_value());
        for (key, value) in &self.fields {
            row.insert(key.clone(), value.clone());
        }
        row.insert("updated_at".to_string(), timestamp_value(self.updated_at));
        row
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").and_then(Value::as_str)
    }
}

/// Columns owned by the store. Never edited through a form.
pub const RESERVED_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

pub fn is_reserved_column(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
}

pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_id_normalizes_numbers_and_strings() {
        assert_eq!(RecordId::from_value(&json!(1)), Some(RecordId::from(1)));
        assert_eq!(RecordId::from_value(&json!("1")), Some(RecordId::from(1)));
        assert_eq!(RecordId::from_value(&json!(null)), None);
    }

    #[test]
    fn record_round_trips_through_row_without_leaking_metadata_into_fields() {
        let row = json!({
            "id": 7,
            "name": "Acme",
            "status": "Pending",
            "updated_at": "2024-03-01T10:00:00Z"
        });
        let record =
            EditableRecord::from_row(RecordKind::Asset, row.as_object().cloned().unwrap()).unwrap();

        assert_eq!(record.id, RecordId::from(7));
        assert!(!record.fields.contains_key("id"));
        assert!(!record.fields.contains_key("updated_at"));
        assert_eq!(record.name(), Some("Acme"));
        assert_eq!(record.status(), Some("Pending"));

        let back = record.to_row();
        assert_eq!(back.get("id"), Some(&json!("7")));
        assert!(back.contains_key("updated_at"));
    }

    #[test]
    fn record_without_timestamps_is_rejected() {
        let row = json!({ "id": 1, "name": "Acme" });
        let err = EditableRecord::from_row(RecordKind::Counterparty, row.as_object().cloned().unwrap())
            .unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }
}
