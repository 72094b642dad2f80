use super::filter::Filter;
use crate::core::{FieldMap, RecordId, Row, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Kind of row mutation carried by a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Real-time notification for one row of one table.
///
/// For deletions `row` holds the last known state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub row: Row,
}

/// Remote relational store - the only way this crate touches persisted state
///
/// Implementations talk to the hosted database. Row-level access control,
/// lock bookkeeping and notification fan-out are the store's business.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read rows matching `filter`, ordered and limited as it requests
    async fn select(&self, table: &str, filter: &Filter) -> StoreResult<Vec<Row>>;

    /// Apply a partial update to the row with `id`, unconditionally
    async fn update(&self, table: &str, id: &RecordId, fields: FieldMap) -> StoreResult<Row>;

    /// Apply a partial update only if the stored `updated_at` equals
    /// `expected_updated_at`; fails with `StaleWrite` otherwise
    async fn update_if_unchanged(
        &self,
        table: &str,
        id: &RecordId,
        expected_updated_at: DateTime<Utc>,
        fields: FieldMap,
    ) -> StoreResult<Row>;

    /// Create a row and return it with store-assigned columns filled in
    async fn insert(&self, table: &str, fields: FieldMap) -> StoreResult<Row>;

    /// Delete the row with `id`; returns whether it existed
    async fn delete(&self, table: &str, id: &RecordId) -> StoreResult<bool>;

    /// Invoke a stored procedure
    async fn rpc(&self, name: &str, args: Value) -> StoreResult<Value>;

    /// Subscribe to change notifications on a table
    fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeEvent>;

    /// Read a single row by id
    async fn select_by_id(&self, table: &str, id: &RecordId) -> StoreResult<Option<Row>> {
        let filter = Filter::new().eq("id", id.to_value()).limit(1);
        let mut rows = self.select(table, &filter).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }
}
