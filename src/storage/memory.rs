use super::engine::{ChangeEvent, ChangeKind, RecordStore};
use super::filter::Filter;
use crate::core::types::{LOCK_USER_ARG, parse_timestamp, timestamp_value};
use crate::core::{FieldMap, RecordId, RecordKind, Row, StoreError, StoreResult, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Store operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Select,
    Update,
    Insert,
    Delete,
    Rpc,
}

#[derive(Debug, Clone)]
struct LockRow {
    holder: UserId,
    acquired_at: DateTime<Utc>,
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, Vec<Row>>,
    /// At most one lock per (table, record id)
    locks: HashMap<(&'static str, RecordId), LockRow>,
}

/// In-process stand-in for the hosted database.
///
/// Implements the same lock RPCs the hosted schema provides, fans change
/// notifications out per table, and lets tests inject failures and count
/// calls.
pub struct InMemoryRecordStore {
    state: RwLock<StoreState>,
    channels: Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    channel_capacity: usize,
    failures: Mutex<HashMap<StoreOp, String>>,
    select_calls: AtomicUsize,
    update_calls: AtomicUsize,
    insert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    rpc_calls: AtomicUsize,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Capacity of each table's notification buffer. Subscribers that fall
    /// further behind observe a lag.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            channels: Mutex::new(HashMap::new()),
            channel_capacity: capacity.max(1),
            failures: Mutex::new(HashMap::new()),
            select_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            rpc_calls: AtomicUsize::new(0),
        }
    }

    /// Load rows without notifications or call accounting
    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        let mut state = self.state.write().await;
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Make the next call of `op` fail with `StoreError::Unavailable(message)`
    pub fn fail_next(&self, op: StoreOp, message: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(op, message.to_string());
        }
    }

    pub fn select_calls(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn rpc_calls(&self) -> usize {
        self.rpc_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of a table in insertion order
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.state.read().await;
        state.tables.get(table).cloned().unwrap_or_default()
    }

    fn check_failure(&self, op: StoreOp) -> StoreResult<()> {
        let mut failures = self.failures.lock()?;
        match failures.remove(&op) {
            Some(message) => Err(StoreError::Unavailable(message)),
            None => Ok(()),
        }
    }

    fn notify(&self, table: &str, kind: ChangeKind, row: Row) {
        let Ok(channels) = self.channels.lock() else {
            return;
        };
        if let Some(sender) = channels.get(table) {
            // No receivers is fine.
            let _ = sender.send(ChangeEvent {
                table: table.to_string(),
                kind,
                row,
            });
        }
    }

    fn lock_rpc(state: &mut StoreState, name: &str, args: &Value) -> Option<StoreResult<Value>> {
        let (kind, rpc) = RecordKind::ALL.iter().find_map(|kind| {
            let rpc = kind.lock_rpc();
            [rpc.acquire, rpc.release, rpc.holder]
                .contains(&name)
                .then_some((*kind, rpc))
        })?;

        let record_id = match args.get(rpc.id_arg).and_then(RecordId::from_value) {
            Some(id) => id,
            None => {
                return Some(Err(StoreError::Rejected(format!(
                    "{name}: missing argument '{}'",
                    rpc.id_arg
                ))));
            }
        };
        let key = (kind.table(), record_id);

        if name == rpc.holder {
            let value = match state.locks.get(&key) {
                Some(lock) => json!({
                    "locked_by": lock.holder.to_value(),
                    "locked_at": timestamp_value(lock.acquired_at),
                }),
                None => Value::Null,
            };
            return Some(Ok(value));
        }

        let user = match args.get(LOCK_USER_ARG).and_then(UserId::from_value) {
            Some(user) => user,
            None => {
                return Some(Err(StoreError::Rejected(format!(
                    "{name}: missing argument '{LOCK_USER_ARG}'"
                ))));
            }
        };

        let current = state.locks.get(&key).map(|lock| lock.holder == user);
        let granted = if name == rpc.acquire {
            match current {
                Some(false) => false,
                _ => {
                    state.locks.insert(
                        key,
                        LockRow {
                            holder: user,
                            acquired_at: Utc::now(),
                        },
                    );
                    true
                }
            }
        } else if current == Some(true) {
            state.locks.remove(&key);
            true
        } else {
            false
        };

        Some(Ok(Value::Bool(granted)))
    }

    async fn apply_update(
        &self,
        table: &str,
        id: &RecordId,
        expected_updated_at: Option<DateTime<Utc>>,
        fields: FieldMap,
    ) -> StoreResult<Row> {
        let updated = {
            let mut state = self.state.write().await;
            let row = state
                .tables
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|r| row_has_id(r, id)))
                .ok_or_else(|| StoreError::NotFound {
                    table: table.to_string(),
                    id: id.to_string(),
                })?;

            if let Some(expected) = expected_updated_at {
                let stored = row
                    .get("updated_at")
                    .filter(|v| !v.is_null())
                    .or_else(|| row.get("created_at"))
                    .and_then(parse_timestamp);
                if stored != Some(expected) {
                    debug!("stale write rejected for {}:{}", table, id);
                    return Err(StoreError::StaleWrite {
                        table: table.to_string(),
                        id: id.to_string(),
                    });
                }
            }

            for (key, value) in fields {
                row.insert(key, value);
            }
            row.clone()
        };

        self.notify(table, ChangeKind::Update, updated.clone());
        Ok(updated)
    }
}

fn row_has_id(row: &Row, id: &RecordId) -> bool {
    row.get("id").and_then(RecordId::from_value).as_ref() == Some(id)
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn select(&self, table: &str, filter: &Filter) -> StoreResult<Vec<Row>> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(StoreOp::Select)?;

        let state = self.state.read().await;
        Ok(state
            .tables
            .get(table)
            .map(|rows| filter.apply(rows))
            .unwrap_or_default())
    }

    async fn update(&self, table: &str, id: &RecordId, fields: FieldMap) -> StoreResult<Row> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(StoreOp::Update)?;
        self.apply_update(table, id, None, fields).await
    }

    async fn update_if_unchanged(
        &self,
        table: &str,
        id: &RecordId,
        expected_updated_at: DateTime<Utc>,
        fields: FieldMap,
    ) -> StoreResult<Row> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(StoreOp::Update)?;
        self.apply_update(table, id, Some(expected_updated_at), fields)
            .await
    }

    async fn insert(&self, table: &str, mut fields: FieldMap) -> StoreResult<Row> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(StoreOp::Insert)?;

        if !fields.contains_key("id") {
            fields.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }
        if !fields.contains_key("created_at") {
            fields.insert("created_at".to_string(), timestamp_value(Utc::now()));
        }

        {
            let mut state = self.state.write().await;
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .push(fields.clone());
        }

        self.notify(table, ChangeKind::Insert, fields.clone());
        Ok(fields)
    }

    async fn delete(&self, table: &str, id: &RecordId) -> StoreResult<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(StoreOp::Delete)?;

        let removed = {
            let mut state = self.state.write().await;
            let Some(rows) = state.tables.get_mut(table) else {
                return Ok(false);
            };
            let Some(pos) = rows.iter().position(|r| row_has_id(r, id)) else {
                return Ok(false);
            };
            rows.remove(pos)
        };

        self.notify(table, ChangeKind::Delete, removed);
        Ok(true)
    }

    async fn rpc(&self, name: &str, args: Value) -> StoreResult<Value> {
        self.rpc_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(StoreOp::Rpc)?;

        let mut state = self.state.write().await;
        Self::lock_rpc(&mut state, name, &args)
            .unwrap_or_else(|| Err(StoreError::UnknownRpc(name.to_string())))
    }

    fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeEvent> {
        let capacity = self.channel_capacity;
        match self.channels.lock() {
            Ok(mut channels) => channels
                .entry(table.to_string())
                .or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe(),
            // A poisoned registry still hands out a receiver; it just never fires.
            Err(_) => broadcast::channel(capacity).1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_id_and_created_at() {
        let store = InMemoryRecordStore::new();
        let inserted = store
            .insert("notes", row(json!({ "body": "hi" })))
            .await
            .unwrap();
        assert!(inserted.get("id").is_some());
        assert!(inserted.get("created_at").is_some());
        assert_eq!(store.rows("notes").await.len(), 1);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let store = InMemoryRecordStore::new();
        store.fail_next(StoreOp::Insert, "offline");
        let err = store.insert("notes", Row::new()).await.unwrap_err();
        assert_eq!(err, StoreError::Unavailable("offline".to_string()));
        assert!(store.insert("notes", Row::new()).await.is_ok());
        assert_eq!(store.insert_calls(), 2);
    }

    #[tokio::test]
    async fn update_if_unchanged_rejects_stale_timestamp() {
        let store = InMemoryRecordStore::new();
        store
            .seed(
                "assets",
                vec![row(json!({ "id": 1, "updated_at": "2024-01-01T00:00:00Z" }))],
            )
            .await;

        let stale = DateTime::parse_from_rfc3339("2023-12-31T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let err = store
            .update_if_unchanged("assets", &RecordId::from(1), stale, Row::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleWrite { .. }));
    }

    #[tokio::test]
    async fn unknown_rpc_is_reported() {
        let store = InMemoryRecordStore::new();
        let err = store.rpc("vacuum", json!({})).await.unwrap_err();
        assert_eq!(err, StoreError::UnknownRpc("vacuum".to_string()));
    }

    #[tokio::test]
    async fn subscribers_receive_updates() {
        let store = InMemoryRecordStore::new();
        store.seed("assets", vec![row(json!({ "id": 1 }))]).await;
        let mut rx = store.subscribe("assets");

        store
            .update("assets", &RecordId::from(1), row(json!({ "status": "Active" })))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.row.get("status"), Some(&json!("Active")));
    }
}
