use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compliancedesk::{
    AuditTrail, ChangeEvent, ChangeType, EditError, FieldMap, Filter, HistoryLog, HistoryPayload,
    InMemoryRecordStore, RecordId, RecordKind, RecordStore, Row, StoreError, StoreOp,
    StoreResult, UserId, diff,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn row(value: Value) -> Row {
    value.as_object().cloned().expect("json object")
}

async fn store_with_history() -> Arc<InMemoryRecordStore> {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .seed(
            "asset_history",
            vec![
                row(json!({
                    "id": "h2", "asset_id": 1, "user_id": "u2", "change_type": "updated",
                    "changes": { "status": { "old": "Pending", "new": "Active" } },
                    "reason": "Reviewed", "created_at": "2024-03-02T10:00:00Z"
                })),
                row(json!({
                    "id": "h1", "asset_id": 1, "user_id": "u1", "change_type": "created",
                    "changes": { "snapshot": { "name": "Acme" } },
                    "reason": null, "created_at": "2024-03-01T10:00:00Z"
                })),
                row(json!({
                    "id": "h3", "asset_id": 1, "user_id": "ghost", "change_type": "status_change",
                    "changes": { "previous_status": "Active", "new_status": "Closed" },
                    "reason": null, "created_at": "2024-03-03T10:00:00Z"
                })),
                row(json!({
                    "id": "other", "asset_id": 2, "user_id": "u1", "change_type": "deleted",
                    "changes": {}, "reason": null, "created_at": "2024-03-04T10:00:00Z"
                })),
            ],
        )
        .await;
    store
        .seed(
            "users",
            vec![
                row(json!({ "id": "u1", "full_name": "Ada Lovelace", "email": "ada@example.com" })),
                row(json!({ "id": "u2", "full_name": "", "email": "grace@example.com" })),
            ],
        )
        .await;
    store
}

#[tokio::test]
async fn list_returns_newest_first_with_resolved_users() {
    let store = store_with_history().await;
    let log = HistoryLog::new(store.clone(), RecordKind::Asset);

    let views = log.list(&RecordId::from(1)).await.expect("list history");
    let ids: Vec<&str> = views.iter().map(|v| v.entry.id.as_str()).collect();
    assert_eq!(ids, vec!["h3", "h2", "h1"]);

    let users: Vec<&str> = views.iter().map(|v| v.user_display.as_str()).collect();
    assert_eq!(users, vec!["Unknown user", "grace@example.com", "Ada Lovelace"]);

    // One select for the entries, one batched lookup for the users.
    assert_eq!(store.select_calls(), 2);

    assert_eq!(views[0].entry.change_type(), ChangeType::StatusChange);
    assert_eq!(
        views[0].entry.describe(),
        vec!["Status changed from \"Active\" to \"Closed\"".to_string()]
    );
    assert_eq!(views[1].entry.reason.as_deref(), Some("Reviewed"));
    assert_eq!(views[2].entry.describe(), vec!["Asset created".to_string()]);
}

#[tokio::test]
async fn page_size_limits_to_newest_entries() {
    let store = store_with_history().await;
    let log = HistoryLog::new(store, RecordKind::Asset).with_page_size(Some(2));

    let views = log.list(&RecordId::from(1)).await.expect("list history");
    let ids: Vec<&str> = views.iter().map(|v| v.entry.id.as_str()).collect();
    assert_eq!(ids, vec!["h3", "h2"]);
}

/// Delegates to the in-memory store but refuses to read the users table.
struct UsersOffline(Arc<InMemoryRecordStore>);

#[async_trait]
impl RecordStore for UsersOffline {
    async fn select(&self, table: &str, filter: &Filter) -> StoreResult<Vec<Row>> {
        if table == "users" {
            return Err(StoreError::Unavailable("users offline".to_string()));
        }
        self.0.select(table, filter).await
    }

    async fn update(&self, table: &str, id: &RecordId, fields: FieldMap) -> StoreResult<Row> {
        self.0.update(table, id, fields).await
    }

    async fn update_if_unchanged(
        &self,
        table: &str,
        id: &RecordId,
        expected_updated_at: DateTime<Utc>,
        fields: FieldMap,
    ) -> StoreResult<Row> {
        self.0
            .update_if_unchanged(table, id, expected_updated_at, fields)
            .await
    }

    async fn insert(&self, table: &str, fields: FieldMap) -> StoreResult<Row> {
        self.0.insert(table, fields).await
    }

    async fn delete(&self, table: &str, id: &RecordId) -> StoreResult<bool> {
        self.0.delete(table, id).await
    }

    async fn rpc(&self, name: &str, args: Value) -> StoreResult<Value> {
        self.0.rpc(name, args).await
    }

    fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeEvent> {
        self.0.subscribe(table)
    }
}

#[tokio::test]
async fn user_lookup_failure_degrades_to_unknown() {
    let store = store_with_history().await;
    let log = HistoryLog::new(Arc::new(UsersOffline(store)), RecordKind::Asset);

    let views = log.list(&RecordId::from(1)).await.expect("list history");
    assert_eq!(views.len(), 3);
    assert!(views.iter().all(|v| v.user_display == "Unknown user"));
}

#[tokio::test]
async fn entry_select_failure_is_surfaced() {
    let store = store_with_history().await;
    let log = HistoryLog::new(store.clone(), RecordKind::Asset);

    store.fail_next(StoreOp::Select, "history offline");
    let err = log.list(&RecordId::from(1)).await.expect_err("select fails");
    assert!(matches!(err, EditError::Persistence(_)));
}

#[tokio::test]
async fn append_stores_payload_and_reason() {
    let store = Arc::new(InMemoryRecordStore::new());
    let log = HistoryLog::new(store.clone(), RecordKind::Counterparty);

    let original = row(json!({ "name": "Beta", "country": "FR" }));
    let updated = row(json!({ "name": "Beta", "country": "DE" }));
    let entry = log
        .append(
            &RecordId::from(5),
            &UserId::from("u1"),
            HistoryPayload::Updated {
                changes: diff(&original, &updated),
            },
            Some("Relocated"),
        )
        .await
        .expect("append");
    assert_eq!(entry.change_type(), ChangeType::Updated);

    let rows = store.rows("counterparty_history").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("counterparty_id"), Some(&json!("5")));
    assert_eq!(rows[0].get("change_type"), Some(&json!("updated")));
    assert_eq!(
        rows[0].get("changes"),
        Some(&json!({ "country": { "old": "FR", "new": "DE" } }))
    );
    assert_eq!(rows[0].get("reason"), Some(&json!("Relocated")));

    let views = log.list(&RecordId::from(5)).await.expect("list");
    assert_eq!(views[0].entry, entry);
    assert_eq!(views[0].user_display, "Unknown user");
}

#[tokio::test]
async fn redelivered_entry_keeps_the_time_of_the_change() {
    let store = Arc::new(InMemoryRecordStore::new());
    let audit = AuditTrail::new(HistoryLog::new(store.clone(), RecordKind::Asset));
    let record = RecordId::from(1);
    let user = UserId::from("u1");

    store.fail_next(StoreOp::Insert, "history offline");
    let parked = audit
        .record(
            &record,
            &user,
            HistoryPayload::StatusChange {
                previous_status: Some("Pending".to_string()),
                new_status: "Active".to_string(),
            },
            None,
        )
        .await;
    assert!(parked.is_none());
    let changed_at = audit.dead_letters()[0].created_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let later = audit
        .record(
            &record,
            &user,
            HistoryPayload::StatusChange {
                previous_status: Some("Active".to_string()),
                new_status: "Closed".to_string(),
            },
            None,
        )
        .await
        .expect("second entry");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(audit.retry_dead_letters().await, 1);

    let views = audit.log().list(&record).await.expect("list history");
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].entry, later);
    assert_eq!(views[1].entry.created_at, changed_at);
    assert!(views[1].entry.created_at < later.created_at);
}
