use compliancedesk::{
    ChangeType, ConcurrencyMode, EditConfig, EditError, EditSession, EditState,
    InMemoryRecordStore, LockPolicy, LockStatus, RecordId, RecordKind, RecordStore, ReleaseStatus,
    Row, SaveRequest, SessionContext, StoreOp, SystemLogger, UserId,
};
use serde_json::{Value, json};
use std::sync::Arc;

fn row(value: Value) -> Row {
    value.as_object().cloned().expect("json object")
}

async fn seeded_store() -> Arc<InMemoryRecordStore> {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .seed(
            "assets",
            vec![row(json!({
                "id": 1,
                "name": "Acme",
                "status": "Pending",
                "updated_at": "2024-01-01T00:00:00Z"
            }))],
        )
        .await;
    store
        .seed(
            "users",
            vec![row(json!({ "id": "alice", "full_name": "Alice Smith", "email": "alice@example.com" }))],
        )
        .await;
    store
}

fn session_for(store: &Arc<InMemoryRecordStore>, user: &str, config: EditConfig) -> EditSession {
    EditSession::new(
        store.clone(),
        RecordKind::Asset,
        SessionContext::new(user),
        config,
    )
    .expect("valid config")
}

async fn editing_session(store: &Arc<InMemoryRecordStore>, config: EditConfig) -> EditSession {
    let mut session = session_for(store, "alice", config);
    session.load(&RecordId::from(1)).await.expect("load asset");
    let status = session.enter_edit().await.expect("enter edit");
    assert_eq!(status, LockStatus::Granted);
    session
}

async fn stored_asset(store: &InMemoryRecordStore) -> Row {
    store
        .select_by_id("assets", &RecordId::from(1))
        .await
        .expect("select asset")
        .expect("asset exists")
}

#[tokio::test]
async fn confirmed_save_writes_changes_history_and_releases_lock() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;
    assert_eq!(session.state(), EditState::Editing);

    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");

    let request = session.request_save().await.expect("request save");
    let SaveRequest::NeedsConfirmation {
        changes,
        display,
        reason_required,
    } = request
    else {
        panic!("expected confirmation");
    };
    assert_eq!(changes.len(), 1);
    assert_eq!(display, vec!["status: Pending → Active".to_string()]);
    assert!(reason_required);
    assert_eq!(session.state(), EditState::ConfirmingSave);

    let receipt = session
        .confirm_save("  Reviewed by compliance  ")
        .await
        .expect("confirm save");
    assert_eq!(receipt.record.status(), Some("Active"));
    let entry = receipt.history.expect("history entry");
    assert_eq!(entry.reason.as_deref(), Some("Reviewed by compliance"));
    assert_eq!(entry.user_id, UserId::from("alice"));
    assert_eq!(entry.change_type(), ChangeType::Updated);

    assert_eq!(session.state(), EditState::Viewing);
    assert!(session.form().is_none());
    assert_eq!(session.record().and_then(|r| r.status()), Some("Active"));

    // Only status and updated_at were written.
    let stored = stored_asset(&store).await;
    let columns: Vec<&str> = stored.keys().map(String::as_str).collect();
    assert_eq!(columns, vec!["id", "name", "status", "updated_at"]);
    assert_eq!(stored.get("name"), Some(&json!("Acme")));
    assert_eq!(stored.get("status"), Some(&json!("Active")));
    assert_ne!(stored.get("updated_at"), Some(&json!("2024-01-01T00:00:00Z")));
    assert_eq!(store.update_calls(), 1);

    assert!(session.lock_holder().await.expect("lock holder").is_none());
    assert_eq!(store.rows("asset_history").await.len(), 1);
}

#[tokio::test]
async fn store_owned_columns_cannot_be_edited() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;

    for column in ["id", "created_at", "updated_at"] {
        let err = session
            .mutate_field(column, json!(2))
            .expect_err("store-owned column");
        assert!(matches!(err, EditError::Validation(_)));
    }
    assert!(session.form().and_then(|f| f.get("id")).is_none());

    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");
    session.request_save().await.expect("request save");
    session.confirm_save("Review").await.expect("save");

    assert_eq!(stored_asset(&store).await.get("id"), Some(&json!(1)));
    assert!(
        store
            .select_by_id("assets", &RecordId::from(2))
            .await
            .expect("select")
            .is_none()
    );
    assert_eq!(session.record().map(|r| r.id.clone()), Some(RecordId::from(1)));
    assert!(session.lock_holder().await.expect("lock holder").is_none());
}

#[tokio::test]
async fn invalid_config_is_rejected_at_construction() {
    let store = seeded_store().await;
    let session = EditSession::new(
        store.clone(),
        RecordKind::Asset,
        SessionContext::new("alice"),
        EditConfig::new().history_page_size(0),
    );
    assert!(matches!(session, Err(EditError::Validation(_))));
}

#[tokio::test]
async fn unchanged_form_returns_to_viewing_without_writing() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;

    // Setting a field to its current value is not a change.
    session
        .mutate_field("name", json!("Acme"))
        .expect("mutate name");

    let request = session.request_save().await.expect("request save");
    assert_eq!(request, SaveRequest::NoChanges);
    assert_eq!(session.state(), EditState::Viewing);
    assert_eq!(store.update_calls(), 0);
    assert_eq!(store.insert_calls(), 0);
    assert!(session.lock_holder().await.expect("lock holder").is_none());
}

#[tokio::test]
async fn blank_reason_is_rejected_and_session_stays_confirming() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;
    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");
    session.request_save().await.expect("request save");

    let err = session.confirm_save("   ").await.expect_err("blank reason");
    assert_eq!(
        err,
        EditError::Validation("Please provide a reason for these changes".to_string())
    );
    assert_eq!(session.state(), EditState::ConfirmingSave);
    assert!(session.pending_changes().is_some());
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn reason_can_be_optional() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::new().require_reason(false)).await;
    session
        .mutate_field("status", json!("Closed"))
        .expect("mutate status");
    session.request_save().await.expect("request save");

    let receipt = session.confirm_save("").await.expect("save without reason");
    assert_eq!(receipt.history.expect("history").reason, None);
}

#[tokio::test]
async fn back_to_editing_keeps_the_form() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;
    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");
    session.request_save().await.expect("request save");

    session.back_to_editing().expect("back to editing");
    assert_eq!(session.state(), EditState::Editing);
    assert!(session.pending_changes().is_none());
    assert_eq!(
        session.form().and_then(|f| f.get("status")),
        Some(&json!("Active"))
    );
}

#[tokio::test]
async fn cancel_discards_form_and_releases_lock() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;
    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");

    let handle = session.cancel().expect("cancel").expect("release task");
    assert_eq!(session.state(), EditState::Viewing);
    assert!(session.form().is_none());

    let released = handle.await.expect("join release task");
    assert_eq!(released, ReleaseStatus::Released);
    assert!(session.lock_holder().await.expect("lock holder").is_none());
    assert_eq!(session.record().and_then(|r| r.status()), Some("Pending"));
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn failed_write_keeps_confirmation_open_for_retry() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;
    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");
    session.request_save().await.expect("request save");

    store.fail_next(StoreOp::Update, "connection reset");
    let err = session.confirm_save("Review").await.expect_err("write fails");
    assert!(matches!(err, EditError::Persistence(_)));
    assert!(err.is_retryable());
    assert_eq!(session.state(), EditState::ConfirmingSave);
    assert_eq!(stored_asset(&store).await.get("status"), Some(&json!("Pending")));

    let receipt = session.confirm_save("Review").await.expect("retry save");
    assert_eq!(receipt.record.status(), Some("Active"));
    assert_eq!(store.update_calls(), 2);
}

#[tokio::test]
async fn concurrent_write_conflicts_when_expecting_updated_at() {
    let store = seeded_store().await;
    let config = EditConfig::new().concurrency(ConcurrencyMode::ExpectUpdatedAt);
    let mut session = editing_session(&store, config).await;
    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");
    session.request_save().await.expect("request save");

    store
        .update(
            "assets",
            &RecordId::from(1),
            row(json!({ "status": "Frozen", "updated_at": "2024-02-01T00:00:00Z" })),
        )
        .await
        .expect("concurrent write");

    let err = session.confirm_save("Review").await.expect_err("stale write");
    assert_eq!(
        err,
        EditError::Conflict {
            record_id: RecordId::from(1)
        }
    );
    assert_eq!(session.state(), EditState::ConfirmingSave);
    assert_eq!(stored_asset(&store).await.get("status"), Some(&json!("Frozen")));
}

#[tokio::test]
async fn last_write_wins_overwrites_concurrent_change() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;
    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");
    session.request_save().await.expect("request save");

    store
        .update(
            "assets",
            &RecordId::from(1),
            row(json!({ "status": "Frozen", "updated_at": "2024-02-01T00:00:00Z" })),
        )
        .await
        .expect("concurrent write");

    session.confirm_save("Review").await.expect("save");
    assert_eq!(stored_asset(&store).await.get("status"), Some(&json!("Active")));
}

#[tokio::test]
async fn required_lock_policy_refuses_when_held_by_other() {
    let store = seeded_store().await;
    let _alice = editing_session(&store, EditConfig::default()).await;

    let mut bob = session_for(
        &store,
        "bob",
        EditConfig::new().lock_policy(LockPolicy::Required),
    );
    bob.load(&RecordId::from(1)).await.expect("load asset");

    let err = bob.enter_edit().await.expect_err("lock held by alice");
    assert_eq!(
        err,
        EditError::LockUnavailable {
            holder: Some(UserId::from("alice"))
        }
    );
    assert_eq!(bob.state(), EditState::Viewing);
    assert!(bob.form().is_none());
}

#[tokio::test]
async fn advisory_lock_lets_second_editor_proceed_without_releasing_first() {
    let store = seeded_store().await;
    let _alice = editing_session(&store, EditConfig::default()).await;

    let mut bob = session_for(&store, "bob", EditConfig::default());
    bob.load(&RecordId::from(1)).await.expect("load asset");
    let status = bob.enter_edit().await.expect("advisory edit");
    assert_eq!(status, LockStatus::HeldByOther);
    assert_eq!(bob.state(), EditState::Editing);

    bob.mutate_field("status", json!("Closed"))
        .expect("mutate status");
    bob.request_save().await.expect("request save");
    bob.confirm_save("Closing").await.expect("save");

    let holder = bob.lock_holder().await.expect("holder").expect("still locked");
    assert_eq!(holder.holder, UserId::from("alice"));
}

#[tokio::test]
async fn lock_rpc_failure_is_advisory() {
    let store = seeded_store().await;
    let mut session = session_for(&store, "alice", EditConfig::default());
    session.load(&RecordId::from(1)).await.expect("load asset");

    store.fail_next(StoreOp::Rpc, "rpc timeout");
    let status = session.enter_edit().await.expect("edit without lock");
    assert_eq!(status.error(), Some("Store unavailable: rpc timeout"));
    assert_eq!(session.state(), EditState::Editing);
}

#[tokio::test]
async fn operations_out_of_order_are_invalid_transitions() {
    let store = seeded_store().await;
    let mut session = session_for(&store, "alice", EditConfig::default());

    assert_eq!(session.enter_edit().await, Err(EditError::NotLoaded));
    assert!(matches!(
        session.mutate_field("status", json!("Active")),
        Err(EditError::InvalidTransition {
            state: EditState::Viewing,
            ..
        })
    ));
    assert!(matches!(
        session.confirm_save("reason").await,
        Err(EditError::InvalidTransition { .. })
    ));
    assert!(matches!(
        session.cancel(),
        Err(EditError::InvalidTransition { .. })
    ));

    session.load(&RecordId::from(1)).await.expect("load asset");
    session.enter_edit().await.expect("enter edit");
    assert!(matches!(
        session.load(&RecordId::from(1)).await,
        Err(EditError::InvalidTransition {
            state: EditState::Editing,
            ..
        })
    ));
    assert!(matches!(
        session.back_to_editing(),
        Err(EditError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn loading_missing_record_is_not_found() {
    let store = seeded_store().await;
    let mut session = session_for(&store, "alice", EditConfig::default());
    let err = session
        .load(&RecordId::from(99))
        .await
        .expect_err("missing asset");
    assert_eq!(err, EditError::NotFound(RecordId::from(99)));
}

#[tokio::test]
async fn failed_history_append_is_dead_lettered_and_retried() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;
    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");
    session.request_save().await.expect("request save");

    store.fail_next(StoreOp::Insert, "history unavailable");
    let receipt = session.confirm_save("Review").await.expect("save succeeds");
    assert!(receipt.history.is_none());
    assert_eq!(stored_asset(&store).await.get("status"), Some(&json!("Active")));

    let parked = session.audit().dead_letters();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].reason.as_deref(), Some("Review"));

    assert_eq!(session.audit().retry_dead_letters().await, 1);
    assert!(session.audit().dead_letters().is_empty());
    assert_eq!(session.history().await.expect("history").len(), 1);
}

#[tokio::test]
async fn history_shows_saved_changes_with_user_names() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default()).await;
    session
        .mutate_field("managing_office", json!("London"))
        .expect("mutate office");
    session.request_save().await.expect("request save");
    session.confirm_save("Office moved").await.expect("save");

    let history = session.history().await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user_display, "Alice Smith");
    assert_eq!(
        history[0].entry.describe(),
        vec!["Changed managing office from \"empty\" to \"London\"".to_string()]
    );
}

#[tokio::test]
async fn save_writes_update_activity_with_changes() {
    let store = seeded_store().await;
    let mut session = editing_session(&store, EditConfig::default())
        .await
        .with_system_log(SystemLogger::new(store.clone()));
    session
        .mutate_field("status", json!("Active"))
        .expect("mutate status");
    session.request_save().await.expect("request save");
    session.confirm_save("Review").await.expect("save");

    let activity = store.rows("system_logs").await;
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].get("action_type"), Some(&json!("update")));
    assert_eq!(activity[0].get("entity_id"), Some(&json!("1")));
    assert_eq!(
        activity[0].get("details"),
        Some(&json!({ "changes": { "status": { "old": "Pending", "new": "Active" } } }))
    );
}
