// ============================================================================
// compliancedesk Library
// ============================================================================

pub mod core;
pub mod config;
pub mod context;
pub mod storage;
pub mod lock;
pub mod changes;
pub mod history;
pub mod system_log;
pub mod session;
pub mod live;

// Re-export main types for convenience
pub use core::{
    EditError, EditableRecord, FieldMap, RecordId, RecordKind, Result, Row, StoreError,
    StoreResult, UserId,
};
pub use config::{ConcurrencyMode, EditConfig, LockPolicy};
pub use context::SessionContext;

// Re-export the store seam and its in-memory implementation
pub use storage::{
    ChangeEvent, ChangeKind, Filter, InMemoryRecordStore, RecordStore, SortDirection, StoreOp,
};

// Re-export editing, locking and audit APIs
pub use changes::{
    ChangeSet, FieldChange, RelationshipLink, RelationshipPlan, apply_relationship_plan, diff,
    format_for_display, load_relationships, plan_relationship_changes, stable_json,
};
pub use history::{
    AuditTrail, ChangeType, DeadLetter, HistoryEntry, HistoryLog, HistoryPayload, HistoryView,
};
pub use live::LiveList;
pub use lock::{Lock, LockManager, LockStatus, ReleaseStatus};
pub use session::{EditSession, EditState, RecordService, SaveReceipt, SaveRequest};
pub use system_log::{ActionType, SystemLogQuery, SystemLogger};

/// Opens an edit session on an in-memory store.
///
/// Handy for demos and tests; production code builds an [`EditSession`]
/// around its own [`RecordStore`].
///
/// # Examples
///
/// ```
/// use compliancedesk::{
///     EditConfig, RecordId, RecordKind, SaveRequest, SessionContext, in_memory_session,
/// };
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let (store, mut session) = in_memory_session(
///     RecordKind::Asset,
///     SessionContext::new("alice"),
///     EditConfig::default(),
/// )
/// .unwrap();
/// store
///     .seed("assets", vec![json!({
///         "id": 1,
///         "name": "Acme",
///         "status": "Pending",
///         "updated_at": "2024-01-01T00:00:00Z"
///     }).as_object().cloned().unwrap()])
///     .await;
///
/// session.load(&RecordId::from(1)).await.unwrap();
/// session.enter_edit().await.unwrap();
/// session.mutate_field("status", json!("Active")).unwrap();
/// let request = session.request_save().await.unwrap();
/// assert!(matches!(request, SaveRequest::NeedsConfirmation { .. }));
/// let receipt = session.confirm_save("Reviewed and approved").await.unwrap();
/// assert_eq!(receipt.record.status(), Some("Active"));
/// # });
/// ```
pub fn in_memory_session(
    kind: RecordKind,
    ctx: SessionContext,
    config: EditConfig,
) -> Result<(std::sync::Arc<InMemoryRecordStore>, EditSession)> {
    let store = std::sync::Arc::new(InMemoryRecordStore::new());
    let session = EditSession::new(store.clone(), kind, ctx, config)?;
    Ok((store, session))
}
