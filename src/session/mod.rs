//! Edit session controller for one record's detail screen.
//!
//! ```text
//! Viewing --enter_edit--> Editing --request_save--> ConfirmingSave
//!    ^                      |  ^                        |
//!    |      (no changes)    |  +----back_to_editing-----+
//!    +----------------------+                           |
//!    +-----------cancel (Editing | ConfirmingSave)------+
//!    +-----------confirm_save (success)-----------------+
//! ```

pub mod service;

use crate::changes::{ChangeSet, diff, format_for_display};
use crate::config::{ConcurrencyMode, EditConfig, LockPolicy};
use crate::context::SessionContext;
use crate::core::types::{is_reserved_column, timestamp_value};
use crate::core::{EditError, EditableRecord, FieldMap, RecordId, RecordKind, Result};
use crate::history::{AuditTrail, HistoryEntry, HistoryLog, HistoryPayload, HistoryView};
use crate::lock::{Lock, LockManager, LockStatus, ReleaseStatus};
use crate::storage::RecordStore;
use crate::system_log::{ActionType, SystemLogger};
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub use service::RecordService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Viewing,
    Editing,
    ConfirmingSave,
}

impl fmt::Display for EditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Viewing => "viewing",
            Self::Editing => "editing",
            Self::ConfirmingSave => "confirming save",
        };
        write!(f, "{label}")
    }
}

/// Result of asking to save the form
#[derive(Debug, Clone, PartialEq)]
pub enum SaveRequest {
    /// Form equals the record; the session went back to viewing without a write.
    NoChanges,
    /// The caller must show the changes and collect a reason.
    NeedsConfirmation {
        changes: ChangeSet,
        display: Vec<String>,
        reason_required: bool,
    },
}

/// What a confirmed save produced
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReceipt {
    pub record: EditableRecord,
    pub changes: ChangeSet,
    /// `None` when the history append failed and was dead-lettered.
    pub history: Option<HistoryEntry>,
}

/// Coordinates view/edit mode, locking, confirmation and saving of one record.
pub struct EditSession {
    ctx: SessionContext,
    kind: RecordKind,
    store: Arc<dyn RecordStore>,
    locks: Arc<LockManager>,
    audit: Arc<AuditTrail>,
    system_log: Option<SystemLogger>,
    config: EditConfig,
    state: EditState,
    record: Option<EditableRecord>,
    form: Option<FieldMap>,
    pending: Option<ChangeSet>,
    lock_status: Option<LockStatus>,
}

impl EditSession {
    /// Fails with `Validation` when `config` does not validate.
    pub fn new(
        store: Arc<dyn RecordStore>,
        kind: RecordKind,
        ctx: SessionContext,
        config: EditConfig,
    ) -> Result<Self> {
        config.validate().map_err(EditError::Validation)?;

        let history = HistoryLog::new(store.clone(), kind).with_page_size(config.history_page_size);
        Ok(Self {
            ctx,
            kind,
            locks: Arc::new(LockManager::new(store.clone(), kind)),
            audit: Arc::new(AuditTrail::new(history)),
            store,
            system_log: None,
            config,
            state: EditState::Viewing,
            record: None,
            form: None,
            pending: None,
            lock_status: None,
        })
    }

    /// Share an audit trail (and its dead letters) with other components.
    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = audit;
        self
    }

    /// Also write `update` events to the activity log on save.
    pub fn with_system_log(mut self, logger: SystemLogger) -> Self {
        self.system_log = Some(logger);
        self
    }

    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn record(&self) -> Option<&EditableRecord> {
        self.record.as_ref()
    }

    pub fn form(&self) -> Option<&FieldMap> {
        self.form.as_ref()
    }

    pub fn pending_changes(&self) -> Option<&ChangeSet> {
        self.pending.as_ref()
    }

    pub fn lock_status(&self) -> Option<&LockStatus> {
        self.lock_status.as_ref()
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn config(&self) -> &EditConfig {
        &self.config
    }

    /// Fetches the record from the store. Only while viewing.
    pub async fn load(&mut self, record_id: &RecordId) -> Result<&EditableRecord> {
        self.require(EditState::Viewing, "load a record")?;

        let row = self
            .store
            .select_by_id(self.kind.table(), record_id)
            .await?
            .ok_or_else(|| EditError::NotFound(record_id.clone()))?;
        let record = EditableRecord::from_row(self.kind, row)?;

        debug!("loaded {} {}", self.kind, record.id);
        let record = self.record.insert(record);
        Ok(&*record)
    }

    /// Uses an already fetched record. Only while viewing.
    pub fn set_record(&mut self, record: EditableRecord) -> Result<()> {
        self.require(EditState::Viewing, "replace the record")?;
        self.record = Some(record);
        Ok(())
    }

    /// Copies the record into the form and tries to take the edit lock.
    ///
    /// Under [`LockPolicy::Advisory`] a lock that is not granted only logs
    /// a warning; the edit proceeds unprotected.
    pub async fn enter_edit(&mut self) -> Result<LockStatus> {
        self.require(EditState::Viewing, "enter edit mode")?;
        let record = self.record.as_ref().ok_or(EditError::NotLoaded)?;
        let record_id = record.id.clone();
        let fields = record.fields.clone();

        let status = self
            .locks
            .acquire_lock(&record_id, &self.ctx.user_id)
            .await;

        if !status.acquired() {
            match self.config.lock_policy {
                LockPolicy::Required => {
                    let holder = match status {
                        LockStatus::HeldByOther => self
                            .locks
                            .holder(&record_id)
                            .await
                            .ok()
                            .flatten()
                            .map(|lock| lock.holder),
                        _ => None,
                    };
                    return Err(EditError::LockUnavailable { holder });
                }
                LockPolicy::Advisory => {
                    warn!(
                        "editing {} {} without lock ({:?})",
                        self.kind, record_id, status
                    );
                }
            }
        }

        self.form = Some(fields);
        self.lock_status = Some(status.clone());
        self.state = EditState::Editing;
        Ok(status)
    }

    /// Sets one form field. Store-owned columns (`id`, `created_at`,
    /// `updated_at`) are rejected.
    pub fn mutate_field(&mut self, name: &str, value: Value) -> Result<()> {
        self.require(EditState::Editing, "change a field")?;
        if is_reserved_column(name) {
            return Err(EditError::Validation(format!(
                "'{name}' is managed by the store and cannot be edited"
            )));
        }
        let form = self.form.as_mut().ok_or(EditError::NotLoaded)?;
        form.insert(name.to_string(), value);
        Ok(())
    }

    /// Diffs the form against the record.
    pub async fn request_save(&mut self) -> Result<SaveRequest> {
        self.require(EditState::Editing, "request a save")?;
        let record = self.record.as_ref().ok_or(EditError::NotLoaded)?;
        let form = self.form.as_ref().ok_or(EditError::NotLoaded)?;

        let changes = diff(&record.fields, form);
        if changes.is_empty() {
            debug!("no changes to {} {}", self.kind, record.id);
            self.release_held_lock().await;
            self.finish_editing();
            return Ok(SaveRequest::NoChanges);
        }

        let display = format_for_display(&changes, &self.config.empty_marker);
        self.pending = Some(changes.clone());
        self.state = EditState::ConfirmingSave;

        Ok(SaveRequest::NeedsConfirmation {
            changes,
            display,
            reason_required: self.config.require_reason,
        })
    }

    /// Leaves the confirmation step and keeps editing the same form.
    pub fn back_to_editing(&mut self) -> Result<()> {
        self.require(EditState::ConfirmingSave, "go back to editing")?;
        self.pending = None;
        self.state = EditState::Editing;
        Ok(())
    }

    /// Writes the pending changes and appends the history entry.
    ///
    /// A failed write leaves the session in `ConfirmingSave` so the same
    /// call can be retried. A failed history append does not fail the save.
    pub async fn confirm_save(&mut self, reason: &str) -> Result<SaveReceipt> {
        self.require(EditState::ConfirmingSave, "confirm a save")?;

        let reason = reason.trim();
        if self.config.require_reason && reason.is_empty() {
            return Err(EditError::Validation(
                "Please provide a reason for these changes".to_string(),
            ));
        }

        let record = self.record.as_ref().ok_or(EditError::NotLoaded)?;
        let changes = self.pending.clone().ok_or(EditError::NotLoaded)?;

        let now = Utc::now();
        let mut fields = changes.updated_fields();
        fields.retain(|key, _| !is_reserved_column(key));
        fields.insert("updated_at".to_string(), timestamp_value(now));

        let table = self.kind.table();
        let written = match self.config.concurrency {
            ConcurrencyMode::LastWriteWins => {
                self.store.update(table, &record.id, fields.clone()).await
            }
            ConcurrencyMode::ExpectUpdatedAt => {
                self.store
                    .update_if_unchanged(table, &record.id, record.updated_at, fields.clone())
                    .await
            }
        };
        let row = match written {
            Ok(row) => row,
            Err(err) => {
                warn!("saving {} {} failed: {}", self.kind, record.id, err);
                return Err(err.into());
            }
        };

        let saved = EditableRecord::from_row(self.kind, row).unwrap_or_else(|err| {
            debug!("store returned an undecodable row ({err}); merging locally");
            let mut merged = record.clone();
            for (key, value) in changes.updated_fields() {
                merged.fields.insert(key, value);
            }
            merged.updated_at = now;
            merged
        });

        let reason = (!reason.is_empty()).then_some(reason);
        let history = self
            .audit
            .record(
                &saved.id,
                &self.ctx.user_id,
                HistoryPayload::Updated {
                    changes: changes.clone(),
                },
                reason,
            )
            .await;

        if let Some(logger) = &self.system_log {
            logger
                .log_event(
                    &self.ctx,
                    ActionType::Update,
                    self.kind.noun(),
                    Some(&saved.id),
                    saved.name(),
                    json!({ "changes": changes }),
                    json!({}),
                )
                .await;
        }

        info!(
            "{} {} saved by {} ({} field(s))",
            self.kind,
            saved.id,
            self.ctx.user_id,
            changes.len()
        );

        self.record = Some(saved.clone());
        self.release_held_lock().await;
        self.finish_editing();

        Ok(SaveReceipt {
            record: saved,
            changes,
            history,
        })
    }

    /// Discards the form and returns to viewing immediately.
    ///
    /// The lock release runs detached; the handle can be awaited or dropped.
    /// Must be called within a Tokio runtime.
    pub fn cancel(&mut self) -> Result<Option<JoinHandle<ReleaseStatus>>> {
        if !matches!(self.state, EditState::Editing | EditState::ConfirmingSave) {
            return Err(EditError::InvalidTransition {
                operation: "cancel",
                state: self.state,
            });
        }

        let held = matches!(self.lock_status, Some(LockStatus::Granted));
        let record_id = self.record.as_ref().map(|r| r.id.clone());
        self.finish_editing();

        let handle = match (held, record_id) {
            (true, Some(record_id)) => {
                let locks = self.locks.clone();
                let user = self.ctx.user_id.clone();
                Some(tokio::spawn(async move {
                    locks.release_lock(&record_id, &user).await
                }))
            }
            _ => None,
        };
        Ok(handle)
    }

    /// Who holds the lock on the loaded record, for display.
    pub async fn lock_holder(&self) -> Result<Option<Lock>> {
        let record = self.record.as_ref().ok_or(EditError::NotLoaded)?;
        self.locks.holder(&record.id).await
    }

    /// History of the loaded record, newest first.
    pub async fn history(&self) -> Result<Vec<HistoryView>> {
        let record = self.record.as_ref().ok_or(EditError::NotLoaded)?;
        self.audit.log().list(&record.id).await
    }

    fn require(&self, expected: EditState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EditError::InvalidTransition {
                operation,
                state: self.state,
            })
        }
    }

    async fn release_held_lock(&self) {
        if !matches!(self.lock_status, Some(LockStatus::Granted)) {
            return;
        }
        let Some(record) = self.record.as_ref() else {
            return;
        };
        let status = self.locks.release_lock(&record.id, &self.ctx.user_id).await;
        if let Some(err) = status.error() {
            warn!("releasing lock on {} {} failed: {}", self.kind, record.id, err);
        }
    }

    fn finish_editing(&mut self) {
        self.form = None;
        self.pending = None;
        self.lock_status = None;
        self.state = EditState::Viewing;
    }
}
