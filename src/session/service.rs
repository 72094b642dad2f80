use crate::context::SessionContext;
use crate::core::types::timestamp_value;
use crate::core::{EditError, EditableRecord, FieldMap, RecordId, RecordKind, Result};
use crate::history::{AuditTrail, HistoryEntry, HistoryLog, HistoryPayload};
use crate::storage::RecordStore;
use crate::system_log::{ActionType, SystemLogger};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;

pub const COMPLIANCE_TABLE: &str = "compliance_analysis";

/// Record mutations that happen outside an edit session: creation, status
/// transitions and compliance reviews. Each one leaves a history entry.
pub struct RecordService {
    store: Arc<dyn RecordStore>,
    kind: RecordKind,
    audit: Arc<AuditTrail>,
    system_log: Option<SystemLogger>,
}

impl RecordService {
    pub fn new(store: Arc<dyn RecordStore>, kind: RecordKind) -> Self {
        let audit = Arc::new(AuditTrail::new(HistoryLog::new(store.clone(), kind)));
        Self {
            store,
            kind,
            audit,
            system_log: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_system_log(mut self, logger: SystemLogger) -> Self {
        self.system_log = Some(logger);
        self
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub async fn create(&self, ctx: &SessionContext, fields: FieldMap) -> Result<EditableRecord> {
        if fields
            .get("name")
            .and_then(Value::as_str)
            .is_none_or(|name| name.trim().is_empty())
        {
            return Err(EditError::Validation(format!(
                "a new {} needs a name",
                self.kind
            )));
        }

        let mut row = fields.clone();
        row.insert("updated_at".to_string(), timestamp_value(Utc::now()));
        let inserted = self.store.insert(self.kind.table(), row).await?;
        let record = EditableRecord::from_row(self.kind, inserted)?;

        self.audit
            .record(
                &record.id,
                &ctx.user_id,
                HistoryPayload::Created { snapshot: fields },
                None,
            )
            .await;
        if let Some(logger) = &self.system_log {
            logger
                .log_event(
                    ctx,
                    ActionType::Create,
                    self.kind.noun(),
                    Some(&record.id),
                    record.name(),
                    json!({ "changes": record.fields }),
                    json!({}),
                )
                .await;
        }

        Ok(record)
    }

    /// Moves a record to `new_status`. Setting the current status again is
    /// a no-op without a write or history entry.
    pub async fn change_status(
        &self,
        ctx: &SessionContext,
        record_id: &RecordId,
        new_status: &str,
    ) -> Result<EditableRecord> {
        let new_status = new_status.trim();
        if new_status.is_empty() {
            return Err(EditError::Validation("status cannot be empty".to_string()));
        }

        let current = self.fetch(record_id).await?;
        if current.status() == Some(new_status) {
            return Ok(current);
        }
        let previous_status = current.status().map(str::to_string);

        let mut fields = FieldMap::new();
        fields.insert("status".to_string(), json!(new_status));
        fields.insert("updated_at".to_string(), timestamp_value(Utc::now()));
        let row = self
            .store
            .update(self.kind.table(), record_id, fields)
            .await?;
        let record = EditableRecord::from_row(self.kind, row)?;

        self.audit
            .record(
                record_id,
                &ctx.user_id,
                HistoryPayload::StatusChange {
                    previous_status,
                    new_status: new_status.to_string(),
                },
                None,
            )
            .await;

        Ok(record)
    }

    /// Stores a compliance analysis for the record and notes it in history.
    pub async fn record_compliance_update(
        &self,
        ctx: &SessionContext,
        record_id: &RecordId,
        analysis: FieldMap,
    ) -> Result<Option<HistoryEntry>> {
        self.fetch(record_id).await?;

        let mut row = analysis.clone();
        row.insert(self.kind.history_key().to_string(), record_id.to_value());
        row.entry("evaluation_date".to_string())
            .or_insert_with(|| timestamp_value(Utc::now()));
        self.store.insert(COMPLIANCE_TABLE, row).await?;

        Ok(self
            .audit
            .record(
                record_id,
                &ctx.user_id,
                HistoryPayload::ComplianceUpdate {
                    details: Value::Object(analysis),
                },
                None,
            )
            .await)
    }

    /// Removes the record. Its history stays and gains a `deleted` entry.
    pub async fn delete(&self, ctx: &SessionContext, record_id: &RecordId) -> Result<()> {
        let record = self.fetch(record_id).await?;
        if !self.store.delete(self.kind.table(), record_id).await? {
            return Err(EditError::NotFound(record_id.clone()));
        }

        self.audit
            .record(record_id, &ctx.user_id, HistoryPayload::Deleted, None)
            .await;
        if let Some(logger) = &self.system_log {
            logger
                .log_event(
                    ctx,
                    ActionType::Delete,
                    self.kind.noun(),
                    Some(record_id),
                    record.name(),
                    json!({ "changes": record.fields }),
                    json!({}),
                )
                .await;
        }
        Ok(())
    }

    async fn fetch(&self, record_id: &RecordId) -> Result<EditableRecord> {
        let row = self
            .store
            .select_by_id(self.kind.table(), record_id)
            .await?
            .ok_or_else(|| EditError::NotFound(record_id.clone()))?;
        Ok(EditableRecord::from_row(self.kind, row)?)
    }
}
