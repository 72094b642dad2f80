//! Application-wide activity log (`system_logs` table).

use crate::context::SessionContext;
use crate::core::types::timestamp_value;
use crate::core::{EditError, RecordId, Result, Row};
use crate::storage::{Filter, RecordStore, SortDirection};
use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;

pub const SYSTEM_LOGS_TABLE: &str = "system_logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    View,
    Search,
    Login,
    Logout,
    Export,
    Download,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::View => "view",
            Self::Search => "search",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Export => "export",
            Self::Download => "download",
        }
    }

    pub fn is_data_change(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }

    pub fn is_auth(self) -> bool {
        matches!(self, Self::Login | Self::Logout)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filters for reading the activity log. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct SystemLogQuery {
    pub action_type: Option<ActionType>,
    pub entity_type: Option<String>,
    pub entity_id: Option<RecordId>,
    pub user_email: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Case-insensitive match on the entity name.
    pub search_text: Option<String>,
}

impl SystemLogQuery {
    fn to_filter(&self) -> Filter {
        let mut filter = Filter::new().order_by("timestamp", SortDirection::Descending);
        if let Some(action) = self.action_type {
            filter = filter.eq("action_type", json!(action.as_str()));
        }
        if let Some(entity_type) = &self.entity_type {
            filter = filter.eq("entity_type", json!(entity_type));
        }
        if let Some(entity_id) = &self.entity_id {
            filter = filter.eq("entity_id", entity_id.to_value());
        }
        if let Some(email) = &self.user_email {
            filter = filter.eq("user_email", json!(email));
        }
        if let Some(start) = self.start {
            filter = filter.gte("timestamp", timestamp_value(start));
        }
        if let Some(end) = self.end {
            filter = filter.lte("timestamp", timestamp_value(end));
        }
        if let Some(text) = &self.search_text {
            filter = filter.ilike("entity_name", text);
        }
        filter
    }
}

/// Writes activity events on behalf of the session's user.
#[derive(Clone)]
pub struct SystemLogger {
    store: Arc<dyn RecordStore>,
}

impl SystemLogger {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Inserts one event. Failures are logged and yield `None`.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_event(
        &self,
        ctx: &SessionContext,
        action: ActionType,
        entity_type: &str,
        entity_id: Option<&RecordId>,
        entity_name: Option<&str>,
        details: Value,
        metadata: Value,
    ) -> Option<Row> {
        let mut row = Row::new();
        row.insert("action_type".into(), json!(action.as_str()));
        row.insert("entity_type".into(), json!(entity_type));
        row.insert(
            "entity_id".into(),
            entity_id.map(RecordId::to_value).unwrap_or(Value::Null),
        );
        row.insert("entity_name".into(), json!(entity_name));
        row.insert("user_id".into(), ctx.user_id.to_value());
        row.insert("user_email".into(), json!(ctx.email));
        row.insert("session_id".into(), json!(ctx.session_id));
        row.insert("details".into(), details);
        row.insert("metadata".into(), metadata);
        row.insert("timestamp".into(), timestamp_value(Utc::now()));

        match self.store.insert(SYSTEM_LOGS_TABLE, row).await {
            Ok(row) => Some(row),
            Err(err) => {
                error!("failed to write {} system log: {}", action, err);
                None
            }
        }
    }

    /// Records a create, update or delete. Other actions are rejected.
    pub async fn log_data_change(
        &self,
        ctx: &SessionContext,
        action: ActionType,
        entity_type: &str,
        entity_id: &RecordId,
        entity_name: Option<&str>,
        changes: Value,
    ) -> Result<Option<Row>> {
        if !action.is_data_change() {
            return Err(EditError::Validation(format!(
                "'{action}' is not a data change action"
            )));
        }
        Ok(self
            .log_event(
                ctx,
                action,
                entity_type,
                Some(entity_id),
                entity_name,
                json!({ "changes": changes }),
                json!({}),
            )
            .await)
    }

    pub async fn log_entity_view(
        &self,
        ctx: &SessionContext,
        entity_type: &str,
        entity_id: &RecordId,
        entity_name: Option<&str>,
    ) -> Option<Row> {
        self.log_event(
            ctx,
            ActionType::View,
            entity_type,
            Some(entity_id),
            entity_name,
            json!({}),
            json!({}),
        )
        .await
    }

    pub async fn log_search(
        &self,
        ctx: &SessionContext,
        entity_type: &str,
        search_params: Value,
        result_count: usize,
    ) -> Option<Row> {
        self.log_event(
            ctx,
            ActionType::Search,
            entity_type,
            None,
            None,
            json!({ "search_params": search_params, "result_count": result_count }),
            json!({}),
        )
        .await
    }

    /// Records a login or logout. Other actions are rejected.
    pub async fn log_auth(&self, ctx: &SessionContext, action: ActionType) -> Result<Option<Row>> {
        if !action.is_auth() {
            return Err(EditError::Validation(format!(
                "'{action}' is not an auth action"
            )));
        }
        let user = RecordId::new(ctx.user_id.as_str());
        Ok(self
            .log_event(
                ctx,
                action,
                "system",
                Some(&user),
                None,
                json!({ "auth_event": action.as_str() }),
                json!({}),
            )
            .await)
    }

    /// Events matching `query`, newest first.
    pub async fn query(&self, query: &SystemLogQuery) -> Result<Vec<Row>> {
        Ok(self
            .store
            .select(SYSTEM_LOGS_TABLE, &query.to_filter())
            .await?)
    }
}
