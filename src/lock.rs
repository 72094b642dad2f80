//! Advisory per-record edit locks.
//!
//! Locks are hints for concurrent editors. Nothing here prevents a write;
//! the store keeps at most one holder per record and decides who gets it.

use crate::core::types::{LOCK_USER_ARG, parse_timestamp};
use crate::core::{RecordId, RecordKind, Result, StoreError, UserId};
use crate::storage::RecordStore;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// Active lock on a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub record_id: RecordId,
    pub holder: UserId,
    pub acquired_at: DateTime<Utc>,
}

/// Outcome of an acquisition attempt. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Granted,
    HeldByOther,
    /// The store could not be asked; carries its message.
    Failed(String),
}

impl LockStatus {
    pub fn acquired(&self) -> bool {
        matches!(self, Self::Granted)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// Outcome of a release. Releasing an unheld lock is `NotHeld`, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseStatus {
    Released,
    NotHeld,
    Failed(String),
}

impl ReleaseStatus {
    pub fn released(&self) -> bool {
        matches!(self, Self::Released)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// Issues the lock RPCs for one record kind.
pub struct LockManager {
    store: Arc<dyn RecordStore>,
    kind: RecordKind,
    last_error: Mutex<Option<String>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn RecordStore>, kind: RecordKind) -> Self {
        Self {
            store,
            kind,
            last_error: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Message of the most recent failed lock call, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub async fn acquire_lock(&self, record_id: &RecordId, user_id: &UserId) -> LockStatus {
        let rpc = self.kind.lock_rpc();
        match self.call(rpc.acquire, rpc.id_arg, record_id, Some(user_id)).await {
            Ok(Value::Bool(true)) => {
                debug!("{} {} locked by {}", self.kind, record_id, user_id);
                LockStatus::Granted
            }
            Ok(Value::Bool(false)) => {
                debug!("{} {} lock denied to {}", self.kind, record_id, user_id);
                LockStatus::HeldByOther
            }
            Ok(other) => LockStatus::Failed(
                self.remember(format!("{}: unexpected response {}", rpc.acquire, other)),
            ),
            Err(err) => LockStatus::Failed(self.remember(err.to_string())),
        }
    }

    pub async fn release_lock(&self, record_id: &RecordId, user_id: &UserId) -> ReleaseStatus {
        let rpc = self.kind.lock_rpc();
        match self.call(rpc.release, rpc.id_arg, record_id, Some(user_id)).await {
            Ok(Value::Bool(true)) => ReleaseStatus::Released,
            Ok(Value::Bool(false)) => ReleaseStatus::NotHeld,
            Ok(other) => ReleaseStatus::Failed(
                self.remember(format!("{}: unexpected response {}", rpc.release, other)),
            ),
            Err(err) => ReleaseStatus::Failed(self.remember(err.to_string())),
        }
    }

    /// Current holder, for display next to the record.
    pub async fn holder(&self, record_id: &RecordId) -> Result<Option<Lock>> {
        let rpc = self.kind.lock_rpc();
        let value = self.call(rpc.holder, rpc.id_arg, record_id, None).await?;
        if value.is_null() {
            return Ok(None);
        }

        let holder = value
            .get("locked_by")
            .and_then(UserId::from_value)
            .ok_or_else(|| StoreError::Decode(format!("{}: missing locked_by", rpc.holder)))?;
        let acquired_at = value
            .get("locked_at")
            .and_then(parse_timestamp)
            .ok_or_else(|| StoreError::Decode(format!("{}: missing locked_at", rpc.holder)))?;

        Ok(Some(Lock {
            record_id: record_id.clone(),
            holder,
            acquired_at,
        }))
    }

    async fn call(
        &self,
        name: &str,
        id_arg: &str,
        record_id: &RecordId,
        user_id: Option<&UserId>,
    ) -> std::result::Result<Value, StoreError> {
        let mut args = Map::new();
        args.insert(id_arg.to_string(), record_id.to_value());
        if let Some(user) = user_id {
            args.insert(LOCK_USER_ARG.to_string(), user.to_value());
        }
        self.store.rpc(name, Value::Object(args)).await
    }

    fn remember(&self, message: String) -> String {
        warn!("{} lock call failed: {}", self.kind, message);
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(message.clone());
        }
        message
    }
}
