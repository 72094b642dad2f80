use super::{HistoryEntry, HistoryLog, HistoryPayload};
use crate::core::{RecordId, UserId};
use chrono::{DateTime, Utc};
use log::{error, info};
use std::sync::Mutex;

/// History write that could not be delivered
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub record_id: RecordId,
    pub user_id: UserId,
    pub payload: HistoryPayload,
    pub reason: Option<String>,
    /// When the change happened; kept on redelivery.
    pub created_at: DateTime<Utc>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Best-effort history emission.
///
/// A failed append never fails the record mutation it describes. The
/// failure is logged and parked in a dead-letter queue that can be
/// inspected and retried.
pub struct AuditTrail {
    log: HistoryLog,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl AuditTrail {
    pub fn new(log: HistoryLog) -> Self {
        Self {
            log,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> &HistoryLog {
        &self.log
    }

    /// Appends an entry, returning it on success. On failure returns `None`
    /// and keeps the write for a later retry.
    pub async fn record(
        &self,
        record_id: &RecordId,
        user_id: &UserId,
        payload: HistoryPayload,
        reason: Option<&str>,
    ) -> Option<HistoryEntry> {
        let created_at = Utc::now();
        match self
            .log
            .append_at(record_id, user_id, payload.clone(), reason, created_at)
            .await
        {
            Ok(entry) => Some(entry),
            Err(err) => {
                error!(
                    "history append for {} {} failed: {}",
                    self.log.kind(),
                    record_id,
                    err
                );
                self.park(DeadLetter {
                    record_id: record_id.clone(),
                    user_id: user_id.clone(),
                    payload,
                    reason: reason.map(str::to_string),
                    created_at,
                    error: err.to_string(),
                    failed_at: Utc::now(),
                });
                None
            }
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    /// Re-sends parked writes in order. Those that fail again stay parked.
    /// Returns how many were delivered.
    pub async fn retry_dead_letters(&self) -> usize {
        let pending = match self.dead_letters.lock() {
            Ok(mut letters) => std::mem::take(&mut *letters),
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for letter in pending {
            match self
                .log
                .append_at(
                    &letter.record_id,
                    &letter.user_id,
                    letter.payload.clone(),
                    letter.reason.as_deref(),
                    letter.created_at,
                )
                .await
            {
                Ok(_) => delivered += 1,
                Err(err) => self.park(DeadLetter {
                    error: err.to_string(),
                    failed_at: Utc::now(),
                    ..letter
                }),
            }
        }

        if delivered > 0 {
            info!("redelivered {} history entries", delivered);
        }
        delivered
    }

    fn park(&self, letter: DeadLetter) {
        if let Ok(mut letters) = self.dead_letters.lock() {
            letters.push(letter);
        }
    }
}
