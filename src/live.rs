//! List views kept current from change notifications.
//!
//! Events are applied as patches to the local rows. When the notification
//! stream cannot be trusted (the subscriber lagged, the channel closed, or
//! a limited list shrank) the list is refetched instead, so it always
//! converges on what the store holds.

use crate::core::{RecordId, Result, Row};
use crate::storage::{ChangeEvent, ChangeKind, Filter, RecordStore};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;

pub struct LiveList {
    store: Arc<dyn RecordStore>,
    table: String,
    filter: Filter,
    rows: Vec<Row>,
    events: Receiver<ChangeEvent>,
    stale: bool,
    refetches: usize,
}

impl LiveList {
    /// Subscribes, then performs the initial fetch, so no change between
    /// the two is lost.
    pub async fn open(store: Arc<dyn RecordStore>, table: &str, filter: Filter) -> Result<Self> {
        let events = store.subscribe(table);
        let rows = store.select(table, &filter).await?;
        Ok(Self {
            store,
            table: table.to_string(),
            filter,
            rows,
            events,
            stale: false,
            refetches: 0,
        })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// How many full refetches happened after the initial fetch.
    pub fn refetch_count(&self) -> usize {
        self.refetches
    }

    /// Applies every queued notification. Returns how many were applied.
    pub async fn sync(&mut self) -> Result<usize> {
        let mut applied = 0;
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    self.apply(&event);
                    applied += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("{} list missed {} change(s)", self.table, missed);
                    self.stale = true;
                }
                Err(TryRecvError::Closed) => {
                    self.events = self.store.subscribe(&self.table);
                    self.stale = true;
                    break;
                }
            }
        }

        if self.stale {
            self.refetch().await?;
        }
        Ok(applied)
    }

    /// Waits for at least one notification, then syncs.
    pub async fn changed(&mut self) -> Result<usize> {
        match self.events.recv().await {
            Ok(event) => {
                self.apply(&event);
                Ok(1 + self.sync().await?)
            }
            Err(RecvError::Lagged(_)) | Err(RecvError::Closed) => {
                self.stale = true;
                self.sync().await
            }
        }
    }

    /// Patches the local rows with one event.
    pub fn apply(&mut self, event: &ChangeEvent) {
        if event.table != self.table {
            return;
        }
        let Some(id) = event.row.get("id").and_then(RecordId::from_value) else {
            self.stale = true;
            return;
        };

        let before = self.rows.len();
        self.rows
            .retain(|row| row.get("id").and_then(RecordId::from_value).as_ref() != Some(&id));
        let removed = self.rows.len() < before;

        let keep = event.kind != ChangeKind::Delete && self.filter.matches(&event.row);
        if keep {
            self.rows.push(event.row.clone());
            self.filter.sort(&mut self.rows);
        }

        if let Some(limit) = self.filter.limit_value() {
            if self.rows.len() > limit {
                self.rows.truncate(limit);
            } else if removed && !keep {
                // A row from beyond the limit may now belong in the list.
                self.stale = true;
            }
        }

        debug!("{} list patched ({:?} {})", self.table, event.kind, id);
    }

    pub async fn refetch(&mut self) -> Result<()> {
        self.rows = self.store.select(&self.table, &self.filter).await?;
        self.stale = false;
        self.refetches += 1;
        Ok(())
    }
}
