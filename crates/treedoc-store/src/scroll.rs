//! Scroll cursors
//!
//! A scroll keeps its backend session and result stream open between calls.
//! The registry hands a cursor out while a batch is read and takes it back
//! afterwards, so no lock is held across backend calls. Idle cursors past
//! their keep-alive are reclaimed on the next registry access.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::BackendResult;
use crate::error::StoreError;
use crate::session::{translate, SessionGuard};
use crate::tree;
use crate::Result;

/// One batch of a scroll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrollResult {
    pub scroll_id: String,
    pub ids: Vec<String>,
}

impl ScrollResult {
    /// The terminal batch is empty; its cursor is already released.
    pub fn has_results(&self) -> bool {
        !self.ids.is_empty()
    }
}

pub(crate) struct Cursor {
    guard: SessionGuard,
    documents: BoxStream<'static, BackendResult<String>>,
    batch_size: usize,
    keep_alive: Duration,
    last_used: Instant,
}

impl Cursor {
    pub fn new(
        guard: SessionGuard,
        documents: BoxStream<'static, BackendResult<String>>,
        batch_size: usize,
        keep_alive: Duration,
    ) -> Self {
        Self {
            guard,
            documents,
            batch_size: batch_size.max(1),
            keep_alive,
            last_used: Instant::now(),
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_used) > self.keep_alive
    }

    /// Next ids, at most one batch.
    pub async fn next_batch(&mut self) -> Result<Vec<String>> {
        self.last_used = Instant::now();
        let mut ids = Vec::with_capacity(self.batch_size);
        while ids.len() < self.batch_size {
            let Some(document) = self.documents.next().await else {
                break;
            };
            let document = document.map_err(|e| translate(e, None))?;
            let state = tree::deserialize(&document)?;
            match state.id() {
                Some(id) => ids.push(id.to_string()),
                None => warn!("scrolled document without id skipped"),
            }
        }
        Ok(ids)
    }

    pub async fn close(mut self) -> Result<()> {
        self.guard.close().await
    }
}

/// Open scroll cursors by id.
#[derive(Default)]
pub(crate) struct ScrollRegistry {
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl ScrollRegistry {
    fn cursors(&self) -> MutexGuard<'_, HashMap<String, Cursor>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, cursor: Cursor) -> String {
        let id = Uuid::new_v4().to_string();
        self.cursors().insert(id.clone(), cursor);
        id
    }

    /// Take a cursor out for reading; `put_back` returns it.
    pub fn check_out(&self, scroll_id: &str) -> Result<Cursor> {
        self.cursors()
            .remove(scroll_id)
            .ok_or_else(|| StoreError::ScrollNotFound {
                scroll_id: scroll_id.to_string(),
            })
    }

    pub fn put_back(&self, scroll_id: String, cursor: Cursor) {
        self.cursors().insert(scroll_id, cursor);
    }

    pub fn len(&self) -> usize {
        self.cursors().len()
    }

    /// Remove idle cursors; the caller closes them.
    pub fn expired(&self) -> Vec<(String, Cursor)> {
        let now = Instant::now();
        let mut cursors = self.cursors();
        let ids: Vec<String> = cursors
            .iter()
            .filter(|(_, c)| c.expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| cursors.remove(&id).map(|c| (id, c)))
            .collect()
    }

    /// Close every idle cursor.
    pub async fn reclaim(&self) {
        for (id, cursor) in self.expired() {
            warn!(scroll_id = %id, "reclaiming idle scroll");
            if let Err(e) = cursor.close().await {
                debug!(scroll_id = %id, error = %e, "closing reclaimed scroll failed");
            }
        }
    }
}
