//! Durable workflow state: SQLite-backed records, activity logs, and the
//! issue-number tracker.
//!
//! The database connection is synchronous (`rusqlite`), so async callers go
//! through [`DbHandle`] — a thin `Arc<Mutex<AdwDb>>` whose `call()` runs the
//! closure on the blocking thread pool. Handlers read like:
//!
//! ```ignore
//! let record = state.db.call(move |db| db.get_workflow(&adw_id)).await?;
//! ```

mod allocator;
mod db;
pub mod models;
mod state_file;

pub use db::AdwDb;

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use thiserror::Error;

/// Errors surfaced by the state store. The API layer maps these onto HTTP
/// statuses (409 / 404 / 409 / 500).
#[derive(Debug, Error)]
pub enum StoreError {
    /// adw_id or issue_number already exists.
    #[error("{0}")]
    Conflict(String),

    /// Record absent or soft-deleted.
    #[error("{0}")]
    NotFound(String),

    /// Unique-constraint contention survived all retries.
    #[error("{0}")]
    Contention(String),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(anyhow::Error::new(e))
    }
}

/// Shared handle over the synchronous database.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<AdwDb>>,
}

impl DbHandle {
    pub fn new(db: AdwDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a closure against the database on the blocking pool.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut AdwDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut db = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut db)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow!("database task panicked: {e}")))?
    }

    /// Synchronous access for startup paths that run before the runtime
    /// has work scheduled.
    pub fn lock_sync(&self) -> std::sync::MutexGuard<'_, AdwDb> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_call_round_trip() {
        let db = AdwDb::new_in_memory().unwrap();
        let handle = DbHandle::new(db);
        let health = handle.call(|db| Ok(db.health())).await.unwrap();
        assert!(health.healthy);
    }
}
