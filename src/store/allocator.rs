//! Transactional issue-number allocation.
//!
//! Each attempt runs `SELECT MAX + INSERT` inside one immediate
//! transaction, so concurrent allocators serialize on the database write
//! lock and the UNIQUE index catches any race that slips through. Unique
//! violations retry with backoff; anything else aborts.

use std::time::Duration;

use rusqlite::{TransactionBehavior, params};
use tracing::{info, warn};

use super::models::{IssueAllocate, IssueRecord};
use super::{AdwDb, StoreError};

const MAX_RETRIES: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(100);

impl AdwDb {
    /// Allocate the next sequential issue number.
    ///
    /// Returns the inserted tracker row. After [`MAX_RETRIES`] unique
    /// violations the allocation surfaces as [`StoreError::Contention`]
    /// (HTTP 409 at the boundary).
    pub fn allocate_issue(&mut self, req: &IssueAllocate) -> Result<IssueRecord, StoreError> {
        for attempt in 0..=MAX_RETRIES {
            match self.try_allocate(req) {
                Ok(record) => {
                    info!(
                        issue_number = record.issue_number,
                        issue_title = %record.issue_title,
                        "allocated issue number"
                    );
                    return Ok(record);
                }
                Err(e) if is_unique_violation(&e) => {
                    warn!(
                        attempt = attempt + 1,
                        "unique constraint violation during allocation"
                    );
                    if attempt == MAX_RETRIES {
                        return Err(StoreError::Contention(
                            "Unable to allocate unique issue number after multiple retries"
                                .to_string(),
                        ));
                    }
                    std::thread::sleep(BACKOFF_STEP * (attempt + 1));
                }
                Err(e) => return Err(StoreError::from(e)),
            }
        }
        unreachable!("allocation loop always returns")
    }

    fn try_allocate(&mut self, req: &IssueAllocate) -> rusqlite::Result<IssueRecord> {
        let tx = self
            .connection()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let next_number: i64 = tx.query_row(
            "SELECT COALESCE(MAX(issue_number), 0) + 1 FROM issue_tracker",
            [],
            |row| row.get(0),
        )?;

        let project_id = req.project_id.as_deref().unwrap_or("default");
        tx.execute(
            "INSERT INTO issue_tracker (issue_number, issue_title, project_id, adw_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![next_number, req.issue_title, project_id, req.adw_id],
        )?;

        let record = tx.query_row(
            "SELECT id, issue_number, issue_title, project_id, adw_id, created_at, deleted_at
             FROM issue_tracker WHERE issue_number = ?1",
            params![next_number],
            |row| {
                Ok(IssueRecord {
                    id: row.get(0)?,
                    issue_number: row.get(1)?,
                    issue_title: row.get(2)?,
                    project_id: row.get(3)?,
                    adw_id: row.get(4)?,
                    created_at: row.get(5)?,
                    deleted_at: row.get(6)?,
                })
            },
        )?;

        tx.commit()?;
        Ok(record)
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DbHandle;

    fn allocate(db: &mut AdwDb, title: &str) -> IssueRecord {
        db.allocate_issue(&IssueAllocate {
            issue_title: title.to_string(),
            project_id: None,
            adw_id: None,
        })
        .unwrap()
    }

    #[test]
    fn test_sequential_allocation_from_empty() {
        let mut db = AdwDb::new_in_memory().unwrap();
        for expected in 1..=10 {
            let record = allocate(&mut db, &format!("issue {}", expected));
            assert_eq!(record.issue_number, expected);
        }
    }

    #[test]
    fn test_allocation_continues_past_existing_max() {
        let mut db = AdwDb::new_in_memory().unwrap();
        allocate(&mut db, "a");
        allocate(&mut db, "b");
        let record = allocate(&mut db, "c");
        assert_eq!(record.issue_number, 3);
        assert_eq!(record.project_id, "default");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_allocation_is_contiguous() {
        let handle = DbHandle::new(AdwDb::new_in_memory().unwrap());

        let mut tasks = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .call(move |db| {
                        db.allocate_issue(&IssueAllocate {
                            issue_title: format!("concurrent {}", i),
                            project_id: None,
                            adw_id: None,
                        })
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut numbers: Vec<i64> = Vec::new();
        for task in tasks {
            numbers.push(task.await.unwrap().issue_number);
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=20).collect::<Vec<i64>>());
    }
}
