//! Local case directory: case status in SQLite plus in-process close subscribers.

use crate::collaborators::{CaseProvider, CloseCallback, CollaboratorError, UserId};
use crate::db::Database;
use lookout_core::CaseId;
use std::sync::{Arc, RwLock};

pub struct CaseDirectory {
    db: Arc<Database>,
    subscribers: RwLock<Vec<CloseCallback>>,
}

impl CaseDirectory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, subscribers: RwLock::new(Vec::new()) }
    }

    /// Mark a case ACTIVE with its reporter, creating it if needed.
    pub fn open_case(&self, case_id: &CaseId, reporter: &UserId) -> Result<(), CollaboratorError> {
        self.db.upsert_active_case(case_id, reporter)?;
        tracing::info!(case_id = %case_id, reporter = %reporter, "case active");
        Ok(())
    }

    /// Close a case. Subscribers run only on an actual ACTIVE → CLOSED
    /// transition, after the new status is committed.
    pub fn close_case(&self, case_id: &CaseId) -> Result<bool, CollaboratorError> {
        let transitioned = self.db.close_case(case_id)?;
        if !transitioned {
            tracing::debug!(case_id = %case_id, "close requested for a case that is not active");
            return Ok(false);
        }

        tracing::info!(case_id = %case_id, "case closed");
        match self.subscribers.read() {
            Ok(subscribers) => {
                for callback in subscribers.iter() {
                    callback(case_id);
                }
            }
            Err(_) => tracing::error!(case_id = %case_id, "close subscribers unavailable (lock poisoned)"),
        }
        Ok(true)
    }

    pub fn active_count(&self) -> usize {
        self.active_case_ids().len()
    }

    /// Advisory readiness gate: at least one open case, at most `max_active`.
    /// Reported in status, never enforced.
    pub fn is_ready(&self, max_active: usize) -> bool {
        let active = self.active_count();
        active > 0 && active <= max_active
    }
}

impl CaseProvider for CaseDirectory {
    fn active_case_ids(&self) -> Vec<CaseId> {
        self.db.active_case_ids().unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to list active cases");
            Vec::new()
        })
    }

    fn is_active(&self, case_id: &CaseId) -> bool {
        match self.db.case(case_id) {
            Ok(record) => record.is_some_and(|r| r.active),
            Err(e) => {
                tracing::error!(case_id = %case_id, error = %e, "failed to read case status");
                false
            }
        }
    }

    fn reporter_of(&self, case_id: &CaseId) -> Option<UserId> {
        match self.db.case(case_id) {
            Ok(record) => record.map(|r| r.reporter),
            Err(e) => {
                tracing::error!(case_id = %case_id, error = %e, "failed to read case reporter");
                None
            }
        }
    }

    fn subscribe_to_close(&self, callback: CloseCallback) {
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.push(callback),
            Err(_) => tracing::error!("close subscribers unavailable (lock poisoned)"),
        }
    }
}
