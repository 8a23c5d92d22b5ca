//! Keeps the representation store in step with case status.

use crate::collaborators::CaseProvider;
use crate::store::RepresentationStore;
use lookout_core::CaseId;
use std::sync::Arc;

/// Purges a case's stored representations when it closes.
pub struct CaseLifecycleHook {
    store: Arc<RepresentationStore>,
}

impl CaseLifecycleHook {
    pub fn new(store: Arc<RepresentationStore>) -> Self {
        Self { store }
    }

    /// Failures are logged and swallowed so closing a case never fails on
    /// account of the matching cache.
    pub fn on_case_closed(&self, case_id: &CaseId) {
        if let Err(e) = self.store.delete(case_id) {
            tracing::error!(case_id = %case_id, error = %e, "failed to purge representations");
        }
    }
}

/// Subscribe a purge hook to case close events.
pub fn install(cases: &dyn CaseProvider, store: Arc<RepresentationStore>) {
    let hook = CaseLifecycleHook::new(store);
    cases.subscribe_to_close(Box::new(move |case_id| hook.on_case_closed(case_id)));
}

/// Drop cached representations of cases that closed while the daemon was
/// down. Returns the number of cases purged.
pub fn reconcile(cases: &dyn CaseProvider, store: &RepresentationStore) -> usize {
    let mut purged = 0;
    for case_id in store.case_ids() {
        if cases.is_active(&case_id) {
            continue;
        }
        match store.delete(&case_id) {
            Ok(()) => purged += 1,
            Err(e) => tracing::warn!(case_id = %case_id, error = %e, "stale case purge failed"),
        }
    }
    if purged > 0 {
        tracing::info!(purged, "purged representations of inactive cases");
    }
    purged
}
