//! Shared security document state.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::store::records::SecurityDoc;

/// The synced cluster security document, updated only when the store's
/// modification index moves forward.
#[derive(Default)]
pub struct SecurityState {
    doc: RwLock<SecurityDoc>,
    last_index: AtomicU64,
}

impl SecurityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a fetched document. Rejected unless the index strictly
    /// increased and the document carries any users — a half-written or
    /// replayed record must not wipe the working copy.
    pub async fn apply(&self, index: u64, doc: SecurityDoc) -> bool {
        if index <= self.last_index.load(Ordering::SeqCst) {
            debug!(index, "security document not newer, ignored");
            return false;
        }
        if doc.is_empty() {
            debug!(index, "empty security document ignored");
            return false;
        }
        *self.doc.write().await = doc;
        self.last_index.store(index, Ordering::SeqCst);
        info!(index, "security document updated");
        true
    }

    pub async fn current(&self) -> SecurityDoc {
        self.doc.read().await.clone()
    }

    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::SeqCst)
    }
}
