//! Session tree store: append-only, branchable history with JSONL persistence.

pub mod context;
pub mod entry;
pub mod log;
pub mod paths;
pub mod tree;

use std::sync::Arc;

use tokio::sync::RwLock;

pub use context::SessionContext;
pub use entry::{CompactionDetails, CompactionRecord, EntryId, EntryPayload, SessionEntry};
pub use log::{SessionHeader, SessionLog, CURRENT_SESSION_VERSION};
pub use tree::SessionTree;

/// Session tree shared between the running loop (the single writer) and readers.
pub type SharedSession = Arc<RwLock<SessionTree>>;

pub fn shared(tree: SessionTree) -> SharedSession {
    Arc::new(RwLock::new(tree))
}
