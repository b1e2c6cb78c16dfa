//! Bidirectional sync between platform bugs and external items

mod coordinator;
mod locks;
mod ports;

pub use coordinator::{SyncAction, SyncCoordinator, SyncResult, SyncServices, SyncWarning};
pub use locks::{SyncGuard, SyncKey, SyncLocks};
pub use ports::{
    AuditAction, AuditEvent, AuditSink, BugStore, DetachedBugStore, SyncOperation, TracingAuditSink,
};
