//! BugBridge - Bidirectional bug sync with external issue trackers
//!
//! BugBridge links a platform's bugs to items in Jira, Trello and Azure
//! DevOps. It owns the per-tenant integrations (OAuth or static tokens,
//! encrypted at rest), the field mappings between vocabularies, and the
//! ledger of which bug is which external item. The bugs themselves stay in
//! the platform and are reached through [`sync::BugStore`].
//!
//! # Architecture
//!
//! - **vault**: Token storage, OAuth handshakes and refresh
//! - **integration**: Per-tenant integration records and their state machine
//! - **mapping**: Status and severity translation
//! - **providers**: REST adapters (Jira, Trello, Azure DevOps)
//! - **ledger**: Bug <-> external item links
//! - **sync**: Push and pull orchestration
//! - **store**: SQLite persistence shared by the above

// Core modules
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod retry;
pub mod store;

// Engine
pub mod integration;
pub mod ledger;
pub mod mapping;
pub mod providers;
pub mod sync;
pub mod vault;

// Re-exports
pub use error::{BridgeError, Result, SyncError};
