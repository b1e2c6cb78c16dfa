//! Core domain types
//!
//! - **ids**: type-safe tenant and bug identifiers
//! - **provider**: the three supported provider types
//! - **bug**: internal status/severity vocabulary and bug snapshots

mod bug;
mod ids;
mod provider;

pub use bug::{BugSnapshot, BugUpdate, Severity, Status};
pub use ids::{BugId, TenantId};
pub use provider::ProviderType;
