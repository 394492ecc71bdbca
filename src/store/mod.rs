//! SQLite-backed persistence for the research graph, cycle history, and
//! per-workspace bookkeeping.
//!
//! Workspaces partition everything in the store: nodes, cycle outputs,
//! context documents, report metadata, usage events. One physical database
//! can host many workspaces side by side.

mod schema;
mod store;

pub use schema::{get_schema_version, initialize_schema, is_initialized, normalize_legacy_kind, SCHEMA_VERSION};
pub use store::Store;
