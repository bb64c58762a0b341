//! Database module: row mapping and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: decoding of rows into domain types, aggregate view models.
//! - `repo`: SQL-only functions for attachments, sweep state and the
//!   reconciliation cache.
//!
//! External modules import from `cloud_offload::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::AttachmentCounts;
