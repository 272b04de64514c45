//! Frontdesk shared infrastructure
//!
//! Database pool construction and the embedded migrations runner, used by both
//! the API server and the background worker.

mod db;

pub use db::{create_migration_pool, create_pool, run_migrations};
