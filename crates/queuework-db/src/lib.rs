//! Queuework data access layer
//!
//! Repository traits for upload sessions, documents, archive jobs, job locks and
//! background tasks, each with a PostgreSQL implementation and an in-memory one.

pub mod db;

pub use db::*;

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
