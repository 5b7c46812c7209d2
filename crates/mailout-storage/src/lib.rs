//! Mailout Storage - Persistence for campaigns, accounts and recipients
//!
//! The scheduler talks to a `MailoutStore`. Two implementations ship:
//! `PgMailoutStore` for PostgreSQL and `MemoryStore` for tests and
//! single-process development runs.

pub mod db;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::{MailoutStore, MemoryStore, PgMailoutStore};
