//! # parley-store
//!
//! Durable storage for Parley users and direct messages, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every record the
//! chat server reads or writes. Callers on an async runtime are expected to
//! move calls onto a blocking thread.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
