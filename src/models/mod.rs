//! Core data models for the bucket gateway.
//!
//! `Bucket` and `Object` map to SQLite rows via `sqlx::FromRow`; `event`
//! holds the transient notification records streamed to watchers.

pub mod bucket;
pub mod event;
pub mod object;
