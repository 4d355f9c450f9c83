//! The single bucket served by a running gateway instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket row.
///
/// Exactly one bucket is in scope per process; it is checked (and created when
/// missing) during startup and never addressed by clients directly.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Internal UUID used as the foreign key for objects.
    pub id: Uuid,

    /// Bucket name, echoed back in upload and delete confirmations.
    pub name: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
