//! Persistence interface consumed by the pipeline.

use crate::types::{
    AttendanceLogEntry, AttendanceRecord, AttendanceStatus, EnrolledFace, Identity, IdentitySummary,
};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result of the conditional attendance insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record for the same identity and day already existed; nothing was written.
    AlreadyRecorded(AttendanceStatus),
}

/// Narrow store interface. Implementations must be safe to share across requests.
pub trait AttendanceStore: Send + Sync {
    /// Identities that have a face embedding.
    fn list_enrolled_embeddings(&self) -> Result<Vec<EnrolledFace>, StoreError>;

    fn find_attendance(
        &self,
        identity_id: &str,
        day: NaiveDate,
    ) -> Result<Option<AttendanceStatus>, StoreError>;

    /// Insert unless a record for `(identity_id, day)` already exists.
    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError>;

    /// Create or overwrite an identity. Either fully applied or not at all.
    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    /// All identities, newest first.
    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError>;

    /// Latest check-ins joined with identity details, newest first.
    fn recent_attendance(&self, limit: usize) -> Result<Vec<AttendanceLogEntry>, StoreError>;
}
