use crate::error::Result;
use crate::types::{FieldUpdate, JobRecord, Millis};

/// Durable key/value + time-ordered store that mirrors the in-memory job index.
///
/// Records are flat scalars; nested values travel as JSON text. The store
/// calls these synchronously while holding its own lock, so a mutation and
/// its mirror write form one logical step.
pub trait JobMirror: Send + Sync {
    /// Insert or overwrite the record keyed by `record.id`.
    fn put(&self, record: &JobRecord) -> Result<()>;

    /// Every readable record. Unreadable rows are skipped and logged.
    fn get_all(&self) -> Result<Vec<JobRecord>>;

    /// Pending records with `schedule_time <= upto`, earliest first.
    fn get_due(&self, upto: Millis) -> Result<Vec<JobRecord>>;

    /// Apply a partial update. Fails if the record is not mirrored.
    fn update_fields(&self, id: &str, fields: &FieldUpdate) -> Result<()>;

    /// Delete a record. Deleting an absent record is not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// Release the underlying connection. Later calls fail with `Persistence`.
    fn close(&self) -> Result<()>;
}
