/// Identifier of a job group. Time-ordered (UUID v7).
pub type GroupId = uuid::Uuid;

/// Identifier of a single child job within a group. Time-ordered (UUID v7).
pub type JobId = uuid::Uuid;

/// Backend identifiers are assigned by the backend registry.
pub type BackendId = String;

/// Seeds are non-negative 64-bit integers bounded by [`crate::seeds::MAX_SEED`].
pub type Seed = u64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a new globally unique, time-ordered identifier.
pub fn new_id() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}
