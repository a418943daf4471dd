/// System-assigned job identifier.
pub type JobId = uuid::Uuid;

/// Identifier of the workflow that owns a job.
pub type WorkflowId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
