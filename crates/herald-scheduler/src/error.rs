use thiserror::Error;

/// Cron parsing and evaluation failures. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("malformed cron expression {expression:?}: {reason}")]
    MalformedExpression { expression: String, reason: String },

    #[error("unknown time zone: {0}")]
    UnknownTimezone(String),

    /// No matching minute within the search horizon (e.g. `0 0 31 2 *`).
    #[error("cron expression {0:?} has no run time within the search horizon")]
    NoMatch(String),
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("scheduler is already running")]
    AlreadyRunning,

    /// The schedule has an execution in progress.
    #[error("schedule {id} is already executing")]
    AlreadyExecuting { id: String },

    /// The schedule definition cannot be executed as stored.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error(transparent)]
    Cron(#[from] CronError),

    /// Content resolution failed (mandatory section, unsupported type).
    #[error("Content error: {0}")]
    Content(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Delivery error: {0}")]
    Delivery(#[from] herald_channels::DeliveryError),

    #[error("execution timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("execution cancelled")]
    Cancelled,
}

impl SchedulerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::AlreadyExecuting { .. } => "ALREADY_EXECUTING",
            Self::InvalidSchedule(_) => "INVALID_SCHEDULE",
            Self::Cron(_) => "CRON_ERROR",
            Self::Content(_) => "CONTENT_ERROR",
            Self::Render(_) => "RENDER_ERROR",
            Self::Delivery(_) => "DELIVERY_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
