// Error handling framework
//
// Lock contention and transient storage failures are retryable; misuse
// (duplicate keys, missing operands, illegal context state) is not.

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),
}

/// Storage transport errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Cluster lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Every UPDATE attempt and the INSERT fallback failed.
    #[error("Failure obtaining row lock '{lock_name}' after {attempts} attempts: {reason}")]
    Exhausted {
        lock_name: String,
        attempts: u32,
        reason: String,
    },
}

/// Errors raised by job store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Object already exists: {0}")]
    ObjectAlreadyExists(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl StoreError {
    /// Whether the whole operation can be retried after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Lock(_) => true,
            StoreError::Database(db) => matches!(
                db,
                DatabaseError::ConnectionFailed(_)
                    | DatabaseError::QueryFailed(_)
                    | DatabaseError::TransactionFailed(_)
                    | DatabaseError::DuplicateKey(_)
            ),
            _ => false,
        }
    }
}

/// Matcher construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatcherError {
    #[error("Two non-null operands required")]
    MissingOperand,
}

/// Execution context misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Not a recovering job")]
    NotRecovering,

    #[error("Recovery data missing from merged data map: {0}")]
    MissingRecoveryData(String),
}

/// Errors surfaced by the scheduler facade
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No job registered for type: {0}")]
    JobNotRegistered(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Listener failed: {0}")]
    ListenerFailed(String),

    #[error("Scheduler has been shut down")]
    Shutdown,
}

/// Management bridge parameter decoding and invocation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagementError {
    #[error("Invalid parameter definition: required parts missing {0}")]
    InvalidParamDef(String),

    #[error("Unknown parameter type tag: '{0}'")]
    UnknownTypeTag(char),

    #[error("Invalid value '{value}' for type tag '{tag}': {reason}")]
    InvalidValue {
        tag: char,
        value: String,
        reason: String,
    },

    #[error("Required parameters missing: {0}")]
    MissingParameter(String),

    #[error("Invocation failed: {0}")]
    InvocationFailed(String),
}

impl ManagementError {
    /// Short classification used when wrapping into a job failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ManagementError::InvalidParamDef(_) => "InvalidParamDef",
            ManagementError::UnknownTypeTag(_) => "UnknownTypeTag",
            ManagementError::InvalidValue { .. } => "InvalidValue",
            ManagementError::MissingParameter(_) => "MissingParameter",
            ManagementError::InvocationFailed(_) => "InvocationFailed",
        }
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionFailed(err.to_string())
            }
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        "23503" => DatabaseError::ForeignKeyViolation(db_err.message().to_string()),
                        "40001" | "40P01" => {
                            DatabaseError::TransactionFailed(db_err.message().to_string())
                        }
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_lock_errors_are_retryable() {
        let err: StoreError = LockError::Exhausted {
            lock_name: "TRIGGER_ACCESS".to_string(),
            attempts: 2,
            reason: "deadlock detected".to_string(),
        }
        .into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("TRIGGER_ACCESS"));
    }

    #[test]
    fn test_misuse_is_not_retryable() {
        assert!(!StoreError::ObjectAlreadyExists("DEFAULT.job".to_string()).is_retryable());
        assert!(!StoreError::JobNotFound("DEFAULT.job".to_string()).is_retryable());
        assert!(!StoreError::Database(DatabaseError::ForeignKeyViolation("fk".to_string()))
            .is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: DatabaseError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[test]
    fn test_matcher_error_message() {
        assert_eq!(
            MatcherError::MissingOperand.to_string(),
            "Two non-null operands required"
        );
    }
}
