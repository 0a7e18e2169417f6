//! Sync error taxonomy and process exit codes
//!
//! Every failure raised by the scheduler, pipeline, controller or verification
//! engine is a [`SyncError`]. Callers never match on message text; they ask
//! for the [`ErrorClass`] to decide between retrying, waiting, aborting the
//! attempt or stopping for an operator.

use geonotes_common::GeoNotesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitCode;
use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data validation failed: {0}")]
    DataValidation(String),

    #[error("Timed out waiting for turn on queue {queue} with ticket {ticket}")]
    TicketTimeout { queue: String, ticket: i64 },

    #[error("Ticket {ticket} on queue {queue} was expired before its turn")]
    TicketExpired { queue: String, ticket: i64 },

    #[error("Lock {name} is held by another holder")]
    LockHeld { name: String },

    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Remote capacity unavailable: {0}")]
    CapacityUnavailable(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] GeoNotesError),
}

/// Coarse failure class driving retry, escalation and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientIo,
    DataValidation,
    Concurrency,
    Consistency,
    Capacity,
    Permanent,
    Configuration,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::DataValidation => "data_validation",
            ErrorClass::Concurrency => "concurrency",
            ErrorClass::Consistency => "consistency",
            ErrorClass::Capacity => "capacity",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Cancelled => "cancelled",
        }
    }

    /// Whether the retry executor may attempt the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientIo | ErrorClass::DataValidation | ErrorClass::Capacity
        )
    }

    /// Classes that stop a daemon immediately instead of counting toward escalation
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorClass::Consistency | ErrorClass::Configuration)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient_io" => Ok(ErrorClass::TransientIo),
            "data_validation" => Ok(ErrorClass::DataValidation),
            "concurrency" => Ok(ErrorClass::Concurrency),
            "consistency" => Ok(ErrorClass::Consistency),
            "capacity" => Ok(ErrorClass::Capacity),
            "permanent" => Ok(ErrorClass::Permanent),
            "configuration" => Ok(ErrorClass::Configuration),
            "cancelled" => Ok(ErrorClass::Cancelled),
            other => Err(SyncError::Consistency(format!("unknown error class: {other}"))),
        }
    }
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::TransientIo(_) | SyncError::Io(_) => ErrorClass::TransientIo,
            SyncError::DataValidation(_) | SyncError::Json(_) => ErrorClass::DataValidation,
            SyncError::TicketTimeout { .. }
            | SyncError::TicketExpired { .. }
            | SyncError::LockHeld { .. } => ErrorClass::Concurrency,
            SyncError::Consistency(_) => ErrorClass::Consistency,
            SyncError::CapacityUnavailable(_) => ErrorClass::Capacity,
            SyncError::Permanent(_) | SyncError::Migration(_) => ErrorClass::Permanent,
            SyncError::Config(_) => ErrorClass::Configuration,
            SyncError::Cancelled => ErrorClass::Cancelled,
            SyncError::Exhausted { source, .. } => source.class(),
            SyncError::Database(e) => classify_sqlx(e),
            SyncError::Http(e) => classify_reqwest(e),
            SyncError::Common(e) => match e {
                GeoNotesError::Io(_) => ErrorClass::TransientIo,
                GeoNotesError::Serialization(_) | GeoNotesError::ChecksumMismatch { .. } => {
                    ErrorClass::DataValidation
                },
                GeoNotesError::Config(_) | GeoNotesError::Logging(_) => ErrorClass::Configuration,
            },
        }
    }

    /// The innermost error, looking through retry exhaustion
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Exhausted { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), SyncError::Cancelled)
    }
}

fn classify_sqlx(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => ErrorClass::TransientIo,
        // serialization_failure / deadlock_detected resolve on retry
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("40P01") => ErrorClass::TransientIo,
            _ => ErrorClass::Permanent,
        },
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => ErrorClass::DataValidation,
        sqlx::Error::PoolClosed => ErrorClass::Cancelled,
        sqlx::Error::Configuration(_) => ErrorClass::Configuration,
        _ => ErrorClass::Permanent,
    }
}

fn classify_reqwest(err: &reqwest::Error) -> ErrorClass {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_decode() {
        return ErrorClass::DataValidation;
    }
    if err.is_builder() {
        return ErrorClass::Configuration;
    }
    ErrorClass::TransientIo
}

/// A blocking task panicked or was aborted
pub fn join_error(err: tokio::task::JoinError) -> SyncError {
    if err.is_cancelled() {
        SyncError::Cancelled
    } else {
        SyncError::Permanent(format!("blocking task panicked: {err}"))
    }
}

/// Error for a non-success HTTP response, classified by status
pub fn status_error(status: reqwest::StatusCode, context: &str) -> SyncError {
    let message = format!("{context} returned {status}");
    match classify_status(status) {
        ErrorClass::TransientIo => SyncError::TransientIo(message),
        ErrorClass::Permanent => SyncError::Permanent(message),
        _ => SyncError::DataValidation(message),
    }
}

/// Map an HTTP status to a failure class: 429 and 5xx are transient, other 4xx permanent
pub fn classify_status(status: reqwest::StatusCode) -> ErrorClass {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ErrorClass::TransientIo
    } else if status.is_client_error() {
        ErrorClass::Permanent
    } else {
        ErrorClass::DataValidation
    }
}

/// Process exit codes for one-shot runs and daemon termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    NoWork,
    DataValidation,
    Permanent,
    Consistency,
    LockContention,
    TransientFailure,
    FatalConfiguration,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::NoWork => 3,
            ExitStatus::DataValidation => 65,
            ExitStatus::Permanent => 69,
            ExitStatus::Consistency => 70,
            ExitStatus::LockContention => 73,
            ExitStatus::TransientFailure => 75,
            ExitStatus::FatalConfiguration => 78,
        }
    }

    /// Exit status for a failed run
    ///
    /// Lock contention gets its own code; ticket timeouts are ordinary
    /// concurrency aborts and the caller may simply run again.
    pub fn for_error(err: &SyncError) -> Self {
        if matches!(err.root(), SyncError::LockHeld { .. }) {
            return ExitStatus::LockContention;
        }
        Self::for_class(err.class())
    }

    pub fn for_class(class: ErrorClass) -> Self {
        match class {
            ErrorClass::TransientIo
            | ErrorClass::Capacity
            | ErrorClass::Concurrency
            | ErrorClass::Cancelled => ExitStatus::TransientFailure,
            ErrorClass::DataValidation => ExitStatus::DataValidation,
            ErrorClass::Consistency => ExitStatus::Consistency,
            ErrorClass::Permanent => ExitStatus::Permanent,
            ErrorClass::Configuration => ExitStatus::FatalConfiguration,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_inherits_source_class() {
        let err = SyncError::Exhausted {
            operation: "fetch feed".into(),
            attempts: 5,
            source: Box::new(SyncError::DataValidation("bad row".into())),
        };
        assert_eq!(err.class(), ErrorClass::DataValidation);
        assert_eq!(ExitStatus::for_error(&err), ExitStatus::DataValidation);
    }

    #[test]
    fn test_lock_contention_exit_code() {
        let err = SyncError::LockHeld {
            name: "instance:default".into(),
        };
        assert_eq!(err.class(), ErrorClass::Concurrency);
        assert_eq!(ExitStatus::for_error(&err).code(), 73);

        let timeout = SyncError::TicketTimeout {
            queue: "boundaries".into(),
            ticket: 4,
        };
        assert_eq!(ExitStatus::for_error(&timeout).code(), 75);
    }

    #[test]
    fn test_http_status_classes() {
        assert_eq!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS), ErrorClass::TransientIo);
        assert_eq!(classify_status(reqwest::StatusCode::BAD_GATEWAY), ErrorClass::TransientIo);
        assert_eq!(classify_status(reqwest::StatusCode::UNAUTHORIZED), ErrorClass::Permanent);
        assert_eq!(classify_status(reqwest::StatusCode::BAD_REQUEST), ErrorClass::Permanent);
    }

    #[test]
    fn test_checksum_mismatch_is_data_validation() {
        let err: SyncError = GeoNotesError::ChecksumMismatch {
            path: "dump.csv".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::DataValidation);
    }

    #[test]
    fn test_error_class_round_trips_through_str() {
        for class in [
            ErrorClass::TransientIo,
            ErrorClass::Consistency,
            ErrorClass::Configuration,
        ] {
            assert_eq!(class.as_str().parse::<ErrorClass>().unwrap(), class);
        }
        assert!(ErrorClass::Consistency.is_fatal());
        assert!(!ErrorClass::Permanent.is_retryable());
    }
}
