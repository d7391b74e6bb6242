//! Error types for DeviceFarm

use crate::types::DeviceOs;
use thiserror::Error;

/// Result type alias using DeviceFarm Error
pub type Result<T> = std::result::Result<T, Error>;

/// DeviceFarm error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to reserve any device for {os} mobile os as availability is 0")]
    NoAvailableDevice { os: DeviceOs },

    #[error("Device discovery failed: {0}")]
    Discovery(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Selected {section}-{key} section-key pair is invalid/doesn't exist")]
    ConfigKeyNotFound { section: String, key: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown {kind}: {value}")]
    UnknownValue { kind: &'static str, value: String },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Task queue error: {0}")]
    TaskQueue(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the task queue should re-attempt the failed unit of work.
    ///
    /// Only discovery failures qualify. An exhausted pool would most likely
    /// still be exhausted on retry, and storage errors are surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Discovery(_))
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match e {
            Error::NoAvailableDevice { .. } => tonic::Status::resource_exhausted(e.to_string()),
            Error::NotFound { kind, id } => {
                tonic::Status::not_found(format!("{} {} not found", kind, id))
            }
            Error::UnknownValue { .. } | Error::InvalidConfig(_) => {
                tonic::Status::invalid_argument(e.to_string())
            }
            Error::Discovery(msg) => tonic::Status::unavailable(msg),
            Error::Unsupported(msg) => tonic::Status::unimplemented(msg),
            Error::Timeout { seconds } => {
                tonic::Status::deadline_exceeded(format!("Operation timed out after {}s", seconds))
            }
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_names_os() {
        let err = Error::NoAvailableDevice { os: DeviceOs::Ios };
        assert!(err.to_string().contains("ios"));
        assert!(!err.is_retryable());

        let status = tonic::Status::from(err);
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
    }

    #[test]
    fn test_only_discovery_is_retryable() {
        assert!(Error::Discovery("adb gone".into()).is_retryable());
        assert!(!Error::Timeout { seconds: 10 }.is_retryable());
        assert!(!Error::Internal("boom".into()).is_retryable());
    }
}
