// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stepwatch-core.
//!
//! Not-found lookups are not errors: queries return `None` or an empty list.

/// Result type using TrackerError
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors surfaced by mutations and queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TrackerError {
    /// Input validation failed. No write was attempted.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A step update addressed a step id that does not exist.
    #[error("Step '{step_id}' not found")]
    StepNotFound {
        /// The step id that was not found.
        step_id: i64,
    },

    /// A partition's hub kept being torn down while an observer subscribed.
    #[error("Broadcast hub for '{partition}' is unavailable")]
    HubUnavailable {
        /// The partition that could not be subscribed to.
        partition: String,
    },

    /// The observer disconnected before it could be registered.
    #[error("Observer closed before registration")]
    ObserverClosed,
}

impl TrackerError {
    /// Shorthand for a [`TrackerError::ValidationError`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`TrackerError::DatabaseError`].
    pub fn database(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::DatabaseError {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::StepNotFound { .. } => "STEP_NOT_FOUND",
            Self::HubUnavailable { .. } => "HUB_UNAVAILABLE",
            Self::ObserverClosed => "OBSERVER_CLOSED",
        }
    }

    /// True for errors caused by the caller's input rather than the store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::ValidationError { .. } | Self::StepNotFound { .. }
        )
    }
}

impl From<sqlx::Error> for TrackerError {
    fn from(err: sqlx::Error) -> Self {
        TrackerError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::ValidationError {
            field: "payload".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                TrackerError::validation("ref_id", "ref_id or ref_type is required"),
                "VALIDATION_ERROR",
            ),
            (
                TrackerError::database("insert", "connection refused"),
                "DATABASE_ERROR",
            ),
            (TrackerError::StepNotFound { step_id: 7 }, "STEP_NOT_FOUND"),
            (
                TrackerError::HubUnavailable {
                    partition: "orders".into(),
                },
                "HUB_UNAVAILABLE",
            ),
            (TrackerError::ObserverClosed, "OBSERVER_CLOSED"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_error_display() {
        let err = TrackerError::validation("run_id", "is required");
        assert_eq!(err.to_string(), "Validation error for 'run_id': is required");

        let err = TrackerError::database("upsert_run", "disk I/O error");
        assert_eq!(
            err.to_string(),
            "Database error during 'upsert_run': disk I/O error"
        );

        let err = TrackerError::StepNotFound { step_id: 42 };
        assert_eq!(err.to_string(), "Step '42' not found");
    }

    #[test]
    fn test_client_error_classification() {
        assert!(TrackerError::validation("x", "y").is_client_error());
        assert!(TrackerError::StepNotFound { step_id: 1 }.is_client_error());
        assert!(!TrackerError::database("x", "y").is_client_error());
        assert!(
            !TrackerError::HubUnavailable {
                partition: "orders".into()
            }
            .is_client_error()
        );
    }

    #[test]
    fn test_malformed_json_is_validation_error() {
        let err: TrackerError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
