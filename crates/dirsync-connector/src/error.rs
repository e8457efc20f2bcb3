//! Error taxonomy
//!
//! Shared by every operation. Directory-level failures are
//! mapped into it at the adapter boundary so callers never see native codes.

use thiserror::Error;

/// Every failure a connector operation reports.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Connector configuration is invalid or incomplete.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// The caller supplied an invalid argument, option or token.
    #[error("invalid usage: {message}")]
    InvalidUsage { message: String },

    /// The target of an update, delete or search root does not exist.
    #[error("object not found: {identifier}")]
    ObjectNotFound { identifier: String },

    /// The directory refused the operation for the bound principal.
    #[error("permission denied: {operation} on {target}")]
    PermissionDenied {
        operation: String,
        target: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid credentials provided to `authenticate`.
    #[error("authentication failed: invalid credentials for {username}")]
    AuthenticationFailed { username: String },

    /// The directory rejected or failed the operation.
    #[error("{operation} failed for {target}: {message}")]
    OperationFailed {
        operation: String,
        target: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ConnectorError {
    /// Stable code for callers that match on strings.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::InvalidUsage { .. } => "INVALID_USAGE",
            ConnectorError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            ConnectorError::PermissionDenied { .. } => "PERMISSION_DENIED",
            ConnectorError::AuthenticationFailed { .. } => "AUTH_FAILED",
            ConnectorError::OperationFailed { .. } => "OPERATION_FAILED",
        }
    }

    /// Whether this error was caused by the caller rather than the directory.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ConnectorError::InvalidConfiguration { .. } | ConnectorError::InvalidUsage { .. }
        )
    }

    // Constructors

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        ConnectorError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        ConnectorError::InvalidUsage {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(identifier: impl Into<String>) -> Self {
        ConnectorError::ObjectNotFound {
            identifier: identifier.into(),
        }
    }

    /// Create a permission denied error with source.
    pub fn permission_denied(
        operation: impl Into<String>,
        target: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::PermissionDenied {
            operation: operation.into(),
            target: target.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The directory failed `operation` on `target`.
    pub fn operation_failed(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ConnectorError::OperationFailed {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Like [`operation_failed`](Self::operation_failed), keeping the native error as source.
    pub fn operation_failed_with_source(
        operation: impl Into<String>,
        target: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::OperationFailed {
            operation: operation.into(),
            target: target.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result of a connector operation.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ConnectorError::AuthenticationFailed {
                username: "jdoe".to_string()
            }
            .error_code(),
            "AUTH_FAILED"
        );
        assert_eq!(ConnectorError::usage("bad").error_code(), "INVALID_USAGE");
        assert_eq!(
            ConnectorError::not_found("<GUID=00>").error_code(),
            "OBJECT_NOT_FOUND"
        );
        assert_eq!(
            ConnectorError::operation_failed("create", "CN=x", "boom").error_code(),
            "OPERATION_FAILED"
        );
    }

    #[test]
    fn test_caller_errors() {
        assert!(ConnectorError::usage("bad offset").is_caller_error());
        assert!(ConnectorError::configuration("missing domain").is_caller_error());
        assert!(!ConnectorError::not_found("x").is_caller_error());
        assert!(!ConnectorError::operation_failed("delete", "x", "y").is_caller_error());
    }

    #[test]
    fn test_error_display() {
        let err = ConnectorError::operation_failed("update", "CN=jdoe,DC=corp", "busy");
        assert_eq!(err.to_string(), "update failed for CN=jdoe,DC=corp: busy");

        let err = ConnectorError::usage("paged results offset must be at least 1");
        assert_eq!(
            err.to_string(),
            "invalid usage: paged results offset must be at least 1"
        );
    }

    #[test]
    fn test_error_with_source() {
        let source_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ConnectorError::permission_denied("delete", "CN=x", source_err);

        if let ConnectorError::PermissionDenied { source, target, .. } = &err {
            assert!(source.is_some());
            assert_eq!(target, "CN=x");
        } else {
            panic!("Expected PermissionDenied variant");
        }

        let err = ConnectorError::operation_failed_with_source(
            "create",
            "CN=y",
            std::io::Error::new(std::io::ErrorKind::Other, "underlying error"),
        );
        assert_eq!(err.to_string(), "create failed for CN=y: underlying error");
    }
}
