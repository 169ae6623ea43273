//! Error taxonomy for remote synchronization
//!
//! Every failure that crosses a component boundary is one of six tagged kinds:
//! - Validation: the request itself is wrong
//! - Network: transport failure, timeout or open circuit
//! - RateLimit: the dependency asked us to slow down
//! - Authentication: credentials rejected
//! - ExternalService: a third-party dependency failed
//! - Database: the remote store rejected or failed a mutation
//!
//! Callers decide retry-ability from the variant and its fields, never from
//! the message text.

use std::time::Duration;

/// Synchronization failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Request rejected as invalid
    #[error("validation failed: {message}")]
    Validation {
        /// Human-readable reason
        message: String,
        /// Offending field, when known
        field: Option<String>,
    },

    /// Transport-level failure
    #[error("network error: {message}")]
    Network {
        /// Human-readable reason
        message: String,
        /// HTTP-like status code, when one was received
        status: Option<u16>,
        /// Target of the failed call
        url: Option<String>,
    },

    /// Dependency is throttling us
    #[error("rate limited: {message}")]
    RateLimit {
        /// Human-readable reason
        message: String,
        /// Server-provided delay before the next attempt
        retry_after: Option<Duration>,
    },

    /// Credentials missing or rejected
    #[error("authentication failed: {message}")]
    Authentication {
        /// Human-readable reason
        message: String,
    },

    /// Third-party dependency failed
    #[error("{service} failed: {message}")]
    ExternalService {
        /// Name of the failing service
        service: String,
        /// Human-readable reason
        message: String,
        /// Status code reported by the service
        status: Option<u16>,
    },

    /// Remote store failure
    #[error("database error: {message}")]
    Database {
        /// Human-readable reason
        message: String,
        /// Mutation that failed (`create`, `update`, ...)
        operation: Option<String>,
    },
}

/// Fieldless discriminant of [`SyncError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`SyncError::Validation`]
    Validation,
    /// See [`SyncError::Network`]
    Network,
    /// See [`SyncError::RateLimit`]
    RateLimit,
    /// See [`SyncError::Authentication`]
    Authentication,
    /// See [`SyncError::ExternalService`]
    ExternalService,
    /// See [`SyncError::Database`]
    Database,
}

impl ErrorKind {
    /// Stable lowercase name, used as a log field
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::ExternalService => "external_service",
            Self::Database => "database",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncError {
    /// Create validation error
    #[inline]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create network error
    #[inline]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            status: None,
            url: None,
        }
    }

    /// Create rate limit error
    #[inline]
    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Create authentication error
    #[inline]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create external service error
    #[inline]
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Create database error
    #[inline]
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: None,
        }
    }

    /// Attach the offending field to a validation error
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>) -> Self {
        if let Self::Validation { field, .. } = &mut self {
            *field = Some(name.into());
        }
        self
    }

    /// Attach a status code to a network or external service error
    #[must_use]
    pub fn with_status(mut self, code: u16) -> Self {
        match &mut self {
            Self::Network { status, .. } | Self::ExternalService { status, .. } => {
                *status = Some(code);
            }
            _ => {}
        }
        self
    }

    /// Attach the target URL to a network error
    #[must_use]
    pub fn with_url(mut self, target: impl Into<String>) -> Self {
        if let Self::Network { url, .. } = &mut self {
            *url = Some(target.into());
        }
        self
    }

    /// Attach the failing mutation name to a database error
    #[must_use]
    pub fn with_operation(mut self, name: impl Into<String>) -> Self {
        if let Self::Database { operation, .. } = &mut self {
            *operation = Some(name.into());
        }
        self
    }

    /// Re-tag any failure as a database failure of `operation`
    ///
    /// Database errors keep their message and only gain an operation name if
    /// they lack one.
    #[must_use]
    pub fn into_database(self, operation: &str) -> Self {
        match self {
            Self::Database {
                message,
                operation: None,
            } => Self::Database {
                message,
                operation: Some(operation.to_string()),
            },
            db @ Self::Database { .. } => db,
            other => Self::Database {
                message: other.to_string(),
                operation: Some(operation.to_string()),
            },
        }
    }

    /// Get the variant discriminant
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Network { .. } => ErrorKind::Network,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::ExternalService { .. } => ErrorKind::ExternalService,
            Self::Database { .. } => ErrorKind::Database,
        }
    }

    /// Check if error is transient and may succeed on a later attempt
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::ExternalService { .. }
                | Self::Database { .. }
                | Self::RateLimit { .. }
        )
    }

    /// Check if error means the request is wrong rather than the transport
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::Authentication { .. })
    }

    /// Server-requested delay, if any
    #[inline]
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Human-readable message without the kind prefix
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Validation { message, .. }
            | Self::Network { message, .. }
            | Self::RateLimit { message, .. }
            | Self::Authentication { message }
            | Self::ExternalService { message, .. }
            | Self::Database { message, .. } => message,
        }
    }
}
