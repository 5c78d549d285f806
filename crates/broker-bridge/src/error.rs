//! Error types for broker operations.

use thiserror::Error;

/// Comprehensive error type for all broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A backend call that should have produced a resource identifier
    /// (queue URL, queue ARN, topic ARN) returned none.
    #[error("{resource} not found in {operation} response for '{name}'")]
    ResourceResolution {
        resource: &'static str,
        operation: &'static str,
        name: String,
    },

    #[error("Connection to {backend} failed: {message}")]
    ConnectionFailed {
        backend: &'static str,
        message: String,
    },

    #[error("Authentication with {backend} failed: {message}")]
    AuthenticationFailed {
        backend: &'static str,
        message: String,
    },

    #[error("Backend error ({backend}) during {operation}: {code} - {message}")]
    Backend {
        backend: &'static str,
        operation: &'static str,
        code: String,
        message: String,
        transient: bool,
    },

    #[error("Malformed {backend} response for {operation}: {message}")]
    MalformedResponse {
        backend: &'static str,
        operation: &'static str,
        message: String,
    },
}

impl BrokerError {
    /// Check if error is transient and the operation may succeed when re-issued.
    ///
    /// The bridge itself never retries; this is for callers building their
    /// own retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Configuration(_) => false,
            Self::ResourceResolution { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::Backend { transient, .. } => *transient,
            Self::MalformedResponse { .. } => false,
        }
    }

    pub(crate) fn resource_resolution(
        resource: &'static str,
        operation: &'static str,
        name: &str,
    ) -> Self {
        Self::ResourceResolution {
            resource,
            operation,
            name: name.to_string(),
        }
    }
}

/// Invalid or missing options detected when the broker is constructed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("ConnectionURI is required")]
    MissingConnectionUri,

    #[error("Region/AccessKey/SecretKey required")]
    MissingAwsCredentials,

    #[error("invalid broker kind: '{value}'")]
    InvalidBrokerKind { value: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
