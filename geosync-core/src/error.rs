//! Error types for GEOSYNC operations

use thiserror::Error;

/// Payload validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Expected a JSON object at {path}")]
    NotAnObject { path: String },

    #[error("Required field missing: {path}")]
    MissingField { path: String },

    #[error("Invalid value at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: String,
    },

    #[error("Malformed feature collection: {reason}")]
    Malformed { reason: String },
}

/// Network retrieval errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("HTTP {status}: {status_text}")]
    Http { status: u16, status_text: String },

    /// The request could not be built, e.g. a malformed header.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Invalid payload: {0}")]
    Validation(#[from] ValidationError),

    #[error("Max retries exceeded after {attempts} attempts: {last}")]
    MaxRetriesExceeded { attempts: u32, last: Box<FetchError> },

    #[error("Request aborted")]
    Aborted,
}

impl FetchError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn http(status: u16, status_text: impl Into<String>) -> Self {
        Self::Http {
            status,
            status_text: status_text.into(),
        }
    }

    /// Whether another attempt could succeed.
    ///
    /// Transport failures, timeouts, 5xx and 429 are transient. Every other
    /// HTTP status, malformed requests, invalid payloads and aborts are
    /// terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
            Self::InvalidRequest { .. }
            | Self::Validation(_)
            | Self::MaxRetriesExceeded { .. }
            | Self::Aborted => false,
        }
    }

    /// HTTP status carried by this error, looking through retry exhaustion.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::MaxRetriesExceeded { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// Merge configuration errors. Raised before any work is done.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("Merge strategy 'merge' requires an updateKey")]
    MissingUpdateKey,

    #[error("Unknown merge strategy: {0}")]
    UnknownStrategy(String),
}

/// Streaming connection errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection already exists")]
    AlreadyExists,

    #[error("Connection is not open")]
    NotConnected,

    #[error("Invalid stream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to open connection: {reason}")]
    Handshake { reason: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Failed to serialize outbound message: {reason}")]
    Serialize { reason: String },

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Poller scheduling errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollerError {
    #[error("Poller is already running")]
    AlreadyRunning,

    #[error("Poll interval must be greater than zero")]
    ZeroInterval,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Master error type for all GEOSYNC errors.
#[derive(Debug, Error)]
pub enum GeosyncError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type alias for GEOSYNC operations.
pub type GeosyncResult<T> = Result<T, GeosyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(FetchError::http(500, "Internal Server Error").is_retryable());
        assert!(FetchError::http(503, "Service Unavailable").is_retryable());
        assert!(FetchError::http(429, "Too Many Requests").is_retryable());
        assert!(!FetchError::http(404, "Not Found").is_retryable());
        assert!(!FetchError::http(400, "Bad Request").is_retryable());
        assert!(!FetchError::http(304, "Not Modified").is_retryable());
    }

    #[test]
    fn test_transport_failures_are_retryable() {
        assert!(FetchError::network("connection reset").is_retryable());
        assert!(FetchError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!FetchError::Aborted.is_retryable());
        assert!(!FetchError::InvalidRequest {
            reason: "bad header".to_string()
        }
        .is_retryable());
        assert!(!FetchError::Validation(ValidationError::Malformed {
            reason: "x".to_string()
        })
        .is_retryable());
    }

    #[test]
    fn test_exhausted_error_exposes_last_status() {
        let err = FetchError::MaxRetriesExceeded {
            attempts: 4,
            last: Box::new(FetchError::http(502, "Bad Gateway")),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(502));
        assert_eq!(
            err.to_string(),
            "Max retries exceeded after 4 attempts: HTTP 502: Bad Gateway"
        );
    }

    #[test]
    fn test_unknown_strategy_message() {
        assert_eq!(
            MergeError::UnknownStrategy("zip".to_string()).to_string(),
            "Unknown merge strategy: zip"
        );
    }
}
