use thiserror::Error;

/// Errors surfaced by the control plane library
#[derive(Error, Debug)]
pub enum ControlError {
    /// Generic panel API error with status and raw body
    #[error("API error ({status}): {message}")]
    Api {
        message: String,
        status: u16,
        body: String,
    },

    /// Authentication failed or token could not be refreshed (401)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Access denied by the panel (403)
    #[error("Access forbidden: {0}")]
    Authorization(String),

    /// Resource missing on the panel (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request rejected by panel validation (409/422)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Transport-level failure (refused, TLS, timeout)
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Circuit breaker rejected the call without attempting it
    #[error("Circuit breaker is open for service '{0}'")]
    BreakerOpen(String),

    /// Configuration error (missing credentials, bad URL, unknown service)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Node-domain error
    #[error("Node error: {0}")]
    Node(String),

    /// Node missing from the fleet
    #[error("Node {0} not found")]
    NodeNotFound(i64),

    /// Duplicate name or address within the fleet
    #[error("Node already exists: {0}")]
    NodeAlreadyExists(String),

    /// Node reachable but connection handshake failed
    #[error("Node connection failed: {0}")]
    NodeConnection(String),

    /// Local storage (cache/offline DB) failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encryption or decryption failure in the secrets vault
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using ControlError
pub type Result<T> = std::result::Result<T, ControlError>;

impl ControlError {
    /// HTTP status code carried by API-boundary errors, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ControlError::Api { status, .. } => Some(*status),
            ControlError::Authentication(_) => Some(401),
            ControlError::Authorization(_) => Some(403),
            ControlError::NotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Whether the error is transport-class and worth queueing offline
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ControlError::Connection(_) | ControlError::BreakerOpen(_)
        )
    }
}

impl From<String> for ControlError {
    fn from(s: String) -> Self {
        ControlError::Other(s)
    }
}

impl From<&str> for ControlError {
    fn from(s: &str) -> Self {
        ControlError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for ControlError {
    fn from(err: rusqlite::Error) -> Self {
        ControlError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(err: reqwest::Error) -> Self {
        ControlError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ControlError::Configuration("missing panel credentials".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: missing panel credentials"
        );
    }

    #[test]
    fn test_error_from_string() {
        let err: ControlError = "test error".into();
        assert!(matches!(err, ControlError::Other(_)));
    }

    #[test]
    fn test_status_codes() {
        let err = ControlError::Api {
            message: "boom".into(),
            status: 500,
            body: "{}".into(),
        };
        assert_eq!(err.status_code(), Some(500));
        assert_eq!(
            ControlError::Authentication("expired".into()).status_code(),
            Some(401)
        );
        assert_eq!(ControlError::NodeNotFound(7).status_code(), None);
    }

    #[test]
    fn test_connection_class() {
        assert!(ControlError::Connection("refused".into()).is_connection_error());
        assert!(ControlError::BreakerOpen("marzban".into()).is_connection_error());
        assert!(!ControlError::Validation("bad".into()).is_connection_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ControlError = io_err.into();
        assert!(matches!(err, ControlError::Io(_)));
    }
}
