//! Error types for Beacon
//!
//! One enum covers the whole taxonomy: configuration errors are fatal at
//! construction, connection errors are fatal to the failing operation,
//! session expiry and node-level races are expected operational conditions
//! recovered locally by the discovery layer.

/// Discovery-specific error types
#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("session expired")]
    SessionExpired,

    #[error("node not found: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DiscoveryError {
    /// Whether this error means the addressed node does not exist.
    pub fn is_no_node(&self) -> bool {
        matches!(self, DiscoveryError::NoNode(_))
    }

    /// Whether this error is an expected operational condition that the
    /// discovery layer recovers from locally (re-campaign, re-read, resync).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::SessionExpired | DiscoveryError::NoNode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DiscoveryError::IllegalArgument("ACL list must not be empty".to_string());
        assert_eq!(
            format!("{}", err),
            "illegal argument: ACL list must not be empty"
        );

        let err = DiscoveryError::NoNode("/discovery/path/member-0000000001".to_string());
        assert_eq!(
            format!("{}", err),
            "node not found: /discovery/path/member-0000000001"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(DiscoveryError::SessionExpired.is_recoverable());
        assert!(DiscoveryError::NoNode("/a".to_string()).is_recoverable());
        assert!(!DiscoveryError::Connection("refused".to_string()).is_recoverable());
        assert!(!DiscoveryError::Config("no members".to_string()).is_recoverable());
    }
}
