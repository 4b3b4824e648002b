//! Gather error types

use thiserror::Error;

/// Errors that can end a scatter-gather round or a transport operation
#[derive(Debug, Error)]
pub enum GatherError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to generate reply address: {0}")]
    AddressGeneration(String),

    #[error("Failed to subscribe to {subject}: {message}")]
    Subscribe { subject: String, message: String },

    #[error("Failed to publish to {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl GatherError {
    /// Check if this error was raised before any I/O took place
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, GatherError::InvalidArgument(_))
    }

    /// Check if this error aborted the round after it started talking to the transport
    pub fn is_fatal_to_round(&self) -> bool {
        match self {
            GatherError::InvalidArgument(_) => false,
            GatherError::AddressGeneration(_) => true,
            GatherError::Subscribe { .. } => true,
            GatherError::Publish { .. } => true,
            GatherError::Transport(_) => true,
        }
    }
}

/// Result alias for gather and transport operations
pub type GatherResult<T> = Result<T, GatherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error_message() {
        let err = GatherError::Publish {
            subject: "svc.echo".to_string(),
            message: "connection closed".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("svc.echo"));
        assert!(msg.contains("connection closed"));
    }

    #[test]
    fn test_error_classification() {
        assert!(GatherError::InvalidArgument("max replies must be at least 1".to_string()).is_invalid_argument());
        assert!(!GatherError::InvalidArgument("x".to_string()).is_fatal_to_round());
        assert!(GatherError::AddressGeneration("broker gone".to_string()).is_fatal_to_round());
        assert!(GatherError::Transport("reset".to_string()).is_fatal_to_round());
    }
}
