//! Seedstream Core - Streaming media out of a swarm while it downloads
//!
//! This crate provides the piece scheduling and buffered delivery pipeline:
//! the swarm engine boundary, the sliding priority window, parallel fetch
//! workers with a rendezvous barrier, ordered assembly into a playback sink
//! and configuration management.

pub mod config;
pub mod streaming;
pub mod swarm;
pub mod tracing_setup;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types for convenient access
pub use config::SeedstreamConfig;
pub use streaming::{SessionReport, StreamSession, StreamingError};
pub use swarm::{SwarmEngine, SwarmError, SwarmHandle, TransferDescriptor};

/// Core errors that can bubble up from any Seedstream subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SeedstreamError {
    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeedstreamError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SeedstreamError::Swarm(SwarmError::InvalidDescriptor { reason }) => {
                format!("Invalid magnet link: {reason}")
            }
            SeedstreamError::Swarm(_) => "Swarm engine error occurred".to_string(),
            SeedstreamError::Streaming(e) => match e {
                StreamingError::MetadataUnavailable { .. } => {
                    "Could not fetch transfer metadata from the swarm".to_string()
                }
                StreamingError::PlaybackLaunchFailed { reason } => {
                    format!("Could not start playback: {reason}")
                }
                StreamingError::SinkWriteFailure { .. } => "Playback was interrupted".to_string(),
                _ => "Streaming error occurred".to_string(),
            },
            SeedstreamError::Configuration { reason } => format!("Configuration error: {reason}"),
            SeedstreamError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SeedstreamError::Configuration { .. }
                | SeedstreamError::Swarm(SwarmError::InvalidDescriptor { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, SeedstreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_descriptor_is_user_error() {
        let error = SeedstreamError::from(SwarmError::InvalidDescriptor {
            reason: "missing btih".to_string(),
        });
        assert!(error.is_user_error());
        assert!(error.user_message().contains("missing btih"));
    }

    #[test]
    fn test_streaming_errors_are_not_user_errors() {
        let error = SeedstreamError::from(StreamingError::PlaybackLaunchFailed {
            reason: "vlc not found".to_string(),
        });
        assert!(!error.is_user_error());
        assert_eq!(error.user_message(), "Could not start playback: vlc not found");
    }
}
