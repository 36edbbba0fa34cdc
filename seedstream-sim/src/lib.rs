//! Seedstream Simulation - Deterministic swarm engine for exercising stream sessions.

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! This crate provides an in-memory implementation of the Seedstream engine
//! port. Content is generated from a seed, pieces complete on a timer in
//! priority order and read alerts can be delayed or padded with unrequested
//! reads, so the streaming pipeline can be driven end to end without a real
//! swarm.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use seedstream_core::SeedstreamConfig;
//! use seedstream_core::testing::MemoryTarget;
//! use seedstream_core::streaming::StreamSession;
//! use seedstream_sim::{SimulatedContent, SimulatedSwarm, SwarmProfile};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let swarm = Arc::new(SimulatedSwarm::new(SwarmProfile::default()));
//! let content = SimulatedContent::single_file("movie.mkv", 4 << 20, 256 << 10, 42)?;
//! let descriptor = swarm.register(content)?;
//!
//! let session = StreamSession::new(swarm, SeedstreamConfig::for_testing());
//! let report = session.stream(&descriptor, Arc::new(MemoryTarget::new())).await?;
//! println!("streamed {} bytes", report.bytes_written);
//! # Ok(())
//! # }
//! ```

pub mod content;
pub mod profile;
pub mod swarm;

pub use content::SimulatedContent;
pub use profile::SwarmProfile;
pub use swarm::{SimulatedSwarm, SimulatedTransfer};

use seedstream_core::SwarmError;

/// Errors raised while preparing simulated content.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// Content layout cannot be served
    #[error("Invalid simulated content: {reason}")]
    InvalidContent {
        /// Why the content was rejected
        reason: String,
    },

    /// Descriptor handling failed in the core crate
    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),
}

/// Result alias for simulation setup.
pub type Result<T> = std::result::Result<T, SimulationError>;
