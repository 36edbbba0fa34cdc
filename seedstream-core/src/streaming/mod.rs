//! Piece scheduling and ordered delivery of a swarm file to a playback sink.
//!
//! Pieces arrive out of order and at unpredictable rates while playback needs a
//! strictly ordered byte stream. The pipeline reconciles the two:
//!
//! - [`StreamOffset`] maps the target file onto piece indices and trims.
//! - [`PieceScheduler`] keeps a fixed-size High priority window ahead of the
//!   playback cursor.
//! - [`WorkerPool`] runs one fetch worker per window slot; workers rendezvous on
//!   a [`RendezvousBarrier`] after every round.
//! - [`PieceReader`] and [`PieceCache`] turn the engine's unordered read alerts
//!   into ordered piece buffers.
//! - [`StreamAssembler`] writes the trimmed pieces to the sink in order.
//! - [`PlaybackLauncher`] opens the sink once, when the first window is ready.
//! - [`StreamSession`] wires everything together and guarantees cleanup.

pub mod assembler;
pub mod cleanup;
pub mod completion;
pub mod offset;
pub mod piece_cache;
pub mod piece_reader;
pub mod playback;
pub mod rendezvous;
pub mod scheduler;
pub mod session;
pub mod worker_pool;

use std::time::Duration;

pub use assembler::{AssemblyReport, StreamAssembler};
pub use cleanup::TransferGuard;
pub use offset::{STREAM_BUFFER_BUDGET, StreamOffset};
pub use piece_cache::PieceCache;
pub use piece_reader::PieceReader;
pub use playback::{
    FileTarget, PendingSink, PlaybackLauncher, PlaybackSink, PlaybackTarget, PlayerProcess,
};
pub use rendezvous::{LaunchGate, RendezvousBarrier};
pub use scheduler::PieceScheduler;
pub use session::{FileSelection, SessionReport, StreamSession};
pub use worker_pool::{WorkerPool, WorkerReport, owned_indices};

use crate::swarm::{PieceIndex, SwarmError};

/// Errors raised while scheduling, fetching or delivering a stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Invalid transfer metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Transfer metadata unavailable after {waited:?}")]
    MetadataUnavailable { waited: Duration },

    #[error("Piece {index} unavailable: {reason}")]
    PieceUnavailable { index: PieceIndex, reason: String },

    #[error("Piece {index} is outside the stream range {start}..={end}")]
    PieceOutOfRange {
        index: PieceIndex,
        start: PieceIndex,
        end: PieceIndex,
    },

    #[error("Piece {actual} consumed while piece {expected} was due")]
    OutOfOrderConsumption {
        expected: PieceIndex,
        actual: PieceIndex,
    },

    #[error("Playback sink rejected piece {index}")]
    SinkWriteFailure {
        index: PieceIndex,
        #[source]
        source: std::io::Error,
    },

    #[error("Playback could not be launched: {reason}")]
    PlaybackLaunchFailed { reason: String },

    #[error("Resource cleanup failed: {reason}")]
    ResourceCleanupFailure { reason: String },

    #[error("Fetch worker {worker_id} stopped unexpectedly: {reason}")]
    WorkerPanicked { worker_id: usize, reason: String },

    #[error("Swarm engine error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for streaming results.
pub type StreamingResult<T> = Result<T, StreamingError>;
