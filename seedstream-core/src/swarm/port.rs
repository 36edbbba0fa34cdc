//! Traits the streaming core consumes from the swarm engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{
    InfoHash, PieceIndex, PiecePriority, SwarmAlert, SwarmError, SwarmEvent, TorrentInfo,
    TransferDescriptor,
};

/// Per-piece operations the scheduler, workers and assembler rely on.
///
/// Piece completion is owned by the engine; implementations must only flip a
/// piece to complete once its bytes are readable. All methods are cheap,
/// non-blocking queries or fire-and-forget requests. Waiting is done by
/// subscribing to [`SwarmEvent`]s and re-querying.
pub trait PieceFetchPort: Send + Sync {
    /// Total pieces in the transfer. Zero means the engine has nothing to offer.
    fn piece_count(&self) -> u32;

    /// Sets the fetch priority of one piece.
    fn set_piece_priority(&self, index: PieceIndex, priority: PiecePriority);

    /// Current priority of one piece. Unknown indices report `Skip`.
    fn piece_priority(&self, index: PieceIndex) -> PiecePriority;

    /// Snapshot of every piece priority, indexed by piece.
    fn piece_priorities(&self) -> Vec<PiecePriority>;

    /// Whether the piece is locally complete.
    fn have_piece(&self, index: PieceIndex) -> bool;

    /// Asks the engine to read a piece. The result arrives as a [`SwarmAlert`].
    fn request_read(&self, index: PieceIndex);

    /// Drains every pending read alert.
    fn pop_alerts(&self) -> Vec<SwarmAlert>;

    /// Subscribes to state change notifications.
    ///
    /// The channel closes when the engine drops the transfer.
    fn subscribe(&self) -> broadcast::Receiver<SwarmEvent>;
}

/// A single transfer inside the engine.
#[async_trait]
pub trait SwarmHandle: PieceFetchPort {
    /// Info hash of the transfer.
    fn info_hash(&self) -> InfoHash;

    /// Whether the metadata handshake has completed.
    fn has_metadata(&self) -> bool;

    /// Transfer metadata, `None` until [`SwarmHandle::has_metadata`] is true.
    fn torrent_info(&self) -> Option<TorrentInfo>;

    /// Toggles the engine's in-order download mode.
    fn set_sequential_download(&self, enabled: bool);

    /// Directory the engine materializes the transfer into.
    fn save_path(&self) -> PathBuf;

    /// Detaches the transfer from the engine.
    ///
    /// # Errors
    ///
    /// - `SwarmError::TransferRemoved` - Already removed
    /// - `SwarmError::Engine` - Engine refused the removal
    async fn remove(&self) -> Result<(), SwarmError>;
}

/// Entry point of the swarm engine.
#[async_trait]
pub trait SwarmEngine: Send + Sync {
    /// Starts a transfer for the descriptor, saving into `save_path`.
    ///
    /// # Errors
    ///
    /// - `SwarmError::UnknownTransfer` - Engine cannot resolve the descriptor
    /// - `SwarmError::Engine` - Engine refused the transfer
    async fn add_transfer(
        &self,
        descriptor: &TransferDescriptor,
        save_path: &Path,
    ) -> Result<Arc<dyn SwarmHandle>, SwarmError>;
}
