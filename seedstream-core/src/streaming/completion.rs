//! Waiting on engine state without busy polling.
//!
//! Waits park on the transfer's [`SwarmEvent`] channel and re-query the port on
//! every wake-up. A fallback interval bounds the wait when the engine misses an
//! event, so liveness never depends on event delivery alone.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};

use super::{StreamingError, StreamingResult};
use crate::swarm::{PieceFetchPort, PieceIndex, SwarmEvent, SwarmHandle};

/// Outcome of one wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// Engine event, state must be re-checked
    Recheck,
    /// Fallback interval passed without any event
    Idle,
    /// Engine dropped the transfer
    Closed,
}

/// Sleeps until the next engine event or the fallback interval.
pub(crate) async fn next_wake(
    events: &mut broadcast::Receiver<SwarmEvent>,
    fallback: Duration,
) -> Wake {
    tokio::select! {
        event = events.recv() => match event {
            Ok(SwarmEvent::Removed) | Err(RecvError::Closed) => Wake::Closed,
            Ok(_) => Wake::Recheck,
            Err(RecvError::Lagged(missed)) => {
                tracing::trace!("Event receiver lagged by {} events", missed);
                Wake::Recheck
            }
        },
        _ = tokio::time::sleep(fallback) => Wake::Idle,
    }
}

/// Blocks until `index` is locally complete.
///
/// Retries for as long as the transfer exists. Callers wanting a deadline
/// wrap this in [`tokio::time::timeout`].
///
/// # Errors
///
/// - `StreamingError::PieceUnavailable` - Transfer has no pieces or was removed
pub async fn wait_for_piece<P: PieceFetchPort + ?Sized>(
    port: &P,
    events: &mut broadcast::Receiver<SwarmEvent>,
    index: PieceIndex,
    fallback: Duration,
) -> StreamingResult<()> {
    wait_until_complete(port, events, index, fallback, EmptyTable::Fail).await
}

/// Like [`wait_for_piece`] but an empty piece table is treated as transient.
///
/// Fetch workers use this: the engine may briefly report no pieces while it
/// rechecks the transfer, and a worker keeps polling until the table comes
/// back. Only removal of the transfer ends the wait early.
///
/// # Errors
///
/// - `StreamingError::PieceUnavailable` - Transfer was removed
pub async fn wait_for_piece_retrying<P: PieceFetchPort + ?Sized>(
    port: &P,
    events: &mut broadcast::Receiver<SwarmEvent>,
    index: PieceIndex,
    fallback: Duration,
) -> StreamingResult<()> {
    wait_until_complete(port, events, index, fallback, EmptyTable::Retry).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmptyTable {
    Fail,
    Retry,
}

async fn wait_until_complete<P: PieceFetchPort + ?Sized>(
    port: &P,
    events: &mut broadcast::Receiver<SwarmEvent>,
    index: PieceIndex,
    fallback: Duration,
    empty_table: EmptyTable,
) -> StreamingResult<()> {
    loop {
        if port.piece_count() == 0 {
            if empty_table == EmptyTable::Fail {
                return Err(StreamingError::PieceUnavailable {
                    index,
                    reason: "transfer reports no pieces".to_string(),
                });
            }
            tracing::trace!("Transfer reports no pieces, retrying piece {}", index);
        } else if port.have_piece(index) {
            return Ok(());
        }

        if next_wake(events, fallback).await == Wake::Closed {
            // Final check: completion may have raced the removal.
            if port.have_piece(index) {
                return Ok(());
            }
            return Err(StreamingError::PieceUnavailable {
                index,
                reason: "transfer was removed".to_string(),
            });
        }
    }
}

/// Blocks until the metadata handshake has completed.
///
/// `timeout` of `None` waits for as long as the transfer exists.
///
/// # Errors
///
/// - `StreamingError::MetadataUnavailable` - Timeout elapsed or transfer removed
pub async fn wait_for_metadata<H: SwarmHandle + ?Sized>(
    handle: &H,
    fallback: Duration,
    timeout: Option<Duration>,
) -> StreamingResult<()> {
    let started = tokio::time::Instant::now();
    let mut events = handle.subscribe();

    let wait = async {
        loop {
            if handle.has_metadata() {
                return Ok(());
            }
            tracing::debug!("Waiting for metadata of {}", handle.info_hash());
            if next_wake(&mut events, fallback).await == Wake::Closed && !handle.has_metadata() {
                return Err(StreamingError::MetadataUnavailable {
                    waited: started.elapsed(),
                });
            }
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| StreamingError::MetadataUnavailable { waited: limit })?,
        None => wait.await,
    }
}
