//! Ordered piece reads on top of the engine's unordered alert queue.
//!
//! The engine answers read requests through a shared alert queue, in whatever
//! order it likes. Alerts for pieces nobody is waiting on yet are parked in the
//! [`PieceCache`] so every piece buffer is delivered exactly once.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::completion::{Wake, next_wake, wait_for_piece};
use super::{PieceCache, StreamingError, StreamingResult};
use crate::swarm::{PieceFetchPort, PieceIndex, SwarmAlert};

/// Reads complete pieces through the engine's alert queue.
///
/// Pieces are read in ascending order. Alerts for pieces below the one being
/// read, or outside the stream range, are dropped instead of cached.
pub struct PieceReader<P: PieceFetchPort + ?Sized> {
    port: Arc<P>,
    cache: Arc<PieceCache>,
    poll_interval: Duration,
    read_timeout: Option<Duration>,
    stream_range: RangeInclusive<u32>,
}

impl<P: PieceFetchPort + ?Sized> PieceReader<P> {
    /// Creates a reader that waits forever for each piece.
    pub fn new(port: Arc<P>, cache: Arc<PieceCache>, poll_interval: Duration) -> Self {
        Self {
            port,
            cache,
            poll_interval,
            read_timeout: None,
            stream_range: 0..=u32::MAX,
        }
    }

    /// Restricts caching to alerts for pieces in `range`.
    pub fn with_stream_range(mut self, range: RangeInclusive<u32>) -> Self {
        self.stream_range = range;
        self
    }

    /// Bounds every [`PieceReader::read_piece`] call. `None` retries forever.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Shared out-of-order cache.
    pub fn cache(&self) -> &Arc<PieceCache> {
        &self.cache
    }

    /// Returns the full bytes of piece `index`.
    ///
    /// Served from the cache when an earlier read already delivered it.
    /// Otherwise waits for the piece to complete, requests a read and drains
    /// the alert queue until the matching buffer shows up, caching every other
    /// piece it encounters along the way.
    ///
    /// # Errors
    ///
    /// - `StreamingError::PieceUnavailable` - Engine failed the read, transfer
    ///   was removed or the read timeout elapsed
    pub async fn read_piece(&self, index: PieceIndex) -> StreamingResult<Bytes> {
        if let Some(data) = self.cache.take(index) {
            tracing::trace!("Piece {} served from cache", index);
            return Ok(data);
        }

        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_uncached(index))
                .await
                .map_err(|_| StreamingError::PieceUnavailable {
                    index,
                    reason: format!("read timed out after {limit:?}"),
                })?,
            None => self.read_uncached(index).await,
        }
    }

    async fn read_uncached(&self, index: PieceIndex) -> StreamingResult<Bytes> {
        // Subscribe before the first check so no completion can slip between.
        let mut events = self.port.subscribe();
        wait_for_piece(&*self.port, &mut events, index, self.poll_interval).await?;

        self.port.request_read(index);
        tracing::trace!("Requested read of piece {}", index);

        loop {
            if let Some(result) = self.drain_alerts(index) {
                return result;
            }
            if let Some(data) = self.cache.take(index) {
                return Ok(data);
            }
            if self.port.piece_count() == 0 {
                return Err(StreamingError::PieceUnavailable {
                    index,
                    reason: "transfer reports no pieces".to_string(),
                });
            }

            match next_wake(&mut events, self.poll_interval).await {
                Wake::Recheck => {}
                Wake::Idle => {
                    // No alert for a whole interval: the request may have been lost.
                    if self.port.have_piece(index) {
                        tracing::debug!("No read alert for piece {}, requesting again", index);
                        self.port.request_read(index);
                    }
                }
                Wake::Closed => {
                    return self.drain_alerts(index).unwrap_or_else(|| {
                        Err(StreamingError::PieceUnavailable {
                            index,
                            reason: "transfer removed before the read completed".to_string(),
                        })
                    });
                }
            }
        }
    }

    /// Processes one full alert batch. Returns the outcome for `wanted` when
    /// the batch contained it.
    fn drain_alerts(&self, wanted: PieceIndex) -> Option<StreamingResult<Bytes>> {
        let mut outcome = None;

        for alert in self.port.pop_alerts() {
            match alert {
                SwarmAlert::PieceRead { index, data } if index == wanted => {
                    if outcome.is_none() {
                        outcome = Some(Ok(data));
                    } else {
                        tracing::debug!("Dropping duplicate read of piece {}", index);
                    }
                }
                SwarmAlert::PieceRead { index, .. }
                    if index < wanted || !self.stream_range.contains(&index.as_u32()) =>
                {
                    tracing::trace!("Dropping stray read of piece {}", index);
                }
                SwarmAlert::PieceRead { index, data } => {
                    tracing::trace!("Caching early read of piece {}", index);
                    self.cache.insert(index, data);
                }
                SwarmAlert::ReadFailed { index, reason } if index == wanted => {
                    if outcome.is_none() {
                        outcome = Some(Err(StreamingError::PieceUnavailable { index, reason }));
                    }
                }
                SwarmAlert::ReadFailed { index, reason } => {
                    tracing::warn!("Unrequested read of piece {} failed: {}", index, reason);
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSwarm;

    const POLL: Duration = Duration::from_millis(10);

    fn reader(swarm: &Arc<MockSwarm>) -> PieceReader<MockSwarm> {
        PieceReader::new(Arc::clone(swarm), Arc::new(PieceCache::new()), POLL)
    }

    #[tokio::test]
    async fn test_reads_completed_piece() {
        let swarm = MockSwarm::new(4, 32);
        swarm.complete_all();
        let reader = reader(&swarm);

        let data = reader.read_piece(PieceIndex::new(2)).await.unwrap();
        assert_eq!(data, swarm.piece_data(PieceIndex::new(2)));
        assert_eq!(swarm.read_requests(), vec![PieceIndex::new(2)]);
    }

    #[tokio::test]
    async fn test_unrelated_alerts_are_cached_and_served_once() {
        let swarm = MockSwarm::new(6, 32);
        swarm.complete_all();
        swarm.queue_alert(SwarmAlert::PieceRead {
            index: PieceIndex::new(4),
            data: swarm.piece_data(PieceIndex::new(4)),
        });
        swarm.queue_alert(SwarmAlert::PieceRead {
            index: PieceIndex::new(5),
            data: swarm.piece_data(PieceIndex::new(5)),
        });
        let reader = reader(&swarm);

        let first = reader.read_piece(PieceIndex::new(3)).await.unwrap();
        assert_eq!(first, swarm.piece_data(PieceIndex::new(3)));
        assert_eq!(reader.cache().len(), 2);

        let cached = reader.read_piece(PieceIndex::new(4)).await.unwrap();
        assert_eq!(cached, swarm.piece_data(PieceIndex::new(4)));
        assert_eq!(swarm.read_requests(), vec![PieceIndex::new(3)]);
        assert!(!reader.cache().contains(PieceIndex::new(4)));
    }

    #[tokio::test]
    async fn test_waits_for_completion_before_reading() {
        let swarm = MockSwarm::new(4, 32);
        let reader = reader(&swarm);

        let completer = Arc::clone(&swarm);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            completer.complete_piece(PieceIndex::new(1));
        });

        let data = reader.read_piece(PieceIndex::new(1)).await.unwrap();
        assert_eq!(data, swarm.piece_data(PieceIndex::new(1)));
    }

    #[tokio::test]
    async fn test_failed_read_is_reported() {
        let swarm = MockSwarm::new(4, 32);
        swarm.complete_all();
        swarm.fail_reads_of(PieceIndex::new(0));
        let reader = reader(&swarm);

        let result = reader.read_piece(PieceIndex::new(0)).await;
        assert!(matches!(
            result,
            Err(StreamingError::PieceUnavailable { index, .. }) if index == PieceIndex::new(0)
        ));
    }

    #[tokio::test]
    async fn test_lost_read_is_requested_again() {
        let swarm = MockSwarm::new(4, 32);
        swarm.complete_all();
        swarm.set_dropping_reads(true);
        let reader = reader(&swarm);

        let restorer = Arc::clone(&swarm);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            restorer.set_dropping_reads(false);
        });

        let read = reader.read_piece(PieceIndex::new(1));
        let data = tokio::time::timeout(Duration::from_secs(2), read)
            .await
            .expect("lost read should be re-issued")
            .unwrap();
        assert_eq!(data, swarm.piece_data(PieceIndex::new(1)));

        let requests = swarm.read_requests();
        assert!(requests.len() >= 2);
        assert!(requests.iter().all(|index| *index == PieceIndex::new(1)));
    }

    #[tokio::test]
    async fn test_empty_piece_table_ends_pending_read() {
        let swarm = MockSwarm::new(4, 32);
        swarm.complete_all();
        swarm.set_dropping_reads(true);
        let reader = reader(&swarm);

        let emptier = Arc::clone(&swarm);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            emptier.set_piece_table_empty(true);
        });

        let read = reader.read_piece(PieceIndex::new(2));
        let result = tokio::time::timeout(Duration::from_secs(2), read)
            .await
            .expect("empty piece table must end the read");
        assert!(matches!(
            result,
            Err(StreamingError::PieceUnavailable { index, .. }) if index == PieceIndex::new(2)
        ));
    }

    #[tokio::test]
    async fn test_stray_alerts_are_not_cached() {
        let swarm = MockSwarm::new(10, 32);
        swarm.complete_all();
        for index in [0, 2, 4, 9] {
            swarm.queue_alert(SwarmAlert::PieceRead {
                index: PieceIndex::new(index),
                data: swarm.piece_data(PieceIndex::new(index)),
            });
        }
        let reader = reader(&swarm).with_stream_range(2..=5);

        let data = reader.read_piece(PieceIndex::new(3)).await.unwrap();
        assert_eq!(data, swarm.piece_data(PieceIndex::new(3)));
        assert_eq!(reader.cache().len(), 1);
        assert!(reader.cache().contains(PieceIndex::new(4)));
    }

    #[tokio::test]
    async fn test_read_timeout_is_optional() {
        let swarm = MockSwarm::new(4, 32);
        let reader = reader(&swarm).with_read_timeout(Some(Duration::from_millis(50)));

        let result = reader.read_piece(PieceIndex::new(1)).await;
        assert!(matches!(
            result,
            Err(StreamingError::PieceUnavailable { .. })
        ));
    }
}
