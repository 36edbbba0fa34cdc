//! Sequential consumer writing the trimmed pieces to the playback sink.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use super::{
    PendingSink, PieceReader, PieceScheduler, PlaybackSink, StreamingError, StreamingResult,
};
use crate::swarm::{PieceFetchPort, PieceIndex};

/// Bytes and pieces delivered to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    /// Pieces written in order
    pub pieces_written: u32,
    /// File bytes written after trimming
    pub bytes_written: u64,
}

/// Drains the stream's pieces in strict ascending order into the sink.
pub struct StreamAssembler<P: PieceFetchPort + ?Sized> {
    reader: PieceReader<P>,
    scheduler: Arc<PieceScheduler<P>>,
}

impl<P: PieceFetchPort + ?Sized> StreamAssembler<P> {
    /// Creates an assembler reading through `reader` and sliding `scheduler`.
    pub fn new(reader: PieceReader<P>, scheduler: Arc<PieceScheduler<P>>) -> Self {
        Self { reader, scheduler }
    }

    /// Writes every piece of the stream, then flushes and closes the sink.
    ///
    /// The sink is awaited before the first write, so nothing is written
    /// until playback has launched. Each consumed piece slides the
    /// scheduler's window forward by one.
    ///
    /// # Errors
    ///
    /// - `StreamingError::PieceUnavailable` - A piece read failed
    /// - `StreamingError::PlaybackLaunchFailed` - Sink never became available
    /// - `StreamingError::SinkWriteFailure` - Sink rejected a write
    pub async fn run(&self, pending: PendingSink) -> StreamingResult<AssemblyReport> {
        let offset = *self.scheduler.offset();
        let mut pending = Some(pending);
        let mut sink: Option<PlaybackSink> = None;
        let mut report = AssemblyReport::default();

        for raw in offset.fetch_range() {
            let index = PieceIndex::new(raw);
            let data = self.reader.read_piece(index).await?;
            let chunk = offset.trim(index, data);

            if let Some(pending) = pending.take() {
                tracing::debug!("Piece {} ready, waiting for playback sink", index);
                sink = Some(pending.ready().await?);
            }
            let Some(writer) = sink.as_mut() else {
                return Err(StreamingError::PlaybackLaunchFailed {
                    reason: "playback sink missing".to_string(),
                });
            };

            writer
                .write_all(&chunk)
                .await
                .map_err(|source| StreamingError::SinkWriteFailure { index, source })?;

            self.scheduler.mark_consumed(index)?;
            let cache = self.reader.cache();
            let evicted = cache.evict_below(PieceIndex::new(raw + 1));
            if evicted > 0 {
                tracing::debug!(
                    "Evicted {} stale cached pieces, {} bytes still cached",
                    evicted,
                    cache.cached_bytes()
                );
            }

            report.pieces_written += 1;
            report.bytes_written += chunk.len() as u64;
            tracing::debug!("Wrote piece {} ({} bytes)", index, chunk.len());
        }

        if let Some(mut writer) = sink {
            let last = offset.last_piece();
            writer
                .flush()
                .await
                .map_err(|source| StreamingError::SinkWriteFailure { index: last, source })?;
            writer
                .shutdown()
                .await
                .map_err(|source| StreamingError::SinkWriteFailure { index: last, source })?;
        }

        tracing::info!(
            "Stream complete: {} pieces, {} bytes",
            report.pieces_written,
            report.bytes_written
        );
        Ok(report)
    }
}
