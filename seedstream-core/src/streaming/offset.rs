//! Mapping a file's byte range onto swarm pieces.

use std::ops::RangeInclusive;

use bytes::Bytes;

use super::{StreamingError, StreamingResult};
use crate::swarm::{FileEntry, PieceIndex};

/// Bytes of pieces kept in flight ahead of playback.
pub const STREAM_BUFFER_BUDGET: u64 = 40 * 1024 * 1024;

/// Piece window and trims needed to cut one file out of the piece stream.
///
/// Immutable once computed. `piece_end` follows the plain division of the
/// file's end offset, so when a file ends exactly on a piece boundary
/// `tail_trim` is zero and `piece_end` contributes no bytes; see
/// [`StreamOffset::fetch_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOffset {
    /// Bytes per piece
    pub piece_length: u64,
    /// First piece holding file bytes
    pub piece_start: PieceIndex,
    /// Piece holding the file's end offset
    pub piece_end: PieceIndex,
    /// Bytes to discard from the front of `piece_start`
    pub head_trim: u64,
    /// Bytes to keep from the front of `piece_end`
    pub tail_trim: u64,
    /// Pieces wanted at once, derived from the buffer budget
    pub window_piece_count: u32,
}

impl StreamOffset {
    /// Computes the offset with the fixed [`STREAM_BUFFER_BUDGET`].
    ///
    /// # Errors
    ///
    /// - `StreamingError::InvalidMetadata` - Zero piece length or overflowing range
    pub fn calculate(piece_length: u64, file: &FileEntry) -> StreamingResult<Self> {
        Self::with_budget(piece_length, file, STREAM_BUFFER_BUDGET)
    }

    /// Computes the offset with an explicit buffer budget in bytes.
    ///
    /// The window never drops below one piece, even when a single piece is
    /// larger than the budget.
    ///
    /// # Errors
    ///
    /// - `StreamingError::InvalidMetadata` - Zero piece length or overflowing range
    pub fn with_budget(piece_length: u64, file: &FileEntry, budget: u64) -> StreamingResult<Self> {
        if piece_length == 0 {
            return Err(StreamingError::InvalidMetadata {
                reason: "piece length is zero".to_string(),
            });
        }

        let file_end =
            file.offset
                .checked_add(file.size)
                .ok_or_else(|| StreamingError::InvalidMetadata {
                    reason: format!(
                        "file {} range {}+{} overflows",
                        file.path, file.offset, file.size
                    ),
                })?;

        let piece_start = to_piece_index(file.offset / piece_length)?;
        let piece_end = to_piece_index(file_end / piece_length)?;
        let window_piece_count = u32::try_from(budget / piece_length)
            .unwrap_or(u32::MAX)
            .max(1);

        Ok(Self {
            piece_length,
            piece_start,
            piece_end,
            head_trim: file.offset % piece_length,
            tail_trim: file_end % piece_length,
            window_piece_count,
        })
    }

    /// Pieces that actually carry file bytes, in delivery order.
    ///
    /// Equal to `piece_start..=piece_end` except that a trailing `piece_end`
    /// with a zero `tail_trim` is left out, since it contributes nothing and
    /// may not even exist in the transfer.
    pub fn fetch_range(&self) -> RangeInclusive<u32> {
        self.piece_start.as_u32()..=self.last_piece().as_u32()
    }

    /// Last piece that contributes bytes.
    pub fn last_piece(&self) -> PieceIndex {
        if self.tail_trim == 0 && self.piece_end > self.piece_start {
            PieceIndex::new(self.piece_end.as_u32() - 1)
        } else {
            self.piece_end
        }
    }

    /// Number of pieces in [`StreamOffset::fetch_range`].
    pub fn piece_count(&self) -> u32 {
        self.last_piece().as_u32() - self.piece_start.as_u32() + 1
    }

    /// Whether the piece carries bytes of the target file.
    pub fn contains(&self, index: PieceIndex) -> bool {
        self.fetch_range().contains(&index.as_u32())
    }

    /// Cuts a raw piece down to the bytes belonging to the target file.
    ///
    /// Trims are applied against the untrimmed piece, so a file that fits in
    /// a single piece yields `head_trim..tail_trim`. Short pieces are clamped
    /// rather than rejected.
    pub fn trim(&self, index: PieceIndex, data: Bytes) -> Bytes {
        let end = if index == self.piece_end {
            (self.tail_trim as usize).min(data.len())
        } else {
            data.len()
        };
        let start = if index == self.piece_start {
            (self.head_trim as usize).min(end)
        } else {
            0
        };
        data.slice(start..end)
    }
}

fn to_piece_index(index: u64) -> StreamingResult<PieceIndex> {
    u32::try_from(index)
        .map(PieceIndex::new)
        .map_err(|_| StreamingError::InvalidMetadata {
            reason: format!("piece index {index} exceeds u32"),
        })
}
