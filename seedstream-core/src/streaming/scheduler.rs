//! Sliding High priority window over the stream's pieces.
//!
//! The window starts at the first piece of the file and covers at most
//! `window_piece_count` pieces. Each time the assembler consumes the head of
//! the window it slides forward by one, admitting the next piece. Pieces
//! outside the file are never fetched.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{StreamOffset, StreamingError, StreamingResult};
use crate::swarm::{PieceFetchPort, PieceIndex, PiecePriority};

#[derive(Debug)]
struct WindowState {
    /// Next piece the assembler will consume
    window_start: u32,
    /// First piece not yet admitted to the window
    next_admit: u32,
    /// Pieces a worker has claimed
    claimed: HashSet<u32>,
}

/// Assigns piece priorities for one stream.
///
/// Invariant: at any moment at most `window_piece_count` pieces carry
/// [`PiecePriority::High`], all inside the window.
pub struct PieceScheduler<P: PieceFetchPort + ?Sized> {
    port: Arc<P>,
    offset: StreamOffset,
    state: Mutex<WindowState>,
}

impl<P: PieceFetchPort + ?Sized> PieceScheduler<P> {
    /// Creates a scheduler for the given stream layout. No priority is touched
    /// until [`PieceScheduler::initialize`].
    pub fn new(port: Arc<P>, offset: StreamOffset) -> Self {
        let start = offset.piece_start.as_u32();
        Self {
            port,
            offset,
            state: Mutex::new(WindowState {
                window_start: start,
                next_admit: start,
                claimed: HashSet::new(),
            }),
        }
    }

    /// Stream layout the scheduler works on.
    pub fn offset(&self) -> &StreamOffset {
        &self.offset
    }

    /// Assigns the initial priority map.
    ///
    /// Pieces outside the file go to `Skip`. The first `window_piece_count`
    /// pieces of the file go to `High`, the rest of the file stays at `Skip`
    /// until admitted.
    pub fn initialize(&self) {
        let mut state = self.state.lock();
        let first = self.offset.piece_start.as_u32();
        let last = self.offset.last_piece().as_u32();
        let initial_end = first
            .saturating_add(self.offset.window_piece_count)
            .min(last.saturating_add(1));

        for index in 0..self.port.piece_count() {
            let priority = if (first..initial_end).contains(&index) {
                PiecePriority::High
            } else {
                PiecePriority::Skip
            };
            self.port.set_piece_priority(PieceIndex::new(index), priority);
        }

        state.window_start = first;
        state.next_admit = initial_end;
        state.claimed.clear();

        tracing::debug!(
            "Scheduled pieces {}..{} at High, stream covers {}..={}",
            first,
            initial_end,
            first,
            last
        );
    }

    /// Records that a worker is about to fetch `index`.
    ///
    /// A `Skip` piece is lifted to `Normal`. A piece inside the window that is
    /// not yet complete is raised to `High`. Pieces beyond the window never
    /// reach `High` here; they are promoted when the window slides over them.
    ///
    /// # Errors
    ///
    /// - `StreamingError::PieceOutOfRange` - Piece does not carry file bytes
    pub fn claim(&self, index: PieceIndex) -> StreamingResult<()> {
        if !self.offset.contains(index) {
            return Err(self.out_of_range(index));
        }

        let mut state = self.state.lock();
        state.claimed.insert(index.as_u32());

        let in_window = (state.window_start..state.next_admit).contains(&index.as_u32());
        if in_window && !self.port.have_piece(index) {
            self.port.set_piece_priority(index, PiecePriority::High);
        } else if self.port.piece_priority(index) == PiecePriority::Skip {
            self.port.set_piece_priority(index, PiecePriority::Normal);
        }

        Ok(())
    }

    /// Slides the window after the assembler delivered `index`.
    ///
    /// Pieces must be consumed strictly in order. The consumed piece drops to
    /// `Normal` and the next piece past the window is admitted: `High` when a
    /// worker already claimed it, `Normal` otherwise.
    ///
    /// # Errors
    ///
    /// - `StreamingError::PieceOutOfRange` - Piece does not carry file bytes
    /// - `StreamingError::OutOfOrderConsumption` - Piece is not the window head
    pub fn mark_consumed(&self, index: PieceIndex) -> StreamingResult<()> {
        if !self.offset.contains(index) {
            return Err(self.out_of_range(index));
        }

        let mut state = self.state.lock();
        if index.as_u32() != state.window_start {
            return Err(StreamingError::OutOfOrderConsumption {
                expected: PieceIndex::new(state.window_start),
                actual: index,
            });
        }

        self.port.set_piece_priority(index, PiecePriority::Normal);
        state.claimed.remove(&index.as_u32());
        state.window_start += 1;

        let last = self.offset.last_piece().as_u32();
        if state.next_admit <= last {
            let admitted = state.next_admit;
            let priority = if state.claimed.contains(&admitted) {
                PiecePriority::High
            } else {
                PiecePriority::Normal
            };
            self.port.set_piece_priority(PieceIndex::new(admitted), priority);
            state.next_admit += 1;
            tracing::trace!("Admitted piece {} at {:?}", admitted, priority);
        }

        Ok(())
    }

    /// Pieces currently inside the window, `start..end`.
    pub fn window(&self) -> std::ops::Range<u32> {
        let state = self.state.lock();
        state.window_start..state.next_admit
    }

    /// Whether every piece of the stream has been consumed.
    pub fn is_finished(&self) -> bool {
        self.state.lock().window_start > self.offset.last_piece().as_u32()
    }

    /// Number of pieces the engine currently holds at `High`.
    pub fn high_priority_count(&self) -> usize {
        self.port
            .piece_priorities()
            .into_iter()
            .filter(|priority| *priority == PiecePriority::High)
            .count()
    }

    fn out_of_range(&self, index: PieceIndex) -> StreamingError {
        StreamingError::PieceOutOfRange {
            index,
            start: self.offset.piece_start,
            end: self.offset.last_piece(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::swarm::FileEntry;
    use crate::testing::MockSwarm;

    /// 16 byte pieces, file spans pieces 2..=9, window of 3.
    fn setup() -> (Arc<MockSwarm>, PieceScheduler<MockSwarm>) {
        let swarm = MockSwarm::new(12, 16);
        let file = FileEntry {
            path: "movie.mkv".to_string(),
            offset: 40,
            size: 112,
        };
        let offset = StreamOffset::with_budget(16, &file, 48).unwrap();
        let scheduler = PieceScheduler::new(Arc::clone(&swarm), offset);
        (swarm, scheduler)
    }

    #[test]
    fn test_initialize_assigns_window_and_skips_rest() {
        let (swarm, scheduler) = setup();
        scheduler.initialize();

        let priorities = swarm.piece_priorities();
        assert_eq!(priorities[0], PiecePriority::Skip);
        assert_eq!(priorities[1], PiecePriority::Skip);
        assert_eq!(&priorities[2..5], &[PiecePriority::High; 3]);
        assert!(priorities[5..].iter().all(|p| *p == PiecePriority::Skip));
        assert_eq!(scheduler.window(), 2..5);
    }

    #[test]
    fn test_claim_outside_stream_is_rejected() {
        let (_swarm, scheduler) = setup();
        scheduler.initialize();

        let result = scheduler.claim(PieceIndex::new(11));
        assert!(matches!(
            result,
            Err(StreamingError::PieceOutOfRange { .. })
        ));
    }

    #[test]
    fn test_claim_beyond_window_stays_normal_until_admitted() {
        let (swarm, scheduler) = setup();
        scheduler.initialize();

        scheduler.claim(PieceIndex::new(5)).unwrap();
        assert_eq!(swarm.piece_priority(PieceIndex::new(5)), PiecePriority::Normal);
        assert_eq!(scheduler.high_priority_count(), 3);

        scheduler.mark_consumed(PieceIndex::new(2)).unwrap();
        assert_eq!(swarm.piece_priority(PieceIndex::new(2)), PiecePriority::Normal);
        assert_eq!(swarm.piece_priority(PieceIndex::new(5)), PiecePriority::High);
        assert_eq!(scheduler.window(), 3..6);
        assert_eq!(scheduler.high_priority_count(), 3);
    }

    #[test]
    fn test_unclaimed_admission_is_normal() {
        let (swarm, scheduler) = setup();
        scheduler.initialize();

        scheduler.mark_consumed(PieceIndex::new(2)).unwrap();
        assert_eq!(swarm.piece_priority(PieceIndex::new(5)), PiecePriority::Normal);

        scheduler.claim(PieceIndex::new(5)).unwrap();
        assert_eq!(swarm.piece_priority(PieceIndex::new(5)), PiecePriority::High);
    }

    #[test]
    fn test_claim_of_completed_piece_does_not_raise() {
        let (swarm, scheduler) = setup();
        scheduler.initialize();
        scheduler.mark_consumed(PieceIndex::new(2)).unwrap();
        swarm.complete_piece(PieceIndex::new(5));

        scheduler.claim(PieceIndex::new(5)).unwrap();
        assert_eq!(swarm.piece_priority(PieceIndex::new(5)), PiecePriority::Normal);
    }

    #[test]
    fn test_out_of_order_consumption_is_rejected() {
        let (_swarm, scheduler) = setup();
        scheduler.initialize();

        let result = scheduler.mark_consumed(PieceIndex::new(3));
        assert!(matches!(
            result,
            Err(StreamingError::OutOfOrderConsumption { expected, actual })
                if expected == PieceIndex::new(2) && actual == PieceIndex::new(3)
        ));
    }

    #[test]
    fn test_window_drains_at_end_of_stream() {
        let (_swarm, scheduler) = setup();
        scheduler.initialize();

        for index in 2..=9 {
            scheduler.mark_consumed(PieceIndex::new(index)).unwrap();
        }
        assert!(scheduler.is_finished());
        assert_eq!(scheduler.high_priority_count(), 0);
        assert!(scheduler.window().is_empty());
    }

    #[test]
    fn test_window_larger_than_stream() {
        let swarm = MockSwarm::new(4, 16);
        let file = FileEntry {
            path: "clip.mkv".to_string(),
            offset: 0,
            size: 30,
        };
        let offset = StreamOffset::with_budget(16, &file, 1024).unwrap();
        let scheduler = PieceScheduler::new(Arc::clone(&swarm), offset);
        scheduler.initialize();

        assert_eq!(scheduler.window(), 0..2);
        assert_eq!(scheduler.high_priority_count(), 2);
        assert_eq!(swarm.piece_priority(PieceIndex::new(2)), PiecePriority::Skip);
    }

    proptest! {
        #[test]
        fn high_priority_never_exceeds_window(
            window in 1u64..6,
            claims in proptest::collection::vec(0u32..12, 0..40),
            consumed in 0u32..9,
        ) {
            let swarm = MockSwarm::new(12, 16);
            let file = FileEntry { path: "movie.mkv".to_string(), offset: 40, size: 112 };
            let offset = StreamOffset::with_budget(16, &file, window * 16).unwrap();
            let scheduler = PieceScheduler::new(Arc::clone(&swarm), offset);
            scheduler.initialize();

            let mut next = 2;
            for (step, claim) in claims.into_iter().enumerate() {
                let _ = scheduler.claim(PieceIndex::new(claim));
                if step % 3 == 0 && next < 2 + consumed && next <= 9 {
                    scheduler.mark_consumed(PieceIndex::new(next)).unwrap();
                    next += 1;
                }
                prop_assert!(scheduler.high_priority_count() <= window as usize);
            }
            prop_assert!(swarm.max_high_observed() <= window as usize);
            prop_assert_eq!(swarm.piece_priority(PieceIndex::new(0)), PiecePriority::Skip);
            prop_assert_eq!(swarm.piece_priority(PieceIndex::new(11)), PiecePriority::Skip);
        }
    }
}
