//! Behavior knobs of the simulated swarm.

use std::time::Duration;

/// How the simulated swarm delivers metadata, pieces and read alerts.
///
/// Every random decision is drawn from a ChaCha8 stream seeded with `seed`,
/// so a profile fully determines piece completion order for a given sequence
/// of priority changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmProfile {
    /// Seed for every random decision
    pub seed: u64,
    /// Delay before metadata becomes available
    pub metadata_delay: Duration,
    /// Interval between completion batches
    pub tick: Duration,
    /// Pieces completed per tick
    pub pieces_per_tick: usize,
    /// Deliver each read alert one request late
    pub reorder_reads: bool,
    /// Probability of an unrequested read alert accompanying each read
    pub spurious_read_rate: f64,
}

impl Default for SwarmProfile {
    fn default() -> Self {
        Self {
            seed: 42,
            metadata_delay: Duration::from_millis(50),
            tick: Duration::from_millis(5),
            pieces_per_tick: 2,
            reorder_reads: false,
            spurious_read_rate: 0.0,
        }
    }
}

impl SwarmProfile {
    /// Metadata at once and large completion batches, for fast tests.
    pub fn instant() -> Self {
        Self {
            metadata_delay: Duration::ZERO,
            tick: Duration::from_millis(1),
            pieces_per_tick: 64,
            ..Self::default()
        }
    }

    /// Slow trickle of pieces with reordered and spurious read alerts.
    pub fn congested() -> Self {
        Self {
            metadata_delay: Duration::from_millis(100),
            tick: Duration::from_millis(10),
            pieces_per_tick: 1,
            reorder_reads: true,
            spurious_read_rate: 0.25,
            ..Self::default()
        }
    }

    /// Replaces the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replaces the metadata delay.
    pub fn with_metadata_delay(mut self, delay: Duration) -> Self {
        self.metadata_delay = delay;
        self
    }

    /// Sets the spurious alert probability, clamped to `0.0..=1.0`.
    pub fn with_spurious_read_rate(mut self, rate: f64) -> Self {
        self.spurious_read_rate = rate.clamp(0.0, 1.0);
        self
    }
}
