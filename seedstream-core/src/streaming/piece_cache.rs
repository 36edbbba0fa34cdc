//! Holding area for pieces the engine delivered before they were asked for.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::swarm::PieceIndex;

/// Out-of-order piece buffers keyed by index.
///
/// Every entry is handed out at most once: [`PieceCache::take`] removes it.
/// Safe to share between tasks.
#[derive(Debug, Default)]
pub struct PieceCache {
    entries: Mutex<HashMap<PieceIndex, Bytes>>,
}

impl PieceCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a piece that arrived early.
    ///
    /// Returns true when an earlier buffer for the same index was replaced,
    /// which happens when the engine repeats an alert.
    pub fn insert(&self, index: PieceIndex, data: Bytes) -> bool {
        let replaced = self.entries.lock().insert(index, data).is_some();
        if replaced {
            tracing::debug!("Duplicate read alert for piece {}, keeping latest", index);
        }
        replaced
    }

    /// Removes and returns the buffer for `index`, if one is cached.
    pub fn take(&self, index: PieceIndex) -> Option<Bytes> {
        self.entries.lock().remove(&index)
    }

    /// Whether a buffer for `index` is waiting.
    pub fn contains(&self, index: PieceIndex) -> bool {
        self.entries.lock().contains_key(&index)
    }

    /// Drops every entry below `index`. Returns how many were dropped.
    ///
    /// Used once the assembler has moved past a piece, so stray duplicate
    /// alerts cannot pile up.
    pub fn evict_below(&self, index: PieceIndex) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|cached, _| *cached >= index);
        before - entries.len()
    }

    /// Number of cached pieces.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total cached bytes.
    pub fn cached_bytes(&self) -> usize {
        self.entries.lock().values().map(Bytes::len).sum()
    }
}
