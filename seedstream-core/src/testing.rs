//! Deterministic test doubles for the swarm engine and playback targets.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::broadcast;

use crate::streaming::{PlaybackSink, PlaybackTarget, StreamingResult};
use crate::swarm::{
    FileEntry, InfoHash, PieceFetchPort, PieceIndex, PiecePriority, SwarmAlert, SwarmEngine,
    SwarmError, SwarmEvent, SwarmHandle, TorrentInfo, TransferDescriptor,
};

const MOCK_EVENT_CAPACITY: usize = 1024;

/// Byte at position `offset` of every mock piece space.
pub fn mock_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

#[derive(Debug)]
struct MockState {
    metadata: bool,
    priorities: Vec<PiecePriority>,
    completed: Vec<bool>,
    alerts: VecDeque<SwarmAlert>,
    failing_reads: HashSet<PieceIndex>,
    read_requests: Vec<PieceIndex>,
    auto_complete: bool,
    piece_table_empty: bool,
    dropping_reads: bool,
    sequential: bool,
    removed: bool,
    fail_removal: bool,
    removals: usize,
    max_high: usize,
    save_path: PathBuf,
}

/// In-memory transfer with fully scriptable piece completion.
///
/// Pieces only complete when a test says so, either explicitly or through
/// [`MockSwarm::set_auto_complete`]. Read requests for complete pieces are
/// answered immediately through the alert queue.
pub struct MockSwarm {
    info: TorrentInfo,
    content: Bytes,
    state: Mutex<MockState>,
    events: broadcast::Sender<SwarmEvent>,
}

impl MockSwarm {
    /// Single-file transfer of `piece_count` full pieces, metadata ready.
    pub fn new(piece_count: u32, piece_length: u64) -> Arc<Self> {
        let size = u64::from(piece_count) * piece_length;
        Self::build(piece_length, &[("mock-transfer.mkv", size)], true)
    }

    /// Like [`MockSwarm::new`] but the metadata handshake has not completed.
    pub fn without_metadata(piece_count: u32, piece_length: u64) -> Arc<Self> {
        let size = u64::from(piece_count) * piece_length;
        Self::build(piece_length, &[("mock-transfer.mkv", size)], false)
    }

    /// Multi-file transfer laid out back to back; the last piece may be short.
    pub fn with_files(piece_length: u64, files: &[(&str, u64)]) -> Arc<Self> {
        Self::build(piece_length, files, true)
    }

    fn build(piece_length: u64, files: &[(&str, u64)], metadata: bool) -> Arc<Self> {
        let mut entries = Vec::with_capacity(files.len());
        let mut offset = 0;
        for (path, size) in files {
            entries.push(FileEntry {
                path: (*path).to_string(),
                offset,
                size: *size,
            });
            offset += size;
        }
        let piece_count = offset.div_ceil(piece_length) as u32;
        let content: Vec<u8> = (0..offset).map(mock_byte).collect();
        let (events, _) = broadcast::channel(MOCK_EVENT_CAPACITY);

        Arc::new(Self {
            info: TorrentInfo {
                name: "mock-transfer".to_string(),
                piece_length,
                piece_count,
                files: entries,
            },
            content: Bytes::from(content),
            state: Mutex::new(MockState {
                metadata,
                priorities: vec![PiecePriority::Normal; piece_count as usize],
                completed: vec![false; piece_count as usize],
                alerts: VecDeque::new(),
                failing_reads: HashSet::new(),
                read_requests: Vec::new(),
                auto_complete: false,
                piece_table_empty: false,
                dropping_reads: false,
                sequential: false,
                removed: false,
                fail_removal: false,
                removals: 0,
                max_high: 0,
                save_path: PathBuf::new(),
            }),
            events,
        })
    }

    /// Transfer name, also the artifact name in the save path.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Completes the metadata handshake.
    pub fn deliver_metadata(&self) {
        self.state.lock().metadata = true;
        let _ = self.events.send(SwarmEvent::MetadataReceived);
    }

    /// Marks a piece complete and notifies subscribers.
    pub fn complete_piece(&self, index: PieceIndex) {
        if self.mark_complete(index) {
            let _ = self.events.send(SwarmEvent::PieceFinished(index));
        }
    }

    /// Marks a piece complete without any notification.
    pub fn complete_piece_silently(&self, index: PieceIndex) {
        self.mark_complete(index);
    }

    /// Completes every piece.
    pub fn complete_all(&self) {
        for index in 0..self.info.piece_count {
            self.complete_piece(PieceIndex::new(index));
        }
    }

    /// When enabled, any piece whose priority is set above `Skip` completes
    /// at once.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().auto_complete = enabled;
    }

    /// While enabled, the transfer reports a piece count of zero.
    pub fn set_piece_table_empty(&self, empty: bool) {
        self.state.lock().piece_table_empty = empty;
    }

    /// While enabled, read requests are recorded but never answered.
    pub fn set_dropping_reads(&self, dropping: bool) {
        self.state.lock().dropping_reads = dropping;
    }

    /// Pushes an alert ahead of whatever the next read produces.
    pub fn queue_alert(&self, alert: SwarmAlert) {
        self.state.lock().alerts.push_back(alert);
    }

    /// Makes every read of `index` fail.
    pub fn fail_reads_of(&self, index: PieceIndex) {
        self.state.lock().failing_reads.insert(index);
    }

    /// Makes [`SwarmHandle::remove`] fail.
    pub fn fail_removal(&self) {
        self.state.lock().fail_removal = true;
    }

    /// Raw bytes of one piece.
    pub fn piece_data(&self, index: PieceIndex) -> Bytes {
        let start = (index.as_u32() as u64 * self.info.piece_length) as usize;
        let end = (start + self.info.piece_length as usize).min(self.content.len());
        self.content.slice(start.min(end)..end)
    }

    /// `len` bytes of the piece space starting at `offset`.
    pub fn byte_range(&self, offset: u64, len: u64) -> Vec<u8> {
        self.content[offset as usize..(offset + len) as usize].to_vec()
    }

    /// Every read request so far, in order.
    pub fn read_requests(&self) -> Vec<PieceIndex> {
        self.state.lock().read_requests.clone()
    }

    /// Successful removals.
    pub fn removal_count(&self) -> usize {
        self.state.lock().removals
    }

    /// Highest number of simultaneous `High` pieces ever observed.
    pub fn max_high_observed(&self) -> usize {
        self.state.lock().max_high
    }

    /// Whether sequential download mode is on.
    pub fn is_sequential(&self) -> bool {
        self.state.lock().sequential
    }

    fn mark_complete(&self, index: PieceIndex) -> bool {
        let mut state = self.state.lock();
        match state.completed.get_mut(index.as_usize()) {
            Some(done) if !*done => {
                *done = true;
                true
            }
            _ => false,
        }
    }
}

impl PieceFetchPort for MockSwarm {
    fn piece_count(&self) -> u32 {
        if self.state.lock().piece_table_empty {
            0
        } else {
            self.info.piece_count
        }
    }

    fn set_piece_priority(&self, index: PieceIndex, priority: PiecePriority) {
        let auto_complete = {
            let mut state = self.state.lock();
            let Some(slot) = state.priorities.get_mut(index.as_usize()) else {
                return;
            };
            *slot = priority;
            let high = state
                .priorities
                .iter()
                .filter(|p| **p == PiecePriority::High)
                .count();
            state.max_high = state.max_high.max(high);
            state.auto_complete && priority != PiecePriority::Skip
        };
        if auto_complete {
            self.complete_piece(index);
        }
    }

    fn piece_priority(&self, index: PieceIndex) -> PiecePriority {
        self.state
            .lock()
            .priorities
            .get(index.as_usize())
            .copied()
            .unwrap_or(PiecePriority::Skip)
    }

    fn piece_priorities(&self) -> Vec<PiecePriority> {
        self.state.lock().priorities.clone()
    }

    fn have_piece(&self, index: PieceIndex) -> bool {
        self.state
            .lock()
            .completed
            .get(index.as_usize())
            .copied()
            .unwrap_or(false)
    }

    fn request_read(&self, index: PieceIndex) {
        {
            let mut state = self.state.lock();
            state.read_requests.push(index);
            if state.removed || state.dropping_reads {
                return;
            }
            let alert = if state.failing_reads.contains(&index) {
                SwarmAlert::ReadFailed {
                    index,
                    reason: "scripted read failure".to_string(),
                }
            } else if state.completed.get(index.as_usize()).copied().unwrap_or(false) {
                SwarmAlert::PieceRead {
                    index,
                    data: self.piece_data(index),
                }
            } else {
                SwarmAlert::ReadFailed {
                    index,
                    reason: "piece not complete".to_string(),
                }
            };
            state.alerts.push_back(alert);
        }
        let _ = self.events.send(SwarmEvent::ReadReady(index));
    }

    fn pop_alerts(&self) -> Vec<SwarmAlert> {
        self.state.lock().alerts.drain(..).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl SwarmHandle for MockSwarm {
    fn info_hash(&self) -> InfoHash {
        InfoHash::new([7; 20])
    }

    fn has_metadata(&self) -> bool {
        self.state.lock().metadata
    }

    fn torrent_info(&self) -> Option<TorrentInfo> {
        self.has_metadata().then(|| self.info.clone())
    }

    fn set_sequential_download(&self, enabled: bool) {
        self.state.lock().sequential = enabled;
    }

    fn save_path(&self) -> PathBuf {
        self.state.lock().save_path.clone()
    }

    async fn remove(&self) -> Result<(), SwarmError> {
        {
            let mut state = self.state.lock();
            if state.removed {
                return Err(SwarmError::TransferRemoved);
            }
            if state.fail_removal {
                return Err(SwarmError::Engine {
                    reason: "scripted removal failure".to_string(),
                });
            }
            state.removed = true;
            state.removals += 1;
        }
        let _ = self.events.send(SwarmEvent::Removed);
        Ok(())
    }
}

/// Engine handing out a single prepared [`MockSwarm`].
pub struct MockEngine {
    swarm: Option<Arc<MockSwarm>>,
    adds: AtomicUsize,
}

impl MockEngine {
    /// Engine whose every transfer resolves to `swarm`.
    pub fn new(swarm: Arc<MockSwarm>) -> Self {
        Self {
            swarm: Some(swarm),
            adds: AtomicUsize::new(0),
        }
    }

    /// Engine that refuses every transfer.
    pub fn refusing() -> Self {
        Self {
            swarm: None,
            adds: AtomicUsize::new(0),
        }
    }

    /// Number of successful `add_transfer` calls.
    pub fn add_count(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwarmEngine for MockEngine {
    async fn add_transfer(
        &self,
        descriptor: &TransferDescriptor,
        save_path: &Path,
    ) -> Result<Arc<dyn SwarmHandle>, SwarmError> {
        let swarm = self.swarm.as_ref().ok_or_else(|| SwarmError::Engine {
            reason: format!("mock engine refused {}", descriptor.info_hash),
        })?;
        swarm.state.lock().save_path = save_path.to_path_buf();
        self.adds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(swarm) as Arc<dyn SwarmHandle>)
    }
}

/// Playback target collecting the stream in memory.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    buffer: Arc<Mutex<Vec<u8>>>,
    launches: AtomicUsize,
}

impl MemoryTarget {
    /// Creates an empty target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    /// Number of launches.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl PlaybackTarget for MemoryTarget {
    fn launch(&self) -> StreamingResult<PlaybackSink> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySink {
            buffer: Arc::clone(&self.buffer),
        }))
    }

    fn describe(&self) -> String {
        "in-memory sink".to_string()
    }
}

struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Playback target whose sink breaks after a number of writes.
#[derive(Debug)]
pub struct FailingTarget {
    accepted_writes: usize,
}

impl FailingTarget {
    /// Sink accepting `accepted_writes` writes, then failing with a broken pipe.
    pub fn after_writes(accepted_writes: usize) -> Self {
        Self { accepted_writes }
    }
}

impl PlaybackTarget for FailingTarget {
    fn launch(&self) -> StreamingResult<PlaybackSink> {
        Ok(Box::new(FailingSink {
            remaining: self.accepted_writes,
        }))
    }

    fn describe(&self) -> String {
        format!("sink failing after {} writes", self.accepted_writes)
    }
}

struct FailingSink {
    remaining: usize,
}

impl AsyncWrite for FailingSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "player went away",
            )));
        }
        self.remaining -= 1;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Fresh cache directory removed when the guard drops.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created.
pub fn create_temp_cache_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("seedstream-cache-")
        .tempdir()
        .expect("failed to create temporary cache directory")
}
