//! In-memory swarm engine implementing the Seedstream engine port.

use std::collections::{HashMap, VecDeque};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use seedstream_core::swarm::{
    InfoHash, PieceFetchPort, PieceIndex, PiecePriority, SwarmAlert, SwarmEngine, SwarmError,
    SwarmEvent, SwarmHandle, TorrentInfo, TransferDescriptor,
};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::{SimulatedContent, SimulationError, SwarmProfile};

const EVENT_CAPACITY: usize = 4096;

/// Simulated swarm engine serving registered content.
///
/// Transfers complete the pieces the scheduler asks for, `High` before
/// `Normal`, in seeded random order within a priority level (ascending when
/// sequential mode is on). `Skip` pieces are never fetched.
pub struct SimulatedSwarm {
    profile: SwarmProfile,
    catalog: Mutex<HashMap<InfoHash, Arc<SimulatedContent>>>,
    transfers: Mutex<Vec<Arc<SimulatedTransfer>>>,
    removals: Arc<AtomicUsize>,
}

impl SimulatedSwarm {
    /// Creates an engine with no content.
    pub fn new(profile: SwarmProfile) -> Self {
        Self {
            profile,
            catalog: Mutex::new(HashMap::new()),
            transfers: Mutex::new(Vec::new()),
            removals: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes content available and returns a descriptor resolving to it.
    ///
    /// # Errors
    ///
    /// - `SimulationError::Swarm` - Generated descriptor failed to parse
    pub fn register(&self, content: SimulatedContent) -> Result<TransferDescriptor, SimulationError> {
        let descriptor = content.descriptor()?;
        tracing::debug!(
            "Registered {} ({} pieces) as {}",
            content.torrent_info().name,
            content.piece_count(),
            content.info_hash()
        );
        self.catalog
            .lock()
            .insert(content.info_hash(), Arc::new(content));
        Ok(descriptor)
    }

    /// Behavior profile of new transfers.
    pub fn profile(&self) -> &SwarmProfile {
        &self.profile
    }

    /// Every transfer added so far, removed ones included.
    pub fn transfers(&self) -> Vec<Arc<SimulatedTransfer>> {
        self.transfers.lock().clone()
    }

    /// Number of successful transfer removals.
    pub fn removal_count(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedSwarm {
    fn default() -> Self {
        Self::new(SwarmProfile::default())
    }
}

#[async_trait]
impl SwarmEngine for SimulatedSwarm {
    async fn add_transfer(
        &self,
        descriptor: &TransferDescriptor,
        save_path: &Path,
    ) -> Result<Arc<dyn SwarmHandle>, SwarmError> {
        let content = self
            .catalog
            .lock()
            .get(&descriptor.info_hash)
            .cloned()
            .ok_or(SwarmError::UnknownTransfer {
                info_hash: descriptor.info_hash,
            })?;

        tokio::fs::create_dir_all(save_path).await?;

        let transfer = SimulatedTransfer::start(
            content,
            self.profile.clone(),
            save_path.to_path_buf(),
            Arc::clone(&self.removals),
        );
        tracing::info!(
            "Added simulated transfer {} into {}",
            descriptor.info_hash,
            save_path.display()
        );
        self.transfers.lock().push(Arc::clone(&transfer));
        Ok(transfer)
    }
}

#[derive(Debug)]
struct TransferState {
    metadata: bool,
    priorities: Vec<PiecePriority>,
    completed: Vec<bool>,
    alerts: VecDeque<SwarmAlert>,
    held: Option<SwarmAlert>,
    sequential: bool,
    removed: bool,
    rng: ChaCha8Rng,
}

/// One transfer inside the [`SimulatedSwarm`].
///
/// A background task delivers metadata after the profile's delay, then
/// completes pieces tick by tick, writing each one into
/// `{save_path}/{name}` before reporting it complete.
pub struct SimulatedTransfer {
    content: Arc<SimulatedContent>,
    profile: SwarmProfile,
    save_path: PathBuf,
    state: Mutex<TransferState>,
    events: broadcast::Sender<SwarmEvent>,
    removals: Arc<AtomicUsize>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedTransfer {
    fn start(
        content: Arc<SimulatedContent>,
        profile: SwarmProfile,
        save_path: PathBuf,
        removals: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        let piece_count = content.piece_count() as usize;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let transfer = Arc::new(Self {
            state: Mutex::new(TransferState {
                metadata: false,
                priorities: vec![PiecePriority::Normal; piece_count],
                completed: vec![false; piece_count],
                alerts: VecDeque::new(),
                held: None,
                sequential: false,
                removed: false,
                rng: ChaCha8Rng::seed_from_u64(profile.seed),
            }),
            content,
            profile,
            save_path,
            events,
            removals,
            driver: Mutex::new(None),
        });

        let driver = tokio::spawn(drive(Arc::downgrade(&transfer)));
        *transfer.driver.lock() = Some(driver);
        transfer
    }

    /// Content behind the transfer.
    pub fn content(&self) -> &Arc<SimulatedContent> {
        &self.content
    }

    /// File the transfer materializes its pieces into.
    pub fn artifact_path(&self) -> PathBuf {
        self.save_path.join(&self.content.torrent_info().name)
    }

    /// Number of locally complete pieces.
    pub fn completed_count(&self) -> usize {
        self.state.lock().completed.iter().filter(|done| **done).count()
    }

    /// Whether the transfer was removed from the engine.
    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    fn deliver_metadata(&self) {
        {
            let mut state = self.state.lock();
            if state.removed {
                return;
            }
            state.metadata = true;
        }
        tracing::debug!("Metadata ready for {}", self.content.info_hash());
        let _ = self.events.send(SwarmEvent::MetadataReceived);
    }

    /// Picks the next pieces to complete.
    fn next_batch(&self) -> Vec<PieceIndex> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.removed || !state.metadata {
            return Vec::new();
        }

        let mut high = Vec::new();
        let mut normal = Vec::new();
        for (index, priority) in state.priorities.iter().enumerate() {
            if state.completed[index] {
                continue;
            }
            match priority {
                PiecePriority::High => high.push(index as u32),
                PiecePriority::Normal => normal.push(index as u32),
                PiecePriority::Skip => {}
            }
        }
        if !state.sequential {
            high.shuffle(&mut state.rng);
            normal.shuffle(&mut state.rng);
        }

        high.into_iter()
            .chain(normal)
            .take(self.profile.pieces_per_tick)
            .map(PieceIndex::new)
            .collect()
    }

    async fn materialize(&self, index: PieceIndex) -> io::Result<()> {
        let Some(data) = self.content.piece(index) else {
            return Ok(());
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.artifact_path())
            .await?;
        file.seek(SeekFrom::Start(
            index.as_u32() as u64 * self.content.piece_length(),
        ))
        .await?;
        file.write_all(&data).await?;
        file.flush().await
    }

    fn finish_piece(&self, index: PieceIndex) {
        {
            let mut state = self.state.lock();
            if state.removed {
                return;
            }
            state.completed[index.as_usize()] = true;
        }
        tracing::trace!("Simulated piece {} complete", index);
        let _ = self.events.send(SwarmEvent::PieceFinished(index));
    }

    fn release_held_alert(&self) {
        let released = {
            let mut state = self.state.lock();
            match state.held.take() {
                Some(alert) => {
                    let index = alert.index();
                    state.alerts.push_back(alert);
                    Some(index)
                }
                None => None,
            }
        };
        if let Some(index) = released {
            let _ = self.events.send(SwarmEvent::ReadReady(index));
        }
    }
}

async fn drive(weak: Weak<SimulatedTransfer>) {
    let Some(profile) = weak.upgrade().map(|transfer| transfer.profile.clone()) else {
        return;
    };

    tokio::time::sleep(profile.metadata_delay).await;
    match weak.upgrade() {
        Some(transfer) => transfer.deliver_metadata(),
        None => return,
    }

    loop {
        tokio::time::sleep(profile.tick).await;
        let Some(transfer) = weak.upgrade() else {
            break;
        };
        if transfer.is_removed() {
            break;
        }

        transfer.release_held_alert();
        for index in transfer.next_batch() {
            if let Err(e) = transfer.materialize(index).await {
                tracing::warn!("Failed to write simulated piece {}: {}", index, e);
            }
            transfer.finish_piece(index);
        }
    }
}

impl PieceFetchPort for SimulatedTransfer {
    fn piece_count(&self) -> u32 {
        if self.state.lock().metadata {
            self.content.piece_count()
        } else {
            0
        }
    }

    fn set_piece_priority(&self, index: PieceIndex, priority: PiecePriority) {
        if let Some(slot) = self.state.lock().priorities.get_mut(index.as_usize()) {
            *slot = priority;
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
        let mut notify = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.removed {
                return;
            }

            let complete = state.completed.get(index.as_usize()).copied().unwrap_or(false);
            let alert = match self.content.piece(index) {
                Some(data) if complete => SwarmAlert::PieceRead { index, data },
                _ => SwarmAlert::ReadFailed {
                    index,
                    reason: "piece not downloaded".to_string(),
                },
            };

            if self.profile.reorder_reads {
                if let Some(previous) = state.held.replace(alert) {
                    notify.push(previous.index());
                    state.alerts.push_back(previous);
                }
            } else {
                notify.push(index);
                state.alerts.push_back(alert);
            }

            let rate = self.profile.spurious_read_rate.clamp(0.0, 1.0);
            if rate > 0.0 && state.rng.random_bool(rate) {
                let done: Vec<u32> = state
                    .completed
                    .iter()
                    .enumerate()
                    .filter(|(_, done)| **done)
                    .map(|(i, _)| i as u32)
                    .collect();
                if let Some(&extra) = done.choose(&mut state.rng) {
                    let extra = PieceIndex::new(extra);
                    if let Some(data) = self.content.piece(extra) {
                        notify.push(extra);
                        state.alerts.push_back(SwarmAlert::PieceRead { index: extra, data });
                    }
                }
            }
        }

        for index in notify {
            let _ = self.events.send(SwarmEvent::ReadReady(index));
        }
    }

    fn pop_alerts(&self) -> Vec<SwarmAlert> {
        self.state.lock().alerts.drain(..).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl SwarmHandle for SimulatedTransfer {
    fn info_hash(&self) -> InfoHash {
        self.content.info_hash()
    }

    fn has_metadata(&self) -> bool {
        self.state.lock().metadata
    }

    fn torrent_info(&self) -> Option<TorrentInfo> {
        self.has_metadata()
            .then(|| self.content.torrent_info().clone())
    }

    fn set_sequential_download(&self, enabled: bool) {
        self.state.lock().sequential = enabled;
    }

    fn save_path(&self) -> PathBuf {
        self.save_path.clone()
    }

    async fn remove(&self) -> Result<(), SwarmError> {
        {
            let mut state = self.state.lock();
            if state.removed {
                return Err(SwarmError::TransferRemoved);
            }
            state.removed = true;
        }
        self.removals.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(SwarmEvent::Removed);

        // No piece may be written once removal returns.
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.abort();
            let _ = driver.await;
        }

        tracing::info!("Removed simulated transfer {}", self.content.info_hash());
        Ok(())
    }
}
