//! One end-to-end stream: descriptor in, ordered bytes out, resources released.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use super::completion::wait_for_metadata;
use super::{
    LaunchGate, PieceCache, PieceReader, PieceScheduler, PlaybackLauncher, PlaybackTarget,
    RendezvousBarrier, StreamAssembler, StreamOffset, StreamingError, StreamingResult,
    TransferGuard, WorkerPool,
};
use crate::config::SeedstreamConfig;
use crate::swarm::{FileEntry, SwarmEngine, SwarmHandle, TorrentInfo, TransferDescriptor};

/// Which file of a multi-file transfer to stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FileSelection {
    /// The largest file, normally the media itself
    #[default]
    Largest,
    /// File at this position in the transfer's file list
    Index(usize),
}

impl FileSelection {
    /// Picks the file out of the transfer metadata.
    ///
    /// # Errors
    ///
    /// - `StreamingError::InvalidMetadata` - Transfer has no files or index out of range
    pub fn select<'a>(&self, info: &'a TorrentInfo) -> StreamingResult<&'a FileEntry> {
        let selected = match self {
            FileSelection::Largest => info.largest_file(),
            FileSelection::Index(position) => info.files.get(*position),
        };
        selected.ok_or_else(|| StreamingError::InvalidMetadata {
            reason: format!(
                "transfer {} has no file matching {:?} ({} files)",
                info.name,
                self,
                info.files.len()
            ),
        })
    }
}

/// Outcome of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Session identifier, also recorded on the session span
    pub session_id: Uuid,
    /// Path of the streamed file inside the transfer
    pub file_path: String,
    /// Pieces written to the sink
    pub pieces_written: u32,
    /// File bytes written to the sink
    pub bytes_written: u64,
    /// Barrier rounds the worker pool completed
    pub rounds_completed: u64,
    /// Whether playback was launched
    pub playback_launched: bool,
    /// Whether the transfer was removed and the artifact deleted
    pub cleanup_succeeded: bool,
}

/// Streams one transfer through the scheduling pipeline.
pub struct StreamSession<E: SwarmEngine + ?Sized> {
    engine: Arc<E>,
    config: SeedstreamConfig,
    selection: FileSelection,
    id: Uuid,
    span: tracing::Span,
}

impl<E: SwarmEngine + ?Sized> StreamSession<E> {
    /// Creates a session streaming the largest file of the transfer.
    pub fn new(engine: Arc<E>, config: SeedstreamConfig) -> Self {
        let id = Uuid::new_v4();
        let span = tracing::info_span!(
            "stream_session",
            session_id = %id,
            transfer = tracing::field::Empty
        );
        Self {
            engine,
            config,
            selection: FileSelection::default(),
            id,
            span,
        }
    }

    /// Overrides which file gets streamed.
    pub fn with_file_selection(mut self, selection: FileSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Streams the descriptor's file into `target`.
    ///
    /// The cache directory is created when missing and used as the engine's
    /// save path. Whatever happens after the transfer was added, it is
    /// removed and its artifact deleted before this returns. A cleanup failure
    /// after a successful stream is reported through
    /// [`SessionReport::cleanup_succeeded`]; after a failed stream it is
    /// logged and the stream error is returned.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Io` - Cache directory could not be created
    /// - `StreamingError::Swarm` - Engine refused the transfer
    /// - `StreamingError::MetadataUnavailable` - Metadata wait timed out
    /// - `StreamingError::InvalidMetadata` - Unusable transfer layout
    /// - `StreamingError::SinkWriteFailure` - Playback sink rejected a write
    /// - `StreamingError::PlaybackLaunchFailed` - Playback could not start
    /// - `StreamingError::PieceUnavailable` - A piece read failed terminally
    pub async fn stream(
        &self,
        descriptor: &TransferDescriptor,
        target: Arc<dyn PlaybackTarget>,
    ) -> StreamingResult<SessionReport> {
        self.span.record("transfer", descriptor.label().as_str());
        self.run(descriptor, target)
            .instrument(self.span.clone())
            .await
    }

    async fn run(
        &self,
        descriptor: &TransferDescriptor,
        target: Arc<dyn PlaybackTarget>,
    ) -> StreamingResult<SessionReport> {
        let cache_dir = &self.config.storage.cache_dir;
        tokio::fs::create_dir_all(cache_dir).await?;

        tracing::info!("Adding transfer {} into {}", descriptor.info_hash, cache_dir.display());
        let handle = self.engine.add_transfer(descriptor, cache_dir).await?;
        let guard = TransferGuard::new(Arc::clone(&handle));

        let outcome = self.drive(&handle, &guard, target).await;
        let cleanup = guard.release().await;

        match (outcome, cleanup) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(mut report), Err(e)) => {
                tracing::error!("Stream finished but cleanup failed: {}", e);
                report.cleanup_succeeded = false;
                Ok(report)
            }
            (Err(e), Ok(())) => {
                tracing::error!("Stream failed: {}", e);
                Err(e)
            }
            (Err(e), Err(cleanup)) => {
                tracing::error!("Stream failed: {}; cleanup also failed: {}", e, cleanup);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        handle: &Arc<dyn SwarmHandle>,
        guard: &TransferGuard,
        target: Arc<dyn PlaybackTarget>,
    ) -> StreamingResult<SessionReport> {
        let stream_config = &self.config.stream;

        wait_for_metadata(
            &**handle,
            stream_config.metadata_poll_interval,
            stream_config.metadata_timeout,
        )
        .await?;
        let info = handle
            .torrent_info()
            .ok_or_else(|| StreamingError::InvalidMetadata {
                reason: "engine reported metadata without transfer info".to_string(),
            })?;
        guard.set_artifact(artifact_path(&self.config.storage.cache_dir, &info.name)?);

        let file = self.selection.select(&info)?.clone();
        let offset = StreamOffset::with_budget(info.piece_length, &file, stream_config.buffer_budget)?;
        if offset.last_piece().as_u32() >= info.piece_count {
            return Err(StreamingError::InvalidMetadata {
                reason: format!(
                    "file {} needs piece {} but transfer has {} pieces",
                    file.path,
                    offset.last_piece(),
                    info.piece_count
                ),
            });
        }
        tracing::info!(
            "Streaming {} ({} of {} bytes): pieces {}..={}, window {}",
            file.path,
            file.size,
            info.total_size(),
            offset.piece_start,
            offset.last_piece(),
            offset.window_piece_count
        );

        let scheduler = Arc::new(PieceScheduler::new(Arc::clone(handle), offset));
        scheduler.initialize();
        handle.set_sequential_download(true);

        let (launcher, pending) = PlaybackLauncher::new(target);
        let launcher = Arc::new(launcher);
        let gate_launcher = Arc::clone(&launcher);
        let gate = Arc::new(LaunchGate::new(move || {
            gate_launcher.launch();
        }));
        let parties = offset.window_piece_count.min(offset.piece_count()) as usize;
        let barrier = Arc::new(RendezvousBarrier::new(parties, gate));

        let mut pool = WorkerPool::spawn(
            Arc::clone(handle),
            Arc::clone(&scheduler),
            Arc::clone(&barrier),
            stream_config.piece_poll_interval,
            tracing::Span::current(),
        );

        let reader = PieceReader::new(
            Arc::clone(handle),
            Arc::new(PieceCache::new()),
            stream_config.piece_poll_interval,
        )
        .with_read_timeout(stream_config.piece_read_timeout)
        .with_stream_range(offset.fetch_range());
        let assembler = StreamAssembler::new(reader, scheduler);

        let outcome = tokio::select! {
            result = assembler.run(pending) => result,
            failure = pool.wait_for_failure() => Err(failure),
        };
        pool.shutdown();
        let assembly = outcome?;

        Ok(SessionReport {
            session_id: self.id,
            file_path: file.path,
            pieces_written: assembly.pieces_written,
            bytes_written: assembly.bytes_written,
            rounds_completed: barrier.completed_rounds(),
            playback_launched: launcher.has_launched(),
            cleanup_succeeded: true,
        })
    }
}

/// Location of the transfer's materialized data inside the cache directory.
fn artifact_path(cache_dir: &Path, name: &str) -> StreamingResult<PathBuf> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => Ok(cache_dir.join(part)),
        _ => Err(StreamingError::InvalidMetadata {
            reason: format!("transfer name {name:?} is not a plain file name"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::swarm::{InfoHash, PieceFetchPort};
    use crate::testing::{FailingTarget, MemoryTarget, MockEngine, MockSwarm, create_temp_cache_dir};

    fn descriptor() -> TransferDescriptor {
        TransferDescriptor {
            magnet: "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".to_string(),
            info_hash: InfoHash::new([7; 20]),
            display_name: Some("Mock".to_string()),
            source_url: None,
        }
    }

    fn config(cache_dir: &Path) -> SeedstreamConfig {
        let mut config = SeedstreamConfig::for_testing().with_cache_dir(cache_dir);
        config.stream.buffer_budget = 48;
        config
    }

    fn multi_file_swarm() -> Arc<MockSwarm> {
        MockSwarm::with_files(16, &[("sample.mkv", 30), ("movie.mkv", 150), ("subs.srt", 9)])
    }

    #[tokio::test]
    async fn test_streams_largest_file_and_cleans_up() {
        let cache = create_temp_cache_dir();
        let swarm = multi_file_swarm();
        swarm.set_auto_complete(true);
        let engine = Arc::new(MockEngine::new(Arc::clone(&swarm)));
        let target = Arc::new(MemoryTarget::new());

        let session = StreamSession::new(engine, config(cache.path()));
        let report = session.stream(&descriptor(), target.clone()).await.unwrap();

        assert_eq!(target.contents(), swarm.byte_range(30, 150));
        assert_eq!(report.file_path, "movie.mkv");
        assert_eq!(report.bytes_written, 150);
        assert_eq!(report.session_id, session.id());
        assert!(report.playback_launched);
        assert!(report.cleanup_succeeded);
        assert!(report.rounds_completed >= 1);
        assert_eq!(swarm.removal_count(), 1);
        assert!(swarm.is_sequential());
        assert!(swarm.max_high_observed() <= 3);
        assert_eq!(target.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_explicit_file_selection() {
        let cache = create_temp_cache_dir();
        let swarm = multi_file_swarm();
        swarm.set_auto_complete(true);
        let engine = Arc::new(MockEngine::new(Arc::clone(&swarm)));
        let target = Arc::new(MemoryTarget::new());

        let session = StreamSession::new(engine, config(cache.path()))
            .with_file_selection(FileSelection::Index(2));
        let report = session.stream(&descriptor(), target.clone()).await.unwrap();

        assert_eq!(report.file_path, "subs.srt");
        assert_eq!(target.contents(), swarm.byte_range(180, 9));
    }

    #[tokio::test]
    async fn test_invalid_selection_still_cleans_up() {
        let cache = create_temp_cache_dir();
        let swarm = multi_file_swarm();
        let engine = Arc::new(MockEngine::new(Arc::clone(&swarm)));

        let session = StreamSession::new(engine, config(cache.path()))
            .with_file_selection(FileSelection::Index(9));
        let result = session
            .stream(&descriptor(), Arc::new(MemoryTarget::new()))
            .await;

        assert!(matches!(result, Err(StreamingError::InvalidMetadata { .. })));
        assert_eq!(swarm.removal_count(), 1);
    }

    #[tokio::test]
    async fn test_metadata_timeout_is_reported() {
        let cache = create_temp_cache_dir();
        let swarm = MockSwarm::without_metadata(8, 16);
        let engine = Arc::new(MockEngine::new(Arc::clone(&swarm)));
        let mut config = config(cache.path());
        config.stream.metadata_timeout = Some(Duration::from_millis(50));

        let result = StreamSession::new(engine, config)
            .stream(&descriptor(), Arc::new(MemoryTarget::new()))
            .await;

        assert!(matches!(
            result,
            Err(StreamingError::MetadataUnavailable { .. })
        ));
        assert_eq!(swarm.removal_count(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_removes_transfer_and_artifact() {
        let cache = create_temp_cache_dir();
        let swarm = multi_file_swarm();
        swarm.set_auto_complete(true);
        let artifact = cache.path().join(swarm.name());
        std::fs::write(&artifact, b"partial download").unwrap();
        let engine = Arc::new(MockEngine::new(Arc::clone(&swarm)));

        let result = StreamSession::new(engine, config(cache.path()))
            .stream(&descriptor(), Arc::new(FailingTarget::after_writes(1)))
            .await;

        assert!(matches!(
            result,
            Err(StreamingError::SinkWriteFailure { index, .. }) if index.as_u32() == 2
        ));
        assert_eq!(swarm.removal_count(), 1);
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn test_engine_refusal_is_propagated() {
        let cache = create_temp_cache_dir();
        let engine = Arc::new(MockEngine::refusing());

        let result = StreamSession::new(engine, config(cache.path()))
            .stream(&descriptor(), Arc::new(MemoryTarget::new()))
            .await;

        assert!(matches!(result, Err(StreamingError::Swarm(_))));
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_reported_on_success() {
        let cache = create_temp_cache_dir();
        let swarm = MockSwarm::new(4, 16);
        swarm.set_auto_complete(true);
        swarm.fail_removal();
        let engine = Arc::new(MockEngine::new(Arc::clone(&swarm)));

        let report = StreamSession::new(engine, config(cache.path()))
            .stream(&descriptor(), Arc::new(MemoryTarget::new()))
            .await
            .unwrap();

        assert!(!report.cleanup_succeeded);
        assert_eq!(report.bytes_written, 64);
        assert_eq!(swarm.piece_count(), 4);
    }

    #[test]
    fn test_artifact_path_rejects_traversal() {
        let dir = Path::new("/var/tmp/cache");
        assert_eq!(
            artifact_path(dir, "movie").unwrap(),
            PathBuf::from("/var/tmp/cache/movie")
        );
        assert!(artifact_path(dir, "../etc").is_err());
        assert!(artifact_path(dir, "a/b").is_err());
        assert!(artifact_path(dir, "").is_err());
        assert!(artifact_path(dir, "/abs").is_err());
    }

    #[test]
    fn test_file_selection_errors_on_empty_transfer() {
        let info = TorrentInfo {
            name: "empty".to_string(),
            piece_length: 16,
            piece_count: 0,
            files: Vec::new(),
        };
        assert!(FileSelection::Largest.select(&info).is_err());
    }
}
