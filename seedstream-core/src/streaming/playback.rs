//! Playback sinks and the one-time launch of the consumer.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use super::{StreamingError, StreamingResult};

/// Byte sink receiving the assembled stream.
pub type PlaybackSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Something that can be started once and then fed the stream.
pub trait PlaybackTarget: Send + Sync {
    /// Starts the consumer and returns its input.
    ///
    /// # Errors
    ///
    /// - `StreamingError::PlaybackLaunchFailed` - Consumer could not be started
    fn launch(&self) -> StreamingResult<PlaybackSink>;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// External player reading the stream from its standard input.
pub struct PlayerProcess {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl PlayerProcess {
    /// Creates a target spawning `program args...`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
        }
    }
}

impl PlaybackTarget for PlayerProcess {
    fn launch(&self) -> StreamingResult<PlaybackSink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| StreamingError::PlaybackLaunchFailed {
                reason: format!("failed to spawn {}: {e}", self.describe()),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StreamingError::PlaybackLaunchFailed {
                reason: format!("{} has no stdin pipe", self.describe()),
            })?;

        tracing::info!("Started player {} (pid {:?})", self.describe(), child.id());
        *self.child.lock() = Some(child);
        Ok(Box::new(stdin))
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Writes the stream to a file.
#[derive(Debug, Clone)]
pub struct FileTarget {
    path: PathBuf,
}

impl FileTarget {
    /// Creates a target writing to `path`, truncating it on launch.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PlaybackTarget for FileTarget {
    // The create is a single blocking open on the barrier leader, once per session.
    fn launch(&self) -> StreamingResult<PlaybackSink> {
        let file =
            std::fs::File::create(&self.path).map_err(|e| StreamingError::PlaybackLaunchFailed {
                reason: format!("cannot create {}: {e}", self.path.display()),
            })?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

type SinkSender = oneshot::Sender<StreamingResult<PlaybackSink>>;

/// Launches a [`PlaybackTarget`] at most once and hands its sink to the
/// matching [`PendingSink`].
pub struct PlaybackLauncher {
    target: Arc<dyn PlaybackTarget>,
    sender: Mutex<Option<SinkSender>>,
}

impl PlaybackLauncher {
    /// Creates a launcher and the receiving half for the assembler.
    pub fn new(target: Arc<dyn PlaybackTarget>) -> (Self, PendingSink) {
        let (sender, receiver) = oneshot::channel();
        let launcher = Self {
            target,
            sender: Mutex::new(Some(sender)),
        };
        (launcher, PendingSink { receiver })
    }

    /// Starts the target. Only the first call launches; later calls return
    /// false without side effects.
    pub fn launch(&self) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };

        tracing::info!("Launching playback: {}", self.target.describe());
        let sink = self.target.launch();
        if let Err(e) = &sink {
            tracing::error!("Playback launch failed: {}", e);
        }
        if sender.send(sink).is_err() {
            tracing::debug!("Playback sink launched after the assembler stopped");
        }
        true
    }

    /// Whether [`PlaybackLauncher::launch`] already ran.
    pub fn has_launched(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl fmt::Debug for PlaybackLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackLauncher")
            .field("target", &self.target.describe())
            .field("launched", &self.has_launched())
            .finish()
    }
}

/// Sink that becomes available once playback has launched.
pub struct PendingSink {
    receiver: oneshot::Receiver<StreamingResult<PlaybackSink>>,
}

impl fmt::Debug for PendingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSink").finish_non_exhaustive()
    }
}

impl PendingSink {
    /// Waits for the launch and returns the sink.
    ///
    /// # Errors
    ///
    /// - `StreamingError::PlaybackLaunchFailed` - Launch failed or the launcher
    ///   was dropped without launching
    pub async fn ready(self) -> StreamingResult<PlaybackSink> {
        self.receiver
            .await
            .map_err(|_| StreamingError::PlaybackLaunchFailed {
                reason: "launcher dropped before playback started".to_string(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::testing::MemoryTarget;

    #[tokio::test]
    async fn test_launches_once() {
        let target = Arc::new(MemoryTarget::new());
        let (launcher, pending) = PlaybackLauncher::new(target.clone());

        assert!(!launcher.has_launched());
        assert!(launcher.launch());
        assert!(!launcher.launch());
        assert_eq!(target.launch_count(), 1);

        let mut sink = pending.ready().await.unwrap();
        sink.write_all(b"frame").await.unwrap();
        assert_eq!(target.contents(), b"frame");
    }

    #[test]
    fn test_pending_sink_waits_for_launch() {
        let (launcher, pending) = PlaybackLauncher::new(Arc::new(MemoryTarget::new()));
        let mut ready = tokio_test::task::spawn(pending.ready());

        assert!(ready.poll().is_pending());
        assert!(launcher.launch());
        assert!(ready.is_woken());
        assert!(matches!(ready.poll(), std::task::Poll::Ready(Ok(_))));
    }

    #[tokio::test]
    async fn test_dropped_launcher_fails_pending_sink() {
        let (launcher, pending) = PlaybackLauncher::new(Arc::new(MemoryTarget::new()));
        drop(launcher);

        let result = pending.ready().await;
        assert!(matches!(
            result,
            Err(StreamingError::PlaybackLaunchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_player_is_reported() {
        let target = Arc::new(PlayerProcess::new(
            "seedstream-player-that-does-not-exist",
            vec!["-".to_string()],
        ));
        let (launcher, pending) = PlaybackLauncher::new(target);

        assert!(launcher.launch());
        assert!(matches!(
            pending.ready().await,
            Err(StreamingError::PlaybackLaunchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_target_writes_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let target = FileTarget::new(&path);

        let mut sink = target.launch().unwrap();
        sink.write_all(b"abc").await.unwrap();
        sink.shutdown().await.unwrap();
        drop(sink);

        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        assert!(target.describe().contains("out.bin"));
    }
}
