//! Centralized configuration for Seedstream.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::streaming::{PlayerProcess, STREAM_BUFFER_BUDGET};

/// Central configuration for all Seedstream components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SeedstreamConfig {
    pub stream: StreamConfig,
    pub storage: StorageConfig,
    pub playback: PlaybackConfig,
}

/// Piece scheduling and waiting behavior.
///
/// Timeouts default to `None`, which waits for as long as the transfer exists.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bytes of pieces kept in flight ahead of playback
    pub buffer_budget: u64,
    /// Fallback re-check interval while waiting on pieces
    pub piece_poll_interval: Duration,
    /// Upper bound for a single piece read (None = unbounded)
    pub piece_read_timeout: Option<Duration>,
    /// Fallback re-check interval while waiting on metadata
    pub metadata_poll_interval: Duration,
    /// Upper bound for the metadata handshake (None = unbounded)
    pub metadata_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_budget: STREAM_BUFFER_BUDGET,
            piece_poll_interval: Duration::from_millis(500),
            piece_read_timeout: None,
            metadata_poll_interval: Duration::from_secs(10),
            metadata_timeout: None,
        }
    }
}

/// On-disk locations.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Engine save path; transfer artifacts are deleted from here on session end
    pub cache_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/tmp/cache"),
        }
    }
}

/// External player fed through its standard input.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Player executable
    pub player_program: String,
    /// Player arguments, `-` making it read stdin
    pub player_args: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            player_program: "vlc".to_string(),
            player_args: vec!["-".to_string()],
        }
    }
}

impl PlaybackConfig {
    /// Parses a whitespace separated command line such as `mpv --cache=yes -`.
    ///
    /// Returns `None` for an empty command.
    pub fn from_command(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let player_program = parts.next()?;
        Some(Self {
            player_program,
            player_args: parts.collect(),
        })
    }

    /// Builds the playback target for this player.
    pub fn player(&self) -> PlayerProcess {
        PlayerProcess::new(self.player_program.clone(), self.player_args.clone())
    }
}

impl SeedstreamConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("SEEDSTREAM_CACHE_DIR") {
            if !dir.trim().is_empty() {
                config.storage.cache_dir = PathBuf::from(dir);
            }
        }

        if let Ok(command) = std::env::var("SEEDSTREAM_PLAYER") {
            if let Some(playback) = PlaybackConfig::from_command(&command) {
                config.playback = playback;
            }
        }

        if let Some(millis) = env_u64("SEEDSTREAM_PIECE_POLL_MS") {
            config.stream.piece_poll_interval = Duration::from_millis(millis.max(1));
        }

        if let Some(seconds) = env_u64("SEEDSTREAM_METADATA_TIMEOUT_SECS") {
            config.stream.metadata_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        }

        if let Some(seconds) = env_u64("SEEDSTREAM_READ_TIMEOUT_SECS") {
            config.stream.piece_read_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        }

        if let Some(megabytes) = env_u64("SEEDSTREAM_BUFFER_BUDGET_MB") {
            if megabytes > 0 {
                config.stream.buffer_budget = megabytes.saturating_mul(1024 * 1024);
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short fallback intervals keep tests fast; timeouts stay unbounded so a
    /// test that hangs is a real bug.
    pub fn for_testing() -> Self {
        Self {
            stream: StreamConfig {
                piece_poll_interval: Duration::from_millis(10),
                metadata_poll_interval: Duration::from_millis(10),
                ..StreamConfig::default()
            },
            storage: StorageConfig {
                cache_dir: std::env::temp_dir().join("seedstream-test-cache"),
            },
            ..Default::default()
        }
    }

    /// Replaces the cache directory.
    pub fn with_cache_dir(mut self, cache_dir: impl AsRef<Path>) -> Self {
        self.storage.cache_dir = cache_dir.as_ref().to_path_buf();
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SeedstreamConfig::default();

        assert_eq!(config.stream.buffer_budget, 40 * 1024 * 1024);
        assert_eq!(config.stream.piece_poll_interval, Duration::from_millis(500));
        assert_eq!(config.stream.metadata_poll_interval, Duration::from_secs(10));
        assert_eq!(config.stream.metadata_timeout, None);
        assert_eq!(config.stream.piece_read_timeout, None);
        assert_eq!(config.storage.cache_dir, PathBuf::from("/var/tmp/cache"));
        assert_eq!(config.playback.player_program, "vlc");
        assert_eq!(config.playback.player_args, vec!["-".to_string()]);
    }

    #[test]
    fn test_player_command_parsing() {
        let playback = PlaybackConfig::from_command("mpv --cache=yes -").unwrap();
        assert_eq!(playback.player_program, "mpv");
        assert_eq!(playback.player_args, vec!["--cache=yes", "-"]);
        assert!(PlaybackConfig::from_command("   ").is_none());
    }

    #[test]
    fn test_testing_preset() {
        let config = SeedstreamConfig::for_testing().with_cache_dir("/tmp/elsewhere");
        assert_eq!(config.stream.piece_poll_interval, Duration::from_millis(10));
        assert_eq!(config.storage.cache_dir, PathBuf::from("/tmp/elsewhere"));
        assert_eq!(config.stream.metadata_timeout, None);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SEEDSTREAM_CACHE_DIR", "/srv/seedstream");
            std::env::set_var("SEEDSTREAM_PLAYER", "mpv -");
            std::env::set_var("SEEDSTREAM_PIECE_POLL_MS", "250");
            std::env::set_var("SEEDSTREAM_METADATA_TIMEOUT_SECS", "90");
            std::env::set_var("SEEDSTREAM_READ_TIMEOUT_SECS", "0");
            std::env::set_var("SEEDSTREAM_BUFFER_BUDGET_MB", "8");
        }

        let config = SeedstreamConfig::from_env();

        assert_eq!(config.storage.cache_dir, PathBuf::from("/srv/seedstream"));
        assert_eq!(config.playback.player_program, "mpv");
        assert_eq!(config.stream.piece_poll_interval, Duration::from_millis(250));
        assert_eq!(config.stream.metadata_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.stream.piece_read_timeout, None);
        assert_eq!(config.stream.buffer_budget, 8 * 1024 * 1024);

        // Cleanup
        unsafe {
            std::env::remove_var("SEEDSTREAM_CACHE_DIR");
            std::env::remove_var("SEEDSTREAM_PLAYER");
            std::env::remove_var("SEEDSTREAM_PIECE_POLL_MS");
            std::env::remove_var("SEEDSTREAM_METADATA_TIMEOUT_SECS");
            std::env::remove_var("SEEDSTREAM_READ_TIMEOUT_SECS");
            std::env::remove_var("SEEDSTREAM_BUFFER_BUDGET_MB");
        }
    }
}
