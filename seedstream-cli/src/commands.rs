//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Subcommand, ValueEnum};
use seedstream_core::SeedstreamError;
use seedstream_core::config::SeedstreamConfig;
use seedstream_core::streaming::{FileTarget, PlaybackTarget, StreamOffset, StreamSession};
use seedstream_core::swarm::{FileEntry, TransferDescriptor};
use seedstream_sim::{SimulatedContent, SimulatedSwarm, SwarmProfile};

const MIB: u64 = 1024 * 1024;
const KIB: u64 = 1024;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a generated file through the simulated swarm
    Simulate {
        /// Size of the generated media file in MiB
        #[arg(long, default_value = "8")]
        size_mb: u64,
        /// Piece length in KiB
        #[arg(long, default_value = "256")]
        piece_kb: u64,
        /// Seed for content and swarm behavior
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Swarm behavior preset
        #[arg(long, value_enum, default_value_t = ProfilePreset::Steady)]
        profile: ProfilePreset,
        /// Write the stream to this file instead of the configured player
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Cache directory override
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Show the piece window for a file inside a transfer
    Offset {
        /// Piece length in bytes
        piece_length: u64,
        /// Byte offset of the file within the transfer
        offset: u64,
        /// File size in bytes
        size: u64,
        /// Buffer budget in MiB
        #[arg(long, default_value = "40")]
        budget_mb: u64,
    },
    /// Parse a magnet link and show the transfer descriptor
    Inspect {
        /// Magnet link
        magnet: String,
        /// Catalog page the link came from
        #[arg(long)]
        source_url: Option<String>,
    },
}

/// Swarm behavior presets for the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProfilePreset {
    /// Pieces arrive instantly
    Instant,
    /// Steady trickle of pieces
    Steady,
    /// Slow pieces with reordered and unrequested reads
    Congested,
}

impl ProfilePreset {
    fn profile(self, seed: u64) -> SwarmProfile {
        let profile = match self {
            ProfilePreset::Instant => SwarmProfile::instant(),
            ProfilePreset::Steady => SwarmProfile::default(),
            ProfilePreset::Congested => SwarmProfile::congested(),
        };
        profile.with_seed(seed)
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate {
            size_mb,
            piece_kb,
            seed,
            profile,
            output,
            cache_dir,
        } => run_simulation(size_mb, piece_kb, seed, profile, output, cache_dir).await,
        Commands::Offset {
            piece_length,
            offset,
            size,
            budget_mb,
        } => show_offset(piece_length, offset, size, budget_mb),
        Commands::Inspect { magnet, source_url } => inspect_descriptor(&magnet, source_url),
    }
}

/// Stream a generated file through the simulated swarm
///
/// # Errors
/// - Invalid content sizes
/// - Any streaming failure of the session
async fn run_simulation(
    size_mb: u64,
    piece_kb: u64,
    seed: u64,
    preset: ProfilePreset,
    output: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = SeedstreamConfig::from_env();
    if let Some(dir) = cache_dir {
        config = config.with_cache_dir(dir);
    }

    let content = SimulatedContent::multi_file(
        "Big Buck Bunny",
        piece_kb.saturating_mul(KIB),
        &[
            ("sample.mkv", size_mb.saturating_mul(MIB) / 10),
            ("movie.mkv", size_mb.saturating_mul(MIB)),
            ("movie.srt", 64 * KIB),
        ],
        seed,
    )
    .context("failed to generate simulated content")?;

    let swarm = Arc::new(SimulatedSwarm::new(preset.profile(seed)));
    let descriptor = swarm.register(content)?;

    let target: Arc<dyn PlaybackTarget> = match output {
        Some(path) => Arc::new(FileTarget::new(path)),
        None => Arc::new(config.playback.player()),
    };
    println!("Streaming {} into {}", descriptor.label(), target.describe());

    let session = StreamSession::new(swarm, config);
    let report = session
        .stream(&descriptor, target)
        .await
        .map_err(with_user_message)?;

    println!("Session {}", report.session_id);
    println!("  File:            {}", report.file_path);
    println!("  Pieces written:  {}", report.pieces_written);
    println!(
        "  Bytes written:   {} ({:.2} MiB)",
        report.bytes_written,
        report.bytes_written as f64 / MIB as f64
    );
    println!("  Barrier rounds:  {}", report.rounds_completed);
    println!(
        "  Playback:        {}",
        if report.playback_launched {
            "launched"
        } else {
            "not launched"
        }
    );
    println!(
        "  Cleanup:         {}",
        if report.cleanup_succeeded {
            "released"
        } else {
            "failed, see log"
        }
    );

    Ok(())
}

/// Keeps the full error chain for the log while leading with the user-facing message.
fn with_user_message(error: impl Into<SeedstreamError>) -> anyhow::Error {
    let error = error.into();
    let message = error.user_message();
    anyhow::Error::new(error).context(message)
}

/// Show the piece window for a file inside a transfer
///
/// # Errors
/// - Zero piece length or empty file
fn show_offset(piece_length: u64, offset: u64, size: u64, budget_mb: u64) -> anyhow::Result<()> {
    let file = FileEntry {
        path: "target".to_string(),
        offset,
        size,
    };
    let stream_offset = StreamOffset::with_budget(piece_length, &file, budget_mb.saturating_mul(MIB))
        .map_err(SeedstreamError::from)?;

    println!("Stream Offset");
    println!("{:-<40}", "");
    println!("Piece length:  {}", stream_offset.piece_length);
    println!("Piece start:   {}", stream_offset.piece_start);
    println!("Piece end:     {}", stream_offset.piece_end);
    println!("Last fetched:  {}", stream_offset.last_piece());
    println!("Pieces:        {}", stream_offset.piece_count());
    println!("Head trim:     {}", stream_offset.head_trim);
    println!("Tail trim:     {}", stream_offset.tail_trim);
    println!("Window:        {} pieces", stream_offset.window_piece_count);

    Ok(())
}

/// Parse a magnet link and show the transfer descriptor
///
/// # Errors
/// - Magnet link without a valid btih info hash
fn inspect_descriptor(magnet: &str, source_url: Option<String>) -> anyhow::Result<()> {
    let mut descriptor = TransferDescriptor::parse(magnet).map_err(with_user_message)?;
    if let Some(url) = source_url {
        descriptor = descriptor.with_source_url(url);
    }

    println!("Transfer Descriptor");
    println!("{:-<40}", "");
    println!("Info hash:  {}", descriptor.info_hash);
    println!(
        "Name:       {}",
        descriptor.display_name.as_deref().unwrap_or("(none)")
    );
    println!(
        "Source:     {}",
        descriptor.source_url.as_deref().unwrap_or("(none)")
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_simulate_defaults() {
        let cli = TestCli::parse_from(["seedstream", "simulate"]);
        match cli.command {
            Commands::Simulate {
                size_mb,
                piece_kb,
                profile,
                output,
                ..
            } => {
                assert_eq!(size_mb, 8);
                assert_eq!(piece_kb, 256);
                assert_eq!(profile, ProfilePreset::Steady);
                assert!(output.is_none());
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_offset_arguments() {
        let cli = TestCli::parse_from(["seedstream", "offset", "1048576", "512000", "2560000"]);
        assert!(matches!(
            cli.command,
            Commands::Offset {
                piece_length: 1_048_576,
                budget_mb: 40,
                ..
            }
        ));
    }

    #[test]
    fn test_offset_rejects_zero_piece_length() {
        assert!(show_offset(0, 0, 10, 40).is_err());
        assert!(show_offset(16, 0, 10, 40).is_ok());
    }

    #[test]
    fn test_inspect_rejects_bad_magnet() {
        assert!(inspect_descriptor("magnet:?dn=nothing", None).is_err());
    }

    #[tokio::test]
    async fn test_simulation_writes_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mkv");
        let cache = dir.path().join("cache");
        run_simulation(
            1,
            64,
            7,
            ProfilePreset::Instant,
            Some(output.clone()),
            Some(cache.clone()),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::metadata(&output).unwrap().len(), MIB);
        assert!(!cache.join("Big Buck Bunny").exists());
    }
}
