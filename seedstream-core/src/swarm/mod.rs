//! Boundary to the external swarm engine.
//!
//! The engine itself (peer wire, DHT, piece verification) lives outside this
//! crate. Everything the streaming core needs from it is expressed by the
//! traits in [`port`] and the plain data types defined here.

pub mod descriptor;
pub mod port;

use std::fmt;

use bytes::Bytes;

pub use descriptor::TransferDescriptor;
pub use port::{PieceFetchPort, SwarmEngine, SwarmHandle};

/// SHA-1 hash identifying a unique transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `SwarmError::InvalidDescriptor` - Wrong length or non-hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self, SwarmError> {
        let bytes = hex::decode(hex_str).map_err(|e| SwarmError::InvalidDescriptor {
            reason: format!("info hash {hex_str} is not valid hex: {e}"),
        })?;
        let hash: [u8; 20] =
            bytes
                .try_into()
                .map_err(|bytes: Vec<u8>| SwarmError::InvalidDescriptor {
                    reason: format!("info hash has {} bytes, expected 20", bytes.len()),
                })?;
        Ok(Self(hash))
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a usize for slice lookups.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-facing fetch hint for a single piece.
///
/// Discriminants match the engine's numeric levels: 0 means do not download,
/// 1 is the default level and 7 is the top level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PiecePriority {
    /// Not needed, must not consume swarm bandwidth
    Skip = 0,
    /// Fetchable opportunistically
    Normal = 1,
    /// Must be fetched now
    High = 7,
}

/// One file inside the transfer's concatenated piece space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the transfer root
    pub path: String,
    /// Byte offset of the file within the piece space
    pub offset: u64,
    /// File size in bytes
    pub size: u64,
}

/// Transfer metadata, available once the metadata handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    /// Transfer name, also the artifact name inside the save path
    pub name: String,
    /// Bytes per piece
    pub piece_length: u64,
    /// Total number of pieces
    pub piece_count: u32,
    /// Files in piece-space order
    pub files: Vec<FileEntry>,
}

impl TorrentInfo {
    /// Returns the largest file, the one most likely to be the media.
    pub fn largest_file(&self) -> Option<&FileEntry> {
        self.files.iter().max_by_key(|file| file.size)
    }

    /// Total size of the piece space in bytes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

/// Notification pushed by the engine whenever its state changes.
///
/// Events carry no payload beyond the index; consumers always re-query the
/// port, so a lagged receiver loses nothing but a wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmEvent {
    /// Metadata handshake finished
    MetadataReceived,
    /// Piece is now locally complete
    PieceFinished(PieceIndex),
    /// A read alert is waiting in the alert queue
    ReadReady(PieceIndex),
    /// Transfer was removed from the engine
    Removed,
}

/// Result of an asynchronous piece read, popped from the alert queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmAlert {
    /// Piece bytes are ready
    PieceRead {
        /// Index the engine read
        index: PieceIndex,
        /// Raw piece bytes
        data: Bytes,
    },
    /// The engine could not read the piece
    ReadFailed {
        /// Index the engine tried to read
        index: PieceIndex,
        /// Engine-provided reason
        reason: String,
    },
}

impl SwarmAlert {
    /// Piece index this alert refers to.
    pub fn index(&self) -> PieceIndex {
        match self {
            SwarmAlert::PieceRead { index, .. } | SwarmAlert::ReadFailed { index, .. } => *index,
        }
    }
}

/// Errors reported across the engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Invalid transfer descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("Transfer {info_hash} is not known to the engine")]
    UnknownTransfer { info_hash: InfoHash },

    #[error("Transfer has already been removed")]
    TransferRemoved,

    #[error("Engine failure: {reason}")]
    Engine { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
