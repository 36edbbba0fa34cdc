//! Generated transfer content served by the simulated swarm.

use bytes::Bytes;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use seedstream_core::swarm::{FileEntry, InfoHash, PieceIndex, TorrentInfo, TransferDescriptor};
use sha1::{Digest, Sha1};

use crate::SimulationError;

/// Deterministic transfer content: metadata plus the bytes of every file.
///
/// Files are laid out back to back in one piece space, exactly as a swarm
/// engine would see them. The info hash is derived from the name, layout and
/// bytes, so identical content always yields the same descriptor.
#[derive(Debug, Clone)]
pub struct SimulatedContent {
    info: TorrentInfo,
    data: Bytes,
    info_hash: InfoHash,
}

impl SimulatedContent {
    /// Single file named after the transfer, filled with seeded random bytes.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidContent` - Empty name, zero piece length or zero size
    pub fn single_file(
        name: &str,
        size: u64,
        piece_length: u64,
        seed: u64,
    ) -> Result<Self, SimulationError> {
        Self::multi_file(name, piece_length, &[(name, size)], seed)
    }

    /// Several files in the given order, filled with seeded random bytes.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidContent` - Empty name, zero piece length or no bytes
    pub fn multi_file(
        name: &str,
        piece_length: u64,
        files: &[(&str, u64)],
        seed: u64,
    ) -> Result<Self, SimulationError> {
        let total: u64 = files.iter().map(|(_, size)| size).sum();
        let mut data = vec![0u8; usize::try_from(total).map_err(|_| {
            SimulationError::InvalidContent {
                reason: format!("{total} bytes do not fit in memory"),
            }
        })?];
        ChaCha8Rng::seed_from_u64(seed).fill_bytes(&mut data);

        let files = files
            .iter()
            .map(|(path, size)| ((*path).to_string(), *size))
            .collect::<Vec<_>>();
        Self::from_parts(name, piece_length, files, Bytes::from(data))
    }

    /// Content from explicit bytes. `files` sizes must add up to `data.len()`.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidContent` - Inconsistent layout or empty content
    pub fn from_parts(
        name: &str,
        piece_length: u64,
        files: Vec<(String, u64)>,
        data: Bytes,
    ) -> Result<Self, SimulationError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            return Err(SimulationError::InvalidContent {
                reason: format!("transfer name {name:?} is not a plain file name"),
            });
        }
        if piece_length == 0 {
            return Err(SimulationError::InvalidContent {
                reason: "piece length is zero".to_string(),
            });
        }

        let mut entries = Vec::with_capacity(files.len());
        let mut offset = 0u64;
        for (path, size) in files {
            entries.push(FileEntry { path, offset, size });
            offset += size;
        }
        if offset == 0 || offset != data.len() as u64 {
            return Err(SimulationError::InvalidContent {
                reason: format!("layout covers {offset} bytes, content has {}", data.len()),
            });
        }

        let piece_count = u32::try_from(offset.div_ceil(piece_length)).map_err(|_| {
            SimulationError::InvalidContent {
                reason: "too many pieces".to_string(),
            }
        })?;

        let mut hasher = Sha1::new();
        hasher.update(name.as_bytes());
        hasher.update(piece_length.to_le_bytes());
        hasher.update(&data);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());
        let info_hash = InfoHash::new(hash);

        Ok(Self {
            info: TorrentInfo {
                name: name.to_string(),
                piece_length,
                piece_count,
                files: entries,
            },
            data,
            info_hash,
        })
    }

    /// Info hash derived from the content.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Transfer metadata.
    pub fn torrent_info(&self) -> &TorrentInfo {
        &self.info
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> u32 {
        self.info.piece_count
    }

    /// Bytes per piece.
    pub fn piece_length(&self) -> u64 {
        self.info.piece_length
    }

    /// Raw bytes of one piece; the last piece may be short.
    pub fn piece(&self, index: PieceIndex) -> Option<Bytes> {
        if index.as_u32() >= self.info.piece_count {
            return None;
        }
        let start = index.as_u32() as u64 * self.info.piece_length;
        let end = (start + self.info.piece_length).min(self.data.len() as u64);
        Some(self.data.slice(start as usize..end as usize))
    }

    /// Bytes of the file at `path`.
    pub fn file_bytes(&self, path: &str) -> Option<Bytes> {
        let file = self.info.files.iter().find(|file| file.path == path)?;
        let start = file.offset as usize;
        Some(self.data.slice(start..start + file.size as usize))
    }

    /// Magnet URI resolving to this content.
    pub fn magnet(&self) -> String {
        format!(
            "magnet:?xt=urn:btih:{}&dn={}",
            hex::encode(self.info_hash.as_bytes()),
            urlencoding::encode(&self.info.name)
        )
    }

    /// Parsed descriptor for this content.
    ///
    /// # Errors
    ///
    /// - `SimulationError::Swarm` - Generated magnet failed to parse
    pub fn descriptor(&self) -> Result<TransferDescriptor, SimulationError> {
        Ok(TransferDescriptor::parse(&self.magnet())?)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use seedstream_core::streaming::StreamOffset;

    use super::*;

    #[test]
    fn test_layout_and_pieces() {
        let content = SimulatedContent::multi_file(
            "season-one",
            16,
            &[("intro.mkv", 20), ("episode.mkv", 50)],
            7,
        )
        .unwrap();

        let info = content.torrent_info();
        assert_eq!(info.piece_count, 5);
        assert_eq!(info.files[1].offset, 20);
        assert_eq!(content.piece(PieceIndex::new(4)).unwrap().len(), 6);
        assert!(content.piece(PieceIndex::new(5)).is_none());
        assert_eq!(content.file_bytes("episode.mkv").unwrap().len(), 50);
    }

    #[test]
    fn test_same_seed_same_hash() {
        let first = SimulatedContent::single_file("clip", 100, 16, 3).unwrap();
        let second = SimulatedContent::single_file("clip", 100, 16, 3).unwrap();
        let other = SimulatedContent::single_file("clip", 100, 16, 4).unwrap();

        assert_eq!(first.info_hash(), second.info_hash());
        assert_ne!(first.info_hash(), other.info_hash());
    }

    #[test]
    fn test_descriptor_round_trips_through_magnet() {
        let content = SimulatedContent::single_file("Big Buck Bunny", 64, 16, 1).unwrap();
        let descriptor = content.descriptor().unwrap();

        assert_eq!(descriptor.info_hash, content.info_hash());
        assert!(content.magnet().contains("Big%20Buck%20Bunny"));
    }

    #[test]
    fn test_rejects_invalid_layouts() {
        assert!(SimulatedContent::single_file("clip", 0, 16, 1).is_err());
        assert!(SimulatedContent::single_file("clip", 10, 0, 1).is_err());
        assert!(SimulatedContent::single_file("../escape", 10, 4, 1).is_err());
        assert!(
            SimulatedContent::from_parts(
                "clip",
                4,
                vec![("a".to_string(), 3)],
                Bytes::from_static(b"ab")
            )
            .is_err()
        );
    }

    proptest! {
        #[test]
        fn trimmed_pieces_rebuild_every_file(
            piece_length in 1u64..64,
            sizes in prop::collection::vec(1u64..200, 1..5),
            seed in any::<u64>(),
        ) {
            let layout: Vec<(String, u64)> = sizes
                .iter()
                .enumerate()
                .map(|(position, size)| (format!("part-{position}.mkv"), *size))
                .collect();
            let files: Vec<(&str, u64)> = layout
                .iter()
                .map(|(path, size)| (path.as_str(), *size))
                .collect();
            let content = SimulatedContent::multi_file("bundle", piece_length, &files, seed).unwrap();

            for file in &content.torrent_info().files {
                let offset = StreamOffset::calculate(piece_length, file).unwrap();
                let mut rebuilt = Vec::new();
                for raw in offset.fetch_range() {
                    let index = PieceIndex::new(raw);
                    let piece = content.piece(index).unwrap();
                    rebuilt.extend_from_slice(&offset.trim(index, piece));
                }
                prop_assert_eq!(rebuilt, content.file_bytes(&file.path).unwrap().to_vec());
            }
        }
    }
}
