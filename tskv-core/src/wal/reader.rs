//! WAL reader for recovery

use super::{WalConfig, WalEntry};
use crate::{Result, TsError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// WAL reader for recovering entries after crash
pub struct WalReader {
    config: WalConfig,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(config: WalConfig) -> Self {
        Self { config }
    }

    /// Recover all entries from WAL segments, oldest segment first.
    ///
    /// Replay starts at the last checkpoint; segments older than it are
    /// leftovers of an interrupted truncation and are skipped.
    pub fn recover(&self) -> Result<Vec<WalEntry>> {
        let checkpoint = super::read_checkpoint(&self.config.dir)?.unwrap_or(0);
        let segments = self.find_segments()?;
        let mut entries = Vec::new();

        for segment_path in segments {
            if super::parse_segment_id(&segment_path).unwrap_or(0) < checkpoint {
                warn!(
                    "Skipping {:?}, older than checkpoint segment {}",
                    segment_path, checkpoint
                );
                continue;
            }
            let segment_entries = self.read_segment(&segment_path)?;
            info!(
                "Recovered {} entries from {:?}",
                segment_entries.len(),
                segment_path
            );
            entries.extend(segment_entries);
        }

        Ok(entries)
    }

    fn find_segments(&self) -> Result<Vec<PathBuf>> {
        let mut segments = Vec::new();

        if !self.config.dir.exists() {
            return Ok(segments);
        }

        for entry in fs::read_dir(&self.config.dir)? {
            let path = entry?.path();
            if super::parse_segment_id(&path).is_some() {
                segments.push(path);
            }
        }

        segments.sort_by_key(|p| super::parse_segment_id(p).unwrap_or(0));

        Ok(segments)
    }

    fn read_segment(&self, path: &Path) -> Result<Vec<WalEntry>> {
        let data = fs::read(path)?;

        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::deserialize_with_checksum(&data[offset..]) {
                Ok((entry, bytes_read)) => {
                    entries.push(entry);
                    offset += bytes_read;
                }
                Err(TsError::ChecksumMismatch { .. }) | Err(TsError::Corruption(_)) => {
                    // Corrupted entry, skip rest of segment
                    warn!(
                        "Corrupt entry at offset {} in {:?}, truncating",
                        offset, path
                    );
                    break;
                }
                Err(TsError::InvalidFormat(_)) => {
                    // Incomplete entry at end (crash during write)
                    warn!("Torn entry at offset {} in {:?}, truncating", offset, path);
                    break;
                }
                Err(e) => {
                    return Err(e);
                }
            }
        }

        Ok(entries)
    }
}
