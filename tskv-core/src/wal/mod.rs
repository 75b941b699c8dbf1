//! Write-Ahead Log (WAL) implementation
//!
//! Every mutation of the embedded store is written to the WAL before it
//! becomes visible. On open the WAL is replayed to rebuild the dictionary,
//! partition catalog, row tables and latest-value table.

mod entry;
mod reader;
mod writer;

pub use entry::{WalEntry, WalEntryType, WalRecord};
pub use reader::WalReader;
pub use writer::WalWriter;

use crate::{Result, TsError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// WAL sync policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

/// Names the segment a complete snapshot starts in. Recovery ignores
/// every older segment.
const CHECKPOINT_FILE: &str = "CHECKPOINT";

fn segment_file_name(segment_id: u64) -> String {
    format!("wal_{:020}.log", segment_id)
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

/// Record `segment_id` as the replay start. The marker is replaced by
/// rename so a reader sees either the old or the new value.
fn write_checkpoint(dir: &Path, segment_id: u64) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", CHECKPOINT_FILE));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(segment_id.to_string().as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(CHECKPOINT_FILE))?;
    Ok(())
}

/// First segment to replay, `None` when no checkpoint was ever taken
fn read_checkpoint(dir: &Path) -> Result<Option<u64>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)?;
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| TsError::Corruption(format!("invalid checkpoint marker '{}'", raw.trim())))
}
