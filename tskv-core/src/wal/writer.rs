//! WAL writer implementation

use super::{SyncPolicy, WalConfig, WalEntry};
use crate::{Result, TsError};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// WAL writer for appending entries to disk
pub struct WalWriter {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
    current_offset: AtomicU64,
}

struct WalWriterInner {
    file: BufWriter<File>,
    segment_id: u64,
    bytes_written: usize,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Create a new WAL writer, continuing after the newest segment
    pub fn new(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        // Never append to a segment that may end in a torn entry
        let segment_id = Self::find_latest_segment(&config.dir)? + 1;
        let file = Self::open_segment(&config.dir, segment_id)?;

        let inner = WalWriterInner {
            file: BufWriter::new(file),
            segment_id,
            bytes_written: 0,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        };

        Ok(Self {
            config,
            inner: Mutex::new(inner),
            current_offset: AtomicU64::new(0),
        })
    }

    /// Append an entry to the WAL
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        self.append_with(entry, || ())
    }

    /// Append an entry and run `apply` before releasing the log.
    ///
    /// `apply` only runs once the entry is written (and synced when the
    /// policy asks for it), so the log order is the apply order.
    pub fn append_with<T>(&self, entry: &WalEntry, apply: impl FnOnce() -> T) -> Result<T> {
        let serialized = entry.serialize_with_checksum();
        let mut inner = self.inner.lock();

        if inner.bytes_written > 0
            && inner.bytes_written + serialized.len() > self.config.segment_size
        {
            self.rotate_segment(&mut inner)?;
        }

        inner.file.write_all(&serialized)?;
        inner.bytes_written += serialized.len();
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        }

        self.current_offset
            .fetch_add(serialized.len() as u64, Ordering::Relaxed);
        Ok(apply())
    }

    /// Replace the whole log with `entries`.
    ///
    /// Rotates to a fresh segment, writes and syncs the entries, records
    /// that segment as the replay start, then removes every older segment.
    /// A crash at any point leaves a log that replays to the same state.
    pub fn rewrite(&self, entries: &[WalEntry]) -> Result<usize> {
        let mut inner = self.inner.lock();
        self.rotate_segment(&mut inner)?;

        for entry in entries {
            let serialized = entry.serialize_with_checksum();
            inner.file.write_all(&serialized)?;
            inner.bytes_written += serialized.len();
        }
        Self::sync_inner(&mut inner)?;
        super::write_checkpoint(&self.config.dir, inner.segment_id)?;

        let removed = self.truncate_before(inner.segment_id)?;
        info!(
            "Rewrote WAL into segment {} with {} entries, removed {} old segments",
            inner.segment_id,
            entries.len(),
            removed
        );
        Ok(removed)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    /// Get current segment ID
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// Total bytes appended since open
    pub fn bytes_appended(&self) -> u64 {
        self.current_offset.load(Ordering::Relaxed)
    }

    /// Remove every segment older than `segment_id`, oldest first
    pub fn truncate_before(&self, segment_id: u64) -> Result<usize> {
        let mut old = Vec::new();
        for entry in fs::read_dir(&self.config.dir)? {
            let path = entry?.path();
            if let Some(id) = super::parse_segment_id(&path) {
                if id < segment_id {
                    old.push((id, path));
                }
            }
        }
        old.sort();

        for (_, path) in &old {
            fs::remove_file(path)?;
        }
        Ok(old.len())
    }

    fn sync_inner(inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<()> {
        Self::sync_inner(inner)?;

        inner.segment_id += 1;
        let file = Self::open_segment(&self.config.dir, inner.segment_id)?;
        inner.file = BufWriter::new(file);
        inner.bytes_written = 0;
        debug!("Rotated WAL to segment {}", inner.segment_id);

        Ok(())
    }

    fn find_latest_segment(dir: &Path) -> Result<u64> {
        let mut max_id = 0u64;
        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                if let Some(id) = super::parse_segment_id(&entry?.path()) {
                    max_id = max_id.max(id);
                }
            }
        }
        Ok(max_id)
    }

    fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
        let path = dir.join(super::segment_file_name(segment_id));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(TsError::Io)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().file.flush();
    }
}
