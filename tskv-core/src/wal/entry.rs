//! WAL entry types and serialization

use crate::storage::{LatestRow, StoredRow};
use crate::{EntityId, KeyId, Result, Timestamp, TsError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// WAL entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// Dictionary row inserted
    KeyInserted = 1,
    /// Partition bucket created
    PartitionCreated = 2,
    /// Partition bucket dropped with all its rows
    PartitionDropped = 3,
    /// Historical row inserted or replaced
    RowUpserted = 4,
    /// Historical rows of one key removed over a range
    RowsDeleted = 5,
    /// Rows past their TTL removed
    ExpiredPurged = 6,
    /// Latest value replaced
    LatestUpserted = 7,
    /// Latest value removed
    LatestDeleted = 8,
}

impl TryFrom<u8> for WalEntryType {
    type Error = TsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::KeyInserted),
            2 => Ok(WalEntryType::PartitionCreated),
            3 => Ok(WalEntryType::PartitionDropped),
            4 => Ok(WalEntryType::RowUpserted),
            5 => Ok(WalEntryType::RowsDeleted),
            6 => Ok(WalEntryType::ExpiredPurged),
            7 => Ok(WalEntryType::LatestUpserted),
            8 => Ok(WalEntryType::LatestDeleted),
            _ => Err(TsError::InvalidFormat(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// A store mutation as persisted in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    KeyInserted {
        key: String,
        key_id: KeyId,
    },
    PartitionCreated {
        start: Timestamp,
        end: Timestamp,
    },
    PartitionDropped {
        start: Timestamp,
    },
    RowUpserted {
        partition: Timestamp,
        row: StoredRow,
    },
    RowsDeleted {
        entity_id: EntityId,
        key_id: KeyId,
        start: Timestamp,
        end: Timestamp,
    },
    ExpiredPurged {
        now: Timestamp,
    },
    LatestUpserted {
        row: LatestRow,
    },
    LatestDeleted {
        entity_id: EntityId,
        key_id: KeyId,
    },
}

impl WalRecord {
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            WalRecord::KeyInserted { .. } => WalEntryType::KeyInserted,
            WalRecord::PartitionCreated { .. } => WalEntryType::PartitionCreated,
            WalRecord::PartitionDropped { .. } => WalEntryType::PartitionDropped,
            WalRecord::RowUpserted { .. } => WalEntryType::RowUpserted,
            WalRecord::RowsDeleted { .. } => WalEntryType::RowsDeleted,
            WalRecord::ExpiredPurged { .. } => WalEntryType::ExpiredPurged,
            WalRecord::LatestUpserted { .. } => WalEntryType::LatestUpserted,
            WalRecord::LatestDeleted { .. } => WalEntryType::LatestDeleted,
        }
    }
}

/// A single WAL entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Entry type
    pub entry_type: WalEntryType,
    /// Entry payload (bincode encoded record)
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Encode a store mutation
    pub fn from_record(record: &WalRecord) -> Result<Self> {
        let payload = bincode::serialize(record)?;
        Ok(Self {
            entry_type: record.entry_type(),
            payload,
        })
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - 1 byte: entry type
    /// - 4 bytes: payload length
    /// - N bytes: payload
    /// - 4 bytes: CRC32 checksum
    pub fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(13 + self.payload.len());

        // Reserve space for length prefix
        buf.put_u32_le(0);

        buf.put_u8(self.entry_type as u8);

        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        // Checksum covers everything after the length prefix
        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Deserialize entry from bytes, validating checksum
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(TsError::InvalidFormat("Entry too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data);

        let len = cursor.get_u32_le() as usize;
        if len < 9 {
            return Err(TsError::Corruption(format!("Entry length {} too small", len)));
        }
        if data.len() < 4 + len {
            return Err(TsError::InvalidFormat("Incomplete entry".into()));
        }

        let entry_data = &data[4..4 + len];

        let expected_checksum = {
            let mut c = std::io::Cursor::new(&entry_data[entry_data.len() - 4..]);
            c.get_u32_le()
        };
        let actual_checksum = crc32fast::hash(&entry_data[..entry_data.len() - 4]);

        if expected_checksum != actual_checksum {
            return Err(TsError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let mut cursor = std::io::Cursor::new(entry_data);

        let entry_type = WalEntryType::try_from(cursor.get_u8())?;

        let payload_len = cursor.get_u32_le() as usize;
        let pos = cursor.position() as usize;
        if pos + payload_len + 4 != entry_data.len() {
            return Err(TsError::Corruption(format!(
                "Payload length {} does not match entry length {}",
                payload_len, len
            )));
        }
        let payload = entry_data[pos..pos + payload_len].to_vec();

        Ok((
            WalEntry {
                entry_type,
                payload,
            },
            4 + len,
        ))
    }

    /// Decode the store mutation carried by this entry
    pub fn record(&self) -> Result<WalRecord> {
        let record: WalRecord = bincode::deserialize(&self.payload)?;
        if record.entry_type() != self.entry_type {
            return Err(TsError::Corruption(format!(
                "Entry tagged {:?} carries a {:?} record",
                self.entry_type,
                record.entry_type()
            )));
        }
        Ok(record)
    }
}
