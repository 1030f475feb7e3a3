//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries and their framing.

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

/// Frame header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// A single entry in a WAL segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing within a segment
    pub lsn: u64,

    /// The operation to replay
    pub operation: Operation,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Put a key-value pair, optionally expiring at an absolute unix time
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        expires_at: Option<u64>,
    },

    /// Delete a key (tombstone)
    Delete { key: Vec<u8> },
}

impl WalEntry {
    pub fn new(lsn: u64, operation: Operation) -> Self {
        Self { lsn, operation }
    }

    /// Encode as a framed record: [lsn(8)][crc(4)][len(4)][bincode payload]
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&self.operation)?;
        let crc = crc32fast::hash(&payload);

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode one framed record from the front of `buf`.
    ///
    /// Returns the entry and the number of bytes consumed, `Ok(None)` if
    /// `buf` holds only part of a frame, or `WalCorruption` on CRC mismatch.
    pub fn deserialize(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let lsn = u64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice"));
        let crc = u32::from_le_bytes(buf[8..12].try_into().expect("4-byte slice"));
        let len = u32::from_le_bytes(buf[12..16].try_into().expect("4-byte slice")) as usize;

        let end = HEADER_SIZE + len;
        if buf.len() < end {
            return Ok(None);
        }

        let payload = &buf[HEADER_SIZE..end];
        if crc32fast::hash(payload) != crc {
            return Err(KvError::WalCorruption(format!(
                "CRC mismatch at lsn {}",
                lsn
            )));
        }

        let operation = bincode::deserialize(payload)?;
        Ok(Some((Self { lsn, operation }, end)))
    }
}
