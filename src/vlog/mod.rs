//! Value Log Module
//!
//! Append-only store for values too large to keep inline in the index
//! (key-value separation). Entries are addressed by (fid, offset, size).
//!
//! ## Record Format
//! ```text
//! ┌─────────┬──────────┬──────────┬─────────────┬─────┬───────┐
//! │ CRC (4) │KeyLen (4)│ValLen (4)│ExpiresAt (8)│ Key │ Value │
//! └─────────┴──────────┴──────────┴─────────────┴─────┴───────┘
//! ```
//! CRC covers everything after itself. ExpiresAt 0 means "never".

mod log;

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

pub use log::FileValueLog;

/// Record header: CRC (4) + KeyLen (4) + ValLen (4) + ExpiresAt (8)
pub const RECORD_HEADER_SIZE: usize = 20;

/// Suffix of value log segment files
pub const VLOG_SUFFIX: &str = "vlog";

/// One value stored out of line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueLogEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expires_at: Option<u64>,
}

/// Where an entry was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuePos {
    pub fid: u32,
    pub offset: u64,
    pub size: u32,
}

/// Append-only value store used by the flush path and the read path
pub trait ValueLog: Send + Sync {
    /// Append an entry; the returned position is readable immediately
    fn write(&self, entry: &ValueLogEntry) -> Result<ValuePos>;

    /// Read the entry of `size` bytes at `offset` in segment `fid`
    fn read(&self, fid: u32, size: u32, offset: u64) -> Result<ValueLogEntry>;

    /// fsync everything written so far
    fn sync(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

impl ValueLogEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(RECORD_HEADER_SIZE + self.key.len() + self.value.len());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.expires_at.unwrap_or(0).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        let crc = crc32fast::hash(&buf[4..]);
        buf[0..4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(KvError::ValueLog(format!(
                "record too short: {} bytes",
                buf.len()
            )));
        }

        let crc = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if crc32fast::hash(&buf[4..]) != crc {
            return Err(KvError::ValueLog("record CRC mismatch".into()));
        }

        let key_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let val_len = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        let expires_at = u64::from_le_bytes(buf[12..20].try_into().unwrap());

        if RECORD_HEADER_SIZE + key_len + val_len != buf.len() {
            return Err(KvError::ValueLog(format!(
                "record length mismatch: header says {}, got {}",
                RECORD_HEADER_SIZE + key_len + val_len,
                buf.len()
            )));
        }

        let key_end = RECORD_HEADER_SIZE + key_len;
        Ok(Self {
            key: buf[RECORD_HEADER_SIZE..key_end].to_vec(),
            value: buf[key_end..].to_vec(),
            expires_at: (expires_at != 0).then_some(expires_at),
        })
    }
}
