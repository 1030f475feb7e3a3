//! WAL Reader
//!
//! Reads framed entries from a WAL segment, either from a buffered copy of
//! the file or through a memory map.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use memmap2::Mmap;

use crate::config::IoMode;
use crate::error::Result;

use super::WalEntry;

enum Source {
    Buffer(Vec<u8>),
    Mapped(Mmap),
}

impl Source {
    fn bytes(&self) -> &[u8] {
        match self {
            Source::Buffer(buf) => buf,
            Source::Mapped(map) => map,
        }
    }
}

/// Reads entries from a WAL segment
pub struct WalReader {
    source: Source,
    /// Offset of the next unread frame
    position: usize,
}

impl WalReader {
    /// Open a WAL segment for reading
    pub fn open(path: &Path, io_mode: IoMode) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();

        // Mapping a zero-length file is not portable.
        let source = if io_mode == IoMode::MMap && len > 0 {
            // SAFETY: segments are only appended to by their owning memtable,
            // which is not open while the segment is being replayed.
            Source::Mapped(unsafe { Mmap::map(&file)? })
        } else {
            let mut buf = Vec::with_capacity(len as usize);
            file.read_to_end(&mut buf)?;
            Source::Buffer(buf)
        };

        Ok(Self {
            source,
            position: 0,
        })
    }

    /// Read the next entry.
    ///
    /// `Ok(None)` means no complete frame remains; `position()` then marks
    /// the end of the valid prefix.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        let remaining = &self.source.bytes()[self.position..];
        match WalEntry::deserialize(remaining)? {
            Some((entry, used)) => {
                self.position += used;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Offset just past the last frame read
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    /// Total bytes in the segment
    pub fn len(&self) -> u64 {
        self.source.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over entries until the first incomplete or corrupt frame
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over WAL entries
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
