//! File-backed value log
//!
//! Segments are named "{fid:09}.vlog". Writes append to the newest segment
//! and roll over to a new one when the block size would be exceeded.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::IoMode;
use crate::error::{KvError, Result};

use super::{ValueLog, ValueLogEntry, ValuePos, VLOG_SUFFIX};

/// The segment currently receiving appends
struct ActiveSegment {
    fid: u32,
    file: File,
    /// End of the last complete record
    offset: u64,
}

impl ActiveSegment {
    /// Append one record and return its offset.
    ///
    /// Bytes past `offset` belong to no record (a write that failed part
    /// way, or a torn tail); they are cut off before appending so every
    /// returned offset matches the file.
    fn append(&mut self, record: &[u8]) -> Result<u64> {
        if self.file.metadata()?.len() != self.offset {
            warn!(
                fid = self.fid,
                offset = self.offset,
                "truncating partial value log record"
            );
            self.file.set_len(self.offset)?;
        }

        let offset = self.offset;
        if let Err(e) = self.file.write_all(record) {
            if let Err(trunc) = self.file.set_len(offset) {
                warn!(fid = self.fid, error = %trunc, "could not truncate failed append");
            }
            return Err(e.into());
        }
        self.offset += record.len() as u64;
        Ok(offset)
    }
}

/// A cached read handle on one segment
enum SegmentReader {
    File(Mutex<File>),
    Mapped(Mmap),
}

/// Value log stored as a directory of append-only segment files
///
/// ## Concurrency:
/// - `active`: Mutex, one appender at a time
/// - `readers`: RwLock over cached read handles; concurrent reads of
///   different segments never contend
pub struct FileValueLog {
    dir: PathBuf,
    block_size: u64,
    io_mode: IoMode,
    active: Mutex<ActiveSegment>,
    readers: RwLock<HashMap<u32, Arc<SegmentReader>>>,
}

impl FileValueLog {
    /// Open or create a value log in `dir`
    ///
    /// Appends continue at the end of the newest existing segment.
    pub fn open(dir: &Path, block_size: u64, io_mode: IoMode) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut fids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(fid) = Self::parse_segment_fid(&path) {
                fids.push(fid);
            }
        }
        fids.sort_unstable();

        let fid = fids.last().copied().unwrap_or(0);
        let file = Self::open_segment(dir, fid)?;
        let offset = file.metadata()?.len();

        info!(
            dir = %dir.display(),
            segments = fids.len(),
            active_fid = fid,
            "opened value log"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            block_size,
            io_mode,
            active: Mutex::new(ActiveSegment { fid, file, offset }),
            readers: RwLock::new(HashMap::new()),
        })
    }

    /// Fid of the segment receiving appends
    pub fn active_fid(&self) -> u32 {
        self.active.lock().fid
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn segment_path(dir: &Path, fid: u32) -> PathBuf {
        dir.join(format!("{:09}.{}", fid, VLOG_SUFFIX))
    }

    fn parse_segment_fid(path: &Path) -> Option<u32> {
        if path.extension()? != VLOG_SUFFIX {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    fn open_segment(dir: &Path, fid: u32) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(Self::segment_path(dir, fid))?)
    }

    /// Get a read handle able to serve `[offset, end)` of segment `fid`
    fn reader(&self, fid: u32, end: u64) -> Result<Arc<SegmentReader>> {
        if let Some(reader) = self.readers.read().get(&fid) {
            // A map taken before the segment grew cannot serve the new tail.
            let stale = matches!(reader.as_ref(), SegmentReader::Mapped(m) if (m.len() as u64) < end);
            if !stale {
                return Ok(Arc::clone(reader));
            }
        }

        let path = Self::segment_path(&self.dir, fid);
        let file = File::open(&path).map_err(|e| {
            KvError::ValueLog(format!("cannot open segment {}: {}", path.display(), e))
        })?;

        let reader = match self.io_mode {
            IoMode::FileIo => SegmentReader::File(Mutex::new(file)),
            IoMode::MMap => {
                // SAFETY: segments are append-only; bytes below `end` never change.
                SegmentReader::Mapped(unsafe { Mmap::map(&file)? })
            }
        };

        let reader = Arc::new(reader);
        self.readers.write().insert(fid, Arc::clone(&reader));
        Ok(reader)
    }
}

impl ValueLog for FileValueLog {
    fn write(&self, entry: &ValueLogEntry) -> Result<ValuePos> {
        let record = entry.encode();
        let size = u32::try_from(record.len())
            .map_err(|_| KvError::ValueLog(format!("record too large: {}", record.len())))?;

        let mut active = self.active.lock();
        if active.offset > 0 && active.offset + record.len() as u64 > self.block_size {
            active.file.sync_all()?;
            let fid = active.fid + 1;
            let file = Self::open_segment(&self.dir, fid)?;
            let offset = file.metadata()?.len();
            debug!(fid, "rolled value log segment");
            *active = ActiveSegment { fid, file, offset };
        }

        let offset = active.append(&record)?;

        Ok(ValuePos {
            fid: active.fid,
            offset,
            size,
        })
    }

    fn read(&self, fid: u32, size: u32, offset: u64) -> Result<ValueLogEntry> {
        let end = offset + size as u64;
        let reader = self.reader(fid, end)?;

        match reader.as_ref() {
            SegmentReader::File(file) => {
                let mut buf = vec![0u8; size as usize];
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf)?;
                ValueLogEntry::decode(&buf)
            }
            SegmentReader::Mapped(map) => {
                let bytes = map.get(offset as usize..end as usize).ok_or_else(|| {
                    KvError::ValueLog(format!(
                        "read past end of segment {}: {}..{}",
                        fid, offset, end
                    ))
                })?;
                ValueLogEntry::decode(bytes)
            }
        }
    }

    fn sync(&self) -> Result<()> {
        self.active.lock().file.sync_data()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.active.lock().file.sync_all()?;
        self.readers.write().clear();
        Ok(())
    }
}
