//! File-backed circular log: one preallocated file per resolution holding a
//! 16-byte header followed by `capacity` fixed-size slots.
//!
//! Header layout (little-endian):
//!
//! | off | field      |
//! |-----|------------|
//! | 0   | magic u32  |
//! | 4   | version u16|
//! | 6   | count u16  |
//! | 8   | head u16   |
//! | 10  | capacity   |
//! | 12  | entry size |
//! | 14  | reserved   |

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use super::bucket::Granularity;
use super::entry::HistoryRecord;
use super::ring::EntryLog;
use crate::error::HistoryError;

pub const HEADER_LEN: usize = 16;
pub const LOG_VERSION: u16 = 1;

pub const MAGIC_HOURLY: u32 = 0x454E_5648;
pub const MAGIC_DAILY: u32 = 0x454E_5644;
pub const MAGIC_MONTHLY: u32 = 0x454E_564D;

pub fn magic_for(g: Granularity) -> u32 {
    match g {
        Granularity::Hourly => MAGIC_HOURLY,
        Granularity::Daily => MAGIC_DAILY,
        Granularity::Monthly => MAGIC_MONTHLY,
    }
}

pub fn file_name(g: Granularity) -> &'static str {
    match g {
        Granularity::Hourly => "env_hourly.bin",
        Granularity::Daily => "env_daily.bin",
        Granularity::Monthly => "env_monthly.bin",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    magic: u32,
    version: u16,
    count: u16,
    head: u16,
    capacity: u16,
    entry_size: u16,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u16(&mut buf[4..6], self.version);
        LittleEndian::write_u16(&mut buf[6..8], self.count);
        LittleEndian::write_u16(&mut buf[8..10], self.head);
        LittleEndian::write_u16(&mut buf[10..12], self.capacity);
        LittleEndian::write_u16(&mut buf[12..14], self.entry_size);
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            magic: LittleEndian::read_u32(&buf[0..4]),
            version: LittleEndian::read_u16(&buf[4..6]),
            count: LittleEndian::read_u16(&buf[6..8]),
            head: LittleEndian::read_u16(&buf[8..10]),
            capacity: LittleEndian::read_u16(&buf[10..12]),
            entry_size: LittleEndian::read_u16(&buf[12..14]),
        }
    }
}

pub struct FlashLog<T: HistoryRecord> {
    file: File,
    path: PathBuf,
    capacity: u16,
    head: u16,
    count: u16,
    _entry: PhantomData<fn() -> T>,
}

impl<T: HistoryRecord> std::fmt::Debug for FlashLog<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashLog")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("head", &self.head)
            .field("count", &self.count)
            .finish()
    }
}

impl<T: HistoryRecord> FlashLog<T> {
    /// Open the log in `dir`, recreating it when the header does not match
    /// this record type and capacity.
    pub fn open(dir: &Path, capacity: u16) -> Result<Self, HistoryError> {
        let capacity = capacity.max(1);
        std::fs::create_dir_all(dir)?;
        let path = dir.join(file_name(T::GRANULARITY));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let expected_len = Self::file_len(capacity);
        let existing = Self::read_header(&mut file)?;
        let magic = magic_for(T::GRANULARITY);

        let mut log = Self {
            file,
            path,
            capacity,
            head: 0,
            count: 0,
            _entry: PhantomData,
        };

        match existing {
            Some(h)
                if h.magic == magic
                    && h.version == LOG_VERSION
                    && usize::from(h.entry_size) == T::SIZE
                    && h.capacity == capacity
                    && h.head < capacity
                    && h.count <= capacity =>
            {
                log.head = h.head;
                log.count = h.count;
                if log.file.metadata()?.len() != expected_len {
                    log.file.set_len(expected_len)?;
                }
                debug!(
                    path = %log.path.display(),
                    count = h.count,
                    head = h.head,
                    "history: flash log opened"
                );
            }
            Some(h) => {
                warn!(
                    path = %log.path.display(),
                    magic = h.magic,
                    version = h.version,
                    entry_size = h.entry_size,
                    capacity = h.capacity,
                    "history: flash log header mismatch, recreating"
                );
                log.recreate()?;
            }
            None => log.recreate()?,
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_len(capacity: u16) -> u64 {
        (HEADER_LEN + usize::from(capacity) * T::SIZE) as u64
    }

    fn read_header(file: &mut File) -> io::Result<Option<Header>> {
        if file.metadata()?.len() < HEADER_LEN as u64 {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        Ok(Some(Header::decode(&buf)))
    }

    fn recreate(&mut self) -> Result<(), HistoryError> {
        self.file.set_len(0)?;
        self.file.set_len(Self::file_len(self.capacity))?;
        self.head = 0;
        self.count = 0;
        self.write_header()
    }

    fn write_header(&mut self) -> Result<(), HistoryError> {
        let header = Header {
            magic: magic_for(T::GRANULARITY),
            version: LOG_VERSION,
            count: self.count,
            head: self.head,
            capacity: self.capacity,
            entry_size: T::SIZE as u16,
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_data()?;
        Ok(())
    }

    fn slot_offset(&self, slot: u16) -> u64 {
        (HEADER_LEN + usize::from(slot) * T::SIZE) as u64
    }
}

/// Positional read; leaves the shared file cursor where it was.
#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

impl<T: HistoryRecord> EntryLog<T> for FlashLog<T> {
    fn push(&mut self, entry: T) -> Result<(), HistoryError> {
        let offset = self.slot_offset(self.head);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&entry.to_bytes())?;
        self.head = (self.head + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
        self.write_header()
    }

    fn get(&self, index: u16) -> Result<Option<T>, HistoryError> {
        if index >= self.count {
            return Ok(None);
        }
        let cap = u32::from(self.capacity);
        let slot = (u32::from(self.head) + cap - u32::from(self.count) + u32::from(index)) % cap;
        let mut buf = vec![0u8; T::SIZE];
        read_at(&self.file, &mut buf, self.slot_offset(slot as u16))?;
        Ok(Some(T::decode(&buf)))
    }

    fn len(&self) -> u16 {
        self.count
    }

    fn capacity(&self) -> u16 {
        self.capacity
    }

    fn head(&self) -> u16 {
        self.head
    }

    fn clear(&mut self) -> Result<(), HistoryError> {
        self.recreate()
    }

    fn trim_oldest(&mut self, n: u16) -> Result<u16, HistoryError> {
        let n = n.min(self.count);
        if n > 0 {
            self.count -= n;
            self.write_header()?;
        }
        Ok(n)
    }
}
