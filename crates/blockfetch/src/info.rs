//! Block map persisted alongside the cache data file.
//!
//! For every block of the cached segment the map keeps two bits:
//! *fetched* (the block's bytes are in the data file) and *write-called*
//! (a disk write for the block has been issued before the last header
//! rewrite). The map, together with an append-only log of per-attachment
//! byte statistics, lives in the companion info file (`<data>.cinfo`).
//!
//! # On-disk layout (little-endian, fixed-width)
//!
//! ```text
//! u32 magic/version            (INFO_MAGIC)
//! u64 buffer_size
//! u64 size_in_bits             (= number of blocks)
//! u8[ceil(size_in_bits/8)]     fetched bits
//! u8[ceil(size_in_bits/8)]     write-called bits
//! u64 stats_count
//! stats_count × {
//!     i64 detach_time          (unix seconds)
//!     u64 bytes_disk
//!     u64 bytes_ram
//!     u64 bytes_missed
//! }
//! ```
//!
//! The header (through the two bitmaps) is rewritten in place on every sync;
//! stats records are appended on detach. A file that does not start with
//! `INFO_MAGIC` is never interpreted: byte order is fixed at little-endian
//! and anything else is treated as an invalid header and reinitialized.

use std::io;

use crate::fs::{read_exact_at, write_all_at, OsFile};
use crate::types::CacheStats;

/// Magic/version word at the start of every info file: `b"bcf1"` read as a
/// little-endian `u32`.
pub const INFO_MAGIC: u32 = 0x3166_6362;

/// File-name extension of the info file, appended to the data-file path.
pub const INFO_EXTENSION: &str = ".cinfo";

const STAT_RECORD_LEN: usize = 32;

/// One per-attachment statistics record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessStat {
    /// Detach time, unix seconds.
    pub detach_time: i64,
    pub bytes_disk: u64,
    pub bytes_ram: u64,
    pub bytes_missed: u64,
}

impl AccessStat {
    /// Build a record for a detach happening at `detach_time`.
    pub fn at_detach(detach_time: i64, stats: CacheStats) -> Self {
        Self {
            detach_time,
            bytes_disk: stats.bytes_disk,
            bytes_ram: stats.bytes_ram,
            bytes_missed: stats.bytes_missed,
        }
    }
}

/// In-memory image of the info file.
///
/// `Info` itself is not synchronized; the engine serializes every access
/// through its download-status lock.
#[derive(Debug)]
pub struct Info {
    buffer_size: u64,
    n_blocks: usize,
    fetched: Vec<u8>,
    write_called: Vec<u8>,
    unfetched: usize,
    stats: Vec<AccessStat>,
}

impl Info {
    /// Fresh map: `n_blocks` blocks of `buffer_size` bytes, nothing fetched.
    pub fn new(buffer_size: u64, n_blocks: usize) -> Self {
        let bitmap_len = n_blocks.div_ceil(8);
        Self {
            buffer_size,
            n_blocks,
            fetched: vec![0; bitmap_len],
            write_called: vec![0; bitmap_len],
            unfetched: n_blocks,
            stats: Vec::new(),
        }
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn n_blocks(&self) -> usize {
        self.n_blocks
    }

    pub fn stats(&self) -> &[AccessStat] {
        &self.stats
    }

    fn test(bits: &[u8], i: usize) -> bool {
        bits[i / 8] & (1 << (i % 8)) != 0
    }

    fn set(bits: &mut [u8], i: usize) {
        bits[i / 8] |= 1 << (i % 8);
    }

    pub fn test_fetched(&self, i: usize) -> bool {
        debug_assert!(i < self.n_blocks);
        Self::test(&self.fetched, i)
    }

    pub fn set_fetched(&mut self, i: usize) {
        debug_assert!(i < self.n_blocks);
        if !Self::test(&self.fetched, i) {
            Self::set(&mut self.fetched, i);
            self.unfetched -= 1;
        }
    }

    pub fn test_write_called(&self, i: usize) -> bool {
        debug_assert!(i < self.n_blocks);
        Self::test(&self.write_called, i)
    }

    /// Requires the fetched bit: a write is only recorded for data that is
    /// in the data file.
    pub fn set_write_called(&mut self, i: usize) {
        debug_assert!(self.test_fetched(i), "write recorded for an unfetched block");
        Self::set(&mut self.write_called, i);
    }

    /// True iff every block is fetched.
    pub fn is_complete(&self) -> bool {
        self.unfetched == 0
    }

    /// Recompute completeness from the bitmap and return it.
    pub fn check_complete(&mut self) -> bool {
        self.unfetched = (0..self.n_blocks)
            .filter(|&i| !Self::test(&self.fetched, i))
            .count();
        self.unfetched == 0
    }

    /// Index of the first unfetched block, if any.
    pub fn first_unfetched(&self) -> Option<usize> {
        (0..self.n_blocks).find(|&i| !Self::test(&self.fetched, i))
    }

    fn header_len(&self) -> usize {
        4 + 8 + 8 + 2 * self.fetched.len()
    }

    /// Rewrite the header (magic, geometry, both bitmaps) in place.
    ///
    /// The stats section after the header is left untouched.
    pub fn write_header(&self, file: &dyn OsFile) -> io::Result<()> {
        let mut buf = Vec::with_capacity(self.header_len());
        buf.extend_from_slice(&INFO_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.buffer_size.to_le_bytes());
        buf.extend_from_slice(&(self.n_blocks as u64).to_le_bytes());
        buf.extend_from_slice(&self.fetched);
        buf.extend_from_slice(&self.write_called);
        write_all_at(file, &buf, 0)
    }

    /// Parse an info file.
    ///
    /// Fails with `InvalidData` on a missing/foreign magic word, a nonsense
    /// geometry, or bitmaps that violate `write_called ⇒ fetched`; fails
    /// with `UnexpectedEof` on a truncated header. Callers recover from any
    /// error by reinitializing the file. A truncated or absent stats section
    /// is tolerated: the records that are present are kept.
    pub fn read_header(file: &dyn OsFile) -> io::Result<Info> {
        let mut fixed = [0u8; 20];
        read_exact_at(file, &mut fixed, 0)?;

        let magic = u32::from_le_bytes(fixed[0..4].try_into().unwrap());
        if magic != INFO_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "info file lacks the expected magic",
            ));
        }
        let buffer_size = u64::from_le_bytes(fixed[4..12].try_into().unwrap());
        let n_blocks = u64::from_le_bytes(fixed[12..20].try_into().unwrap());
        if buffer_size == 0 || n_blocks == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "info header has an empty geometry",
            ));
        }
        let n_blocks = usize::try_from(n_blocks)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "block count overflow"))?;

        let bitmap_len = n_blocks.div_ceil(8);
        let mut fetched = vec![0u8; bitmap_len];
        let mut write_called = vec![0u8; bitmap_len];
        read_exact_at(file, &mut fetched, 20)?;
        read_exact_at(file, &mut write_called, 20 + bitmap_len as u64)?;

        let mut info = Info {
            buffer_size,
            n_blocks,
            fetched,
            write_called,
            unfetched: 0,
            stats: Vec::new(),
        };
        info.check_complete();

        for i in 0..n_blocks {
            if info.test_write_called(i) && !info.test_fetched(i) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "info bitmaps are inconsistent",
                ));
            }
        }

        info.read_stats(file)?;
        Ok(info)
    }

    fn read_stats(&mut self, file: &dyn OsFile) -> io::Result<()> {
        let count_off = self.header_len() as u64;
        let mut count_buf = [0u8; 8];
        if read_exact_at(file, &mut count_buf, count_off).is_err() {
            // Header-only file: no attachments recorded yet.
            return Ok(());
        }
        let count = u64::from_le_bytes(count_buf);

        let mut rec = [0u8; STAT_RECORD_LEN];
        for i in 0..count {
            let off = count_off + 8 + i * STAT_RECORD_LEN as u64;
            if read_exact_at(file, &mut rec, off).is_err() {
                log::warn!("info stats log truncated after {i} of {count} records");
                break;
            }
            self.stats.push(AccessStat {
                detach_time: i64::from_le_bytes(rec[0..8].try_into().unwrap()),
                bytes_disk: u64::from_le_bytes(rec[8..16].try_into().unwrap()),
                bytes_ram: u64::from_le_bytes(rec[16..24].try_into().unwrap()),
                bytes_missed: u64::from_le_bytes(rec[24..32].try_into().unwrap()),
            });
        }
        Ok(())
    }

    /// Append one statistics record: bump the persisted count and write the
    /// record after the existing ones.
    pub fn append_stats(&mut self, file: &dyn OsFile, stat: AccessStat) -> io::Result<()> {
        self.stats.push(stat);

        let count_off = self.header_len() as u64;
        write_all_at(file, &(self.stats.len() as u64).to_le_bytes(), count_off)?;

        let mut rec = [0u8; STAT_RECORD_LEN];
        rec[0..8].copy_from_slice(&stat.detach_time.to_le_bytes());
        rec[8..16].copy_from_slice(&stat.bytes_disk.to_le_bytes());
        rec[16..24].copy_from_slice(&stat.bytes_ram.to_le_bytes());
        rec[24..32].copy_from_slice(&stat.bytes_missed.to_le_bytes());
        let rec_off = count_off + 8 + ((self.stats.len() - 1) * STAT_RECORD_LEN) as u64;
        write_all_at(file, &rec, rec_off)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
