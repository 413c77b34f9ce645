//! Foundational public types for the blockfetch library.
//!
//! This module defines the core data structures used throughout the library:
//! - [`CacheConfig`] — per-host configuration consumed by every engine
//! - [`CacheStats`] — byte counters for one attachment to a cached file
//! - [`CacheError`] — structured error variants for the fallible surface
//! - [`cache_file_name`] — SHA-256-derived local file stem for a remote name

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default block size: 1 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of RAM buffers reserved for foreground reads.
pub const DEFAULT_READ_BUFFERS: usize = 8;

/// Default number of RAM buffers reserved for background prefetch.
pub const DEFAULT_PREFETCH_BUFFERS: usize = 1;

/// Configuration that governs how a cached file is materialized locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Block size in bytes (the unit of caching). Power of two recommended.
    pub buffer_size: usize,

    /// Number of RAM slots admissible to foreground (read-driven) fetches.
    pub n_ram_buffers_read: usize,

    /// Number of RAM slots admissible to background prefetch fetches.
    pub n_ram_buffers_prefetch: usize,

    /// Owner credential handed to the file system when creating cache files.
    pub username: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            n_ram_buffers_read: DEFAULT_READ_BUFFERS,
            n_ram_buffers_prefetch: DEFAULT_PREFETCH_BUFFERS,
            username: String::from("blockfetch"),
        }
    }
}

/// Byte counters for a single attachment, split by the path that served them.
///
/// `bytes_disk + bytes_ram + bytes_missed` equals the total bytes returned to
/// callers while the counters were live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Bytes served from the local data file.
    pub bytes_disk: u64,
    /// Bytes served from a RAM slot (shared in-flight fetch or own task).
    pub bytes_ram: u64,
    /// Bytes the cache could not hold and fetched straight into the caller's
    /// buffer.
    pub bytes_missed: u64,
}

/// Live, lock-free counters behind [`CacheStats`] snapshots.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    bytes_disk: AtomicU64,
    bytes_ram: AtomicU64,
    bytes_missed: AtomicU64,
}

impl StatCounters {
    pub(crate) fn add_disk(&self, n: u64) {
        self.bytes_disk.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_ram(&self, n: u64) {
        self.bytes_ram.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_missed(&self, n: u64) {
        self.bytes_missed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            bytes_disk: self.bytes_disk.load(Ordering::Relaxed),
            bytes_ram: self.bytes_ram.load(Ordering::Relaxed),
            bytes_missed: self.bytes_missed.load(Ordering::Relaxed),
        }
    }
}

/// Errors surfaced by the cache engine.
///
/// Background failures (a prefetch that could not fetch its block, a disk
/// write that gave up) are logged and retried later rather than surfaced;
/// only failures of operations the caller is waiting on appear here.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The local data or info file could not be created or opened.
    #[error("cannot open local cache storage: {0}")]
    Open(#[source] std::io::Error),

    /// The remote source failed while a caller was waiting on the result.
    /// `errno` carries the OS error code when one was reported.
    #[error("remote read failed (errno {errno})")]
    RemoteRead { errno: i32 },

    /// Reading or writing the local data file failed.
    #[error("local cache I/O failed: {0}")]
    Disk(#[source] std::io::Error),

    /// The requested range starts before the cached segment.
    #[error("read range starts before the cached segment")]
    InvalidRange,

    /// The engine was constructed with an unusable geometry.
    #[error("invalid cache geometry: {0}")]
    Geometry(&'static str),
}

impl CacheError {
    /// Wrap a failed remote call, preserving the OS error code when present.
    pub(crate) fn remote(err: &std::io::Error) -> Self {
        CacheError::RemoteRead {
            errno: err.raw_os_error().unwrap_or(FALLBACK_ERRNO),
        }
    }
}

/// Error code recorded when the OS did not report one (EIO).
pub(crate) const FALLBACK_ERRNO: i32 = 5;

/// Derive a stable local file stem for a remote object name.
///
/// The same name always produces the same stem; different names produce
/// distinct stems with overwhelming probability. Callers append their own
/// extension; the engine derives the info-file path from the data-file path.
pub fn cache_file_name(remote_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(remote_name.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── CacheConfig::default() field assertions ──────────────────────────────

    #[test]
    fn test_config_default_buffer_size() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.buffer_size, 1024 * 1024);
    }

    #[test]
    fn test_config_default_slot_counts() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.n_ram_buffers_read, 8);
        assert_eq!(cfg.n_ram_buffers_prefetch, 1);
    }

    // ── cache_file_name ──────────────────────────────────────────────────────

    #[test]
    fn test_cache_file_name_consistent_output() {
        let a = cache_file_name("root://host//store/file.bin");
        let b = cache_file_name("root://host//store/file.bin");
        assert_eq!(a, b, "same input must always produce the same stem");
        assert_eq!(a.len(), 32, "stem must be 16 bytes hex-encoded");
    }

    #[test]
    fn test_cache_file_name_different_inputs_differ() {
        let a = cache_file_name("object-a");
        let b = cache_file_name("object-b");
        assert_ne!(a, b, "different inputs must produce different stems");
    }

    #[test]
    fn test_cache_file_name_is_path_safe() {
        let stem = cache_file_name("weird/../name with spaces");
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
    }

    // ── StatCounters ─────────────────────────────────────────────────────────

    #[test]
    fn test_stat_counters_accumulate() {
        let counters = StatCounters::default();
        counters.add_disk(10);
        counters.add_ram(20);
        counters.add_missed(30);
        counters.add_disk(1);
        let snap = counters.snapshot();
        assert_eq!(
            snap,
            CacheStats {
                bytes_disk: 11,
                bytes_ram: 20,
                bytes_missed: 30,
            }
        );
    }

    #[test]
    fn test_cache_stats_serializes_to_json() {
        let stats = CacheStats {
            bytes_disk: 1,
            bytes_ram: 2,
            bytes_missed: 3,
        };
        let json = serde_json::to_string(&stats).expect("serialize CacheStats");
        assert!(json.contains(r#""bytes_disk":1"#), "unexpected JSON: {json}");
        let back: CacheStats = serde_json::from_str(&json).expect("deserialize CacheStats");
        assert_eq!(back, stats);
    }
}
