//! OS file collaborator interface and its `std::fs` implementation.
//!
//! The engine owns two local files per cached remote object (the data file
//! and the info file) and reaches them only through the [`OsFile`] trait, so
//! tests and embedders can substitute their own storage. [`FileSystem`] is
//! the factory: create-with-mkpath plus read-write open, under a configured
//! owner credential.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Positional access to one open local file. All methods take `&self`;
/// implementations must support concurrent calls (the writer threads and
/// user read threads share the data file handle).
pub trait OsFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes at `offset`, returning the number
    /// written.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Flush file data and metadata to stable storage.
    fn fsync(&self) -> io::Result<()>;

    /// Flush file data (not necessarily metadata) to stable storage.
    fn fdatasync(&self) -> io::Result<()> {
        self.fsync()
    }

    /// Current file length in bytes.
    fn len(&self) -> io::Result<u64>;
}

/// Factory for cache files.
pub trait FileSystem: Send + Sync {
    /// Create `path` if missing (with `mkpath`, also its parent directories)
    /// and open it read-write under `user`.
    fn open_rw(&self, user: &str, path: &Path, mkpath: bool) -> io::Result<Arc<dyn OsFile>>;
}

/// Read exactly `buf.len()` bytes at `offset`, retrying short reads.
pub fn read_exact_at(file: &dyn OsFile, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file ended before the requested range was read",
                ))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write all of `buf` at `offset`, retrying short writes.
pub fn write_all_at(file: &dyn OsFile, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.write_at(&buf[done..], offset + done as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "file accepted no bytes",
                ))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ── std::fs implementation ────────────────────────────────────────────────────

/// [`FileSystem`] over the process's real file system.
///
/// The `user` credential is recorded in the log but not enforced: changing
/// file ownership requires privilege a library cannot assume. Hosts that run
/// privileged can provide their own [`FileSystem`] that honors it.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

struct StdFile(std::fs::File);

impl OsFile for StdFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::read_at(&self.0, buf, offset)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::FileExt::seek_read(&self.0, buf, offset)
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::write_at(&self.0, buf, offset)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::FileExt::seek_write(&self.0, buf, offset)
        }
    }

    fn fsync(&self) -> io::Result<()> {
        self.0.sync_all()
    }

    fn fdatasync(&self) -> io::Result<()> {
        self.0.sync_data()
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}

impl FileSystem for StdFs {
    fn open_rw(&self, user: &str, path: &Path, mkpath: bool) -> io::Result<Arc<dyn OsFile>> {
        if mkpath {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        log::debug!("opened {} rw for user {user}", path.display());
        Ok(Arc::new(StdFile(file)))
    }
}
