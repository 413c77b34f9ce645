//! Remote IO collaborator interface.
//!
//! The engine never talks to the network directly; it is handed a
//! [`RemoteIo`] trait object at construction and issues positional byte
//! reads and vectored reads through it. Implementations wrap whatever
//! transport the host uses. OS error codes are carried on `io::Error` and
//! preserved through the engine (`raw_os_error`).

use std::io;

/// One chunk of a vectored read: an absolute offset and the caller's buffer.
pub struct ChunkRequest<'a> {
    /// Absolute byte offset into the remote object.
    pub offset: u64,
    /// Destination buffer; its length is the chunk size.
    pub buf: &'a mut [u8],
}

/// Positional read access to the remote byte source.
///
/// Implementations must be callable from multiple threads at once: the
/// prefetch worker and any number of user read threads may issue reads
/// concurrently.
pub trait RemoteIo: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read; short reads are allowed and retried by callers.
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Fill every chunk completely or fail.
    ///
    /// The default implementation loops [`read`](Self::read) per chunk;
    /// transports with a native scatter/gather primitive should override it.
    fn read_v(&self, chunks: &mut [ChunkRequest<'_>]) -> io::Result<()> {
        for chunk in chunks.iter_mut() {
            let mut done = 0;
            while done < chunk.buf.len() {
                let n = self.read(&mut chunk.buf[done..], chunk.offset + done as u64)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "remote returned no data before the chunk was filled",
                    ));
                }
                done += n;
            }
        }
        Ok(())
    }
}
