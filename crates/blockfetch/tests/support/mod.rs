//! Shared fixtures for the engine integration tests: a scriptable mock
//! remote (per-block failure injection, gating, call recording) and engine
//! builders over temp directories.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use blockfetch::{
    CacheConfig, CacheEngine, ChunkRequest, RemoteIo, StdFs, ThreadScheduler, WriteQueue,
};

/// Deterministic non-repeating-ish byte pattern.
pub fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

pub struct MockState {
    failing: HashSet<u64>,
    gated: HashSet<u64>,
    fetch_log: Vec<u64>,
    vector_calls: Vec<usize>,
}

/// Remote over an in-memory byte vector with per-block scripting.
pub struct MockRemote {
    data: Vec<u8>,
    block_size: u64,
    state: Mutex<MockState>,
    gate_cv: Condvar,
}

impl MockRemote {
    pub fn new(data: Vec<u8>, block_size: u64) -> Arc<Self> {
        Arc::new(Self {
            data,
            block_size,
            state: Mutex::new(MockState {
                failing: HashSet::new(),
                gated: HashSet::new(),
                fetch_log: Vec::new(),
                vector_calls: Vec::new(),
            }),
            gate_cv: Condvar::new(),
        })
    }

    /// Make every read touching `block` fail with EIO.
    pub fn fail_block(&self, block: u64) {
        self.state.lock().expect("mock mutex").failing.insert(block);
    }

    pub fn clear_failures(&self) {
        self.state.lock().expect("mock mutex").failing.clear();
    }

    /// Make reads touching `block` hang until [`release_gates`](Self::release_gates).
    pub fn gate_block(&self, block: u64) {
        self.state.lock().expect("mock mutex").gated.insert(block);
    }

    pub fn release_gates(&self) {
        self.state.lock().expect("mock mutex").gated.clear();
        self.gate_cv.notify_all();
    }

    /// Block index of every `read` call, in arrival order.
    pub fn fetch_log(&self) -> Vec<u64> {
        self.state.lock().expect("mock mutex").fetch_log.clone()
    }

    pub fn fetches_of(&self, block: u64) -> usize {
        self.state
            .lock()
            .expect("mock mutex")
            .fetch_log
            .iter()
            .filter(|&&b| b == block)
            .count()
    }

    pub fn read_calls(&self) -> usize {
        self.state.lock().expect("mock mutex").fetch_log.len()
    }

    /// Chunk count of every `read_v` call, in arrival order.
    pub fn vector_calls(&self) -> Vec<usize> {
        self.state.lock().expect("mock mutex").vector_calls.clone()
    }

    fn serve(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let block = offset / self.block_size;
        {
            let mut st = self.state.lock().expect("mock mutex");
            while st.gated.contains(&block) {
                st = self.gate_cv.wait(st).expect("mock mutex");
            }
            st.fetch_log.push(block);
            if st.failing.contains(&block) {
                return Err(io::Error::from_raw_os_error(5));
            }
        }
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

impl RemoteIo for MockRemote {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.serve(buf, offset)
    }

    fn read_v(&self, chunks: &mut [ChunkRequest<'_>]) -> io::Result<()> {
        self.state
            .lock()
            .expect("mock mutex")
            .vector_calls
            .push(chunks.len());
        for chunk in chunks.iter_mut() {
            let mut done = 0;
            while done < chunk.buf.len() {
                let n = self.serve(&mut chunk.buf[done..], chunk.offset + done as u64)?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "past EOF"));
                }
                done += n;
            }
        }
        Ok(())
    }
}

pub fn config(block_size: usize, n_read: usize, n_prefetch: usize) -> CacheConfig {
    CacheConfig {
        buffer_size: block_size,
        n_ram_buffers_read: n_read,
        n_ram_buffers_prefetch: n_prefetch,
        username: "tester".to_string(),
    }
}

/// Build and start an engine backed by `path`.
pub fn start_engine(
    remote: Arc<MockRemote>,
    path: &Path,
    offset: u64,
    file_size: u64,
    config: CacheConfig,
) -> CacheEngine {
    let engine = CacheEngine::new(
        remote,
        Arc::new(WriteQueue::new(1, 16)),
        path,
        offset,
        file_size,
        config,
        Arc::new(StdFs),
        Arc::new(ThreadScheduler),
    )
    .expect("engine construction should succeed");
    engine.start();
    engine
}

/// A started engine over a fresh temp dir. Field order drops the engine
/// before the directory.
pub struct TestCache {
    pub engine: CacheEngine,
    pub remote: Arc<MockRemote>,
    pub data_path: PathBuf,
    pub dir: tempfile::TempDir,
}

pub fn cold_cache(
    data: Vec<u8>,
    offset: u64,
    block_size: usize,
    n_read: usize,
    n_prefetch: usize,
) -> TestCache {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_path = dir.path().join("object.data");
    let file_size = data.len() as u64 - offset;
    let remote = MockRemote::new(data, block_size as u64);
    let engine = start_engine(
        Arc::clone(&remote),
        &data_path,
        offset,
        file_size,
        config(block_size, n_read, n_prefetch),
    );
    TestCache {
        engine,
        remote,
        data_path,
        dir,
    }
}

/// Poll until the engine's block map is complete.
pub fn wait_complete(engine: &CacheEngine, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if engine.is_complete() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    engine.is_complete()
}
