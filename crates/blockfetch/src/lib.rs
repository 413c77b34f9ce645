// blockfetch: read-through prefetching block cache for remote byte sources.

pub mod engine;
pub mod fs;
pub mod info;
pub(crate) mod ram;
pub mod remote;
pub mod sched;
pub mod types;
pub mod writer;

pub use engine::CacheEngine;
pub use fs::{FileSystem, OsFile, StdFs};
pub use info::{AccessStat, Info, INFO_EXTENSION};
pub use remote::{ChunkRequest, RemoteIo};
pub use sched::{Scheduler, ThreadScheduler};
pub use types::{
    cache_file_name, CacheConfig, CacheError, CacheStats, DEFAULT_BUFFER_SIZE,
    DEFAULT_PREFETCH_BUFFERS, DEFAULT_READ_BUFFERS,
};
pub use writer::WriteQueue;
