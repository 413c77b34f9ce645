use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use blockfetch::{
    cache_file_name, CacheConfig, CacheEngine, RemoteIo, StdFs, ThreadScheduler, WriteQueue,
};

/// Warm a local block cache from a source file and emit JSON stats.
#[derive(Parser, Debug)]
#[command(
    name = "blockfetch-cli",
    about = "Warm a local block cache from a source file and emit JSON stats"
)]
struct Args {
    /// Source file standing in for the remote object
    source: PathBuf,

    /// Directory for the cache data and info files
    #[arg(long, default_value = "./blockfetch-cache")]
    cache_dir: PathBuf,

    /// Block size in bytes
    #[arg(long, default_value_t = blockfetch::DEFAULT_BUFFER_SIZE)]
    block_size: usize,

    /// RAM buffers admitted to foreground reads
    #[arg(long, default_value_t = blockfetch::DEFAULT_READ_BUFFERS)]
    read_buffers: usize,

    /// RAM buffers admitted to background prefetch
    #[arg(long, default_value_t = blockfetch::DEFAULT_PREFETCH_BUFFERS)]
    prefetch_buffers: usize,

    /// Writer threads shared by the process
    #[arg(long, default_value_t = 1)]
    writers: usize,

    /// Byte ranges "offset:length" to read (default: the whole file
    /// sequentially, block by block)
    #[arg(long)]
    range: Vec<String>,
}

/// Remote IO over a local file, for warming caches from on-disk sources.
struct FileRemote {
    file: File,
}

impl RemoteIo for FileRemote {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
        }
    }
}

fn parse_range(spec: &str) -> Option<(u64, usize)> {
    let (off, len) = spec.split_once(':')?;
    Some((off.trim().parse().ok()?, len.trim().parse().ok()?))
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let source = File::open(&args.source).unwrap_or_else(|e| {
        eprintln!("Error opening source file: {e}");
        std::process::exit(1);
    });
    let file_size = source
        .metadata()
        .unwrap_or_else(|e| {
            eprintln!("Error reading source metadata: {e}");
            std::process::exit(1);
        })
        .len();
    if file_size == 0 {
        eprintln!("Error: source file is empty");
        std::process::exit(1);
    }

    let ranges: Vec<(u64, usize)> = args
        .range
        .iter()
        .map(|spec| {
            parse_range(spec).unwrap_or_else(|| {
                eprintln!("Error: bad range {spec:?}, expected \"offset:length\"");
                std::process::exit(1);
            })
        })
        .collect();

    let config = CacheConfig {
        buffer_size: args.block_size,
        n_ram_buffers_read: args.read_buffers,
        n_ram_buffers_prefetch: args.prefetch_buffers,
        username: std::env::var("USER").unwrap_or_else(|_| "blockfetch".to_string()),
    };

    let stem = cache_file_name(&args.source.display().to_string());
    let data_path = args.cache_dir.join(format!("{stem}.data"));
    log::info!("caching {} at {}", args.source.display(), data_path.display());

    let write_queue = Arc::new(WriteQueue::new(args.writers.max(1), 64));
    let engine = CacheEngine::new(
        Arc::new(FileRemote { file: source }),
        write_queue,
        &data_path,
        0,
        file_size,
        config,
        Arc::new(StdFs),
        Arc::new(ThreadScheduler),
    )
    .unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    engine.start();

    // Serve the requested ranges, or walk the whole file block by block.
    let mut errors: Vec<String> = Vec::new();
    let mut bytes_returned: u64 = 0;
    if ranges.is_empty() {
        let mut buf = vec![0u8; args.block_size.max(1)];
        let mut offset = 0u64;
        while offset < file_size {
            match engine.read(&mut buf, offset) {
                Ok(0) => break,
                Ok(n) => {
                    bytes_returned += n as u64;
                    offset += n as u64;
                }
                Err(e) => {
                    errors.push(format!("read at {offset}: {e}"));
                    offset += args.block_size as u64;
                }
            }
        }
    } else {
        for &(offset, length) in &ranges {
            let mut buf = vec![0u8; length];
            match engine.read(&mut buf, offset) {
                Ok(n) => bytes_returned += n as u64,
                Err(e) => errors.push(format!("read at {offset}: {e}")),
            }
        }
    }

    let stats = engine.stats();
    let complete = engine.is_complete();
    drop(engine); // run the teardown protocol before reporting

    // Serialize to JSON. Always exits 0; errors are encoded in the JSON.
    let report = serde_json::json!({
        "source": args.source,
        "cache_file": data_path,
        "file_size": file_size,
        "bytes_returned": bytes_returned,
        "stats": stats,
        "complete": complete,
        "errors": errors,
    });
    println!("{report}");
}
