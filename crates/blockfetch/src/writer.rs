//! Shared write queue: moves published RAM slots into engines' data files.
//!
//! One `WriteQueue` serves every open cache engine in the process. Entries
//! key their engine by a stable id and hold only a weak reference, so the
//! queue never keeps a closing engine alive; an engine drains its own
//! entries with [`WriteQueue::remove_entries_for`] during teardown, before
//! any of its slots are destroyed.
//!
//! Foreground entries (from read-driven tasks) are pushed to the front of
//! the queue so a waiting reader's block reaches disk ahead of prefetch
//! backlog.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crate::engine::EngineShared;

struct WriteEntry {
    engine: Weak<EngineShared>,
    engine_id: u64,
    ram_idx: usize,
    size: usize,
}

struct WqState {
    queue: VecDeque<WriteEntry>,
    shutdown: bool,
}

struct WqShared {
    state: Mutex<WqState>,
    cv: Condvar,
    max_pending: usize,
}

/// Writer host: a bounded pending list drained by dedicated writer threads.
pub struct WriteQueue {
    shared: Arc<WqShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Start `n_writers` writer threads; prefetch admission closes once
    /// `max_pending` entries are queued.
    pub fn new(n_writers: usize, max_pending: usize) -> Self {
        let shared = Arc::new(WqShared {
            state: Mutex::new(WqState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
            max_pending,
        });

        let workers = (0..n_writers)
            .map(|n| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("blockfetch-writer-{n}"))
                    .spawn(move || writer_loop(&shared))
                    .expect("failed to spawn writer thread")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Admission probe for prefetch: true while the pending list has room.
    pub fn have_free_writing_slots(&self) -> bool {
        let st = self.shared.state.lock().expect("write queue mutex poisoned");
        st.queue.len() < self.shared.max_pending
    }

    /// Queue one published slot for writing. Returns false after shutdown,
    /// in which case the caller keeps ownership of the slot reference.
    pub(crate) fn submit(
        &self,
        engine: Weak<EngineShared>,
        engine_id: u64,
        ram_idx: usize,
        size: usize,
        foreground: bool,
    ) -> bool {
        let mut st = self.shared.state.lock().expect("write queue mutex poisoned");
        if st.shutdown {
            return false;
        }
        let entry = WriteEntry {
            engine,
            engine_id,
            ram_idx,
            size,
        };
        if foreground {
            st.queue.push_front(entry);
        } else {
            st.queue.push_back(entry);
        }
        self.shared.cv.notify_one();
        true
    }

    /// Drop every pending entry of one engine, releasing the slot references
    /// those entries carried. Entries already picked up by a writer thread
    /// are not affected; the engine's teardown poll waits those out.
    pub(crate) fn remove_entries_for(&self, engine_id: u64) {
        let removed: VecDeque<WriteEntry> = {
            let mut st = self.shared.state.lock().expect("write queue mutex poisoned");
            let (kept, removed): (VecDeque<_>, VecDeque<_>) = st
                .queue
                .drain(..)
                .partition(|e| e.engine_id != engine_id);
            st.queue = kept;
            removed
        };
        if !removed.is_empty() {
            log::debug!(
                "dropped {} pending write(s) for closing engine {engine_id}",
                removed.len()
            );
        }
        for entry in removed {
            if let Some(engine) = entry.engine.upgrade() {
                engine.release_slot(entry.ram_idx);
            }
        }
    }

    #[cfg(test)]
    fn pending(&self) -> Vec<(u64, usize)> {
        let st = self.shared.state.lock().expect("write queue mutex poisoned");
        st.queue.iter().map(|e| (e.engine_id, e.ram_idx)).collect()
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock().expect("write queue mutex poisoned");
            st.shutdown = true;
        }
        self.shared.cv.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker list poisoned"));
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn writer_loop(shared: &WqShared) {
    loop {
        let entry = {
            let mut st = shared.state.lock().expect("write queue mutex poisoned");
            loop {
                if let Some(entry) = st.queue.pop_front() {
                    break entry;
                }
                if st.shutdown {
                    return;
                }
                st = shared.cv.wait(st).expect("write queue mutex poisoned");
            }
        };
        if let Some(engine) = entry.engine.upgrade() {
            engine.write_block(entry.ram_idx, entry.size);
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
