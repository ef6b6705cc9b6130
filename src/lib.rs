//! An external-memory buffer tree for batching high-rate key/value update
//! streams into per-key groups.
//!
//! In short, *chute* accepts a stream of fixed-size `(key, value)` updates
//! over a dense key space `[0, keys)`, buffers them in a tree of bounded
//! buffers (the first levels in RAM, the deeper ones in a scratch file)
//! and emits batches of values grouped by key through a bounded handoff
//! queue. The use case is an ingestion front-end for systems that maintain
//! expensive per-key state (for instance streaming graph sketches): instead
//! of paying a random access per update, the tree pays a handful of
//! sequential, page-aligned transfers per *batch* of updates.
//!
//! # How it works
//!
//! Updates land in a RAM root buffer. When the root fills, its records are
//! partitioned among `branch` children by key range and appended to their
//! buffers; a child that fills up is flushed the same way, one level down,
//! by a pool of flusher threads. A leaf buffer covers exactly one key, so
//! when leaf content reaches the consumers through the handoff queue it is
//! already a finished batch. All file I/O is positional against one shared
//! descriptor, page-aligned and sequential within each buffer.
//!
//! # Usage
//!
//! ```
//! use chute::{BufferTree, Batch, Config, Update};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut tree = BufferTree::new(dir.path(), Config::new(4).workers(4)).unwrap();
//!
//! for i in 0..8 {
//!     tree.insert(Update { key: i % 4, value: i + 100 }).unwrap();
//! }
//! tree.force_flush().unwrap();
//! tree.set_non_block(true);
//!
//! let mut batch = Batch::default();
//! let mut seen = 0;
//! while tree.get_data(&mut batch).unwrap() {
//!     seen += batch.values.len();
//! }
//! assert_eq!(seen, 8);
//! ```
//!
//! # Concurrency
//!
//! Three roles share a tree:
//!
//! * exactly one producer, which owns the [`BufferTree`] and calls
//!   [`insert`](BufferTree::insert) and
//!   [`force_flush`](BufferTree::force_flush). Both take `&mut self`, so
//!   the single-producer rule is enforced by the borrow checker rather than
//!   by convention;
//! * the flusher threads spawned at construction;
//! * any number of consumer threads, each holding a cloned [`BatchReader`].
//!
//! Updates sharing a key reach their leaf in insertion order; updates with
//! different keys have no ordering guarantee relative to each other.
//!
//! # Errors
//!
//! I/O errors on the backing file and routing inconsistencies are fatal:
//! they indicate a broken invariant, not a recoverable condition, and the
//! buffers involved are left in an unspecified state. See [`Error`].
//!
//! # Shutdown
//!
//! The handoff queue blocks consumers while it is empty. To wind a pipeline
//! down, call [`force_flush`](BufferTree::force_flush), then
//! [`set_non_block(true)`](BufferTree::set_non_block), which makes parked
//! consumers wake up and see a not-valid result, and join the consumers
//! before dropping the tree. Dropping the tree also flips the queue to
//! non-blocking so that teardown cannot deadlock on a full queue.
//!
//! The backing file is scratch, not a database: nothing is recovered from
//! it on a restart.
//!
//! # Name
//!
//! A [chute](https://en.wikipedia.org/wiki/Chute_(gravity)) is a channel
//! that routes bulk material downward by gravity into bins. The metaphor is
//! obvious: updates poured in at the top slide down the tree and arrive
//! sorted into one bin per key.

#![deny(missing_docs)]

use std::path::Path;
use std::sync::Arc;

mod block;
mod error;
mod flusher;
mod layout;
mod os;
mod queue;
mod store;
mod tree;
mod update;

#[cfg(unix)]
mod unix;

pub use error::{Error, Result};
pub use update::{Batch, Key, Update};

use flusher::FlusherPool;
use tree::Engine;
use update::RECORD_BYTES;

/// Construction parameters of a [`BufferTree`].
///
/// Only the key-space size is mandatory; the rest defaults to something
/// reasonable and can be adjusted in builder style:
///
/// ```
/// use chute::Config;
///
/// let config = Config::new(1 << 20).buffer_size(8 << 20).branch(16);
/// assert_eq!(config.branch, 16);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of distinct keys; updates carry keys in `[0, keys)`.
    pub keys: Key,
    /// Capacity in bytes of the root buffer and of every internal buffer.
    /// Raised to the system page size if set lower.
    pub buffer_size: usize,
    /// Maximum children per tree node. At least 2.
    pub branch: u32,
    /// Expected number of consumer threads; the handoff queue gets twice
    /// this many slots.
    pub workers: usize,
    /// Number of flusher threads draining full buffers.
    pub flushers: usize,
    /// Truncate the backing file on open instead of reusing its space.
    pub reset: bool,
}

impl Config {
    /// A configuration for `keys` distinct keys with default sizing: 1 MiB
    /// buffers, branching factor 8, two consumers, one flusher.
    pub fn new(keys: Key) -> Self {
        Self {
            keys,
            buffer_size: 1 << 20,
            branch: 8,
            workers: 2,
            flushers: 1,
            reset: false,
        }
    }

    /// Sets the buffer capacity in bytes.
    #[must_use]
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Sets the branching factor.
    #[must_use]
    pub fn branch(mut self, branch: u32) -> Self {
        self.branch = branch;
        self
    }

    /// Sets the consumer-concurrency hint.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the flusher-thread count.
    #[must_use]
    pub fn flushers(mut self, flushers: usize) -> Self {
        self.flushers = flushers;
        self
    }

    /// Sets whether the backing file is truncated on open.
    #[must_use]
    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }
}

/// The buffer tree: producer handle and lifecycle owner.
///
/// Constructing a tree opens the backing file inside the given directory,
/// reserves its whole arena up front and spawns the flusher threads. The
/// struct owns the RAM root buffer exclusively, which is why inserting
/// requires `&mut self`; consumers access the shared side through
/// [`BatchReader`]s handed out by [`reader`](Self::reader).
pub struct BufferTree {
    root: Vec<u8>,
    pool: FlusherPool,
    engine: Arc<Engine>,
}

impl BufferTree {
    /// Builds the tree skeleton for `config` and opens the backing file in
    /// `dir` (which must exist).
    pub fn new(dir: impl AsRef<Path>, config: Config) -> Result<BufferTree> {
        let engine = Arc::new(Engine::new(dir.as_ref(), &config)?);
        let pool = FlusherPool::spawn(&engine, config.flushers)?;
        let root = Vec::with_capacity(engine.geo().buffer as usize);

        Ok(BufferTree { root, pool, engine })
    }

    /// Appends one update. Fire-and-forget: the record becomes visible to
    /// consumers only after enough inserts (or a
    /// [`force_flush`](Self::force_flush)) push it down to its leaf.
    ///
    /// Flushes the root first when the record would not fit, which is the
    /// only point where the producer does routing work.
    pub fn insert(&mut self, update: Update) -> Result<()> {
        if self.root.len() + RECORD_BYTES > self.engine.geo().buffer as usize {
            self.engine.flush_root(&self.root)?;
            self.root.clear();
        }

        update.encode_into(&mut self.root);
        Ok(())
    }

    /// Drains every buffered record down to the leaves. When this returns,
    /// everything inserted before the call has been emitted to the handoff
    /// queue; calling it again without intervening inserts emits nothing.
    pub fn force_flush(&mut self) -> Result<()> {
        self.engine.force_flush(&self.root)?;
        self.root.clear();
        Ok(())
    }

    /// Blocks for the next batch and decodes it into `out`. Returns false
    /// iff non-blocking mode found the queue empty, or the batch carried no
    /// records.
    pub fn get_data(&self, out: &mut Batch) -> Result<bool> {
        self.engine.get_data(out)
    }

    /// Toggles the handoff queue's non-blocking mode. Setting it wakes
    /// every parked consumer and producer.
    pub fn set_non_block(&self, flag: bool) {
        self.engine.handoff().set_non_block(flag);
    }

    /// A shared consumer handle. Readers stay valid for as long as they are
    /// held, even past the drop of the tree itself (they will then only
    /// ever see a non-blocking empty queue).
    pub fn reader(&self) -> BatchReader {
        BatchReader {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl Drop for BufferTree {
    fn drop(&mut self) {
        log::debug!("closing buffer tree, joining {} flushers", self.pool.workers());
        // A flusher parked on a full handoff queue would never observe the
        // shutdown flag; release it before the pool joins.
        self.engine.handoff().set_non_block(true);
        // The pool field then shuts the workers down and joins them.
    }
}

/// A cloneable consumer handle to a [`BufferTree`]'s emitted batches.
#[derive(Clone)]
pub struct BatchReader {
    engine: Arc<Engine>,
}

impl BatchReader {
    /// Blocks for the next batch; see [`BufferTree::get_data`].
    pub fn get_data(&self, out: &mut Batch) -> Result<bool> {
        self.engine.get_data(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use crossbeam_utils::thread;

    /// Consumes batches until the queue reports not-valid after shutdown,
    /// checking the test pattern `value == keys - 1 - key` and counting
    /// records.
    fn querier(reader: BatchReader, keys: Key, processed: &AtomicU64, shutdown: &AtomicBool) {
        let mut batch = Batch::default();

        loop {
            match reader.get_data(&mut batch) {
                Ok(true) => {
                    for &value in &batch.values {
                        assert_eq!(value, keys - 1 - batch.key, "key {}", batch.key);
                    }
                    processed.fetch_add(batch.values.len() as u64, Ordering::SeqCst);
                }
                Ok(false) => {
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                }
                Err(err) => panic!("querier failed: {}", err),
            }
        }
    }

    /// Inserts `updates` records of the pattern `(i mod keys, keys - 1 -
    /// i mod keys)`, force-flushes and checks that exactly `updates`
    /// records come back out.
    fn run_test(keys: Key, updates: u64, buffer_size: usize, branch: u32) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(keys)
            .buffer_size(buffer_size)
            .branch(branch)
            .workers(1)
            .reset(true);
        let mut tree = BufferTree::new(dir.path(), config).unwrap();

        let processed = AtomicU64::new(0);
        let shutdown = AtomicBool::new(false);

        thread::scope(|s| {
            let reader = tree.reader();
            let processed = &processed;
            let shutdown = &shutdown;
            s.spawn(move |_| querier(reader, keys, processed, shutdown));

            for i in 0..updates {
                tree.insert(Update {
                    key: i % keys,
                    value: keys - 1 - (i % keys),
                })
                .unwrap();
            }
            tree.force_flush().unwrap();

            shutdown.store(true, Ordering::SeqCst);
            tree.set_non_block(true);
        })
        .unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), updates);
    }

    #[test]
    fn small_insert() {
        run_test(10, 400, 1 << 10, 2);
    }

    #[test]
    fn medium_insert() {
        run_test(100, 360_000, 1 << 20, 8);
    }

    #[test]
    fn branch_sized_key_space() {
        run_test(8, 800, 1 << 20, 8);
    }

    #[test]
    fn page_sized_buffer() {
        run_test(10, 4000, *crate::os::PAGE_SIZE, 2);
    }

    /// Fills the lowest buffers as full as insertions can make them.
    #[test]
    fn fill_lowest() {
        let updates = 8 * ((1u64 << 20) / RECORD_BYTES as u64) - 8;
        run_test(8, updates, 1 << 20, 2);
    }

    /// Triggers cascading flushes: phase one fills every internal buffer
    /// about half way, then phase two pours a whole root buffer into each
    /// key in turn.
    #[test]
    fn evil_insertions() {
        let keys: Key = 32;
        let full_root = (1u64 << 20) / RECORD_BYTES as u64;
        let round_one = 15 * full_root;
        let updates = keys * full_root + round_one;

        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(keys)
            .buffer_size(1 << 20)
            .branch(2)
            .workers(1)
            .reset(true);
        let mut tree = BufferTree::new(dir.path(), config).unwrap();

        let processed = AtomicU64::new(0);
        let shutdown = AtomicBool::new(false);

        thread::scope(|s| {
            let reader = tree.reader();
            let processed = &processed;
            let shutdown = &shutdown;
            s.spawn(move |_| querier(reader, keys, processed, shutdown));

            for i in 0..round_one {
                tree.insert(Update {
                    key: i % keys,
                    value: keys - 1 - (i % keys),
                })
                .unwrap();
            }
            for key in 0..keys {
                for _ in 0..full_root {
                    tree.insert(Update {
                        key,
                        value: keys - 1 - key,
                    })
                    .unwrap();
                }
            }
            tree.force_flush().unwrap();

            shutdown.store(true, Ordering::SeqCst);
            tree.set_non_block(true);
        })
        .unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), updates);
    }

    /// Twenty consumers against a deliberately small handoff queue.
    #[test]
    fn many_query_threads() {
        let keys: Key = 1024;
        let updates = 5206u64;

        // This tree reserves ~1 GiB of backing file; keep it off the
        // (possibly RAM-backed) default temp directory.
        let dir = tempfile::tempdir_in(".").unwrap();
        // Five slots' worth of workers instead of twenty: the consumers
        // contend for slots.
        let config = Config::new(keys)
            .buffer_size(1 << 20)
            .branch(2)
            .workers(5)
            .reset(true);
        let mut tree = BufferTree::new(dir.path(), config).unwrap();

        let processed = AtomicU64::new(0);
        let shutdown = AtomicBool::new(false);

        thread::scope(|s| {
            let processed = &processed;
            let shutdown = &shutdown;
            for _ in 0..20 {
                let reader = tree.reader();
                s.spawn(move |_| querier(reader, keys, processed, shutdown));
            }

            for i in 0..updates {
                tree.insert(Update {
                    key: i % keys,
                    value: keys - 1 - (i % keys),
                })
                .unwrap();
            }
            tree.force_flush().unwrap();

            shutdown.store(true, Ordering::SeqCst);
            tree.set_non_block(true);
        })
        .unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), updates);
    }

    /// A single-key tree: the root flushes straight into the lone leaf.
    #[test]
    fn single_key_tree() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(1).workers(4).reset(true);
        let mut tree = BufferTree::new(dir.path(), config).unwrap();

        for _ in 0..100 {
            tree.insert(Update { key: 0, value: 7 }).unwrap();
        }
        tree.force_flush().unwrap();
        tree.set_non_block(true);

        let mut batch = Batch::default();
        let mut seen = 0;
        while tree.get_data(&mut batch).unwrap() {
            assert_eq!(batch.key, 0);
            assert!(batch.values.iter().all(|&v| v == 7));
            seen += batch.values.len();
        }

        assert_eq!(seen, 100);
    }

    /// A key outside `[0, keys)` cannot be routed anywhere; the flush must
    /// abort instead of scribbling into another buffer.
    #[test]
    fn key_out_of_range_aborts_flush() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(10).branch(2).workers(1).reset(true);
        let mut tree = BufferTree::new(dir.path(), config).unwrap();

        tree.insert(Update { key: 15, value: 1 }).unwrap();
        let result = tree.force_flush();

        assert!(matches!(result, Err(Error::KeyRouting { key: 15, .. })));
    }

    #[test]
    fn rejected_configuration() {
        let dir = tempfile::tempdir().unwrap();

        let result = BufferTree::new(dir.path(), Config::new(0));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let result = BufferTree::new(dir.path(), Config::new(10).branch(1));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    /// A second force-flush with nothing inserted in between emits zero
    /// additional batches.
    #[test]
    fn force_flush_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(10).branch(2).workers(8).reset(true);
        let mut tree = BufferTree::new(dir.path(), config).unwrap();

        for i in 0..100u64 {
            tree.insert(Update {
                key: i % 10,
                value: 9 - (i % 10),
            })
            .unwrap();
        }
        tree.force_flush().unwrap();
        tree.force_flush().unwrap();
        tree.set_non_block(true);

        let mut batch = Batch::default();
        let mut seen = 0;
        while tree.get_data(&mut batch).unwrap() {
            seen += batch.values.len();
        }

        assert_eq!(seen, 100);
        assert!(!tree.get_data(&mut batch).unwrap());
    }
}
