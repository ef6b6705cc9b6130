//! The routing and flush engine shared by the producer, the flusher
//! workers and the consumers.

use std::path::Path;
use std::sync::Mutex;

use log::{debug, info, trace};

use crate::block::{BlockId, ControlBlock};
use crate::error::{Error, Result};
use crate::flusher::FlushQueue;
use crate::layout::{Geometry, Layout};
use crate::queue::HandoffQueue;
use crate::store::{LevelCache, Store};
use crate::update::{peek_key, Batch, Key, Update, RECORD_BYTES};
use crate::Config;

/// Scratch for one level's in-progress flush: one slice per child into
/// which records are partitioned before being written out.
type SlicePool = Vec<Vec<u8>>;

/// Everything that is shared between threads. The producer-owned root
/// buffer lives outside, in [`BufferTree`](crate::BufferTree).
pub struct Engine {
    geo: Geometry,
    keys: Key,
    branch: u32,
    blocks: Vec<ControlBlock>,
    store: Store,
    cache: LevelCache,
    handoff: HandoffQueue,
    flush_queue: FlushQueue,
    /// Per-level slice pools, indexed by the level *doing* the flush (0 is
    /// the root). One pool per level means at most one flush can be in
    /// progress at each level; the mutexes enforce that, and because every
    /// flush acquires pools and read buffers in strictly increasing level
    /// order, the recursion cannot deadlock.
    scratch: Vec<Mutex<SlicePool>>,
    /// Per-level read buffers, indexed by `level - 1` of the buffer being
    /// read. Sized to the largest possible fill so a buffer that ran one
    /// page past its capacity still fits.
    readers: Vec<Mutex<Box<[u8]>>>,
    /// Largest record-aligned write that fits in one page; slices are
    /// written out whenever they reach it.
    full_flush: usize,
}

impl Engine {
    pub fn new(dir: &Path, config: &Config) -> Result<Self> {
        if config.keys == 0 {
            return Err(invalid_config("keys must be greater than zero"));
        }
        if config.branch < 2 {
            return Err(invalid_config("branch must be at least 2"));
        }

        let geo = Geometry::new(config.buffer_size, config.keys);
        let layout = Layout::build(config.keys, config.branch, &geo);
        info!(
            "creating a buffer tree of depth {} with {} buffers",
            layout.max_level,
            layout.blocks.len()
        );
        for block in &layout.blocks {
            trace!("{:?}", block);
        }

        let store = Store::open(dir, config.reset)?;
        // Reserve the whole arena right after the layout fixed its size.
        store.preallocate(layout.file_len)?;

        let levels = layout.max_level as usize;
        let read_len = (geo.buffer.max(geo.leaf) + geo.page) as usize;
        let slot_len = (geo.leaf + geo.page) as usize;

        Ok(Self {
            geo,
            keys: config.keys,
            branch: config.branch,
            blocks: layout.blocks,
            store,
            cache: LevelCache::new(layout.cache_len as usize),
            handoff: HandoffQueue::new(2 * config.workers.max(1), slot_len),
            flush_queue: FlushQueue::new(),
            scratch: (0..levels)
                .map(|_| {
                    Mutex::new(
                        (0..config.branch)
                            .map(|_| Vec::with_capacity(*crate::os::PAGE_SIZE))
                            .collect(),
                    )
                })
                .collect(),
            readers: (0..levels)
                .map(|_| Mutex::new(vec![0u8; read_len].into_boxed_slice()))
                .collect(),
            full_flush: (*crate::os::PAGE_SIZE / RECORD_BYTES) * RECORD_BYTES,
        })
    }

    pub fn geo(&self) -> &Geometry {
        &self.geo
    }

    pub fn flush_queue(&self) -> &FlushQueue {
        &self.flush_queue
    }

    pub fn handoff(&self) -> &HandoffQueue {
        &self.handoff
    }

    /// Routes the root buffer's content into the root's children.
    pub fn flush_root(&self, root: &[u8]) -> Result<()> {
        if root.is_empty() {
            return Ok(());
        }

        self.do_flush(root, 0, 0, self.keys - 1, self.branch as u64, 0)
    }

    /// Drains the whole tree top-down: the root first, then every buffer in
    /// construction order, which is level order, so a flushed parent only
    /// moves bytes into buffers that come later in the sweep. Afterwards
    /// waits for the flush-request queue to drain, so every batch produced
    /// by the sweep is in the handoff queue when this returns.
    pub fn force_flush(&self, root: &[u8]) -> Result<()> {
        self.flush_root(root)?;

        for block in &self.blocks {
            let mut fill = block.lock();
            self.flush_locked(block, &mut fill)?;
        }

        self.flush_queue.wait_idle();
        Ok(())
    }

    /// Flushes one buffer on behalf of a worker.
    pub fn flush_block(&self, id: BlockId) -> Result<()> {
        let block = &self.blocks[id];
        let mut fill = block.lock();
        self.flush_locked(block, &mut fill)
    }

    /// Partitions `data` among the children of the node described by the
    /// arguments: `begin` is the id of its first child, `options` the
    /// number of children to route across and `level` the node's own level.
    ///
    /// Records are copied into per-child slices; a slice reaching the
    /// full-flush unit is appended to its child's buffer, and leftovers are
    /// drained at the end. A child that newly crosses its flush threshold
    /// is handed to the flusher workers.
    fn do_flush(
        &self,
        data: &[u8],
        begin: BlockId,
        min_key: Key,
        max_key: Key,
        options: u64,
        level: u8,
    ) -> Result<()> {
        let mut pool = self.scratch[level as usize].lock().unwrap();

        for slice in pool.iter_mut() {
            slice.clear();
        }

        for record in data.chunks_exact(RECORD_BYTES) {
            let key = peek_key(record);
            let child = which_child(key, min_key, max_key, options);
            let block = (child < options)
                .then(|| self.blocks.get(begin + child as usize))
                .flatten()
                .ok_or(Error::KeyRouting {
                    key,
                    min_key,
                    max_key,
                })?;
            if key < block.min_key || key > block.max_key {
                return Err(Error::KeyRouting {
                    key,
                    min_key: block.min_key,
                    max_key: block.max_key,
                });
            }

            let slice = &mut pool[child as usize];
            slice.extend_from_slice(record);

            if slice.len() >= self.full_flush {
                self.write_child(block, slice)?;
                slice.clear();
            }
        }

        for (child, slice) in pool.iter_mut().enumerate() {
            if !slice.is_empty() {
                self.write_child(&self.blocks[begin + child], slice)?;
                slice.clear();
            }
        }

        Ok(())
    }

    /// Appends one routed slice to `block`, draining the block first if the
    /// append would run past its reservation, which means the queued flush
    /// has not caught up and the overflow page is about to be spent.
    fn write_child(&self, block: &ControlBlock, data: &[u8]) -> Result<()> {
        let mut fill = block.lock();

        if *fill + data.len() as u64 > block.reservation(&self.geo) {
            self.flush_locked(block, &mut fill)?;
        }

        let crossed = block.write(&mut fill, data, &self.geo, &self.store, &self.cache)?;
        drop(fill);

        if crossed {
            self.flush_queue.enqueue(block.id);
        }

        Ok(())
    }

    /// Flushes `block` under its already-held lock: reads its whole content
    /// into the level's read buffer, then either hands it to consumers (a
    /// leaf holds records of exactly one key, so its content is a finished
    /// batch) or routes it one level down.
    fn flush_locked(&self, block: &ControlBlock, fill: &mut u64) -> Result<()> {
        if *fill == 0 {
            return Ok(());
        }
        let size = *fill as usize;

        let mut reader = self.readers[(block.level - 1) as usize].lock().unwrap();
        let buf = &mut reader[..size];

        if block.level == 1 {
            // SAFETY: The span belongs to this block and its lock is held
            // by the caller.
            unsafe { self.cache.read(block.offset as usize, buf) };
        } else {
            self.store.read_at(buf, block.offset)?;
        }

        if block.is_leaf() {
            if !self.handoff.push(buf) {
                debug!(
                    "dropping a {} byte batch for key {}: handoff queue is shut down",
                    size, block.min_key
                );
            }
        } else {
            self.do_flush(
                buf,
                block.first_child,
                block.min_key,
                block.max_key,
                block.children_num as u64,
                block.level,
            )?;
        }

        block.reset(fill);
        Ok(())
    }

    /// Takes the oldest leaf batch off the handoff queue and decodes it
    /// into `out`. Returns false when the queue is in non-blocking mode and
    /// empty, or when the batch carried no records.
    pub fn get_data(&self, out: &mut Batch) -> Result<bool> {
        let Some(slot) = self.handoff.peek() else {
            return Ok(false);
        };

        let payload = &*slot;
        if payload.is_empty() {
            return Ok(false);
        }

        out.key = peek_key(payload);
        out.values.clear();
        out.values.reserve(payload.len() / RECORD_BYTES);

        for record in payload.chunks_exact(RECORD_BYTES) {
            let update = Update::decode(record);
            if update.key == 0 && update.value == 0 {
                // Null record: the batch ends early.
                break;
            }
            if update.key != out.key {
                return Err(Error::BatchMismatch {
                    batch_key: out.key,
                    record_key: update.key,
                });
            }
            out.values.push(update.value);
        }

        Ok(true)
    }
}

fn invalid_config(message: &str) -> Error {
    Error::InvalidConfig(message.to_owned())
}

/// Index of the child whose key range contains `key`, mirroring the
/// partition used at setup: with `total` keys over `options` children, the
/// first `total mod options` children hold `ceil(total / options)` keys and
/// the rest hold `floor(total / options)`.
///
/// A key outside `[min_key, max_key]` yields an index at or past `options`,
/// which the caller turns into a routing error.
fn which_child(key: Key, min_key: Key, max_key: Key, options: u64) -> u64 {
    let total = max_key - min_key + 1;
    let larger = total % options;
    let small = total / options;
    let large = small + u64::from(larger > 0);
    let larger_count = larger * large;

    let Some(idx) = key.checked_sub(min_key) else {
        return options;
    };

    if idx < larger_count {
        idx / large
    } else if small == 0 {
        // Fewer keys than children: every key lands in the branch above.
        options
    } else {
        larger + (idx - larger_count) / small
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Geometry, Layout};

    #[test]
    fn which_child_even_split() {
        // 10 keys over 2 children: [0, 4] and [5, 9].
        for key in 0..5 {
            assert_eq!(which_child(key, 0, 9, 2), 0);
        }
        for key in 5..10 {
            assert_eq!(which_child(key, 0, 9, 2), 1);
        }
    }

    #[test]
    fn which_child_uneven_split() {
        // 13 keys over 8 children: five of 2, three of 1.
        let expected = [0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 6, 7];
        for (idx, &child) in expected.iter().enumerate() {
            assert_eq!(which_child(idx as Key, 0, 12, 8), child);
        }
    }

    #[test]
    fn which_child_fewer_keys_than_children() {
        for key in 0..3 {
            assert_eq!(which_child(key, 0, 2, 8), key);
        }
    }

    #[test]
    fn which_child_out_of_range() {
        assert!(which_child(15, 0, 9, 2) >= 2);
        assert!(which_child(3, 5, 9, 2) >= 2);
    }

    /// Routing must agree with the partition the layout actually built:
    /// descending by `which_child` from the root lands every key on its
    /// own leaf.
    #[test]
    fn routing_matches_layout() {
        for (keys, branch) in [(1, 2), (10, 2), (100, 8), (33, 5), (1024, 2)] {
            let geo = Geometry::new(1 << 20, keys);
            let layout = Layout::build(keys, branch, &geo);

            for key in 0..keys {
                let mut begin = 0;
                let mut min_key = 0;
                let mut max_key = keys - 1;
                let mut options = branch as u64;

                loop {
                    let child = which_child(key, min_key, max_key, options);
                    assert!(child < options);
                    let block = &layout.blocks[begin + child as usize];
                    assert!(
                        block.min_key <= key && key <= block.max_key,
                        "key {} routed to [{}, {}] (keys={}, branch={})",
                        key,
                        block.min_key,
                        block.max_key,
                        keys,
                        branch
                    );

                    if block.is_leaf() {
                        assert_eq!(block.min_key, key);
                        break;
                    }

                    begin = block.first_child;
                    min_key = block.min_key;
                    max_key = block.max_key;
                    options = block.children_num as u64;
                }
            }
        }
    }
}
