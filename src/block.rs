//! Per-buffer metadata and the locked append path.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::layout::Geometry;
use crate::store::{LevelCache, Store};
use crate::update::Key;

/// Index of a buffer in the tree's block table.
pub type BlockId = usize;

/// Metadata of one non-root tree buffer.
///
/// Everything except `fill` is fixed at construction. The `fill` mutex
/// guards the byte count *and* the byte region the block owns (in the
/// level-1 cache or the backing file), so holding the guard is what
/// licenses reading or writing those bytes.
pub struct ControlBlock {
    /// Position in the block table, assigned in construction order.
    pub id: BlockId,
    /// Depth in the tree; 1 is the root's children.
    pub level: u8,
    /// Smallest key routed into this buffer.
    pub min_key: Key,
    /// Largest key routed into this buffer.
    pub max_key: Key,
    /// Byte offset of the buffer's region. Level-1 blocks index the RAM
    /// cache, deeper blocks index the backing file.
    pub offset: u64,
    /// Nominal capacity: the leaf size for leaves, the buffer size
    /// otherwise. The region reserves one extra page past it.
    pub capacity: u64,
    /// Id of the smallest child block.
    pub first_child: BlockId,
    /// Number of children actually created.
    pub children_num: u32,
    fill: Mutex<u64>,
}

impl ControlBlock {
    pub fn new(
        id: BlockId,
        offset: u64,
        level: u8,
        min_key: Key,
        max_key: Key,
        capacity: u64,
    ) -> Self {
        Self {
            id,
            level,
            min_key,
            max_key,
            offset,
            capacity,
            first_child: 0,
            children_num: 0,
            fill: Mutex::new(0),
        }
    }

    /// A block storing a single key has nothing left to route.
    pub fn is_leaf(&self) -> bool {
        self.min_key == self.max_key
    }

    /// Reservation of the block's byte region: capacity plus one page that
    /// absorbs a final overflowing write.
    pub fn reservation(&self, geo: &Geometry) -> u64 {
        self.capacity + geo.page
    }

    /// Locks the block for data transfer, blocking the calling context if
    /// the lock is unavailable.
    pub fn lock(&self) -> MutexGuard<'_, u64> {
        self.fill.lock().unwrap()
    }

    pub fn add_child(&mut self, child: BlockId) {
        if self.children_num == 0 {
            self.first_child = child;
        }
        self.children_num += 1;
    }

    /// Appends `data` at the block's current fill position.
    ///
    /// Returns true iff this write newly crossed the block's flush
    /// threshold, i.e. the caller should get the block flushed. Fails with
    /// [`Error::BufferFull`] if the write would run past the reservation,
    /// which routing is supposed to make impossible.
    pub fn write(
        &self,
        fill: &mut u64,
        data: &[u8],
        geo: &Geometry,
        store: &Store,
        cache: &LevelCache,
    ) -> Result<bool> {
        let size = data.len() as u64;
        let reservation = self.reservation(geo);

        if *fill + size > reservation {
            return Err(Error::BufferFull {
                id: self.id,
                fill: *fill,
                size,
                reservation,
            });
        }

        if self.level == 1 {
            // SAFETY: The span belongs to this block alone and the caller
            // holds its lock (it carries the guard in `fill`).
            unsafe { cache.write((self.offset + *fill) as usize, data) };
        } else {
            store.write_at(data, self.offset + *fill)?;
        }

        let old = *fill;
        *fill += size;

        Ok(self.needs_flush(old, *fill, size, geo))
    }

    /// Whether the write advancing the fill from `old` to `new` crossed the
    /// flush threshold.
    ///
    /// Leaves additionally trigger whenever the write wraps across a
    /// leaf-size boundary, so consumers receive frequent small batches
    /// instead of waiting for a whole buffer of a single key.
    fn needs_flush(&self, old: u64, new: u64, size: u64, geo: &Geometry) -> bool {
        let crossed_buffer = old < geo.buffer && new >= geo.buffer;

        if self.is_leaf() {
            new % geo.leaf < size || crossed_buffer
        } else {
            crossed_buffer
        }
    }

    /// Empties the block after a flush has drained it.
    pub fn reset(&self, fill: &mut u64) {
        *fill = 0;
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffer {}: level={}, keys=[{}, {}], offset={}, first_child={}, children={}",
            self.id,
            self.level,
            self.min_key,
            self.max_key,
            self.offset,
            self.first_child,
            self.children_num
        )
    }
}
