//! Construction of the static tree skeleton from `(keys, branch)`.

use log::warn;

use crate::block::{BlockId, ControlBlock};
use crate::os;
use crate::update::Key;

/// The three sizes everything else is measured in.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// System page size.
    pub page: u64,
    /// Buffer size `M`: capacity of the root and of every internal buffer.
    pub buffer: u64,
    /// Leaf size `L`: granularity of leaf batches, sized to grow with the
    /// cube of the key-space logarithm so batches stay proportional to the
    /// downstream per-key state.
    pub leaf: u64,
}

impl Geometry {
    pub fn new(buffer_size: usize, keys: Key) -> Self {
        let page = *os::PAGE_SIZE as u64;
        let mut buffer = buffer_size as u64;

        if buffer < page {
            warn!(
                "requested buffer size {} smaller than the page size; using {}",
                buffer, page
            );
            buffer = page;
        }

        Self {
            page,
            buffer,
            leaf: leaf_size(keys, page),
        }
    }
}

fn leaf_size(keys: Key, page: u64) -> u64 {
    let lg = (keys as f64).log2();
    let size = (24.0 * lg.powi(3)).floor() as u64;
    size.max(page)
}

/// Number of levels below the root: the smallest `d` with `branch^d >=
/// keys`, and at least 1 so that even a single-key tree has its leaf.
fn depth(keys: Key, branch: u32) -> u8 {
    let mut level: u8 = 0;
    let mut span: u128 = 1;

    while span < keys as u128 {
        span *= branch as u128;
        level += 1;
    }

    level.max(1)
}

/// The static shape of the tree: every control block in construction order
/// plus the byte footprints derived from it.
pub struct Layout {
    /// Blocks in construction order, which is level order; children of one
    /// parent are contiguous.
    pub blocks: Vec<ControlBlock>,
    pub max_level: u8,
    /// Length of the level-1 prefix of the arena, which lives in RAM.
    pub cache_len: u64,
    /// Total arena length, reserved in the backing file. The level-1 prefix
    /// of the file stays unused; keeping a single offset space means no two
    /// blocks ever share bytes in either medium.
    pub file_len: u64,
}

impl Layout {
    pub fn build(keys: Key, branch: u32, geo: &Geometry) -> Self {
        let max_level = depth(keys, branch);
        let mut blocks: Vec<ControlBlock> = Vec::new();
        let mut size = 0u64;
        let mut cache_len = 0;
        let mut prev_start = 0;

        for level in 1..=max_level {
            let start = blocks.len();

            if level == 1 {
                partition(&mut blocks, None, 0, keys - 1, branch, level, geo, &mut size);
            } else {
                for parent in prev_start..start {
                    if blocks[parent].is_leaf() {
                        continue;
                    }

                    let (min_key, max_key) = (blocks[parent].min_key, blocks[parent].max_key);
                    partition(
                        &mut blocks,
                        Some(parent),
                        min_key,
                        max_key,
                        branch,
                        level,
                        geo,
                        &mut size,
                    );
                }
            }

            if level == 1 {
                cache_len = size;
            }

            prev_start = start;
        }

        Self {
            blocks,
            max_level,
            cache_len,
            file_len: size,
        }
    }
}

/// Splits `[min_key, max_key]` among up to `branch` children appended to
/// `blocks`, assigning keys contiguously and as evenly as possible: with
/// `k` keys, the first `k mod branch` children receive `ceil(k / branch)`
/// keys and the rest receive `floor(k / branch)`. Children past key
/// exhaustion are not created.
#[allow(clippy::too_many_arguments)]
fn partition(
    blocks: &mut Vec<ControlBlock>,
    parent: Option<BlockId>,
    min_key: Key,
    max_key: Key,
    branch: u32,
    level: u8,
    geo: &Geometry,
    size: &mut u64,
) {
    let mut remaining = max_key - min_key + 1;
    let mut options = branch as u64;
    let mut key = min_key;

    while remaining > 0 && options > 0 {
        let take = remaining.div_ceil(options);
        let id = blocks.len();
        let (child_min, child_max) = (key, key + take - 1);
        let capacity = if child_min == child_max {
            geo.leaf
        } else {
            geo.buffer
        };

        let block = ControlBlock::new(id, *size, level, child_min, child_max, capacity);
        *size += block.reservation(geo);

        if let Some(parent) = parent {
            blocks[parent].add_child(id);
        }
        blocks.push(block);

        key += take;
        remaining -= take;
        options -= 1;
    }
}
