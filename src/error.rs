//! Error type shared across the crate.

use std::io;

use thiserror::Error;

use crate::update::Key;

/// Failures surfaced by the buffer tree.
///
/// Apart from a rejected configuration, everything here is a fatal
/// invariant violation: the tree performs no retry or recovery, and a
/// buffer that produced one of these is in an unspecified state.
#[derive(Debug, Error)]
pub enum Error {
    /// The construction parameters cannot describe a tree.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A buffer write would run past the buffer's file reservation. Reaching
    /// this means the routing logic failed to drain the buffer in time.
    #[error("buffer {id} too full: {fill} + {size} bytes exceeds reservation of {reservation}")]
    BufferFull {
        /// Id of the overflowing buffer.
        id: usize,
        /// Bytes already stored.
        fill: u64,
        /// Bytes of the rejected write.
        size: u64,
        /// Reservation of the buffer, including the overflow page.
        reservation: u64,
    },

    /// A record's key routed outside the child range that should contain it.
    #[error("key {key} does not route into [{min_key}, {max_key}]")]
    KeyRouting {
        /// The offending key.
        key: Key,
        /// Smallest key of the range the record was matched against.
        min_key: Key,
        /// Largest key of the range the record was matched against.
        max_key: Key,
    },

    /// An emitted batch contained a record whose key differs from the
    /// batch's key. Leaves hold exactly one key, so this cannot happen
    /// unless a buffer's content was corrupted.
    #[error("batch for key {batch_key} contains a record keyed {record_key}")]
    BatchMismatch {
        /// Key of the batch being decoded.
        batch_key: Key,
        /// Key found in the offending record.
        record_key: Key,
    },

    /// A positional read or write on the backing file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Convenience alias for fallible tree operations.
pub type Result<T> = std::result::Result<T, Error>;
