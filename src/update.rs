//! The fixed-size update record and its wire form.

/// Integer type of both halves of an update record.
pub type Key = u64;

/// Serialized size of one update record: two little-endian [`Key`]s, no
/// framing.
pub const RECORD_BYTES: usize = 2 * std::mem::size_of::<Key>();

/// A single key/value update flowing into the tree.
///
/// The key must lie in `[0, keys)` for the tree the update is inserted into;
/// the value is opaque payload that is carried to the consumer unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Update {
    /// Routing key.
    pub key: Key,
    /// Carried value.
    pub value: Key,
}

impl Update {
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.key.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
    }

    /// Decodes one record from a `RECORD_BYTES`-sized slice.
    pub(crate) fn decode(bytes: &[u8]) -> Update {
        let (key, value) = bytes.split_at(std::mem::size_of::<Key>());
        Update {
            key: Key::from_le_bytes(key.try_into().unwrap()),
            value: Key::from_le_bytes(value.try_into().unwrap()),
        }
    }
}

/// Reads just the routing key of the record starting at `bytes[0]`.
pub(crate) fn peek_key(bytes: &[u8]) -> Key {
    Key::from_le_bytes(bytes[..std::mem::size_of::<Key>()].try_into().unwrap())
}

/// A group of values emitted for one key.
///
/// Reused across [`get_data`](crate::BufferTree::get_data) calls to avoid
/// reallocating the value vector for every batch.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    /// The key all values in this batch were inserted under.
    pub key: Key,
    /// The carried values, in insertion order.
    pub values: Vec<Key>,
}
