//! Byte-oriented storage: the composite key layout, the backend contract
//! with atomic multi-key commits, and the typed backing store layered on
//! top.

pub mod backing_store;
pub mod codec;
pub mod lmdb;
pub mod memory;
pub mod query_index;

use crate::error::{Result, StoreError};
use crate::INVALID;

pub use self::backing_store::BackingStore;
pub use self::lmdb::LmdbBackend;
pub use self::memory::MemoryBackend;
pub use self::query_index::QueryIndex;

/// Reserved window-id slot holding the serialized merge heap.
pub(crate) const HEAP_OFFSET: i64 = 0;
/// Reserved window-id slot holding the serialized merger index.
pub(crate) const MERGER_INDEX_OFFSET: i64 = 1;
/// First reserved window-id slot of the per-role durable counters.
pub(crate) const COUNTER_OFFSET: i64 = 2;
/// Window ids at or below `INVALID + RESERVED_FOOTER` are reserved.
pub(crate) const RESERVED_FOOTER: i64 = 4;

/// Pipeline role owning a durable `(count, latest_time_start)` counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    /// The writer stage: windows persisted so far.
    Writer = 0,
    /// The merger stage: elements acknowledged by the last merge commit.
    Merger = 1,
}

/// Composite backend key: stream, namespace flag, window id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowKey {
    /// Owning stream.
    pub stream_id: i64,
    /// True for the landmark namespace, false for summary windows.
    pub landmark: bool,
    /// Window id, or a reserved slot below `INVALID + RESERVED_FOOTER`.
    pub window_id: i64,
}

impl WindowKey {
    /// Encoded key length: 8-byte stream id, 1 flag byte, 8-byte window id.
    pub const LEN: usize = 17;

    /// Key of a summary window.
    pub fn summary(stream_id: i64, window_id: i64) -> Self {
        Self {
            stream_id,
            landmark: false,
            window_id,
        }
    }

    /// Key of a landmark window.
    pub fn landmark(stream_id: i64, window_id: i64) -> Self {
        Self {
            stream_id,
            landmark: true,
            window_id,
        }
    }

    /// Key of the stream's serialized merge heap.
    pub fn heap(stream_id: i64) -> Self {
        Self::summary(stream_id, INVALID + HEAP_OFFSET)
    }

    /// Key of the stream's serialized merger index.
    pub fn merger_index(stream_id: i64) -> Self {
        Self::summary(stream_id, INVALID + MERGER_INDEX_OFFSET)
    }

    /// Key of a role's durable counter.
    pub fn counter(stream_id: i64, role: Role) -> Self {
        Self::summary(stream_id, INVALID + COUNTER_OFFSET + role as i64)
    }

    /// Encodes to the 17-byte wire form.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[..8].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[8] = self.landmark as u8;
        buf[9..].copy_from_slice(&self.window_id.to_le_bytes());
        buf
    }

    /// Decodes from the 17-byte wire form.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::LEN {
            return Err(StoreError::Corrupt("window key length"));
        }
        let stream_id = i64::from_le_bytes(buf[..8].try_into().unwrap());
        let landmark = match buf[8] {
            0 => false,
            1 => true,
            _ => return Err(StoreError::Corrupt("window key namespace flag")),
        };
        let window_id = i64::from_le_bytes(buf[9..].try_into().unwrap());
        Ok(Self {
            stream_id,
            landmark,
            window_id,
        })
    }

    /// The 9-byte prefix shared by all keys of one stream namespace.
    pub fn prefix(stream_id: i64, landmark: bool) -> [u8; 9] {
        let mut buf = [0u8; 9];
        buf[..8].copy_from_slice(&stream_id.to_le_bytes());
        buf[8] = landmark as u8;
        buf
    }

    /// True for the reserved per-stream record slots skipped by iteration.
    pub fn is_reserved(window_id: i64) -> bool {
        window_id <= INVALID + RESERVED_FOOTER
    }
}

/// A multi-key write set applied atomically by [`Backend::commit`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) puts: Vec<(WindowKey, Vec<u8>)>,
    pub(crate) deletes: Vec<WindowKey>,
    pub(crate) meta_puts: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a window put.
    pub fn put(&mut self, key: WindowKey, value: Vec<u8>) {
        self.puts.push((key, value));
    }

    /// Stages a window delete.
    pub fn delete(&mut self, key: WindowKey) {
        self.deletes.push(key);
    }

    /// Stages a metadata put.
    pub fn put_meta(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.meta_puts.push((key, value));
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty() && self.meta_puts.is_empty()
    }
}

/// A byte-oriented key-value backend with atomic multi-key commits.
pub trait Backend: Send + Sync {
    /// Reads one window record.
    fn get(&self, key: &WindowKey) -> Result<Option<Vec<u8>>>;

    /// Writes one window record.
    fn put(&self, key: &WindowKey, value: &[u8]) -> Result<()>;

    /// Deletes one window record.
    fn delete(&self, key: &WindowKey) -> Result<()>;

    /// Applies a whole batch atomically: either every staged put and delete
    /// lands or none do.
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// All non-reserved window ids of one stream namespace.
    fn scan_window_ids(&self, stream_id: i64, landmark: bool) -> Result<Vec<i64>>;

    /// Reads a metadata record.
    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Writes a metadata record.
    fn put_meta(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        let key = WindowKey::landmark(42, 12345);
        let decoded = WindowKey::decode(&key.encode()).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_key_layout_is_bit_exact() {
        let key = WindowKey::summary(1, 2);
        let buf = key.encode();
        assert_eq!(&buf[..8], &1i64.to_le_bytes());
        assert_eq!(buf[8], 0);
        assert_eq!(&buf[9..], &2i64.to_le_bytes());
    }

    #[test]
    fn test_prefix_matches_encoded_keys() {
        let key = WindowKey::landmark(7, 99);
        let prefix = WindowKey::prefix(7, true);
        assert_eq!(&key.encode()[..9], &prefix);
    }

    #[test]
    fn test_reserved_slots_are_below_footer() {
        assert!(WindowKey::is_reserved(WindowKey::heap(0).window_id));
        assert!(WindowKey::is_reserved(WindowKey::merger_index(0).window_id));
        assert!(WindowKey::is_reserved(
            WindowKey::counter(0, Role::Writer).window_id
        ));
        assert!(WindowKey::is_reserved(
            WindowKey::counter(0, Role::Merger).window_id
        ));
        assert!(!WindowKey::is_reserved(0));
        assert!(!WindowKey::is_reserved(-1));
    }

    #[test]
    fn test_counter_slots_distinct_per_role() {
        assert_ne!(
            WindowKey::counter(0, Role::Writer),
            WindowKey::counter(0, Role::Merger)
        );
    }
}
