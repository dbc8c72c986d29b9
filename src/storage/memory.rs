//! In-memory backend used by tests and unbacked pipelines.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::storage::{Backend, WindowKey, WriteBatch};

/// A [`Backend`] over ordered in-memory maps.
///
/// Commits take the map lock once, which makes the multi-key batch atomic
/// with respect to every other operation.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    windows: Mutex<BTreeMap<[u8; WindowKey::LEN], Vec<u8>>>,
    meta: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &WindowKey) -> Result<Option<Vec<u8>>> {
        let windows = self.windows.lock().unwrap();
        Ok(windows.get(&key.encode()).cloned())
    }

    fn put(&self, key: &WindowKey, value: &[u8]) -> Result<()> {
        let mut windows = self.windows.lock().unwrap();
        windows.insert(key.encode(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &WindowKey) -> Result<()> {
        let mut windows = self.windows.lock().unwrap();
        windows.remove(&key.encode());
        Ok(())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut windows = self.windows.lock().unwrap();
        let mut meta = self.meta.lock().unwrap();
        for (key, value) in batch.puts {
            windows.insert(key.encode(), value);
        }
        for key in batch.deletes {
            windows.remove(&key.encode());
        }
        for (key, value) in batch.meta_puts {
            meta.insert(key, value);
        }
        Ok(())
    }

    fn scan_window_ids(&self, stream_id: i64, landmark: bool) -> Result<Vec<i64>> {
        let prefix = WindowKey::prefix(stream_id, landmark);
        let windows = self.windows.lock().unwrap();
        let mut ids = Vec::new();
        for raw in windows.keys() {
            if raw[..9] != prefix {
                continue;
            }
            let key = WindowKey::decode(raw)?;
            if !WindowKey::is_reserved(key.window_id) {
                ids.push(key.window_id);
            }
        }
        Ok(ids)
    }

    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let meta = self.meta.lock().unwrap();
        Ok(meta.get(key).cloned())
    }

    fn put_meta(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut meta = self.meta.lock().unwrap();
        meta.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let backend = MemoryBackend::new();
        let key = WindowKey::summary(0, 10);
        backend.put(&key, b"abc").unwrap();
        assert_eq!(backend.get(&key).unwrap().unwrap(), b"abc");
        backend.delete(&key).unwrap();
        assert!(backend.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_commit_applies_all_ops() {
        let backend = MemoryBackend::new();
        let stale = WindowKey::summary(0, 1);
        backend.put(&stale, b"old").unwrap();

        let mut batch = WriteBatch::new();
        batch.put(WindowKey::summary(0, 2), b"two".to_vec());
        batch.put(WindowKey::summary(0, 3), b"three".to_vec());
        batch.delete(stale);
        batch.put_meta(b"db".to_vec(), b"catalogue".to_vec());
        backend.commit(batch).unwrap();

        assert!(backend.get(&stale).unwrap().is_none());
        assert_eq!(
            backend.get(&WindowKey::summary(0, 2)).unwrap().unwrap(),
            b"two"
        );
        assert_eq!(backend.get_meta(b"db").unwrap().unwrap(), b"catalogue");
    }

    #[test]
    fn test_scan_skips_reserved_and_other_streams() {
        let backend = MemoryBackend::new();
        backend.put(&WindowKey::summary(0, 5), b"w").unwrap();
        backend.put(&WindowKey::summary(0, 9), b"w").unwrap();
        backend.put(&WindowKey::summary(1, 7), b"w").unwrap();
        backend.put(&WindowKey::landmark(0, 6), b"l").unwrap();
        backend.put(&WindowKey::heap(0), b"h").unwrap();

        let mut ids = backend.scan_window_ids(0, false).unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![5, 9]);
        assert_eq!(backend.scan_window_ids(0, true).unwrap(), vec![6]);
    }
}
