//! LMDB-resident backend via `heed`.
//!
//! Two named databases share one environment: `windows` holds summary and
//! landmark records under the 17-byte composite key, `meta` holds the
//! database catalogue and per-stream metadata. A [`WriteBatch`] maps to a
//! single LMDB write transaction, which is the atomic multi-key commit the
//! writer and merger rely on.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use crate::error::Result;
use crate::storage::{Backend, WindowKey, WriteBatch};

/// Maximum size of the memory map (1 GiB).
const MAP_SIZE: usize = 1 << 30;

/// A [`Backend`] persisted in an LMDB environment.
pub struct LmdbBackend {
    env: Env,
    windows: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
}

impl LmdbBackend {
    /// Opens (or creates) the environment rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(2)
                .open(dir)?
        };
        let mut txn = env.write_txn()?;
        let windows = env.create_database::<Bytes, Bytes>(&mut txn, Some("windows"))?;
        let meta = env.create_database::<Bytes, Bytes>(&mut txn, Some("meta"))?;
        txn.commit()?;
        Ok(Self { env, windows, meta })
    }
}

impl Backend for LmdbBackend {
    fn get(&self, key: &WindowKey) -> Result<Option<Vec<u8>>> {
        let txn = self.env.read_txn()?;
        Ok(self.windows.get(&txn, &key.encode())?.map(<[u8]>::to_vec))
    }

    fn put(&self, key: &WindowKey, value: &[u8]) -> Result<()> {
        let mut txn = self.env.write_txn()?;
        self.windows.put(&mut txn, &key.encode(), value)?;
        txn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &WindowKey) -> Result<()> {
        let mut txn = self.env.write_txn()?;
        self.windows.delete(&mut txn, &key.encode())?;
        txn.commit()?;
        Ok(())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut txn = self.env.write_txn()?;
        for (key, value) in &batch.puts {
            self.windows.put(&mut txn, &key.encode(), value)?;
        }
        for key in &batch.deletes {
            self.windows.delete(&mut txn, &key.encode())?;
        }
        for (key, value) in &batch.meta_puts {
            self.meta.put(&mut txn, key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn scan_window_ids(&self, stream_id: i64, landmark: bool) -> Result<Vec<i64>> {
        let prefix = WindowKey::prefix(stream_id, landmark);
        let txn = self.env.read_txn()?;
        let mut ids = Vec::new();
        for entry in self.windows.prefix_iter(&txn, &prefix)? {
            let (raw, _) = entry?;
            let key = WindowKey::decode(raw)?;
            if !WindowKey::is_reserved(key.window_id) {
                ids.push(key.window_id);
            }
        }
        Ok(ids)
    }

    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.env.read_txn()?;
        Ok(self.meta.get(&txn, key)?.map(<[u8]>::to_vec))
    }

    fn put_meta(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut txn = self.env.write_txn()?;
        self.meta.put(&mut txn, key, value)?;
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let backend = LmdbBackend::open(dir.path()).unwrap();
        let key = WindowKey::summary(3, 21);
        backend.put(&key, b"window").unwrap();
        assert_eq!(backend.get(&key).unwrap().unwrap(), b"window");
        backend.delete(&key).unwrap();
        assert!(backend.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_commit_is_atomic_over_puts_and_deletes() {
        let dir = TempDir::new().unwrap();
        let backend = LmdbBackend::open(dir.path()).unwrap();
        let old = WindowKey::summary(0, 4);
        backend.put(&old, b"old").unwrap();

        let mut batch = WriteBatch::new();
        batch.put(WindowKey::summary(0, 8), b"merged".to_vec());
        batch.delete(old);
        batch.put_meta(b"stream-0".to_vec(), b"meta".to_vec());
        backend.commit(batch).unwrap();

        assert!(backend.get(&old).unwrap().is_none());
        assert_eq!(
            backend.get(&WindowKey::summary(0, 8)).unwrap().unwrap(),
            b"merged"
        );
        assert_eq!(backend.get_meta(b"stream-0").unwrap().unwrap(), b"meta");
    }

    #[test]
    fn test_scan_filters_namespace_and_reserved() {
        let dir = TempDir::new().unwrap();
        let backend = LmdbBackend::open(dir.path()).unwrap();
        backend.put(&WindowKey::summary(5, 100), b"w").unwrap();
        backend.put(&WindowKey::summary(5, 200), b"w").unwrap();
        backend.put(&WindowKey::landmark(5, 150), b"l").unwrap();
        backend.put(&WindowKey::heap(5), b"h").unwrap();
        backend.put(&WindowKey::merger_index(5), b"i").unwrap();

        let mut ids = backend.scan_window_ids(5, false).unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![100, 200]);
        assert_eq!(backend.scan_window_ids(5, true).unwrap(), vec![150]);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        let key = WindowKey::summary(0, 7);
        {
            let backend = LmdbBackend::open(dir.path()).unwrap();
            backend.put(&key, b"durable").unwrap();
        }
        let backend = LmdbBackend::open(dir.path()).unwrap();
        assert_eq!(backend.get(&key).unwrap().unwrap(), b"durable");
    }
}
