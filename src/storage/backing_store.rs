//! Typed façade over a byte-oriented backend, with read-through caches.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::agg::{LandmarkWindow, SummaryWindow};
use crate::error::{Result, StoreError};
use crate::heap::MergeHeap;
use crate::pipeline::merger::{MergerIndex, PendingMerge};
use crate::storage::{codec, Backend, Role, WindowKey, WriteBatch};

/// Capacity of each in-process window cache, in entries.
const CACHE_CAPACITY: usize = 4096;

type WindowCache<T> = Mutex<LruCache<(i64, i64), T>>;

fn new_cache<T>() -> WindowCache<T> {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
    ))
}

/// Decoded-record view of a [`Backend`], shared by every stream.
///
/// Summary and landmark windows go through separate read-through caches;
/// writes and the brew commits update the caches to the post-commit state,
/// so a cached read never diverges from the backend.
pub struct BackingStore {
    backend: Arc<dyn Backend>,
    summary_cache: Option<WindowCache<SummaryWindow>>,
    landmark_cache: Option<WindowCache<LandmarkWindow>>,
}

impl BackingStore {
    /// Wraps a backend, optionally with read caches.
    pub fn new(backend: Arc<dyn Backend>, cache_enabled: bool) -> Self {
        Self {
            backend,
            summary_cache: cache_enabled.then(new_cache),
            landmark_cache: cache_enabled.then(new_cache),
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Reads a summary window.
    pub fn get(&self, stream_id: i64, window_id: i64) -> Result<SummaryWindow> {
        if let Some(cache) = &self.summary_cache {
            if let Some(window) = cache.lock().unwrap().get(&(stream_id, window_id)) {
                return Ok(window.clone());
            }
        }
        let key = WindowKey::summary(stream_id, window_id);
        let buf = self
            .backend
            .get(&key)?
            .ok_or(StoreError::WindowNotFound { stream_id, window_id })?;
        let window = codec::decode_summary_window(&buf)?;
        if let Some(cache) = &self.summary_cache {
            cache
                .lock()
                .unwrap()
                .put((stream_id, window_id), window.clone());
        }
        Ok(window)
    }

    /// Writes a summary window.
    pub fn put(&self, stream_id: i64, window_id: i64, window: &SummaryWindow) -> Result<()> {
        let key = WindowKey::summary(stream_id, window_id);
        self.backend
            .put(&key, &codec::encode_summary_window(window))?;
        if let Some(cache) = &self.summary_cache {
            cache
                .lock()
                .unwrap()
                .put((stream_id, window_id), window.clone());
        }
        Ok(())
    }

    /// Deletes a summary window.
    pub fn delete(&self, stream_id: i64, window_id: i64) -> Result<()> {
        self.backend
            .delete(&WindowKey::summary(stream_id, window_id))?;
        if let Some(cache) = &self.summary_cache {
            cache.lock().unwrap().pop(&(stream_id, window_id));
        }
        Ok(())
    }

    /// Reads a landmark window.
    pub fn get_landmark(&self, stream_id: i64, window_id: i64) -> Result<LandmarkWindow> {
        if let Some(cache) = &self.landmark_cache {
            if let Some(window) = cache.lock().unwrap().get(&(stream_id, window_id)) {
                return Ok(window.clone());
            }
        }
        let key = WindowKey::landmark(stream_id, window_id);
        let buf = self
            .backend
            .get(&key)?
            .ok_or(StoreError::WindowNotFound { stream_id, window_id })?;
        let window = codec::decode_landmark_window(&buf)?;
        if let Some(cache) = &self.landmark_cache {
            cache
                .lock()
                .unwrap()
                .put((stream_id, window_id), window.clone());
        }
        Ok(window)
    }

    /// Writes a landmark window.
    pub fn put_landmark(&self, stream_id: i64, window_id: i64, window: &LandmarkWindow) -> Result<()> {
        let key = WindowKey::landmark(stream_id, window_id);
        self.backend
            .put(&key, &codec::encode_landmark_window(window))?;
        if let Some(cache) = &self.landmark_cache {
            cache
                .lock()
                .unwrap()
                .put((stream_id, window_id), window.clone());
        }
        Ok(())
    }

    /// Deletes a landmark window.
    pub fn delete_landmark(&self, stream_id: i64, window_id: i64) -> Result<()> {
        self.backend
            .delete(&WindowKey::landmark(stream_id, window_id))?;
        if let Some(cache) = &self.landmark_cache {
            cache.lock().unwrap().pop(&(stream_id, window_id));
        }
        Ok(())
    }

    /// Reads the stream's persisted merge heap, if any.
    pub fn get_heap(&self, stream_id: i64) -> Result<Option<MergeHeap>> {
        match self.backend.get(&WindowKey::heap(stream_id))? {
            Some(buf) => Ok(Some(codec::decode_heap(&buf)?)),
            None => Ok(None),
        }
    }

    /// Reads the stream's persisted merger index, if any.
    pub fn get_merger_index(&self, stream_id: i64) -> Result<Option<MergerIndex>> {
        match self.backend.get(&WindowKey::merger_index(stream_id))? {
            Some(buf) => Ok(Some(codec::decode_merger_index(&buf)?)),
            None => Ok(None),
        }
    }

    /// Reads a role's durable counter; `None` on first boot.
    pub fn get_count_and_time(&self, stream_id: i64, role: Role) -> Result<Option<(i64, i64)>> {
        match self.backend.get(&WindowKey::counter(stream_id, role))? {
            Some(buf) => Ok(Some(codec::decode_counter(&buf)?)),
            None => Ok(None),
        }
    }

    /// Atomically persists one freshly summarized window together with the
    /// writer's progress counter.
    pub fn writer_brew(
        &self,
        stream_id: i64,
        count: i64,
        timestamp: i64,
        window: &SummaryWindow,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(
            WindowKey::summary(stream_id, window.id()),
            codec::encode_summary_window(window),
        );
        batch.put(
            WindowKey::counter(stream_id, Role::Writer),
            codec::encode_counter(count, timestamp).to_vec(),
        );
        self.backend.commit(batch)?;
        if let Some(cache) = &self.summary_cache {
            cache
                .lock()
                .unwrap()
                .put((stream_id, window.id()), window.clone());
        }
        Ok(())
    }

    /// Atomically applies a batch of merges: merged windows, deletions of
    /// the absorbed ids, the serialized heap and merger index, and the
    /// merger's progress counter.
    pub fn merger_brew(
        &self,
        stream_id: i64,
        count: i64,
        timestamp: i64,
        pending: &[PendingMerge],
        heap: &MergeHeap,
        index: &MergerIndex,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        for merge in pending {
            batch.put(
                WindowKey::summary(stream_id, merge.merged.id()),
                codec::encode_summary_window(&merge.merged),
            );
            for &window_id in &merge.deleted {
                batch.delete(WindowKey::summary(stream_id, window_id));
            }
        }
        batch.put(WindowKey::heap(stream_id), codec::encode_heap(heap));
        batch.put(
            WindowKey::merger_index(stream_id),
            codec::encode_merger_index(index),
        );
        batch.put(
            WindowKey::counter(stream_id, Role::Merger),
            codec::encode_counter(count, timestamp).to_vec(),
        );
        self.backend.commit(batch)?;

        if let Some(cache) = &self.summary_cache {
            let mut cache = cache.lock().unwrap();
            for merge in pending {
                cache.put((stream_id, merge.merged.id()), merge.merged.clone());
                for &window_id in &merge.deleted {
                    cache.pop(&(stream_id, window_id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn store(cache: bool) -> BackingStore {
        BackingStore::new(Arc::new(MemoryBackend::new()), cache)
    }

    fn sample_window(id: i64) -> SummaryWindow {
        let mut window = SummaryWindow::new(id, id + 4, id, id + 4);
        window.data.count = 5.0;
        window.data.sum = 10.0;
        window
    }

    #[test]
    fn test_summary_round_trip_with_and_without_cache() {
        for cache in [false, true] {
            let store = store(cache);
            let window = sample_window(0);
            store.put(0, window.id(), &window).unwrap();
            assert_eq!(store.get(0, window.id()).unwrap(), window);
            // Second read serves from cache when enabled.
            assert_eq!(store.get(0, window.id()).unwrap(), window);
        }
    }

    #[test]
    fn test_missing_window_is_not_found() {
        let store = store(true);
        let err = store.get(0, 99).unwrap_err();
        assert!(matches!(err, StoreError::WindowNotFound { window_id: 99, .. }));
    }

    #[test]
    fn test_delete_invalidates_cache() {
        let store = store(true);
        let window = sample_window(7);
        store.put(0, window.id(), &window).unwrap();
        store.get(0, window.id()).unwrap();
        store.delete(0, window.id()).unwrap();
        assert!(store.get(0, window.id()).is_err());
    }

    #[test]
    fn test_landmark_round_trip() {
        let store = store(true);
        let mut window = LandmarkWindow::new(3);
        window.insert(4, 1.5);
        window.close(9);
        store.put_landmark(1, window.id(), &window).unwrap();
        assert_eq!(store.get_landmark(1, window.id()).unwrap(), window);
        store.delete_landmark(1, window.id()).unwrap();
        assert!(store.get_landmark(1, window.id()).is_err());
    }

    #[test]
    fn test_writer_brew_persists_window_and_counter() {
        let store = store(true);
        let window = sample_window(10);
        store.writer_brew(0, 5, 10, &window).unwrap();
        assert_eq!(store.get(0, 10).unwrap(), window);
        assert_eq!(
            store.get_count_and_time(0, Role::Writer).unwrap(),
            Some((5, 10))
        );
        assert_eq!(store.get_count_and_time(0, Role::Merger).unwrap(), None);
    }

    #[test]
    fn test_merger_brew_replaces_absorbed_windows() {
        let store = store(true);
        let head = sample_window(0);
        let tail = sample_window(5);
        store.writer_brew(0, 5, 0, &head).unwrap();
        store.writer_brew(0, 10, 5, &tail).unwrap();

        let mut merged = SummaryWindow::new(0, 9, 0, 9);
        merged.data.count = 10.0;
        let pending = vec![PendingMerge {
            merged: merged.clone(),
            deleted: vec![5],
        }];
        let mut heap = MergeHeap::new();
        heap.push(0, 20);
        let mut index = MergerIndex::new();
        index.put(0, 9);

        store.merger_brew(0, 10, 5, &pending, &heap, &index).unwrap();

        assert_eq!(store.get(0, 0).unwrap(), merged);
        assert!(store.get(0, 5).is_err());
        assert_eq!(
            store.get_count_and_time(0, Role::Merger).unwrap(),
            Some((10, 5))
        );
        let recovered_heap = store.get_heap(0).unwrap().unwrap();
        assert_eq!(recovered_heap.len(), 1);
        let recovered_index = store.get_merger_index(0).unwrap().unwrap();
        assert_eq!(recovered_index.iter().collect::<Vec<_>>(), vec![(0, 9)]);
    }
}
