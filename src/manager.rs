//! Per-stream window catalogue: in-memory time indexes over the backing
//! store, plus the atomic multi-key commits the pipeline stages use.

use std::sync::{Arc, Mutex};

use crate::agg::op::OpSet;
use crate::agg::{DataTable, LandmarkWindow, SummaryWindow};
use crate::error::Result;
use crate::heap::MergeHeap;
use crate::pipeline::merger::{MergerIndex, PendingMerge};
use crate::storage::{BackingStore, QueryIndex, Role};

/// Façade every pipeline stage goes through to read and write one stream's
/// windows. Query indexes mirror the live window ids so range queries can
/// bound their scan before touching the backing store.
pub struct StreamWindowManager {
    id: i64,
    summary_index: Mutex<QueryIndex>,
    landmark_index: Mutex<QueryIndex>,
    operators: OpSet,
    store: BackingStore,
}

impl StreamWindowManager {
    /// Creates the manager for stream `id`.
    pub fn new(id: i64, operators: OpSet, store: BackingStore) -> Self {
        Self {
            id,
            summary_index: Mutex::new(QueryIndex::new()),
            landmark_index: Mutex::new(QueryIndex::new()),
            operators,
            store,
        }
    }

    /// The owning stream's id.
    pub fn stream_id(&self) -> i64 {
        self.id
    }

    /// The stream's configured operators.
    pub fn operators(&self) -> &OpSet {
        &self.operators
    }

    /// Rebuilds both query indexes by scanning the backing store.
    pub fn prime_up(&self) -> Result<()> {
        let summary_ids = self.store.backend().scan_window_ids(self.id, false)?;
        let mut summary_index = self.summary_index.lock().unwrap();
        for id in summary_ids {
            summary_index.add(id);
        }
        drop(summary_index);

        let landmark_ids = self.store.backend().scan_window_ids(self.id, true)?;
        let mut landmark_index = self.landmark_index.lock().unwrap();
        for id in landmark_ids {
            landmark_index.add(id);
        }
        Ok(())
    }

    /// Combines contiguous windows into one; `None` for an empty slice.
    pub fn merge_summary_windows(&self, windows: &[SummaryWindow]) -> Option<SummaryWindow> {
        let first = windows.first()?;
        let last = windows.last()?;
        let mut merged = SummaryWindow::new(
            first.time_start,
            last.time_end,
            first.count_start,
            last.count_end,
        );
        let tables: Vec<DataTable> = windows.iter().map(|w| w.data).collect();
        merged.data = self.operators.merge(&tables);
        Some(merged)
    }

    /// Folds one point into a window through every configured operator.
    pub fn insert_into_summary_window(&self, window: &mut SummaryWindow, timestamp: i64, value: f64) {
        if value == -f64::MAX {
            return;
        }
        self.operators.insert(&mut window.data, value, timestamp);
    }

    /// Reads one summary window.
    pub fn summary_window(&self, swid: i64) -> Result<SummaryWindow> {
        self.store.get(self.id, swid)
    }

    /// Summary windows whose time range overlaps `[t0, t1]`, ascending.
    pub fn summary_windows_in_range(&self, t0: i64, t1: i64) -> Result<Vec<SummaryWindow>> {
        let ids = self.summary_index.lock().unwrap().overlapping_ids(t0, t1);
        let mut windows = Vec::with_capacity(ids.len());
        for id in ids {
            let window = self.summary_window(id)?;
            if window.time_end < t0 || window.time_start > t1 {
                continue;
            }
            windows.push(window);
        }
        Ok(windows)
    }

    /// Writes one summary window.
    pub fn put_summary_window(&self, window: &SummaryWindow) -> Result<()> {
        self.summary_index.lock().unwrap().add(window.id());
        self.store.put(self.id, window.id(), window)
    }

    /// Deletes one summary window.
    pub fn delete_summary_window(&self, swid: i64) -> Result<()> {
        self.summary_index.lock().unwrap().remove(swid);
        self.store.delete(self.id, swid)
    }

    /// Number of live summary windows.
    pub fn num_summary_windows(&self) -> usize {
        self.summary_index.lock().unwrap().len()
    }

    /// Reads one landmark window.
    pub fn landmark_window(&self, lwid: i64) -> Result<LandmarkWindow> {
        self.store.get_landmark(self.id, lwid)
    }

    /// Landmark windows whose interval overlaps `[t0, t1]`, ascending.
    pub fn landmark_windows_in_range(&self, t0: i64, t1: i64) -> Result<Vec<LandmarkWindow>> {
        let ids = self.landmark_index.lock().unwrap().overlapping_ids(t0, t1);
        let mut windows = Vec::with_capacity(ids.len());
        for id in ids {
            let window = self.landmark_window(id)?;
            if window.time_end < t0 || window.time_start > t1 {
                continue;
            }
            windows.push(window);
        }
        Ok(windows)
    }

    /// Writes one landmark window.
    pub fn put_landmark_window(&self, window: &LandmarkWindow) -> Result<()> {
        self.landmark_index.lock().unwrap().add(window.id());
        self.store.put_landmark(self.id, window.id(), window)
    }

    /// Deletes one landmark window.
    pub fn delete_landmark_window(&self, lwid: i64) -> Result<()> {
        self.landmark_index.lock().unwrap().remove(lwid);
        self.store.delete_landmark(self.id, lwid)
    }

    /// Number of live landmark windows.
    pub fn num_landmark_windows(&self) -> usize {
        self.landmark_index.lock().unwrap().len()
    }

    /// The stream's persisted merge heap.
    pub fn heap(&self) -> Result<Option<MergeHeap>> {
        self.store.get_heap(self.id)
    }

    /// The stream's persisted merger index.
    pub fn merger_index(&self) -> Result<Option<MergerIndex>> {
        self.store.get_merger_index(self.id)
    }

    /// A role's durable `(count, latest_time_start)` counter.
    pub fn count_and_time(&self, role: Role) -> Result<Option<(i64, i64)>> {
        self.store.get_count_and_time(self.id, role)
    }

    /// Atomically persists one summarized window plus the writer counter.
    pub fn writer_brew(&self, count: i64, timestamp: i64, window: &SummaryWindow) -> Result<()> {
        self.summary_index.lock().unwrap().add(window.id());
        self.store.writer_brew(self.id, count, timestamp, window)
    }

    /// Atomically applies a merge batch plus the merger's schedule state
    /// and counter.
    pub fn merger_brew(
        &self,
        count: i64,
        timestamp: i64,
        pending: &[PendingMerge],
        heap: &MergeHeap,
        index: &MergerIndex,
    ) -> Result<()> {
        {
            let mut summary_index = self.summary_index.lock().unwrap();
            for merge in pending {
                summary_index.add(merge.merged.id());
                for &swid in &merge.deleted {
                    summary_index.remove(swid);
                }
            }
        }
        self.store
            .merger_brew(self.id, count, timestamp, pending, heap, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Backend, LmdbBackend, MemoryBackend};
    use tempfile::TempDir;

    fn manager_over(backend: Arc<dyn Backend>) -> StreamWindowManager {
        StreamWindowManager::new(
            0,
            OpSet::from_names(&["max", "sum", "count"]).unwrap(),
            BackingStore::new(backend, false),
        )
    }

    fn run_window_crud(manager: &StreamWindowManager) {
        for i in 0..5i64 {
            let mut window = SummaryWindow::new(i * 5, (i + 1) * 5 - 1, i, i + 1);
            manager.insert_into_summary_window(&mut window, i * 5, i as f64);
            manager.put_summary_window(&window).unwrap();
        }
        assert_eq!(manager.num_summary_windows(), 5);

        for i in 0..3i64 {
            let mut window = LandmarkWindow::new(3 * i);
            window.insert(3 * i + 1, i as f64);
            window.close(3 * i + 2);
            manager.put_landmark_window(&window).unwrap();
        }
        assert_eq!(manager.num_landmark_windows(), 3);

        let middle = manager.summary_windows_in_range(6, 16).unwrap();
        assert_eq!(middle.len(), 3);
        for window in &middle {
            assert!(window.time_end > 5);
            assert!(window.time_end < 20);
            manager.delete_summary_window(window.time_start).unwrap();
        }
        assert_eq!(manager.num_summary_windows(), 2);

        let middle_landmarks = manager.landmark_windows_in_range(1, 3).unwrap();
        assert_eq!(middle_landmarks.len(), 2);
        for window in &middle_landmarks {
            manager.delete_landmark_window(window.time_start).unwrap();
        }
        assert_eq!(manager.num_landmark_windows(), 1);
    }

    #[test]
    fn test_window_crud_in_memory() {
        run_window_crud(&manager_over(Arc::new(MemoryBackend::new())));
    }

    #[test]
    fn test_window_crud_lmdb() {
        let dir = TempDir::new().unwrap();
        run_window_crud(&manager_over(Arc::new(LmdbBackend::open(dir.path()).unwrap())));
    }

    #[test]
    fn test_merge_summary_windows() {
        let manager = manager_over(Arc::new(MemoryBackend::new()));
        for i in 0..5i64 {
            let mut window = SummaryWindow::new(i * 5, (i + 1) * 5 - 1, i, i + 1);
            manager.insert_into_summary_window(&mut window, i * 5, (2 * i + 1) as f64);
            manager.put_summary_window(&window).unwrap();
        }
        let windows = manager.summary_windows_in_range(1, 23).unwrap();
        let merged = manager.merge_summary_windows(&windows).unwrap();

        assert_eq!(merged.time_end, 24);
        assert_eq!(merged.data.count, 5.0);
        assert_eq!(merged.data.max, 9.0);
        assert_eq!(merged.data.sum, 25.0);
    }

    #[test]
    fn test_prime_up_rebuilds_indexes() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        {
            let manager = manager_over(Arc::clone(&backend));
            for i in 0..4i64 {
                manager
                    .put_summary_window(&SummaryWindow::new(i * 10, i * 10 + 9, i, i))
                    .unwrap();
            }
            let mut landmark = LandmarkWindow::new(100);
            landmark.close(110);
            manager.put_landmark_window(&landmark).unwrap();
        }

        let manager = manager_over(backend);
        assert_eq!(manager.num_summary_windows(), 0);
        manager.prime_up().unwrap();
        assert_eq!(manager.num_summary_windows(), 4);
        assert_eq!(manager.num_landmark_windows(), 1);
        assert_eq!(manager.summary_windows_in_range(0, 40).unwrap().len(), 4);
    }
}
