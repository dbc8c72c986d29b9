//! Merger stage: keeps the windowing invariant valid under appends.
//!
//! For every adjacent window pair the windowing oracle names the element
//! count at which the pair must merge; those deadlines live in a min-heap.
//! When a deadline falls due the successor is absorbed into its head - first
//! only in the in-memory index and a pending-merge forest, so that a cascade
//! of due merges costs one index update each. Every `windows_per_batch`
//! arrivals the accumulated merges are issued as a single atomic commit.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crossbeam::channel::Receiver;
use tracing::debug;

use crate::agg::SummaryWindow;
use crate::error::Result;
use crate::heap::MergeHeap;
use crate::manager::StreamWindowManager;
use crate::pipeline::{Barrier, EventPayload, FaultSlot, Stage};
use crate::storage::Role;
use crate::window::GenericWindowing;
use crate::INVALID;

/// Announcement of one persisted summary window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeEvent {
    /// Window id.
    pub id: i64,
    /// Number of elements the window covers.
    pub size: i64,
}

/// One merge ready to be committed: the combined window plus the ids it
/// absorbs. The merged window keeps its head's id, so the put overwrites the
/// head record in place.
#[derive(Debug, Clone)]
pub struct PendingMerge {
    /// The combined summary window.
    pub merged: SummaryWindow,
    /// Ids of the absorbed windows, deleted by the commit.
    pub deleted: Vec<i64>,
}

#[derive(Debug, Default)]
struct MergerIndexItem {
    c_end: i64,
    in_heap: bool,
}

/// Ordered map over live window ids carrying each window's count end and
/// whether a merge deadline is scheduled for it.
///
/// A window's count start is derived: zero for the minimum key, otherwise
/// its predecessor's count end plus one. Lookups taking or returning window
/// ids use [`INVALID`] for "none".
#[derive(Debug, Default)]
pub struct MergerIndex {
    map: BTreeMap<i64, MergerIndexItem>,
}

impl MergerIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live windows.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no windows are live.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts or replaces a window's entry; a replaced entry loses its
    /// heap membership flag.
    pub fn put(&mut self, swid: i64, c_end: i64) {
        if swid == INVALID {
            return;
        }
        self.map.insert(
            swid,
            MergerIndexItem {
                c_end,
                in_heap: false,
            },
        );
    }

    fn remove(&mut self, swid: i64) -> Option<MergerIndexItem> {
        if swid == INVALID {
            return None;
        }
        self.map.remove(&swid)
    }

    /// True when `swid` is live.
    pub fn contains(&self, swid: i64) -> bool {
        swid != INVALID && self.map.contains_key(&swid)
    }

    /// The window's first covered element, derived from its predecessor.
    pub fn c_start(&self, swid: i64) -> i64 {
        if !self.contains(swid) {
            return INVALID;
        }
        match self.map.range(..swid).next_back() {
            Some((_, item)) => item.c_end + 1,
            None => 0,
        }
    }

    /// The window's last covered element.
    pub fn c_end(&self, swid: i64) -> i64 {
        if swid == INVALID {
            return INVALID;
        }
        self.map.get(&swid).map_or(INVALID, |item| item.c_end)
    }

    /// The id preceding `swid`, or [`INVALID`].
    pub fn pred(&self, swid: i64) -> i64 {
        if !self.contains(swid) {
            return INVALID;
        }
        self.map
            .range(..swid)
            .next_back()
            .map_or(INVALID, |(&k, _)| k)
    }

    /// The id following `swid`, or [`INVALID`].
    pub fn succ(&self, swid: i64) -> i64 {
        if !self.contains(swid) {
            return INVALID;
        }
        self.map
            .range((Bound::Excluded(swid), Bound::Unbounded))
            .next()
            .map_or(INVALID, |(&k, _)| k)
    }

    /// The largest live id, or [`INVALID`] when empty.
    pub fn last_swid(&self) -> i64 {
        self.map.keys().next_back().copied().unwrap_or(INVALID)
    }

    /// Clears the window's heap membership; true when it was set.
    pub fn unset_heap_item(&mut self, swid: i64) -> bool {
        if swid == INVALID {
            return false;
        }
        match self.map.get_mut(&swid) {
            Some(item) => std::mem::take(&mut item.in_heap),
            None => false,
        }
    }

    /// Marks the window as having a scheduled merge deadline.
    pub fn set_heap_item(&mut self, swid: i64) -> bool {
        if swid == INVALID {
            return false;
        }
        match self.map.get_mut(&swid) {
            Some(item) => {
                item.in_heap = true;
                true
            }
            None => false,
        }
    }

    /// Reattaches heap membership flags from a recovered heap.
    pub fn populate_from_heap(&mut self, heap: &MergeHeap) {
        for item in heap.items() {
            self.set_heap_item(item.value);
        }
    }

    /// `(swid, c_end)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.map.iter().map(|(&swid, item)| (swid, item.c_end))
    }
}

struct MergerState {
    windows_per_batch: i64,
    merge_counts: MergeHeap,
    index: MergerIndex,
    num_elements: i64,
    num_windows: i64,
    latest_time_start: i64,
    pending_merges: BTreeMap<i64, Vec<i64>>,
}

/// Final pipeline stage: schedules and applies window merges.
pub struct Merger {
    manager: Arc<StreamWindowManager>,
    windowing: Arc<Mutex<GenericWindowing>>,
    barrier: Arc<Barrier>,
    state: Mutex<MergerState>,
}

impl Merger {
    /// Creates a merger batching `windows_per_batch` arrivals per commit.
    pub fn new(
        manager: Arc<StreamWindowManager>,
        windowing: Arc<Mutex<GenericWindowing>>,
        barrier: Arc<Barrier>,
        windows_per_batch: i64,
    ) -> Self {
        Self {
            manager,
            windowing,
            barrier,
            state: Mutex::new(MergerState {
                windows_per_batch,
                merge_counts: MergeHeap::new(),
                index: MergerIndex::new(),
                num_elements: 0,
                num_windows: 0,
                latest_time_start: 0,
                pending_merges: BTreeMap::new(),
            }),
        }
    }

    /// Loads the persisted heap, index and progress counter.
    pub fn prime_up(&self) -> Result<()> {
        let heap = self.manager.heap()?.unwrap_or_default();
        let mut index = self.manager.merger_index()?.unwrap_or_default();
        index.populate_from_heap(&heap);
        let (num_elements, latest_time_start) = self
            .manager
            .count_and_time(Role::Merger)?
            .unwrap_or((0, 0));

        let mut state = self.state.lock().unwrap();
        state.merge_counts = heap;
        state.index = index;
        state.num_elements = num_elements;
        state.latest_time_start = latest_time_start;
        state.num_windows = state.index.len() as i64;
        Ok(())
    }

    /// Elements acknowledged by the last merge commit.
    pub fn num_elements(&self) -> i64 {
        self.state.lock().unwrap().num_elements
    }

    /// Merges staged but not yet committed.
    pub fn num_unissued_merges(&self) -> usize {
        self.state.lock().unwrap().pending_merges.len()
    }

    /// Current batch size.
    pub fn windows_per_batch(&self) -> i64 {
        self.state.lock().unwrap().windows_per_batch
    }

    /// Sets the number of arrivals bundled into one commit.
    pub fn set_windows_per_batch(&self, windows_per_batch: i64) {
        self.state.lock().unwrap().windows_per_batch = windows_per_batch;
    }

    /// Given consecutive windows spanning counts `[c0, c1]` with `w` at the
    /// head, reschedules `w`'s merge deadline: the first `n' >= n` at which
    /// the pair must be absorbed into one window.
    fn update_merge_count_for(&self, state: &mut MergerState, w: i64, c0: i64, c1: i64, n: i64) {
        if w == INVALID || c0 == INVALID || c1 == INVALID {
            return;
        }
        if state.index.unset_heap_item(w) {
            state.merge_counts.remove(w);
        }
        let merge_count = self.windowing.lock().unwrap().first_containing_time(c0, c1, n);
        if let Some(merge_count) = merge_count {
            state.merge_counts.push(w, merge_count);
            state.index.set_heap_item(w);
        }
    }

    /// Stages the absorption of `absorbed` (and any chain already headed at
    /// it) into `head`.
    fn add_pending_merge(state: &mut MergerState, head: i64, absorbed: i64) {
        if head == INVALID || absorbed == INVALID {
            return;
        }
        let mut tail = state.pending_merges.remove(&head).unwrap_or_default();
        tail.push(absorbed);
        if let Some(transitive) = state.pending_merges.remove(&absorbed) {
            tail.extend(transitive);
        }
        state.pending_merges.insert(head, tail);
    }

    /// Drains every due deadline from the heap, staging merges and
    /// rescheduling the affected neighbours.
    fn update_pending_merges(&self, state: &mut MergerState) {
        loop {
            let due = match state.merge_counts.peek() {
                Some(item) if item.priority <= state.num_elements => item.value,
                _ => break,
            };
            state.merge_counts.pop();
            state.index.unset_heap_item(due);

            let w1 = due;
            let w2 = state.index.succ(w1);
            if w2 == INVALID {
                continue;
            }
            let w0 = state.index.pred(w1);
            let w3 = state.index.succ(w2);

            let w1_new_start = state.index.c_start(w1);
            let w1_new_end = state.index.c_end(w2);

            Self::add_pending_merge(state, w1, w2);
            let removed = state.index.remove(w2);
            state.index.put(w1, w1_new_end);
            if removed.is_some_and(|item| item.in_heap) {
                state.merge_counts.remove(w2);
            }

            let w0_start = state.index.c_start(w0);
            let w3_end = state.index.c_end(w3);
            let n = state.num_elements;
            self.update_merge_count_for(state, w0, w0_start, w1_new_end, n);
            self.update_merge_count_for(state, w1, w1_new_start, w3_end, n);
        }
    }

    /// Materialises every staged merge and commits them, together with the
    /// serialized heap, index and progress counter, in one atomic batch.
    ///
    /// A failed commit leaves the staging intact; the next successful
    /// commit retries the same merges.
    fn issue_all_pending_merges(&self, state: &mut MergerState) -> Result<()> {
        let mut pending = Vec::with_capacity(state.pending_merges.len());
        for (&head, tail) in &state.pending_merges {
            if tail.is_empty() {
                continue;
            }
            let mut windows = Vec::with_capacity(tail.len() + 1);
            windows.push(self.manager.summary_window(head)?);
            for &swid in tail {
                windows.push(self.manager.summary_window(swid)?);
            }
            let Some(merged) = self.manager.merge_summary_windows(&windows) else {
                continue;
            };
            pending.push(PendingMerge {
                merged,
                deleted: tail.clone(),
            });
        }
        if !pending.is_empty() {
            debug!(merges = pending.len(), "committing merge batch");
        }
        self.manager.merger_brew(
            state.num_elements,
            state.latest_time_start,
            &pending,
            &state.merge_counts,
            &state.index,
        )?;
        state.pending_merges.clear();
        Ok(())
    }

    /// Folds one announced window into the schedule.
    pub fn process(&self, event: MergeEvent) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.latest_time_start = event.id;
        state.num_elements += event.size;
        state.num_windows += 1;

        // The previously-last window now has a successor; reschedule it
        // against the newcomer.
        let last = state.index.last_swid();
        if last != INVALID {
            let c_start = state.index.c_start(last);
            let (c1, n) = (state.num_elements - 1, state.num_elements);
            self.update_merge_count_for(&mut state, last, c_start, c1, n);
        }

        let c_end = state.num_elements - 1;
        state.index.put(event.id, c_end);
        self.update_pending_merges(&mut state);
        if state.num_windows % state.windows_per_batch == 0 {
            self.issue_all_pending_merges(&mut state)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let result = self.issue_all_pending_merges(&mut state);
        drop(state);
        self.barrier.notify(Stage::Merger);
        result
    }

    /// Consumes the merger queue until shutdown or disconnect.
    pub(crate) fn run(self: Arc<Self>, input: Receiver<EventPayload>, fault: FaultSlot) {
        loop {
            match input.recv() {
                Ok(EventPayload::Data(event)) => {
                    if let Err(e) = self.process(event) {
                        fault.set(e);
                        self.barrier.notify(Stage::Merger);
                        break;
                    }
                }
                Ok(EventPayload::Flush) => {
                    if let Err(e) = self.flush() {
                        fault.set(e);
                        break;
                    }
                }
                Ok(EventPayload::Shutdown) => {
                    if let Err(e) = self.flush() {
                        fault.set(e);
                    }
                    break;
                }
                Err(_) => break,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn state_snapshot(&self) -> (Vec<(i64, i64)>, usize) {
        let state = self.state.lock().unwrap();
        (state.index.iter().collect(), state.merge_counts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agg::op::OpSet;
    use crate::pipeline::writer::Writer;
    use crate::storage::{BackingStore, MemoryBackend};
    use crate::window::WindowingSpec;

    fn test_rig(windows_per_batch: i64) -> (Arc<StreamWindowManager>, Writer, Merger) {
        let store = BackingStore::new(Arc::new(MemoryBackend::new()), false);
        let manager = Arc::new(StreamWindowManager::new(
            0,
            OpSet::from_names(&["count"]).unwrap(),
            store,
        ));
        let barrier = Arc::new(Barrier::new());
        let windowing = Arc::new(Mutex::new(GenericWindowing::new(
            WindowingSpec::Exponential { base: 2.0 }.sequence(),
        )));
        let writer = Writer::new(Arc::clone(&manager), Arc::clone(&barrier));
        let merger = Merger::new(Arc::clone(&manager), windowing, barrier, windows_per_batch);
        (manager, writer, merger)
    }

    fn append_point(manager: &StreamWindowManager, writer: &Writer, merger: &Merger, i: i64) {
        let mut window = SummaryWindow::new(i, i, i, i);
        manager.insert_into_summary_window(&mut window, i, 0.0);
        let event = writer.process(window).unwrap();
        merger.process(event).unwrap();
    }

    fn window_sizes(manager: &StreamWindowManager, upto: i64) -> Vec<i64> {
        manager
            .summary_windows_in_range(0, upto)
            .unwrap()
            .iter()
            .map(|w| w.data.count as i64)
            .collect()
    }

    #[test]
    fn test_merge_index_derived_counts() {
        let mut index = MergerIndex::new();
        index.put(0, 3);
        index.put(10, 7);
        index.put(20, 9);

        assert_eq!(index.c_start(0), 0);
        assert_eq!(index.c_start(10), 4);
        assert_eq!(index.c_start(20), 8);
        assert_eq!(index.c_end(20), 9);
        assert_eq!(index.pred(10), 0);
        assert_eq!(index.succ(10), 20);
        assert_eq!(index.pred(0), INVALID);
        assert_eq!(index.succ(20), INVALID);
        assert_eq!(index.last_swid(), 20);
        assert_eq!(index.c_start(5), INVALID);
    }

    #[test]
    fn test_merge_index_heap_flags() {
        let mut index = MergerIndex::new();
        index.put(3, 5);
        assert!(!index.unset_heap_item(3));
        assert!(index.set_heap_item(3));
        assert!(index.unset_heap_item(3));
        assert!(!index.unset_heap_item(3));
        assert!(!index.set_heap_item(99));
    }

    #[test]
    fn test_exponential_evolution_first_steps() {
        let (manager, writer, merger) = test_rig(1);
        let expected: [&[i64]; 5] = [&[1], &[1, 1], &[2, 1], &[2, 1, 1], &[2, 2, 1]];
        for i in 0..5i64 {
            append_point(&manager, &writer, &merger, i);
            assert_eq!(window_sizes(&manager, i), expected[i as usize], "step {i}");
        }
    }

    #[test]
    fn test_batched_merges_issue_on_schedule() {
        let (manager, writer, merger) = test_rig(4);
        for i in 0..3i64 {
            append_point(&manager, &writer, &merger, i);
        }
        // Merges for the first three arrivals are staged but uncommitted.
        assert!(merger.num_unissued_merges() > 0);
        append_point(&manager, &writer, &merger, 3);
        assert_eq!(merger.num_unissued_merges(), 0);
        assert_eq!(window_sizes(&manager, 3), vec![2, 1, 1]);
    }

    #[test]
    fn test_prime_up_round_trips_schedule() {
        let (manager, writer, merger) = test_rig(1);
        for i in 0..20i64 {
            append_point(&manager, &writer, &merger, i);
        }
        let (index_before, heap_len_before) = merger.state_snapshot();

        let windowing = Arc::new(Mutex::new(GenericWindowing::new(
            WindowingSpec::Exponential { base: 2.0 }.sequence(),
        )));
        let recovered = Merger::new(
            Arc::clone(&manager),
            windowing,
            Arc::new(Barrier::new()),
            1,
        );
        recovered.prime_up().unwrap();
        let (index_after, heap_len_after) = recovered.state_snapshot();

        assert_eq!(index_before, index_after);
        assert_eq!(heap_len_before, heap_len_after);
        assert_eq!(recovered.num_elements(), 20);
    }
}
