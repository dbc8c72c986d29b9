//! Evolution traces of the merge scheduler: after every append the persisted
//! window sizes must match the canonical re-bucketing for the windowing.

use std::sync::Arc;

use cairn::agg::op::OpSet;
use cairn::manager::StreamWindowManager;
use cairn::pipeline::Pipeline;
use cairn::storage::{BackingStore, MemoryBackend};
use cairn::window::{GenericWindowing, WindowingSpec};

/// Expected persisted window sizes (descending age) after appending i+1
/// points with exponential base-2 windowing.
const EXPECTED_EVOLUTION: [&[i64]; 31] = [
    &[1],
    &[1, 1],
    &[2, 1],
    &[2, 1, 1],
    &[2, 2, 1],
    &[2, 2, 1, 1],
    &[4, 2, 1],
    &[4, 2, 1, 1],
    &[4, 2, 2, 1],
    &[4, 2, 2, 1, 1],
    &[4, 4, 2, 1],
    &[4, 4, 2, 1, 1],
    &[4, 4, 2, 2, 1],
    &[4, 4, 2, 2, 1, 1],
    &[8, 4, 2, 1],
    &[8, 4, 2, 1, 1],
    &[8, 4, 2, 2, 1],
    &[8, 4, 2, 2, 1, 1],
    &[8, 4, 4, 2, 1],
    &[8, 4, 4, 2, 1, 1],
    &[8, 4, 4, 2, 2, 1],
    &[8, 4, 4, 2, 2, 1, 1],
    &[8, 8, 4, 2, 1],
    &[8, 8, 4, 2, 1, 1],
    &[8, 8, 4, 2, 2, 1],
    &[8, 8, 4, 2, 2, 1, 1],
    &[8, 8, 4, 4, 2, 1],
    &[8, 8, 4, 4, 2, 1, 1],
    &[8, 8, 4, 4, 2, 2, 1],
    &[8, 8, 4, 4, 2, 2, 1, 1],
    &[16, 8, 4, 2, 1],
];

fn test_manager() -> Arc<StreamWindowManager> {
    Arc::new(StreamWindowManager::new(
        0,
        OpSet::from_names(&["count"]).unwrap(),
        BackingStore::new(Arc::new(MemoryBackend::new()), false),
    ))
}

fn exp2_windowing() -> GenericWindowing {
    GenericWindowing::new(WindowingSpec::Exponential { base: 2.0 }.sequence())
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
fn test_each_step_unbuffered() {
    let manager = test_manager();
    let pipeline = Pipeline::new(Arc::clone(&manager), exp2_windowing(), None);

    for i in 0..EXPECTED_EVOLUTION.len() as i64 {
        pipeline.append(i, 0.0).unwrap();
        assert_eq!(
            window_sizes(&manager, i),
            EXPECTED_EVOLUTION[i as usize],
            "after appending {} points",
            i + 1
        );
    }
}

#[test]
fn test_final_step_buffered() {
    let manager = test_manager();
    let pipeline = Pipeline::new(Arc::clone(&manager), exp2_windowing(), None);
    // One-element buffers: arrivals reach the merger at the same
    // granularity as the unbuffered path, so the final partition is the
    // canonical one.
    pipeline.set_buffer_size(1).unwrap();
    pipeline.set_num_buffers(4);
    pipeline.set_windows_per_batch(2);
    pipeline.run().unwrap();

    for i in 0..EXPECTED_EVOLUTION.len() as i64 {
        pipeline.append(i, 0.0).unwrap();
    }
    pipeline.flush(true).unwrap();

    let last = EXPECTED_EVOLUTION.len() as i64 - 1;
    assert_eq!(window_sizes(&manager, last), EXPECTED_EVOLUTION[last as usize]);
}

#[test]
fn test_buffered_flush_each_step_converges() {
    let manager = test_manager();
    let pipeline = Pipeline::new(Arc::clone(&manager), exp2_windowing(), None);
    pipeline.set_buffer_size(4).unwrap();
    pipeline.set_num_buffers(4);
    pipeline.run().unwrap();

    for i in 0..EXPECTED_EVOLUTION.len() as i64 {
        pipeline.append(i, 0.0).unwrap();
        pipeline.flush(false).unwrap();
        assert_eq!(
            window_sizes(&manager, i),
            EXPECTED_EVOLUTION[i as usize],
            "after flushing {} points",
            i + 1
        );
    }
}
