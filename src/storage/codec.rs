//! Binary wire formats for every persisted record.
//!
//! All fields are little-endian with fixed order; decoders validate lengths
//! and tags and fail with [`StoreError::Corrupt`] rather than guessing.

use crate::agg::op::OpType;
use crate::agg::{LandmarkWindow, SummaryWindow};
use crate::error::{Result, StoreError};
use crate::heap::{HeapItem, MergeHeap};
use crate::pipeline::merger::MergerIndex;
use crate::window::WindowingSpec;

/// Metadata key of the database catalogue record.
pub const DB_KEY: &[u8] = b"db";

const SUMMARY_WINDOW_LEN: usize = 56;
const COUNTER_LEN: usize = 16;
const POINT_LEN: usize = 16;
const HEAP_ITEM_LEN: usize = 16;
const INDEX_ITEM_LEN: usize = 16;

const WINDOWING_EXPONENTIAL: u8 = 0;
const WINDOWING_POWER: u8 = 1;

fn read_i64(buf: &[u8], at: usize) -> i64 {
    i64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn read_f64(buf: &[u8], at: usize) -> f64 {
    f64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

/// Metadata key of one stream's record.
pub fn stream_meta_key(stream_id: i64) -> Vec<u8> {
    let mut key = b"stream-".to_vec();
    key.extend_from_slice(&stream_id.to_le_bytes());
    key
}

/// Serializes a summary window.
pub fn encode_summary_window(window: &SummaryWindow) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SUMMARY_WINDOW_LEN);
    buf.extend_from_slice(&window.time_start.to_le_bytes());
    buf.extend_from_slice(&window.time_end.to_le_bytes());
    buf.extend_from_slice(&window.count_start.to_le_bytes());
    buf.extend_from_slice(&window.count_end.to_le_bytes());
    buf.extend_from_slice(&window.data.count.to_le_bytes());
    buf.extend_from_slice(&window.data.sum.to_le_bytes());
    buf.extend_from_slice(&window.data.max.to_le_bytes());
    buf
}

/// Deserializes a summary window.
pub fn decode_summary_window(buf: &[u8]) -> Result<SummaryWindow> {
    if buf.len() != SUMMARY_WINDOW_LEN {
        return Err(StoreError::Corrupt("summary window length"));
    }
    let mut window = SummaryWindow::new(
        read_i64(buf, 0),
        read_i64(buf, 8),
        read_i64(buf, 16),
        read_i64(buf, 24),
    );
    window.data.count = read_f64(buf, 32);
    window.data.sum = read_f64(buf, 40);
    window.data.max = read_f64(buf, 48);
    Ok(window)
}

/// Serializes a landmark window: header, timestamps array, values array.
pub fn encode_landmark_window(window: &LandmarkWindow) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20 + 16 * window.landmarks.len());
    buf.extend_from_slice(&window.time_start.to_le_bytes());
    buf.extend_from_slice(&window.time_end.to_le_bytes());
    buf.extend_from_slice(&(window.landmarks.len() as u32).to_le_bytes());
    for landmark in &window.landmarks {
        buf.extend_from_slice(&landmark.timestamp.to_le_bytes());
    }
    for landmark in &window.landmarks {
        buf.extend_from_slice(&landmark.value.to_le_bytes());
    }
    buf
}

/// Deserializes a landmark window.
pub fn decode_landmark_window(buf: &[u8]) -> Result<LandmarkWindow> {
    if buf.len() < 20 {
        return Err(StoreError::Corrupt("landmark window header"));
    }
    let len = read_u32(buf, 16) as usize;
    if buf.len() != 20 + 16 * len {
        return Err(StoreError::Corrupt("landmark window length"));
    }
    let mut window = LandmarkWindow::new(read_i64(buf, 0));
    let values_at = 20 + 8 * len;
    for i in 0..len {
        window.insert(
            read_i64(buf, 20 + 8 * i),
            read_f64(buf, values_at + 8 * i),
        );
    }
    window.close(read_i64(buf, 8));
    Ok(window)
}

/// Serializes the merge heap in slot order.
pub fn encode_heap(heap: &MergeHeap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEAP_ITEM_LEN * heap.len());
    for item in heap.items() {
        buf.extend_from_slice(&item.value.to_le_bytes());
        buf.extend_from_slice(&(item.priority as i32).to_le_bytes());
        buf.extend_from_slice(&item.index.to_le_bytes());
    }
    buf
}

/// Deserializes the merge heap.
pub fn decode_heap(buf: &[u8]) -> Result<MergeHeap> {
    if buf.len() % HEAP_ITEM_LEN != 0 {
        return Err(StoreError::Corrupt("heap length"));
    }
    let mut items = Vec::with_capacity(buf.len() / HEAP_ITEM_LEN);
    for chunk in buf.chunks_exact(HEAP_ITEM_LEN) {
        items.push(HeapItem {
            value: read_i64(chunk, 0),
            priority: read_i32(chunk, 8) as i64,
            index: read_i32(chunk, 12),
        });
    }
    MergeHeap::from_items(items)
}

/// Serializes the merger index as `(swid, c_end)` pairs ascending by swid.
pub fn encode_merger_index(index: &MergerIndex) -> Vec<u8> {
    let mut buf = Vec::with_capacity(INDEX_ITEM_LEN * index.len());
    for (swid, c_end) in index.iter() {
        buf.extend_from_slice(&swid.to_le_bytes());
        buf.extend_from_slice(&c_end.to_le_bytes());
    }
    buf
}

/// Deserializes the merger index.
pub fn decode_merger_index(buf: &[u8]) -> Result<MergerIndex> {
    if buf.len() % INDEX_ITEM_LEN != 0 {
        return Err(StoreError::Corrupt("merger index length"));
    }
    let mut index = MergerIndex::new();
    for chunk in buf.chunks_exact(INDEX_ITEM_LEN) {
        index.put(read_i64(chunk, 0), read_i64(chunk, 8));
    }
    Ok(index)
}

/// Serializes a durable `(count, timestamp)` counter.
pub fn encode_counter(count: i64, timestamp: i64) -> [u8; COUNTER_LEN] {
    let mut buf = [0u8; COUNTER_LEN];
    buf[..8].copy_from_slice(&count.to_le_bytes());
    buf[8..].copy_from_slice(&timestamp.to_le_bytes());
    buf
}

/// Deserializes a durable counter.
pub fn decode_counter(buf: &[u8]) -> Result<(i64, i64)> {
    if buf.len() != COUNTER_LEN {
        return Err(StoreError::Corrupt("counter length"));
    }
    Ok((read_i64(buf, 0), read_i64(buf, 8)))
}

/// Serializes one WAL point: timestamp then value.
pub fn encode_point(timestamp: i64, value: f64) -> [u8; POINT_LEN] {
    let mut buf = [0u8; POINT_LEN];
    buf[..8].copy_from_slice(&timestamp.to_le_bytes());
    buf[8..].copy_from_slice(&value.to_le_bytes());
    buf
}

/// Deserializes one WAL point.
pub fn decode_point(buf: &[u8]) -> Result<(i64, f64)> {
    if buf.len() != POINT_LEN {
        return Err(StoreError::Corrupt("point length"));
    }
    Ok((read_i64(buf, 0), read_f64(buf, 8)))
}

/// Persisted description of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMeta {
    /// Stream id.
    pub id: i64,
    /// Configured operators, in configuration order.
    pub operators: Vec<OpType>,
    /// The stream's windowing.
    pub windowing: WindowingSpec,
}

/// Serializes stream metadata.
pub fn encode_stream_meta(meta: &StreamMeta) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&meta.id.to_le_bytes());
    buf.push(meta.operators.len() as u8);
    for op in &meta.operators {
        buf.push(*op as u8);
    }
    match meta.windowing {
        WindowingSpec::Exponential { base } => {
            buf.push(WINDOWING_EXPONENTIAL);
            buf.extend_from_slice(&base.to_le_bytes());
        }
        WindowingSpec::Power { p, q, r, s } => {
            buf.push(WINDOWING_POWER);
            buf.extend_from_slice(&p.to_le_bytes());
            buf.extend_from_slice(&q.to_le_bytes());
            buf.extend_from_slice(&r.to_le_bytes());
            buf.extend_from_slice(&s.to_le_bytes());
        }
    }
    buf
}

/// Deserializes stream metadata.
pub fn decode_stream_meta(buf: &[u8]) -> Result<StreamMeta> {
    if buf.len() < 10 {
        return Err(StoreError::Corrupt("stream metadata header"));
    }
    let id = read_i64(buf, 0);
    let num_ops = buf[8] as usize;
    if buf.len() < 9 + num_ops + 1 {
        return Err(StoreError::Corrupt("stream metadata operators"));
    }
    let mut operators = Vec::with_capacity(num_ops);
    for i in 0..num_ops {
        operators.push(
            OpType::from_tag(buf[9 + i]).ok_or(StoreError::Corrupt("stream metadata op tag"))?,
        );
    }
    let at = 9 + num_ops;
    let windowing = match buf[at] {
        WINDOWING_EXPONENTIAL => {
            if buf.len() != at + 9 {
                return Err(StoreError::Corrupt("exponential windowing length"));
            }
            WindowingSpec::Exponential {
                base: read_f64(buf, at + 1),
            }
        }
        WINDOWING_POWER => {
            if buf.len() != at + 33 {
                return Err(StoreError::Corrupt("power windowing length"));
            }
            WindowingSpec::Power {
                p: read_i64(buf, at + 1),
                q: read_i64(buf, at + 9),
                r: read_i64(buf, at + 17),
                s: read_i64(buf, at + 25),
            }
        }
        _ => return Err(StoreError::Corrupt("windowing tag")),
    };
    Ok(StreamMeta {
        id,
        operators,
        windowing,
    })
}

/// Persisted database catalogue: stream list plus the id counter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Catalog {
    /// Next stream id to hand out.
    pub next_stream_id: i64,
    /// Every stream in the database.
    pub stream_ids: Vec<i64>,
}

/// Serializes the catalogue.
pub fn encode_catalog(catalog: &Catalog) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + 8 * catalog.stream_ids.len());
    buf.extend_from_slice(&catalog.next_stream_id.to_le_bytes());
    buf.extend_from_slice(&(catalog.stream_ids.len() as u32).to_le_bytes());
    for id in &catalog.stream_ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    buf
}

/// Deserializes the catalogue.
pub fn decode_catalog(buf: &[u8]) -> Result<Catalog> {
    if buf.len() < 12 {
        return Err(StoreError::Corrupt("catalogue header"));
    }
    let len = read_u32(buf, 8) as usize;
    if buf.len() != 12 + 8 * len {
        return Err(StoreError::Corrupt("catalogue length"));
    }
    let mut stream_ids = Vec::with_capacity(len);
    for i in 0..len {
        stream_ids.push(read_i64(buf, 12 + 8 * i));
    }
    Ok(Catalog {
        next_stream_id: read_i64(buf, 0),
        stream_ids,
    })
}
