//! Per-stream write-ahead log.
//!
//! Each stream owns an append log of raw `(timestamp, value)` payloads keyed
//! by an explicit, monotonically increasing entry index. The log is the
//! recovery source of truth: durable per-stage counters say how far the
//! writer and merger progressed, and replay re-feeds everything past them.
//!
//! # Layout
//!
//! Segment files `segment_<id>.wal` carry a magic/version header followed by
//! framed records:
//!
//! ```text
//! index: u64 | len: u32 | crc32(payload): u32 | payload
//! ```
//!
//! Segments rotate on a size threshold. Opening a directory scans every
//! segment, rebuilding the index -> location map; a torn record at the tail
//! of a segment ends that segment's scan with a warning.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Default maximum segment size (16 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// WAL segment file extension.
const SEGMENT_EXTENSION: &str = "wal";

/// WAL segment file prefix.
const SEGMENT_PREFIX: &str = "segment";

/// WAL file magic bytes.
const WAL_MAGIC: [u8; 4] = [b'C', b'W', b'A', b'L'];

/// WAL format version.
const WAL_VERSION: u16 = 1;

/// Record frame overhead: index (8) + length (4) + checksum (4).
const FRAME_HEADER: usize = 16;

/// Sync mode for WAL durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync on [`Wal::sync`] (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration for WAL behavior.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum size of a single WAL segment file.
    pub segment_size: usize,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

/// WAL segment header.
struct SegmentHeader {
    magic: [u8; 4],
    version: u16,
    segment_id: u64,
}

impl SegmentHeader {
    const SIZE: usize = 14;

    fn new(segment_id: u64) -> Self {
        Self {
            magic: WAL_MAGIC,
            version: WAL_VERSION,
            segment_id,
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != WAL_MAGIC {
            return Err(StoreError::InvalidMagic(magic));
        }

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf)?;
        let version = u16::from_le_bytes(buf);
        if version != WAL_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }

        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let segment_id = u64::from_le_bytes(buf);

        Ok(Self {
            magic,
            version,
            segment_id,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordLocation {
    segment_id: u64,
    offset: u64,
}

/// Index-keyed append log for one stream.
pub struct Wal {
    log_dir: PathBuf,
    writer: BufWriter<File>,
    current_segment_id: u64,
    current_segment_size: usize,
    locations: HashMap<u64, RecordLocation>,
    last_index: u64,
    config: WalConfig,
}

impl Wal {
    /// Opens the log in `log_dir`, creating the directory if needed.
    ///
    /// Existing segments are scanned to rebuild the entry index; writing
    /// continues in a fresh segment so prior segments are never rewritten.
    pub fn open(log_dir: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;

        let mut locations = HashMap::new();
        let mut last_index = 0u64;
        let mut max_segment_id: Option<u64> = None;

        for path in Self::list_segments(&log_dir)? {
            let Some(segment_id) = Self::parse_segment_id(&path) else {
                continue;
            };
            max_segment_id = Some(max_segment_id.map_or(segment_id, |m| m.max(segment_id)));
            match Self::scan_segment(&path, segment_id, &mut locations) {
                Ok(max_in_segment) => last_index = last_index.max(max_in_segment),
                Err(e) => {
                    // A segment whose header never landed carries no
                    // scannable entries.
                    warn!("skipping WAL segment {}: {e}", path.display());
                }
            }
        }

        let next_segment_id = max_segment_id.map_or(0, |id| id + 1);
        let segment_path = Self::segment_path(&log_dir, next_segment_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&segment_path)?;
        let mut writer = BufWriter::new(file);
        SegmentHeader::new(next_segment_id).write_to(&mut writer)?;
        writer.flush()?;

        debug!(
            "opened WAL at {} with {} entries, segment {}",
            log_dir.display(),
            locations.len(),
            next_segment_id
        );

        Ok(Self {
            log_dir,
            writer,
            current_segment_id: next_segment_id,
            current_segment_size: SegmentHeader::SIZE,
            locations,
            last_index,
            config,
        })
    }

    fn segment_path(log_dir: &Path, segment_id: u64) -> PathBuf {
        log_dir.join(format!(
            "{}_{:016x}.{}",
            SEGMENT_PREFIX, segment_id, SEGMENT_EXTENSION
        ))
    }

    fn list_segments(log_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(log_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION) {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }

    fn parse_segment_id(path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&format!("{}_", SEGMENT_PREFIX)))
            .and_then(|s| u64::from_str_radix(s, 16).ok())
    }

    /// Scans one segment, recording entry locations. Returns the largest
    /// entry index seen. A torn tail record ends the scan cleanly.
    fn scan_segment(
        path: &Path,
        segment_id: u64,
        locations: &mut HashMap<u64, RecordLocation>,
    ) -> Result<u64> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let header = SegmentHeader::read_from(&mut reader)?;
        if header.segment_id != segment_id {
            return Err(StoreError::Corrupt("segment id mismatch"));
        }

        let mut offset = SegmentHeader::SIZE as u64;
        let mut max_index = 0u64;
        loop {
            match Self::read_frame(&mut reader) {
                Ok(Some((index, payload))) => {
                    locations.insert(index, RecordLocation { segment_id, offset });
                    max_index = max_index.max(index);
                    offset += (FRAME_HEADER + payload.len()) as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "torn record in WAL segment {} at offset {offset}: {e}",
                        path.display()
                    );
                    break;
                }
            }
        }
        Ok(max_index)
    }

    fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(u64, Vec<u8>)>> {
        let mut index_buf = [0u8; 8];
        match reader.read_exact(&mut index_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let index = u64::from_le_bytes(index_buf);

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_le_bytes(crc_buf);

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            return Err(StoreError::ChecksumMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }
        Ok(Some((index, payload)))
    }

    /// Appends a payload under the given entry index.
    pub fn append(&mut self, index: u64, payload: &[u8]) -> Result<()> {
        let frame_len = FRAME_HEADER + payload.len();
        if self.current_segment_size + frame_len > self.config.segment_size {
            self.rotate_segment()?;
        }

        let offset = self.current_segment_size as u64;
        let crc = crc32fast::hash(payload);
        self.writer.write_all(&index.to_le_bytes())?;
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(payload)?;

        self.locations.insert(
            index,
            RecordLocation {
                segment_id: self.current_segment_id,
                offset,
            },
        );
        self.current_segment_size += frame_len;
        self.last_index = self.last_index.max(index);
        Ok(())
    }

    /// Reads the payload stored under an entry index.
    pub fn read(&mut self, index: u64) -> Result<Vec<u8>> {
        let location = *self
            .locations
            .get(&index)
            .ok_or(StoreError::WalEntryNotFound(index))?;
        if location.segment_id == self.current_segment_id {
            // The record may still sit in the write buffer.
            self.writer.flush()?;
        }
        let path = Self::segment_path(&self.log_dir, location.segment_id);
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut reader = BufReader::new(file);
        let (stored_index, payload) =
            Self::read_frame(&mut reader)?.ok_or(StoreError::WalEntryNotFound(index))?;
        if stored_index != index {
            return Err(StoreError::Corrupt("WAL entry index mismatch"));
        }
        Ok(payload)
    }

    /// Flushes buffered records and syncs per the configured mode.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        match self.config.sync_mode {
            SyncMode::Fsync => self.writer.get_ref().sync_all()?,
            SyncMode::Fdatasync => self.writer.get_ref().sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }

    /// The largest entry index appended so far; 0 when the log is empty.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// The current segment id.
    pub fn current_segment_id(&self) -> u64 {
        self.current_segment_id
    }

    fn rotate_segment(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        self.current_segment_id += 1;
        let segment_path = Self::segment_path(&self.log_dir, self.current_segment_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&segment_path)?;
        self.writer = BufWriter::new(file);
        SegmentHeader::new(self.current_segment_id).write_to(&mut self.writer)?;
        self.writer.flush()?;
        self.current_segment_size = SegmentHeader::SIZE;

        debug!("rotated to WAL segment {}", segment_path.display());
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // Best effort to land buffered records.
        if let Err(e) = self.sync() {
            warn!("failed to sync WAL on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> WalConfig {
        WalConfig {
            segment_size: 1024,
            sync_mode: SyncMode::None,
        }
    }

    #[test]
    fn test_append_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::open(dir.path(), test_config()).unwrap();

        for i in 1..=10u64 {
            wal.append(i, &i.to_le_bytes()).unwrap();
        }
        assert_eq!(wal.last_index(), 10);

        for i in 1..=10u64 {
            assert_eq!(wal.read(i).unwrap(), i.to_le_bytes());
        }
        assert!(matches!(
            wal.read(11),
            Err(StoreError::WalEntryNotFound(11))
        ));
    }

    #[test]
    fn test_reopen_continues_from_existing() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = Wal::open(dir.path(), test_config()).unwrap();
            assert_eq!(wal.current_segment_id(), 0);
            for i in 1..=5u64 {
                wal.append(i, b"payload").unwrap();
            }
            wal.sync().unwrap();
        }

        let mut wal = Wal::open(dir.path(), test_config()).unwrap();
        // A fresh segment is used; segment 0 is never rewritten.
        assert_eq!(wal.current_segment_id(), 1);
        assert_eq!(wal.last_index(), 5);
        for i in 1..=5u64 {
            assert_eq!(wal.read(i).unwrap(), b"payload");
        }

        wal.append(6, b"more").unwrap();
        wal.sync().unwrap();
        assert_eq!(wal.last_index(), 6);
    }

    #[test]
    fn test_segment_rotation() {
        let dir = TempDir::new().unwrap();
        let config = WalConfig {
            segment_size: 128,
            sync_mode: SyncMode::None,
        };
        let mut wal = Wal::open(dir.path(), config).unwrap();
        for i in 1..=50u64 {
            wal.append(i, &[0u8; 16]).unwrap();
        }
        assert!(wal.current_segment_id() > 0);

        // Entries from rotated-out segments stay readable.
        for i in 1..=50u64 {
            assert_eq!(wal.read(i).unwrap(), [0u8; 16]);
        }
    }

    #[test]
    fn test_sync_makes_entries_durable() {
        let dir = TempDir::new().unwrap();
        {
            let config = WalConfig {
                segment_size: 1024 * 1024,
                sync_mode: SyncMode::Fsync,
            };
            let mut wal = Wal::open(dir.path(), config).unwrap();
            for i in 1..=10u64 {
                wal.append(i, &i.to_le_bytes()).unwrap();
            }
            wal.sync().unwrap();
        }
        let mut wal = Wal::open(dir.path(), test_config()).unwrap();
        assert_eq!(wal.last_index(), 10);
        assert_eq!(wal.read(10).unwrap(), 10u64.to_le_bytes());
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = Wal::open(dir.path(), test_config()).unwrap();
            for i in 1..=5u64 {
                wal.append(i, b"ok").unwrap();
            }
            wal.sync().unwrap();
        }

        // Append garbage to the first segment: a frame header promising more
        // payload than exists.
        let segment = Wal::segment_path(dir.path(), 0);
        let mut file = OpenOptions::new().append(true).open(segment).unwrap();
        file.write_all(&99u64.to_le_bytes()).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[0xDE, 0xAD]).unwrap();

        let wal = Wal::open(dir.path(), test_config()).unwrap();
        assert_eq!(wal.last_index(), 5);
    }

    #[test]
    fn test_corrupt_payload_fails_checksum() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = Wal::open(dir.path(), test_config()).unwrap();
            wal.append(1, b"sensitive").unwrap();
            wal.sync().unwrap();
        }

        // Flip a payload byte in place.
        let segment = Wal::segment_path(dir.path(), 0);
        let mut contents = fs::read(&segment).unwrap();
        let last = contents.len() - 1;
        contents[last] ^= 0xFF;
        fs::write(&segment, contents).unwrap();

        // The scan treats the bad record as a torn tail.
        let wal = Wal::open(dir.path(), test_config()).unwrap();
        assert_eq!(wal.last_index(), 0);
    }

    #[test]
    fn test_empty_log() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), test_config()).unwrap();
        assert_eq!(wal.last_index(), 0);
    }
}
