//! The process-level database object: names streams, owns the shared
//! backend and persists the stream catalogue.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::agg::op::OpType;
use crate::error::{Result, StoreError};
use crate::storage::codec::{self, Catalog, StreamMeta};
use crate::storage::{Backend, LmdbBackend, WriteBatch};
use crate::stream::Stream;
use crate::window::WindowingSpec;

/// A collection of summary streams sharing one LMDB environment.
pub struct Db {
    dir: PathBuf,
    backend: Arc<dyn Backend>,
    streams: Mutex<HashMap<i64, Arc<Stream>>>,
    next_stream_id: Mutex<i64>,
}

impl Db {
    /// Creates or attaches the database rooted at `dir` without loading any
    /// existing streams; use [`Db::open`] to reopen with recovery.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let backend: Arc<dyn Backend> = Arc::new(LmdbBackend::open(dir.join("lmdb"))?);
        Ok(Self {
            dir,
            backend,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: Mutex::new(0),
        })
    }

    /// Opens an existing database, reloading and recovering every stream in
    /// the catalogue.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let db = Self::new(dir)?;
        db.load_catalog()?;
        Ok(db)
    }

    /// Creates a stream with the given operators and windowing. Unknown
    /// operator names are rejected. The catalogue and the stream's record
    /// are persisted in one commit.
    pub fn new_stream(&self, operators: &[&str], windowing: WindowingSpec) -> Result<Arc<Stream>> {
        let mut op_types: Vec<OpType> = Vec::with_capacity(operators.len());
        for name in operators {
            op_types.push(
                OpType::from_name(name)
                    .ok_or_else(|| StoreError::UnknownOperator((*name).to_string()))?,
            );
        }

        let mut next_stream_id = self.next_stream_id.lock().unwrap();
        let id = *next_stream_id;
        let meta = StreamMeta {
            id,
            operators: op_types,
            windowing,
        };
        let stream = Arc::new(Stream::assemble(
            Some(&self.dir),
            meta.clone(),
            Arc::clone(&self.backend),
            true,
        )?);

        let mut streams = self.streams.lock().unwrap();
        let mut stream_ids: Vec<i64> = streams.keys().copied().collect();
        stream_ids.push(id);
        stream_ids.sort_unstable();
        let catalog = Catalog {
            next_stream_id: id + 1,
            stream_ids,
        };
        let mut batch = WriteBatch::new();
        batch.put_meta(codec::DB_KEY.to_vec(), codec::encode_catalog(&catalog));
        batch.put_meta(codec::stream_meta_key(id), codec::encode_stream_meta(&meta));
        self.backend.commit(batch)?;

        streams.insert(id, Arc::clone(&stream));
        *next_stream_id = id + 1;
        info!(stream = id, "created stream");
        Ok(stream)
    }

    /// Looks up a stream by id.
    pub fn stream(&self, stream_id: i64) -> Result<Arc<Stream>> {
        self.streams
            .lock()
            .unwrap()
            .get(&stream_id)
            .cloned()
            .ok_or(StoreError::StreamNotFound(stream_id))
    }

    /// Closes every stream, flushing and joining their pipelines.
    pub fn close(&self) -> Result<()> {
        let streams: Vec<Arc<Stream>> = self.streams.lock().unwrap().values().cloned().collect();
        for stream in streams {
            stream.close()?;
        }
        Ok(())
    }

    fn load_catalog(&self) -> Result<()> {
        let Some(buf) = self.backend.get_meta(codec::DB_KEY)? else {
            return Ok(()); // a fresh database
        };
        let catalog = codec::decode_catalog(&buf)?;
        info!(streams = catalog.stream_ids.len(), "loading database catalogue");

        for id in &catalog.stream_ids {
            let meta_buf = self
                .backend
                .get_meta(&codec::stream_meta_key(*id))?
                .ok_or(StoreError::Corrupt("stream missing from catalogue"))?;
            let meta = codec::decode_stream_meta(&meta_buf)?;
            let stream = Arc::new(Stream::assemble(
                Some(&self.dir),
                meta,
                Arc::clone(&self.backend),
                true,
            )?);
            stream.prime_up()?;
            self.streams.lock().unwrap().insert(*id, stream);
        }
        *self.next_stream_id.lock().unwrap() = catalog.next_stream_id;
        Ok(())
    }
}
