//! Summarizer stage: slices ingest buffers into summary windows.
//!
//! Buffer capacity is chosen so that a full buffer always decomposes into an
//! integral prefix of the windowing's lengths; the largest covering length
//! is taken first, so emission order is oldest-first within the buffer.
//! Partial buffers only arise at flush and their unconsumed tails are handed
//! back for synchronous draining.

use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};

use crate::agg::SummaryWindow;
use crate::error::{Result, StoreError};
use crate::manager::StreamWindowManager;
use crate::pipeline::ingest::IngestBuffer;
use crate::pipeline::{Barrier, BufferPayload, FaultSlot, Stage, WindowPayload};

/// Second pipeline stage: ingest buffers in, summary windows out.
pub struct Summarizer {
    manager: Arc<StreamWindowManager>,
    barrier: Arc<Barrier>,
    window_lengths: Vec<i64>,
    num_elements: i64,
}

impl Summarizer {
    /// Creates a summarizer folding points through `manager`'s operators.
    pub fn new(manager: Arc<StreamWindowManager>, barrier: Arc<Barrier>) -> Self {
        Self {
            manager,
            barrier,
            window_lengths: Vec::new(),
            num_elements: 0,
        }
    }

    /// Sets the window lengths covering one full ingest buffer.
    pub fn set_window_lengths(&mut self, window_lengths: Vec<i64>) {
        self.window_lengths = window_lengths;
    }

    /// Primes the element counter after recovery.
    pub fn set_num_elements(&mut self, num_elements: i64) {
        self.num_elements = num_elements;
    }

    fn num_windows_covering(&self, buffer: &IngestBuffer) -> usize {
        if buffer.is_full() {
            // Very likely, except when flushing.
            return self.window_lengths.len();
        }
        let size = buffer.len() as i64;
        let mut covered = 0i64;
        for (w, &length) in self.window_lengths.iter().enumerate() {
            covered += length;
            if covered > size {
                return w;
            }
            if covered == size {
                return w + 1;
            }
        }
        self.window_lengths.len()
    }

    /// Slices one buffer into windows; the unconsumed tail, if any, goes to
    /// `partial_buffers`.
    fn process(
        &mut self,
        mut buffer: IngestBuffer,
        writer_queue: &Sender<WindowPayload>,
        partial_buffers: &Sender<IngestBuffer>,
    ) -> Result<()> {
        let num_windows = self.num_windows_covering(&buffer);
        let mut i_start = 0usize;

        for w in (0..num_windows).rev() {
            let i_end = i_start + self.window_lengths[w] as usize - 1;
            if i_end >= buffer.len() {
                // Only whole windows are consumed; the remainder is a
                // partial tail.
                break;
            }
            let mut window = SummaryWindow::new(
                buffer.timestamps()[i_start],
                buffer.timestamps()[i_end],
                self.num_elements + i_start as i64,
                self.num_elements + i_end as i64,
            );
            for i in i_start..=i_end {
                let (timestamp, value) = (buffer.timestamps()[i], buffer.values()[i]);
                self.manager
                    .insert_into_summary_window(&mut window, timestamp, value);
            }
            writer_queue
                .send(WindowPayload::Data(window))
                .map_err(|_| StoreError::InvalidState("writer queue closed"))?;
            i_start = i_end + 1;
        }
        self.num_elements += i_start as i64;

        if i_start < buffer.len() {
            buffer.truncate_head(i_start);
            partial_buffers
                .send(buffer)
                .map_err(|_| StoreError::InvalidState("partial buffer queue closed"))?;
        }
        Ok(())
    }

    /// Consumes the summarizer queue until shutdown or disconnect.
    pub(crate) fn run(
        mut self,
        input: Receiver<BufferPayload>,
        writer_queue: Sender<WindowPayload>,
        partial_buffers: Sender<IngestBuffer>,
        fault: FaultSlot,
    ) {
        loop {
            match input.recv() {
                Ok(BufferPayload::Data(buffer)) => {
                    if let Err(e) = self.process(buffer, &writer_queue, &partial_buffers) {
                        fault.set(e);
                        self.barrier.notify(Stage::Summarizer);
                        break;
                    }
                }
                Ok(BufferPayload::Flush) => self.barrier.notify(Stage::Summarizer),
                Ok(BufferPayload::Shutdown) => {
                    self.barrier.notify(Stage::Summarizer);
                    break;
                }
                Err(_) => break,
            }
        }
    }
}
