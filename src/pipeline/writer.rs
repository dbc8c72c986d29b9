//! Writer stage: persists summary windows and feeds the merger.

use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender};

use crate::agg::SummaryWindow;
use crate::error::Result;
use crate::manager::StreamWindowManager;
use crate::pipeline::merger::MergeEvent;
use crate::pipeline::{Barrier, EventPayload, FaultSlot, Stage, WindowPayload};
use crate::storage::Role;

#[derive(Debug, Default)]
struct WriterState {
    num_elements: i64,
    latest_time_start: i64,
}

/// Third pipeline stage. Each incoming window is persisted together with the
/// writer's progress counter in one atomic commit, then announced to the
/// merger as a [`MergeEvent`].
pub struct Writer {
    manager: Arc<StreamWindowManager>,
    barrier: Arc<Barrier>,
    state: Mutex<WriterState>,
}

impl Writer {
    /// Creates a writer persisting through `manager`.
    pub fn new(manager: Arc<StreamWindowManager>, barrier: Arc<Barrier>) -> Self {
        Self {
            manager,
            barrier,
            state: Mutex::new(WriterState::default()),
        }
    }

    /// Loads the durable writer counter; zero on first boot.
    pub fn prime_up(&self) -> Result<()> {
        let (num_elements, latest_time_start) = self
            .manager
            .count_and_time(Role::Writer)?
            .unwrap_or((0, 0));
        let mut state = self.state.lock().unwrap();
        state.num_elements = num_elements;
        state.latest_time_start = latest_time_start;
        Ok(())
    }

    /// Elements acknowledged as persisted.
    pub fn num_elements(&self) -> i64 {
        self.state.lock().unwrap().num_elements
    }

    /// Persists one window atomically with the progress counter and returns
    /// the merge event describing it.
    pub fn process(&self, window: SummaryWindow) -> Result<MergeEvent> {
        let mut state = self.state.lock().unwrap();
        state.num_elements += window.size();
        state.latest_time_start = window.time_start;
        self.manager
            .writer_brew(state.num_elements, state.latest_time_start, &window)?;
        Ok(MergeEvent {
            id: window.id(),
            size: window.size(),
        })
    }

    /// Consumes the writer queue until shutdown or disconnect.
    pub(crate) fn run(
        self: Arc<Self>,
        input: Receiver<WindowPayload>,
        merger_queue: Sender<EventPayload>,
        fault: FaultSlot,
    ) {
        loop {
            match input.recv() {
                Ok(WindowPayload::Data(window)) => match self.process(window) {
                    Ok(event) => {
                        if merger_queue.send(EventPayload::Data(event)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        fault.set(e);
                        self.barrier.notify(Stage::Writer);
                        break;
                    }
                },
                Ok(WindowPayload::Flush) => self.barrier.notify(Stage::Writer),
                Ok(WindowPayload::Shutdown) => {
                    self.barrier.notify(Stage::Writer);
                    break;
                }
                Err(_) => break,
            }
        }
    }
}
