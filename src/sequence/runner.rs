//! Sequence thread with an explicit start/stop lifecycle.

use super::control::RunControl;
use super::events::{EventSink, SequenceEvent};
use super::item::Sequence;
use super::strategy::{RunOptions, RunReport, SequenceStrategy};
use crate::error::{AppResult, BenchError};
use std::thread::{self, JoinHandle};
use tokio::sync::broadcast;
use tracing::{error, info};

/// What a finished sequence thread hands back.
pub struct CompletedRun {
    /// Strategy, ready for the next run.
    pub strategy: SequenceStrategy,
    /// Sequence with final item states.
    pub sequence: Sequence,
    /// Report, or the validation failure.
    pub result: AppResult<RunReport>,
}

/// Handle to a running sequence.
pub struct SequenceRunner {
    control: RunControl,
    events: EventSink,
    handle: Option<JoinHandle<CompletedRun>>,
}

impl SequenceRunner {
    /// Clear pending requests and run `sequence` on a new thread.
    pub fn start(
        mut strategy: SequenceStrategy,
        mut sequence: Sequence,
        options: RunOptions,
    ) -> AppResult<Self> {
        let control = strategy.control().clone();
        let events = strategy.events().clone();
        control.reset();
        let handle = thread::Builder::new()
            .name("sequence".to_string())
            .spawn(move || {
                info!(sequence = %sequence.name, "sequence thread started");
                let result = strategy.run(&mut sequence, &options);
                info!("sequence thread stopped");
                CompletedRun {
                    strategy,
                    sequence,
                    result,
                }
            })
            .map_err(|err| BenchError::Resource(format!("failed to spawn sequence thread: {err}")))?;
        Ok(Self {
            control,
            events,
            handle: Some(handle),
        })
    }

    /// Abort/suspend handle of the running sequence.
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    /// True until the thread exited.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Request an abort and wait for the thread.
    pub fn stop(self) -> AppResult<CompletedRun> {
        self.control.request_abort();
        self.join()
    }

    /// Wait for the thread.
    pub fn join(mut self) -> AppResult<CompletedRun> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| BenchError::HardFault("sequence thread already joined".into()))?;
        handle.join().map_err(|_| {
            error!("sequence thread panicked");
            BenchError::HardFault("sequence thread panicked".into())
        })
    }
}
