//! Per-transfer completion signalling
//!
//! Each submission gets a fresh [`TransferSignal`] shared between the caller
//! and the engine thread. The engine resolves it exactly once with the
//! terminal result and the data buffer; callers block on it (or peek) from
//! their own threads without touching the transport.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::error;
use transport::TransferHandle;

use crate::error::Result;

#[derive(Debug)]
struct Outcome {
    result: Result<usize>,
    buffer: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Cell {
    outcome: Option<Outcome>,
    /// Transport handle while in flight; the engine needs it for cancel
    handle: Option<TransferHandle>,
}

/// One submission's rendezvous point between caller and engine.
#[derive(Debug, Default)]
pub(crate) struct TransferSignal {
    cell: Mutex<Cell>,
    done: Condvar,
}

impl TransferSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Engine side: record the transport handle of the accepted submission.
    pub(crate) fn attach_handle(&self, handle: TransferHandle) {
        self.cell.lock().unwrap().handle = Some(handle);
    }

    /// Engine side: the transport handle, while the submission is in flight.
    pub(crate) fn handle(&self) -> Option<TransferHandle> {
        self.cell.lock().unwrap().handle
    }

    /// Engine side: resolve with the terminal result, handing the buffer
    /// back. Resolving twice is a transport contract violation; the first
    /// outcome wins.
    pub(crate) fn complete(&self, result: Result<usize>, buffer: Vec<u8>) {
        let mut cell = self.cell.lock().unwrap();
        cell.handle = None;
        if cell.outcome.is_some() {
            error!("duplicate completion for one submission dropped");
            return;
        }
        cell.outcome = Some(Outcome {
            result,
            buffer: Some(buffer),
        });
        drop(cell);
        self.done.notify_all();
    }

    /// Caller side: the result, if resolved. Never blocks or consumes.
    pub(crate) fn peek(&self) -> Option<Result<usize>> {
        self.cell
            .lock()
            .unwrap()
            .outcome
            .as_ref()
            .map(|o| o.result.clone())
    }

    /// Caller side: block until resolved. `None` timeout waits
    /// indefinitely; `Some` returns `None` when the wait gives up (the
    /// submission stays in flight).
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<Result<usize>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut cell = self.cell.lock().unwrap();
        loop {
            if let Some(outcome) = &cell.outcome {
                return Some(outcome.result.clone());
            }
            match deadline {
                None => cell = self.done.wait(cell).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self.done.wait_timeout(cell, deadline - now).unwrap();
                    cell = guard;
                }
            }
        }
    }

    /// Caller side: take the buffer. Returns `Some` exactly once, after
    /// resolution.
    pub(crate) fn take_buffer(&self) -> Option<Vec<u8>> {
        self.cell
            .lock()
            .unwrap()
            .outcome
            .as_mut()
            .and_then(|o| o.buffer.take())
    }
}
