//! The two executor flavors of spec.md §4.8: a synchronous one that blocks
//! the caller in-line, and an asynchronous one that hands a backend to a
//! dedicated worker thread and returns completions through a queue. Both
//! drive the same [`Command`]/[`Outcome`] shape, so slave drivers are
//! written once and work against either.

use crate::backend::Backend;
use crate::enumerator::Enumerator;
use crate::error::{Error, Result};
use crate::rom::RomId;
use crate::search::SearchState;
use crate::transaction::{self, Transaction, TransactionOutcome};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Headroom added to a transaction's own `delay_ms` to bound the rest of
/// the wire work (reset, selection, read) before the executor declares a
/// timeout. Chosen generously since the passive backend pays a baud
/// round trip on every bit.
const BACKEND_BUDGET: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub enum Command {
    Reset,
    Discover,
    AlarmScan,
    Verify(RomId),
    Execute(Transaction),
}

#[derive(Debug)]
pub enum Outcome {
    Reset(crate::backend::ResetPresence),
    Discover(HashSet<RomId>),
    AlarmScan(HashSet<RomId>),
    Verify(bool),
    Execute(TransactionOutcome),
}

/// One dispatched unit of work, carrying the opaque context the caller
/// wants echoed back verbatim in the completion (spec.md §4.6's `context`
/// field, also the demultiplexing key for callbacks in spec.md §4.8).
#[derive(Clone, Debug)]
pub struct Job {
    pub command: Command,
    pub context: u64,
}

#[derive(Debug)]
pub struct Completion {
    pub context: u64,
    pub result: Result<Outcome>,
}

/// Runs a [`Command`] against `backend` in-line, the shape every executor
/// flavor ultimately bottoms out in.
fn run(backend: &mut dyn Backend, command: &Command) -> Result<Outcome> {
    match command {
        Command::Reset => backend.reset().map(Outcome::Reset),
        Command::Discover => Enumerator::new().discover(backend).map(Outcome::Discover),
        Command::AlarmScan => Enumerator::new().alarm_scan(backend).map(Outcome::AlarmScan),
        Command::Verify(rom) => {
            let mut state = SearchState::verify_seed();
            let found = backend.search_round(
                crate::search::SearchMode::Discover,
                &mut state,
                Some(rom),
            )?;
            Ok(Outcome::Verify(found.as_ref() == Some(rom)))
        }
        Command::Execute(tx) => transaction::execute(backend, tx).map(Outcome::Execute),
    }
}

/// The synchronous flavor: the calling context blocks until the backend
/// returns. Used by the active and passive backends, which complete
/// in-line with no deferred reply to wait for.
pub struct SyncExecutor;

impl SyncExecutor {
    pub fn dispatch(backend: &mut dyn Backend, command: Command) -> Result<Outcome> {
        run(backend, &command)
    }
}

enum WorkerMessage {
    Job(Job, Instant),
    Shutdown,
}

/// The asynchronous flavor: a request queue feeds a single worker thread
/// that owns the backend exclusively; the worker publishes outcomes to a
/// response queue that [`AsyncExecutor::poll`] drains non-blockingly.
/// Matches spec.md §4.8's ordering guarantee — single worker, so
/// completions are delivered in the same order requests were submitted.
pub struct AsyncExecutor {
    sender: mpsc::Sender<WorkerMessage>,
    responses: mpsc::Receiver<Completion>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncExecutor {
    /// Spawns the worker thread, handing it exclusive ownership of
    /// `backend`. Used for the firmware backend (whose wire work is
    /// inherently deferred) and as an option for long-running conversions.
    pub fn spawn(mut backend: Box<dyn Backend>) -> Self {
        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        let (response_tx, response_rx) = mpsc::channel::<Completion>();

        let handle = thread::spawn(move || {
            for message in rx {
                match message {
                    WorkerMessage::Shutdown => break,
                    WorkerMessage::Job(job, deadline) => {
                        if Instant::now() > deadline {
                            warn!("dropping job for context {} past its deadline", job.context);
                            if let Err(e) = backend.reset() {
                                warn!("force-reset after timeout failed: {e}");
                            }
                            let _ = response_tx.send(Completion {
                                context: job.context,
                                result: Err(Error::Timeout("executor queue wait")),
                            });
                            continue;
                        }
                        let result = run(backend.as_mut(), &job.command);
                        // Only wire-desync errors warrant a physical reset (spec.md
                        // §7); caller/input errors like `Configuration` or
                        // `DeviceNotFound` leave the bus exactly as it was.
                        let desync = matches!(
                            result,
                            Err(Error::Timeout(_))
                                | Err(Error::TransportLost(_))
                                | Err(Error::ProtocolFraming(_))
                        );
                        if desync {
                            if let Err(e) = backend.reset() {
                                warn!("force-reset after failed job failed: {e}");
                            }
                        }
                        let _ = response_tx.send(Completion {
                            context: job.context,
                            result,
                        });
                    }
                }
            }
            info!("executor worker shutting down");
        });

        Self {
            sender: tx,
            responses: response_rx,
            handle: Some(handle),
        }
    }

    /// Enqueues `job`, computing its deadline as `now + delay_ms +
    /// backend_budget` per spec.md §4.8.
    pub fn submit(&self, job: Job) -> Result<()> {
        let delay_ms = match &job.command {
            Command::Execute(tx) => tx.delay_ms,
            _ => 0,
        };
        let deadline = Instant::now() + Duration::from_millis(delay_ms) + BACKEND_BUDGET;
        self.sender
            .send(WorkerMessage::Job(job, deadline))
            .map_err(|_| Error::Cancelled)
    }

    /// Non-blocking: drains every completion currently queued, in arrival
    /// (== submission) order.
    pub fn poll(&self) -> Vec<Completion> {
        self.responses.try_iter().collect()
    }

    /// Drains the worker with a termination sentinel and closes it down.
    /// In-flight transactions run to completion; per-request cancellation
    /// is not offered (spec.md §5).
    pub fn shutdown(mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
