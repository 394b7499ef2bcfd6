//! The motion-command dispatcher.
//!
//! Owns the serial transport, the motion queue, the position tracker and
//! the checkpoint store, and drives the run loop: dequeue one command,
//! transmit it, fold it into the tracked position, then sleep out the
//! pacing delay before the next step. The loop runs as a spawned task so
//! callers are never blocked during the wait; pacing is advisory software
//! timing, and jitter of tens of milliseconds is expected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::motion_queue::{MotionQueue, QueueError, is_dispatchable};
use crate::stage::StageError;
use crate::stage::params::ParameterStore;
use crate::stage::position::{Position, PositionTracker};
use crate::stage::timing::delay_before_next;
use crate::transport::{Transport, TransportError};

/// Run-loop state. Only one run may be active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Running,
    /// Cancellation requested; resolves to [`DispatcherState::Idle`] once
    /// the in-flight step settles.
    Halting,
}

/// Result of asking for a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A run was already active; the request was ignored.
    AlreadyRunning,
}

/// Progress notifications from the run loop.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Started {
        run_id: Uuid,
        source: String,
        pending: usize,
    },
    Sent {
        line: String,
        dispatched: u64,
        response: String,
        delay: Duration,
    },
    Completed {
        dispatched: u64,
    },
    Halted {
        dispatched: u64,
    },
    Failed {
        dispatched: u64,
        error: String,
    },
}

struct Inner {
    state: watch::Sender<DispatcherState>,
    halt: watch::Sender<bool>,
    queue: Mutex<MotionQueue>,
    tracker: std::sync::Mutex<PositionTracker>,
    transport: Mutex<Box<dyn Transport>>,
    checkpoint: Arc<dyn CheckpointStore>,
    params: ParameterStore,
    checkpoint_interval: Duration,
    events: broadcast::Sender<DispatchEvent>,
}

pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        transport: Box<dyn Transport>,
        checkpoint: Arc<dyn CheckpointStore>,
        params: ParameterStore,
        tracker: PositionTracker,
        checkpoint_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        let (halt, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state,
                halt,
                queue: Mutex::new(MotionQueue::new()),
                tracker: std::sync::Mutex::new(tracker),
                transport: Mutex::new(transport),
                checkpoint,
                params,
                checkpoint_interval,
                events,
            }),
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.inner.events.subscribe()
    }

    pub fn position(&self) -> Position {
        self.inner.tracker.lock().expect("tracker poisoned").position()
    }

    pub fn feed_rate(&self) -> f64 {
        self.inner.tracker.lock().expect("tracker poisoned").feed_rate()
    }

    pub fn params(&self) -> &ParameterStore {
        &self.inner.params
    }

    pub fn checkpoint(&self) -> &dyn CheckpointStore {
        self.inner.checkpoint.as_ref()
    }

    pub async fn pending(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Load a command sequence and start dispatching it.
    ///
    /// A no-op reporting [`StartOutcome::AlreadyRunning`] if a run is
    /// active; the existing run is left untouched.
    pub async fn start(&self, path: &str) -> Result<StartOutcome, StageError> {
        if !self.claim_run() {
            tracing::warn!("run already active; ignoring start of '{}'", path);
            return Ok(StartOutcome::AlreadyRunning);
        }
        if let Err(e) = self.prepare_start(path).await {
            self.release_run();
            return Err(e);
        }
        Ok(self.spawn_run(0))
    }

    async fn prepare_start(&self, path: &str) -> Result<(), StageError> {
        // A run cannot be paced without the stage configuration; fail
        // before anything is loaded or transmitted.
        self.inner.params.get("xMaxRate")?;
        self.inner.queue.lock().await.load_file(path).await?;
        Ok(())
    }

    /// Resume an interrupted run from the persisted checkpoint.
    ///
    /// Re-opens the checkpointed source, skips forward to the last
    /// dispatched line and enqueues everything strictly after it. The
    /// stage itself must not have been moved in the meantime; that is on
    /// the operator.
    pub async fn resume_from_checkpoint(&self) -> Result<StartOutcome, StageError> {
        if !self.claim_run() {
            tracing::warn!("run already active; ignoring resume request");
            return Ok(StartOutcome::AlreadyRunning);
        }
        match self.prepare_resume().await {
            Ok(dispatched_base) => Ok(self.spawn_run(dispatched_base)),
            Err(e) => {
                self.release_run();
                Err(e)
            }
        }
    }

    async fn prepare_resume(&self) -> Result<u64, StageError> {
        self.inner.params.get("xMaxRate")?;
        let record = self.inner.checkpoint.load()?;
        tracing::info!(
            "resuming '{}' after line '{}' ({} dispatched)",
            record.source,
            record.last_line,
            record.dispatched
        );

        let text = tokio::fs::read_to_string(&record.source)
            .await
            .map_err(|e| {
                StageError::RecoveryImpossible(format!(
                    "source '{}' can no longer be opened: {e}",
                    record.source
                ))
            })?;

        let mut found = false;
        let mut tail: Vec<&str> = Vec::new();
        for line in text.lines() {
            if found {
                tail.push(line);
            } else if line.trim() == record.last_line {
                found = true;
            }
        }
        if !found {
            return Err(StageError::RecoveryImpossible(format!(
                "line '{}' not found in '{}'; the source has changed since the checkpoint",
                record.last_line, record.source
            )));
        }

        self.inner
            .queue
            .lock()
            .await
            .load_lines(tail.into_iter(), record.source.clone());
        Ok(record.dispatched)
    }

    /// Atomically claim the run slot: Idle goes to Running, anything else
    /// leaves the channel untouched. The claim happens before any await in
    /// `start`/`resume_from_checkpoint`, so two concurrent requests can
    /// never both load the queue.
    fn claim_run(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == DispatcherState::Idle {
                *state = DispatcherState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Give the run slot back after a claim whose preparation failed.
    fn release_run(&self) {
        self.inner.state.send_replace(DispatcherState::Idle);
    }

    fn spawn_run(&self, dispatched_base: u64) -> StartOutcome {
        // A halt that arrived while the queue was loading targeted a run
        // that never transmitted anything; reassert Running and start clean.
        self.inner.halt.send_replace(false);
        self.inner.state.send_replace(DispatcherState::Running);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_loop(inner, dispatched_base).await;
        });
        StartOutcome::Started
    }

    /// Cancel the active run.
    ///
    /// Clears the queue immediately and lets the loop wind down; the
    /// in-flight command is not retracted and the physical stage may still
    /// be finishing a move. The checkpoint is left intact for recovery.
    pub async fn halt(&self) {
        if self.state() != DispatcherState::Running {
            tracing::debug!("halt requested with no active run");
            return;
        }
        self.inner.state.send_replace(DispatcherState::Halting);
        // Raise the flag before emptying the queue so a loop that observes
        // the cleared queue also observes the halt.
        self.inner.halt.send_replace(true);
        self.inner.queue.lock().await.clear();
        tracing::info!("halt requested; pending commands discarded");
    }

    /// Wait until the dispatcher settles back to [`DispatcherState::Idle`].
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.state.subscribe();
        loop {
            if *rx.borrow_and_update() == DispatcherState::Idle {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Transmit a single manual command (jog, homing, one-off entry)
    /// outside of a run.
    ///
    /// Rejected with [`StageError::RunActive`] while a run is active so
    /// manual traffic can never interleave with dispatched traffic on the
    /// wire. Blank lines and comments are dropped without touching the
    /// transport.
    pub async fn send_manual(&self, line: &str) -> Result<Option<String>, StageError> {
        if self.state() != DispatcherState::Idle {
            return Err(StageError::RunActive);
        }
        if !is_dispatchable(line) {
            return Ok(None);
        }
        let line = line.trim();
        let response = {
            let mut transport = self.inner.transport.lock().await;
            // A run may have claimed the dispatcher while we waited for
            // the transport; check again under the lock.
            if self.state() != DispatcherState::Idle {
                return Err(StageError::RunActive);
            }
            transport.send_line(line).await?;
            transport.read_line().await?
        };
        if is_rejection(&response) {
            tracing::warn!("controller rejected '{}': {}", line, response);
        }
        self.inner.tracker.lock().expect("tracker poisoned").apply(line);
        Ok(Some(response))
    }
}

/// GRBL answers `ok` or `error:<n>`; anything starting with "error" is a
/// rejection. Rejections are surfaced but do not stop a run, matching the
/// controller's own forgiving parsing.
fn is_rejection(response: &str) -> bool {
    response.to_ascii_lowercase().starts_with("error")
}

async fn transmit(
    transport: &mut (dyn Transport + '_),
    line: &str,
) -> Result<String, TransportError> {
    transport.send_line(line).await?;
    transport.read_line().await
}

async fn run_loop(inner: Arc<Inner>, dispatched_base: u64) {
    let mut halt_rx = inner.halt.subscribe();
    let mut dispatched = dispatched_base;
    let mut last_save: Option<Instant> = None;
    let run_id = Uuid::new_v4();

    // Resolve pacing parameters up front so a missing configuration fails
    // the run before anything is transmitted.
    let max_rate = match inner.params.get("xMaxRate") {
        Ok(rate) => rate,
        Err(e) => {
            fail(&inner, dispatched, e.into());
            return;
        }
    };

    {
        let queue = inner.queue.lock().await;
        let source = queue.source().unwrap_or_default().to_string();
        tracing::info!(
            "run {} started: {} pending commands from '{}'",
            run_id,
            queue.len(),
            source
        );
        let _ = inner.events.send(DispatchEvent::Started {
            run_id,
            source,
            pending: queue.len(),
        });
    }

    loop {
        if *halt_rx.borrow() {
            inner.state.send_replace(DispatcherState::Idle);
            tracing::info!("run {} halted after {} commands; checkpoint kept", run_id, dispatched);
            let _ = inner.events.send(DispatchEvent::Halted { dispatched });
            return;
        }

        let (entry, source) = {
            let mut queue = inner.queue.lock().await;
            match queue.dequeue() {
                Ok(entry) => {
                    let source = queue.source().unwrap_or_default().to_string();
                    (entry, source)
                }
                Err(QueueError::QueueEmpty) => {
                    // A halt that emptied the queue while we waited for the
                    // lock is a cancellation, not completion; let the halt
                    // branch above settle it with the checkpoint intact.
                    if *halt_rx.borrow() {
                        continue;
                    }
                    // Exhaustion is the normal completion signal, not an error.
                    if let Err(e) = inner.checkpoint.clear() {
                        tracing::warn!("could not clear checkpoint: {}", e);
                    }
                    inner.state.send_replace(DispatcherState::Idle);
                    tracing::info!("run {} complete: {} commands dispatched", run_id, dispatched);
                    let _ = inner.events.send(DispatchEvent::Completed { dispatched });
                    return;
                }
                Err(e) => {
                    fail(&inner, dispatched, e.into());
                    return;
                }
            }
        };

        let before = inner.tracker.lock().expect("tracker poisoned").position();

        let response = {
            let mut transport = inner.transport.lock().await;
            match transmit(transport.as_mut(), &entry).await {
                Ok(response) => response,
                Err(e) => {
                    // Transport failures are not retried: abandon the run
                    // and leave the checkpoint for manual recovery.
                    tracing::error!(
                        "transport failure on '{}' from '{}': {}; checkpoint kept",
                        entry,
                        source,
                        e
                    );
                    fail(&inner, dispatched, e.into());
                    return;
                }
            }
        };
        if is_rejection(&response) {
            tracing::warn!("controller rejected '{}': {}", entry, response);
        }

        let (after, feed_rate) = {
            let mut tracker = inner.tracker.lock().expect("tracker poisoned");
            tracker.apply(&entry);
            (tracker.position(), tracker.feed_rate())
        };
        dispatched += 1;

        // Checkpoint after the transmit it describes, never before, and at
        // most once per configured interval.
        let save_due = last_save.is_none_or(|at| at.elapsed() >= inner.checkpoint_interval);
        if save_due {
            let record = CheckpointRecord::new(entry.clone(), source.clone(), dispatched);
            if let Err(e) = inner.checkpoint.save(&record) {
                tracing::warn!("checkpoint save failed: {}", e);
            }
            last_save = Some(Instant::now());
        }

        // An F word on a dispatched line overrides the configured rate for
        // subsequent estimates.
        let rate = if feed_rate > 0.0 { feed_rate } else { max_rate };
        // The ramp term gets the max rate as well, not xMaxAccel: pacing
        // from the acceleration limit made long runs visibly choppy on
        // the bench, so the rate stays in for both terms.
        let delay = match delay_before_next(before, after, rate, rate) {
            Ok(delay) => delay,
            Err(e) => {
                fail(&inner, dispatched, e.into());
                return;
            }
        };
        tracing::debug!("dispatched '{}'; next move in {:?}", entry, delay);
        let _ = inner.events.send(DispatchEvent::Sent {
            line: entry,
            dispatched,
            response,
            delay,
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = halt_rx.changed() => {}
        }
    }
}

fn fail(inner: &Inner, dispatched: u64, error: StageError) {
    tracing::error!("run aborted after {} commands: {}", dispatched, error);
    inner.state.send_replace(DispatcherState::Idle);
    let _ = inner.events.send(DispatchEvent::Failed {
        dispatched,
        error: error.to_string(),
    });
}
