//! The engine: the foreground owner of at most one operation.
//!
//! [`Engine`] lives on the UI thread and never blocks on process I/O. All of
//! its work happens inside [`Engine::poll`], which waits for the next event of
//! the live operation and, while waiting, drives the delayed abort kill and
//! the hang watchdog.
//!
//! ```text
//! Idle --start--> Running --Done/ExtractDone/CheckDone--> Completed --> Idle
//!                 Running --Error--> Failed --> Idle
//!                 Running --abort--> Aborting --AbortCompleted--> Idle
//! ```
//!
//! The transition back to `Idle` happens only when the terminal event is
//! handed to the caller. At that point the worker is joined, its process slot
//! is cleared and the operation's channel is dropped, so nothing from that
//! operation can reach a later one.
use crate::abort::{ABORT_DELAY, AbortCoordinator, Control, KillReason};
use crate::error::EngineError;
use crate::estimate::DEFAULT_SIZE_MULTIPLIER;
use crate::event::{ProgressEvent, mailbox};
use crate::operation::{
    FinishedOperation, OperationId, OperationKind, OperationRequest, OperationState,
    OperationView, Outcome, SizeEstimate,
};
use crate::pipeline::Toolchain;
use crate::worker::Worker;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Silence on the progress stream after which a pipeline is considered hung.
pub const HANG_TIMEOUT: Duration = Duration::from_secs(120);

/// Tunables of the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum silence of a running pipeline before it is killed.
    pub hang_timeout: Duration,
    /// Delay between an abort request and the kill.
    pub abort_delay: Duration,
    /// Capacity of each operation's progress channel.
    pub mailbox_capacity: usize,
    /// Fallback ratio of uncompressed to compressed size.
    pub size_multiplier: u64,
    /// How long the worker waits for room to deliver its terminal event.
    pub terminal_patience: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hang_timeout: HANG_TIMEOUT,
            abort_delay: ABORT_DELAY,
            mailbox_capacity: 100,
            size_multiplier: DEFAULT_SIZE_MULTIPLIER,
            terminal_patience: Duration::from_secs(5),
        }
    }
}

/// Result of [`Engine::start`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started(OperationId),
    /// Another operation is running or aborting; nothing was started.
    Busy,
    /// The worker could not be spawned; an `Error` event is queued.
    Failed,
}

/// Result of [`Engine::abort`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortOutcome {
    Scheduled,
    AlreadyAborting,
    NothingRunning,
}

struct Operation {
    id: OperationId,
    request: OperationRequest,
    state: OperationState,
    started_at: Instant,
    estimate: SizeEstimate,
    pid: Option<u32>,
    events: Receiver<ProgressEvent>,
    control: Arc<Control>,
    abort: AbortCoordinator,
    worker: Option<JoinHandle<()>>,
    timed_out: bool,
    /// Set when the worker cannot be stopped; it is abandoned, not joined.
    detached: bool,
}

pub struct Engine {
    config: EngineConfig,
    toolchain: Arc<dyn Toolchain>,
    current: Option<Operation>,
    /// Events produced by the engine itself, delivered before channel events.
    local: VecDeque<ProgressEvent>,
    next_id: u64,
    last_finished: Option<FinishedOperation>,
}

impl Engine {
    pub fn new(config: EngineConfig, toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            config,
            toolchain,
            current: None,
            local: VecDeque::new(),
            next_id: 1,
            last_finished: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> OperationState {
        self.current
            .as_ref()
            .map_or(OperationState::Idle, |op| op.state)
    }

    pub fn is_busy(&self) -> bool {
        self.state().is_busy()
    }

    /// A snapshot of the live operation, for rendering.
    pub fn current(&self) -> Option<OperationView> {
        self.current.as_ref().map(|op| OperationView {
            id: op.id,
            kind: op.request.kind,
            state: op.state,
            source: op.request.source.clone(),
            destination: op.request.destination.clone(),
            started_at: op.started_at,
            estimate: op.estimate,
            pid: op.pid,
        })
    }

    /// The most recent operation that reached a terminal event.
    pub fn last_finished(&self) -> Option<&FinishedOperation> {
        self.last_finished.as_ref()
    }

    /// Starts `request` unless an operation is already live.
    pub fn start(&mut self, request: OperationRequest) -> StartOutcome {
        if let Some(op) = &self.current {
            tracing::info!(running = %op.id, kind = %request.kind, "operation in progress; request ignored");
            return StartOutcome::Busy;
        }

        let id = OperationId(self.next_id);
        self.next_id += 1;
        let (mailbox, events) = mailbox(self.config.mailbox_capacity);
        mailbox.note(starting_note(&request));

        let control = Arc::new(Control::new());
        let worker = Worker {
            id,
            request: request.clone(),
            toolchain: Arc::clone(&self.toolchain),
            mailbox,
            control: Arc::clone(&control),
            config: self.config.clone(),
        };
        let handle = match worker.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(%id, error = %e, "cannot spawn worker");
                self.local.push_back(ProgressEvent::Error(EngineError::Io(e)));
                return StartOutcome::Failed;
            }
        };

        tracing::info!(%id, kind = %request.kind, source = %request.source.display(), "state: Idle -> Running");
        self.current = Some(Operation {
            id,
            request,
            state: OperationState::Running,
            started_at: Instant::now(),
            estimate: SizeEstimate::UNKNOWN,
            pid: None,
            events,
            control,
            abort: AbortCoordinator::new(self.config.abort_delay),
            worker: Some(handle),
            timed_out: false,
            detached: false,
        });
        StartOutcome::Started(id)
    }

    /// Requests cancellation of the live operation.
    ///
    /// The kill is issued by a later [`Engine::poll`] once the abort delay has
    /// elapsed. The engine stays `Aborting` until `AbortCompleted` is consumed.
    pub fn abort(&mut self) -> AbortOutcome {
        let Some(op) = self.current.as_mut() else {
            return AbortOutcome::NothingRunning;
        };
        match op.state {
            OperationState::Running => {
                op.abort.request(Instant::now());
                op.state = OperationState::Aborting;
                tracing::info!(id = %op.id, kind = %op.request.kind, "state: Running -> Aborting");
                AbortOutcome::Scheduled
            }
            OperationState::Aborting => AbortOutcome::AlreadyAborting,
            _ => AbortOutcome::NothingRunning,
        }
    }

    /// Waits up to `timeout` for the next event.
    ///
    /// Returns `None` on timeout, and immediately when no operation is live
    /// and no engine event is queued.
    pub fn poll(&mut self, timeout: Duration) -> Option<ProgressEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            self.drive(now);

            if let Some(event) = self.local.pop_front() {
                self.observe(&event);
                return Some(event);
            }

            let op = self.current.as_ref()?;
            let mut wait = deadline.saturating_duration_since(now);
            if let Some(wakeup) = self.next_wakeup(op, now) {
                wait = wait.min(wakeup);
            }
            let event = match op.events.recv_timeout(wait) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    ProgressEvent::Error(EngineError::WorkerLost)
                }
            };
            self.observe(&event);
            return Some(event);
        }
    }

    /// Time until `drive` has something to do for `op`.
    fn next_wakeup(&self, op: &Operation, now: Instant) -> Option<Duration> {
        if let Some(remaining) = op.abort.remaining(now) {
            return Some(remaining);
        }
        if op.state == OperationState::Running && !op.timed_out {
            let silence = op.control.silence(now);
            return Some(self.config.hang_timeout.saturating_sub(silence));
        }
        None
    }

    /// Fires a due abort and enforces the hang window.
    fn drive(&mut self, now: Instant) {
        let Some(op) = self.current.as_mut() else {
            return;
        };
        if op.detached {
            return;
        }

        if op.abort.is_due(now) {
            if let Err(e) = op.abort.fire(&op.control, op.request.kind) {
                // the worker may never report; finish the handshake locally
                self.local.push_back(ProgressEvent::Error(e));
                self.local.push_back(ProgressEvent::AbortCompleted);
                op.detached = true;
            }
            return;
        }

        if op.state != OperationState::Running
            || op.timed_out
            || op.control.current().is_none()
            || op.control.silence(now) < self.config.hang_timeout
        {
            return;
        }
        op.timed_out = true;
        tracing::warn!(id = %op.id, window = ?self.config.hang_timeout, "no progress; killing pipeline");
        if let Err(e) = op.control.kill(KillReason::Timeout) {
            tracing::error!(id = %op.id, error = %e, "cannot kill hung pipeline");
            self.local
                .push_back(ProgressEvent::Error(EngineError::Timeout(self.config.hang_timeout)));
            op.detached = true;
        }
    }

    /// Updates the live view from an event about to be handed out.
    fn observe(&mut self, event: &ProgressEvent) {
        let Some(op) = self.current.as_mut() else {
            return;
        };
        match event {
            ProgressEvent::Started(info) => op.pid = info.pid,
            ProgressEvent::SizeEstimated(estimate) => op.estimate = *estimate,
            _ => {}
        }
        if event.is_terminal() {
            self.finish(event);
        }
    }

    /// The terminal transition: release everything the operation owned.
    fn finish(&mut self, event: &ProgressEvent) {
        let Some(mut op) = self.current.take() else {
            return;
        };
        let outcome = match event {
            ProgressEvent::AbortCompleted => Outcome::Aborted,
            ProgressEvent::Error(_) => Outcome::Failed,
            _ => Outcome::Completed,
        };
        let from = op.state;
        op.state = match outcome {
            Outcome::Completed => OperationState::Completed,
            Outcome::Failed | Outcome::Aborted => OperationState::Failed,
        };
        tracing::info!(id = %op.id, ?from, to = ?op.state, ?outcome, "operation finished; state -> Idle");

        op.control.detach();
        if let Some(worker) = op.worker.take() {
            if op.detached {
                tracing::warn!(id = %op.id, "abandoning worker that could not be stopped");
            } else if worker.join().is_err() {
                tracing::error!(id = %op.id, "worker panicked");
            }
        }
        self.last_finished = Some(FinishedOperation {
            id: op.id,
            kind: op.request.kind,
            outcome,
            elapsed: op.started_at.elapsed(),
        });
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(op) = &self.current {
            tracing::info!(id = %op.id, "engine dropped with live operation; killing it");
            if let Err(e) = op.control.kill(KillReason::Abort) {
                tracing::warn!(id = %op.id, error = %e, "cannot kill pipeline");
            }
        }
    }
}

fn starting_note(request: &OperationRequest) -> String {
    match request.kind {
        OperationKind::Flash => format!(
            "> Starting flash of {} to {}",
            request.source.display(),
            request.destination.display()
        ),
        kind => format!("> Starting {kind} of {}", request.source.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn idle_engine_has_nothing_to_do() {
        let mut engine = Engine::new(
            EngineConfig::default(),
            Arc::new(crate::pipeline::HostToolchain::default()),
        );
        assert_eq!(engine.state(), OperationState::Idle);
        assert_eq!(engine.abort(), AbortOutcome::NothingRunning);
        let start = Instant::now();
        assert!(engine.poll(Duration::from_secs(5)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(engine.current().is_none());
        assert!(engine.last_finished().is_none());
    }

    #[test]
    fn starting_notes_name_the_operation() {
        assert_eq!(
            starting_note(&OperationRequest::flash("/i/a.img", "/dev/sdb")),
            "> Starting flash of /i/a.img to /dev/sdb"
        );
        assert_eq!(
            starting_note(&OperationRequest::check(Path::new("/i/a.img.xz"))),
            "> Starting integrity check of /i/a.img.xz"
        );
    }

    #[test]
    fn default_config_matches_documented_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.hang_timeout, Duration::from_secs(120));
        assert_eq!(config.abort_delay, Duration::from_millis(500));
        assert_eq!(config.size_multiplier, 4);
    }
}
