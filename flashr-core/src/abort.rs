//! Cancellation of the in-flight operation.
//!
//! Two halves cooperate:
//! - [`Control`] is shared between the engine and the worker. It holds the kill
//!   capability of whichever pipeline is currently running (primary or hash
//!   phase) and records why the operation was killed.
//! - [`AbortCoordinator`] lives on the engine side. An abort request arms a
//!   short delay; once it elapses the kill is issued through [`Control`].
//!
//! The worker, not the engine, reports the outcome: when its pipeline dies it
//! cleans up temporary files and posts `AbortCompleted`. The engine only
//! returns to idle once that event has been consumed.
use crate::error::EngineError;
use crate::event::ProcessInfo;
use crate::operation::OperationKind;
use crate::pty::{ProcessHandle, ProcessKiller};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Delay between an abort request and the kill signal.
pub const ABORT_DELAY: Duration = Duration::from_millis(500);

/// Why a pipeline was killed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillReason {
    Abort,
    Timeout,
}

struct LiveProcess {
    info: ProcessInfo,
    killer: ProcessKiller,
}

#[derive(Default)]
struct Slot {
    process: Option<LiveProcess>,
    reason: Option<KillReason>,
}

/// Kill capability and liveness tracking shared by the engine and one worker.
pub(crate) struct Control {
    slot: Mutex<Slot>,
    last_line: Mutex<Instant>,
}

impl Control {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            last_line: Mutex::new(Instant::now()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the pipeline that just started as the one to kill.
    ///
    /// Refused once a kill has been requested, so a phase that starts after
    /// an abort never runs unsupervised.
    pub(crate) fn attach(&self, handle: &ProcessHandle) -> Result<(), KillReason> {
        let mut slot = self.slot();
        if let Some(reason) = slot.reason {
            return Err(reason);
        }
        slot.process = Some(LiveProcess {
            info: handle.info(),
            killer: handle.killer(),
        });
        drop(slot);
        self.touch();
        Ok(())
    }

    /// Forgets the current pipeline once it has exited.
    pub(crate) fn detach(&self) {
        self.slot().process = None;
    }

    /// Records `reason` (the first one wins) and kills the current pipeline.
    ///
    /// Returns the killed process, or `None` when no pipeline is alive; in
    /// that case the worker notices the recorded reason before it starts its
    /// next phase.
    pub(crate) fn kill(&self, reason: KillReason) -> io::Result<Option<ProcessInfo>> {
        let mut slot = self.slot();
        slot.reason.get_or_insert(reason);
        match slot.process.as_mut() {
            Some(live) => {
                live.killer.kill()?;
                Ok(Some(live.info))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn kill_reason(&self) -> Option<KillReason> {
        self.slot().reason
    }

    pub(crate) fn current(&self) -> Option<ProcessInfo> {
        self.slot().process.as_ref().map(|live| live.info)
    }

    /// Notes that a progress line was just parsed.
    pub(crate) fn touch(&self) {
        *self.last_line.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last parsed line (or the start of the current phase).
    pub(crate) fn silence(&self, now: Instant) -> Duration {
        let last = *self.last_line.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }
}

/// The engine-side state of an abort request.
#[derive(Debug)]
pub(crate) struct AbortCoordinator {
    delay: Duration,
    deadline: Option<Instant>,
    fired: bool,
}

impl AbortCoordinator {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
            fired: false,
        }
    }

    /// Arms the delayed kill. Returns `false` if an abort was already requested.
    pub(crate) fn request(&mut self, now: Instant) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.delay);
        true
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        !self.fired && self.deadline.is_some_and(|d| now >= d)
    }

    /// Time left until the kill should be issued, if one is pending.
    pub(crate) fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.fired {
            return None;
        }
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// Issues the kill.
    pub(crate) fn fire(&mut self, control: &Control, kind: OperationKind) -> Result<(), EngineError> {
        self.fired = true;
        match control.kill(KillReason::Abort) {
            Ok(Some(info)) => {
                tracing::info!(%kind, pid = ?info.pid, phase = ?info.phase, "abort: pipeline killed");
                Ok(())
            }
            Ok(None) => {
                tracing::debug!(%kind, "abort: no pipeline alive, worker stops at next phase");
                Ok(())
            }
            Err(source) => {
                tracing::warn!(%kind, error = %source, "abort: kill failed");
                Err(EngineError::AbortFailed {
                    kind: kind.as_str(),
                    source,
                })
            }
        }
    }
}

/// Removes `path`, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Best-effort removal of every path an aborted or failed operation may have
/// left behind.
pub(crate) fn remove_leftovers(paths: &[&Path]) {
    for path in paths {
        match remove_if_exists(path) {
            Ok(true) => tracing::info!(path = %path.display(), "removed leftover file"),
            Ok(false) => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove leftover file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Phase;
    use crate::pipeline::PipelineCommand;
    use crate::pty::launch;
    use tempfile::tempdir;

    #[test]
    fn coordinator_fires_once_after_delay() {
        let mut abort = AbortCoordinator::new(Duration::from_millis(500));
        let t0 = Instant::now();
        assert!(!abort.is_due(t0));
        assert!(abort.request(t0));
        assert!(!abort.request(t0));
        assert!(!abort.is_due(t0 + Duration::from_millis(100)));
        assert_eq!(
            abort.remaining(t0 + Duration::from_millis(100)),
            Some(Duration::from_millis(400))
        );
        assert!(abort.is_due(t0 + Duration::from_millis(500)));

        let control = Control::new();
        abort.fire(&control, OperationKind::Flash).unwrap();
        assert!(!abort.is_due(t0 + Duration::from_secs(1)));
        assert_eq!(abort.remaining(t0), None);
        assert_eq!(control.kill_reason(), Some(KillReason::Abort));
    }

    #[test]
    fn attach_is_refused_after_kill() {
        let control = Control::new();
        assert_eq!(control.kill(KillReason::Timeout).unwrap(), None);
        control.kill(KillReason::Abort).unwrap();
        assert_eq!(control.kill_reason(), Some(KillReason::Timeout));

        let cmd = PipelineCommand::shell("probe", "bash", "sleep 30");
        let mut handle = launch(&cmd, Phase::Primary).unwrap();
        assert_eq!(control.attach(&handle), Err(KillReason::Timeout));
        assert!(control.current().is_none());
        handle.kill().unwrap();
        handle.wait().unwrap();
    }

    #[test]
    fn kill_reaches_attached_process() {
        let control = Control::new();
        let cmd = PipelineCommand::shell("probe", "bash", "sleep 30");
        let mut handle = launch(&cmd, Phase::Hash).unwrap();
        control.attach(&handle).unwrap();
        assert_eq!(control.current().map(|i| i.phase), Some(Phase::Hash));

        let killed = control.kill(KillReason::Abort).unwrap();
        assert_eq!(killed, Some(handle.info()));
        let _ = handle.take_lines().map(|lines| lines.count());
        assert!(!handle.wait().unwrap().success());
        control.detach();
        assert!(control.current().is_none());
    }

    #[test]
    fn leftovers_are_removed_and_missing_ones_ignored() {
        let dir = tempdir().unwrap();
        let part = dir.path().join("a.img.part");
        fs::write(&part, b"half").unwrap();
        let missing = dir.path().join("a.img");
        remove_leftovers(&[&part, &missing]);
        assert!(!part.exists());
        assert!(!remove_if_exists(&missing).unwrap());
    }
}
