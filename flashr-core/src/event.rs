//! The progress channel between an operation's background worker and the UI.
//!
//! Each operation gets a fresh bounded channel. The worker holds the sending
//! half wrapped in a [`Mailbox`]; the engine holds the receiving half and drops
//! it when the operation reaches a terminal state, so events of an old
//! operation can never reach a newer one.
use crate::error::EngineError;
use crate::operation::SizeEstimate;
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Which pipeline of an operation a process belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// The flash, extract or verify pipeline.
    Primary,
    /// The checksum pass that follows verification of a compressed image.
    Hash,
}

/// Identity of a running external process, as announced to the UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub phase: Phase,
}

/// Everything the UI learns about an operation arrives as one of these.
#[derive(Debug)]
pub enum ProgressEvent {
    /// A line of progress output or an informational note.
    Progress(String),
    /// A pipeline process has been started.
    Started(ProcessInfo),
    /// The expected transfer size is known.
    SizeEstimated(SizeEstimate),
    /// A flash finished and was synced.
    Done { source: PathBuf, destination: PathBuf },
    /// An extraction finished, was synced and renamed into place.
    ExtractDone { source: PathBuf, destination: PathBuf },
    /// An integrity check finished and its record was written.
    CheckDone { file: PathBuf, ok: bool },
    /// The operation failed.
    Error(EngineError),
    /// An abort finished: the process is dead and temporary files are gone.
    AbortCompleted,
}

impl ProgressEvent {
    /// Terminal events end the operation that produced them.
    ///
    /// A failed kill ([`EngineError::AbortFailed`]) is reported but is not
    /// terminal: it is always followed by [`ProgressEvent::AbortCompleted`].
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Error(EngineError::AbortFailed { .. }) => false,
            Self::Done { .. }
            | Self::ExtractDone { .. }
            | Self::CheckDone { .. }
            | Self::Error(_)
            | Self::AbortCompleted => true,
            Self::Progress(_) | Self::Started(_) | Self::SizeEstimated(_) => false,
        }
    }
}

/// Sending half of an operation's progress channel.
///
/// Two send flavours exist:
/// - [`Mailbox::post`] never blocks. It returns `false` when the event was
///   dropped because the channel is full or the receiver is gone. Progress
///   lines use it; losing one is acceptable.
/// - [`Mailbox::post_terminal`] waits for room (bounded by `patience`) so the
///   final event of an operation is delivered before the worker exits.
#[derive(Clone, Debug)]
pub struct Mailbox {
    tx: Sender<ProgressEvent>,
    closed: Arc<AtomicBool>,
}

/// Creates the channel for one operation instance.
pub fn mailbox(capacity: usize) -> (Mailbox, Receiver<ProgressEvent>) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    (
        Mailbox {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

impl Mailbox {
    /// Best-effort, non-blocking send.
    pub fn post(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!("progress channel full; dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.closed.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// Shorthand for posting a [`ProgressEvent::Progress`] note.
    pub fn note(&self, text: impl Into<String>) -> bool {
        self.post(ProgressEvent::Progress(text.into()))
    }

    /// Sends a terminal event, waiting up to `patience` for channel space.
    pub fn post_terminal(&self, event: ProgressEvent, patience: Duration) -> bool {
        match self.tx.send_timeout(event, patience) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(event)) => {
                tracing::warn!(?event, "terminal event undeliverable: channel stayed full");
                false
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                self.closed.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// Whether a send has observed that the receiver is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
