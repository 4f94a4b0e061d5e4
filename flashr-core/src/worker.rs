//! The background half of an operation.
//!
//! One worker thread is spawned per operation. It owns every blocking call of
//! that operation: the size probe, the unmount, reading the pty of each
//! pipeline phase, `sync` and the final rename or record write. It reports
//! through the operation's [`Mailbox`] and always ends with exactly one
//! terminal event.
use crate::abort::{Control, KillReason, remove_if_exists, remove_leftovers};
use crate::error::EngineError;
use crate::estimate::SizeEstimator;
use crate::event::{Mailbox, Phase, ProgressEvent};
use crate::image::{self, ImageFormat, sidecar_path};
use crate::integrity::{
    ImageType, IntegrityRecord, IntegrityStatus, IntegrityStore, Sidecar, digest_from_line,
    read_sidecar,
};
use crate::operation::{OperationId, OperationKind, OperationRequest, SizeEstimate};
use crate::pipeline::{ExtractPaths, ExtractPlan, FlashPlan, PipelineCommand, Toolchain};
use crate::pty::{self, ExitStatus};
use crate::runner::EngineConfig;
use crate::units::format_bytes;
use chrono::Utc;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tempfile::NamedTempFile;

/// Lines of decompressor stderr kept for an error message.
const DIAGNOSTIC_LINES: usize = 5;

const EXTRACT_LABEL: &str = "extraction pipeline";

/// Why an operation stopped short of its result.
enum Failure {
    Killed(KillReason),
    Error(EngineError),
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Self::Error(e)
    }
}

type Step<T> = Result<T, Failure>;

pub(crate) struct Worker {
    pub(crate) id: OperationId,
    pub(crate) request: OperationRequest,
    pub(crate) toolchain: Arc<dyn Toolchain>,
    pub(crate) mailbox: Mailbox,
    pub(crate) control: Arc<Control>,
    pub(crate) config: EngineConfig,
}

impl Worker {
    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("flashr-{}", self.id))
            .spawn(move || self.run())
    }

    fn run(self) {
        tracing::info!(id = %self.id, kind = %self.request.kind, source = %self.request.source.display(), "worker started");
        let result = match self.request.kind {
            OperationKind::Flash => self.flash(),
            OperationKind::Extract => self.extract(),
            OperationKind::Check => self.check(),
        };
        let event = self.conclude(result);
        tracing::info!(id = %self.id, ?event, "worker finished");
        if !self.mailbox.post_terminal(event, self.config.terminal_patience) {
            tracing::warn!(id = %self.id, "terminal event was not delivered");
        }
    }

    /// Turns the outcome of the operation body into its terminal event.
    ///
    /// A requested kill wins over whatever the body returned: an abort always
    /// ends in `AbortCompleted`, and a hang always ends in a timeout error.
    fn conclude(&self, result: Step<ProgressEvent>) -> ProgressEvent {
        let error = match result {
            Err(Failure::Killed(reason)) => return self.killed(reason),
            Ok(event) => match self.control.kill_reason() {
                Some(reason) => return self.killed(reason),
                None => return event,
            },
            Err(Failure::Error(e)) => e,
        };
        if let Some(reason) = self.control.kill_reason() {
            return self.killed(reason);
        }
        self.clean_up(false);
        ProgressEvent::Error(error)
    }

    fn killed(&self, reason: KillReason) -> ProgressEvent {
        match reason {
            KillReason::Abort => {
                self.clean_up(true);
                self.mailbox.note(format!("{} aborted.", capitalize(self.request.kind.as_str())));
                ProgressEvent::AbortCompleted
            }
            KillReason::Timeout => {
                self.clean_up(false);
                ProgressEvent::Error(EngineError::Timeout(self.config.hang_timeout))
            }
        }
    }

    /// Removes what a non-successful run may have left behind.
    ///
    /// Only extraction writes files of its own. After an abort the final
    /// output is removed as well, since it may hold an incomplete image.
    /// A refused extraction has no paths and nothing to remove.
    fn clean_up(&self, aborted: bool) {
        if self.request.kind != OperationKind::Extract {
            return;
        }
        let Ok(paths) = self.extract_paths() else {
            return;
        };
        if aborted {
            remove_leftovers(&[&paths.partial, &paths.output]);
        } else {
            remove_leftovers(&[&paths.partial]);
        }
    }

    /// The output and partial paths of an extraction.
    ///
    /// Only an `.img.xz` source with an output distinct from it (and from its
    /// partial file) is accepted.
    fn extract_paths(&self) -> Result<ExtractPaths, EngineError> {
        let OperationRequest {
            source,
            destination,
            ..
        } = &self.request;
        if !image::is_compressed(source) {
            return Err(EngineError::launch(
                EXTRACT_LABEL,
                format!("{} is not a compressed image", source.display()),
            ));
        }
        let paths = ExtractPaths::for_output(destination.clone());
        if destination.as_os_str().is_empty() || destination == source || &paths.partial == source {
            return Err(EngineError::launch(
                EXTRACT_LABEL,
                format!("no output path distinct from {}", source.display()),
            ));
        }
        Ok(paths)
    }

    /// Runs one pipeline phase to completion, forwarding its output.
    ///
    /// Every parsed line refreshes the hang watchdog and is offered to
    /// `on_line` before being posted as progress.
    fn run_phase(
        &self,
        command: &PipelineCommand,
        phase: Phase,
        mut on_line: impl FnMut(&str),
    ) -> Step<ExitStatus> {
        let mut handle = pty::launch(command, phase)?;
        if let Err(reason) = self.control.attach(&handle) {
            tracing::debug!(command = %command.label, ?reason, "kill requested before start");
            let _ = handle.kill();
            let _ = handle.wait();
            return Err(Failure::Killed(reason));
        }
        self.mailbox.post(ProgressEvent::Started(handle.info()));

        if let Some(lines) = handle.take_lines() {
            for line in lines {
                self.control.touch();
                on_line(&line);
                tracing::trace!(command = %command.label, %line);
                if !self.mailbox.post(ProgressEvent::Progress(line)) && self.mailbox.is_closed() {
                    tracing::warn!(command = %command.label, "progress receiver gone; stopping pipeline");
                    if let Err(e) = self.control.kill(KillReason::Abort) {
                        tracing::warn!(error = %e, "cannot stop pipeline");
                    }
                    break;
                }
            }
        }

        let status = handle.wait();
        self.control.detach();
        let status = status?;
        if let Some(reason) = self.control.kill_reason() {
            return Err(Failure::Killed(reason));
        }
        Ok(status)
    }

    fn estimate(&self, compressed: bool) -> SizeEstimate {
        let source = &self.request.source;
        // a check moves the stored bytes, so the listing has nothing to add
        let listing = if compressed && self.request.kind != OperationKind::Check {
            self.toolchain.listing(source)
        } else {
            None
        };
        let size = SizeEstimator::new(self.config.size_multiplier).estimate(
            source,
            compressed,
            self.request.kind,
            listing,
        );
        self.mailbox.post(ProgressEvent::SizeEstimated(size));
        if !size.is_known() {
            self.mailbox.note("Could not determine image size; progress is free-running.");
        } else if size.exact {
            self.mailbox.note(format!("Image size: {}", format_bytes(size.bytes)));
        } else {
            self.mailbox.note(format!(
                "Estimated size: ~{} (approximate)",
                format_bytes(size.bytes)
            ));
        }
        size
    }

    fn sync(&self) -> Step<()> {
        self.mailbox.note("Syncing...");
        self.toolchain
            .sync()
            .map_err(|source| EngineError::Finalize {
                step: "sync",
                source,
            })?;
        self.mailbox.note("Sync completed successfully.");
        Ok(())
    }

    fn flash(&self) -> Step<ProgressEvent> {
        let OperationRequest {
            source,
            destination,
            ..
        } = &self.request;
        let format = ImageFormat::from_path(source).unwrap_or(ImageFormat::Raw);

        self.mailbox.note(format!(
            "Unmounting all partitions under {} if mounted...",
            destination.display()
        ));
        let note = match self.toolchain.unmount(destination) {
            Ok(0) => format!("No partitions to unmount under {}", destination.display()),
            Ok(n) => format!("Unmounted {n} partition(s)."),
            Err(e) => format!("Unmount error (ignored): {e:#}"),
        };
        self.mailbox.note(note);

        let size = self.estimate(format.is_compressed());
        let diagnostics = diagnostics_file("flash pipeline")?;
        let command = self.toolchain.flash(&FlashPlan {
            source,
            destination,
            format,
            size,
            diagnostics: diagnostics.path(),
        });
        let status = self.run_phase(&command, Phase::Primary, |_| {})?;
        if !status.success() {
            return Err(runtime_error(&command, status, diagnostics.path()).into());
        }

        self.sync()?;
        Ok(ProgressEvent::Done {
            source: source.clone(),
            destination: destination.clone(),
        })
    }

    fn extract(&self) -> Step<ProgressEvent> {
        let source = &self.request.source;
        let paths = self.extract_paths()?;

        let stale = remove_if_exists(&paths.partial).map_err(|e| {
            EngineError::launch(EXTRACT_LABEL, format!("cannot remove {}: {e}", paths.partial.display()))
        })?;
        if stale {
            self.mailbox.note(format!(
                "Removed leftover partial file {}",
                paths.partial.display()
            ));
        }
        if paths.output.exists() {
            self.mailbox.note(format!(
                "Output file {} already exists. Removing...",
                paths.output.display()
            ));
            remove_if_exists(&paths.output).map_err(|e| {
                EngineError::launch(EXTRACT_LABEL, format!("cannot remove {}: {e}", paths.output.display()))
            })?;
        }

        let size = self.estimate(true);
        let diagnostics = diagnostics_file(EXTRACT_LABEL)?;
        let command = self.toolchain.extract(&ExtractPlan {
            source,
            partial: &paths.partial,
            size,
            diagnostics: diagnostics.path(),
        });
        let status = self.run_phase(&command, Phase::Primary, |_| {})?;
        if !status.success() {
            return Err(runtime_error(&command, status, diagnostics.path()).into());
        }

        self.sync()?;
        fs::rename(&paths.partial, &paths.output).map_err(|source| EngineError::Finalize {
            step: "rename",
            source,
        })?;
        if let Ok(meta) = fs::metadata(&paths.output) {
            self.mailbox.note(format!(
                "Extracted {} to {}",
                format_bytes(meta.len()),
                paths.output.display()
            ));
        }
        Ok(ProgressEvent::ExtractDone {
            source: source.clone(),
            destination: paths.output,
        })
    }

    fn check(&self) -> Step<ProgressEvent> {
        let source = &self.request.source;
        self.estimate(image::is_compressed(source));
        let record = if image::is_compressed(source) {
            self.check_compressed(source)?
        } else {
            self.check_raw(source)?
        };

        // a record is only written by a check that ran to the end
        if let Some(reason) = self.control.kill_reason() {
            return Err(Failure::Killed(reason));
        }
        let ok = record.status != IntegrityStatus::Failed;
        let store = IntegrityStore::for_image(source);
        store.save(source, record)?;
        self.mailbox.note(format!(
            "Saved integrity record to {}",
            store.path().display()
        ));
        Ok(ProgressEvent::CheckDone {
            file: source.clone(),
            ok,
        })
    }

    /// Verifies the container, then hashes the compressed bytes whatever the
    /// verdict so a corrupt file can still be identified later.
    fn check_compressed(&self, source: &Path) -> Step<IntegrityRecord> {
        let verify = self.toolchain.verify(source);
        let verified = self.run_phase(&verify, Phase::Primary, |_| {})?.success();
        self.mailbox.note(if verified {
            "Integrity OK. Computing SHA-256 of compressed file..."
        } else {
            "Integrity check failed. Computing SHA-256 of compressed file..."
        });

        let hash = self.toolchain.hash(source);
        let mut digest = None;
        let result = self.run_phase(&hash, Phase::Hash, |line| {
            if let Some(d) = digest_from_line(line) {
                digest = Some(d);
            }
        });
        let actual = match result {
            Ok(status) if status.success() => digest,
            Ok(status) => {
                self.mailbox.note(format!(
                    "SHA-256 computation failed (exit code {}); recording verification result only",
                    status.code
                ));
                None
            }
            Err(Failure::Error(e)) => {
                self.mailbox.note(format!(
                    "SHA-256 computation failed: {e}; recording verification result only"
                ));
                None
            }
            Err(killed) => return Err(killed),
        };
        if let Some(actual) = &actual {
            self.mailbox.note(format!("SHA-256: {actual}"));
        }

        Ok(IntegrityRecord {
            image_type: ImageType::Compressed,
            method: verify.label,
            status: if verified {
                IntegrityStatus::Ok
            } else {
                IntegrityStatus::Failed
            },
            checked_at: Utc::now(),
            expected: None,
            actual,
        })
    }

    /// Hashes a raw image and compares it with its sidecar, if any.
    fn check_raw(&self, source: &Path) -> Step<IntegrityRecord> {
        let sidecar = sidecar_path(source);
        let expected = match read_sidecar(source) {
            Sidecar::Expected(digest) => Some(digest),
            Sidecar::Missing => {
                self.mailbox.note(format!(
                    "No {} found; computing actual SHA-256 only",
                    sidecar.display()
                ));
                None
            }
            Sidecar::Malformed => {
                self.mailbox.note(format!(
                    "Warning: invalid checksum format in {}; will compute actual hash only",
                    sidecar.display()
                ));
                None
            }
        };

        let hash = self.toolchain.hash(source);
        let mut digest = None;
        let status = self.run_phase(&hash, Phase::Primary, |line| {
            if let Some(d) = digest_from_line(line) {
                digest = Some(d);
            }
        })?;
        if !status.success() {
            return Err(EngineError::Runtime {
                command: hash.label,
                code: status.code,
                detail: None,
            }
            .into());
        }
        let Some(actual) = digest else {
            return Err(EngineError::Runtime {
                command: hash.label,
                code: status.code,
                detail: Some("no SHA-256 value in output".into()),
            }
            .into());
        };

        let status = match &expected {
            Some(e) if e.eq_ignore_ascii_case(&actual) => {
                self.mailbox.note("Checksum OK: matches sidecar value.");
                IntegrityStatus::Ok
            }
            Some(e) => {
                self.mailbox.note(format!(
                    "Checksum MISMATCH: expected {e}, got {actual}"
                ));
                IntegrityStatus::Failed
            }
            None => {
                self.mailbox.note(format!("SHA-256: {actual}"));
                IntegrityStatus::Computed
            }
        };
        Ok(IntegrityRecord {
            image_type: ImageType::Raw,
            method: hash.label,
            status,
            checked_at: Utc::now(),
            expected,
            actual: Some(actual),
        })
    }
}

fn diagnostics_file(label: &str) -> Result<NamedTempFile, EngineError> {
    tempfile::Builder::new()
        .prefix("flashr-diag-")
        .tempfile()
        .map_err(|e| EngineError::launch(label, format!("cannot create diagnostics file: {e}")))
}

/// Builds the runtime error of a failed pipeline, with the tail of the
/// decompressor's stderr as detail.
fn runtime_error(command: &PipelineCommand, status: ExitStatus, diagnostics: &Path) -> EngineError {
    let detail = fs::read_to_string(diagnostics).ok().and_then(|text| {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let tail = lines[lines.len().saturating_sub(DIAGNOSTIC_LINES)..].join("; ");
        (!tail.is_empty()).then_some(tail)
    });
    EngineError::Runtime {
        command: command.label.clone(),
        code: status.code,
        detail,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
