//! Starts one external pipeline attached to a pseudo-terminal.
//!
//! Running under a pty makes tools like `pv` and `dd` emit their live,
//! carriage-return-redrawn progress output exactly as they would on a real
//! terminal.
use crate::error::EngineError;
use crate::event::{Phase, ProcessInfo};
use crate::lines::ProgressLines;
use crate::pipeline::PipelineCommand;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{self, Read};

/// Exit status of a finished pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
}

impl ExitStatus {
    pub fn success(self) -> bool {
        self.code == 0
    }
}

/// Kill capability for a running pipeline, usable from another thread.
///
/// The pty child is a session leader, so on Unix the whole process group is
/// signalled. Killing only the shell would leave the decompressor, meter and
/// writer running with the pty still open.
pub struct ProcessKiller {
    pid: Option<u32>,
    fallback: Box<dyn ChildKiller + Send + Sync>,
}

impl ProcessKiller {
    pub fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            return match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                // the whole group has already exited
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        self.fallback.kill()
    }
}

/// Exclusive ownership of one running pipeline: the process and the master
/// side of its pty.
///
/// Consuming the handle with [`ProcessHandle::wait`] reaps the process and
/// closes the pty, so a handle can never outlive the process it refers to.
pub struct ProcessHandle {
    label: String,
    info: ProcessInfo,
    child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    reader: Option<Box<dyn Read + Send>>,
}

/// Starts `command` under a fresh pty.
///
/// Nothing is left behind on failure: the pty pair is dropped before the
/// error is returned.
pub fn launch(command: &PipelineCommand, phase: Phase) -> Result<ProcessHandle, EngineError> {
    command.check_available()?;

    let pty = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| EngineError::launch(&command.label, e))?;

    let mut builder = CommandBuilder::new(&command.program);
    builder.args(&command.args);
    builder.env("TERM", "xterm");
    if let Ok(cwd) = std::env::current_dir() {
        builder.cwd(cwd);
    }

    let child = pty
        .slave
        .spawn_command(builder)
        .map_err(|e| EngineError::launch(&command.label, e))?;
    // Only the child may hold the slave side, so the reader sees end of
    // stream once the pipeline exits.
    drop(pty.slave);

    let master = pty.master;
    let reader = match master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => {
            let mut child = child;
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::launch(&command.label, e));
        }
    };

    let info = ProcessInfo {
        pid: child.process_id(),
        phase,
    };
    tracing::info!(command = %command.label, pid = ?info.pid, ?phase, "pipeline started");

    Ok(ProcessHandle {
        label: command.label.clone(),
        info,
        child,
        master,
        reader: Some(reader),
    })
}

impl ProcessHandle {
    pub fn info(&self) -> ProcessInfo {
        self.info
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// A kill capability that can be used from another thread.
    pub fn killer(&self) -> ProcessKiller {
        ProcessKiller {
            pid: self.info.pid,
            fallback: self.child.clone_killer(),
        }
    }

    /// Takes the line stream of the pty. Yields `None` on second call.
    pub fn take_lines(&mut self) -> Option<ProgressLines<Box<dyn Read + Send>>> {
        self.reader.take().map(ProgressLines::new)
    }

    /// Kills the pipeline immediately.
    pub fn kill(&mut self) -> io::Result<()> {
        self.killer().kill()
    }

    /// Waits for the process to exit, then releases the pty.
    pub fn wait(mut self) -> Result<ExitStatus, EngineError> {
        let status = self.child.wait();
        drop(self.reader.take());
        drop(self.master);
        let status = status?;
        let code = status.exit_code();
        tracing::debug!(command = %self.label, pid = ?self.info.pid, code, "pipeline exited");
        Ok(ExitStatus { code })
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
