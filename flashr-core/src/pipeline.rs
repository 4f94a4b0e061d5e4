//! Construction of the external pipelines each operation runs.
//!
//! The engine never moves image bytes itself. A flash is
//! `xz -dc | pv | dd`, an extraction is the same chain writing to a partial
//! file, and a check is `xz -tv` or `pv | sha256sum`. The [`Toolchain`] trait
//! is the seam between the engine and the host: it builds these commands and
//! performs the host side effects (sync, unmount) around them.
use crate::error::EngineError;
use crate::image::ImageFormat;
use crate::operation::SizeEstimate;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Names of the external utilities, resolved through `PATH` by default.
#[derive(Clone, Debug)]
pub struct Tools {
    pub shell: String,
    pub xz: String,
    pub pv: String,
    pub dd: String,
    pub sha256sum: String,
    pub sync: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            shell: "bash".into(),
            xz: "xz".into(),
            pv: "pv".into(),
            dd: "dd".into(),
            sha256sum: "sha256sum".into(),
            sync: "sync".into(),
        }
    }
}

/// One composed pipeline, ready to be started under a pty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineCommand {
    /// Short name used in logs and error messages.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    /// Executables that must be on `PATH` for the pipeline to start.
    pub requires: Vec<String>,
}

impl PipelineCommand {
    /// A pipeline run by `shell -c`, with `pipefail` so a failing producer
    /// is not masked by a succeeding consumer.
    pub fn shell(label: impl Into<String>, shell: &str, script: impl AsRef<str>) -> Self {
        Self {
            label: label.into(),
            program: shell.to_string(),
            args: vec![
                "-c".to_string(),
                format!("set -o pipefail; {}", script.as_ref()),
            ],
            requires: vec![shell.to_string()],
        }
    }

    pub fn requiring<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(tools.into_iter().map(Into::into));
        self
    }

    /// Verifies every required executable can be found.
    pub fn check_available(&self) -> Result<(), EngineError> {
        for tool in &self.requires {
            if which::which(tool).is_err() {
                return Err(EngineError::launch(
                    &self.label,
                    format!("{tool} utility not found"),
                ));
            }
        }
        Ok(())
    }
}

/// Quotes `s` for inclusion in a POSIX shell script.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// The inputs of a flash pipeline.
#[derive(Clone, Debug)]
pub struct FlashPlan<'a> {
    pub source: &'a Path,
    pub destination: &'a Path,
    pub format: ImageFormat,
    pub size: SizeEstimate,
    /// File the decompressor's stderr is redirected to, for diagnostics.
    pub diagnostics: &'a Path,
}

/// The inputs of an extraction pipeline.
#[derive(Clone, Debug)]
pub struct ExtractPlan<'a> {
    pub source: &'a Path,
    pub partial: &'a Path,
    pub size: SizeEstimate,
    pub diagnostics: &'a Path,
}

/// Host-facing operations of the engine.
///
/// [`HostToolchain`] is the real implementation. Alternative implementations
/// substitute scripted pipelines, e.g. to exercise the engine without block
/// devices.
pub trait Toolchain: Send + Sync {
    fn flash(&self, plan: &FlashPlan<'_>) -> PipelineCommand;
    fn extract(&self, plan: &ExtractPlan<'_>) -> PipelineCommand;
    /// Verifies a compressed image's internal integrity.
    fn verify(&self, image: &Path) -> PipelineCommand;
    /// Streams a file through a SHA-256 hasher, printing the digest.
    fn hash(&self, file: &Path) -> PipelineCommand;
    /// The decompressor's listing command used for size estimation.
    fn listing(&self, image: &Path) -> Option<Command>;
    /// Flushes filesystem buffers to stable storage.
    fn sync(&self) -> std::io::Result<()>;
    /// Unmounts every mounted partition of `device`; returns how many were unmounted.
    fn unmount(&self, device: &Path) -> anyhow::Result<usize>;
}

/// The toolchain used on a real host.
#[derive(Clone, Debug, Default)]
pub struct HostToolchain {
    pub tools: Tools,
}

impl HostToolchain {
    pub fn new(tools: Tools) -> Self {
        Self { tools }
    }

    fn meter(&self, size: SizeEstimate) -> String {
        if size.is_known() {
            format!("{} -f -s {}", self.tools.pv, size.bytes)
        } else {
            format!("{} -f", self.tools.pv)
        }
    }
}

impl Toolchain for HostToolchain {
    fn flash(&self, plan: &FlashPlan<'_>) -> PipelineCommand {
        let t = &self.tools;
        let dd = format!(
            "{} of={} bs=16M oflag=direct status=none",
            t.dd,
            quote_path(plan.destination)
        );
        match plan.format {
            ImageFormat::Xz => PipelineCommand::shell(
                "flash pipeline",
                &t.shell,
                format!(
                    "{} -dc {} 2>{} | {} | {}",
                    t.xz,
                    quote_path(plan.source),
                    quote_path(plan.diagnostics),
                    self.meter(plan.size),
                    dd
                ),
            )
            .requiring([&t.xz, &t.pv, &t.dd]),
            ImageFormat::Raw => PipelineCommand::shell(
                "flash pipeline",
                &t.shell,
                format!("{} -f {} | {}", t.pv, quote_path(plan.source), dd),
            )
            .requiring([&t.pv, &t.dd]),
        }
    }

    fn extract(&self, plan: &ExtractPlan<'_>) -> PipelineCommand {
        let t = &self.tools;
        PipelineCommand::shell(
            "extraction pipeline",
            &t.shell,
            format!(
                "{} -dc {} 2>{} | {} | {} of={} bs=16M status=none",
                t.xz,
                quote_path(plan.source),
                quote_path(plan.diagnostics),
                self.meter(plan.size),
                t.dd,
                quote_path(plan.partial)
            ),
        )
        .requiring([&t.xz, &t.pv, &t.dd])
    }

    fn verify(&self, image: &Path) -> PipelineCommand {
        let t = &self.tools;
        PipelineCommand::shell(
            "xz -tv",
            &t.shell,
            format!("{} -tv {}", t.xz, quote_path(image)),
        )
        .requiring([&t.xz])
    }

    fn hash(&self, file: &Path) -> PipelineCommand {
        let t = &self.tools;
        PipelineCommand::shell(
            "sha256sum",
            &t.shell,
            format!("{} -f {} | {}", t.pv, quote_path(file), t.sha256sum),
        )
        .requiring([&t.pv, &t.sha256sum])
    }

    fn listing(&self, image: &Path) -> Option<Command> {
        let mut cmd = Command::new(&self.tools.xz);
        cmd.arg("-l").arg(image);
        Some(cmd)
    }

    fn sync(&self) -> std::io::Result<()> {
        let status = Command::new(&self.tools.sync).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("{} exited with {status}", self.tools.sync)))
        }
    }

    fn unmount(&self, device: &Path) -> anyhow::Result<usize> {
        crate::platform::unmount_partitions(device)
    }
}

/// Paths a running extraction owns and must clean up on any non-success path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractPaths {
    pub partial: PathBuf,
    pub output: PathBuf,
}

impl ExtractPaths {
    pub fn for_output(output: PathBuf) -> Self {
        Self {
            partial: crate::image::partial_path(&output),
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's.img"), r"'it'\''s.img'");
    }

    #[test]
    fn compressed_flash_uses_size_and_captures_stderr() {
        let host = HostToolchain::default();
        let cmd = host.flash(&FlashPlan {
            source: Path::new("/os-images/u.img.xz"),
            destination: Path::new("/dev/sdb"),
            format: ImageFormat::Xz,
            size: SizeEstimate::exact(1024),
            diagnostics: Path::new("/tmp/diag"),
        });
        assert_eq!(cmd.program, "bash");
        let script = &cmd.args[1];
        assert!(script.starts_with("set -o pipefail; "));
        assert!(script.contains("xz -dc '/os-images/u.img.xz' 2>'/tmp/diag'"));
        assert!(script.contains("pv -f -s 1024"));
        assert!(script.contains("dd of='/dev/sdb' bs=16M oflag=direct"));
        assert!(cmd.requires.contains(&"xz".to_string()));
    }

    #[test]
    fn free_running_meter_without_size() {
        let host = HostToolchain::default();
        let cmd = host.extract(&ExtractPlan {
            source: Path::new("/i/u.img.xz"),
            partial: Path::new("/i/u.img.part"),
            size: SizeEstimate::UNKNOWN,
            diagnostics: Path::new("/tmp/d"),
        });
        let script = &cmd.args[1];
        assert!(script.contains("| pv -f |"));
        assert!(script.contains("of='/i/u.img.part'"));
    }

    #[test]
    fn missing_tool_is_a_launch_error() {
        let cmd = PipelineCommand::shell("probe", "bash", "true")
            .requiring(["definitely-not-a-real-tool-flashr"]);
        let err = cmd.check_available().unwrap_err();
        assert!(matches!(err, EngineError::Launch { .. }));
        assert!(err.to_string().contains("definitely-not-a-real-tool-flashr utility not found"));
    }

    #[test]
    fn extract_paths_are_derived_from_output() {
        let paths = ExtractPaths::for_output(PathBuf::from("/i/u.img"));
        assert_eq!(paths.output, Path::new("/i/u.img"));
        assert_eq!(paths.partial, Path::new("/i/u.img.part"));
    }
}
