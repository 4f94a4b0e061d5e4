#![allow(dead_code)]

use flashr_core::pipeline::{ExtractPlan, FlashPlan, shell_quote};
use flashr_core::{Engine, EngineConfig, PipelineCommand, ProgressEvent, Toolchain};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A toolchain whose pipelines are short bash scripts.
///
/// Scripts may use `{src}`, `{dst}`, `{part}`, `{diag}` and `{file}`, which
/// are replaced by the quoted paths of the plan.
pub struct ScriptedToolchain {
    pub flash: String,
    pub extract: String,
    pub verify: String,
    pub hash: String,
    /// Written by `sync`, so tests can tell whether it ran.
    pub sync_marker: Option<PathBuf>,
    pub sync_fails: bool,
    pub unmount_fails: bool,
    /// Size listing script; `None` means the toolchain has no listing.
    pub listing: Option<String>,
    pub requires: Vec<String>,
}

impl Default for ScriptedToolchain {
    fn default() -> Self {
        Self {
            flash: "true".into(),
            extract: "true".into(),
            verify: "true".into(),
            hash: "sha256sum < {file}".into(),
            sync_marker: None,
            sync_fails: false,
            unmount_fails: false,
            listing: None,
            requires: Vec::new(),
        }
    }
}

fn render(script: &str, pairs: &[(&str, &Path)]) -> String {
    pairs.iter().fold(script.to_string(), |s, (key, path)| {
        s.replace(key, &shell_quote(&path.to_string_lossy()))
    })
}

impl ScriptedToolchain {
    fn command(&self, label: &str, script: String) -> PipelineCommand {
        PipelineCommand::shell(label, "bash", script).requiring(self.requires.clone())
    }
}

impl Toolchain for ScriptedToolchain {
    fn flash(&self, plan: &FlashPlan<'_>) -> PipelineCommand {
        let script = render(
            &self.flash,
            &[
                ("{src}", plan.source),
                ("{dst}", plan.destination),
                ("{diag}", plan.diagnostics),
            ],
        );
        self.command("flash pipeline", script)
    }

    fn extract(&self, plan: &ExtractPlan<'_>) -> PipelineCommand {
        let script = render(
            &self.extract,
            &[
                ("{src}", plan.source),
                ("{part}", plan.partial),
                ("{diag}", plan.diagnostics),
            ],
        );
        self.command("extraction pipeline", script)
    }

    fn verify(&self, image: &Path) -> PipelineCommand {
        self.command("xz -tv", render(&self.verify, &[("{file}", image)]))
    }

    fn hash(&self, file: &Path) -> PipelineCommand {
        self.command("sha256sum", render(&self.hash, &[("{file}", file)]))
    }

    fn listing(&self, image: &Path) -> Option<Command> {
        let script = self.listing.as_ref()?;
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(render(script, &[("{file}", image)]));
        Some(cmd)
    }

    fn sync(&self) -> io::Result<()> {
        if self.sync_fails {
            return Err(io::Error::other("sync: device went away"));
        }
        if let Some(marker) = &self.sync_marker {
            fs::write(marker, "synced")?;
        }
        Ok(())
    }

    fn unmount(&self, device: &Path) -> anyhow::Result<usize> {
        if self.unmount_fails {
            anyhow::bail!("umount {}1: target is busy", device.display());
        }
        Ok(0)
    }
}

pub fn engine(toolchain: ScriptedToolchain) -> Engine {
    engine_with(EngineConfig::default(), toolchain)
}

pub fn engine_with(config: EngineConfig, toolchain: ScriptedToolchain) -> Engine {
    Engine::new(config, Arc::new(toolchain))
}

/// Polls until a terminal event arrives; returns every event seen.
pub fn run_to_end(engine: &mut Engine) -> Vec<ProgressEvent> {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        if let Some(event) = engine.poll(Duration::from_millis(100)) {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }
    panic!("no terminal event within 30s; got {events:?}");
}

/// Polls until `pred` matches an event; returns the events seen so far.
pub fn run_until(engine: &mut Engine, pred: impl Fn(&ProgressEvent) -> bool) -> Vec<ProgressEvent> {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        if let Some(event) = engine.poll(Duration::from_millis(100)) {
            let hit = pred(&event);
            assert!(hit || !event.is_terminal(), "operation ended early: {event:?}");
            events.push(event);
            if hit {
                return events;
            }
        }
    }
    panic!("expected event did not arrive within 30s; got {events:?}");
}

pub fn notes(events: &[ProgressEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
