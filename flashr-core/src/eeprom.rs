//! Bootloader EEPROM configuration on Raspberry Pi hosts.
use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Command;

/// Configuration file applied when none is given.
pub const DEFAULT_CONFIG: &str = "/etc/boot.conf";

const TOOL: &str = "rpi-eeprom-config";

/// Applies `config` with `rpi-eeprom-config --apply` and returns the tool's
/// non-empty output lines.
pub fn apply_config(config: &Path) -> Result<Vec<String>> {
    apply_with(TOOL, config)
}

fn apply_with(tool: &str, config: &Path) -> Result<Vec<String>> {
    which::which(tool).with_context(|| format!("{tool} utility not found"))?;
    let output = Command::new(tool)
        .arg("--apply")
        .arg(config)
        .output()
        .with_context(|| format!("failed to run {tool}"))?;

    let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if !output.status.success() {
        let detail = lines.pop().unwrap_or_default();
        bail!("error configuring EEPROM ({}): {detail}", output.status);
    }
    tracing::info!(config = %config.display(), "EEPROM configuration applied");
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_is_reported() {
        let err = apply_with("no-such-eeprom-tool-flashr", Path::new(DEFAULT_CONFIG)).unwrap_err();
        assert!(err.to_string().contains("utility not found"));
    }

    #[test]
    fn output_lines_are_trimmed_and_failures_reported() {
        // `echo --apply <file>` stands in for the real tool
        let lines = apply_with("echo", Path::new("/etc/boot.conf")).unwrap();
        assert_eq!(lines, vec!["--apply /etc/boot.conf"]);
        assert!(apply_with("false", Path::new("/etc/boot.conf")).is_err());
    }
}
