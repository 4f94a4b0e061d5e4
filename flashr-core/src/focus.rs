//! Which control an interactive front-end may focus next.
//!
//! The set of focusable targets depends on what the host supports and on
//! whether an operation is live. While one is, only the lists, the log and
//! the abort control remain reachable, so no second operation can be started
//! from the keyboard.
use crate::operation::OperationState;

/// A focusable control of the interactive front-end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FocusTarget {
    DeviceList,
    ImageList,
    LogView,
    Flash,
    Extract,
    Check,
    Eeprom,
    Abort,
}

impl FocusTarget {
    pub fn label(self) -> &'static str {
        match self {
            Self::DeviceList => "Devices",
            Self::ImageList => "Images",
            Self::LogView => "Log",
            Self::Flash => "Flash",
            Self::Extract => "Extract",
            Self::Check => "Check",
            Self::Eeprom => "EEPROM",
            Self::Abort => "Abort",
        }
    }
}

/// What the host and the current selection allow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The host can apply bootloader EEPROM configuration.
    pub eeprom: bool,
    /// The selected image is compressed, so it can be extracted.
    pub compressed_selected: bool,
}

/// The targets reachable in `state`, in traversal order.
pub fn available_targets(caps: Capabilities, state: OperationState) -> Vec<FocusTarget> {
    let mut targets = vec![
        FocusTarget::DeviceList,
        FocusTarget::ImageList,
        FocusTarget::LogView,
    ];
    if state.is_busy() {
        targets.push(FocusTarget::Abort);
        return targets;
    }
    targets.push(FocusTarget::Flash);
    if caps.compressed_selected {
        targets.push(FocusTarget::Extract);
    }
    targets.push(FocusTarget::Check);
    if caps.eeprom {
        targets.push(FocusTarget::Eeprom);
    }
    targets
}

/// The target after `current`, wrapping around.
///
/// A `current` that is no longer available (say, `Flash` once an operation
/// starts) moves to the first available action, or the first target.
pub fn next_focus(current: FocusTarget, caps: Capabilities, state: OperationState) -> FocusTarget {
    let targets = available_targets(caps, state);
    match targets.iter().position(|&t| t == current) {
        Some(i) => targets[(i + 1) % targets.len()],
        None => first_action(&targets),
    }
}

/// Focus right after an operation has been started.
pub fn focus_after_start() -> FocusTarget {
    FocusTarget::Abort
}

fn first_action(targets: &[FocusTarget]) -> FocusTarget {
    targets
        .iter()
        .copied()
        .find(|t| {
            !matches!(
                t,
                FocusTarget::DeviceList | FocusTarget::ImageList | FocusTarget::LogView
            )
        })
        .unwrap_or(FocusTarget::DeviceList)
}
