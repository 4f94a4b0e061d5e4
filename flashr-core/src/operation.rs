//! The data model of one long-running operation.
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// What an operation does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Write an image (raw or compressed) to a block device.
    Flash,
    /// Decompress a compressed image next to itself.
    Extract,
    /// Verify an image and record its checksum.
    Check,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flash => "flash",
            Self::Extract => "extraction",
            Self::Check => "integrity check",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of the engine's single operation slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Running,
    Aborting,
    Completed,
    Failed,
}

impl OperationState {
    /// Whether a new request must be refused in this state.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Running | Self::Aborting)
    }
}

/// A request from the UI to start an operation.
///
/// `destination` is the target device of a flash and the final output file
/// of an extraction (its partial sibling is derived from it). A check ignores
/// it. An extraction whose destination is empty or equal to `source` is
/// refused before anything on disk is touched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl OperationRequest {
    pub fn flash(image: impl Into<PathBuf>, device: impl Into<PathBuf>) -> Self {
        Self {
            kind: OperationKind::Flash,
            source: image.into(),
            destination: device.into(),
        }
    }

    /// Extracts next to the image, dropping its `.xz` suffix.
    ///
    /// A source that is not an `.img.xz` image gets an empty destination.
    pub fn extract(image: impl Into<PathBuf>) -> Self {
        let source = image.into();
        let destination = crate::image::extracted_path(&source).unwrap_or_default();
        Self::extract_to(source, destination)
    }

    pub fn extract_to(image: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        let source = image.into();
        let destination = output.into();
        Self {
            kind: OperationKind::Extract,
            source,
            destination,
        }
    }

    pub fn check(image: impl Into<PathBuf>) -> Self {
        let source = image.into();
        Self {
            kind: OperationKind::Check,
            destination: source.clone(),
            source,
        }
    }
}

/// Identity of one operation instance, unique for the lifetime of an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperationId(pub(crate) u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// The expected number of bytes an operation will move.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeEstimate {
    /// `0` means unknown; progress is free-running.
    pub bytes: u64,
    /// `false` when `bytes` came from a heuristic rather than a measurement.
    pub exact: bool,
}

impl SizeEstimate {
    pub const UNKNOWN: Self = Self {
        bytes: 0,
        exact: false,
    };

    pub fn exact(bytes: u64) -> Self {
        Self { bytes, exact: true }
    }

    pub fn estimated(bytes: u64) -> Self {
        Self {
            bytes,
            exact: false,
        }
    }

    pub fn is_known(&self) -> bool {
        self.bytes > 0
    }
}

/// A read-only view of the live operation, for rendering.
#[derive(Clone, Debug)]
pub struct OperationView {
    pub id: OperationId,
    pub kind: OperationKind,
    pub state: OperationState,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub started_at: Instant,
    pub estimate: SizeEstimate,
    pub pid: Option<u32>,
}

/// Summary of the most recent operation to reach a terminal transition.
#[derive(Clone, Debug)]
pub struct FinishedOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// How an operation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Aborted,
}
