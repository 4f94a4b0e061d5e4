//! The core, UI-agnostic engine of the `flashr` provisioning utility.
//!
//! `flashr-core` runs one heavyweight external operation at a time: flashing
//! an image to a block device, extracting a compressed image, or checking an
//! image's integrity. The bytes are moved by ordinary tools (`xz`, `pv`, `dd`,
//! `sha256sum`) running under a pseudo-terminal; the engine streams their
//! progress, detects hangs, supports aborting from any phase and makes sure
//! every operation ends in a consistent on-disk state.
//!
//! The library is structured into several key modules:
//! - [`runner`]: the [`Engine`] a front-end drives from its event loop.
//! - [`event`]: the [`ProgressEvent`]s an operation reports.
//! - [`pipeline`]: the [`Toolchain`] that builds each operation's pipelines.
//! - [`integrity`]: the persisted results of integrity checks.
//! - [`platform`] and [`image`]: discovery of target devices and images.
//!
//! Internally, [`estimate`], [`pty`], [`lines`], [`abort`] and the worker
//! carry out one operation on a background thread.
//!
//! ## Example: Flashing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use flashr_core::{Engine, EngineConfig, HostToolchain, OperationRequest, ProgressEvent};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let mut engine = Engine::new(EngineConfig::default(), Arc::new(HostToolchain::default()));
//! engine.start(OperationRequest::flash("/os-images/ubuntu.img.xz", "/dev/sdb"));
//!
//! while engine.is_busy() {
//!     match engine.poll(Duration::from_millis(100)) {
//!         Some(ProgressEvent::Progress(line)) => println!("{line}"),
//!         Some(ProgressEvent::Done { .. }) => println!("Flash complete!"),
//!         Some(ProgressEvent::Error(e)) => eprintln!("Error: {e}"),
//!         _ => {}
//!     }
//! }
//! ```

pub mod abort;
pub mod device;
pub mod eeprom;
pub mod error;
pub mod estimate;
pub mod event;
pub mod focus;
pub mod image;
pub mod integrity;
pub mod lines;
pub mod operation;
pub mod pipeline;
pub mod platform;
pub mod pty;
pub mod runner;
pub mod units;
mod worker;

pub use error::EngineError;
pub use event::{Phase, ProcessInfo, ProgressEvent};
pub use operation::{
    FinishedOperation, OperationId, OperationKind, OperationRequest, OperationState,
    OperationView, Outcome, SizeEstimate,
};
pub use pipeline::{HostToolchain, PipelineCommand, Toolchain, Tools};
pub use runner::{AbortOutcome, Engine, EngineConfig, StartOutcome};
