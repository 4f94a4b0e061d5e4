use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use flashr_core::device::Device;
use flashr_core::estimate::transferred_bytes;
use flashr_core::focus::{self, Capabilities, FocusTarget};
use flashr_core::integrity::IntegrityStore;
use flashr_core::units::{format_bytes, format_duration};
use flashr_core::{
    Engine, EngineConfig, EngineError, HostToolchain, OperationKind, OperationRequest, Phase,
    ProgressEvent, StartOutcome, eeprom, image, platform,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "flashr")]
#[command(about = "A safe, interactive tool for flashing, extracting and checking OS images", version)]
struct Cli {
    /// Directory holding the OS images
    #[arg(long, env = "FLASHR_IMAGES_DIR", default_value = "/os-images", global = true)]
    images_dir: PathBuf,

    /// Log engine diagnostics to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash an image to a device
    Flash {
        /// Image file to flash (chosen interactively if omitted)
        image: Option<PathBuf>,

        /// Target device (chosen interactively if omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Extract a compressed image next to itself
    Extract {
        /// Compressed image (chosen interactively if omitted)
        image: Option<PathBuf>,
    },
    /// Verify an image and record its checksum
    Check {
        /// Image file (chosen interactively if omitted)
        image: Option<PathBuf>,
    },
    /// List candidate target devices
    List,
    /// List the images in the images directory with their last check result
    Images,
    /// Apply the bootloader EEPROM configuration (Raspberry Pi only)
    Eeprom {
        /// Configuration file to apply
        #[arg(long, default_value = eeprom::DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Pick images, devices and actions from menus (the default)
    Interactive,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// With it disabled, an abort requested with Ctrl+C only shows our own
/// message. The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|_| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn require_root() -> Result<()> {
    if !platform::is_root() {
        bail!("flashr must be run as root to write devices and unmount partitions.");
    }
    Ok(())
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No candidate devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// One line describing an image and the outcome of its last check.
fn describe_image(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let size = std::fs::metadata(path)
        .map(|m| format_bytes(m.len()))
        .unwrap_or_else(|_| "?".into());
    let integrity = match IntegrityStore::for_image(path).lookup(path) {
        Some(record) => format!(
            "[{} {}]",
            record.status.as_str(),
            record.checked_at.format("%Y-%m-%d %H:%M")
        ),
        None => "[unchecked]".to_string(),
    };
    format!("{name:<40} {size:>10}  {integrity}")
}

/// Presents an interactive menu for the user to select an image.
fn select_image(images_dir: &Path, compressed_only: bool) -> Result<PathBuf> {
    let images: Vec<PathBuf> = image::list_images(images_dir)
        .map_err(|e| anyhow!("cannot read images directory {}: {e}", images_dir.display()))?
        .into_iter()
        .filter(|p| !compressed_only || image::is_compressed(p))
        .collect();
    if images.is_empty() {
        bail!("No images found in {}.", images_dir.display());
    }

    let items: Vec<String> = images.iter().map(|p| describe_image(p)).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select an image")
        .items(&items)
        .default(0)
        .interact()?;
    Ok(images[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn bar_style(template: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(template)?
        .progress_chars("■ "))
}

fn spinner_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner().template("{prefix:12} [{elapsed_precise}] {spinner} {msg}")?)
}

/// Runs one operation to its terminal event, rendering its progress.
///
/// This is the foreground event loop: it only ever blocks in
/// [`Engine::poll`]. Ctrl+C requests an abort instead of exiting.
fn run_operation(
    engine: &mut Engine,
    request: OperationRequest,
    interrupted: &AtomicBool,
) -> Result<()> {
    let kind = request.kind;
    match engine.start(request) {
        StartOutcome::Started(id) => tracing::debug!(%id, "operation started"),
        StartOutcome::Busy => bail!("Another operation is still running."),
        StartOutcome::Failed => {}
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style()?);
    pb.set_prefix(prefix_for(kind, Phase::Primary));
    pb.enable_steady_tick(Duration::from_millis(100));
    let mut abort_requested = false;

    loop {
        if interrupted.swap(false, Ordering::SeqCst) && !abort_requested {
            abort_requested = true;
            engine.abort();
            pb.println(format!("{}", style("Aborting operation... (please wait)").yellow()));
        }

        let Some(event) = engine.poll(Duration::from_millis(100)) else {
            if engine.is_busy() {
                continue;
            }
            pb.finish_and_clear();
            return Ok(());
        };

        match event {
            ProgressEvent::Progress(line) => match transferred_bytes(&line) {
                Some(bytes) => pb.set_position(bytes),
                None => pb.println(line),
            },
            ProgressEvent::Started(info) => {
                tracing::debug!(pid = ?info.pid, phase = ?info.phase, "pipeline running");
                pb.set_prefix(prefix_for(kind, info.phase));
                pb.set_position(0);
            }
            ProgressEvent::SizeEstimated(size) if size.is_known() => {
                let total = if size.exact {
                    "{total_bytes}"
                } else {
                    "~{total_bytes} (estimated)"
                };
                pb.set_style(bar_style(&format!(
                    "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.green/black}}] {{bytes}}/{total} ({{bytes_per_sec}})"
                ))?);
                pb.set_length(size.bytes);
            }
            ProgressEvent::SizeEstimated(_) => {}
            ProgressEvent::Done {
                source,
                destination,
            } => {
                pb.finish_and_clear();
                println!(
                    "\n✨ {} flashed successfully to {}{}.",
                    style(source.display()).cyan(),
                    style(destination.display()).cyan(),
                    elapsed(engine)
                );
                return Ok(());
            }
            ProgressEvent::ExtractDone { destination, .. } => {
                pb.finish_and_clear();
                println!(
                    "\n✨ Extracted to {}{}.",
                    style(destination.display()).cyan(),
                    elapsed(engine)
                );
                return Ok(());
            }
            ProgressEvent::CheckDone { file, ok } => {
                pb.finish_and_clear();
                let verdict = if ok {
                    style("passed").green()
                } else {
                    style("FAILED").red().bold()
                };
                println!(
                    "\nIntegrity check of {} {}{}.",
                    style(file.display()).cyan(),
                    verdict,
                    elapsed(engine)
                );
                return Ok(());
            }
            ProgressEvent::Error(e @ EngineError::AbortFailed { .. }) => {
                pb.println(format!("{} {e}", style("Error:").red().bold()));
            }
            ProgressEvent::Error(e) => {
                pb.finish_and_clear();
                return Err(e.into());
            }
            ProgressEvent::AbortCompleted => {
                pb.finish_and_clear();
                println!("\nOperation aborted{}.", elapsed(engine));
                return Ok(());
            }
        }
    }
}

fn prefix_for(kind: OperationKind, phase: Phase) -> &'static str {
    match (kind, phase) {
        (_, Phase::Hash) => "Hashing",
        (OperationKind::Flash, _) => "Flashing",
        (OperationKind::Extract, _) => "Extracting",
        (OperationKind::Check, _) => "Checking",
    }
}

fn elapsed(engine: &Engine) -> String {
    engine
        .last_finished()
        .map(|f| format!(" in {}", format_duration(f.elapsed)))
        .unwrap_or_default()
}

fn flash(
    engine: &mut Engine,
    images_dir: &Path,
    image: Option<PathBuf>,
    device: Option<PathBuf>,
    yes: bool,
    interrupted: &AtomicBool,
) -> Result<()> {
    let image = match image {
        Some(image) => image,
        None => select_image(images_dir, false)?,
    };
    let device = match device {
        Some(device) => device,
        None => {
            let devices = platform::get_candidate_devices()?;
            select_device(&devices, "Select the target device to FLASH")?.path
        }
    };

    println!(
        "{} This will erase all data on '{}'.",
        style("WARNING:").red().bold(),
        device.display(),
    );
    println!("  Device: {}", style(device.display()).cyan());
    println!("  Image:  {}", style(image.display()).cyan());
    println!();

    if !yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Flash operation cancelled.");
        return Ok(());
    }
    println!();
    run_operation(engine, OperationRequest::flash(image, device), interrupted)
}

fn interactive(engine: &mut Engine, images_dir: &Path, interrupted: &AtomicBool) -> Result<()> {
    let has_eeprom = platform::is_raspberry_pi();
    loop {
        let image = select_image(images_dir, false)?;
        let caps = Capabilities {
            eeprom: has_eeprom,
            compressed_selected: image::is_compressed(&image),
        };
        let actions: Vec<FocusTarget> = focus::available_targets(caps, engine.state())
            .into_iter()
            .filter(|t| {
                matches!(
                    t,
                    FocusTarget::Flash | FocusTarget::Extract | FocusTarget::Check | FocusTarget::Eeprom
                )
            })
            .collect();
        let mut items: Vec<&str> = actions.iter().map(|t| t.label()).collect();
        items.push("Quit");

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Action for {}", image.display()))
            .items(&items)
            .default(0)
            .interact()?;
        let Some(action) = actions.get(selection) else {
            return Ok(());
        };

        let result = match action {
            FocusTarget::Flash => flash(engine, images_dir, Some(image), None, false, interrupted),
            FocusTarget::Extract => {
                run_operation(engine, OperationRequest::extract(image), interrupted)
            }
            FocusTarget::Check => run_operation(engine, OperationRequest::check(image), interrupted),
            FocusTarget::Eeprom => apply_eeprom(Path::new(eeprom::DEFAULT_CONFIG)),
            _ => Ok(()),
        };
        if let Err(e) = result {
            eprintln!("{} {e:#}", style("Error:").red().bold());
        }
        println!();
    }
}

fn apply_eeprom(config: &Path) -> Result<()> {
    if !platform::is_raspberry_pi() {
        bail!("EEPROM configuration is only available on Raspberry Pi hosts.");
    }
    println!("> Starting EEPROM configuration...");
    for line in eeprom::apply_config(config)? {
        println!("{line}");
    }
    println!("EEPROM configuration applied.");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // Ctrl+C only raises a flag; the event loop turns it into an abort.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;

    let mut engine = Engine::new(EngineConfig::default(), Arc::new(HostToolchain::default()));
    let images_dir = cli.images_dir;

    match cli.command.unwrap_or(Commands::Interactive) {
        Commands::Flash { image, device, yes } => {
            require_root()?;
            flash(&mut engine, &images_dir, image, device, yes, &interrupted)?;
        }
        Commands::Extract { image } => {
            require_root()?;
            let image = match image {
                Some(image) => image,
                None => select_image(&images_dir, true)?,
            };
            if !image::is_compressed(&image) {
                bail!("{} is not a compressed image.", image.display());
            }
            run_operation(&mut engine, OperationRequest::extract(image), &interrupted)?;
        }
        Commands::Check { image } => {
            require_root()?;
            let image = match image {
                Some(image) => image,
                None => select_image(&images_dir, false)?,
            };
            run_operation(&mut engine, OperationRequest::check(image), &interrupted)?;
        }
        Commands::List => {
            let devices = platform::get_candidate_devices()?;
            if devices.is_empty() {
                println!("No candidate devices found.");
                return Ok(());
            }

            println!("Found {} candidate devices:", devices.len());
            println!(
                "\n  {:<12} {:<12} {:<10} {:<10} {}",
                "DEVICE", "NAME", "SIZE", "TYPE", "LOCATION"
            );
            println!("  {:-<12} {:-<12} {:-<10} {:-<10} {:-<20}", "", "", "", "", "");
            for device in devices {
                let location = if device.mount_point.is_empty() {
                    "(Not mounted)".to_string()
                } else {
                    device.mount_point
                };
                println!(
                    "  {:<12} {:<12} {:>7.1} GB  {:<10} {}",
                    device.path.display(),
                    device.name,
                    device.size_gb,
                    if device.removable { "removable" } else { "fixed" },
                    location
                );
            }
        }
        Commands::Images => {
            let images = image::list_images(&images_dir)
                .map_err(|e| anyhow!("cannot read images directory {}: {e}", images_dir.display()))?;
            if images.is_empty() {
                println!("No images found in {}.", images_dir.display());
                return Ok(());
            }
            for image in images {
                println!("  {}", describe_image(&image));
            }
        }
        Commands::Eeprom { config } => {
            require_root()?;
            apply_eeprom(&config)?;
        }
        Commands::Interactive => {
            require_root()?;
            interactive(&mut engine, &images_dir, &interrupted)?;
        }
    }

    Ok(())
}
