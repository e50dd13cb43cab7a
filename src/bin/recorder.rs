//! recorder - synchronized multi-camera acquisition and recording.
//!
//! Subcommands:
//! 1. `scan`: list the attached cameras
//! 2. `view`: preview every camera (or one) for a while
//! 3. `record`: record a session to disk
//! 4. `serve`: accept JSON control commands, one per stdin line, replies on stdout
//!
//! Configuration comes from `RECORDER_CONFIG` and `RECORDER_*` variables.
//! Ctrl-C stops the running session and drains the encoders before exiting.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use multicam_recorder::{
    control, ui, RecordOptions, RecorderConfig, SessionCoordinator, SessionState,
};

/// How often the console loops drain previews and poll status.
const TICK: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(author, version, about = "Synchronized multi-camera recorder")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, global = true, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// List attached cameras.
    Scan,
    /// Preview without recording.
    View {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Preview only this camera slot.
        #[arg(long)]
        camera: Option<usize>,
    },
    /// Record one session.
    Record {
        #[arg(long)]
        session_id: String,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Override the configured frame rate.
        #[arg(long)]
        fps: Option<u32>,
        /// Per-camera settings file applied before recording.
        #[arg(long, value_name = "FILE")]
        settings: Option<PathBuf>,
    },
    /// Serve JSON control commands on stdin/stdout.
    Serve,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(
        ui::UiMode::parse(Some(&args.ui)),
        std::io::stderr().is_terminal(),
    );

    let config = {
        let _stage = ui.stage("Load configuration");
        RecorderConfig::load()?
    };
    let coordinator = SessionCoordinator::with_synthetic_driver(config);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })
        .context("error setting Ctrl-C handler")?;
    }

    let result = match args.mode {
        Mode::Scan => scan(&coordinator),
        Mode::View { seconds, camera } => {
            connect(&coordinator, &ui)?;
            match camera {
                Some(slot) => coordinator.start_single_view(slot)?,
                None => coordinator.start_viewing()?,
            }
            run_for(&coordinator, &ui, "viewing", seconds, &interrupted)
        }
        Mode::Record {
            session_id,
            seconds,
            fps,
            settings,
        } => {
            connect(&coordinator, &ui)?;
            let options = RecordOptions {
                fps,
                settings_file: settings,
            };
            let info = coordinator.start_recording_with(&session_id, &options)?;
            for file in &info.files {
                log::info!("recording to {}", file.display());
            }
            run_for(&coordinator, &ui, &session_id, seconds, &interrupted)
        }
        Mode::Serve => {
            connect(&coordinator, &ui)?;
            serve(&coordinator, &interrupted)
        }
    };
    coordinator.disconnect()?;
    result
}

fn scan(coordinator: &SessionCoordinator) -> Result<()> {
    let devices = coordinator.scan()?;
    if devices.is_empty() {
        println!("no cameras found");
    }
    for (slot, device) in devices.iter().enumerate() {
        println!("{slot}: {} {} (serial {})", device.vendor, device.model, device.serial);
    }
    Ok(())
}

fn connect(coordinator: &SessionCoordinator, ui: &ui::Ui) -> Result<()> {
    let cameras = {
        let _stage = ui.stage("Connect cameras");
        coordinator.connect()?
    };
    for cam in &cameras {
        log::info!(
            "camera {} '{}' {} (serial {}, context {:06x}, {})",
            cam.slot,
            cam.name,
            cam.model,
            cam.serial,
            cam.context,
            if cam.is_color { "color" } else { "mono" }
        );
    }
    Ok(())
}

/// Drain previews and poll status until the time is up, Ctrl-C, or a fault.
fn run_for(
    coordinator: &SessionCoordinator,
    ui: &ui::Ui,
    title: &str,
    seconds: u64,
    interrupted: &AtomicBool,
) -> Result<()> {
    let mut monitor = ui.monitor(title);
    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline && !interrupted.load(Ordering::SeqCst) {
        drain_previews(coordinator);
        let status = coordinator.poll_status();
        monitor.update(&status);
        if status.state == SessionState::Idle {
            break;
        }
        std::thread::sleep(TICK);
    }
    let report = {
        let _stage = ui.stage("Stop session");
        coordinator.stop()?
    };
    for (path, frames) in report.files.iter().zip(&report.frames_written) {
        log::info!("{}: {} frames", path.display(), frames);
    }
    match report.fault {
        Some(fault) => {
            monitor.finish(&format!("✘ {title}: {fault}"));
            Err(anyhow!("session failed: {fault}"))
        }
        None => {
            monitor.finish(&format!("✔ {title}"));
            Ok(())
        }
    }
}

fn drain_previews(coordinator: &SessionCoordinator) {
    for cam in coordinator.cameras() {
        let _ = coordinator.latest_preview(cam.slot);
    }
}

fn serve(coordinator: &SessionCoordinator, interrupted: &AtomicBool) -> Result<()> {
    let (tx, rx) = mpsc::channel::<String>();
    std::thread::Builder::new()
        .name("control-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawning stdin reader")?;

    log::info!("recorder serving control commands on stdin");
    let mut stdout = std::io::stdout();
    while !interrupted.load(Ordering::SeqCst) {
        match rx.recv_timeout(TICK) {
            Ok(line) => {
                let reply = control::handle_line(coordinator, &line);
                writeln!(stdout, "{reply}")?;
                stdout.flush()?;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::info!("control input closed");
                break;
            }
        }
        drain_previews(coordinator);
    }
    let report = coordinator.stop()?;
    if let Some(fault) = report.fault {
        log::warn!("last session ended with: {fault}");
    }
    Ok(())
}
