//! RaplMonitor - Monitor Process
//!
//! This process manages:
//! - Confirming a relaunch handoff to the parent that started it
//! - The single-instance lock for the user session
//! - Loading settings and running the autostart bootstrap in the background
//! - Exiting cleanly once a replacement process has taken over

#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use anyhow::{Context, Result};
use std::process::ExitCode;

use rapl_monitor_core::bootstrap::Capabilities;
use rapl_monitor_core::config::AppConfig;
use rapl_monitor_core::error::StartupError;
use rapl_monitor_core::geometry;
use rapl_monitor_core::handoff::LaunchOrigin;
use rapl_monitor_core::instance_lock::{InstanceLock, LockError};
use rapl_monitor_core::worker::BootstrapEvent;
use rapl_monitor_core::Session;

/// Exit code for startup failures the monitor cannot recover from
const EXIT_STARTUP_FAILURE: u8 = 2;

/// Startup flags parsed from command line
#[derive(Debug, Default, Clone)]
struct StartupFlags {
    /// Debug-level logging
    verbose: bool,
    /// Exit once the bootstrap has finished instead of staying up
    bootstrap_only: bool,
    /// Change the start-at-logon preference before running
    set_autostart: Option<bool>,
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // The parent is polling for this, so it goes first
    let origin = LaunchOrigin::from_args(&args);
    let handoff_confirmation = origin.signal_alive();

    let flags = parse_args(&args);
    init_logging(flags.verbose);

    tracing::info!("RaplMonitor {} starting...", env!("CARGO_PKG_VERSION"));
    if let Err(e) = handoff_confirmation {
        tracing::warn!("Failed to confirm handoff: {}", e);
    }

    match run(flags, origin) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            if e.downcast_ref::<StartupError>().is_some() {
                ExitCode::from(EXIT_STARTUP_FAILURE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(flags: StartupFlags, origin: LaunchOrigin) -> Result<ExitCode> {
    let config = AppConfig::for_current_user()?;
    let current_exe = std::env::current_exe().map_err(StartupError::CurrentExe)?;
    tracing::info!("Config directory: {}", config.config_dir.display());

    let _lock = match acquire_lock(&config, &origin) {
        Ok(lock) => Some(lock),
        Err(LockError::AlreadyHeld(name)) => {
            tracing::info!("Another instance holds {}, exiting", name);
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => {
            tracing::warn!("Running without instance lock: {}", e);
            None
        }
    };

    let displays = geometry::current_work_areas();
    tracing::debug!("Attached displays: {:?}", displays);

    let caps = Capabilities::system(&config);
    let mut session = Session::start(config, caps, origin, current_exe, &displays)
        .context("Failed to start session")?;

    let view = session.startup_view();
    tracing::info!(
        "Window at {:?}, opacity {:.2}, refresh every {:?}",
        view.geometry(),
        view.opacity(),
        view.refresh_rate().interval()
    );

    if session.is_first_run() {
        tracing::info!("Welcome to RAPL Monitor. Right-click the widget for settings.");
        if let Err(e) = session.complete_first_run() {
            tracing::warn!("Failed to record first run: {}", e);
        }
    }

    let mut pending_toggle = false;
    if let Some(enabled) = flags.set_autostart {
        session
            .set_autostart(enabled)
            .context("Failed to change autostart preference")?;
        pending_toggle = true;
    }

    // Headless event loop: the widget drains the same channel from its UI thread
    loop {
        let event = match session.events().recv() {
            Ok(event) => event,
            Err(_) => {
                tracing::warn!("Bootstrap worker stopped unexpectedly");
                break;
            }
        };

        match event {
            BootstrapEvent::StateChanged(state) => {
                tracing::debug!("Bootstrap state: {}", state);
            }
            BootstrapEvent::Finished(report) => {
                if let Err(e) = session.apply_outcome(&report) {
                    tracing::warn!("Failed to save autostart preference: {}", e);
                }
                if let Some(target) = &report.handoff_to {
                    tracing::info!("Handed off to {}, exiting", target.display());
                    break;
                }
                if flags.bootstrap_only && !pending_toggle {
                    break;
                }
            }
            BootstrapEvent::AutostartChanged { enabled, result } => {
                match result {
                    Ok(()) => tracing::info!("Start at logon is now {}", on_off(enabled)),
                    Err(reason) => tracing::warn!(
                        "Start at logon could not be turned {}: {}",
                        on_off(enabled),
                        reason
                    ),
                }
                pending_toggle = false;
                if flags.bootstrap_only {
                    break;
                }
            }
            BootstrapEvent::Notice(message) => {
                tracing::warn!("{}", message);
            }
        }
    }

    session.shutdown().context("Failed to save settings")?;
    Ok(ExitCode::SUCCESS)
}

/// Handoff replacements wait for the parent to let go of the lock
fn acquire_lock(config: &AppConfig, origin: &LaunchOrigin) -> Result<InstanceLock, LockError> {
    if origin.is_handoff() {
        InstanceLock::acquire_with_wait(config, config.handoff_timeout * 2)
    } else {
        InstanceLock::acquire(config)
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Parse command line arguments for startup flags
fn parse_args(args: &[String]) -> StartupFlags {
    let mut flags = StartupFlags::default();

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--verbose" | "-v" => flags.verbose = true,
            "--bootstrap-only" => flags.bootstrap_only = true,
            "--enable-autostart" => flags.set_autostart = Some(true),
            "--disable-autostart" => flags.set_autostart = Some(false),
            _ => {}
        }
    }

    flags
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}
