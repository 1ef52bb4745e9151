//! Bootstrap Worker
//!
//! Runs the orchestrator on one dedicated thread so the UI thread never
//! blocks on copies, scheduler calls or process spawns. Results come back as
//! `BootstrapEvent`s over a channel. Only one worker may exist per process.

use crate::autostart::UnregisterStatus;
use crate::bootstrap::{BootstrapReport, BootstrapState, Orchestrator};
use crate::error::FailureReason;
use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::io;
use std::thread::{self, JoinHandle, ThreadId};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Thread id of the live worker, if any
static ACTIVE_WORKER: Lazy<Mutex<Option<ThreadId>>> = Lazy::new(|| Mutex::new(None));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapEvent {
    StateChanged(BootstrapState),
    Finished(BootstrapReport),
    AutostartChanged {
        enabled: bool,
        result: Result<(), FailureReason>,
    },
    /// Non-blocking message for the user
    Notice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapCommand {
    SetAutostart(bool),
    Shutdown,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("a bootstrap worker is already running in this process")]
    AlreadyRunning,
    #[error("failed to spawn bootstrap worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("bootstrap worker has stopped")]
    Disconnected,
}

/// Cloneable command side of the worker
#[derive(Debug, Clone)]
pub struct BootstrapHandle {
    tx: Sender<BootstrapCommand>,
}

impl BootstrapHandle {
    pub fn set_autostart(&self, enabled: bool) -> Result<(), WorkerError> {
        self.send(BootstrapCommand::SetAutostart(enabled))
    }

    pub fn shutdown(&self) -> Result<(), WorkerError> {
        self.send(BootstrapCommand::Shutdown)
    }

    fn send(&self, command: BootstrapCommand) -> Result<(), WorkerError> {
        self.tx.send(command).map_err(|_| WorkerError::Disconnected)
    }
}

pub struct BootstrapWorker {
    handle: BootstrapHandle,
    events: Receiver<BootstrapEvent>,
    thread: Option<JoinHandle<()>>,
}

impl BootstrapWorker {
    /// Start the worker and immediately run the bootstrap once
    pub fn spawn(mut orchestrator: Orchestrator, autostart_enabled: bool) -> Result<Self, WorkerError> {
        let mut active = ACTIVE_WORKER.lock();
        if active.is_some() {
            return Err(WorkerError::AlreadyRunning);
        }

        let (event_tx, event_rx) = unbounded::<BootstrapEvent>();
        let (command_tx, command_rx) = unbounded::<BootstrapCommand>();

        let state_tx = event_tx.clone();
        orchestrator.on_transition(move |state| {
            let _ = state_tx.send(BootstrapEvent::StateChanged(state.clone()));
        });

        let thread = thread::Builder::new()
            .name("bootstrap-worker".to_string())
            .spawn(move || {
                let _release = ActiveGuard;
                run_worker(orchestrator, autostart_enabled, event_tx, command_rx);
            })?;

        // The guard in the thread waits on this lock, so it cannot clear first
        *active = Some(thread.thread().id());
        debug!("bootstrap worker started");

        Ok(BootstrapWorker {
            handle: BootstrapHandle { tx: command_tx },
            events: event_rx,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> BootstrapHandle {
        self.handle.clone()
    }

    pub fn events(&self) -> &Receiver<BootstrapEvent> {
        &self.events
    }

    /// Stop the worker and wait for it. Work in progress finishes first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("bootstrap worker panicked");
            }
        }
    }
}

impl Drop for BootstrapWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Clears the per-process slot when the worker thread exits, even on panic
struct ActiveGuard;

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = ACTIVE_WORKER.lock();
        if *active == Some(thread::current().id()) {
            *active = None;
        }
    }
}

fn run_worker(
    mut orchestrator: Orchestrator,
    autostart_enabled: bool,
    events: Sender<BootstrapEvent>,
    commands: Receiver<BootstrapCommand>,
) {
    run_bootstrap(&mut orchestrator, autostart_enabled, &events);

    for command in commands.iter() {
        match command {
            BootstrapCommand::SetAutostart(true) => {
                info!("autostart enabled by user");
                let report = run_bootstrap(&mut orchestrator, true, &events);
                let result = match report.failure() {
                    Some(reason) => Err(reason.clone()),
                    None => Ok(()),
                };
                let _ = events.send(BootstrapEvent::AutostartChanged {
                    enabled: true,
                    result,
                });
            }
            BootstrapCommand::SetAutostart(false) => {
                info!("autostart disabled by user");
                let task_name = orchestrator.config().task_name.clone();
                let result = match orchestrator.registrar().unregister_autostart(&task_name) {
                    Ok(UnregisterStatus::Removed) | Ok(UnregisterStatus::NotFound) => Ok(()),
                    Err(reason) => {
                        warn!("could not remove autostart entry: {}", reason);
                        let _ = events.send(BootstrapEvent::Notice(format!(
                            "Could not turn off start at logon: {}",
                            reason
                        )));
                        Err(reason)
                    }
                };
                let _ = events.send(BootstrapEvent::AutostartChanged {
                    enabled: false,
                    result,
                });
            }
            BootstrapCommand::Shutdown => break,
        }
    }
    debug!("bootstrap worker exiting");
}

fn run_bootstrap(
    orchestrator: &mut Orchestrator,
    autostart_enabled: bool,
    events: &Sender<BootstrapEvent>,
) -> BootstrapReport {
    let report = orchestrator.run(autostart_enabled);
    if let Some(reason) = report.failure() {
        // Declining the prompt is a choice, not something to report back
        if *reason != FailureReason::ElevationDeclined {
            let _ = events.send(BootstrapEvent::Notice(format!(
                "Start at logon could not be set up: {}",
                reason
            )));
        }
    }
    let _ = events.send(BootstrapEvent::Finished(report.clone()));
    report
}
