//! Application session
//!
//! Wires the pieces a UI needs at startup: the loaded (and repaired)
//! settings, the serialized settings writer, and the bootstrap worker whose
//! events the UI thread drains from its own loop.

use crate::bootstrap::{BootstrapReport, Capabilities, Orchestrator};
use crate::config::AppConfig;
use crate::error::{FailureReason, SettingsError, SettingsIssue};
use crate::geometry::{validate_geometry, Rect};
use crate::handoff::LaunchOrigin;
use crate::settings::{PersistedSettings, SettingsStore};
use crate::settings_writer::SettingsWriter;
use crate::worker::{BootstrapEvent, BootstrapHandle, BootstrapWorker, WorkerError};
use crossbeam_channel::Receiver;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start settings writer: {0}")]
    Writer(#[source] io::Error),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

pub struct Session {
    settings: PersistedSettings,
    load_issues: Vec<SettingsIssue>,
    unreadable: bool,
    writer: SettingsWriter,
    worker: BootstrapWorker,
}

impl Session {
    /// Load settings, fix up the window position for `displays`, and start
    /// the writer and the bootstrap worker.
    pub fn start(
        config: AppConfig,
        caps: Capabilities,
        origin: LaunchOrigin,
        current_exe: PathBuf,
        displays: &[Rect],
    ) -> Result<Self, SessionError> {
        let store = SettingsStore::for_config(&config);
        let report = store.load();
        let mut settings = report.settings;
        // A file we could not read is left alone until the user changes something
        let unreadable = report
            .issues
            .iter()
            .any(|issue| matches!(issue, SettingsIssue::Unreadable(_)));
        let mut dirty = report.from_disk && !report.issues.is_empty();

        let geometry = validate_geometry(settings.geometry(), displays);
        if geometry != settings.geometry() {
            settings.set_geometry(geometry);
            dirty = true;
        }
        if !settings.first_run_completed() {
            info!("first run for this profile");
        }

        let writer = SettingsWriter::spawn(store).map_err(SessionError::Writer)?;
        if dirty && unreadable {
            warn!("settings file could not be read, not writing repairs back");
        } else if dirty {
            writer.queue(settings.clone())?;
        }

        let autostart_enabled = settings.autostart_enabled();
        let orchestrator = Orchestrator::new(config, caps, origin, current_exe);
        let worker = BootstrapWorker::spawn(orchestrator, autostart_enabled)?;

        Ok(Session {
            settings,
            load_issues: report.issues,
            unreadable,
            writer,
            worker,
        })
    }

    /// Stored settings as persisted
    pub fn settings(&self) -> &PersistedSettings {
        &self.settings
    }

    /// What the widget should show right after startup
    pub fn startup_view(&self) -> PersistedSettings {
        self.settings.startup_view()
    }

    pub fn load_issues(&self) -> &[SettingsIssue] {
        &self.load_issues
    }

    /// The welcome notice has not been shown for this profile yet
    pub fn is_first_run(&self) -> bool {
        !self.settings.first_run_completed()
    }

    /// Call once the UI has shown its welcome notice
    pub fn complete_first_run(&mut self) -> Result<(), SettingsError> {
        if self.settings.first_run_completed() {
            return Ok(());
        }
        if self.unreadable {
            self.settings.mark_first_run_completed();
            return Ok(());
        }
        self.update(|s| s.mark_first_run_completed())
    }

    /// Apply a change and queue it for saving
    pub fn update<F>(&mut self, change: F) -> Result<(), SettingsError>
    where
        F: FnOnce(&mut PersistedSettings),
    {
        change(&mut self.settings);
        self.writer.queue(self.settings.clone())
    }

    /// Persist the new intent, then let the worker act on it
    pub fn set_autostart(&mut self, enabled: bool) -> Result<(), SessionError> {
        self.update(|s| s.set_autostart_enabled(enabled))?;
        self.writer.flush()?;
        self.worker.handle().set_autostart(enabled)?;
        Ok(())
    }

    pub fn events(&self) -> &Receiver<BootstrapEvent> {
        self.worker.events()
    }

    pub fn handle(&self) -> BootstrapHandle {
        self.worker.handle()
    }

    /// Fold a finished bootstrap back into settings. Returns whether
    /// anything changed.
    pub fn apply_outcome(&mut self, report: &BootstrapReport) -> Result<bool, SettingsError> {
        match report.failure() {
            Some(FailureReason::ElevationDeclined) if self.settings.autostart_enabled() => {
                info!("elevation declined, turning start at logon off");
                self.update(|s| s.set_autostart_enabled(false))?;
                Ok(true)
            }
            Some(reason) => {
                warn!("keeping autostart preference despite failure: {}", reason);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub fn flush(&self) -> Result<(), SettingsError> {
        self.writer.flush()
    }

    /// Stop the worker and make sure the last settings hit the disk
    pub fn shutdown(self) -> Result<(), SettingsError> {
        let Session { writer, worker, .. } = self;
        worker.shutdown();
        writer.flush()
    }
}
