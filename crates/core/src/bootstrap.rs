//! Bootstrap Orchestrator
//!
//! Explicit state machine for "install myself, register for logon, continue
//! as the installed copy". Every step is a separate transition so a failure
//! lands in `Failed(reason)` instead of being skipped over. `Failed` only
//! gates autostart; the monitor keeps running regardless.
//!
//! ```text
//! Initial -> CheckingElevation -> { NeedsElevation | Installing }
//!         -> RegisteringTask -> Relaunching -> Running
//! ```

use crate::autostart::{self, AutostartBackend, AutostartRegistrar, AutostartRegistration};
use crate::config::AppConfig;
use crate::elevation::{Elevation, SystemElevation};
use crate::error::FailureReason;
use crate::handoff::{LaunchOrigin, Launcher, RelaunchHandoff, Relauncher, SystemLauncher};
use crate::installer::{same_path, InstallationState, Installer};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    Initial,
    CheckingElevation,
    NeedsElevation,
    Installing,
    RegisteringTask,
    Relaunching,
    Running,
    Failed(FailureReason),
}

impl BootstrapState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BootstrapState::Running | BootstrapState::Failed(_))
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapState::Initial => write!(f, "initial"),
            BootstrapState::CheckingElevation => write!(f, "checking elevation"),
            BootstrapState::NeedsElevation => write!(f, "needs elevation"),
            BootstrapState::Installing => write!(f, "installing"),
            BootstrapState::RegisteringTask => write!(f, "registering task"),
            BootstrapState::Relaunching => write!(f, "relaunching"),
            BootstrapState::Running => write!(f, "running"),
            BootstrapState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub final_state: BootstrapState,
    /// A replacement process confirmed it is alive; the caller should exit 0
    pub handoff_to: Option<PathBuf>,
    /// Every state entered, starting with `Initial`
    pub history: Vec<BootstrapState>,
}

impl BootstrapReport {
    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.final_state {
            BootstrapState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn visited(&self, state: &BootstrapState) -> bool {
        self.history.contains(state)
    }
}

/// Platform seams the orchestrator talks through
#[derive(Clone)]
pub struct Capabilities {
    pub elevation: Arc<dyn Elevation>,
    pub launcher: Arc<dyn Launcher>,
    pub autostart: Arc<dyn AutostartBackend>,
}

impl Capabilities {
    pub fn system(config: &AppConfig) -> Self {
        let elevation: Arc<dyn Elevation> = Arc::new(SystemElevation);
        Capabilities {
            launcher: Arc::new(SystemLauncher::new(Arc::clone(&elevation))),
            autostart: autostart::system_backend(config),
            elevation,
        }
    }
}

type TransitionObserver = Box<dyn FnMut(&BootstrapState) + Send>;

pub struct Orchestrator {
    config: AppConfig,
    elevation: Arc<dyn Elevation>,
    installer: Installer,
    registrar: AutostartRegistrar,
    relauncher: Relauncher,
    origin: LaunchOrigin,
    current_exe: PathBuf,
    state: BootstrapState,
    install_state: Option<InstallationState>,
    handoff_to: Option<PathBuf>,
    history: Vec<BootstrapState>,
    observer: Option<TransitionObserver>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        caps: Capabilities,
        origin: LaunchOrigin,
        current_exe: impl Into<PathBuf>,
    ) -> Self {
        Orchestrator {
            installer: Installer::new(&config),
            registrar: AutostartRegistrar::new(caps.autostart),
            relauncher: Relauncher::new(&config, caps.launcher),
            elevation: caps.elevation,
            config,
            origin,
            current_exe: current_exe.into(),
            state: BootstrapState::Initial,
            install_state: None,
            handoff_to: None,
            history: vec![BootstrapState::Initial],
            observer: None,
        }
    }

    /// Called with each state as it is entered
    pub fn on_transition<F>(&mut self, observer: F)
    where
        F: FnMut(&BootstrapState) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn registrar(&self) -> &AutostartRegistrar {
        &self.registrar
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Drive the machine from `Initial` to a terminal state
    pub fn run(&mut self, autostart_enabled: bool) -> BootstrapReport {
        self.reset();
        while !self.state.is_terminal() {
            self.step(autostart_enabled);
        }

        match &self.state {
            BootstrapState::Failed(reason) => {
                warn!("autostart setup stopped: {}", reason)
            }
            _ => info!("bootstrap finished"),
        }
        BootstrapReport {
            final_state: self.state.clone(),
            handoff_to: self.handoff_to.clone(),
            history: self.history.clone(),
        }
    }

    /// Perform exactly one transition. Terminal states stay put.
    pub fn step(&mut self, autostart_enabled: bool) -> &BootstrapState {
        let next = match &self.state {
            BootstrapState::Initial => BootstrapState::CheckingElevation,
            BootstrapState::CheckingElevation => self.check(autostart_enabled),
            BootstrapState::NeedsElevation => self.relaunch_elevated(),
            BootstrapState::Installing => self.install(),
            BootstrapState::RegisteringTask => self.register(),
            BootstrapState::Relaunching => self.relaunch_installed(),
            BootstrapState::Running | BootstrapState::Failed(_) => return &self.state,
        };
        self.enter(next);
        &self.state
    }

    fn reset(&mut self) {
        self.state = BootstrapState::Initial;
        self.install_state = None;
        self.handoff_to = None;
        self.history = vec![BootstrapState::Initial];
    }

    fn enter(&mut self, next: BootstrapState) {
        info!("bootstrap: {} -> {}", self.state, next);
        self.state = next;
        self.history.push(self.state.clone());
        if let Some(observer) = self.observer.as_mut() {
            observer(&self.state);
        }
    }

    fn check(&mut self, autostart_enabled: bool) -> BootstrapState {
        if !autostart_enabled {
            debug!("autostart disabled, nothing to set up");
            return BootstrapState::Running;
        }

        let state = self
            .installer
            .inspect(&self.current_exe, self.elevation.as_ref());
        let registered = state.is_installed
            && self
                .registrar
                .is_registered_for(&self.config.task_name, &state.installed_path);
        debug!(
            "installed: {}, registered: {}, elevated: {}",
            state.is_installed, registered, state.is_elevated
        );

        let next = match (state.is_installed, registered, state.is_elevated) {
            (true, true, _) => BootstrapState::Running,
            (true, false, true) => BootstrapState::RegisteringTask,
            (false, _, true) => BootstrapState::Installing,
            (_, _, false) => BootstrapState::NeedsElevation,
        };
        self.install_state = Some(state);
        next
    }

    fn relaunch_elevated(&mut self) -> BootstrapState {
        let handoff = RelaunchHandoff {
            target_path: self.current_exe.clone(),
            request_elevation: true,
        };
        self.hand_off(&handoff)
    }

    fn install(&mut self) -> BootstrapState {
        let state = match self.install_state.take() {
            Some(state) => state,
            None => self
                .installer
                .inspect(&self.current_exe, self.elevation.as_ref()),
        };

        let result = self.installer.ensure_installed(&state);
        self.install_state = Some(state);
        match result {
            Ok(status) => {
                debug!("install step: {:?}", status);
                BootstrapState::RegisteringTask
            }
            Err(reason) => BootstrapState::Failed(reason),
        }
    }

    fn register(&mut self) -> BootstrapState {
        let registration = AutostartRegistration::for_installed(&self.config);
        if let Err(reason) = self.registrar.register_autostart(&registration) {
            return BootstrapState::Failed(reason);
        }

        if self.running_installed_copy() {
            debug!("already running the installed copy, no relaunch needed");
            BootstrapState::Running
        } else {
            BootstrapState::Relaunching
        }
    }

    fn relaunch_installed(&mut self) -> BootstrapState {
        let handoff = RelaunchHandoff {
            target_path: self.installer.installed_path().to_path_buf(),
            // elevation is inherited from this process
            request_elevation: false,
        };
        self.hand_off(&handoff)
    }

    fn hand_off(&mut self, handoff: &RelaunchHandoff) -> BootstrapState {
        match self.relauncher.relaunch(handoff, &self.origin) {
            Ok(spawned) => {
                self.handoff_to = Some(spawned.target);
                BootstrapState::Running
            }
            Err(reason) => BootstrapState::Failed(reason),
        }
    }

    fn running_installed_copy(&self) -> bool {
        same_path(&self.current_exe, self.installer.installed_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autostart::UnregisterStatus;
    use crate::config::RetryPolicy;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    struct FixedElevation(bool);

    impl Elevation for FixedElevation {
        fn is_elevated(&self) -> bool {
            self.0
        }

        fn request_elevated_relaunch(&self, _: &Path, _: &[String]) -> Result<(), FailureReason> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        launches: Mutex<Vec<PathBuf>>,
        confirm: bool,
        decline: bool,
    }

    impl Launcher for Recorder {
        fn launch(&self, target: &Path, args: &[String], _elevated: bool) -> Result<(), FailureReason> {
            self.launches.lock().push(target.to_path_buf());
            if self.decline {
                return Err(FailureReason::ElevationDeclined);
            }
            if self.confirm {
                LaunchOrigin::from_args(args).signal_alive().unwrap();
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Entries(Mutex<HashMap<String, AutostartRegistration>>);

    impl AutostartBackend for Entries {
        fn query(&self, name: &str) -> Result<Option<AutostartRegistration>, FailureReason> {
            Ok(self.0.lock().get(name).cloned())
        }

        fn register(&self, reg: &AutostartRegistration) -> Result<(), FailureReason> {
            self.0.lock().insert(reg.task_name.clone(), reg.clone());
            Ok(())
        }

        fn unregister(&self, name: &str) -> Result<UnregisterStatus, FailureReason> {
            Ok(match self.0.lock().remove(name) {
                Some(_) => UnregisterStatus::Removed,
                None => UnregisterStatus::NotFound,
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: AppConfig,
        exe: PathBuf,
        launcher: Arc<Recorder>,
        entries: Arc<Entries>,
    }

    fn fixture(launcher: Recorder) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("downloads").join("RaplMonitor");
        fs::create_dir_all(exe.parent().unwrap()).unwrap();
        fs::write(&exe, b"monitor").unwrap();

        let mut config = AppConfig::with_dirs(dir.path().join("install"), dir.path().join("config"))
            .with_executable_name("RaplMonitor")
            .with_copy_retry(RetryPolicy::immediate(1))
            .with_handoff_timeout(Duration::from_millis(200));
        config.handoff_poll_interval = Duration::from_millis(5);

        Fixture {
            _dir: dir,
            config,
            exe,
            launcher: Arc::new(launcher),
            entries: Arc::new(Entries::default()),
        }
    }

    fn orchestrator(fx: &Fixture, elevated: bool, origin: LaunchOrigin, exe: &Path) -> Orchestrator {
        let caps = Capabilities {
            elevation: Arc::new(FixedElevation(elevated)),
            launcher: fx.launcher.clone(),
            autostart: fx.entries.clone(),
        };
        Orchestrator::new(fx.config.clone(), caps, origin, exe)
    }

    #[test]
    fn test_step_is_one_transition() {
        let fx = fixture(Recorder::default());
        let mut orch = orchestrator(&fx, false, LaunchOrigin::fresh(), &fx.exe);
        assert_eq!(orch.step(true), &BootstrapState::CheckingElevation);
        assert_eq!(orch.step(true), &BootstrapState::NeedsElevation);
    }

    #[test]
    fn test_elevated_first_run_installs_and_hands_off() {
        let fx = fixture(Recorder {
            confirm: true,
            ..Default::default()
        });
        let mut orch = orchestrator(&fx, true, LaunchOrigin::fresh(), &fx.exe);
        let report = orch.run(true);

        assert_eq!(report.final_state, BootstrapState::Running);
        assert_eq!(report.handoff_to, Some(fx.config.installed_path()));
        assert!(report.visited(&BootstrapState::Installing));
        assert!(report.visited(&BootstrapState::Relaunching));
        assert_eq!(orch.installer().copies_performed(), 1);
    }

    #[test]
    fn test_installed_copy_skips_relaunch() {
        let fx = fixture(Recorder::default());
        fs::create_dir_all(&fx.config.install_dir).unwrap();
        fs::copy(&fx.exe, fx.config.installed_path()).unwrap();

        let installed = fx.config.installed_path();
        let mut orch = orchestrator(&fx, true, LaunchOrigin::fresh(), &installed);
        let report = orch.run(true);

        assert_eq!(report.final_state, BootstrapState::Running);
        assert!(report.visited(&BootstrapState::RegisteringTask));
        assert!(!report.visited(&BootstrapState::Installing));
        assert!(report.handoff_to.is_none());
        assert!(fx.launcher.launches.lock().is_empty());

        // second boot: fast path without touching anything
        let report = orch.run(true);
        assert_eq!(
            report.history,
            vec![
                BootstrapState::Initial,
                BootstrapState::CheckingElevation,
                BootstrapState::Running
            ]
        );
    }

    #[test]
    fn test_declined_prompt_fails_softly() {
        let fx = fixture(Recorder {
            decline: true,
            ..Default::default()
        });
        let mut orch = orchestrator(&fx, false, LaunchOrigin::fresh(), &fx.exe);
        let report = orch.run(true);
        assert_eq!(report.failure(), Some(&FailureReason::ElevationDeclined));
        assert!(!fx.config.installed_path().exists());
    }

    #[test]
    fn test_unconfirmed_relaunch_times_out() {
        let fx = fixture(Recorder::default());
        let mut orch = orchestrator(&fx, true, LaunchOrigin::fresh(), &fx.exe);
        let report = orch.run(true);
        assert_eq!(report.failure(), Some(&FailureReason::SpawnTimeout));
        assert!(report.handoff_to.is_none());
    }

    #[test]
    fn test_observer_sees_each_state() {
        let fx = fixture(Recorder::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut orch = orchestrator(&fx, false, LaunchOrigin::fresh(), &fx.exe);
        orch.on_transition(move |state| sink.lock().push(state.clone()));
        orch.run(false);
        assert_eq!(
            *seen.lock(),
            vec![BootstrapState::CheckingElevation, BootstrapState::Running]
        );
    }

    #[test]
    fn test_display_names() {
        assert_eq!(BootstrapState::RegisteringTask.to_string(), "registering task");
        assert_eq!(
            BootstrapState::Failed(FailureReason::FileInUse).to_string(),
            "failed (file is in use by another process)"
        );
    }
}
