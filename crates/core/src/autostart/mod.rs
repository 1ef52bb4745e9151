//! Autostart Registrar
//!
//! One OS autostart entry per user, keyed by a stable task name, pointing at
//! the installed executable and run at logon with the highest available
//! privilege. Registration is an upsert; removal of a missing entry is fine.

mod task_scheduler;
mod xdg;

pub use task_scheduler::TaskSchedulerBackend;
pub use xdg::XdgAutostartBackend;

use crate::config::AppConfig;
use crate::error::FailureReason;
use crate::installer::same_path;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    #[default]
    Logon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutostartRegistration {
    pub task_name: String,
    pub target_path: PathBuf,
    pub run_as_highest_privilege: bool,
    pub trigger: Trigger,
}

impl AutostartRegistration {
    /// The entry that launches the installed copy at logon
    pub fn for_installed(config: &AppConfig) -> Self {
        AutostartRegistration {
            task_name: config.task_name.clone(),
            target_path: config.installed_path(),
            run_as_highest_privilege: true,
            trigger: Trigger::Logon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStatus {
    Registered,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterStatus {
    Removed,
    NotFound,
}

/// OS mechanism that stores autostart entries
pub trait AutostartBackend: Send + Sync {
    fn query(&self, task_name: &str) -> Result<Option<AutostartRegistration>, FailureReason>;

    /// Create the entry or replace it in place
    fn register(&self, registration: &AutostartRegistration) -> Result<(), FailureReason>;

    fn unregister(&self, task_name: &str) -> Result<UnregisterStatus, FailureReason>;
}

/// Scheduler on Windows, XDG autostart directory elsewhere
pub fn system_backend(config: &AppConfig) -> Arc<dyn AutostartBackend> {
    if cfg!(windows) {
        Arc::new(TaskSchedulerBackend::new())
    } else {
        Arc::new(XdgAutostartBackend::for_current_user(config))
    }
}

#[derive(Clone)]
pub struct AutostartRegistrar {
    backend: Arc<dyn AutostartBackend>,
}

impl AutostartRegistrar {
    pub fn new(backend: Arc<dyn AutostartBackend>) -> Self {
        AutostartRegistrar { backend }
    }

    pub fn register_autostart(
        &self,
        registration: &AutostartRegistration,
    ) -> Result<RegisterStatus, FailureReason> {
        let existing = self.backend.query(&registration.task_name)?;
        self.backend.register(registration)?;

        let status = if existing.is_some() {
            RegisterStatus::Updated
        } else {
            RegisterStatus::Registered
        };
        info!(
            "autostart entry '{}' {:?} -> {}",
            registration.task_name,
            status,
            registration.target_path.display()
        );
        Ok(status)
    }

    pub fn unregister_autostart(&self, task_name: &str) -> Result<UnregisterStatus, FailureReason> {
        let status = self.backend.unregister(task_name)?;
        info!("autostart entry '{}' {:?}", task_name, status);
        Ok(status)
    }

    /// An entry exists for `task_name` that already launches `target` elevated
    pub fn is_registered_for(&self, task_name: &str, target: &Path) -> bool {
        match self.backend.query(task_name) {
            Ok(Some(existing)) => {
                let matches = same_path(&existing.target_path, target)
                    && existing.run_as_highest_privilege
                    && existing.trigger == Trigger::Logon;
                debug!("existing autostart entry matches: {}", matches);
                matches
            }
            Ok(None) => false,
            Err(reason) => {
                warn!("could not query autostart entry '{}': {}", task_name, reason);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryBackend {
        entries: Mutex<HashMap<String, AutostartRegistration>>,
        unavailable: bool,
    }

    impl AutostartBackend for MemoryBackend {
        fn query(&self, task_name: &str) -> Result<Option<AutostartRegistration>, FailureReason> {
            if self.unavailable {
                return Err(FailureReason::ServiceUnavailable);
            }
            Ok(self.entries.lock().get(task_name).cloned())
        }

        fn register(&self, registration: &AutostartRegistration) -> Result<(), FailureReason> {
            self.entries
                .lock()
                .insert(registration.task_name.clone(), registration.clone());
            Ok(())
        }

        fn unregister(&self, task_name: &str) -> Result<UnregisterStatus, FailureReason> {
            Ok(match self.entries.lock().remove(task_name) {
                Some(_) => UnregisterStatus::Removed,
                None => UnregisterStatus::NotFound,
            })
        }
    }

    fn registration(target: &str) -> AutostartRegistration {
        AutostartRegistration {
            task_name: "RAPL_Monitor_Test".to_string(),
            target_path: PathBuf::from(target),
            run_as_highest_privilege: true,
            trigger: Trigger::Logon,
        }
    }

    #[test]
    fn test_register_then_update() {
        let registrar = AutostartRegistrar::new(Arc::new(MemoryBackend::default()));
        assert_eq!(
            registrar.register_autostart(&registration("/opt/a/RaplMonitor")),
            Ok(RegisterStatus::Registered)
        );
        assert_eq!(
            registrar.register_autostart(&registration("/opt/b/RaplMonitor")),
            Ok(RegisterStatus::Updated)
        );
        assert!(registrar.is_registered_for("RAPL_Monitor_Test", Path::new("/opt/b/RaplMonitor")));
        assert!(!registrar.is_registered_for("RAPL_Monitor_Test", Path::new("/opt/a/RaplMonitor")));
    }

    #[test]
    fn test_unregister_twice_is_noop() {
        let registrar = AutostartRegistrar::new(Arc::new(MemoryBackend::default()));
        registrar.register_autostart(&registration("/opt/a/RaplMonitor")).unwrap();
        assert_eq!(
            registrar.unregister_autostart("RAPL_Monitor_Test"),
            Ok(UnregisterStatus::Removed)
        );
        assert_eq!(
            registrar.unregister_autostart("RAPL_Monitor_Test"),
            Ok(UnregisterStatus::NotFound)
        );
    }

    #[test]
    fn test_service_unavailable_surfaces() {
        let registrar = AutostartRegistrar::new(Arc::new(MemoryBackend {
            unavailable: true,
            ..Default::default()
        }));
        assert_eq!(
            registrar.register_autostart(&registration("/opt/a/RaplMonitor")),
            Err(FailureReason::ServiceUnavailable)
        );
        assert!(!registrar.is_registered_for("RAPL_Monitor_Test", Path::new("/opt/a/RaplMonitor")));
    }

    #[test]
    fn test_for_installed_targets_install_dir() {
        let config = AppConfig::with_dirs("/opt/rapl-monitor", "/tmp/cfg");
        let reg = AutostartRegistration::for_installed(&config);
        assert_eq!(reg.target_path, config.installed_path());
        assert!(reg.run_as_highest_privilege);
        assert_eq!(reg.task_name, config.task_name);
    }
}
