//! Application-wide configuration for the bootstrap core.
//!
//! App name, install location, task name and timeouts live on [`AppConfig`]
//! and are handed to each component explicitly. Tests point the installer at
//! a scratch directory and the registrar at a throwaway task name.
//!
//! # Example
//!
//! ```rust,no_run
//! use rapl_monitor_core::config::AppConfig;
//!
//! let config = AppConfig::for_current_user().expect("config directory");
//! println!("settings live in {}", config.settings_path().display());
//! println!("installed copy goes to {}", config.installed_path().display());
//! ```

use crate::error::StartupError;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Display name, also used for the install directory on Windows
pub const APP_NAME: &str = "RAPL Monitor";
/// Stable, versionless scheduled-task name
pub const TASK_NAME: &str = "RAPL_Monitor_Startup";
/// Settings file inside the per-user config directory
pub const SETTINGS_FILE_NAME: &str = "settings.json";
/// Name of the single-instance lock
pub const LOCK_NAME: &str = "RaplMonitor.Instance";

const PROJECT_NAME: &str = "RaplMonitor";
#[cfg(windows)]
const DEFAULT_EXECUTABLE_NAME: &str = "RaplMonitor.exe";
#[cfg(not(windows))]
const DEFAULT_EXECUTABLE_NAME: &str = "RaplMonitor";

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            initial_delay: Duration::from_millis(200),
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Retry `attempts` times without sleeping
    pub fn immediate(attempts: u32) -> Self {
        RetryPolicy {
            attempts,
            initial_delay: Duration::ZERO,
            backoff_factor: 1,
        }
    }

    /// Delays to sleep between consecutive attempts (`attempts - 1` items)
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut next = self.initial_delay;
        (1..self.attempts.max(1)).map(move |_| {
            let current = next;
            next = next.saturating_mul(self.backoff_factor.max(1));
            current
        })
    }
}

/// Explicit configuration passed into every component
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub app_version: String,
    pub task_name: String,
    /// Fixed, version-independent install directory (needs elevation)
    pub install_dir: PathBuf,
    /// File name of the executable inside `install_dir`
    pub executable_name: String,
    /// Extra files living next to the executable that travel with it
    pub side_resources: Vec<String>,
    /// Per-user configuration directory
    pub config_dir: PathBuf,
    pub settings_file_name: String,
    pub lock_name: String,
    /// How long a relaunch waits for the replacement's liveness marker
    pub handoff_timeout: Duration,
    pub handoff_poll_interval: Duration,
    /// Policy for a destination binary that is still locked
    pub copy_retry: RetryPolicy,
}

impl AppConfig {
    /// Platform defaults for the current user. Creates the config directory.
    pub fn for_current_user() -> Result<Self, StartupError> {
        let config_dir = get_config_directory()?;
        let executable_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| DEFAULT_EXECUTABLE_NAME.to_string());

        Ok(AppConfig {
            executable_name,
            ..AppConfig::with_dirs(default_install_dir(), config_dir)
        })
    }

    /// Defaults rooted at explicit directories. Creates nothing.
    pub fn with_dirs(install_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        AppConfig {
            app_name: APP_NAME.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            task_name: TASK_NAME.to_string(),
            install_dir: install_dir.into(),
            executable_name: DEFAULT_EXECUTABLE_NAME.to_string(),
            side_resources: vec!["favicon.ico".to_string()],
            config_dir: config_dir.into(),
            settings_file_name: SETTINGS_FILE_NAME.to_string(),
            lock_name: LOCK_NAME.to_string(),
            handoff_timeout: Duration::from_secs(5),
            handoff_poll_interval: Duration::from_millis(50),
            copy_retry: RetryPolicy::default(),
        }
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = dir.into();
        self
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = name.into();
        self
    }

    pub fn with_executable_name(mut self, name: impl Into<String>) -> Self {
        self.executable_name = name.into();
        self
    }

    pub fn with_copy_retry(mut self, policy: RetryPolicy) -> Self {
        self.copy_retry = policy;
        self
    }

    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    /// Where the relocated executable lives
    pub fn installed_path(&self) -> PathBuf {
        self.install_dir.join(&self.executable_name)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(&self.settings_file_name)
    }

    /// Lock file used where no named kernel objects exist
    pub fn lock_file_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.lock", self.lock_name))
    }
}

/// Get the application's per-user config directory
/// Returns %APPDATA%/RaplMonitor/config on Windows
/// Creates directory if it doesn't exist
pub fn get_config_directory() -> Result<PathBuf, StartupError> {
    let project_dirs =
        ProjectDirs::from("", "", PROJECT_NAME).ok_or(StartupError::NoConfigDir)?;
    let config_dir = project_dirs.config_dir();

    ensure_directory(config_dir)?;
    Ok(config_dir.to_path_buf())
}

fn ensure_directory(dir: &Path) -> Result<(), StartupError> {
    fs::create_dir_all(dir).map_err(|source| StartupError::ConfigDir {
        path: dir.to_path_buf(),
        source,
    })
}

#[cfg(windows)]
fn default_install_dir() -> PathBuf {
    let program_files = std::env::var_os("ProgramFiles")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
    program_files.join(APP_NAME)
}

#[cfg(not(windows))]
fn default_install_dir() -> PathBuf {
    PathBuf::from("/opt/rapl-monitor")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy_backs_off() {
        let delays: Vec<_> = RetryPolicy::default().delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
            ]
        );
    }

    #[test]
    fn test_immediate_policy_never_sleeps() {
        let delays: Vec<_> = RetryPolicy::immediate(3).delays().collect();
        assert_eq!(delays, vec![Duration::ZERO, Duration::ZERO]);
        assert_eq!(RetryPolicy::immediate(0).delays().count(), 0);
    }

    #[test]
    fn test_paths_derive_from_dirs() {
        let config = AppConfig::with_dirs("/tmp/install", "/tmp/config")
            .with_executable_name("monitor.bin")
            .with_task_name("Test_Task");
        assert_eq!(config.installed_path(), PathBuf::from("/tmp/install/monitor.bin"));
        assert_eq!(config.settings_path(), PathBuf::from("/tmp/config/settings.json"));
        assert_eq!(config.task_name, "Test_Task");
    }

    #[test]
    fn test_get_config_directory() {
        let result = get_config_directory();
        if let Ok(path) = result {
            assert!(path.to_string_lossy().contains("RaplMonitor"));
        }
    }
}
