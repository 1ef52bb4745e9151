//! Relaunch handoff
//!
//! The parent starts the installed copy with two one-shot flags: the target
//! it relaunched into and a marker path. The child creates the marker once it
//! is alive; the parent waits for that before it exits. A child that would
//! relaunch into the same target it was handed is refusing a loop.

use crate::config::AppConfig;
use crate::elevation::Elevation;
use crate::error::FailureReason;
use crate::installer::same_path;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const HANDOFF_TARGET_FLAG: &str = "--handoff-target";
pub const HANDOFF_MARKER_FLAG: &str = "--handoff-marker";

static MARKER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One-shot request to continue as another process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaunchHandoff {
    pub target_path: PathBuf,
    pub request_elevation: bool,
}

/// How this process was started
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOrigin {
    handoff_target: Option<PathBuf>,
    marker: Option<PathBuf>,
}

impl LaunchOrigin {
    /// Started by the user or by the autostart entry
    pub fn fresh() -> Self {
        LaunchOrigin::default()
    }

    pub fn from_handoff(target: impl Into<PathBuf>, marker: Option<PathBuf>) -> Self {
        LaunchOrigin {
            handoff_target: Some(target.into()),
            marker,
        }
    }

    /// Pick the handoff flags out of a command line. Other arguments are ignored.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut origin = LaunchOrigin::default();
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_ref() {
                HANDOFF_TARGET_FLAG => {
                    origin.handoff_target = iter.next().map(|v| PathBuf::from(v.as_ref()));
                }
                HANDOFF_MARKER_FLAG => {
                    origin.marker = iter.next().map(|v| PathBuf::from(v.as_ref()));
                }
                _ => {}
            }
        }
        origin
    }

    pub fn is_handoff(&self) -> bool {
        self.handoff_target.is_some()
    }

    pub fn handoff_target(&self) -> Option<&Path> {
        self.handoff_target.as_deref()
    }

    /// Relaunching into `target` would repeat the handoff that started us
    pub fn forbids(&self, target: &Path) -> bool {
        self.handoff_target
            .as_deref()
            .map_or(false, |previous| same_path(previous, target))
    }

    /// Tell the waiting parent that this process is up
    pub fn signal_alive(&self) -> io::Result<()> {
        let Some(marker) = &self.marker else {
            return Ok(());
        };
        debug!("confirming handoff via {}", marker.display());
        fs::write(marker, std::process::id().to_string())
    }
}

/// Starts a process. Narrow so tests can observe launches without spawning.
pub trait Launcher: Send + Sync {
    fn launch(&self, target: &Path, args: &[String], elevated: bool) -> Result<(), FailureReason>;
}

pub struct SystemLauncher {
    elevation: Arc<dyn Elevation>,
}

impl SystemLauncher {
    pub fn new(elevation: Arc<dyn Elevation>) -> Self {
        SystemLauncher { elevation }
    }
}

impl Launcher for SystemLauncher {
    fn launch(&self, target: &Path, args: &[String], elevated: bool) -> Result<(), FailureReason> {
        if elevated {
            return self.elevation.request_elevated_relaunch(target, args);
        }

        let child = Command::new(target)
            .args(args)
            .spawn()
            .map_err(|e| FailureReason::SpawnFailed(format!("{}: {}", target.display(), e)))?;
        debug!("spawned pid {} from {}", child.id(), target.display());
        Ok(())
    }
}

/// The replacement process confirmed it is alive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawned {
    pub target: PathBuf,
}

pub struct Relauncher {
    launcher: Arc<dyn Launcher>,
    marker_dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl Relauncher {
    pub fn new(config: &AppConfig, launcher: Arc<dyn Launcher>) -> Self {
        Relauncher {
            launcher,
            marker_dir: config.config_dir.clone(),
            timeout: config.handoff_timeout,
            poll_interval: config.handoff_poll_interval,
        }
    }

    /// Start the target and wait until it confirms or the timeout passes.
    /// The caller keeps running on error.
    pub fn relaunch(
        &self,
        handoff: &RelaunchHandoff,
        origin: &LaunchOrigin,
    ) -> Result<Spawned, FailureReason> {
        if origin.forbids(&handoff.target_path) {
            warn!(
                "already handed off to {}, not relaunching again",
                handoff.target_path.display()
            );
            return Err(FailureReason::RelaunchLoop);
        }

        fs::create_dir_all(&self.marker_dir)
            .map_err(|e| FailureReason::from_io("create handoff marker directory", &e))?;
        let marker = self.marker_dir.join(format!(
            ".handoff-{}-{}",
            std::process::id(),
            MARKER_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_file(&marker);

        let args = vec![
            HANDOFF_TARGET_FLAG.to_string(),
            handoff.target_path.to_string_lossy().into_owned(),
            HANDOFF_MARKER_FLAG.to_string(),
            marker.to_string_lossy().into_owned(),
        ];
        info!(
            "relaunching into {} (elevated: {})",
            handoff.target_path.display(),
            handoff.request_elevation
        );
        self.launcher
            .launch(&handoff.target_path, &args, handoff.request_elevation)?;

        let confirmed = wait_for_marker(&marker, self.timeout, self.poll_interval);
        let _ = fs::remove_file(&marker);
        if confirmed {
            info!("handoff to {} confirmed", handoff.target_path.display());
            Ok(Spawned {
                target: handoff.target_path.clone(),
            })
        } else {
            warn!(
                "{} did not confirm within {:?}",
                handoff.target_path.display(),
                self.timeout
            );
            Err(FailureReason::SpawnTimeout)
        }
    }
}

fn wait_for_marker(marker: &Path, timeout: Duration, poll_interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if marker.exists() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records launches and optionally plays the child's part
    struct FakeLauncher {
        confirm: bool,
        launches: Mutex<Vec<(PathBuf, Vec<String>, bool)>>,
    }

    impl FakeLauncher {
        fn new(confirm: bool) -> Arc<Self> {
            Arc::new(FakeLauncher {
                confirm,
                launches: Mutex::new(Vec::new()),
            })
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, target: &Path, args: &[String], elevated: bool) -> Result<(), FailureReason> {
            self.launches
                .lock()
                .push((target.to_path_buf(), args.to_vec(), elevated));
            if self.confirm {
                let origin = LaunchOrigin::from_args(args);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    origin.signal_alive().unwrap();
                });
            }
            Ok(())
        }
    }

    fn config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::with_dirs(dir.join("install"), dir.join("config"))
            .with_handoff_timeout(Duration::from_millis(300));
        config.handoff_poll_interval = Duration::from_millis(5);
        config
    }

    #[test]
    fn test_from_args_reads_flags() {
        let origin = LaunchOrigin::from_args([
            "RaplMonitor",
            "--verbose",
            HANDOFF_TARGET_FLAG,
            "/opt/rapl-monitor/RaplMonitor",
            HANDOFF_MARKER_FLAG,
            "/tmp/marker",
        ]);
        assert!(origin.is_handoff());
        assert_eq!(
            origin.handoff_target(),
            Some(Path::new("/opt/rapl-monitor/RaplMonitor"))
        );
        assert!(!LaunchOrigin::from_args(["RaplMonitor"]).is_handoff());
    }

    #[test]
    fn test_confirmed_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(true);
        let relauncher = Relauncher::new(&config(dir.path()), launcher.clone());
        let target = dir.path().join("install").join("RaplMonitor");
        let handoff = RelaunchHandoff {
            target_path: target.clone(),
            request_elevation: true,
        };

        let spawned = relauncher.relaunch(&handoff, &LaunchOrigin::fresh()).unwrap();
        assert_eq!(spawned.target, target);

        let launches = launcher.launches.lock();
        assert_eq!(launches.len(), 1);
        assert!(launches[0].2);
        assert_eq!(launches[0].1[0], HANDOFF_TARGET_FLAG);
        // marker cleaned up
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("config")).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_silent_child_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let relauncher = Relauncher::new(&config(dir.path()), FakeLauncher::new(false));
        let handoff = RelaunchHandoff {
            target_path: dir.path().join("RaplMonitor"),
            request_elevation: false,
        };
        assert_eq!(
            relauncher.relaunch(&handoff, &LaunchOrigin::fresh()),
            Err(FailureReason::SpawnTimeout)
        );
    }

    #[test]
    fn test_loop_guard_blocks_second_relaunch() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(true);
        let relauncher = Relauncher::new(&config(dir.path()), launcher.clone());
        let target = dir.path().join("RaplMonitor");
        let origin = LaunchOrigin::from_handoff(&target, None);
        let handoff = RelaunchHandoff {
            target_path: target,
            request_elevation: false,
        };

        assert_eq!(
            relauncher.relaunch(&handoff, &origin),
            Err(FailureReason::RelaunchLoop)
        );
        assert!(launcher.launches.lock().is_empty());
    }

    #[test]
    fn test_signal_alive_without_marker_is_noop() {
        assert!(LaunchOrigin::fresh().signal_alive().is_ok());
    }
}
