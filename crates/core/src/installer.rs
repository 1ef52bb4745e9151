//! Installer/Relocator
//!
//! Copies the running executable into the fixed install directory exactly
//! once per content version. Installed-ness is derived from the files on
//! disk (path identity or matching SHA-256), never from a remembered flag,
//! so it survives crashes and restarts.

use crate::config::{AppConfig, RetryPolicy};
use crate::elevation::Elevation;
use crate::error::FailureReason;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use sysinfo::System;
use tracing::{debug, info, warn};

/// Snapshot taken by the orchestrator before deciding what to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationState {
    pub current_executable_path: PathBuf,
    /// Constant across versions
    pub installed_path: PathBuf,
    pub is_installed: bool,
    pub is_elevated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    AlreadyInstalled,
    Installed(PathBuf),
}

pub struct Installer {
    install_dir: PathBuf,
    installed_path: PathBuf,
    side_resources: Vec<String>,
    retry: RetryPolicy,
    copies: AtomicUsize,
}

impl Installer {
    pub fn new(config: &AppConfig) -> Self {
        Installer {
            install_dir: config.install_dir.clone(),
            installed_path: config.installed_path(),
            side_resources: config.side_resources.clone(),
            retry: config.copy_retry.clone(),
            copies: AtomicUsize::new(0),
        }
    }

    pub fn installed_path(&self) -> &Path {
        &self.installed_path
    }

    /// Probe disk and privilege for the current process
    pub fn inspect(&self, current_exe: &Path, elevation: &dyn Elevation) -> InstallationState {
        InstallationState {
            current_executable_path: current_exe.to_path_buf(),
            installed_path: self.installed_path.clone(),
            is_installed: self.is_installed(current_exe),
            is_elevated: elevation.is_elevated(),
        }
    }

    /// The installed copy exists and carries the same content as `current_exe`
    pub fn is_installed(&self, current_exe: &Path) -> bool {
        if same_path(current_exe, &self.installed_path) {
            return true;
        }
        if !self.installed_path.is_file() {
            return false;
        }

        match (file_digest(current_exe), file_digest(&self.installed_path)) {
            (Ok(running), Ok(installed)) => running == installed,
            (Err(err), _) | (_, Err(err)) => {
                warn!("could not hash executables for install check: {}", err);
                false
            }
        }
    }

    /// Copy the running executable into place unless it already is there
    pub fn ensure_installed(&self, state: &InstallationState) -> Result<InstallStatus, FailureReason> {
        let source = &state.current_executable_path;
        if self.is_installed(source) {
            debug!("{} is already installed", self.installed_path.display());
            return Ok(InstallStatus::AlreadyInstalled);
        }
        if !state.is_elevated {
            warn!("installing without elevation, the copy will likely be refused");
        }

        fs::create_dir_all(&self.install_dir)
            .map_err(|e| FailureReason::from_io("create install directory", &e))?;

        // Resources before the executable; the executable in place means installed
        if let Some(source_dir) = source.parent() {
            for name in &self.side_resources {
                let resource = source_dir.join(name);
                if !resource.is_file() {
                    debug!("side resource {} not present, skipping", resource.display());
                    continue;
                }
                self.copy_into_place(&resource, &self.install_dir.join(name))?;
            }
        }

        self.copy_into_place(source, &self.installed_path)?;

        self.copies.fetch_add(1, Ordering::SeqCst);
        info!(
            "installed {} -> {}",
            source.display(),
            self.installed_path.display()
        );
        Ok(InstallStatus::Installed(self.installed_path.clone()))
    }

    /// Install operations that actually copied files in this process
    pub fn copies_performed(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Copy to a partial name, flush, then rename over `dest`
    fn copy_into_place(&self, source: &Path, dest: &Path) -> Result<(), FailureReason> {
        let partial = partial_path_for(dest);
        let _ = fs::remove_file(&partial);

        fs::copy(source, &partial).map_err(|e| FailureReason::from_io("copy executable", &e))?;
        File::open(&partial)
            .and_then(|file| file.sync_all())
            .map_err(|e| FailureReason::from_io("flush copied executable", &e))?;

        let result = retry_transient(&self.retry, || {
            fs::rename(&partial, dest).map_err(|err| classify_replace_error(dest, &err))
        });
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out
pub fn retry_transient<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, FailureReason>
where
    F: FnMut() -> Result<T, FailureReason>,
{
    let mut delays = policy.delays();
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(reason) if reason.is_transient() => match delays.next() {
                Some(delay) => {
                    debug!("attempt {} failed ({}), retrying in {:?}", attempt, reason, delay);
                    thread::sleep(delay);
                    attempt += 1;
                }
                None => {
                    warn!("giving up after {} attempts: {}", attempt, reason);
                    return Err(reason);
                }
            },
            Err(reason) => return Err(reason),
        }
    }
}

/// Access denied on a binary some process is executing means "in use"
fn classify_replace_error(dest: &Path, err: &io::Error) -> FailureReason {
    let reason = FailureReason::from_io("replace installed executable", err);
    if reason == FailureReason::PermissionDenied {
        let holders = running_instances(dest);
        if !holders.is_empty() {
            debug!("{} is held by pid(s) {:?}", dest.display(), holders);
            return FailureReason::FileInUse;
        }
    }
    reason
}

/// Pids of live processes whose executable is `path`
pub fn running_instances(path: &Path) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.exe().map_or(false, |exe| same_path(exe, path)))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

fn partial_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.partial", name))
}

/// SHA-256 of a file's content
pub fn file_digest(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}

/// Path equality that tolerates symlinks and, on Windows, case
pub fn same_path(a: &Path, b: &Path) -> bool {
    let a = fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let b = fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    if cfg!(windows) {
        a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy())
    } else {
        a == b
    }
}
