//! Single-instance lock
//!
//! Held for the whole process lifetime. The OS drops it when the process
//! dies, so a crash never leaves a stale lock behind.

use crate::config::AppConfig;
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance already holds '{0}'")]
    AlreadyHeld(String),
    #[error("failed to create instance lock: {0}")]
    Io(#[from] io::Error),
}

pub struct InstanceLock {
    name: String,
    #[cfg(windows)]
    handle: windows::Win32::Foundation::HANDLE,
    #[cfg(not(windows))]
    _file: std::fs::File,
}

impl InstanceLock {
    /// Take the lock or report that another instance has it
    pub fn acquire(config: &AppConfig) -> Result<Self, LockError> {
        let lock = Self::acquire_platform(config)?;
        info!("holding instance lock '{}'", lock.name);
        Ok(lock)
    }

    /// Keep trying while a handing-off parent releases the lock
    pub fn acquire_with_wait(config: &AppConfig, timeout: Duration) -> Result<Self, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::acquire(config) {
                Err(LockError::AlreadyHeld(name)) if Instant::now() < deadline => {
                    debug!("'{}' still held, waiting", name);
                    thread::sleep(Duration::from_millis(100));
                }
                result => return result,
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(windows)]
    fn acquire_platform(config: &AppConfig) -> Result<Self, LockError> {
        use crate::elevation::to_wide;
        use windows::core::PCWSTR;
        use windows::Win32::Foundation::{CloseHandle, ERROR_ALREADY_EXISTS};
        use windows::Win32::System::Threading::CreateMutexW;

        let name = format!("Local\\{}", config.lock_name);
        let wide = to_wide(&name);
        let handle = unsafe { CreateMutexW(None, false, PCWSTR(wide.as_ptr())) }
            .map_err(|e| LockError::Io(io::Error::other(e.to_string())))?;

        let already_exists =
            windows::core::Error::from_win32().code() == ERROR_ALREADY_EXISTS.to_hresult();
        if already_exists {
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(LockError::AlreadyHeld(name));
        }
        Ok(InstanceLock { name, handle })
    }

    #[cfg(not(windows))]
    fn acquire_platform(config: &AppConfig) -> Result<Self, LockError> {
        use std::fs::{self, OpenOptions, TryLockError};
        use std::io::Write;

        let path = config.lock_file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let name = path.display().to_string();
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(LockError::AlreadyHeld(name)),
            Err(TryLockError::Error(err)) => return Err(LockError::Io(err)),
        }

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        Ok(InstanceLock { name, _file: file })
    }
}

#[cfg(windows)]
impl Drop for InstanceLock {
    fn drop(&mut self) {
        unsafe {
            let _ = windows::Win32::Foundation::CloseHandle(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> AppConfig {
        AppConfig::with_dirs(dir.join("install"), dir.join("config"))
            .with_task_name("RAPL_Monitor_LockTest")
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.lock_name = format!("RaplMonitor.Test.{}", std::process::id());

        let first = InstanceLock::acquire(&config).unwrap();
        assert!(matches!(
            InstanceLock::acquire(&config),
            Err(LockError::AlreadyHeld(_))
        ));
        drop(first);
        assert!(InstanceLock::acquire(&config).is_ok());
    }

    #[test]
    fn test_wait_succeeds_once_released() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.lock_name = format!("RaplMonitor.WaitTest.{}", std::process::id());

        let first = InstanceLock::acquire(&config).unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            drop(first);
        });
        let second = InstanceLock::acquire_with_wait(&config, Duration::from_secs(5));
        releaser.join().unwrap();
        assert!(second.is_ok());
    }

    #[test]
    fn test_wait_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.lock_name = format!("RaplMonitor.GiveUp.{}", std::process::id());

        let _first = InstanceLock::acquire(&config).unwrap();
        assert!(matches!(
            InstanceLock::acquire_with_wait(&config, Duration::from_millis(200)),
            Err(LockError::AlreadyHeld(_))
        ));
    }
}
