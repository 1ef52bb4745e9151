//! Error taxonomy for the bootstrap core
//!
//! Nothing in here is fatal to the monitor itself:
//! - `FailureReason` ends the autostart state machine in `Failed`
//! - `SettingsIssue` is recovered by falling back to defaults
//! - `StartupError` is the only class the runner turns into a non-zero exit

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why an autostart step did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("permission denied")]
    PermissionDenied,
    #[error("file is in use by another process")]
    FileInUse,
    #[error("task scheduling service is unavailable")]
    ServiceUnavailable,
    #[error("replacement process did not confirm startup in time")]
    SpawnTimeout,
    #[error("elevation request was declined")]
    ElevationDeclined,
    #[error("refusing to relaunch into the same target again")]
    RelaunchLoop,
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("task scheduler rejected the request: {0}")]
    SchedulerRejected(String),
    #[error("{context}: {message}")]
    Io { context: String, message: String },
    #[error("not supported on this platform")]
    Unsupported,
}

// Win32 codes surfaced through io::Error::raw_os_error
#[cfg(windows)]
const ERROR_SHARING_VIOLATION: i32 = 32;
#[cfg(windows)]
const ERROR_LOCK_VIOLATION: i32 = 33;
#[cfg(windows)]
const ERROR_USER_MAPPED_FILE: i32 = 1224;
#[cfg(unix)]
const ETXTBSY: i32 = 26;

impl FailureReason {
    /// Classify an I/O error raised while touching `context`
    pub fn from_io(context: impl Into<String>, err: &io::Error) -> Self {
        if is_file_in_use(err) {
            return FailureReason::FileInUse;
        }
        if err.kind() == io::ErrorKind::PermissionDenied {
            return FailureReason::PermissionDenied;
        }
        FailureReason::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Worth retrying after a short delay
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureReason::FileInUse)
    }
}

/// True when the OS reports the file as held open by someone else
pub fn is_file_in_use(err: &io::Error) -> bool {
    match err.raw_os_error() {
        #[cfg(windows)]
        Some(ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION | ERROR_USER_MAPPED_FILE) => true,
        #[cfg(unix)]
        Some(ETXTBSY) => true,
        _ => false,
    }
}

/// Problems found while loading settings. Always recovered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsIssue {
    #[error("settings file could not be read: {0}")]
    Unreadable(String),
    #[error("settings file is not a JSON object")]
    CorruptDocument,
    #[error("field `{0}` could not be parsed, using default")]
    CorruptField(&'static str),
    #[error("field `{0}` was out of range and has been clamped")]
    OutOfRange(&'static str),
}

/// Errors raised while saving settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings writer has shut down")]
    WriterClosed,
    #[error("queued settings could not be saved: {0}")]
    Flush(String),
}

/// Unrecoverable startup problems
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to determine the user configuration directory")]
    NoConfigDir,
    #[error("failed to create configuration directory {path}: {source}")]
    ConfigDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to resolve the running executable: {0}")]
    CurrentExe(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            FailureReason::from_io("copy", &err),
            FailureReason::PermissionDenied
        );
    }

    #[test]
    fn test_other_io_errors_keep_context() {
        let err = io::Error::new(io::ErrorKind::Other, "disk on fire");
        match FailureReason::from_io("copy binary", &err) {
            FailureReason::Io { context, message } => {
                assert_eq!(context, "copy binary");
                assert!(message.contains("disk on fire"));
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_text_file_busy_is_file_in_use() {
        let err = io::Error::from_raw_os_error(ETXTBSY);
        assert_eq!(FailureReason::from_io("rename", &err), FailureReason::FileInUse);
        assert!(FailureReason::FileInUse.is_transient());
    }
}
