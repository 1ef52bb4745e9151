//! Elevation Probe
//!
//! A narrow capability over the OS privilege model: "am I elevated?" and
//! "start this binary elevated". The orchestrator only talks to the trait.

use crate::error::FailureReason;
use std::path::Path;
use tracing::{debug, info, warn};

pub trait Elevation: Send + Sync {
    /// Effective privilege of the current process. `false` when unknown.
    fn is_elevated(&self) -> bool;

    /// Ask the OS to start `target` elevated (shows the consent prompt)
    fn request_elevated_relaunch(&self, target: &Path, args: &[String]) -> Result<(), FailureReason>;
}

/// The real platform implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemElevation;

impl Elevation for SystemElevation {
    fn is_elevated(&self) -> bool {
        let elevated = query_elevation().unwrap_or_else(|err| {
            warn!("elevation query failed ({}), assuming unprivileged", err);
            false
        });
        debug!("process elevated: {}", elevated);
        elevated
    }

    fn request_elevated_relaunch(&self, target: &Path, args: &[String]) -> Result<(), FailureReason> {
        info!("requesting elevated launch of {}", target.display());
        shell_execute_elevated(target, args)
    }
}

#[cfg(windows)]
fn query_elevation() -> Result<bool, String> {
    use std::ffi::c_void;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)
            .map_err(|e| format!("OpenProcessToken failed: {}", e))?;

        let mut elevation = TOKEN_ELEVATION::default();
        let mut returned = 0u32;
        let result = GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut TOKEN_ELEVATION as *mut c_void),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        );
        let _ = CloseHandle(token);

        result.map_err(|e| format!("GetTokenInformation failed: {}", e))?;
        Ok(elevation.TokenIsElevated != 0)
    }
}

/// Effective uid 0 counts as elevated
#[cfg(unix)]
fn query_elevation() -> Result<bool, String> {
    let status = std::fs::read_to_string("/proc/self/status").map_err(|e| e.to_string())?;
    parse_effective_uid(&status)
        .map(|uid| uid == 0)
        .ok_or_else(|| "no Uid line in /proc/self/status".to_string())
}

#[cfg(not(any(windows, unix)))]
fn query_elevation() -> Result<bool, String> {
    Err("unsupported platform".to_string())
}

/// `Uid:` line holds real, effective, saved and filesystem uids
#[cfg_attr(not(unix), allow(dead_code))]
fn parse_effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().nth(1))
        .and_then(|uid| uid.parse().ok())
}

#[cfg(windows)]
fn shell_execute_elevated(target: &Path, args: &[String]) -> Result<(), FailureReason> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::ERROR_CANCELLED;
    use windows::Win32::UI::Shell::{ShellExecuteExW, SEE_MASK_NOASYNC, SHELLEXECUTEINFOW};
    use windows::Win32::UI::WindowsAndMessaging::SW_SHOWNORMAL;

    let verb = to_wide("runas");
    let file = to_wide(&target.to_string_lossy());
    let params = to_wide(&join_command_line(args));

    let mut info = SHELLEXECUTEINFOW {
        cbSize: std::mem::size_of::<SHELLEXECUTEINFOW>() as u32,
        fMask: SEE_MASK_NOASYNC,
        lpVerb: PCWSTR(verb.as_ptr()),
        lpFile: PCWSTR(file.as_ptr()),
        lpParameters: PCWSTR(params.as_ptr()),
        nShow: SW_SHOWNORMAL.0,
        ..Default::default()
    };

    match unsafe { ShellExecuteExW(&mut info) } {
        Ok(()) => Ok(()),
        Err(e) if e.code() == ERROR_CANCELLED.to_hresult() => {
            info!("user declined the elevation prompt");
            Err(FailureReason::ElevationDeclined)
        }
        Err(e) => Err(FailureReason::SpawnFailed(format!("ShellExecuteExW failed: {}", e))),
    }
}

#[cfg(not(windows))]
fn shell_execute_elevated(_target: &Path, _args: &[String]) -> Result<(), FailureReason> {
    Err(FailureReason::Unsupported)
}

#[cfg(windows)]
pub(crate) fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Quote arguments for a Windows command line
#[cfg_attr(not(windows), allow(dead_code))]
fn join_command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
                arg.clone()
            } else {
                format!("\"{}\"", arg.replace('"', "\\\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
