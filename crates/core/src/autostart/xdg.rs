//! Desktop-entry autostart for XDG desktops

use super::{AutostartBackend, AutostartRegistration, Trigger, UnregisterStatus};
use crate::atomic_file::write_atomically;
use crate::config::AppConfig;
use crate::error::FailureReason;
use directories::BaseDirs;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RUN_LEVEL_KEY: &str = "X-RaplMonitor-RunLevel";
const TRIGGER_KEY: &str = "X-RaplMonitor-Trigger";

pub struct XdgAutostartBackend {
    dir: PathBuf,
}

impl XdgAutostartBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        XdgAutostartBackend { dir: dir.into() }
    }

    /// `$XDG_CONFIG_HOME/autostart`, or next to our own config if that is unknown
    pub fn for_current_user(config: &AppConfig) -> Self {
        let base = BaseDirs::new()
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| config.config_dir.clone());
        XdgAutostartBackend::new(base.join("autostart"))
    }

    pub fn entry_path(&self, task_name: &str) -> PathBuf {
        self.dir.join(format!("{}.desktop", task_name))
    }
}

impl AutostartBackend for XdgAutostartBackend {
    fn query(&self, task_name: &str) -> Result<Option<AutostartRegistration>, FailureReason> {
        let path = self.entry_path(task_name);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let parsed = parse_desktop_entry(task_name, &text);
                if parsed.is_none() {
                    warn!("ignoring malformed autostart entry {}", path.display());
                }
                Ok(parsed)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(FailureReason::from_io("read autostart entry", &err)),
        }
    }

    fn register(&self, registration: &AutostartRegistration) -> Result<(), FailureReason> {
        let path = self.entry_path(&registration.task_name);
        debug!("writing autostart entry {}", path.display());
        write_atomically(&path, render_desktop_entry(registration).as_bytes())
            .map_err(|e| FailureReason::from_io("write autostart entry", &e))
    }

    fn unregister(&self, task_name: &str) -> Result<UnregisterStatus, FailureReason> {
        match fs::remove_file(self.entry_path(task_name)) {
            Ok(()) => Ok(UnregisterStatus::Removed),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(UnregisterStatus::NotFound),
            Err(err) => Err(FailureReason::from_io("remove autostart entry", &err)),
        }
    }
}

fn render_desktop_entry(registration: &AutostartRegistration) -> String {
    let run_level = if registration.run_as_highest_privilege {
        "highest"
    } else {
        "limited"
    };
    let trigger = match registration.trigger {
        Trigger::Logon => "logon",
    };
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name={name}\n\
         Exec={exec}\n\
         Terminal=false\n\
         X-GNOME-Autostart-enabled=true\n\
         {run_level_key}={run_level}\n\
         {trigger_key}={trigger}\n",
        name = registration.task_name,
        exec = quote_exec(&registration.target_path),
        run_level_key = RUN_LEVEL_KEY,
        run_level = run_level,
        trigger_key = TRIGGER_KEY,
        trigger = trigger,
    )
}

fn parse_desktop_entry(task_name: &str, text: &str) -> Option<AutostartRegistration> {
    let mut exec = None;
    let mut run_level = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "Exec" => exec = Some(unquote_exec(value.trim())),
            RUN_LEVEL_KEY => run_level = Some(value.trim().to_string()),
            _ => {}
        }
    }

    Some(AutostartRegistration {
        task_name: task_name.to_string(),
        target_path: PathBuf::from(exec?),
        run_as_highest_privilege: run_level.as_deref() == Some("highest"),
        trigger: Trigger::Logon,
    })
}

const EXEC_RESERVED: [char; 4] = ['"', '`', '$', '\\'];

fn quote_exec(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let needs_quotes = raw
        .chars()
        .any(|c| c.is_whitespace() || EXEC_RESERVED.contains(&c) || "'><~|&;*?#()".contains(c));
    if !needs_quotes {
        return raw.into_owned();
    }

    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('"');
    for c in raw.chars() {
        if EXEC_RESERVED.contains(&c) {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn unquote_exec(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        // unquoted: the program is the first word
        return value.split_whitespace().next().unwrap_or_default().to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
