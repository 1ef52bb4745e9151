//! Persisted settings for the monitor widget
//!
//! The record is loaded once at startup and written back on every confirmed
//! change. Loading never fails: each field is read on its own and falls back
//! to its default, so one bad value does not throw away the rest of the file.
//! Saving goes through a temp file and a rename, so an interrupted write
//! leaves the previous file in place.

use crate::atomic_file::write_atomically;
use crate::config::AppConfig;
use crate::error::{SettingsError, SettingsIssue};
use crate::geometry::Rect;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_GEOMETRY: Rect = Rect::new(100, 100, 300, 400);
pub const DEFAULT_OPACITY: f64 = 1.0;
/// Lowest opacity the settings dialog offers
pub const MIN_OPACITY: f64 = 0.1;
pub const MAX_OPACITY: f64 = 1.0;
pub const DEFAULT_THEME: &str = "dark";

/// How often the external poller samples metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshRate {
    Fast,
    #[default]
    Normal,
    Slow,
}

impl RefreshRate {
    pub const ALL: [RefreshRate; 3] = [RefreshRate::Fast, RefreshRate::Normal, RefreshRate::Slow];

    pub fn interval(self) -> Duration {
        Duration::from_millis(self.millis())
    }

    pub fn millis(self) -> u64 {
        match self {
            RefreshRate::Fast => 500,
            RefreshRate::Normal => 1500,
            RefreshRate::Slow => 3000,
        }
    }

    /// Snap a raw interval (older files stored milliseconds) to a rate
    pub fn from_millis(ms: u64) -> Self {
        RefreshRate::ALL
            .into_iter()
            .min_by_key(|rate| rate.millis().abs_diff(ms))
            .unwrap_or_default()
    }
}

/// Visibility toggles offered by the widget
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    CpuGroup,
    RamGroup,
    GpuGroups,
    CpuUsage,
    CpuTemp,
    CpuFreq,
    GpuUsage,
    GpuTemp,
    GpuVram,
}

impl MetricKey {
    pub const ALL: [MetricKey; 9] = [
        MetricKey::CpuGroup,
        MetricKey::RamGroup,
        MetricKey::GpuGroups,
        MetricKey::CpuUsage,
        MetricKey::CpuTemp,
        MetricKey::CpuFreq,
        MetricKey::GpuUsage,
        MetricKey::GpuTemp,
        MetricKey::GpuVram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKey::CpuGroup => "cpu_group",
            MetricKey::RamGroup => "ram_group",
            MetricKey::GpuGroups => "gpu_groups",
            MetricKey::CpuUsage => "cpu_usage",
            MetricKey::CpuTemp => "cpu_temp",
            MetricKey::CpuFreq => "cpu_freq",
            MetricKey::GpuUsage => "gpu_usage",
            MetricKey::GpuTemp => "gpu_temp",
            MetricKey::GpuVram => "gpu_vram",
        }
    }
}

fn default_visibility() -> BTreeMap<MetricKey, bool> {
    MetricKey::ALL.into_iter().map(|key| (key, true)).collect()
}

/// User-visible state restored across restarts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedSettings {
    window_x: i32,
    window_y: i32,
    window_width: i32,
    window_height: i32,
    opacity: f64,
    click_through_enabled: bool,
    always_on_top: bool,
    refresh_rate: RefreshRate,
    visibility_flags: BTreeMap<MetricKey, bool>,
    theme_name: String,
    autostart_enabled: bool,
    first_run_completed: bool,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        PersistedSettings {
            window_x: DEFAULT_GEOMETRY.x,
            window_y: DEFAULT_GEOMETRY.y,
            window_width: DEFAULT_GEOMETRY.width,
            window_height: DEFAULT_GEOMETRY.height,
            opacity: DEFAULT_OPACITY,
            click_through_enabled: false,
            always_on_top: true,
            refresh_rate: RefreshRate::default(),
            visibility_flags: default_visibility(),
            theme_name: DEFAULT_THEME.to_string(),
            autostart_enabled: false,
            first_run_completed: false,
        }
    }
}

impl PersistedSettings {
    pub fn geometry(&self) -> Rect {
        Rect::new(self.window_x, self.window_y, self.window_width, self.window_height)
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    pub fn click_through_enabled(&self) -> bool {
        self.click_through_enabled
    }

    pub fn always_on_top(&self) -> bool {
        self.always_on_top
    }

    pub fn refresh_rate(&self) -> RefreshRate {
        self.refresh_rate
    }

    pub fn is_visible(&self, key: MetricKey) -> bool {
        self.visibility_flags.get(&key).copied().unwrap_or(true)
    }

    pub fn visibility_flags(&self) -> &BTreeMap<MetricKey, bool> {
        &self.visibility_flags
    }

    pub fn theme_name(&self) -> &str {
        &self.theme_name
    }

    pub fn autostart_enabled(&self) -> bool {
        self.autostart_enabled
    }

    pub fn first_run_completed(&self) -> bool {
        self.first_run_completed
    }

    /// Copy handed to the widget at startup: never start click-through,
    /// or the user could not reach the settings button.
    pub fn startup_view(&self) -> PersistedSettings {
        PersistedSettings {
            click_through_enabled: false,
            ..self.clone()
        }
    }

    pub fn set_geometry(&mut self, rect: Rect) {
        self.window_x = rect.x;
        self.window_y = rect.y;
        self.window_width = rect.width.max(1);
        self.window_height = rect.height.max(1);
    }

    /// Clamped to the range the settings dialog offers
    pub fn set_opacity(&mut self, opacity: f64) {
        self.opacity = clamp_opacity(opacity);
    }

    pub fn set_click_through(&mut self, enabled: bool) {
        self.click_through_enabled = enabled;
    }

    pub fn set_always_on_top(&mut self, enabled: bool) {
        self.always_on_top = enabled;
    }

    pub fn set_refresh_rate(&mut self, rate: RefreshRate) {
        self.refresh_rate = rate;
    }

    pub fn set_visible(&mut self, key: MetricKey, visible: bool) {
        self.visibility_flags.insert(key, visible);
    }

    pub fn set_theme_name(&mut self, theme: impl Into<String>) {
        let theme = theme.into();
        if !theme.trim().is_empty() {
            self.theme_name = theme;
        }
    }

    pub fn set_autostart_enabled(&mut self, enabled: bool) {
        self.autostart_enabled = enabled;
    }

    pub fn mark_first_run_completed(&mut self) {
        self.first_run_completed = true;
    }
}

fn clamp_opacity(value: f64) -> f64 {
    if value.is_nan() {
        DEFAULT_OPACITY
    } else {
        value.clamp(MIN_OPACITY, MAX_OPACITY)
    }
}

/// Result of a load: always a usable record, plus what had to be repaired
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub settings: PersistedSettings,
    pub issues: Vec<SettingsIssue>,
    /// False when no settings file existed yet
    pub from_disk: bool,
}

/// Reads one field at a time out of a JSON object
struct FieldReader<'a> {
    object: &'a Map<String, Value>,
    issues: Vec<SettingsIssue>,
}

impl<'a> FieldReader<'a> {
    fn raw(&self, name: &'static str, aliases: &[&str]) -> Option<&'a Value> {
        std::iter::once(name)
            .chain(aliases.iter().copied())
            .find_map(|key| self.object.get(key))
            .filter(|value| !value.is_null())
    }

    fn read<T: DeserializeOwned>(&mut self, name: &'static str, aliases: &[&str]) -> Option<T> {
        let value = self.raw(name, aliases)?;
        match T::deserialize(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!("settings field `{}` is invalid ({}), using default", name, err);
                self.issues.push(SettingsIssue::CorruptField(name));
                None
            }
        }
    }

    fn positive(&mut self, name: &'static str, aliases: &[&str]) -> Option<i32> {
        let value = self.read::<i32>(name, aliases)?;
        if value > 0 {
            Some(value)
        } else {
            self.issues.push(SettingsIssue::OutOfRange(name));
            None
        }
    }

    fn refresh_rate(&mut self) -> Option<RefreshRate> {
        const NAME: &str = "refresh_rate";
        match self.raw(NAME, &["refresh_interval"])? {
            Value::Number(number) => match number.as_u64() {
                Some(ms) => Some(RefreshRate::from_millis(ms)),
                None => {
                    self.issues.push(SettingsIssue::CorruptField(NAME));
                    None
                }
            },
            _ => self.read(NAME, &["refresh_interval"]),
        }
    }

    fn visibility(&mut self) -> BTreeMap<MetricKey, bool> {
        const NAME: &str = "visibility_flags";
        let mut flags = default_visibility();
        let Some(raw) = self.raw(NAME, &["visibility"]) else {
            return flags;
        };
        let Some(map) = raw.as_object() else {
            self.issues.push(SettingsIssue::CorruptField(NAME));
            return flags;
        };

        let mut corrupt = false;
        for key in MetricKey::ALL {
            match map.get(key.as_str()) {
                Some(Value::Bool(visible)) => {
                    flags.insert(key, *visible);
                }
                Some(_) => corrupt = true,
                None => {}
            }
        }
        if corrupt {
            self.issues.push(SettingsIssue::CorruptField(NAME));
        }
        flags
    }
}

/// Build a record from settings file text, repairing what it must
pub fn parse_settings(text: &str) -> LoadReport {
    let defaults = PersistedSettings::default();
    let document: Value = match serde_json::from_str(text) {
        Ok(document) => document,
        Err(err) => {
            warn!("settings file is not valid JSON ({}), using defaults", err);
            return LoadReport {
                settings: defaults,
                issues: vec![SettingsIssue::CorruptDocument],
                from_disk: true,
            };
        }
    };
    let Some(object) = document.as_object() else {
        return LoadReport {
            settings: defaults,
            issues: vec![SettingsIssue::CorruptDocument],
            from_disk: true,
        };
    };

    let mut reader = FieldReader {
        object,
        issues: Vec::new(),
    };

    let opacity = match reader.read::<f64>("opacity", &[]) {
        Some(value) if !(MIN_OPACITY..=MAX_OPACITY).contains(&value) => {
            reader.issues.push(SettingsIssue::OutOfRange("opacity"));
            clamp_opacity(value)
        }
        Some(value) => value,
        None => defaults.opacity,
    };

    let settings = PersistedSettings {
        window_x: reader.read("window_x", &["window_pos_x"]).unwrap_or(defaults.window_x),
        window_y: reader.read("window_y", &["window_pos_y"]).unwrap_or(defaults.window_y),
        window_width: reader
            .positive("window_width", &[])
            .unwrap_or(defaults.window_width),
        window_height: reader
            .positive("window_height", &[])
            .unwrap_or(defaults.window_height),
        opacity,
        click_through_enabled: reader
            .read("click_through_enabled", &["click_through"])
            .unwrap_or(defaults.click_through_enabled),
        always_on_top: reader
            .read("always_on_top", &[])
            .unwrap_or(defaults.always_on_top),
        refresh_rate: reader.refresh_rate().unwrap_or(defaults.refresh_rate),
        visibility_flags: reader.visibility(),
        theme_name: reader
            .read::<String>("theme_name", &["theme"])
            .filter(|theme| !theme.trim().is_empty())
            .unwrap_or_else(|| defaults.theme_name.clone()),
        autostart_enabled: reader
            .read("autostart_enabled", &[])
            .unwrap_or(defaults.autostart_enabled),
        first_run_completed: reader
            .read("first_run_completed", &[])
            .unwrap_or(defaults.first_run_completed),
    };

    LoadReport {
        settings,
        issues: reader.issues,
        from_disk: true,
    }
}

/// Owner of the settings file
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SettingsStore { path: path.into() }
    }

    pub fn for_config(config: &AppConfig) -> Self {
        SettingsStore::new(config.settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings. Never fails; problems end up in `LoadReport::issues`.
    pub fn load(&self) -> LoadReport {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("no settings file at {}, using defaults", self.path.display());
                return LoadReport {
                    settings: PersistedSettings::default(),
                    issues: Vec::new(),
                    from_disk: false,
                };
            }
            Err(err) => {
                warn!("failed to read {}: {}", self.path.display(), err);
                return LoadReport {
                    settings: PersistedSettings::default(),
                    issues: vec![SettingsIssue::Unreadable(err.to_string())],
                    from_disk: false,
                };
            }
        };

        let report = parse_settings(&text);
        for issue in &report.issues {
            warn!("{}: {}", self.path.display(), issue);
        }
        report
    }

    /// Save atomically: temp file in the same directory, then rename
    pub fn save(&self, settings: &PersistedSettings) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(settings)?;
        write_atomically(&self.path, json.as_bytes()).map_err(|source| SettingsError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!("settings saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PersistedSettings::default();
        assert_eq!(settings.geometry(), DEFAULT_GEOMETRY);
        assert_eq!(settings.opacity(), 1.0);
        assert_eq!(settings.refresh_rate(), RefreshRate::Normal);
        assert_eq!(settings.theme_name(), "dark");
        assert!(!settings.autostart_enabled());
        assert!(MetricKey::ALL.iter().all(|key| settings.is_visible(*key)));
    }

    #[test]
    fn test_missing_opacity_keeps_other_fields() {
        let text = r#"{
            "window_x": 40, "window_y": 60, "window_width": 320, "window_height": 480,
            "click_through_enabled": true, "always_on_top": false,
            "refresh_rate": "slow", "theme_name": "light", "autostart_enabled": true,
            "visibility_flags": { "cpu_temp": false }
        }"#;
        let report = parse_settings(text);
        let settings = report.settings;

        assert!(report.issues.is_empty());
        assert_eq!(settings.opacity(), DEFAULT_OPACITY);
        assert_eq!(settings.geometry(), Rect::new(40, 60, 320, 480));
        assert!(settings.click_through_enabled());
        assert!(!settings.always_on_top());
        assert_eq!(settings.refresh_rate(), RefreshRate::Slow);
        assert_eq!(settings.theme_name(), "light");
        assert!(settings.autostart_enabled());
        assert!(!settings.is_visible(MetricKey::CpuTemp));
        assert!(settings.is_visible(MetricKey::GpuVram));
    }

    #[test]
    fn test_corrupt_field_does_not_discard_record() {
        let text = r#"{ "opacity": "very", "theme_name": "light", "window_x": 12 }"#;
        let report = parse_settings(text);
        assert_eq!(report.issues, vec![SettingsIssue::CorruptField("opacity")]);
        assert_eq!(report.settings.opacity(), DEFAULT_OPACITY);
        assert_eq!(report.settings.theme_name(), "light");
        assert_eq!(report.settings.geometry().x, 12);
    }

    #[test]
    fn test_garbage_document_falls_back_to_defaults() {
        let report = parse_settings("{ \"window_x\": 1");
        assert_eq!(report.issues, vec![SettingsIssue::CorruptDocument]);
        assert_eq!(report.settings, PersistedSettings::default());

        let report = parse_settings("[1, 2, 3]");
        assert_eq!(report.issues, vec![SettingsIssue::CorruptDocument]);
    }

    #[test]
    fn test_legacy_keys_are_understood() {
        let text = r#"{
            "refresh_interval": 500, "opacity": 0.8, "theme": "auto",
            "window_pos_x": 700, "window_pos_y": null, "click_through": false,
            "visibility": { "ram_group": false, "bogus": true }
        }"#;
        let report = parse_settings(text);
        let settings = report.settings;

        assert!(report.issues.is_empty());
        assert_eq!(settings.refresh_rate(), RefreshRate::Fast);
        assert_eq!(settings.opacity(), 0.8);
        assert_eq!(settings.theme_name(), "auto");
        assert_eq!(settings.geometry().x, 700);
        assert_eq!(settings.geometry().y, DEFAULT_GEOMETRY.y);
        assert!(!settings.is_visible(MetricKey::RamGroup));
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let report = parse_settings(r#"{ "opacity": 3.5, "window_width": 0 }"#);
        assert_eq!(report.settings.opacity(), MAX_OPACITY);
        assert_eq!(report.settings.geometry().width, DEFAULT_GEOMETRY.width);
        assert!(report.issues.contains(&SettingsIssue::OutOfRange("opacity")));
        assert!(report.issues.contains(&SettingsIssue::OutOfRange("window_width")));
    }

    #[test]
    fn test_refresh_rate_snapping() {
        assert_eq!(RefreshRate::from_millis(0), RefreshRate::Fast);
        assert_eq!(RefreshRate::from_millis(1400), RefreshRate::Normal);
        assert_eq!(RefreshRate::from_millis(10_000), RefreshRate::Slow);
        assert_eq!(RefreshRate::Slow.interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_setters_clamp() {
        let mut settings = PersistedSettings::default();
        settings.set_opacity(0.0);
        assert_eq!(settings.opacity(), MIN_OPACITY);
        settings.set_theme_name("   ");
        assert_eq!(settings.theme_name(), DEFAULT_THEME);
        settings.set_geometry(Rect::new(1, 2, 0, -5));
        assert_eq!(settings.geometry(), Rect::new(1, 2, 1, 1));
    }

    #[test]
    fn test_startup_view_is_interactive() {
        let mut settings = PersistedSettings::default();
        settings.set_click_through(true);
        assert!(!settings.startup_view().click_through_enabled());
        assert!(settings.click_through_enabled());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));

        let mut settings = PersistedSettings::default();
        settings.set_refresh_rate(RefreshRate::Fast);
        settings.set_visible(MetricKey::GpuTemp, false);
        settings.set_autostart_enabled(true);
        store.save(&settings).unwrap();

        let report = store.load();
        assert!(report.from_disk);
        assert!(report.issues.is_empty());
        assert_eq!(report.settings, settings);
    }

    #[test]
    fn test_geometry_is_saved_as_flat_fields() {
        let mut settings = PersistedSettings::default();
        settings.set_geometry(Rect::new(-1280, 20, 300, 400));
        let document = serde_json::to_value(&settings).unwrap();
        assert_eq!(document["window_x"], -1280);
        assert_eq!(document["window_y"], 20);
        assert_eq!(document["window_width"], 300);
        assert_eq!(document["window_height"], 400);
        assert!(document.get("geometry").is_none());
    }

    #[test]
    fn test_missing_file_is_not_an_issue() {
        let dir = tempfile::tempdir().unwrap();
        let report = SettingsStore::new(dir.path().join("absent.json")).load();
        assert!(!report.from_disk);
        assert!(report.issues.is_empty());
    }
}
