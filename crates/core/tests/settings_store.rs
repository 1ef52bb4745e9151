//! Settings persistence through the public API

use rapl_monitor_core::geometry::{validate_geometry, Rect};
use rapl_monitor_core::settings::{
    MetricKey, PersistedSettings, RefreshRate, SettingsStore, DEFAULT_OPACITY,
};
use rapl_monitor_core::settings_writer::SettingsWriter;
use std::fs;

#[test]
fn missing_opacity_keeps_other_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    fs::write(
        &path,
        r#"{
            "window_x": 40, "window_y": 60, "window_width": 320, "window_height": 480,
            "click_through_enabled": false, "always_on_top": false,
            "refresh_rate": "fast", "theme_name": "light",
            "visibility_flags": {"gpu_temp": false},
            "autostart_enabled": true, "first_run_completed": true
        }"#,
    )
    .unwrap();

    let report = SettingsStore::new(&path).load();
    let settings = report.settings;
    assert_eq!(settings.opacity(), DEFAULT_OPACITY);
    assert_eq!(settings.geometry(), Rect::new(40, 60, 320, 480));
    assert!(!settings.always_on_top());
    assert_eq!(settings.refresh_rate(), RefreshRate::Fast);
    assert_eq!(settings.theme_name(), "light");
    assert!(!settings.is_visible(MetricKey::GpuTemp));
    assert!(settings.autostart_enabled());
}

#[test]
fn interrupted_save_leaves_previous_file_loadable() {
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::new(dir.path().join("settings.json"));

    let mut saved = PersistedSettings::default();
    saved.set_opacity(0.6);
    store.save(&saved).unwrap();

    // A crash between writing the temp file and renaming it
    fs::write(
        dir.path().join(".settings.json.99999.tmp"),
        br#"{"window_x": 12, "opac"#,
    )
    .unwrap();

    let report = store.load();
    assert!(report.issues.is_empty());
    assert_eq!(report.settings, saved);

    saved.set_opacity(0.8);
    store.save(&saved).unwrap();
    assert_eq!(store.load().settings.opacity(), 0.8);
}

#[test]
fn garbage_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::new(dir.path().join("settings.json"));
    fs::write(store.path(), b"\x00\x01 not json").unwrap();

    let report = store.load();
    assert_eq!(report.settings, PersistedSettings::default());
    assert!(!report.issues.is_empty());
}

#[test]
fn burst_of_saves_ends_with_latest_value() {
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::new(dir.path().join("settings.json"));
    let writer = SettingsWriter::spawn(store.clone()).unwrap();

    let mut settings = PersistedSettings::default();
    for step in 1..=20 {
        settings.set_geometry(Rect::new(step * 10, 0, 300, 400));
        writer.queue(settings.clone()).unwrap();
    }
    writer.flush().unwrap();

    assert_eq!(store.load().settings.geometry(), Rect::new(200, 0, 300, 400));
    assert!(writer.saves_performed() <= 20);
}

#[test]
fn unplugged_monitor_window_comes_back() {
    let primary = Rect::new(0, 0, 1920, 1080);
    let restored = validate_geometry(Rect::new(5000, 5000, 300, 200), &[primary]);
    assert!(primary.contains(&restored));
    assert_eq!(restored, Rect::new(1620, 880, 300, 200));
}
