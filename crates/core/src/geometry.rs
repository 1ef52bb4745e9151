//! Window-State Validator
//!
//! Keeps a restored window reachable when the display layout changed since
//! the geometry was saved (monitor unplugged, resolution lowered).

use tracing::{debug, warn};

/// Screen rectangle in virtual-desktop pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Rect { x, y, width, height }
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Overlap with positive area
    pub fn intersects(&self, other: &Rect) -> bool {
        (self.x as i64) < other.right()
            && (other.x as i64) < self.right()
            && (self.y as i64) < other.bottom()
            && (other.y as i64) < self.bottom()
    }

    /// True when `other` lies entirely inside `self`
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// Resolve a stored window rectangle against the attached displays.
///
/// `displays[0]` is the primary display's work area. A rectangle that still
/// touches any display is returned untouched; otherwise it is moved (and
/// shrunk if needed) to the nearest position inside the primary work area.
pub fn validate_geometry(stored: Rect, displays: &[Rect]) -> Rect {
    let Some(primary) = displays.first() else {
        debug!("no display information, keeping stored geometry");
        return stored;
    };

    if displays.iter().any(|display| stored.intersects(display)) {
        return stored;
    }

    let clamped = clamp_into(stored, primary);
    warn!(
        "window {:?} is off-screen, moved to {:?} on the primary display",
        stored, clamped
    );
    clamped
}

fn clamp_into(rect: Rect, area: &Rect) -> Rect {
    let width = rect.width.clamp(1, area.width.max(1));
    let height = rect.height.clamp(1, area.height.max(1));
    let max_x = (area.right() - width as i64) as i32;
    let max_y = (area.bottom() - height as i64) as i32;

    Rect {
        x: rect.x.clamp(area.x, max_x.max(area.x)),
        y: rect.y.clamp(area.y, max_y.max(area.y)),
        width,
        height,
    }
}

/// Work areas of the attached monitors, primary first
#[cfg(windows)]
pub fn current_work_areas() -> Vec<Rect> {
    use windows::Win32::Foundation::{BOOL, LPARAM, RECT};
    use windows::Win32::Graphics::Gdi::{
        EnumDisplayMonitors, GetMonitorInfoW, HDC, HMONITOR, MONITORINFO, MONITORINFOF_PRIMARY,
    };

    unsafe extern "system" fn collect(
        monitor: HMONITOR,
        _hdc: HDC,
        _clip: *mut RECT,
        data: LPARAM,
    ) -> BOOL {
        let found = &mut *(data.0 as *mut Vec<(Rect, bool)>);
        let mut info = MONITORINFO {
            cbSize: std::mem::size_of::<MONITORINFO>() as u32,
            ..Default::default()
        };
        if GetMonitorInfoW(monitor, &mut info).as_bool() {
            let work = info.rcWork;
            found.push((
                Rect::new(work.left, work.top, work.right - work.left, work.bottom - work.top),
                info.dwFlags & MONITORINFOF_PRIMARY != 0,
            ));
        }
        BOOL::from(true)
    }

    let mut found: Vec<(Rect, bool)> = Vec::new();
    unsafe {
        let _ = EnumDisplayMonitors(
            HDC::default(),
            None,
            Some(collect),
            LPARAM(&mut found as *mut Vec<(Rect, bool)> as isize),
        );
    }

    // Primary first, the rest in enumeration order
    found.sort_by_key(|(_, primary)| !*primary);
    found.into_iter().map(|(rect, _)| rect).collect()
}

/// Work areas of the attached monitors, primary first
#[cfg(not(windows))]
pub fn current_work_areas() -> Vec<Rect> {
    Vec::new()
}
