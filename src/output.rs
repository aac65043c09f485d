//! Output (connected display) handles.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::time::Duration;

use crate::utils::geometry::{Logical, Physical, Rect, Size};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mode {
    pub size: Size<i32, Physical>,
    pub refresh_interval: Option<Duration>,
}

impl Mode {
    pub fn new(size: Size<i32, Physical>, refresh_hz: Option<f64>) -> Self {
        let refresh_interval = refresh_hz
            .filter(|hz| hz.is_finite() && *hz > 0.)
            .map(|hz| Duration::from_secs_f64(1. / hz));
        Self {
            size,
            refresh_interval,
        }
    }
}

/// Cheap-to-clone handle to one output.
///
/// Equality and hashing are identity-based, so outputs can key hash maps
/// even while their geometry or mode changes.
#[derive(Clone)]
pub struct Output {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    name: String,
    geometry: Rect<i32, Logical>,
    scale: f64,
    mode: Mode,
    enabled: bool,
}

impl Output {
    pub fn new(name: impl Into<String>, mode: Mode) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                name: name.into(),
                geometry: Rect::from_size(Size::new(
                    mode.size.w,
                    mode.size.h,
                )),
                scale: 1.,
                mode,
                enabled: true,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// Position and size in the global logical space.
    pub fn geometry(&self) -> Rect<i32, Logical> {
        self.inner.borrow().geometry
    }

    pub fn set_geometry(&self, geometry: Rect<i32, Logical>) {
        self.inner.borrow_mut().geometry = geometry;
    }

    pub fn scale(&self) -> f64 {
        self.inner.borrow().scale
    }

    pub fn set_scale(&self, scale: f64) {
        if !scale.is_finite() || scale <= 0. {
            warn!("ignoring invalid output scale {scale}");
            return;
        }

        let mut inner = self.inner.borrow_mut();
        inner.scale = scale;
        let logical = Size::new(
            (f64::from(inner.mode.size.w) / scale).round() as i32,
            (f64::from(inner.mode.size.h) / scale).round() as i32,
        );
        inner.geometry.size = logical;
    }

    pub fn mode(&self) -> Mode {
        self.inner.borrow().mode
    }

    pub fn set_mode(&self, mode: Mode) {
        let mut inner = self.inner.borrow_mut();
        inner.mode = mode;
        let scale = inner.scale;
        inner.geometry.size = Size::new(
            (f64::from(mode.size.w) / scale).round() as i32,
            (f64::from(mode.size.h) / scale).round() as i32,
        );
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.inner.borrow().mode.refresh_interval
    }

    pub fn enabled(&self) -> bool {
        self.inner.borrow().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.borrow_mut().enabled = enabled;
    }

    pub fn physical_size(&self) -> Size<i32, Physical> {
        self.inner.borrow().mode.size
    }
}

impl PartialEq for Output {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Output {}

impl Hash for Output {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Output")
            .field("name", &inner.name)
            .field("geometry", &inner.geometry)
            .field("scale", &inner.scale)
            .finish_non_exhaustive()
    }
}
