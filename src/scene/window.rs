//! Paintable windows.

use bitflags::bitflags;

use crate::backend::Texture;
use crate::utils::geometry::{Logical, Point, Rect};
use crate::utils::region::Region;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WindowFlags: u32 {
        /// Unmapped or otherwise not visible.
        const HIDDEN = 1;
        const MINIMIZED = 1 << 1;
        /// Painting suppressed, for example while screenshotting without it.
        const SKIP_PAINT = 1 << 2;
    }
}

/// Identifies a window slot in the scene.
///
/// Ids are never reused: a freed slot bumps its generation, so a stale id
/// held by an effect simply stops resolving instead of aliasing a newer
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId {
    pub(super) slot: u32,
    pub(super) generation: u32,
}

#[derive(Debug)]
pub struct Window {
    /// Position and size in the global logical space. Fractional, because
    /// effects may place windows between pixels mid-animation.
    geometry: Rect<f64, Logical>,
    opacity: f64,
    texture: Option<Texture>,
    /// Window-local region guaranteed fully opaque by the client.
    opaque_region: Region<Logical>,
    /// Window-local damage accumulated since the last paint.
    pending_damage: Region<Logical>,
    flags: WindowFlags,
}

impl Window {
    pub fn new(geometry: Rect<f64, Logical>) -> Self {
        Self {
            geometry,
            opacity: 1.,
            texture: None,
            opaque_region: Region::new(),
            pending_damage: Region::new(),
            flags: WindowFlags::empty(),
        }
    }

    pub fn geometry(&self) -> Rect<f64, Logical> {
        self.geometry
    }

    pub fn set_geometry(&mut self, geometry: Rect<f64, Logical>) {
        self.geometry = geometry;
    }

    /// Geometry expanded to whole pixels.
    pub fn bounds(&self) -> Rect<i32, Logical> {
        self.geometry.to_i32_outward()
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    pub fn set_opacity(&mut self, opacity: f64) {
        self.opacity = opacity.clamp(0., 1.);
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    /// Swaps in a newly imported texture, returning the previous one so the
    /// caller controls when its backend storage is released.
    pub fn attach_texture(&mut self, texture: Texture) -> Option<Texture> {
        self.texture.replace(texture)
    }

    pub fn opaque_region(&self) -> &Region<Logical> {
        &self.opaque_region
    }

    pub fn set_opaque_region(&mut self, region: Region<Logical>) {
        self.opaque_region = region;
    }

    pub fn flags(&self) -> WindowFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: WindowFlags) {
        self.flags = flags;
    }

    pub fn should_paint(&self) -> bool {
        self.flags.is_empty() && self.texture.is_some()
    }

    /// The fully opaque part of the window in global coordinates, used for
    /// occlusion culling. Empty as soon as the whole window is translucent.
    pub fn global_opaque_region(&self) -> Region<Logical> {
        if self.opacity < 1. || !self.should_paint() {
            return Region::new();
        }

        // Conservative: only whole pixels inside the window count.
        let origin = Point::new(self.geometry.loc.x.ceil() as i32, self.geometry.loc.y.ceil() as i32);
        self.opaque_region.translated(origin)
    }

    pub(super) fn add_damage(&mut self, region: &Region<Logical>) {
        self.pending_damage.union(region);
    }

    pub(super) fn take_damage(&mut self) -> Region<Logical> {
        std::mem::take(&mut self.pending_damage)
    }

    pub fn pending_damage(&self) -> &Region<Logical> {
        &self.pending_damage
    }
}
