//! Paint data threaded through the effect chain.
//!
//! Every value here is recomputed per frame; an effect must never cache
//! regions or geometry across frames.

use bitflags::bitflags;

use crate::output::Output;
use crate::utils::geometry::{Logical, Point};
use crate::utils::region::Region;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScreenPaintFlags: u32 {
        /// An effect transforms the whole screen; occlusion culling and the
        /// scanout fast path are off and the full output repaints.
        const TRANSFORMED = 1;
        /// Paint the background even under opaque windows.
        const BACKGROUND_FIRST = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WindowPaintFlags: u32 {
        /// The window will blend; it cannot occlude anything.
        const TRANSLUCENT = 1;
        /// An effect moves or scales this window this frame.
        const TRANSFORMED = 1 << 1;
        /// Keep windows below painting even where this window is opaque.
        const DISABLE_OCCLUSION = 1 << 2;
    }
}

/// Screen-level pre-paint state.
#[derive(Debug)]
pub struct ScreenPrePaintData {
    /// Damage to repaint this frame, in global coordinates. Effects may
    /// enlarge it to cover animation extents.
    pub damage: Region<Logical>,
    pub flags: ScreenPaintFlags,
}

/// Window-level pre-paint state.
#[derive(Debug)]
pub struct WindowPrePaintData {
    /// Region the window will paint, in global coordinates.
    pub paint_region: Region<Logical>,
    /// Region treated as fully opaque for occlusion culling, in global
    /// coordinates. Effects introducing transparency must clear this or
    /// content below gets culled away.
    pub opaque_region: Region<Logical>,
    pub flags: WindowPaintFlags,
}

/// Screen-level paint transform, applied to every window.
#[derive(Debug, Clone)]
pub struct ScreenPaintData {
    /// Extra translation in logical output-local coordinates.
    pub offset: Point<f64, Logical>,
    /// Scale around the output origin.
    pub scale: f64,
    pub output: Output,
}

impl ScreenPaintData {
    pub fn new(output: Output) -> Self {
        Self {
            offset: Point::new(0., 0.),
            scale: 1.,
            output,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.offset == Point::new(0., 0.) && self.scale == 1.
    }
}

/// Window-level paint parameters.
#[derive(Debug, Clone)]
pub struct WindowPaintData {
    /// Extra translation in logical coordinates.
    pub offset: Point<f64, Logical>,
    /// Scale around the window's own origin.
    pub scale: f64,
    /// Final opacity; effects multiply into this.
    pub opacity: f64,
}

impl WindowPaintData {
    pub fn new(opacity: f64) -> Self {
        Self {
            offset: Point::new(0., 0.),
            scale: 1.,
            opacity,
        }
    }
}
