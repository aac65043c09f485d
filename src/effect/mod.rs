//! Effects and the effect chain.
//!
//! An effect hooks into the paint pipeline at up to six points: the
//! pre-paint, paint and post-paint phases, each at screen and window level.
//! It declares the hooks it implements through [`Effect::capabilities`];
//! the chain never calls the others.
//!
//! The paint hooks form an explicit middleware pipeline. A paint hook
//! receives a cursor and must either `forward` it (running the rest of the
//! chain and ultimately the base painter) or `intercept` it (producing the
//! output itself). The [`PaintFlow`] return value can only be constructed
//! through one of those two calls, so silently dropping the rest of the
//! chain is not expressible.

use std::time::Duration;

use bitflags::bitflags;

use crate::backend::Frame;
use crate::scene::{Scene, WindowId};

pub mod chain;
pub mod fade;
pub mod paint_data;
pub mod translucency;
pub mod zoom;

pub use chain::{EffectChain, PaintFlow, ScreenPaintCursor, WindowPaintCursor};
pub use paint_data::{
    ScreenPaintData, ScreenPaintFlags, ScreenPrePaintData, WindowPaintData, WindowPaintFlags,
    WindowPrePaintData,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HookKinds: u32 {
        const PRE_PAINT_SCREEN = 1;
        const PAINT_SCREEN = 1 << 1;
        const POST_PAINT_SCREEN = 1 << 2;
        const PRE_PAINT_WINDOW = 1 << 3;
        const PAINT_WINDOW = 1 << 4;
        const POST_PAINT_WINDOW = 1 << 5;
    }
}

/// Capabilities other effects can query for, to avoid doubling up on work
/// or to build on top of another effect's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Magnification,
    WindowAnimation,
    Translucency,
}

/// State effects get access to from every hook.
///
/// There is deliberately no ambient way to reach the compositor; everything
/// an effect may touch is here or arrives as hook arguments.
pub struct EffectContext<'a> {
    pub scene: &'a mut Scene,
    /// The time the frame under construction is expected to present, or the
    /// current time outside a paint pass.
    pub now: Duration,
}

#[allow(unused_variables)]
pub trait Effect {
    fn name(&self) -> &str;

    /// Hook kinds this effect implements.
    fn capabilities(&self) -> HookKinds;

    fn provides(&self) -> &[Feature] {
        &[]
    }

    // Lifecycle notifications.

    fn window_added(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {}

    /// The window was removed from the stack. Taking a
    /// [`RemnantRef`](crate::scene::RemnantRef) here keeps it paintable for
    /// a removal animation.
    fn window_closed(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {}

    /// Final teardown; any handle kept for this window is now stale.
    fn window_deleted(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {}

    // Screen hooks.

    fn pre_paint_screen(&mut self, ctx: &mut EffectContext<'_>, data: &mut ScreenPrePaintData) {}

    fn paint_screen(
        &mut self,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        data: &mut ScreenPaintData,
        cursor: ScreenPaintCursor<'_>,
    ) -> PaintFlow {
        cursor.forward(ctx, frame, data)
    }

    fn post_paint_screen(&mut self, ctx: &mut EffectContext<'_>) {}

    // Window hooks, called once per window in stacking order.

    fn pre_paint_window(
        &mut self,
        ctx: &mut EffectContext<'_>,
        window: WindowId,
        data: &mut WindowPrePaintData,
    ) {
    }

    fn paint_window(
        &mut self,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        window: WindowId,
        data: &mut WindowPaintData,
        cursor: WindowPaintCursor<'_>,
    ) -> PaintFlow {
        cursor.forward(ctx, frame, window, data)
    }

    fn post_paint_window(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {}
}
