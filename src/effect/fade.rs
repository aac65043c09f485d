//! Window open and close fades.
//!
//! The close animation is what exercises the remnant machinery: the effect
//! retains the removed window and keeps painting it at decreasing opacity
//! until the animation finishes, then drops the reference so the scene can
//! free the slot.

use std::collections::HashMap;

use crate::animation::{Animation, Clock};
use crate::backend::Frame;
use crate::effect::{
    Effect, EffectContext, Feature, HookKinds, PaintFlow, WindowPaintCursor, WindowPaintData,
    WindowPaintFlags, WindowPrePaintData,
};
use crate::scene::{RemnantRef, WindowId};

struct Closing {
    anim: Animation,
    // Dropping this is what lets the scene free the window.
    _remnant: RemnantRef,
}

pub struct FadeEffect {
    clock: Clock,
    open: scrim_config::Animation,
    close: scrim_config::Animation,
    opening: HashMap<WindowId, Animation>,
    closing: HashMap<WindowId, Closing>,
}

impl FadeEffect {
    pub fn new(clock: Clock, animations: &scrim_config::Animations) -> Self {
        Self {
            clock,
            open: animations.window_open,
            close: animations.window_close,
            opening: HashMap::new(),
            closing: HashMap::new(),
        }
    }

    fn alpha(&self, window: WindowId) -> Option<f64> {
        if let Some(anim) = self.opening.get(&window) {
            return Some(anim.value());
        }
        self.closing.get(&window).map(|closing| closing.anim.value())
    }
}

impl Effect for FadeEffect {
    fn name(&self) -> &str {
        "fade"
    }

    fn capabilities(&self) -> HookKinds {
        HookKinds::PRE_PAINT_WINDOW | HookKinds::PAINT_WINDOW | HookKinds::POST_PAINT_WINDOW
    }

    fn provides(&self) -> &[Feature] {
        &[Feature::WindowAnimation]
    }

    fn window_added(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {
        self.opening.insert(
            window,
            Animation::new(self.clock.clone(), 0., 1., self.open),
        );
        ctx.scene.mark_fully_damaged(window);
    }

    fn window_closed(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {
        let Some(remnant) = ctx.scene.retain(window) else {
            return;
        };

        // A window closed mid-open fades out from wherever it got to.
        let from = self
            .opening
            .remove(&window)
            .map_or(1., |anim| anim.value());

        self.closing.insert(
            window,
            Closing {
                anim: Animation::new(self.clock.clone(), from, 0., self.close),
                _remnant: remnant,
            },
        );
        ctx.scene.mark_fully_damaged(window);
    }

    fn window_deleted(&mut self, _ctx: &mut EffectContext<'_>, window: WindowId) {
        self.opening.remove(&window);
        self.closing.remove(&window);
    }

    fn pre_paint_window(
        &mut self,
        _ctx: &mut EffectContext<'_>,
        window: WindowId,
        data: &mut WindowPrePaintData,
    ) {
        if self.alpha(window).is_some() {
            // A fading window blends with what is below it.
            data.flags |= WindowPaintFlags::TRANSLUCENT;
            data.opaque_region.clear();
        }
    }

    fn paint_window(
        &mut self,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        window: WindowId,
        data: &mut WindowPaintData,
        cursor: WindowPaintCursor<'_>,
    ) -> PaintFlow {
        if let Some(alpha) = self.alpha(window) {
            data.opacity *= alpha;
        }
        cursor.forward(ctx, frame, window, data)
    }

    fn post_paint_window(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {
        if let Some(anim) = self.opening.get(&window) {
            if anim.is_done() {
                self.opening.remove(&window);
            } else {
                ctx.scene.mark_fully_damaged(window);
            }
        }

        if let Some(closing) = self.closing.get(&window) {
            if closing.anim.is_done() {
                // Releases the remnant; the scene tears the window down
                // after this frame.
                self.closing.remove(&window);
                ctx.scene.mark_fully_damaged(window);
            } else {
                ctx.scene.mark_fully_damaged(window);
            }
        }
    }
}
