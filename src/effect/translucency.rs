//! Uniform window translucency.
//!
//! Multiplies a configured opacity into every window paint. Mostly useful
//! as the canonical example of an effect that must opt windows out of
//! occlusion culling: translucent windows stop being full occluders, and
//! forgetting that drops visible content below them.

use crate::backend::Frame;
use crate::effect::{
    Effect, EffectContext, Feature, HookKinds, PaintFlow, WindowPaintCursor, WindowPaintData,
    WindowPaintFlags, WindowPrePaintData,
};
use crate::scene::WindowId;

pub struct TranslucencyEffect {
    opacity: f64,
}

impl TranslucencyEffect {
    pub fn new(opacity: f64) -> Self {
        Self {
            opacity: opacity.clamp(0., 1.),
        }
    }
}

impl Effect for TranslucencyEffect {
    fn name(&self) -> &str {
        "translucency"
    }

    fn capabilities(&self) -> HookKinds {
        HookKinds::PRE_PAINT_WINDOW | HookKinds::PAINT_WINDOW
    }

    fn provides(&self) -> &[Feature] {
        &[Feature::Translucency]
    }

    fn pre_paint_window(
        &mut self,
        _ctx: &mut EffectContext<'_>,
        _window: WindowId,
        data: &mut WindowPrePaintData,
    ) {
        if self.opacity < 1. {
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
        data.opacity *= self.opacity;
        cursor.forward(ctx, frame, window, data)
    }
}
