//! Screen magnification.
//!
//! Scales the whole output around its center by mutating the screen paint
//! data and forwarding, so every effect below it (and the base painter)
//! composites into the transformed space.

use crate::backend::Frame;
use crate::effect::{
    Effect, EffectContext, Feature, HookKinds, PaintFlow, ScreenPaintCursor, ScreenPaintData,
    ScreenPaintFlags, ScreenPrePaintData,
};
use crate::utils::geometry::{Logical, Point};

pub struct ZoomEffect {
    factor: f64,
    active: bool,
}

impl ZoomEffect {
    pub fn new(factor: f64) -> Self {
        Self {
            factor: factor.max(1.),
            active: true,
        }
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn is_zooming(&self) -> bool {
        self.active && self.factor > 1.
    }
}

impl Effect for ZoomEffect {
    fn name(&self) -> &str {
        "zoom"
    }

    fn capabilities(&self) -> HookKinds {
        HookKinds::PRE_PAINT_SCREEN | HookKinds::PAINT_SCREEN
    }

    fn provides(&self) -> &[Feature] {
        &[Feature::Magnification]
    }

    fn pre_paint_screen(&mut self, _ctx: &mut EffectContext<'_>, data: &mut ScreenPrePaintData) {
        if self.is_zooming() {
            // Scaled content moves under every pixel; the renderer widens
            // the repaint to the whole output for transformed screens.
            data.flags |= ScreenPaintFlags::TRANSFORMED;
        }
    }

    fn paint_screen(
        &mut self,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        data: &mut ScreenPaintData,
        cursor: ScreenPaintCursor<'_>,
    ) -> PaintFlow {
        if self.is_zooming() {
            let size = data.output.geometry().size.to_f64();
            let center: Point<f64, Logical> = Point::new(size.w / 2., size.h / 2.);

            // Scale around the output center.
            data.scale *= self.factor;
            data.offset += Point::new(
                center.x * (1. - self.factor),
                center.y * (1. - self.factor),
            );
        }

        cursor.forward(ctx, frame, data)
    }
}
