//! Ordered effect dispatch.
//!
//! Effects run in ascending `position` order, ties broken by registration
//! order. A hook that panics disables its effect for the rest of the
//! session and the chain continues from the next link; one misbehaving
//! effect must not take the whole session down.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use crate::backend::Frame;
use crate::effect::paint_data::{
    ScreenPaintData, ScreenPrePaintData, WindowPaintData, WindowPrePaintData,
};
use crate::effect::{Effect, EffectContext, Feature, HookKinds};
use crate::scene::WindowId;

/// Proof that a paint hook made an explicit flow decision.
///
/// Constructible only via [`ScreenPaintCursor::forward`],
/// [`WindowPaintCursor::forward`] or the `intercept` counterparts.
#[must_use]
pub struct PaintFlow(FlowKind);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowKind {
    Forwarded,
    Intercepted,
}

impl PaintFlow {
    pub fn was_forwarded(&self) -> bool {
        self.0 == FlowKind::Forwarded
    }
}

/// Base painter invoked when the screen chain runs out of links.
pub type ScreenBase<'r> = &'r mut dyn FnMut(
    &mut EffectChain,
    &mut EffectContext<'_>,
    &mut Frame,
    &mut ScreenPaintData,
);

/// Base painter invoked when a window chain runs out of links.
pub type WindowBase<'r> =
    &'r mut dyn FnMut(&mut EffectContext<'_>, &mut Frame, WindowId, &mut WindowPaintData);

struct EffectSlot {
    /// Taken out while one of its hooks runs, so nested dispatch through a
    /// cursor never aliases the running effect.
    effect: Option<Box<dyn Effect>>,
    name: String,
    position: i32,
    seq: u32,
    enabled: bool,
    caps: HookKinds,
}

pub struct EffectChain {
    slots: Vec<EffectSlot>,
    next_seq: u32,
}

impl EffectChain {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_seq: 0,
        }
    }

    /// Registers an effect at the given chain position. Lower positions run
    /// earlier in every phase.
    pub fn register(&mut self, effect: Box<dyn Effect>, position: i32) {
        let name = effect.name().to_owned();
        let caps = effect.capabilities();
        debug!("registering effect {name} at position {position}");

        self.slots.push(EffectSlot {
            effect: Some(effect),
            name,
            position,
            seq: self.next_seq,
            enabled: true,
            caps,
        });
        self.next_seq += 1;
        self.sort();
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        for slot in &mut self.slots {
            if slot.name == name {
                slot.enabled = enabled;
            }
        }
        self.sort();
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.name == name && slot.enabled)
    }

    fn sort(&mut self) {
        self.slots.sort_by_key(|slot| (slot.position, slot.seq));
    }

    /// The first enabled effect providing `feature`, if any.
    pub fn provides(&self, feature: Feature) -> Option<&str> {
        self.slots
            .iter()
            .filter(|slot| slot.enabled)
            .find(|slot| {
                slot.effect
                    .as_ref()
                    .is_some_and(|effect| effect.provides().contains(&feature))
            })
            .map(|slot| slot.name.as_str())
    }

    /// Whether any active effect hooks into a paint phase; this blocks the
    /// direct-scanout fast path.
    pub fn has_active_paint_hooks(&self) -> bool {
        self.slots.iter().any(|slot| {
            slot.enabled
                && slot
                    .caps
                    .intersects(HookKinds::PAINT_SCREEN | HookKinds::PAINT_WINDOW)
        })
    }

    fn disable_slot(&mut self, index: usize, payload: &Box<dyn std::any::Any + Send>) {
        let slot = &mut self.slots[index];
        slot.enabled = false;

        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_owned());
        error!(
            "effect {} panicked ({message}); disabling it for this session",
            slot.name
        );
    }

    fn active(&self, index: usize, cap: HookKinds) -> bool {
        let slot = &self.slots[index];
        slot.enabled && slot.effect.is_some() && slot.caps.contains(cap)
    }

    fn first_active(&self, start: usize, cap: HookKinds) -> Option<usize> {
        (start..self.slots.len()).find(|&index| self.active(index, cap))
    }

    // =========================================================================
    // Simple hooks: run every active effect in order
    // =========================================================================

    fn dispatch_simple(&mut self, cap: HookKinds, mut call: impl FnMut(&mut dyn Effect)) {
        let mut index = 0;
        while index < self.slots.len() {
            if !self.active(index, cap) {
                index += 1;
                continue;
            }

            let mut effect = self.slots[index].effect.take().unwrap();
            let result = panic::catch_unwind(AssertUnwindSafe(|| call(&mut *effect)));
            self.slots[index].effect = Some(effect);

            if let Err(payload) = result {
                self.disable_slot(index, &payload);
            }
            index += 1;
        }
    }

    pub fn window_added(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {
        // Lifecycle notifications go to every enabled effect.
        self.dispatch_simple(HookKinds::empty(), |effect| {
            effect.window_added(ctx, window)
        });
    }

    pub fn window_closed(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {
        self.dispatch_simple(HookKinds::empty(), |effect| {
            effect.window_closed(ctx, window)
        });
    }

    pub fn window_deleted(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {
        self.dispatch_simple(HookKinds::empty(), |effect| {
            effect.window_deleted(ctx, window)
        });
    }

    pub fn pre_paint_screen(&mut self, ctx: &mut EffectContext<'_>, data: &mut ScreenPrePaintData) {
        let _span = tracy_client::span!("EffectChain::pre_paint_screen");
        self.dispatch_simple(HookKinds::PRE_PAINT_SCREEN, |effect| {
            effect.pre_paint_screen(ctx, data)
        });
    }

    pub fn post_paint_screen(&mut self, ctx: &mut EffectContext<'_>) {
        self.dispatch_simple(HookKinds::POST_PAINT_SCREEN, |effect| {
            effect.post_paint_screen(ctx)
        });
    }

    pub fn pre_paint_window(
        &mut self,
        ctx: &mut EffectContext<'_>,
        window: WindowId,
        data: &mut WindowPrePaintData,
    ) {
        self.dispatch_simple(HookKinds::PRE_PAINT_WINDOW, |effect| {
            effect.pre_paint_window(ctx, window, data)
        });
    }

    pub fn post_paint_window(&mut self, ctx: &mut EffectContext<'_>, window: WindowId) {
        self.dispatch_simple(HookKinds::POST_PAINT_WINDOW, |effect| {
            effect.post_paint_window(ctx, window)
        });
    }

    // =========================================================================
    // Paint hooks: middleware pipeline
    // =========================================================================

    pub fn paint_screen(
        &mut self,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        data: &mut ScreenPaintData,
        base: ScreenBase<'_>,
    ) {
        let _span = tracy_client::span!("EffectChain::paint_screen");
        self.paint_screen_from(0, ctx, frame, data, base);
    }

    fn paint_screen_from(
        &mut self,
        start: usize,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        data: &mut ScreenPaintData,
        base: ScreenBase<'_>,
    ) {
        let Some(index) = self.first_active(start, HookKinds::PAINT_SCREEN) else {
            base(self, ctx, frame, data);
            return;
        };

        let mut effect = self.slots[index].effect.take().unwrap();
        let forwarded = Cell::new(false);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let cursor = ScreenPaintCursor {
                chain: &mut *self,
                next: index + 1,
                base: &mut *base,
                forwarded: &forwarded,
            };
            effect.paint_screen(ctx, frame, data, cursor)
        }));
        self.slots[index].effect = Some(effect);

        if let Err(payload) = result {
            self.disable_slot(index, &payload);
            // If the effect died before forwarding, the rest of the chain
            // still has to produce this frame.
            if !forwarded.get() {
                self.paint_screen_from(index + 1, ctx, frame, data, base);
            }
        }
    }

    pub fn paint_window(
        &mut self,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        window: WindowId,
        data: &mut WindowPaintData,
        base: WindowBase<'_>,
    ) {
        self.paint_window_from(0, ctx, frame, window, data, base);
    }

    fn paint_window_from(
        &mut self,
        start: usize,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        window: WindowId,
        data: &mut WindowPaintData,
        base: WindowBase<'_>,
    ) {
        let Some(index) = self.first_active(start, HookKinds::PAINT_WINDOW) else {
            base(ctx, frame, window, data);
            return;
        };

        let mut effect = self.slots[index].effect.take().unwrap();
        let forwarded = Cell::new(false);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let cursor = WindowPaintCursor {
                chain: &mut *self,
                next: index + 1,
                base: &mut *base,
                forwarded: &forwarded,
            };
            effect.paint_window(ctx, frame, window, data, cursor)
        }));
        self.slots[index].effect = Some(effect);

        if let Err(payload) = result {
            self.disable_slot(index, &payload);
            if !forwarded.get() {
                self.paint_window_from(index + 1, ctx, frame, window, data, base);
            }
        }
    }
}

// =============================================================================
// Cursors
// =============================================================================

pub struct ScreenPaintCursor<'a> {
    chain: &'a mut EffectChain,
    next: usize,
    base: ScreenBase<'a>,
    forwarded: &'a Cell<bool>,
}

impl ScreenPaintCursor<'_> {
    /// Runs the rest of the chain and the base painter.
    pub fn forward(
        self,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        data: &mut ScreenPaintData,
    ) -> PaintFlow {
        self.forwarded.set(true);
        self.chain
            .paint_screen_from(self.next, ctx, frame, data, self.base);
        PaintFlow(FlowKind::Forwarded)
    }

    /// Ends the chain here: nothing below this effect paints this pass.
    pub fn intercept(self) -> PaintFlow {
        PaintFlow(FlowKind::Intercepted)
    }
}

pub struct WindowPaintCursor<'a> {
    chain: &'a mut EffectChain,
    next: usize,
    base: WindowBase<'a>,
    forwarded: &'a Cell<bool>,
}

impl WindowPaintCursor<'_> {
    pub fn forward(
        self,
        ctx: &mut EffectContext<'_>,
        frame: &mut Frame,
        window: WindowId,
        data: &mut WindowPaintData,
    ) -> PaintFlow {
        self.forwarded.set(true);
        self.chain
            .paint_window_from(self.next, ctx, frame, window, data, self.base);
        PaintFlow(FlowKind::Forwarded)
    }

    pub fn intercept(self) -> PaintFlow {
        PaintFlow(FlowKind::Intercepted)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;
    use crate::backend::{Backend, SoftwareBackend};
    use crate::effect::paint_data::ScreenPaintFlags;
    use crate::output::{Mode, Output};
    use crate::scene::Scene;
    use crate::utils::geometry::Size;
    use crate::utils::region::Region;

    type Log = Rc<RefCell<Vec<String>>>;

    struct ProbeEffect {
        name: String,
        log: Log,
        intercept: bool,
        panic_in_paint: bool,
    }

    impl ProbeEffect {
        fn new(name: &str, log: &Log) -> Self {
            Self {
                name: name.to_owned(),
                log: log.clone(),
                intercept: false,
                panic_in_paint: false,
            }
        }
    }

    impl Effect for ProbeEffect {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> HookKinds {
            HookKinds::PRE_PAINT_SCREEN | HookKinds::PAINT_SCREEN
        }

        fn pre_paint_screen(
            &mut self,
            _ctx: &mut EffectContext<'_>,
            _data: &mut ScreenPrePaintData,
        ) {
            self.log.borrow_mut().push(format!("pre:{}", self.name));
        }

        fn paint_screen(
            &mut self,
            ctx: &mut EffectContext<'_>,
            frame: &mut Frame,
            data: &mut ScreenPaintData,
            cursor: ScreenPaintCursor<'_>,
        ) -> PaintFlow {
            self.log.borrow_mut().push(format!("paint:{}", self.name));
            if self.panic_in_paint {
                panic!("probe effect panic");
            }
            if self.intercept {
                cursor.intercept()
            } else {
                cursor.forward(ctx, frame, data)
            }
        }
    }

    fn test_frame() -> (Backend, Output, Frame) {
        let mut backend = Backend::Software(SoftwareBackend::new());
        let output = Output::new("TEST-1", Mode::new(Size::new(64, 64), Some(60.)));
        backend.add_output(&output);
        let frame = backend.begin_frame(&output).unwrap();
        (backend, output, frame)
    }

    fn run_paint_screen(chain: &mut EffectChain, log: &Log) {
        let mut scene = Scene::new();
        let mut ctx = EffectContext {
            scene: &mut scene,
            now: Duration::ZERO,
        };
        let (_backend, output, mut frame) = test_frame();
        let mut data = ScreenPaintData::new(output);

        let log = log.clone();
        let mut base = move |_chain: &mut EffectChain,
                             _ctx: &mut EffectContext<'_>,
                             _frame: &mut Frame,
                             _data: &mut ScreenPaintData| {
            log.borrow_mut().push("base".to_owned());
        };
        chain.paint_screen(&mut ctx, &mut frame, &mut data, &mut base);
    }

    #[test]
    fn dispatch_order_is_ascending_by_position() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = EffectChain::new();
        chain.register(Box::new(ProbeEffect::new("seventy", &log)), 70);
        chain.register(Box::new(ProbeEffect::new("twentyone", &log)), 21);
        chain.register(Box::new(ProbeEffect::new("zero", &log)), 0);

        let mut scene = Scene::new();
        let mut ctx = EffectContext {
            scene: &mut scene,
            now: Duration::ZERO,
        };
        let mut data = ScreenPrePaintData {
            damage: Region::new(),
            flags: ScreenPaintFlags::empty(),
        };
        chain.pre_paint_screen(&mut ctx, &mut data);

        assert_eq!(
            *log.borrow(),
            ["pre:zero", "pre:twentyone", "pre:seventy"],
        );
    }

    #[test]
    fn ties_break_by_registration_order() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = EffectChain::new();
        chain.register(Box::new(ProbeEffect::new("first", &log)), 5);
        chain.register(Box::new(ProbeEffect::new("second", &log)), 5);

        run_paint_screen(&mut chain, &log);

        assert_eq!(
            *log.borrow(),
            ["paint:first", "paint:second", "base"],
        );
    }

    #[test]
    fn interception_terminates_the_chain() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = EffectChain::new();
        let mut interceptor = ProbeEffect::new("interceptor", &log);
        interceptor.intercept = true;
        chain.register(Box::new(interceptor), 0);
        chain.register(Box::new(ProbeEffect::new("below", &log)), 10);

        run_paint_screen(&mut chain, &log);

        // Neither the rest of the chain nor the base painter ran.
        assert_eq!(*log.borrow(), ["paint:interceptor"]);
    }

    #[test]
    fn panicking_effect_is_disabled_for_the_session() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = EffectChain::new();
        let mut broken = ProbeEffect::new("broken", &log);
        broken.panic_in_paint = true;
        chain.register(Box::new(broken), 0);
        chain.register(Box::new(ProbeEffect::new("survivor", &log)), 10);

        run_paint_screen(&mut chain, &log);

        // The chain continued past the fault.
        assert_eq!(
            *log.borrow(),
            ["paint:broken", "paint:survivor", "base"],
        );
        assert!(!chain.is_enabled("broken"));
        assert!(chain.is_enabled("survivor"));

        // And the dead effect never runs again.
        log.borrow_mut().clear();
        run_paint_screen(&mut chain, &log);
        assert_eq!(*log.borrow(), ["paint:survivor", "base"]);
    }

    #[test]
    fn provides_reports_enabled_effects_only() {
        struct Magnifier;
        impl Effect for Magnifier {
            fn name(&self) -> &str {
                "magnifier"
            }
            fn capabilities(&self) -> HookKinds {
                HookKinds::PAINT_SCREEN
            }
            fn provides(&self) -> &[Feature] {
                &[Feature::Magnification]
            }
        }

        let mut chain = EffectChain::new();
        chain.register(Box::new(Magnifier), 0);
        assert_eq!(chain.provides(Feature::Magnification), Some("magnifier"));

        chain.set_enabled("magnifier", false);
        assert_eq!(chain.provides(Feature::Magnification), None);
    }
}
