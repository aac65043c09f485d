//! The compositor core: output lifecycle, the per-output render loop and
//! the client-facing operations the protocol layer calls into.
//!
//! Everything runs on one thread inside a calloop event loop. The render
//! loop per output is a small state machine ([`RedrawState`]): damage
//! queues a redraw, the redraw composites and submits a frame, the vblank
//! timer reports presentation and either goes idle or queues the next
//! frame.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use calloop::timer::{TimeoutAction, Timer};
use calloop::LoopHandle;
use scrim_config::Config;

use crate::animation::Clock;
use crate::backend::{Backend, ImportError};
use crate::buffer::BufferSource;
use crate::effect::fade::FadeEffect;
use crate::effect::translucency::TranslucencyEffect;
use crate::effect::zoom::ZoomEffect;
use crate::effect::{EffectChain, EffectContext};
use crate::frame_clock::FrameClock;
use crate::output::Output;
use crate::scene::{Scene, Window, WindowFlags, WindowId};
use crate::utils::geometry::{Logical, Point, Rect};
use crate::utils::get_monotonic_time;
use crate::utils::region::Region;

pub mod frame_callbacks;
pub mod render;
#[cfg(test)]
mod tests;
pub mod types;

pub use frame_callbacks::{FeedbackFlags, FrameCallback, PresentationFeedback};
pub use types::{InFlightFrame, OutputState, PaintStats, RedrawState, RenderResult};

/// Everything the event loop dispatches into.
pub struct State {
    pub backend: Backend,
    pub scrim: Scrim,
}

impl State {
    pub fn new(config: Config, backend: Backend, event_loop: LoopHandle<'static, State>) -> Self {
        Self {
            backend,
            scrim: Scrim::new(config, event_loop),
        }
    }

    /// Runs queued redraws; called after every event loop dispatch.
    pub fn refresh_and_redraw(&mut self) {
        self.scrim.redraw_queued_outputs(&mut self.backend);
    }

    pub fn add_output(&mut self, output: &Output) {
        self.scrim.add_output(&mut self.backend, output);
    }

    pub fn remove_output(&mut self, output: &Output) {
        self.scrim.remove_output(&mut self.backend, output);
    }

    pub fn surface_commit(
        &mut self,
        window: WindowId,
        buffer: &BufferSource,
        damage: &Region<Logical>,
    ) -> Result<(), ImportError> {
        self.scrim
            .surface_commit(&mut self.backend, window, buffer, damage)
    }
}

pub struct Scrim {
    pub config: Rc<RefCell<Config>>,
    pub event_loop: LoopHandle<'static, State>,
    pub clock: Clock,
    pub scene: Scene,
    pub effects: EffectChain,
    outputs: HashMap<Output, OutputState>,
    sorted_outputs: Vec<Output>,
    frame_callback_state: HashMap<WindowId, (Output, u32)>,
    pending_frame_callbacks: VecDeque<FrameCallback>,
    pending_presentation_feedback: VecDeque<PresentationFeedback>,
}

impl Scrim {
    pub fn new(config: Config, event_loop: LoopHandle<'static, State>) -> Self {
        let clock = Clock::new();
        clock.set_slowdown(config.animations.slowdown);

        let mut effects = EffectChain::new();
        if !config.animations.off {
            if let Some(fade) = config.effects.fade {
                effects.register(
                    Box::new(FadeEffect::new(clock.clone(), &config.animations)),
                    fade.position,
                );
            }
        }
        if let Some(zoom) = config.effects.zoom {
            effects.register(Box::new(ZoomEffect::new(zoom.factor)), zoom.position);
        }
        if let Some(translucency) = config.effects.translucency {
            effects.register(
                Box::new(TranslucencyEffect::new(translucency.opacity)),
                translucency.position,
            );
        }

        Self {
            config: Rc::new(RefCell::new(config)),
            event_loop,
            clock,
            scene: Scene::new(),
            effects,
            outputs: HashMap::new(),
            sorted_outputs: Vec::new(),
            frame_callback_state: HashMap::new(),
            pending_frame_callbacks: VecDeque::new(),
            pending_presentation_feedback: VecDeque::new(),
        }
    }

    pub fn output_state(&self, output: &Output) -> Option<&OutputState> {
        self.outputs.get(output)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.sorted_outputs.iter()
    }

    // =========================================================================
    // Output lifecycle
    // =========================================================================

    /// Brings up a connected output: applies its configuration, allocates
    /// backend resources and starts its render loop.
    pub fn add_output(&mut self, backend: &mut Backend, output: &Output) {
        let mut vrr = false;
        {
            let config = self.config.borrow();
            if let Some(entry) = config.outputs.iter().find(|o| o.name == output.name()) {
                if entry.off {
                    info!("output {} is disabled by config", output.name());
                    output.set_enabled(false);
                    return;
                }
                if let Some(mode) = entry.mode {
                    output.set_mode(crate::output::Mode::new(
                        crate::utils::geometry::Size::new(
                            i32::from(mode.width),
                            i32::from(mode.height),
                        ),
                        mode.refresh,
                    ));
                }
                if let Some(scale) = entry.scale {
                    output.set_scale(scale);
                }
                vrr = entry.variable_refresh_rate;

                let mut geometry = output.geometry();
                if let Some(position) = entry.position {
                    geometry.loc = Point::new(position.x, position.y);
                    output.set_geometry(geometry);
                    warn_on_overlap(&self.sorted_outputs, output);
                } else {
                    self.place_right_of_everything(output);
                }
            } else {
                self.place_right_of_everything(output);
            }
        }

        debug!(
            "adding output {} at {:?} (scale {})",
            output.name(),
            output.geometry(),
            output.scale(),
        );

        backend.add_output(output);
        self.scene.add_output(output);

        let timing = backend.query_vblank_timing(output);
        self.outputs.insert(
            output.clone(),
            OutputState::new(FrameClock::new(timing.refresh_interval, vrr)),
        );
        self.sorted_outputs.push(output.clone());
        self.sorted_outputs.sort_by_key(|o| o.name());

        self.queue_redraw(output);
    }

    fn place_right_of_everything(&self, output: &Output) {
        let x = self
            .sorted_outputs
            .iter()
            .map(|other| other.geometry().right())
            .max()
            .unwrap_or(0);

        let mut geometry = output.geometry();
        geometry.loc = Point::new(x, 0);
        output.set_geometry(geometry);
    }

    /// Tears down a disconnected output.
    ///
    /// Any pending timer for an in-flight frame is cancelled first, so no
    /// callback can touch the freed state.
    pub fn remove_output(&mut self, backend: &mut Backend, output: &Output) {
        let Some(state) = self.outputs.remove(output) else {
            warn!("remove_output: unknown output {}", output.name());
            return;
        };

        match state.redraw_state {
            RedrawState::Idle | RedrawState::Queued => (),
            RedrawState::WaitingForVBlank { token, .. }
            | RedrawState::WaitingForEstimatedVBlank(token)
            | RedrawState::WaitingForEstimatedVBlankAndQueued(token) => {
                self.event_loop.remove(token);
            }
        }

        self.sorted_outputs.retain(|other| other != output);
        self.scene.remove_output(output);
        backend.remove_output(output);
    }

    // =========================================================================
    // Client-facing operations
    // =========================================================================

    /// A client surface was mapped; creates its window at the top of the
    /// stack.
    pub fn map_window(&mut self, geometry: Rect<f64, Logical>) -> WindowId {
        let id = self.scene.add_window(Window::new(geometry));

        let mut ctx = EffectContext {
            scene: &mut self.scene,
            now: self.clock.now(),
        };
        self.effects.window_added(&mut ctx, id);

        self.queue_redraws_for_pending_damage();
        id
    }

    /// "Surface committed with buffer B and damage region R for window W".
    ///
    /// On import failure the window keeps its previous contents and skips
    /// painting new ones; the commit is otherwise still accounted.
    pub fn surface_commit(
        &mut self,
        backend: &mut Backend,
        window: WindowId,
        buffer: &BufferSource,
        damage: &Region<Logical>,
    ) -> Result<(), ImportError> {
        if self.scene.window(window).is_none() {
            debug!("commit for unknown window {window:?}");
            return Ok(());
        }

        let reuse = self
            .scene
            .window(window)
            .and_then(|w| w.texture().cloned());

        match backend.import_buffer(buffer, reuse.as_ref()) {
            Ok(texture) => {
                let Some(win) = self.scene.window_mut(window) else {
                    return Ok(());
                };
                let size = win.geometry().size;
                win.attach_texture(texture);

                // Without an alpha channel the whole buffer occludes.
                if buffer.format().has_alpha() {
                    win.set_opaque_region(Region::new());
                } else {
                    win.set_opaque_region(Region::from_rect(
                        Rect::from_loc_and_size((0., 0.), (size.w, size.h)).to_i32_outward(),
                    ));
                }

                self.scene.mark_damaged(window, damage);
                self.queue_redraws_for_pending_damage();
                Ok(())
            }
            Err(err) => {
                warn!("error importing buffer for {window:?}: {err}");
                // Previous texture stays; repaint is still wanted so stale
                // content gets refreshed once the client recovers.
                self.scene.mark_damaged(window, damage);
                self.queue_redraws_for_pending_damage();
                Err(err)
            }
        }
    }

    /// "Surface destroyed". The window leaves the stack immediately, but
    /// effects may keep it as a remnant for their removal animations.
    pub fn surface_destroyed(&mut self, window: WindowId) {
        let mut ctx = EffectContext {
            scene: &mut self.scene,
            now: self.clock.now(),
        };
        self.effects.window_closed(&mut ctx, window);

        self.scene.remove_window(window);

        if self.scene.window(window).is_none() {
            // No effect retained it; finish teardown right away.
            let mut ctx = EffectContext {
                scene: &mut self.scene,
                now: self.clock.now(),
            };
            self.effects.window_deleted(&mut ctx, window);
            self.frame_callback_state.remove(&window);
        }

        self.queue_redraws_for_pending_damage();
    }

    /// Reorders a window in the stack; 0 is the bottom.
    pub fn restack(&mut self, window: WindowId, position: usize) {
        self.scene.restack(window, position);
        self.queue_redraws_for_pending_damage();
    }

    /// Updates visibility flags (hidden, minimized, skip-paint).
    pub fn set_window_flags(&mut self, window: WindowId, flags: WindowFlags) {
        let Some(win) = self.scene.window_mut(window) else {
            return;
        };
        if win.flags() == flags {
            return;
        }
        let bounds = win.bounds();
        win.set_flags(flags);

        // Covered or revealed content needs a repaint either way.
        self.scene.damage_map().damage(&Region::from_rect(bounds));
        self.queue_redraws_for_pending_damage();
    }

    pub fn move_window(&mut self, window: WindowId, geometry: Rect<f64, Logical>) {
        let Some(win) = self.scene.window_mut(window) else {
            return;
        };
        let old_bounds = win.bounds();
        win.set_geometry(geometry);
        let new_bounds = win.bounds();

        let mut damage = Region::from_rect(old_bounds);
        damage.add_rect(new_bounds);
        self.scene.damage_map().damage(&damage);
        self.queue_redraws_for_pending_damage();
    }

    // =========================================================================
    // Redraw scheduling
    // =========================================================================

    /// Schedules an immediate redraw if one is not already scheduled.
    pub fn queue_redraw(&mut self, output: &Output) {
        if let Some(state) = self.outputs.get_mut(output) {
            state.redraw_state = mem::take(&mut state.redraw_state).queue_redraw();
        }
    }

    pub fn queue_redraw_all(&mut self) {
        for state in self.outputs.values_mut() {
            state.redraw_state = mem::take(&mut state.redraw_state).queue_redraw();
        }
    }

    fn queue_redraws_for_pending_damage(&mut self) {
        for (output, state) in &mut self.outputs {
            if self.scene.damage_pending(output) {
                state.redraw_state = mem::take(&mut state.redraw_state).queue_redraw();
            }
        }
    }

    pub fn redraw_queued_outputs(&mut self, backend: &mut Backend) {
        let _span = tracy_client::span!("Scrim::redraw_queued_outputs");

        while let Some((output, _)) = self.outputs.iter().find(|(_, state)| {
            matches!(
                state.redraw_state,
                RedrawState::Queued | RedrawState::WaitingForEstimatedVBlankAndQueued(_)
            )
        }) {
            let output = output.clone();
            self.redraw(backend, &output);
        }
    }

    /// Composites and submits one frame for the output.
    pub fn redraw(&mut self, backend: &mut Backend, output: &Output) {
        let _span = tracy_client::span!("Scrim::redraw");

        let state = self.outputs.get_mut(output).unwrap();
        assert!(matches!(
            state.redraw_state,
            RedrawState::Queued | RedrawState::WaitingForEstimatedVBlankAndQueued(_)
        ));

        let now = get_monotonic_time();
        let target_presentation_time = state.frame_clock.next_presentation_time(now);

        // Animations sample the time the frame will be on screen.
        self.clock.set(target_presentation_time);

        let res = if output.enabled() {
            self.render_output(backend, output, target_presentation_time)
        } else {
            RenderResult::Skipped
        };

        // Effects released remnants during post-paint; finish teardown.
        self.purge_expired_remnants();

        let state = self.outputs.get_mut(output).unwrap();
        state.unfinished_animations_remain = self.scene.damage_pending(output);

        match res {
            RenderResult::Submitted => {
                // The frame is queued; a vblank timer stands in for the
                // display's presentation notification.
                let delay = target_presentation_time.saturating_sub(get_monotonic_time());
                let timer = Timer::from_duration(delay);
                let timer_output = output.clone();
                let token = self
                    .event_loop
                    .insert_source(timer, move |_, _, state| {
                        state.scrim.on_vblank(&timer_output);
                        TimeoutAction::Drop
                    })
                    .unwrap();

                let new_state = RedrawState::WaitingForVBlank {
                    token,
                    redraw_needed: false,
                };
                match mem::replace(&mut state.redraw_state, new_state) {
                    RedrawState::Queued => (),
                    RedrawState::WaitingForEstimatedVBlankAndQueued(old_token) => {
                        self.event_loop.remove(old_token);
                    }
                    _ => unreachable!(),
                }

                // The frame latched the current client buffers; new commits
                // go to the next frame, so callbacks can be sent.
                let state = self.outputs.get_mut(output).unwrap();
                state.frame_callback_sequence = state.frame_callback_sequence.wrapping_add(1);
            }
            RenderResult::NoDamage | RenderResult::Skipped => {
                self.queue_estimated_vblank_timer(output.clone(), target_presentation_time);
            }
        }

        self.send_frame_callbacks(output);
    }

    /// Presentation notification for a previously submitted frame.
    pub fn on_vblank(&mut self, output: &Output) {
        let _span = tracy_client::span!("Scrim::on_vblank");

        let Some(state) = self.outputs.get_mut(output) else {
            error!("missing output state for {}", output.name());
            return;
        };

        let redraw_needed = match mem::replace(&mut state.redraw_state, RedrawState::Idle) {
            RedrawState::WaitingForVBlank { redraw_needed, .. } => redraw_needed,
            // Can happen with a stale timer around output reconfiguration.
            other => {
                error!(
                    "unexpected redraw state on vblank for {}: {other:?}",
                    output.name()
                );
                state.redraw_state = other;
                return;
            }
        };

        if let Some(in_flight) = state.in_flight.take() {
            let time = in_flight.target_presentation_time;
            let refresh = state.frame_clock.refresh_interval();
            state.frame_clock.presented(time);

            let flags = FeedbackFlags::VSYNC | FeedbackFlags::HW_CLOCK;
            for window in in_flight.painted {
                self.pending_presentation_feedback
                    .push_back(PresentationFeedback {
                        window,
                        time,
                        refresh,
                        sequence: in_flight.sequence,
                        flags,
                    });
            }
        }

        let state = self.outputs.get_mut(output).unwrap();
        if redraw_needed
            || state.unfinished_animations_remain
            || self.scene.damage_pending(output)
        {
            self.queue_redraw(output);
        } else {
            self.send_frame_callbacks(output);
        }
    }

    /// Arms a timer for the predicted vblank when nothing was submitted, so
    /// frame callbacks keep the output's cadence.
    fn queue_estimated_vblank_timer(&mut self, output: Output, target_presentation_time: Duration) {
        let state = self.outputs.get_mut(&output).unwrap();

        match mem::take(&mut state.redraw_state) {
            RedrawState::Idle => unreachable!(),
            RedrawState::Queued => (),
            RedrawState::WaitingForVBlank { .. } => unreachable!(),
            RedrawState::WaitingForEstimatedVBlank(token)
            | RedrawState::WaitingForEstimatedVBlankAndQueued(token) => {
                state.redraw_state = RedrawState::WaitingForEstimatedVBlank(token);
                return;
            }
        }

        let now = get_monotonic_time();
        let mut duration = target_presentation_time.saturating_sub(now);

        // A zero timer is pointless; wait out one refresh cycle instead.
        if duration.is_zero() {
            duration += state
                .frame_clock
                .refresh_interval()
                .unwrap_or(Duration::from_micros(16_667));
        }

        trace!("queueing estimated vblank timer to fire in {duration:?}");

        let timer = Timer::from_duration(duration);
        let timer_output = output.clone();
        let token = self
            .event_loop
            .insert_source(timer, move |_, _, state| {
                state.scrim.on_estimated_vblank_timer(&timer_output);
                TimeoutAction::Drop
            })
            .unwrap();
        state.redraw_state = RedrawState::WaitingForEstimatedVBlank(token);
    }

    fn on_estimated_vblank_timer(&mut self, output: &Output) {
        let Some(state) = self.outputs.get_mut(output) else {
            error!("missing output state for {}", output.name());
            return;
        };

        // We waited out the cycle; frame callbacks may flow again.
        state.frame_callback_sequence = state.frame_callback_sequence.wrapping_add(1);

        match mem::replace(&mut state.redraw_state, RedrawState::Idle) {
            RedrawState::WaitingForEstimatedVBlank(_) => (),
            // The timer fired just in front of a redraw.
            RedrawState::WaitingForEstimatedVBlankAndQueued(_) => {
                state.redraw_state = RedrawState::Queued;
                return;
            }
            other => {
                error!(
                    "unexpected redraw state on estimated vblank for {}: {other:?}",
                    output.name()
                );
                state.redraw_state = other;
                return;
            }
        }

        if state.unfinished_animations_remain || self.scene.damage_pending(output) {
            self.queue_redraw(output);
        } else {
            self.send_frame_callbacks(output);
        }
    }

    fn purge_expired_remnants(&mut self) {
        for id in self.scene.expired_remnants() {
            let mut ctx = EffectContext {
                scene: &mut self.scene,
                now: self.clock.now(),
            };
            self.effects.window_deleted(&mut ctx, id);
            self.scene.destroy(id);
            self.frame_callback_state.remove(&id);
        }
    }
}

fn warn_on_overlap(outputs: &[Output], output: &Output) {
    // Overlap is legal (it only changes occlusion results), but it is
    // almost always a configuration mistake worth pointing out.
    let geometry = output.geometry();
    for other in outputs {
        if other.geometry().overlaps(geometry) {
            warn!(
                "output {} overlaps {} in the global space",
                output.name(),
                other.name(),
            );
        }
    }
}
