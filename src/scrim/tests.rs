use std::time::{Duration, Instant};

use calloop::EventLoop;
use pretty_assertions::assert_eq;
use scrim_config::Config;

use crate::backend::{Backend, SoftwareBackend};
use crate::buffer::{BufferSource, Fourcc, ShmBuffer};
use crate::output::{Mode, Output};
use crate::scene::WindowId;
use crate::utils::geometry::{Logical, Physical, Rect, Size};
use crate::utils::region::Region;

use super::types::RedrawState;
use super::State;

fn fixture(config: Config) -> (EventLoop<'static, State>, State) {
    let event_loop = EventLoop::try_new().unwrap();
    let backend = Backend::Software(SoftwareBackend::new());
    let state = State::new(config, backend, event_loop.handle());
    (event_loop, state)
}

fn add_test_output(state: &mut State) -> Output {
    let output = Output::new("TEST-1", Mode::new(Size::new(1920, 1080), Some(60.)));
    state.add_output(&output);
    output
}

fn solid_buffer(w: i32, h: i32, format: Fourcc, bgra: [u8; 4]) -> BufferSource {
    let mut pixels = Vec::new();
    for _ in 0..w * h {
        pixels.extend_from_slice(&bgra);
    }
    BufferSource::Shm(ShmBuffer::from_pixels(Size::new(w, h), w * 4, format, &pixels).unwrap())
}

fn commit_opaque(state: &mut State, window: WindowId, w: i32, h: i32) {
    let buffer = solid_buffer(w, h, Fourcc::Xrgb8888, [0x80, 0x80, 0x80, 0xff]);
    let damage = Region::from_rect(Rect::from_loc_and_size((0, 0), (w, h)));
    state.surface_commit(window, &buffer, &damage).unwrap();
}

fn dispatch_until(
    event_loop: &mut EventLoop<'static, State>,
    state: &mut State,
    what: &str,
    mut pred: impl FnMut(&State) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        state.refresh_and_redraw();
        if pred(state) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        event_loop
            .dispatch(Some(Duration::from_millis(5)), state)
            .unwrap();
    }
}

fn wait_for_idle(event_loop: &mut EventLoop<'static, State>, state: &mut State, output: &Output) {
    dispatch_until(event_loop, state, "idle", |state| {
        matches!(
            state.scrim.output_state(output).unwrap().redraw_state,
            RedrawState::Idle,
        )
    });
}

fn logical(x: i32, y: i32, w: i32, h: i32) -> Region<Logical> {
    Region::from_rect(Rect::from_loc_and_size((x, y), (w, h)))
}

fn physical(x: i32, y: i32, w: i32, h: i32) -> Rect<i32, Physical> {
    Rect::from_loc_and_size((x, y), (w, h))
}

#[test]
fn full_frame_scenario() {
    let (mut event_loop, mut state) = fixture(Config::default());
    let output = add_test_output(&mut state);

    let window = state
        .scrim
        .map_window(Rect::from_loc_and_size((0., 0.), (800., 600.)));
    commit_opaque(&mut state, window, 800, 600);

    // Damage exists, so a redraw is queued but not yet composited.
    assert!(matches!(
        state.scrim.output_state(&output).unwrap().redraw_state,
        RedrawState::Queued,
    ));

    // Compositing submits a frame and waits for the vblank.
    state.refresh_and_redraw();
    assert!(matches!(
        state.scrim.output_state(&output).unwrap().redraw_state,
        RedrawState::WaitingForVBlank { .. },
    ));

    wait_for_idle(&mut event_loop, &mut state, &output);

    let feedback = state.scrim.drain_presentation_feedback();
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].window, window);
    let first_time = feedback[0].time;

    assert!(!state.scrim.drain_frame_callbacks().is_empty());

    // Second commit with a small damage region; only that region repaints.
    let buffer = solid_buffer(800, 600, Fourcc::Xrgb8888, [0x20, 0x20, 0x20, 0xff]);
    state
        .surface_commit(window, &buffer, &logical(100, 100, 50, 50))
        .unwrap();
    wait_for_idle(&mut event_loop, &mut state, &output);

    let state_ref = state.scrim.output_state(&output).unwrap();
    let stats = state_ref.last_paint_stats.as_ref().unwrap();
    let painted = stats.painted_region(window).unwrap();
    assert_eq!(painted.bounding_box(), physical(100, 100, 50, 50));
    assert_eq!(painted.area(), 50 * 50);

    // Presentation timestamps are strictly monotonic per output.
    let feedback = state.scrim.drain_presentation_feedback();
    assert_eq!(feedback.len(), 1);
    assert!(feedback[0].time > first_time);
}

#[test]
fn opaque_window_occludes_the_one_below() {
    let (mut event_loop, mut state) = fixture(Config::default());
    let output = add_test_output(&mut state);

    let below = state
        .scrim
        .map_window(Rect::from_loc_and_size((0., 0.), (800., 600.)));
    commit_opaque(&mut state, below, 800, 600);

    let above = state
        .scrim
        .map_window(Rect::from_loc_and_size((0., 0.), (400., 300.)));
    commit_opaque(&mut state, above, 400, 300);

    wait_for_idle(&mut event_loop, &mut state, &output);

    let state_ref = state.scrim.output_state(&output).unwrap();
    let stats = state_ref.last_paint_stats.as_ref().unwrap();

    // The covered region of the lower window is never painted.
    let painted_below = stats.painted_region(below).unwrap();
    assert_eq!(painted_below.area(), 800 * 600 - 400 * 300);
    assert!(painted_below.intersect_rect(physical(0, 0, 400, 300)).is_empty());

    let painted_above = stats.painted_region(above).unwrap();
    assert_eq!(painted_above.bounding_box(), physical(0, 0, 400, 300));
}

#[test]
fn translucency_disables_occlusion_culling() {
    let mut config = Config::default();
    config.effects.translucency = Some(scrim_config::Translucency {
        position: 70,
        opacity: 0.8,
    });
    let (mut event_loop, mut state) = fixture(config);
    let output = add_test_output(&mut state);

    let below = state
        .scrim
        .map_window(Rect::from_loc_and_size((0., 0.), (800., 600.)));
    commit_opaque(&mut state, below, 800, 600);

    let above = state
        .scrim
        .map_window(Rect::from_loc_and_size((0., 0.), (400., 300.)));
    commit_opaque(&mut state, above, 400, 300);

    wait_for_idle(&mut event_loop, &mut state, &output);

    // With every window translucent, nothing occludes; the lower window
    // paints its full extent.
    let state_ref = state.scrim.output_state(&output).unwrap();
    let stats = state_ref.last_paint_stats.as_ref().unwrap();
    assert_eq!(stats.painted_region(below).unwrap().area(), 800 * 600);
}

#[test]
fn failed_submission_recovers_with_known_good_frame() {
    let (mut event_loop, mut state) = fixture(Config::default());
    let output = add_test_output(&mut state);

    let window = state
        .scrim
        .map_window(Rect::from_loc_and_size((0., 0.), (1920., 1080.)));
    commit_opaque(&mut state, window, 1920, 1080);
    wait_for_idle(&mut event_loop, &mut state, &output);

    let good = match &state.backend {
        Backend::Software(sw) => sw.front_pixels(&output).unwrap().to_vec(),
        Backend::Gpu(_) => unreachable!(),
    };

    // Inject one submission failure and commit new content.
    state.backend.set_fail_frame_submissions(1);
    let buffer = solid_buffer(1920, 1080, Fourcc::Xrgb8888, [0x00, 0x00, 0xff, 0xff]);
    state
        .surface_commit(window, &buffer, &logical(0, 0, 1920, 1080))
        .unwrap();
    state.refresh_and_redraw();

    // The failed frame never reached the screen; the loop armed the
    // estimated vblank timer instead of crashing.
    match &state.backend {
        Backend::Software(sw) => assert_eq!(sw.front_pixels(&output).unwrap(), &good[..]),
        Backend::Gpu(_) => unreachable!(),
    }
    assert!(matches!(
        state.scrim.output_state(&output).unwrap().redraw_state,
        RedrawState::WaitingForEstimatedVBlank(_)
            | RedrawState::WaitingForEstimatedVBlankAndQueued(_),
    ));

    // The retry on the next cycle presents the new content.
    wait_for_idle(&mut event_loop, &mut state, &output);
    let front = match &state.backend {
        Backend::Software(sw) => sw.front_pixels(&output).unwrap(),
        Backend::Gpu(_) => unreachable!(),
    };
    assert_ne!(front, &good[..]);
    assert_eq!(&front[0..4], &[0xff, 0x00, 0x00, 0xff]);
}

#[test]
fn fade_keeps_remnant_until_animation_ends() {
    let mut config = Config::default();
    config.effects.fade = Some(scrim_config::Fade { position: 60 });
    config.animations.window_close = scrim_config::Animation {
        duration_ms: Some(50),
        curve: Some(scrim_config::Curve::Linear),
    };
    let (mut event_loop, mut state) = fixture(config);
    let output = add_test_output(&mut state);

    let window = state
        .scrim
        .map_window(Rect::from_loc_and_size((0., 0.), (800., 600.)));
    commit_opaque(&mut state, window, 800, 600);
    wait_for_idle(&mut event_loop, &mut state, &output);

    state.scrim.surface_destroyed(window);

    // The fade retained the window; it is gone from clients' point of view
    // but still queryable and painted.
    assert!(state.scrim.scene.is_remnant(window));
    assert!(state.scrim.scene.window(window).is_some());

    // Keep compositing until the animation releases it.
    dispatch_until(&mut event_loop, &mut state, "fade-out to finish", |state| {
        state.scrim.scene.window(window).is_none()
    });

    assert!(!state.scrim.scene.is_remnant(window));
    wait_for_idle(&mut event_loop, &mut state, &output);
}

#[test]
fn output_removal_cancels_render_loop() {
    let (mut event_loop, mut state) = fixture(Config::default());
    let output = add_test_output(&mut state);

    let window = state
        .scrim
        .map_window(Rect::from_loc_and_size((0., 0.), (800., 600.)));
    commit_opaque(&mut state, window, 800, 600);

    // Remove the output while a frame is in flight.
    state.refresh_and_redraw();
    assert!(matches!(
        state.scrim.output_state(&output).unwrap().redraw_state,
        RedrawState::WaitingForVBlank { .. },
    ));
    state.remove_output(&output);
    assert!(state.scrim.output_state(&output).is_none());

    // The cancelled timer must not fire into freed state.
    event_loop
        .dispatch(Some(Duration::from_millis(30)), &mut state)
        .unwrap();
    state.refresh_and_redraw();
}
