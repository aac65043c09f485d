//! The compositing pass.
//!
//! One call composites one frame for one output: snapshot the damage, run
//! the effect chain's pre-paint phase (computing final paint regions and
//! occlusion), paint bottom to top clipped to the damage, run the
//! post-paint phase, and hand the frame to the backend.

use crate::backend::{Backend, Frame, Texture};
use crate::effect::{
    EffectChain, EffectContext, ScreenPaintData, ScreenPaintFlags, ScreenPrePaintData,
    WindowPaintData, WindowPaintFlags, WindowPrePaintData,
};
use crate::output::Output;
use crate::scene::{Scene, WindowId};
use crate::utils::geometry::{Buffer, Logical, Physical, Point, Rect, Size};
use crate::utils::region::Region;

use super::types::{InFlightFrame, PaintStats, RenderResult};
use super::Scrim;

struct PaintEntry {
    id: WindowId,
    /// Physical output region this window repaints, after damage clipping
    /// and occlusion culling.
    clip: Region<Physical>,
}

impl Scrim {
    pub(super) fn render_output(
        &mut self,
        backend: &mut Backend,
        output: &Output,
        target_presentation_time: std::time::Duration,
    ) -> RenderResult {
        let span = tracy_client::span!("Scrim::render_output");
        span.emit_text(&output.name());

        let Self {
            scene,
            effects,
            outputs,
            config,
            ..
        } = self;

        let (disable_occlusion, disable_scanout, draw_damage) = {
            let config = config.borrow();
            (
                config.debug.disable_occlusion_culling,
                config.debug.disable_scanout_fast_path,
                config.debug.draw_damage,
            )
        };

        let output_geometry = output.geometry();
        let scale = output.scale();

        // Snapshot the damage. Anything marked from here on accumulates for
        // the next frame, never this one.
        let snapshot = scene.take_damage(output);

        let mut ctx = EffectContext {
            scene,
            now: target_presentation_time,
        };

        // Screen pre-paint: effects see and may enlarge the damage.
        let mut screen_pre = ScreenPrePaintData {
            damage: snapshot,
            flags: ScreenPaintFlags::empty(),
        };
        effects.pre_paint_screen(&mut ctx, &mut screen_pre);
        let ScreenPrePaintData {
            mut damage,
            flags: screen_flags,
        } = screen_pre;

        let screen_transformed = screen_flags.contains(ScreenPaintFlags::TRANSFORMED);
        if screen_transformed {
            damage = Region::from_rect(output_geometry);
        }

        // Window pre-paint runs top to bottom so each window knows what the
        // ones above it occlude.
        let stacking: Vec<WindowId> = ctx.scene.stacking().to_vec();
        let mut occluded: Region<Logical> = Region::new();
        let mut entries_top_down: Vec<(WindowId, Region<Logical>)> = Vec::new();

        for &id in stacking.iter().rev() {
            let Some(window) = ctx.scene.window(id) else {
                continue;
            };
            if !window.should_paint() {
                continue;
            }
            let bounds = window.bounds();
            if !bounds.overlaps(output_geometry) {
                continue;
            }

            let mut pre = WindowPrePaintData {
                paint_region: Region::from_rect(bounds),
                opaque_region: window.global_opaque_region(),
                flags: if window.opacity() < 1. {
                    WindowPaintFlags::TRANSLUCENT
                } else {
                    WindowPaintFlags::empty()
                },
            };
            effects.pre_paint_window(&mut ctx, id, &mut pre);

            // An effect-transformed window can reach outside its stored
            // geometry; repaint everything it asked for.
            if pre.flags.contains(WindowPaintFlags::TRANSFORMED) {
                damage.union(&pre.paint_region);
            }

            let mut paint_region = pre.paint_region;
            if !disable_occlusion
                && !screen_transformed
                && !pre.flags.contains(WindowPaintFlags::DISABLE_OCCLUSION)
            {
                paint_region.subtract(&occluded);
            }

            if !pre
                .flags
                .intersects(WindowPaintFlags::TRANSLUCENT | WindowPaintFlags::TRANSFORMED)
            {
                occluded.union(&pre.opaque_region);
            }

            entries_top_down.push((id, paint_region));
        }

        for (id, _) in &entries_top_down {
            ctx.scene.clear_pending_damage(*id);
        }

        let damage = damage.intersect_rect(output_geometry);
        if damage.is_empty() {
            return RenderResult::NoDamage;
        }

        let to_physical = |region: &Region<Logical>| {
            region
                .translated(Point::new(-output_geometry.left(), -output_geometry.top()))
                .to_physical(scale)
        };
        let physical_damage = to_physical(&damage);

        let mut frame = match backend.begin_frame(output) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("error beginning frame for {}: {err}", output.name());
                ctx.scene.damage_map().damage_output(output, &damage);
                return RenderResult::Skipped;
            }
        };

        // Bottom to top for painting, with the final physical clips.
        let entries: Vec<PaintEntry> = entries_top_down
            .iter()
            .rev()
            .map(|(id, paint_region)| PaintEntry {
                id: *id,
                clip: to_physical(&paint_region.intersection(&damage)),
            })
            .collect();

        let mut stats = PaintStats::default();
        let mut sdata = ScreenPaintData::new(output.clone());

        // Direct-scanout equivalent: one opaque window covering the whole
        // output and no effect hooked into the paint phase means the frame
        // is just that window's texture.
        let scanout = !disable_scanout
            && !screen_transformed
            && screen_flags.is_empty()
            && !effects.has_active_paint_hooks()
            && entries_top_down.first().is_some_and(|(id, _)| {
                ctx.scene.window(*id).is_some_and(|window| {
                    window.global_opaque_region().contains_rect(output_geometry)
                })
            });

        if scanout {
            let id = entries_top_down[0].0;
            let wdata = WindowPaintData::new(1.);
            draw_window(
                ctx.scene,
                &mut frame,
                id,
                &wdata,
                &sdata,
                output_geometry,
                scale,
                &physical_damage,
                &mut stats,
            );
        } else {
            // Background shows wherever no opaque window covers the damage.
            let mut background = damage.clone();
            if !disable_occlusion && !screen_transformed {
                background.subtract(&occluded);
            }
            let background = to_physical(&background);

            let mut screen_base = |chain: &mut EffectChain,
                                   ctx: &mut EffectContext<'_>,
                                   frame: &mut Frame,
                                   sdata: &mut ScreenPaintData| {
                frame.fill([0., 0., 0., 1.], &background);

                for entry in &entries {
                    if entry.clip.is_empty() {
                        continue;
                    }

                    let opacity = ctx.scene.window(entry.id).map_or(1., |w| w.opacity());
                    let mut wdata = WindowPaintData::new(opacity);

                    let mut window_base = |ctx: &mut EffectContext<'_>,
                                           frame: &mut Frame,
                                           id: WindowId,
                                           wdata: &mut WindowPaintData| {
                        draw_window(
                            ctx.scene,
                            frame,
                            id,
                            wdata,
                            sdata,
                            output_geometry,
                            scale,
                            &entry.clip,
                            &mut stats,
                        );
                    };

                    chain.paint_window(ctx, frame, entry.id, &mut wdata, &mut window_base);
                    chain.post_paint_window(ctx, entry.id);
                }
            };

            effects.paint_screen(&mut ctx, &mut frame, &mut sdata, &mut screen_base);
        }

        effects.post_paint_screen(&mut ctx);

        if draw_damage {
            frame.fill([0.25, 0., 0., 0.25], &physical_damage);
        }

        match backend.submit_frame(output, frame) {
            Ok(submission) => {
                let painted: Vec<WindowId> = stats
                    .painted
                    .iter()
                    .filter(|(_, region)| !region.is_empty())
                    .map(|(id, _)| *id)
                    .collect();

                let state = outputs.get_mut(output).unwrap();
                state.last_paint_stats = Some(stats);
                state.in_flight = Some(InFlightFrame {
                    target_presentation_time,
                    sequence: submission.sequence,
                    painted,
                });

                RenderResult::Submitted
            }
            Err(err) => {
                // Recoverable: the previous frame stays on screen and the
                // repaint happens on the next cycle.
                warn!("error submitting frame for {}: {err}", output.name());
                ctx.scene.damage_map().damage_output(output, &damage);
                RenderResult::Skipped
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn draw_window(
    scene: &Scene,
    frame: &mut Frame,
    id: WindowId,
    wdata: &WindowPaintData,
    sdata: &ScreenPaintData,
    output_geometry: Rect<i32, Logical>,
    output_scale: f64,
    clip: &Region<Physical>,
    stats: &mut PaintStats,
) {
    let Some(window) = scene.window(id) else {
        return;
    };
    let Some(texture) = window.texture() else {
        return;
    };

    let dst = window_dst(window.geometry(), wdata, sdata, output_geometry, output_scale);
    if dst.is_empty() {
        return;
    }

    let src = full_src(texture);
    frame.draw_texture(texture, dst, src, wdata.opacity, clip);

    let painted = clip.intersect_rect(dst);
    if !painted.is_empty() {
        stats.painted.entry(id).or_default().union(&painted);
    }
}

/// Applies the window and screen paint transforms to a window's geometry,
/// producing the destination rectangle in output device pixels.
fn window_dst(
    geometry: Rect<f64, Logical>,
    wdata: &WindowPaintData,
    sdata: &ScreenPaintData,
    output_geometry: Rect<i32, Logical>,
    output_scale: f64,
) -> Rect<i32, Physical> {
    let mut rect = geometry.translated(wdata.offset);
    rect.size = Size::new(rect.size.w * wdata.scale, rect.size.h * wdata.scale);

    // To output-local coordinates.
    let mut local = rect.translated(Point::new(
        -f64::from(output_geometry.left()),
        -f64::from(output_geometry.top()),
    ));

    // Screen transform: scale around the output origin, then offset.
    local.loc = Point::new(
        local.loc.x * sdata.scale + sdata.offset.x,
        local.loc.y * sdata.scale + sdata.offset.y,
    );
    local.size = Size::new(local.size.w * sdata.scale, local.size.h * sdata.scale);

    local.to_physical(output_scale).to_i32_round()
}

fn full_src(texture: &Texture) -> Rect<f64, Buffer> {
    let size = texture.size().to_f64();
    Rect::from_loc_and_size((0., 0.), (size.w, size.h))
}
