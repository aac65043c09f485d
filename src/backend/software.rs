//! CPU compositing backend.
//!
//! Keeps an RGBA framebuffer pair per output and rasterizes paint
//! operations directly. Slow but dependency-free, and the reference
//! behavior for everything the GPU path is expected to produce.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::backend::{
    buffer_to_rgba, Color, ImportError, ReleaseQueue, SubmitError, Submission, Texture, TextureId,
};
use crate::buffer::{BufferSource, Fourcc};
use crate::output::Output;
use crate::utils::geometry::{Buffer, Physical, Rect, Size};
use crate::utils::region::Region;

type TextureStore = Rc<RefCell<HashMap<TextureId, SwTexture>>>;

struct SwTexture {
    /// Tightly packed premultiplied RGBA.
    pixels: Vec<u8>,
    size: Size<i32, Buffer>,
}

struct SwTarget {
    size: Size<i32, Physical>,
    /// What is currently on screen.
    front: Vec<u8>,
    /// Scratch buffer handed out by `begin_frame`.
    back: Vec<u8>,
}

impl SwTarget {
    fn new(size: Size<i32, Physical>) -> Self {
        Self {
            size,
            front: opaque_black(size),
            back: opaque_black(size),
        }
    }
}

fn opaque_black(size: Size<i32, Physical>) -> Vec<u8> {
    let mut pixels = vec![0; buffer_len(size)];
    for px in pixels.chunks_exact_mut(4) {
        px[3] = 0xff;
    }
    pixels
}

fn buffer_len(size: Size<i32, Physical>) -> usize {
    size.w.max(0) as usize * size.h.max(0) as usize * 4
}

pub struct SoftwareBackend {
    textures: TextureStore,
    releases: ReleaseQueue,
    next_texture_id: u64,
    targets: HashMap<Output, SwTarget>,
    imported: u64,
    released: u64,
    fail_submissions: u32,
    sequence: u64,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            textures: Rc::new(RefCell::new(HashMap::new())),
            releases: Rc::new(RefCell::new(Vec::new())),
            next_texture_id: 1,
            targets: HashMap::new(),
            imported: 0,
            released: 0,
            fail_submissions: 0,
            sequence: 0,
        }
    }

    pub fn add_output(&mut self, output: &Output) {
        self.targets
            .insert(output.clone(), SwTarget::new(output.physical_size()));
    }

    pub fn remove_output(&mut self, output: &Output) {
        self.targets.remove(output);
    }

    pub fn import_buffer(
        &mut self,
        source: &BufferSource,
        reuse: Option<&Texture>,
    ) -> Result<Texture, ImportError> {
        self.collect_released();

        let rgba = buffer_to_rgba(source)?;
        let size = source.size();
        let format = source.format();

        // Update in place when the storage still fits; this is the common
        // case for video and animation commits.
        if let Some(reuse) = reuse {
            if reuse.size() == size && reuse.format() == format {
                let mut textures = self.textures.borrow_mut();
                if let Some(texture) = textures.get_mut(&reuse.id()) {
                    texture.pixels = rgba;
                    return Ok(reuse.clone());
                }
            }
        }

        let id = TextureId::from_raw(self.next_texture_id);
        self.next_texture_id += 1;
        self.textures
            .borrow_mut()
            .insert(id, SwTexture { pixels: rgba, size });
        self.imported += 1;

        Ok(Texture::new(id, size, format, self.releases.clone()))
    }

    pub fn begin_frame(&mut self, output: &Output) -> Result<SoftwareFrame, SubmitError> {
        self.collect_released();

        let target = self.targets.get_mut(output).ok_or(SubmitError::OutputLost)?;

        // The output may have changed mode since the last frame.
        let size = output.physical_size();
        if target.size != size {
            *target = SwTarget::new(size);
        }

        // Start from the previous frame so only damaged pixels need to be
        // painted again.
        let mut pixels = std::mem::take(&mut target.back);
        pixels.resize(target.front.len(), 0);
        pixels.copy_from_slice(&target.front);

        Ok(SoftwareFrame {
            size,
            pixels,
            textures: self.textures.clone(),
        })
    }

    pub fn submit_frame(
        &mut self,
        output: &Output,
        frame: SoftwareFrame,
    ) -> Result<Submission, SubmitError> {
        let target = self.targets.get_mut(output).ok_or(SubmitError::OutputLost)?;

        if self.fail_submissions > 0 {
            self.fail_submissions -= 1;
            // Keep the allocation around; the front buffer stays untouched
            // so the last known-good frame remains on screen.
            target.back = frame.pixels;
            return Err(SubmitError::CommitFailed);
        }

        if frame.size != target.size {
            target.back = frame.pixels;
            return Err(SubmitError::CommitFailed);
        }

        target.back = std::mem::replace(&mut target.front, frame.pixels);
        self.sequence += 1;

        Ok(Submission {
            sequence: self.sequence,
        })
    }

    pub fn live_texture_count(&mut self) -> usize {
        self.collect_released();
        self.textures.borrow().len()
    }

    pub fn set_fail_frame_submissions(&mut self, count: u32) {
        self.fail_submissions = count;
    }

    /// Import and release totals since startup.
    pub fn texture_counters(&mut self) -> (u64, u64) {
        self.collect_released();
        (self.imported, self.released)
    }

    /// The pixels currently presented on `output`.
    pub fn front_pixels(&self, output: &Output) -> Option<&[u8]> {
        self.targets.get(output).map(|target| &target.front[..])
    }

    fn collect_released(&mut self) {
        let ids: Vec<_> = self.releases.borrow_mut().drain(..).collect();
        if ids.is_empty() {
            return;
        }

        let mut textures = self.textures.borrow_mut();
        for id in ids {
            if textures.remove(&id).is_some() {
                self.released += 1;
            }
        }
    }
}

// =============================================================================
// SoftwareFrame
// =============================================================================

pub struct SoftwareFrame {
    size: Size<i32, Physical>,
    pixels: Vec<u8>,
    textures: TextureStore,
}

impl SoftwareFrame {
    fn bounds(&self) -> Rect<i32, Physical> {
        Rect::from_size(self.size)
    }

    pub fn fill(&mut self, color: Color, region: &Region<Physical>) {
        let src = color_to_rgba8(color);
        for &rect in region.rects() {
            let Some(rect) = rect.intersection(self.bounds()) else {
                continue;
            };
            for y in rect.top()..rect.bottom() {
                for x in rect.left()..rect.right() {
                    let px = (y as usize * self.size.w as usize + x as usize) * 4;
                    blend_px(&mut self.pixels[px..px + 4], src);
                }
            }
        }
    }

    pub fn draw_texture(
        &mut self,
        texture: &Texture,
        dst: Rect<i32, Physical>,
        src: Rect<f64, Buffer>,
        opacity: f64,
        clip: &Region<Physical>,
    ) {
        let store = self.textures.clone();
        let textures = store.borrow();
        let Some(stored) = textures.get(&texture.id()) else {
            // Sampling a released texture paints nothing.
            warn!("draw with a released texture {:?}", texture.id());
            return;
        };

        let tex_w = stored.size.w;
        let tex_h = stored.size.h;
        let x_ratio = src.size.w / f64::from(dst.size.w);
        let y_ratio = src.size.h / f64::from(dst.size.h);
        let opacity = opacity.clamp(0., 1.);

        for &clip_rect in clip.rects() {
            let Some(rect) = clip_rect
                .intersection(dst)
                .and_then(|r| r.intersection(self.bounds()))
            else {
                continue;
            };

            for y in rect.top()..rect.bottom() {
                let sy = src.loc.y + (f64::from(y - dst.top()) + 0.5) * y_ratio;
                let sy = (sy.floor() as i32).clamp(0, tex_h - 1);

                for x in rect.left()..rect.right() {
                    let sx = src.loc.x + (f64::from(x - dst.left()) + 0.5) * x_ratio;
                    let sx = (sx.floor() as i32).clamp(0, tex_w - 1);

                    let sp = (sy as usize * tex_w as usize + sx as usize) * 4;
                    let mut px = [
                        stored.pixels[sp],
                        stored.pixels[sp + 1],
                        stored.pixels[sp + 2],
                        stored.pixels[sp + 3],
                    ];

                    if opacity < 1. {
                        // Premultiplied, so opacity scales every channel.
                        for channel in &mut px {
                            *channel = (f64::from(*channel) * opacity) as u8;
                        }
                    }

                    let dp = (y as usize * self.size.w as usize + x as usize) * 4;
                    blend_px(&mut self.pixels[dp..dp + 4], px);
                }
            }
        }
    }
}

fn color_to_rgba8(color: Color) -> [u8; 4] {
    let c = |v: f32| (v.clamp(0., 1.) * 255.).round() as u8;
    [c(color[0]), c(color[1]), c(color[2]), c(color[3])]
}

/// Premultiplied source-over.
fn blend_px(dst: &mut [u8], src: [u8; 4]) {
    if src[3] == 0xff {
        dst.copy_from_slice(&src);
        return;
    }
    if src[3] == 0 && src[0] == 0 && src[1] == 0 && src[2] == 0 {
        return;
    }

    let inv = 255 - u16::from(src[3]);
    for i in 0..4 {
        dst[i] = (u16::from(src[i]) + (u16::from(dst[i]) * inv) / 255).min(255) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ShmBuffer;
    use crate::output::Mode;

    fn solid_buffer(w: i32, h: i32, bgra: [u8; 4]) -> BufferSource {
        let mut pixels = Vec::new();
        for _ in 0..w * h {
            pixels.extend_from_slice(&bgra);
        }
        BufferSource::Shm(
            ShmBuffer::from_pixels(Size::new(w, h), w * 4, Fourcc::Argb8888, &pixels).unwrap(),
        )
    }

    fn test_output(w: i32, h: i32) -> Output {
        Output::new("TEST-1", Mode::new(Size::new(w, h), Some(60.)))
    }

    #[test]
    fn import_discard_reimport_is_stable() {
        let mut backend = SoftwareBackend::new();
        let buffer = solid_buffer(4, 4, [0, 0, 0xff, 0xff]);

        let first = backend.import_buffer(&buffer, None).unwrap();
        let expected_size = first.size();
        let expected_format = first.format();
        drop(first);

        for _ in 0..32 {
            let texture = backend.import_buffer(&buffer, None).unwrap();
            assert_eq!(texture.size(), expected_size);
            assert_eq!(texture.format(), expected_format);
            drop(texture);
        }

        // Every import was matched by a release; nothing leaked.
        assert_eq!(backend.live_texture_count(), 0);
        let (imported, released) = backend.texture_counters();
        assert_eq!(imported, released);
    }

    #[test]
    fn reuse_updates_in_place() {
        let mut backend = SoftwareBackend::new();

        let red = solid_buffer(4, 4, [0, 0, 0xff, 0xff]);
        let texture = backend.import_buffer(&red, None).unwrap();

        let blue = solid_buffer(4, 4, [0xff, 0, 0, 0xff]);
        let updated = backend.import_buffer(&blue, Some(&texture)).unwrap();

        assert_eq!(updated.id(), texture.id());
        assert_eq!(backend.live_texture_count(), 1);

        // Mismatched size allocates a fresh texture.
        let bigger = solid_buffer(8, 8, [0xff, 0, 0, 0xff]);
        let fresh = backend.import_buffer(&bigger, Some(&texture)).unwrap();
        assert_ne!(fresh.id(), texture.id());
    }

    #[test]
    fn zero_size_buffer_is_rejected() {
        let mut backend = SoftwareBackend::new();
        let buffer = BufferSource::Shm(
            ShmBuffer::from_pixels(Size::new(0, 0), 0, Fourcc::Argb8888, &[]).unwrap(),
        );
        assert!(matches!(
            backend.import_buffer(&buffer, None),
            Err(ImportError::SizeMismatch { .. }),
        ));
    }

    #[test]
    fn draw_respects_clip_and_opacity() {
        let mut backend = SoftwareBackend::new();
        let output = test_output(4, 1);
        backend.add_output(&output);

        let white = solid_buffer(4, 1, [0xff, 0xff, 0xff, 0xff]);
        let texture = backend.import_buffer(&white, None).unwrap();

        let mut frame = backend.begin_frame(&output).unwrap();
        let clip = Region::from_rect(Rect::from_loc_and_size((0, 0), (2, 1)));
        frame.draw_texture(
            &texture,
            Rect::from_loc_and_size((0, 0), (4, 1)),
            Rect::from_loc_and_size((0., 0.), (4., 1.)),
            0.5,
            &clip,
        );
        backend.submit_frame(&output, frame).unwrap();

        let front = backend.front_pixels(&output).unwrap();
        // Half-opaque white over black inside the clip.
        assert_eq!(&front[0..4], &[127, 127, 127, 255]);
        // Untouched outside the clip.
        assert_eq!(&front[8..12], &[0, 0, 0, 255]);
    }

    #[test]
    fn failed_submission_keeps_last_good_frame() {
        let mut backend = SoftwareBackend::new();
        let output = test_output(2, 2);
        backend.add_output(&output);

        let mut frame = backend.begin_frame(&output).unwrap();
        frame.fill(
            [1., 0., 0., 1.],
            &Region::from_rect(Rect::from_size(output.physical_size())),
        );
        backend.submit_frame(&output, frame).unwrap();
        let good = backend.front_pixels(&output).unwrap().to_vec();

        backend.set_fail_frame_submissions(1);
        let mut frame = backend.begin_frame(&output).unwrap();
        frame.fill(
            [0., 1., 0., 1.],
            &Region::from_rect(Rect::from_size(output.physical_size())),
        );
        assert!(matches!(
            backend.submit_frame(&output, frame),
            Err(SubmitError::CommitFailed),
        ));

        // The rejected frame never reached the screen.
        assert_eq!(backend.front_pixels(&output).unwrap(), &good[..]);
    }
}
