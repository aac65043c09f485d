//! Presentation backends.
//!
//! The backend owns GPU or CPU resources: it imports client buffers into
//! sampleable textures, hands out per-output frames to paint into, and
//! presents finished frames. Everything above this module is
//! backend-agnostic; the variant is picked once at startup and never
//! re-resolved per call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::buffer::{BufferSource, DmabufBuffer, Fourcc, ShmBuffer, MODIFIER_INVALID, MODIFIER_LINEAR};
use crate::output::Output;
use crate::utils::geometry::{Buffer, Physical, Rect, Size};
use crate::utils::region::Region;

pub mod gpu;
pub mod software;

pub use gpu::GpuBackend;
pub use software::SoftwareBackend;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("unsupported format {format:?} with modifier {modifier:#x}")]
    UnsupportedFormat { format: Fourcc, modifier: u64 },
    #[error("buffer import failed: {0}")]
    ImportFailed(#[source] std::io::Error),
    #[error("buffer has invalid dimensions or length (expected {expected} bytes, got {actual})")]
    SizeMismatch { expected: usize, actual: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The backend rejected this frame; the previous frame stays on screen
    /// and the caller retries on the next vblank.
    #[error("backend rejected the frame commit")]
    CommitFailed,
    #[error("output is gone")]
    OutputLost,
}

// =============================================================================
// Textures
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(u64);

impl TextureId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

pub(crate) type ReleaseQueue = Rc<RefCell<Vec<TextureId>>>;

/// Handle to an imported texture.
///
/// Dropping the last handle queues the backend-side storage for release;
/// the backend reclaims it on its next maintenance pass, mirroring how GPU
/// imports stay alive until the producer gets its buffer back.
#[derive(Clone)]
pub struct Texture {
    inner: Rc<TextureInner>,
}

struct TextureInner {
    id: TextureId,
    size: Size<i32, Buffer>,
    format: Fourcc,
    releases: ReleaseQueue,
}

impl Texture {
    pub(crate) fn new(
        id: TextureId,
        size: Size<i32, Buffer>,
        format: Fourcc,
        releases: ReleaseQueue,
    ) -> Self {
        Self {
            inner: Rc::new(TextureInner {
                id,
                size,
                format,
                releases,
            }),
        }
    }

    pub fn id(&self) -> TextureId {
        self.inner.id
    }

    pub fn size(&self) -> Size<i32, Buffer> {
        self.inner.size
    }

    pub fn format(&self) -> Fourcc {
        self.inner.format
    }
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        self.releases.borrow_mut().push(self.id);
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("format", &self.inner.format)
            .finish()
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Premultiplied linear color.
pub type Color = [f32; 4];

/// A frame being composited for one output.
pub enum Frame {
    Gpu(gpu::GpuFrame),
    Software(software::SoftwareFrame),
}

impl Frame {
    /// Fills `region` with a solid color.
    pub fn fill(&mut self, color: Color, region: &Region<Physical>) {
        match self {
            Frame::Gpu(frame) => frame.fill(color, region),
            Frame::Software(frame) => frame.fill(color, region),
        }
    }

    /// Samples `src` from the texture into `dst`, clipped to `clip`.
    ///
    /// `opacity` multiplies the texture's own alpha. Scaling is implied by
    /// the `src`/`dst` size ratio.
    pub fn draw_texture(
        &mut self,
        texture: &Texture,
        dst: Rect<i32, Physical>,
        src: Rect<f64, Buffer>,
        opacity: f64,
        clip: &Region<Physical>,
    ) {
        if opacity <= 0. || dst.is_empty() || clip.is_empty() {
            return;
        }

        match self {
            Frame::Gpu(frame) => frame.draw_texture(texture, dst, src, opacity, clip),
            Frame::Software(frame) => frame.draw_texture(texture, dst, src, opacity, clip),
        }
    }
}

/// Receipt for a successfully queued frame.
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct VblankTiming {
    pub refresh_interval: Option<Duration>,
}

// =============================================================================
// Backend
// =============================================================================

pub enum Backend {
    Gpu(GpuBackend),
    Software(SoftwareBackend),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Gpu(_) => "gpu",
            Backend::Software(_) => "software",
        }
    }

    pub fn add_output(&mut self, output: &Output) {
        match self {
            Backend::Gpu(backend) => backend.add_output(output),
            Backend::Software(backend) => backend.add_output(output),
        }
    }

    pub fn remove_output(&mut self, output: &Output) {
        match self {
            Backend::Gpu(backend) => backend.remove_output(output),
            Backend::Software(backend) => backend.remove_output(output),
        }
    }

    /// Imports a client buffer, reusing `reuse`'s storage when the size and
    /// format match to avoid object churn on high-frequency commits.
    pub fn import_buffer(
        &mut self,
        source: &BufferSource,
        reuse: Option<&Texture>,
    ) -> Result<Texture, ImportError> {
        let _span = tracy_client::span!("Backend::import_buffer");

        match self {
            Backend::Gpu(backend) => backend.import_buffer(source, reuse),
            Backend::Software(backend) => backend.import_buffer(source, reuse),
        }
    }

    pub fn begin_frame(&mut self, output: &Output) -> Result<Frame, SubmitError> {
        match self {
            Backend::Gpu(backend) => backend.begin_frame(output).map(Frame::Gpu),
            Backend::Software(backend) => backend.begin_frame(output).map(Frame::Software),
        }
    }

    pub fn submit_frame(&mut self, output: &Output, frame: Frame) -> Result<Submission, SubmitError> {
        let _span = tracy_client::span!("Backend::submit_frame");

        match (self, frame) {
            (Backend::Gpu(backend), Frame::Gpu(frame)) => backend.submit_frame(output, frame),
            (Backend::Software(backend), Frame::Software(frame)) => {
                backend.submit_frame(output, frame)
            }
            // A frame only ever comes from the backend that made it.
            _ => Err(SubmitError::CommitFailed),
        }
    }

    pub fn query_vblank_timing(&self, output: &Output) -> VblankTiming {
        VblankTiming {
            refresh_interval: output.refresh_interval(),
        }
    }

    /// Number of live backend textures, after reclaiming released ones.
    pub fn live_texture_count(&mut self) -> usize {
        match self {
            Backend::Gpu(backend) => backend.live_texture_count(),
            Backend::Software(backend) => backend.live_texture_count(),
        }
    }

    /// Injects `count` upcoming frame-submission failures.
    pub fn set_fail_frame_submissions(&mut self, count: u32) {
        match self {
            Backend::Gpu(backend) => backend.set_fail_frame_submissions(count),
            Backend::Software(backend) => backend.set_fail_frame_submissions(count),
        }
    }
}

// =============================================================================
// Shared import path
// =============================================================================

/// Converts any accepted client buffer into tightly packed premultiplied
/// RGBA, the one format both render paths consume.
pub(crate) fn buffer_to_rgba(source: &BufferSource) -> Result<Vec<u8>, ImportError> {
    // A zero-size buffer would produce a texture that must never be
    // sampled; refuse it here so the window keeps its previous contents.
    if source.size().is_empty() {
        return Err(ImportError::SizeMismatch {
            expected: 0,
            actual: 0,
        });
    }

    match source {
        BufferSource::Shm(shm) => shm_to_rgba(shm),
        BufferSource::Dmabuf(dmabuf) => dmabuf_to_rgba(dmabuf),
    }
}

fn shm_to_rgba(shm: &ShmBuffer) -> Result<Vec<u8>, ImportError> {
    let size = shm.size();
    let stride = shm.stride() as usize;
    let bytes = shm.bytes();

    match shm.format() {
        format @ (Fourcc::Argb8888 | Fourcc::Xrgb8888) => {
            let expected = stride * size.h as usize;
            if bytes.len() < expected {
                return Err(ImportError::SizeMismatch {
                    expected,
                    actual: bytes.len(),
                });
            }
            Ok(pack_xrgb_rows(bytes, size, stride, format.has_alpha()))
        }
        Fourcc::Nv12 => {
            // Single-map NV12: the UV plane directly follows the Y plane.
            let y_len = stride * size.h as usize;
            let uv_len = stride * (size.h as usize).div_ceil(2);
            if bytes.len() < y_len + uv_len {
                return Err(ImportError::SizeMismatch {
                    expected: y_len + uv_len,
                    actual: bytes.len(),
                });
            }
            Ok(nv12_to_rgba(
                &bytes[..y_len],
                &bytes[y_len..],
                size,
                stride,
                stride,
            ))
        }
    }
}

fn dmabuf_to_rgba(dmabuf: &DmabufBuffer) -> Result<Vec<u8>, ImportError> {
    // Direct GPU import needs driver-specific tiling knowledge; everything
    // else goes through the CPU conversion fallback, which only understands
    // linear layouts.
    if dmabuf.modifier != MODIFIER_LINEAR && dmabuf.modifier != MODIFIER_INVALID {
        return Err(ImportError::UnsupportedFormat {
            format: dmabuf.format,
            modifier: dmabuf.modifier,
        });
    }

    let size = dmabuf.size;

    match dmabuf.format {
        format @ (Fourcc::Argb8888 | Fourcc::Xrgb8888) => {
            let stride = dmabuf.planes[0].stride as usize;
            let len = stride * size.h as usize;
            let map = dmabuf
                .map_plane(0, len)
                .map_err(ImportError::ImportFailed)?;
            Ok(pack_xrgb_rows(&map, size, stride, format.has_alpha()))
        }
        Fourcc::Nv12 => {
            if dmabuf.planes.len() < 2 {
                return Err(ImportError::UnsupportedFormat {
                    format: dmabuf.format,
                    modifier: dmabuf.modifier,
                });
            }

            let y_stride = dmabuf.planes[0].stride as usize;
            let uv_stride = dmabuf.planes[1].stride as usize;
            let y = dmabuf
                .map_plane(0, y_stride * size.h as usize)
                .map_err(ImportError::ImportFailed)?;
            let uv = dmabuf
                .map_plane(1, uv_stride * (size.h as usize).div_ceil(2))
                .map_err(ImportError::ImportFailed)?;
            Ok(nv12_to_rgba(&y, &uv, size, y_stride, uv_stride))
        }
    }
}

fn pack_xrgb_rows(src: &[u8], size: Size<i32, Buffer>, stride: usize, has_alpha: bool) -> Vec<u8> {
    let w = size.w as usize;
    let h = size.h as usize;
    let mut out = vec![0u8; w * h * 4];

    for row in 0..h {
        let src_row = &src[row * stride..row * stride + w * 4];
        let out_row = &mut out[row * w * 4..(row + 1) * w * 4];

        for (src_px, out_px) in src_row.chunks_exact(4).zip(out_row.chunks_exact_mut(4)) {
            // Little-endian XRGB/ARGB: bytes are B, G, R, A.
            let (b, g, r) = (src_px[0], src_px[1], src_px[2]);
            let a = if has_alpha { src_px[3] } else { 0xff };

            if has_alpha && a != 0xff {
                let a16 = u16::from(a);
                out_px[0] = ((u16::from(r) * a16) / 255) as u8;
                out_px[1] = ((u16::from(g) * a16) / 255) as u8;
                out_px[2] = ((u16::from(b) * a16) / 255) as u8;
            } else {
                out_px[0] = r;
                out_px[1] = g;
                out_px[2] = b;
            }
            out_px[3] = a;
        }
    }

    out
}

/// BT.601 limited-range NV12 to RGBA.
fn nv12_to_rgba(
    y_plane: &[u8],
    uv_plane: &[u8],
    size: Size<i32, Buffer>,
    y_stride: usize,
    uv_stride: usize,
) -> Vec<u8> {
    let w = size.w as usize;
    let h = size.h as usize;
    let mut out = vec![0u8; w * h * 4];

    for row in 0..h {
        for col in 0..w {
            let y = i32::from(y_plane[row * y_stride + col]);
            let uv_base = (row / 2) * uv_stride + (col / 2) * 2;
            let u = i32::from(uv_plane[uv_base]);
            let v = i32::from(uv_plane[uv_base + 1]);

            let c = y - 16;
            let d = u - 128;
            let e = v - 128;

            let clamp = |x: i32| x.clamp(0, 255) as u8;
            let r = clamp((298 * c + 409 * e + 128) >> 8);
            let g = clamp((298 * c - 100 * d - 208 * e + 128) >> 8);
            let b = clamp((298 * c + 516 * d + 128) >> 8);

            let px = (row * w + col) * 4;
            out[px] = r;
            out[px + 1] = g;
            out[px + 2] = b;
            out[px + 3] = 0xff;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xrgb_repack_forces_opaque_alpha() {
        let size = Size::new(1, 1);
        let rgba = pack_xrgb_rows(&[0x10, 0x20, 0x30, 0x00], size, 4, false);
        assert_eq!(rgba, vec![0x30, 0x20, 0x10, 0xff]);
    }

    #[test]
    fn argb_repack_premultiplies() {
        let size = Size::new(1, 1);
        let rgba = pack_xrgb_rows(&[0xff, 0xff, 0xff, 0x80], size, 4, true);
        assert_eq!(rgba, vec![0x80, 0x80, 0x80, 0x80]);
    }

    #[test]
    fn nv12_black_and_white() {
        let size = Size::new(2, 2);
        // Y=16 is black, Y=235 is white in limited range; neutral chroma.
        let y = [16, 235, 16, 235];
        let uv = [128, 128];
        let rgba = nv12_to_rgba(&y, &uv, size, 2, 2);

        assert_eq!(&rgba[0..4], &[0, 0, 0, 0xff]);
        assert_eq!(&rgba[4..8], &[0xff, 0xff, 0xff, 0xff]);
    }
}
