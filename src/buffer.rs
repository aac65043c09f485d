//! Client buffer descriptors.
//!
//! The protocol layer hands the compositor either a shared-memory buffer or
//! a DMA-BUF descriptor. Both are opaque pixel sources here; turning them
//! into something sampleable is the backend's job.

use std::fs::File;
use std::io;
use std::sync::Arc;

use arrayvec::ArrayVec;
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::utils::geometry::{Buffer, Size};

const fn fourcc_code(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24
}

/// Linear layout, no tiling.
pub const MODIFIER_LINEAR: u64 = 0;
/// The producer did not communicate a modifier.
pub const MODIFIER_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fourcc {
    Argb8888,
    Xrgb8888,
    Nv12,
}

impl Fourcc {
    pub const fn code(self) -> u32 {
        match self {
            Fourcc::Argb8888 => fourcc_code(b'A', b'R', b'2', b'4'),
            Fourcc::Xrgb8888 => fourcc_code(b'X', b'R', b'2', b'4'),
            Fourcc::Nv12 => fourcc_code(b'N', b'V', b'1', b'2'),
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        [Fourcc::Argb8888, Fourcc::Xrgb8888, Fourcc::Nv12]
            .into_iter()
            .find(|format| format.code() == code)
    }

    pub const fn has_alpha(self) -> bool {
        matches!(self, Fourcc::Argb8888)
    }

    pub const fn plane_count(self) -> usize {
        match self {
            Fourcc::Argb8888 | Fourcc::Xrgb8888 => 1,
            Fourcc::Nv12 => 2,
        }
    }

    /// Bytes per pixel for single-plane formats.
    pub const fn bytes_per_pixel(self) -> Option<i32> {
        match self {
            Fourcc::Argb8888 | Fourcc::Xrgb8888 => Some(4),
            Fourcc::Nv12 => None,
        }
    }
}

// =============================================================================
// Shared memory
// =============================================================================

#[derive(Debug, Clone)]
pub struct ShmBuffer {
    map: Arc<Mmap>,
    size: Size<i32, Buffer>,
    stride: i32,
    format: Fourcc,
}

impl ShmBuffer {
    pub fn new(map: Mmap, size: Size<i32, Buffer>, stride: i32, format: Fourcc) -> Self {
        Self {
            map: Arc::new(map),
            size,
            stride,
            format,
        }
    }

    /// Builds an anonymous shared-memory buffer from raw pixel bytes.
    ///
    /// `pixels` must be `stride * height` bytes, tightly following the given
    /// stride. Used by the demo shell and tests; real clients hand over an
    /// already-mapped pool.
    pub fn from_pixels(
        size: Size<i32, Buffer>,
        stride: i32,
        format: Fourcc,
        pixels: &[u8],
    ) -> io::Result<Self> {
        let len = stride as usize * size.h as usize;
        if pixels.len() != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("expected {len} bytes, got {}", pixels.len()),
            ));
        }

        let mut map = MmapMut::map_anon(len.max(1))?;
        map[..len].copy_from_slice(pixels);
        Ok(Self::new(map.make_read_only()?, size, stride, format))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn size(&self) -> Size<i32, Buffer> {
        self.size
    }

    pub fn stride(&self) -> i32 {
        self.stride
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }
}

// =============================================================================
// DMA-BUF
// =============================================================================

#[derive(Debug, Clone)]
pub struct DmabufPlane {
    pub file: Arc<File>,
    pub offset: u32,
    pub stride: u32,
}

#[derive(Debug, Clone)]
pub struct DmabufBuffer {
    pub planes: ArrayVec<DmabufPlane, 4>,
    pub size: Size<i32, Buffer>,
    pub format: Fourcc,
    pub modifier: u64,
}

impl DmabufBuffer {
    /// Maps one plane for CPU access.
    ///
    /// Not every exporter allows this; the caller treats failure as an
    /// import error rather than a protocol violation.
    pub fn map_plane(&self, index: usize, len: usize) -> io::Result<Mmap> {
        let plane = self.planes.get(index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "plane index out of range")
        })?;

        unsafe {
            MmapOptions::new()
                .offset(u64::from(plane.offset))
                .len(len)
                .map(&*plane.file)
        }
    }
}

// =============================================================================
// BufferSource
// =============================================================================

#[derive(Debug, Clone)]
pub enum BufferSource {
    Shm(ShmBuffer),
    Dmabuf(DmabufBuffer),
}

impl BufferSource {
    pub fn size(&self) -> Size<i32, Buffer> {
        match self {
            BufferSource::Shm(shm) => shm.size(),
            BufferSource::Dmabuf(dmabuf) => dmabuf.size,
        }
    }

    pub fn format(&self) -> Fourcc {
        match self {
            BufferSource::Shm(shm) => shm.format(),
            BufferSource::Dmabuf(dmabuf) => dmabuf.format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trip() {
        for format in [Fourcc::Argb8888, Fourcc::Xrgb8888, Fourcc::Nv12] {
            assert_eq!(Fourcc::from_code(format.code()), Some(format));
        }
        assert_eq!(Fourcc::Argb8888.code(), 0x3432_5241);
        assert_eq!(Fourcc::from_code(0), None);
    }

    #[test]
    fn shm_from_pixels_validates_length() {
        let size = Size::new(2, 2);
        assert!(ShmBuffer::from_pixels(size, 8, Fourcc::Argb8888, &[0; 16]).is_ok());
        assert!(ShmBuffer::from_pixels(size, 8, Fourcc::Argb8888, &[0; 15]).is_err());
    }
}
