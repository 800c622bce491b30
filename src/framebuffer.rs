//! Display memory shared by the framebuffer driver and the update sender.
//!
//! Pixels are 32bpp little-endian xRGB (blue in the lowest byte), the format
//! advertised in ServerInit.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ServerError;
use crate::{Geometry, Rect, BYTES_PER_PIXEL};

pub struct Framebuffer {
    geometry: Geometry,
    pixels: RwLock<Box<[u8]>>,
}

impl Framebuffer {
    /// Allocates zeroed display memory, failing instead of aborting when the
    /// host is out of memory.
    pub fn new(geometry: Geometry) -> Result<Self, ServerError> {
        let size = byte_size(geometry.pixels()).ok_or_else(|| {
            ServerError::Startup(format!(
                "framebuffer of {}x{} does not fit in memory",
                geometry.width, geometry.height
            ))
        })?;
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(size).map_err(|e| {
            ServerError::Startup(format!("failed to allocate {size} bytes of framebuffer: {e}"))
        })?;
        pixels.resize(size, 0);
        Ok(Self {
            geometry,
            pixels: RwLock::new(pixels.into_boxed_slice()),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn stride(&self) -> usize {
        self.geometry.width as usize * BYTES_PER_PIXEL
    }

    fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.pixels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.pixels.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Paints `rect` (clipped to the screen) with one `0x00RRGGBB` colour.
    pub fn fill_rect(&self, rect: Rect, color: u32) -> Rect {
        let rect = rect.intersect(&self.geometry.bounds());
        let stride = self.stride();
        let px = color.to_le_bytes();
        let mut pixels = self.write();
        for row in rect.y as usize..(rect.y + rect.height) as usize {
            let start = row * stride + rect.x as usize * BYTES_PER_PIXEL;
            let end = start + rect.width as usize * BYTES_PER_PIXEL;
            for chunk in pixels[start..end].chunks_exact_mut(BYTES_PER_PIXEL) {
                chunk.copy_from_slice(&px);
            }
        }
        rect
    }

    /// Copies rows of packed pixels into `rect`. `data` must hold
    /// `rect.width * rect.height` pixels; `rect` must lie on screen.
    pub fn write_rect(&self, rect: Rect, data: &[u8]) -> bool {
        if rect.intersect(&self.geometry.bounds()) != rect
            || data.len() != rect.area() * BYTES_PER_PIXEL
        {
            return false;
        }
        let stride = self.stride();
        let line = rect.width as usize * BYTES_PER_PIXEL;
        let mut pixels = self.write();
        for (i, src) in data.chunks_exact(line.max(1)).enumerate() {
            let start = (rect.y as usize + i) * stride + rect.x as usize * BYTES_PER_PIXEL;
            pixels[start..start + line].copy_from_slice(src);
        }
        true
    }

    /// Appends the packed pixels of `rect` (clipped) to `out` and returns the
    /// clipped rectangle. `out` is cleared first so the caller can reuse it.
    pub fn copy_rect(&self, rect: Rect, out: &mut Vec<u8>) -> Rect {
        let rect = rect.intersect(&self.geometry.bounds());
        let stride = self.stride();
        let line = rect.width as usize * BYTES_PER_PIXEL;
        out.clear();
        out.reserve(rect.area() * BYTES_PER_PIXEL);
        let pixels = self.read();
        for row in rect.y as usize..(rect.y + rect.height) as usize {
            let start = row * stride + rect.x as usize * BYTES_PER_PIXEL;
            out.extend_from_slice(&pixels[start..start + line]);
        }
        rect
    }
}

/// Bytes needed for `pixels`, `None` when that overflows the address space.
fn byte_size(pixels: usize) -> Option<usize> {
    pixels.checked_mul(BYTES_PER_PIXEL)
}
