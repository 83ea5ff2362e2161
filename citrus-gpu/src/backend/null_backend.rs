// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software texture runtime.
//!
//! Keeps every host image as a linear byte array at scaled resolution and
//! executes transfers on the CPU. Downloads honor the barrier contract:
//! the staging buffer is filled at `finish`, from a snapshot taken in
//! submission order. Useful headless and as the reference behavior for
//! the cache tests.

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use citrus_common::math::Rectangle;

use super::{Reinterpreter, StagingData, TextureRuntime};
use crate::rasterizer_cache::pixel_format::PixelFormat;
use crate::rasterizer_cache::surface::{Surface, SurfaceId};
use crate::rasterizer_cache::surface_params::TextureType;
use crate::rasterizer_cache::utils::{
    BufferTextureCopy, ClearValue, TextureBlit, TextureClear, TextureCopy,
};

struct Image {
    width: u32,
    height: u32,
    layers: u32,
    pixel_bytes: u32,
    data: Vec<u8>,
}

impl Image {
    fn index(&self, layer: u32, x: u32, y: u32) -> usize {
        (((layer * self.height + y) * self.width + x) * self.pixel_bytes) as usize
    }
}

struct PendingDownload {
    staging: StagingData,
    snapshot: Vec<u8>,
}

/// A rect with a non-flipped origin, clamped to image bounds.
fn normalize(rect: Rectangle) -> (u32, u32, u32, u32) {
    let x0 = rect.left.min(rect.right);
    let y0 = rect.top.min(rect.bottom);
    (x0, y0, rect.width(), rect.height())
}

/// Encode a clear value into one pixel of the image's byte layout.
fn encode_clear(format: PixelFormat, value: &ClearValue, out: &mut [u8]) {
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    match (value, format) {
        (ClearValue::Color([r, g, b, a]), PixelFormat::Rgba8) => {
            // Guest RGBA8 is stored as ABGR bytes.
            out[0] = to_u8(*a);
            out[1] = to_u8(*b);
            out[2] = to_u8(*g);
            out[3] = to_u8(*r);
        }
        (ClearValue::Color([r, g, b, _]), PixelFormat::Rgb8) => {
            out[0] = to_u8(*b);
            out[1] = to_u8(*g);
            out[2] = to_u8(*r);
        }
        (ClearValue::Color([r, g, b, _]), PixelFormat::Rgb565) => {
            let packed = (((r.clamp(0.0, 1.0) * 31.0).round() as u16) << 11)
                | (((g.clamp(0.0, 1.0) * 63.0).round() as u16) << 5)
                | ((b.clamp(0.0, 1.0) * 31.0).round() as u16);
            LittleEndian::write_u16(out, packed);
        }
        (ClearValue::Color([r, g, b, a]), PixelFormat::Rgb5A1) => {
            let packed = (((r.clamp(0.0, 1.0) * 31.0).round() as u16) << 11)
                | (((g.clamp(0.0, 1.0) * 31.0).round() as u16) << 6)
                | (((b.clamp(0.0, 1.0) * 31.0).round() as u16) << 1)
                | ((*a >= 0.5) as u16);
            LittleEndian::write_u16(out, packed);
        }
        (ClearValue::Color([r, g, b, a]), PixelFormat::Rgba4) => {
            let packed = (((r.clamp(0.0, 1.0) * 15.0).round() as u16) << 12)
                | (((g.clamp(0.0, 1.0) * 15.0).round() as u16) << 8)
                | (((b.clamp(0.0, 1.0) * 15.0).round() as u16) << 4)
                | ((a.clamp(0.0, 1.0) * 15.0).round() as u16);
            LittleEndian::write_u16(out, packed);
        }
        (ClearValue::Depth(depth), PixelFormat::D16) => {
            LittleEndian::write_u16(out, (depth.clamp(0.0, 1.0) * 65535.0).round() as u16);
        }
        (ClearValue::Depth(depth), PixelFormat::D24) => {
            LittleEndian::write_u24(out, (depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32);
        }
        (ClearValue::DepthStencil { depth, stencil }, PixelFormat::D24S8) => {
            let packed = ((*stencil as u32) << 24)
                | ((depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32 & 0xFF_FFFF);
            LittleEndian::write_u32(out, packed);
        }
        _ => {
            log::warn!("Null backend: unsupported clear for {}", format.as_str());
            out.fill(0);
        }
    }
}

/// Bit-preserving D24S8 -> RGBA8 reinterpreter; both formats are 32 bits
/// wide so the null backend moves raw pixels.
struct D24S8ToRgba8;

impl Reinterpreter<NullRuntime> for D24S8ToRgba8 {
    fn source_format(&self) -> PixelFormat {
        PixelFormat::D24S8
    }

    fn reinterpret(
        &self,
        runtime: &mut NullRuntime,
        src: &Surface,
        src_rect: Rectangle,
        dst: &Surface,
        dst_rect: Rectangle,
    ) {
        runtime.copy_rect_between(src.id(), src_rect, dst.id(), dst_rect, 0, 0);
    }
}

/// CPU texture runtime with immediate transfers and deferred downloads.
pub struct NullRuntime {
    images: HashMap<SurfaceId, Image>,
    pending_downloads: Vec<PendingDownload>,
    pub upload_count: usize,
    pub download_count: usize,
    pub finish_count: usize,
}

impl NullRuntime {
    pub fn new() -> Self {
        Self {
            images: HashMap::new(),
            pending_downloads: Vec::new(),
            upload_count: 0,
            download_count: 0,
            finish_count: 0,
        }
    }

    /// Raw bytes of a surface's host image, for inspection in tests.
    pub fn image_bytes(&self, surface: &Surface) -> Option<&[u8]> {
        self.images.get(&surface.id()).map(|image| &image.data[..])
    }

    /// Nearest-filtered rect copy between two images.
    fn copy_rect_between(
        &mut self,
        src_id: SurfaceId,
        src_rect: Rectangle,
        dst_id: SurfaceId,
        dst_rect: Rectangle,
        src_layer: u32,
        dst_layer: u32,
    ) -> bool {
        let (sx0, sy0, sw, sh) = normalize(src_rect);
        let (dx0, dy0, dw, dh) = normalize(dst_rect);
        if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
            return false;
        }

        let Some(src) = self.images.get(&src_id) else {
            return false;
        };
        let pixel_bytes = src.pixel_bytes as usize;

        // Gather the source rect first so aliased src == dst copies stay
        // well-defined.
        let mut source = vec![0u8; (sw * sh) as usize * pixel_bytes];
        for y in 0..sh {
            for x in 0..sw {
                let src_idx = src.index(src_layer, sx0 + x, sy0 + y);
                let out = ((y * sw + x) as usize) * pixel_bytes;
                source[out..out + pixel_bytes]
                    .copy_from_slice(&src.data[src_idx..src_idx + pixel_bytes]);
            }
        }

        let Some(dst) = self.images.get_mut(&dst_id) else {
            return false;
        };
        debug_assert_eq!(dst.pixel_bytes as usize, pixel_bytes);
        for y in 0..dh {
            for x in 0..dw {
                let sx = x * sw / dw;
                let sy = y * sh / dh;
                let src_off = ((sy * sw + sx) as usize) * pixel_bytes;
                let dst_idx = dst.index(dst_layer, dx0 + x, dy0 + y);
                dst.data[dst_idx..dst_idx + pixel_bytes]
                    .copy_from_slice(&source[src_off..src_off + pixel_bytes]);
            }
        }
        true
    }
}

impl TextureRuntime for NullRuntime {
    fn find_staging(&mut self, size: u32, _upload: bool) -> StagingData {
        StagingData::new(size)
    }

    fn allocate_image(&mut self, surface: &Surface) {
        let params = &surface.params;
        let pixel_bytes = self.internal_bytes_per_pixel(params.pixel_format);
        let layers = match params.texture_type {
            TextureType::CubeMap => 6,
            TextureType::Texture2D => 1,
        };
        let width = params.scaled_width().max(1);
        let height = params.scaled_height().max(1);
        self.images.insert(
            surface.id(),
            Image {
                width,
                height,
                layers,
                pixel_bytes,
                data: vec![0u8; (width * height * layers * pixel_bytes) as usize],
            },
        );
    }

    fn destroy_image(&mut self, surface: &Surface) {
        self.images.remove(&surface.id());
    }

    fn copy_textures(&mut self, src: &Surface, dst: &Surface, copy: &TextureCopy) -> bool {
        if copy.src_level != 0 || copy.dst_level != 0 {
            // Only level 0 is materialized; mip transfers are accepted
            // and dropped.
            return true;
        }
        let src_rect = Rectangle::new(
            copy.src_offset.x,
            copy.src_offset.y + copy.extent.height,
            copy.src_offset.x + copy.extent.width,
            copy.src_offset.y,
        );
        let dst_rect = Rectangle::new(
            copy.dst_offset.x,
            copy.dst_offset.y + copy.extent.height,
            copy.dst_offset.x + copy.extent.width,
            copy.dst_offset.y,
        );
        self.copy_rect_between(
            src.id(),
            src_rect,
            dst.id(),
            dst_rect,
            copy.src_layer,
            copy.dst_layer,
        )
    }

    fn blit_textures(&mut self, src: &Surface, dst: &Surface, blit: &TextureBlit) -> bool {
        if blit.src_level != 0 || blit.dst_level != 0 {
            return true;
        }
        self.copy_rect_between(
            src.id(),
            blit.src_rect,
            dst.id(),
            blit.dst_rect,
            blit.src_layer,
            blit.dst_layer,
        )
    }

    fn clear_texture(&mut self, dst: &Surface, clear: &TextureClear, value: ClearValue) {
        let Some(image) = self.images.get_mut(&dst.id()) else {
            return;
        };
        let mut pixel = vec![0u8; image.pixel_bytes as usize];
        encode_clear(dst.params.pixel_format, &value, &mut pixel);

        let (x0, y0, w, h) = normalize(clear.texture_rect);
        for y in 0..h {
            for x in 0..w {
                let idx = image.index(0, x0 + x, y0 + y);
                image.data[idx..idx + pixel.len()].copy_from_slice(&pixel);
            }
        }
    }

    fn upload(&mut self, surface: &Surface, upload: &BufferTextureCopy, staging: StagingData) {
        self.upload_count += 1;
        let scale = surface.params.res_scale as u32;
        let Some(image) = self.images.get_mut(&surface.id()) else {
            return;
        };
        let (x0, y0, w, h) = normalize(upload.texture_rect);
        let pixel_bytes = image.pixel_bytes as usize;
        let data = staging.data.lock();

        // The staging rect is unscaled; replicate into the scaled image.
        for y in 0..h * scale {
            for x in 0..w * scale {
                let src = (((y / scale) * w + (x / scale)) as usize) * pixel_bytes;
                if src + pixel_bytes > data.len() {
                    continue;
                }
                let dst = image.index(0, x0 * scale + x, y0 * scale + y);
                image.data[dst..dst + pixel_bytes].copy_from_slice(&data[src..src + pixel_bytes]);
            }
        }
    }

    fn download(&mut self, surface: &Surface, download: &BufferTextureCopy, staging: StagingData) {
        self.download_count += 1;
        let scale = surface.params.res_scale as u32;
        let Some(image) = self.images.get(&surface.id()) else {
            return;
        };
        let (x0, y0, w, h) = normalize(download.texture_rect);
        let pixel_bytes = image.pixel_bytes as usize;

        // Snapshot now (submission order), expose at finish.
        let mut snapshot = vec![0u8; (w * h) as usize * pixel_bytes];
        for y in 0..h {
            for x in 0..w {
                let src = image.index(0, (x0 + x) * scale, (y0 + y) * scale);
                let dst = ((y * w + x) as usize) * pixel_bytes;
                snapshot[dst..dst + pixel_bytes].copy_from_slice(&image.data[src..src + pixel_bytes]);
            }
        }
        self.pending_downloads.push(PendingDownload { staging, snapshot });
    }

    fn finish(&mut self) {
        self.finish_count += 1;
        for pending in self.pending_downloads.drain(..) {
            let mut data = pending.staging.data.lock();
            let len = data.len().min(pending.snapshot.len());
            data[..len].copy_from_slice(&pending.snapshot[..len]);
        }
    }

    fn needs_conversion(&self, _format: PixelFormat) -> bool {
        false
    }

    fn format_convert(
        &self,
        _params: &crate::rasterizer_cache::surface_params::SurfaceParams,
        _upload: bool,
        src: &[u8],
        dst: &mut [u8],
    ) {
        let len = src.len().min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
    }

    fn reinterpreters(&self, dest_format: PixelFormat) -> Vec<Arc<dyn Reinterpreter<Self>>> {
        match dest_format {
            PixelFormat::Rgba8 => vec![Arc::new(D24S8ToRgba8)],
            _ => Vec::new(),
        }
    }
}

impl Default for NullRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterizer_cache::surface_params::SurfaceParams;

    fn make_surface(width: u32, height: u32, scale: u16) -> crate::rasterizer_cache::surface::SurfaceRef {
        let mut params = SurfaceParams {
            addr: 0x1800_0000,
            width,
            height,
            res_scale: scale,
            pixel_format: PixelFormat::Rgba8,
            ..Default::default()
        };
        params.update_params();
        Surface::new(params)
    }

    #[test]
    fn test_upload_then_download_round_trip() {
        let mut runtime = NullRuntime::new();
        let surface = make_surface(4, 4, 1);
        runtime.allocate_image(&surface);

        let staging = runtime.find_staging(4 * 4 * 4, true);
        {
            let mut data = staging.data.lock();
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = i as u8;
            }
        }
        let copy = BufferTextureCopy {
            buffer_offset: 0,
            buffer_size: 4 * 4 * 4,
            texture_rect: surface.params.rect(),
            texture_level: 0,
        };
        runtime.upload(&surface, &copy, staging);

        let readback = runtime.find_staging(4 * 4 * 4, false);
        runtime.download(&surface, &copy, readback.clone());

        // Nothing visible before the barrier.
        assert!(readback.data.lock().iter().all(|&b| b == 0));
        runtime.finish();

        let data = readback.data.lock();
        for (i, &byte) in data.iter().enumerate() {
            assert_eq!(byte, i as u8);
        }
    }

    #[test]
    fn test_scaled_upload_replicates_pixels() {
        let mut runtime = NullRuntime::new();
        let surface = make_surface(2, 2, 2);
        runtime.allocate_image(&surface);

        let staging = runtime.find_staging(2 * 2 * 4, true);
        staging.data.lock()[0..4].copy_from_slice(&[9, 9, 9, 9]);
        let copy = BufferTextureCopy {
            buffer_offset: 0,
            buffer_size: 2 * 2 * 4,
            texture_rect: surface.params.rect(),
            texture_level: 0,
        };
        runtime.upload(&surface, &copy, staging);

        // The first staging pixel covers a 2x2 block of the scaled image.
        let image = runtime.image_bytes(&surface).unwrap();
        assert_eq!(&image[0..4], &[9, 9, 9, 9]);
        assert_eq!(&image[4..8], &[9, 9, 9, 9]);
        let row = 4 * 4;
        assert_eq!(&image[row..row + 4], &[9, 9, 9, 9]);
    }

    #[test]
    fn test_clear_texture_rgba8() {
        let mut runtime = NullRuntime::new();
        let surface = make_surface(2, 2, 1);
        runtime.allocate_image(&surface);

        runtime.clear_texture(
            &surface,
            &TextureClear {
                texture_level: 0,
                texture_rect: surface.params.rect(),
            },
            ClearValue::Color([1.0, 0.0, 0.0, 1.0]),
        );

        // ABGR byte order.
        let image = runtime.image_bytes(&surface).unwrap();
        assert_eq!(&image[0..4], &[0xFF, 0x00, 0x00, 0xFF]);
    }

    #[test]
    fn test_blit_scales() {
        let mut runtime = NullRuntime::new();
        let small = make_surface(2, 2, 1);
        let big = make_surface(4, 4, 1);
        runtime.allocate_image(&small);
        runtime.allocate_image(&big);

        // Paint the small image solid.
        runtime.clear_texture(
            &small,
            &TextureClear {
                texture_level: 0,
                texture_rect: small.params.rect(),
            },
            ClearValue::Color([0.0, 1.0, 0.0, 1.0]),
        );

        let blit = TextureBlit {
            src_level: 0,
            dst_level: 0,
            src_layer: 0,
            dst_layer: 0,
            src_rect: small.params.rect(),
            dst_rect: big.params.rect(),
        };
        assert!(runtime.blit_textures(&small, &big, &blit));

        let image = runtime.image_bytes(&big).unwrap();
        assert_eq!(&image[0..4], &[0xFF, 0x00, 0xFF, 0x00]);
        let last = image.len() - 4;
        assert_eq!(&image[last..], &[0xFF, 0x00, 0xFF, 0x00]);
    }
}
