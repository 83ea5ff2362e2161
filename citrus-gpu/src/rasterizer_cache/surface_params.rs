// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Surface parameters and the address/pixel arithmetic used for matching.
//!
//! A surface covers the guest byte range `[addr, end)`. Tiled surfaces
//! store pixels in 8x8 blocks, so one "tile row" of a tiled surface spans
//! `stride * 8` pixels of memory. Rectangles follow the guest convention:
//! tiled surfaces are stored top-down, linear ones bottom-up.

use citrus_common::math::Rectangle;
use citrus_common::types::{align_down, align_up, PAddr};

use super::interval::SurfaceInterval;
use super::pixel_format::{PixelFormat, SurfaceType};

/// Host texture shape for a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureType {
    Texture2D,
    CubeMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceParams {
    pub addr: PAddr,
    pub end: PAddr,
    pub size: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// Integer upscale factor of the host image relative to guest pixels.
    /// Fill surfaces use `u16::MAX` so they sort as always preferable.
    pub res_scale: u16,
    pub is_tiled: bool,
    pub texture_type: TextureType,
    pub pixel_format: PixelFormat,
    pub surface_type: SurfaceType,
}

impl Default for SurfaceParams {
    fn default() -> Self {
        Self {
            addr: 0,
            end: 0,
            size: 0,
            width: 0,
            height: 0,
            stride: 0,
            res_scale: 1,
            is_tiled: false,
            texture_type: TextureType::Texture2D,
            pixel_format: PixelFormat::Invalid,
            surface_type: SurfaceType::Invalid,
        }
    }
}

impl SurfaceParams {
    /// Recompute the derived fields (stride default, surface type, byte
    /// size and end address) after the caller fills in the basics.
    pub fn update_params(&mut self) {
        if self.stride == 0 {
            self.stride = self.width;
        }
        if self.surface_type != SurfaceType::Fill {
            self.surface_type = self.pixel_format.surface_type();
        }
        self.size = if self.is_tiled {
            self.bytes_in_pixels(self.stride * 8 * (self.height / 8 - 1) + self.width * 8)
        } else {
            self.bytes_in_pixels(self.stride * (self.height - 1) + self.width)
        };
        self.end = self.addr + self.size;
    }

    pub fn bits_per_pixel(&self) -> u32 {
        self.pixel_format.bits_per_pixel()
    }

    pub fn bytes_in_pixels(&self, pixels: u32) -> u32 {
        (pixels as u64 * self.bits_per_pixel() as u64 / 8) as u32
    }

    pub fn pixels_in_bytes(&self, bytes: u32) -> u32 {
        (bytes as u64 * 8 / self.bits_per_pixel() as u64) as u32
    }

    pub fn interval(&self) -> SurfaceInterval {
        SurfaceInterval::new(self.addr, self.end)
    }

    pub fn scaled_width(&self) -> u32 {
        self.width * self.res_scale as u32
    }

    pub fn scaled_height(&self) -> u32 {
        self.height * self.res_scale as u32
    }

    /// The full unscaled rect; `top = height` because rows are indexed
    /// from the bottom of the image on the host side.
    pub fn rect(&self) -> Rectangle {
        Rectangle::new(0, self.height, self.width, 0)
    }

    pub fn scaled_rect(&self) -> Rectangle {
        self.rect().scaled(self.res_scale as u32)
    }

    /// Derive the params of the smallest well-formed sub-surface covering
    /// `interval`. The result is either a run of full (tile-)rows, or a
    /// part of a single row aligned to the tile size.
    pub fn from_interval(&self, interval: SurfaceInterval) -> SurfaceParams {
        let mut params = *self;
        let tiled_size = if self.is_tiled { 8 } else { 1 };
        let stride_tiled_bytes = self.bytes_in_pixels(self.stride * tiled_size);

        let mut aligned_start =
            self.addr + align_down(interval.start - self.addr, stride_tiled_bytes);
        let mut aligned_end = self.addr + align_up(interval.end - self.addr, stride_tiled_bytes);

        if aligned_end - aligned_start > stride_tiled_bytes {
            params.addr = aligned_start;
            params.height = (aligned_end - aligned_start) / self.bytes_in_pixels(self.stride);
        } else {
            // Single row: align to the tile instead.
            debug_assert_eq!(aligned_end - aligned_start, stride_tiled_bytes);
            let tiled_alignment = self.bytes_in_pixels(if self.is_tiled { 8 * 8 } else { 1 });
            aligned_start = self.addr + align_down(interval.start - self.addr, tiled_alignment);
            aligned_end = self.addr + align_up(interval.end - self.addr, tiled_alignment);
            params.addr = aligned_start;
            params.width = self.pixels_in_bytes(aligned_end - aligned_start) / tiled_size;
            params.stride = params.width;
            params.height = tiled_size;
        }
        params.update_params();
        params
    }

    /// The pixel rect of `sub_surface` inside this surface, unscaled.
    pub fn sub_rect(&self, sub_surface: &SurfaceParams) -> Rectangle {
        let begin_pixel_index = self.pixels_in_bytes(sub_surface.addr - self.addr);
        if self.is_tiled {
            let x0 = (begin_pixel_index % (self.stride * 8)) / 8;
            let y0 = (begin_pixel_index / (self.stride * 8)) * 8;
            // Tiled surfaces are stored top-down.
            Rectangle::new(
                x0,
                self.height - y0,
                x0 + sub_surface.width,
                self.height - (y0 + sub_surface.height),
            )
        } else {
            let x0 = begin_pixel_index % self.stride;
            let y0 = begin_pixel_index / self.stride;
            // Linear surfaces are stored bottom-up.
            Rectangle::new(x0, y0 + sub_surface.height, x0 + sub_surface.width, y0)
        }
    }

    pub fn scaled_sub_rect(&self, sub_surface: &SurfaceParams) -> Rectangle {
        self.sub_rect(sub_surface).scaled(self.res_scale as u32)
    }

    /// The byte interval covered by `unscaled_rect` within this surface.
    pub fn sub_rect_interval(&self, mut unscaled_rect: Rectangle) -> SurfaceInterval {
        if unscaled_rect.height() == 0 || unscaled_rect.width() == 0 {
            return SurfaceInterval::default();
        }

        if self.is_tiled {
            unscaled_rect.left = align_down(unscaled_rect.left, 8);
            unscaled_rect.bottom = align_down(unscaled_rect.bottom, 8);
            unscaled_rect.right = align_up(unscaled_rect.right, 8);
            unscaled_rect.top = align_up(unscaled_rect.top, 8);
        }

        let tile_size = if self.is_tiled { 8 } else { 1 };
        // One (tile-)row spans stride * tile_size pixels of memory.
        let stride_tiled = self.stride * tile_size;
        let rows_from_start = if self.is_tiled {
            (self.height - unscaled_rect.top) / 8
        } else {
            unscaled_rect.bottom
        };
        let pixel_offset = stride_tiled * rows_from_start + unscaled_rect.left * tile_size;
        let pixels = (unscaled_rect.height() / tile_size - 1) * stride_tiled
            + unscaled_rect.width() * tile_size;

        SurfaceInterval::new(
            self.addr + self.bytes_in_pixels(pixel_offset),
            self.addr + self.bytes_in_pixels(pixel_offset + pixels),
        )
    }

    // ── Match predicates ────────────────────────────────────────────────

    pub fn exact_match(&self, other: &SurfaceParams) -> bool {
        self.addr == other.addr
            && self.width == other.width
            && self.height == other.height
            && self.stride == other.stride
            && self.pixel_format == other.pixel_format
            && self.is_tiled == other.is_tiled
            && self.pixel_format != PixelFormat::Invalid
    }

    /// Whether `sub_surface` describes a well-formed sub-rect of this
    /// surface: same format and tiling, tile-aligned offset, and rows
    /// that line up with our stride.
    pub fn can_sub_rect(&self, sub_surface: &SurfaceParams) -> bool {
        sub_surface.addr >= self.addr
            && sub_surface.end <= self.end
            && sub_surface.pixel_format == self.pixel_format
            && self.pixel_format != PixelFormat::Invalid
            && sub_surface.is_tiled == self.is_tiled
            && (sub_surface.addr - self.addr)
                % self.bytes_in_pixels(if self.is_tiled { 64 } else { 1 })
                == 0
            && (sub_surface.stride == self.stride
                || sub_surface.height <= if self.is_tiled { 8 } else { 1 })
            && self.sub_rect(sub_surface).left + sub_surface.width <= self.stride
    }

    /// Whether this surface could be grown to contain `expanded`: same
    /// format, tiling and stride, overlapping or adjacent intervals, and
    /// a whole number of (tile-)rows between the two base addresses.
    pub fn can_expand(&self, expanded: &SurfaceParams) -> bool {
        self.pixel_format != PixelFormat::Invalid
            && self.pixel_format == expanded.pixel_format
            && self.addr <= expanded.end
            && expanded.addr <= self.end
            && self.is_tiled == expanded.is_tiled
            && self.stride == expanded.stride
            && (expanded.addr.max(self.addr) - expanded.addr.min(self.addr))
                % self.bytes_in_pixels(self.stride * if self.is_tiled { 8 } else { 1 })
                == 0
    }

    /// Whether this surface can serve a display-transfer "texture copy"
    /// described by `texcopy`, whose width/stride are in bytes.
    pub fn can_tex_copy(&self, texcopy: &SurfaceParams) -> bool {
        if self.pixel_format == PixelFormat::Invalid
            || self.addr > texcopy.addr
            || self.end < texcopy.end
        {
            return false;
        }

        if texcopy.width != texcopy.stride {
            let tile_stride = self.bytes_in_pixels(self.stride * if self.is_tiled { 8 } else { 1 });
            let tile_align = self.bytes_in_pixels(if self.is_tiled { 64 } else { 1 });
            (texcopy.addr - self.addr) % tile_align == 0
                && texcopy.width % tile_align == 0
                && (texcopy.height == 1 || texcopy.stride == tile_stride)
                && ((texcopy.addr - self.addr) % tile_stride) + texcopy.width <= tile_stride
        } else {
            self.from_interval(texcopy.interval()).interval() == texcopy.interval()
        }
    }
}
