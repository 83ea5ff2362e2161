// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transfer records passed to the texture runtime, clear-value derivation
//! for fill surfaces, and the morton swizzle codec.
//!
//! Tiled guest surfaces store pixels in 8x8 tiles laid out row-major from
//! the top of the image, with morton (Z-order) addressing inside each
//! tile. The linear side uses bottom-up rows, matching the host texture
//! origin. The codec moves pixels in the guest format; cross-format
//! conversion stays in the runtime.

use byteorder::{ByteOrder, LittleEndian};
use citrus_common::math::Rectangle;
use citrus_common::PAddr;

use super::pixel_format::{PixelFormat, SurfaceType};
use super::surface_params::SurfaceParams;
use crate::pica::texture::TextureFormat;

// ── Runtime transfer records ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Offset {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

/// Clear color/depth/stencil derived from a fill pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
    DepthStencil { depth: f32, stencil: u8 },
}

#[derive(Debug, Clone, Copy)]
pub struct TextureClear {
    pub texture_level: u32,
    pub texture_rect: Rectangle,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureCopy {
    pub src_level: u32,
    pub dst_level: u32,
    pub src_layer: u32,
    pub dst_layer: u32,
    pub src_offset: Offset,
    pub dst_offset: Offset,
    pub extent: Extent,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureBlit {
    pub src_level: u32,
    pub dst_level: u32,
    pub src_layer: u32,
    pub dst_layer: u32,
    pub src_rect: Rectangle,
    pub dst_rect: Rectangle,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferTextureCopy {
    pub buffer_offset: u32,
    pub buffer_size: u32,
    pub texture_rect: Rectangle,
    pub texture_level: u32,
}

/// Identity of a cube map: the six face addresses plus size and format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureCubeConfig {
    pub px: PAddr,
    pub nx: PAddr,
    pub py: PAddr,
    pub ny: PAddr,
    pub pz: PAddr,
    pub nz: PAddr,
    pub width: u32,
    pub format: TextureFormat,
}

// ── Clear value derivation ──────────────────────────────────────────────────

/// Decode one pixel of an uncompressed color/texture format to normalized
/// RGBA. The 3DS stores RGBA8 as ABGR bytes and packs 16-bit formats
/// little-endian.
fn decode_pixel(format: PixelFormat, bytes: &[u8]) -> [f32; 4] {
    let norm = |v: u8| v as f32 / 255.0;
    match format {
        PixelFormat::Rgba8 => [norm(bytes[3]), norm(bytes[2]), norm(bytes[1]), norm(bytes[0])],
        PixelFormat::Rgb8 => [norm(bytes[2]), norm(bytes[1]), norm(bytes[0]), 1.0],
        PixelFormat::Rgb5A1 => {
            let val = LittleEndian::read_u16(bytes);
            [
                ((val >> 11) & 0x1F) as f32 / 31.0,
                ((val >> 6) & 0x1F) as f32 / 31.0,
                ((val >> 1) & 0x1F) as f32 / 31.0,
                (val & 1) as f32,
            ]
        }
        PixelFormat::Rgb565 => {
            let val = LittleEndian::read_u16(bytes);
            [
                ((val >> 11) & 0x1F) as f32 / 31.0,
                ((val >> 5) & 0x3F) as f32 / 63.0,
                (val & 0x1F) as f32 / 31.0,
                1.0,
            ]
        }
        PixelFormat::Rgba4 => {
            let val = LittleEndian::read_u16(bytes);
            [
                ((val >> 12) & 0xF) as f32 / 15.0,
                ((val >> 8) & 0xF) as f32 / 15.0,
                ((val >> 4) & 0xF) as f32 / 15.0,
                (val & 0xF) as f32 / 15.0,
            ]
        }
        PixelFormat::Ia8 => [norm(bytes[1]), norm(bytes[1]), norm(bytes[1]), norm(bytes[0])],
        PixelFormat::Rg8 => [norm(bytes[1]), norm(bytes[0]), 0.0, 1.0],
        PixelFormat::I8 => [norm(bytes[0]), norm(bytes[0]), norm(bytes[0]), 1.0],
        PixelFormat::A8 => [0.0, 0.0, 0.0, norm(bytes[0])],
        PixelFormat::Ia4 => {
            let i = (bytes[0] >> 4) as f32 / 15.0;
            let a = (bytes[0] & 0xF) as f32 / 15.0;
            [i, i, i, a]
        }
        PixelFormat::I4 => {
            let i = (bytes[0] & 0xF) as f32 / 15.0;
            [i, i, i, 1.0]
        }
        PixelFormat::A4 => [0.0, 0.0, 0.0, (bytes[0] & 0xF) as f32 / 15.0],
        _ => [0.0, 0.0, 0.0, 0.0],
    }
}

/// Derive the backend clear value for a fill pattern targeting a surface
/// of the given type and format.
pub fn make_clear_value(ty: SurfaceType, format: PixelFormat, fill_data: &[u8; 4]) -> ClearValue {
    match ty {
        SurfaceType::Color | SurfaceType::Texture | SurfaceType::Fill => {
            ClearValue::Color(decode_pixel(format, fill_data))
        }
        SurfaceType::Depth => {
            let depth = match format {
                PixelFormat::D16 => LittleEndian::read_u16(fill_data) as f32 / 65535.0,
                PixelFormat::D24 => LittleEndian::read_u24(fill_data) as f32 / 16_777_215.0,
                _ => 0.0,
            };
            ClearValue::Depth(depth)
        }
        SurfaceType::DepthStencil => {
            let raw = LittleEndian::read_u32(fill_data);
            ClearValue::DepthStencil {
                depth: (raw & 0xFF_FFFF) as f32 / 16_777_215.0,
                stencil: (raw >> 24) as u8,
            }
        }
        SurfaceType::Invalid => unreachable!("clear value for invalid surface type"),
    }
}

// ── Morton swizzle codec ────────────────────────────────────────────────────

/// Z-order offset of pixel (x, y) inside an 8x8 tile.
fn morton_interleave(x: u32, y: u32) -> u32 {
    const XLUT: [u32; 8] = [0x00, 0x01, 0x04, 0x05, 0x10, 0x11, 0x14, 0x15];
    const YLUT: [u32; 8] = [0x00, 0x02, 0x08, 0x0A, 0x20, 0x22, 0x28, 0x2A];
    XLUT[(x % 8) as usize] + YLUT[(y % 8) as usize]
}

fn supports_morton(format: PixelFormat) -> bool {
    !matches!(
        format,
        PixelFormat::Etc1 | PixelFormat::Etc1A4 | PixelFormat::Invalid
    )
}

/// Per-pixel positions in the two representations. The tiled offset is
/// relative to the start of the copied byte range, the linear offset is
/// absolute within the sub-surface; both count nibbles for 4-bit formats.
fn morton_positions(
    params: &SurfaceParams,
    start: PAddr,
    end: PAddr,
) -> impl Iterator<Item = (usize, usize, bool)> + '_ {
    let bpp = params.bits_per_pixel();
    let nibble = bpp < 8;
    let start_offset = start - params.addr;
    let end_offset = end - params.addr;
    let tile_bytes = 8 * 8 * bpp / 8;
    let tiles_per_row = params.width / 8;

    let first_tile = start_offset / tile_bytes;
    let last_tile = (end_offset + tile_bytes - 1) / tile_bytes;

    (first_tile..last_tile).flat_map(move |tile| {
        let tile_base = tile * tile_bytes;
        let tile_x = (tile % tiles_per_row) * 8;
        let tile_y = (tile / tiles_per_row) * 8;
        (0..64).filter_map(move |i| {
            let (px, py) = (i % 8, i / 8);
            let morton = morton_interleave(px, py);
            let x = tile_x + px;
            // Tile rows run top-down; linear rows bottom-up.
            let y = params.height - 1 - (tile_y + py);
            let linear_pixel = y * params.stride + x;

            if nibble {
                let tiled_nibble = tile_base * 2 + morton;
                if tiled_nibble / 2 < start_offset || tiled_nibble / 2 >= end_offset {
                    return None;
                }
                Some((
                    (tiled_nibble - start_offset * 2) as usize,
                    linear_pixel as usize,
                    true,
                ))
            } else {
                let pixel_bytes = bpp / 8;
                let tiled_off = tile_base + morton * pixel_bytes;
                if tiled_off < start_offset || tiled_off + pixel_bytes > end_offset {
                    return None;
                }
                Some((
                    (tiled_off - start_offset) as usize,
                    (linear_pixel * pixel_bytes) as usize,
                    false,
                ))
            }
        })
    })
}

fn read_nibble(buf: &[u8], index: usize) -> u8 {
    (buf[index / 2] >> ((index % 2) * 4)) & 0xF
}

fn write_nibble(buf: &mut [u8], index: usize, value: u8) {
    let shift = (index % 2) * 4;
    buf[index / 2] = (buf[index / 2] & !(0xF << shift)) | (value << shift);
}

/// Convert morton-tiled guest data to linear rows.
///
/// `source_tiled` covers the byte range `[start, end)` of the sub-surface
/// described by `params`; `dest_linear` covers the whole sub-surface in
/// bottom-up rows.
pub fn unswizzle_texture(
    params: &SurfaceParams,
    start: PAddr,
    end: PAddr,
    source_tiled: &[u8],
    dest_linear: &mut [u8],
) {
    assert!(supports_morton(params.pixel_format));
    let pixel_bytes = (params.bits_per_pixel() / 8) as usize;
    for (tiled, linear, nibble) in morton_positions(params, start, end) {
        if nibble {
            write_nibble(dest_linear, linear, read_nibble(source_tiled, tiled));
        } else {
            dest_linear[linear..linear + pixel_bytes]
                .copy_from_slice(&source_tiled[tiled..tiled + pixel_bytes]);
        }
    }
}

/// Convert linear rows to morton-tiled guest data; the inverse of
/// [`unswizzle_texture`] with identical buffer conventions.
pub fn swizzle_texture(
    params: &SurfaceParams,
    start: PAddr,
    end: PAddr,
    source_linear: &[u8],
    dest_tiled: &mut [u8],
) {
    assert!(supports_morton(params.pixel_format));
    let pixel_bytes = (params.bits_per_pixel() / 8) as usize;
    for (tiled, linear, nibble) in morton_positions(params, start, end) {
        if nibble {
            write_nibble(dest_tiled, tiled, read_nibble(source_linear, linear));
        } else {
            dest_tiled[tiled..tiled + pixel_bytes]
                .copy_from_slice(&source_linear[linear..linear + pixel_bytes]);
        }
    }
}
