// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU rendering backend abstraction.
//!
//! The surface cache drives a `TextureRuntime`: allocation of host images,
//! buffer/image transfers, blits, clears, and the format reinterpreters
//! used when a cached image must be re-encoded bit-for-bit (for example
//! D24S8 depth/stencil into an integer color view). Real backends record
//! these into a command stream; `finish` is the synchronous barrier the
//! flush path uses before reading downloads back on the CPU.

pub mod null_backend;

use std::sync::Arc;

use citrus_common::math::Rectangle;
use parking_lot::Mutex;

use crate::rasterizer_cache::pixel_format::PixelFormat;
use crate::rasterizer_cache::surface::Surface;
use crate::rasterizer_cache::surface_params::SurfaceParams;
use crate::rasterizer_cache::utils::{
    BufferTextureCopy, ClearValue, TextureBlit, TextureClear, TextureCopy,
};

/// A host-visible staging buffer shared between the cache and the backend.
///
/// Uploads are filled by the cache before submission; downloads are filled
/// by the backend, no earlier than the `finish` barrier.
#[derive(Clone)]
pub struct StagingData {
    pub size: u32,
    pub offset: u32,
    pub data: Arc<Mutex<Vec<u8>>>,
}

impl StagingData {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            offset: 0,
            data: Arc::new(Mutex::new(vec![0u8; size as usize])),
        }
    }
}

/// A bit-preserving pixel re-encoder between two formats of equal width.
pub trait Reinterpreter<R: TextureRuntime>: Send + Sync {
    fn source_format(&self) -> PixelFormat;

    fn reinterpret(
        &self,
        runtime: &mut R,
        src: &Surface,
        src_rect: Rectangle,
        dst: &Surface,
        dst_rect: Rectangle,
    );
}

/// Texture services a rendering backend provides to the surface cache.
pub trait TextureRuntime {
    /// Acquire a staging buffer of at least `size` bytes.
    fn find_staging(&mut self, size: u32, upload: bool) -> StagingData;

    /// Create the host image backing `surface`. Called once at surface
    /// creation, before any transfer touches it.
    fn allocate_image(&mut self, surface: &Surface);

    /// Release the host image backing `surface`.
    fn destroy_image(&mut self, surface: &Surface);

    /// 1:1 texel copy between two images.
    fn copy_textures(&mut self, src: &Surface, dst: &Surface, copy: &TextureCopy) -> bool;

    /// Scaling blit between two images.
    fn blit_textures(&mut self, src: &Surface, dst: &Surface, blit: &TextureBlit) -> bool;

    /// Clear a rect of an image to a fixed value.
    fn clear_texture(&mut self, dst: &Surface, clear: &TextureClear, value: ClearValue);

    /// Buffer-to-image transfer of linear pixel data.
    fn upload(&mut self, surface: &Surface, upload: &BufferTextureCopy, staging: StagingData);

    /// Image-to-buffer transfer. The staging contents become observable
    /// after `finish`.
    fn download(&mut self, surface: &Surface, download: &BufferTextureCopy, staging: StagingData);

    /// Block until all recorded GPU work has completed.
    fn finish(&mut self);

    /// Whether `format` cannot be consumed natively and must go through
    /// `format_convert` on transfer.
    fn needs_conversion(&self, format: PixelFormat) -> bool;

    /// Convert between the guest byte layout and the backend's host
    /// layout for `params.pixel_format`. `upload` selects the direction.
    fn format_convert(&self, params: &SurfaceParams, upload: bool, src: &[u8], dst: &mut [u8]);

    /// Host-side bytes per pixel for staging sizing.
    fn internal_bytes_per_pixel(&self, format: PixelFormat) -> u32 {
        (format.bits_per_pixel() / 8).max(1)
    }

    /// The ordered reinterpreter list for a destination format. The first
    /// source format with a cached candidate wins.
    fn reinterpreters(&self, dest_format: PixelFormat) -> Vec<Arc<dyn Reinterpreter<Self>>>
    where
        Self: Sized;
}
