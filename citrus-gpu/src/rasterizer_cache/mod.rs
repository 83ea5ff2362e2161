// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rasterizer surface cache.
//!
//! Bridges guest physical memory and host GPU images. Guest writes
//! invalidate overlapping cached surfaces, draws pull surfaces out of the
//! cache (validating stale regions from other surfaces, reinterpreters or
//! guest memory), and CPU reads flush host-rendered pixels back into
//! guest memory.
//!
//! A single rasterizer thread drives the cache. CPU write callbacks from
//! the memory system enter `flush_region`/`invalidate_region` from other
//! threads; callers serialize those entry points through one outer mutex,
//! and removal is staged so no path unregisters surfaces while another
//! loop is walking the catalog.

pub mod interval;
pub mod pixel_format;
pub mod surface;
pub mod surface_params;
pub mod utils;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bitflags::bitflags;
use citrus_common::math::Rectangle;
use citrus_common::types::{align_up, PAddr};
use log::{debug, error, warn};

use crate::backend::{StagingData, TextureRuntime};
use crate::memory::GuestMemory;
use crate::page_tracker::PageTracker;
use crate::pica::regs::MemoryFillConfig;
use crate::pica::texture::TextureInfo;

use interval::{IntervalMap, IntervalSet, SurfaceInterval};
use pixel_format::{formats_blittable, PixelFormat, SurfaceType, ALL_FORMATS};
use surface::{Surface, SurfaceRef};
use surface_params::{SurfaceParams, TextureType};
use utils::{
    make_clear_value, swizzle_texture, unswizzle_texture, BufferTextureCopy, Extent, Offset,
    TextureBlit, TextureClear, TextureCopy, TextureCubeConfig,
};

/// How strictly a candidate's resolution scale must match the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMatch {
    /// Only accept the same scale.
    Exact,
    /// Only accept the same or a higher scale.
    Upscale,
    /// Accept any scale.
    Ignore,
}

bitflags! {
    /// Predicates a `find_match` candidate may satisfy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchFlags: u32 {
        /// Surface is allowed to be only partially valid.
        const INVALID = 1;
        /// Surface perfectly matches the params.
        const EXACT = 1 << 1;
        /// Surface encompasses the params.
        const SUB_RECT = 1 << 2;
        /// Surface can be used as a copy source over the validate interval.
        const COPY = 1 << 3;
        /// Surface could be grown to contain the params.
        const EXPAND = 1 << 4;
        /// Surface matches a display-transfer "texture copy".
        const TEX_COPY = 1 << 5;
    }
}

/// Framebuffer configuration decoded from the framebuffer registers.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferConfig {
    pub width: u32,
    pub height: u32,
    pub color_format: PixelFormat,
    pub depth_format: PixelFormat,
    pub color_addr: PAddr,
    pub depth_addr: PAddr,
}

/// A viewport rect in render-target coordinates, possibly extending past
/// the target bounds.
#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Catalog of registered surfaces with interval overlap queries. Each
/// surface occupies exactly its own `[addr, end)` interval, so a map
/// keyed by start address is enough to enumerate overlaps.
#[derive(Default)]
struct SurfaceIndex {
    by_addr: BTreeMap<PAddr, Vec<SurfaceRef>>,
    len: usize,
}

impl SurfaceIndex {
    fn insert(&mut self, surface: &SurfaceRef) {
        self.by_addr
            .entry(surface.params.addr)
            .or_default()
            .push(surface.clone());
        self.len += 1;
    }

    fn remove(&mut self, surface: &SurfaceRef) {
        if let Some(bucket) = self.by_addr.get_mut(&surface.params.addr) {
            if let Some(pos) = bucket.iter().position(|s| s.id() == surface.id()) {
                bucket.swap_remove(pos);
                self.len -= 1;
            }
            if bucket.is_empty() {
                self.by_addr.remove(&surface.params.addr);
            }
        }
    }

    fn overlapping(&self, interval: SurfaceInterval) -> Vec<SurfaceRef> {
        if interval.is_empty() {
            return Vec::new();
        }
        self.by_addr
            .range(..interval.end)
            .flat_map(|(_, bucket)| bucket.iter())
            .filter(|s| s.params.end > interval.start)
            .cloned()
            .collect()
    }

    fn all(&self) -> Vec<SurfaceRef> {
        self.by_addr
            .values()
            .flat_map(|bucket| bucket.iter())
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// A deferred swizzle-and-write of downloaded pixels back to guest
/// memory, run only after the backend barrier.
struct DownloadTask {
    flush_info: SurfaceParams,
    interval: SurfaceInterval,
    staging: StagingData,
}

impl DownloadTask {
    fn execute<R: TextureRuntime>(&self, memory: &dyn GuestMemory, runtime: &R) {
        let mapped = self.staging.data.lock();
        let len = self.interval.len() as usize;

        if self.flush_info.is_tiled {
            let mut tiled = vec![0u8; len];
            if runtime.needs_conversion(self.flush_info.pixel_format) {
                let mut linear = vec![0u8; self.flush_info.size as usize];
                runtime.format_convert(&self.flush_info, false, &mapped, &mut linear);
                swizzle_texture(
                    &self.flush_info,
                    self.interval.start,
                    self.interval.end,
                    &linear,
                    &mut tiled,
                );
            } else {
                swizzle_texture(
                    &self.flush_info,
                    self.interval.start,
                    self.interval.end,
                    &mapped,
                    &mut tiled,
                );
            }
            memory.write(self.interval.start, &tiled);
        } else {
            let mut guest = vec![0u8; self.flush_info.size as usize];
            runtime.format_convert(&self.flush_info, false, &mapped, &mut guest);
            let offset = (self.interval.start - self.flush_info.addr) as usize;
            memory.write(self.interval.start, &guest[offset..offset + len]);
        }
    }
}

pub struct RasterizerCache<R: TextureRuntime> {
    memory: Arc<dyn GuestMemory>,
    runtime: R,
    page_tracker: PageTracker,
    surface_cache: SurfaceIndex,
    dirty_regions: IntervalMap<SurfaceRef>,
    remove_surfaces: Vec<SurfaceRef>,
    texture_cube_cache: HashMap<TextureCubeConfig, SurfaceRef>,
    download_queue: Vec<DownloadTask>,
    resolution_scale_factor: u16,
}

impl<R: TextureRuntime> RasterizerCache<R> {
    pub fn new(memory: Arc<dyn GuestMemory>, runtime: R, resolution_scale_factor: u16) -> Self {
        Self {
            page_tracker: PageTracker::new(memory.clone()),
            memory,
            runtime,
            surface_cache: SurfaceIndex::default(),
            dirty_regions: IntervalMap::new(),
            remove_surfaces: Vec::new(),
            texture_cube_cache: HashMap::new(),
            download_queue: Vec::new(),
            resolution_scale_factor,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn page_tracker_mut(&mut self) -> &mut PageTracker {
        &mut self.page_tracker
    }

    /// Number of registered surfaces.
    pub fn surface_count(&self) -> usize {
        self.surface_cache.len()
    }

    // ── Matching ────────────────────────────────────────────────────────

    /// Get the best surface match for the given flags.
    ///
    /// Candidates are filtered by scale policy and validity, then ranked
    /// lexicographically: higher scale first, then valid over invalid,
    /// then longer matched interval.
    pub fn find_match(
        &self,
        params: &SurfaceParams,
        match_scale_type: ScaleMatch,
        validate_interval: Option<SurfaceInterval>,
        find_flags: MatchFlags,
    ) -> Option<SurfaceRef> {
        let mut match_surface: Option<SurfaceRef> = None;
        let mut match_valid = false;
        let mut match_scale: u16 = 0;
        let mut match_interval = SurfaceInterval::default();

        for surface in self.surface_cache.overlapping(params.interval()) {
            let res_scale_matched = match match_scale_type {
                ScaleMatch::Exact => params.res_scale == surface.params.res_scale,
                _ => params.res_scale <= surface.params.res_scale,
            };
            // Validity over the copy interval is checked by
            // get_copyable_interval instead.
            let is_valid = if find_flags.contains(MatchFlags::COPY) {
                true
            } else {
                surface.is_region_valid(validate_interval.unwrap_or_else(|| params.interval()))
            };

            if !find_flags.contains(MatchFlags::INVALID) && !is_valid {
                continue;
            }

            let mut consider = |matched: bool, surface_interval: SurfaceInterval| {
                if !matched {
                    return;
                }
                if !res_scale_matched
                    && match_scale_type != ScaleMatch::Ignore
                    && surface.params.surface_type != SurfaceType::Fill
                {
                    return;
                }

                let better = if surface.params.res_scale != match_scale {
                    surface.params.res_scale > match_scale
                } else if is_valid != match_valid {
                    is_valid
                } else {
                    surface_interval.len() > match_interval.len()
                };

                if better {
                    match_surface = Some(surface.clone());
                    match_valid = is_valid;
                    match_scale = surface.params.res_scale;
                    match_interval = surface_interval;
                }
            };

            if find_flags.contains(MatchFlags::EXACT) {
                consider(surface.params.exact_match(params), surface.interval());
            }
            if find_flags.contains(MatchFlags::SUB_RECT) {
                consider(surface.params.can_sub_rect(params), surface.interval());
            }
            if find_flags.contains(MatchFlags::COPY) {
                let validate_interval =
                    validate_interval.expect("copy matching requires a validate interval");
                let copy_interval =
                    surface.get_copyable_interval(&params.from_interval(validate_interval));
                let matched = copy_interval.intersect(validate_interval).len() != 0
                    && surface.can_copy(params, copy_interval);
                consider(matched, copy_interval);
            }
            if find_flags.contains(MatchFlags::EXPAND) {
                consider(surface.params.can_expand(params), surface.interval());
            }
            if find_flags.contains(MatchFlags::TEX_COPY) {
                consider(surface.params.can_tex_copy(params), surface.interval());
            }
        }
        match_surface
    }

    // ── Blit / copy primitives ──────────────────────────────────────────

    /// Blit one surface's pixels to another, preferring a 1:1 texture
    /// copy when there is no scaling and no flip.
    pub fn blit_surfaces(
        &mut self,
        src_surface: &SurfaceRef,
        src_rect: Rectangle,
        dst_surface: &SurfaceRef,
        dst_rect: Rectangle,
    ) -> bool {
        if !formats_blittable(src_surface.params.pixel_format, dst_surface.params.pixel_format) {
            return false;
        }

        dst_surface.invalidate_all_watchers();

        if src_rect.width() == dst_rect.width()
            && src_rect.height() == dst_rect.height()
            && src_rect.bottom < src_rect.top
        {
            let texture_copy = TextureCopy {
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: 0,
                src_offset: Offset {
                    x: src_rect.left,
                    y: src_rect.bottom,
                },
                dst_offset: Offset {
                    x: dst_rect.left,
                    y: dst_rect.bottom,
                },
                extent: Extent {
                    width: src_rect.width(),
                    height: src_rect.height(),
                },
            };
            self.runtime
                .copy_textures(src_surface, dst_surface, &texture_copy)
        } else {
            let texture_blit = TextureBlit {
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: 0,
                src_rect,
                dst_rect,
            };
            self.runtime
                .blit_textures(src_surface, dst_surface, &texture_blit)
        }
    }

    /// Copy `copy_interval` of `src_surface` into `dst_surface`, either as
    /// a clear (fill source) or a blit (sub-rect source).
    fn copy_surface(
        &mut self,
        src_surface: &SurfaceRef,
        dst_surface: &SurfaceRef,
        copy_interval: SurfaceInterval,
    ) {
        let subrect_params = dst_surface.params.from_interval(copy_interval);
        assert_eq!(subrect_params.interval(), copy_interval);
        assert_ne!(src_surface.id(), dst_surface.id());

        if src_surface.params.surface_type == SurfaceType::Fill {
            // Rebase the pattern onto the copy start so the periodic data
            // lands with the right phase.
            let fill_offset =
                ((copy_interval.start - src_surface.params.addr) % src_surface.fill_size) as usize;
            let mut fill_buffer = [0u8; 4];
            for (i, byte) in fill_buffer.iter_mut().enumerate() {
                *byte = src_surface.fill_data[(fill_offset + i) % src_surface.fill_size as usize];
            }

            let clear_value = make_clear_value(
                dst_surface.params.surface_type,
                dst_surface.params.pixel_format,
                &fill_buffer,
            );
            let clear_rect = TextureClear {
                texture_level: 0,
                texture_rect: dst_surface.params.scaled_sub_rect(&subrect_params),
            };
            self.runtime.clear_texture(dst_surface, &clear_rect, clear_value);
            return;
        }

        if src_surface.params.can_sub_rect(&subrect_params) {
            let texture_blit = TextureBlit {
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: 0,
                src_rect: src_surface.params.scaled_sub_rect(&subrect_params),
                dst_rect: dst_surface.params.scaled_sub_rect(&subrect_params),
            };
            self.runtime.blit_textures(src_surface, dst_surface, &texture_blit);
            return;
        }

        unreachable!("copy source matched neither fill nor sub-rect");
    }

    /// Blit `src` into the matching sub-rect of `dst` and carry over both
    /// its validity and its dirty-region ownership.
    fn duplicate_surface(&mut self, src: &SurfaceRef, dst: &SurfaceRef) {
        assert!(dst.params.addr <= src.params.addr && dst.params.end >= src.params.end);

        self.blit_surfaces(
            src,
            src.params.scaled_rect(),
            dst,
            dst.params.scaled_sub_rect(&src.params),
        );

        dst.transfer_validity(src);

        let owned: Vec<SurfaceInterval> = self
            .dirty_regions
            .iter_overlaps(src.interval())
            .filter(|(_, owner)| owner.id() == src.id())
            .map(|(piece, _)| piece)
            .collect();
        for piece in owned {
            self.dirty_regions.set(piece, dst.clone());
        }
    }

    // ── Surface acquisition ─────────────────────────────────────────────

    /// Find or create a surface exactly covering `params`, optionally
    /// validating the requested range.
    pub fn get_surface(
        &mut self,
        params: &SurfaceParams,
        match_res_scale: ScaleMatch,
        load_if_create: bool,
    ) -> Option<SurfaceRef> {
        if params.addr == 0 || params.height * params.width == 0 {
            return None;
        }

        // Use get_surface_sub_rect for strided requests.
        assert_eq!(params.width, params.stride);
        assert!(!params.is_tiled || (params.width % 8 == 0 && params.height % 8 == 0));

        let existing = self.find_match(
            params,
            match_res_scale,
            None,
            MatchFlags::EXACT | MatchFlags::INVALID,
        );

        let surface = match existing {
            Some(surface) => surface,
            None => {
                let mut target_res_scale = params.res_scale;
                if match_res_scale != ScaleMatch::Exact {
                    // This range may be a subrect of a higher-scaled
                    // surface; adopt that scale so the data survives.
                    let mut find_params = *params;
                    if let Some(expandable) = self.find_match(
                        &find_params,
                        match_res_scale,
                        None,
                        MatchFlags::EXPAND | MatchFlags::INVALID,
                    ) {
                        target_res_scale = target_res_scale.max(expandable.params.res_scale);
                    }

                    // Keep the scale when reinterpreting D24S8 -> RGBA8.
                    if params.pixel_format == PixelFormat::Rgba8 {
                        find_params.pixel_format = PixelFormat::D24S8;
                        if let Some(expandable) = self.find_match(
                            &find_params,
                            match_res_scale,
                            None,
                            MatchFlags::EXPAND | MatchFlags::INVALID,
                        ) {
                            target_res_scale = target_res_scale.max(expandable.params.res_scale);
                        }
                    }
                }

                let mut new_params = *params;
                new_params.res_scale = target_res_scale;
                let surface = self.create_surface(new_params);
                self.register_surface(&surface);
                surface
            }
        };

        if load_if_create {
            self.validate_surface(&surface, params.addr, params.size);
        }

        Some(surface)
    }

    /// Find or create a surface containing the requested region, returning
    /// it with the scaled host rect of the request inside it.
    pub fn get_surface_sub_rect(
        &mut self,
        params: &SurfaceParams,
        match_res_scale: ScaleMatch,
        load_if_create: bool,
    ) -> Option<(SurfaceRef, Rectangle)> {
        if params.addr == 0 || params.height * params.width == 0 {
            return None;
        }

        let mut surface = self.find_match(
            params,
            match_res_scale,
            None,
            MatchFlags::SUB_RECT | MatchFlags::INVALID,
        );

        // A miss may just mean the encompassing surface has the wrong
        // scale; shadow it at the requested scale so the low-res copy
        // is not used again.
        if surface.is_none() && match_res_scale != ScaleMatch::Ignore {
            if let Some(lower_scale) = self.find_match(
                params,
                ScaleMatch::Ignore,
                None,
                MatchFlags::SUB_RECT | MatchFlags::INVALID,
            ) {
                let mut new_params = lower_scale.params;
                new_params.res_scale = params.res_scale;
                let new_surface = self.create_surface(new_params);
                self.register_surface(&new_surface);
                surface = Some(new_surface);
            }
        }

        let mut aligned_params = *params;
        if params.is_tiled {
            aligned_params.height = align_up(params.height, 8);
            aligned_params.width = align_up(params.width, 8);
            aligned_params.stride = align_up(params.stride, 8);
            aligned_params.update_params();
        }

        // Look for a surface we can expand before creating a new one.
        if surface.is_none() {
            if let Some(expandable) = self.find_match(
                &aligned_params,
                match_res_scale,
                None,
                MatchFlags::EXPAND | MatchFlags::INVALID,
            ) {
                aligned_params.width = aligned_params.stride;
                aligned_params.update_params();

                let mut new_params = expandable.params;
                new_params.addr = aligned_params.addr.min(expandable.params.addr);
                new_params.end = aligned_params.end.max(expandable.params.end);
                new_params.size = new_params.end - new_params.addr;
                new_params.height =
                    new_params.size / aligned_params.bytes_in_pixels(aligned_params.stride);
                assert_eq!(
                    new_params.size % aligned_params.bytes_in_pixels(aligned_params.stride),
                    0
                );

                let new_surface = self.create_surface(new_params);
                self.duplicate_surface(&expandable, &new_surface);

                // The expanded surface may still be referenced; stage it
                // for removal instead of deleting in place.
                expandable.unlink_all_watchers();
                self.stage_remove(&expandable);

                self.register_surface(&new_surface);
                surface = Some(new_surface);
            }
        }

        let surface = match surface {
            Some(surface) => {
                if load_if_create {
                    self.validate_surface(&surface, aligned_params.addr, aligned_params.size);
                }
                surface
            }
            None => {
                // No subrect found; surfaces can't have row gaps, so the
                // new surface spans the full stride.
                let mut new_params = aligned_params;
                new_params.width = aligned_params.stride;
                new_params.update_params();
                self.get_surface(&new_params, match_res_scale, load_if_create)?
            }
        };

        let rect = surface.params.scaled_sub_rect(params);
        Some((surface, rect))
    }

    /// Get a surface for a texture unit configuration, keeping its mipmap
    /// levels in sync through the level watchers.
    pub fn get_texture_surface(
        &mut self,
        info: &TextureInfo,
        max_level: u32,
    ) -> Option<SurfaceRef> {
        if info.physical_address == 0 {
            return None;
        }

        let mut params = SurfaceParams {
            addr: info.physical_address,
            width: info.width,
            height: info.height,
            is_tiled: true,
            res_scale: 1,
            pixel_format: PixelFormat::from_texture_format(info.format),
            ..Default::default()
        };
        params.update_params();

        let min_width = info.width >> max_level;
        let min_height = info.height >> max_level;
        if min_width % 8 != 0 || min_height % 8 != 0 {
            error!("Texture size ({}x{}) is not multiple of 8", min_width, min_height);
            return None;
        }
        if info.width != (min_width << max_level) || info.height != (min_height << max_level) {
            error!(
                "Texture size ({}x{}) does not support required mipmap level ({})",
                params.width, params.height, max_level
            );
            return None;
        }

        let surface = self.get_surface(&params, ScaleMatch::Ignore, true)?;

        if max_level != 0 {
            // PICA textures span 8..1024 pixels, so at most eight levels.
            if max_level >= 8 {
                error!("Unsupported mipmap level {}", max_level);
                return None;
            }

            if surface.max_level() < max_level {
                surface.set_max_level(max_level);
            }

            // Levels are stored contiguously after the base image.
            let mut level_params = surface.params;
            for level in 1..=max_level {
                level_params.addr +=
                    level_params.bytes_in_pixels(level_params.width * level_params.height);
                level_params.width /= 2;
                level_params.height /= 2;
                level_params.stride = 0;
                level_params.update_params();

                let slot = (level - 1) as usize;
                let needs_watcher = match surface.level_watcher(slot) {
                    Some(watcher) => watcher.get().is_none(),
                    None => true,
                };
                if needs_watcher {
                    let watcher = self
                        .get_surface(&level_params, ScaleMatch::Ignore, true)
                        .map(|level_surface| level_surface.create_watcher());
                    surface.set_level_watcher(slot, watcher);
                }

                if let Some(watcher) = surface.level_watcher(slot) {
                    if !watcher.is_valid() {
                        if let Some(level_surface) = watcher.get() {
                            if level_surface.has_invalid_regions() {
                                let (addr, size) =
                                    (level_surface.params.addr, level_surface.params.size);
                                self.validate_surface(&level_surface, addr, size);
                            }

                            let texture_blit = TextureBlit {
                                src_level: 0,
                                dst_level: level,
                                src_layer: 0,
                                dst_layer: 0,
                                src_rect: level_surface.params.scaled_rect(),
                                dst_rect: level_params.scaled_rect(),
                            };
                            self.runtime.blit_textures(&level_surface, &surface, &texture_blit);
                            watcher.validate();
                        }
                    }
                }
            }
        }

        Some(surface)
    }

    /// Get the cube map surface for a face configuration, revalidating
    /// any face whose watcher reports stale content.
    pub fn get_texture_cube(&mut self, config: &TextureCubeConfig) -> Option<SurfaceRef> {
        if config.width == 0 || config.width % 8 != 0 {
            error!("Cube map size ({0}x{0}) is not multiple of 8", config.width);
            return None;
        }

        let cube = match self.texture_cube_cache.get(config) {
            Some(cube) => cube.clone(),
            None => {
                let mut cube_params = SurfaceParams {
                    addr: config.px,
                    width: config.width,
                    height: config.width,
                    stride: config.width,
                    is_tiled: true,
                    res_scale: 1,
                    texture_type: TextureType::CubeMap,
                    pixel_format: PixelFormat::from_texture_format(config.format),
                    ..Default::default()
                };
                cube_params.update_params();
                let cube = self.create_surface(cube_params);
                self.texture_cube_cache.insert(*config, cube.clone());
                cube
            }
        };

        let addresses = [config.px, config.nx, config.py, config.ny, config.pz, config.nz];

        for (i, &addr) in addresses.iter().enumerate() {
            let needs_watcher = match cube.level_watcher(i) {
                Some(watcher) => watcher.get().is_none(),
                None => true,
            };
            if needs_watcher {
                let mut info = TextureInfo {
                    physical_address: addr,
                    width: config.width,
                    height: config.width,
                    stride: 0,
                    format: config.format,
                };
                info.set_default_stride();
                // A missing face usually means leftover texture unit
                // state; the face is left unwatched and never synced.
                let watcher = self
                    .get_texture_surface(&info, 0)
                    .map(|face| face.create_watcher());
                cube.set_level_watcher(i, watcher);
            }
        }

        let scaled_size = cube.params.scaled_width();
        for i in 0..addresses.len() {
            let Some(watcher) = cube.level_watcher(i) else {
                continue;
            };
            if watcher.is_valid() {
                continue;
            }
            let Some(face) = watcher.get() else {
                continue;
            };
            if face.has_invalid_regions() {
                let (addr, size) = (face.params.addr, face.params.size);
                self.validate_surface(&face, addr, size);
            }

            let texture_blit = TextureBlit {
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: i as u32,
                src_rect: face.params.scaled_rect(),
                dst_rect: Rectangle::new(0, scaled_size, scaled_size, 0),
            };
            self.runtime.blit_textures(&face, &cube, &texture_blit);
            watcher.validate();
        }

        Some(cube)
    }

    /// Get the color and depth surfaces matching the framebuffer config,
    /// validated over the viewport.
    pub fn get_framebuffer_surfaces(
        &mut self,
        config: &FramebufferConfig,
        using_color_fb: bool,
        mut using_depth_fb: bool,
        viewport: Viewport,
        resolution_scale_factor: u16,
    ) -> (Option<SurfaceRef>, Option<SurfaceRef>, Rectangle) {
        // A changed scale factor invalidates every cached image.
        if self.resolution_scale_factor != resolution_scale_factor {
            self.resolution_scale_factor = resolution_scale_factor;
            self.flush_all();
            for surface in self.surface_cache.all() {
                self.unregister_surface(&surface);
            }
            for (_, cube) in self.texture_cube_cache.drain() {
                self.runtime.destroy_image(&cube);
            }
        }

        let clamp_x = |v: i32| v.clamp(0, config.width as i32) as u32;
        let clamp_y = |v: i32| v.clamp(0, config.height as i32) as u32;
        let viewport_clamped = Rectangle::new(
            clamp_x(viewport.left),
            clamp_y(viewport.top),
            clamp_x(viewport.right),
            clamp_y(viewport.bottom),
        );

        let mut color_params = SurfaceParams {
            is_tiled: true,
            res_scale: self.resolution_scale_factor,
            width: config.width,
            height: config.height,
            addr: config.color_addr,
            pixel_format: config.color_format,
            ..Default::default()
        };
        let mut depth_params = SurfaceParams {
            addr: config.depth_addr,
            pixel_format: config.depth_format,
            ..color_params
        };
        color_params.update_params();
        depth_params.update_params();

        let color_vp_interval = color_params.sub_rect_interval(viewport_clamped);
        let depth_vp_interval = depth_params.sub_rect_interval(viewport_clamped);

        // Make sure the framebuffers do not overlap when both are used.
        if using_color_fb
            && using_depth_fb
            && color_vp_interval.overlaps(depth_vp_interval)
        {
            error!("Color and depth framebuffer memory regions overlap; disabling depth");
            using_depth_fb = false;
        }

        let mut color_rect = Rectangle::default();
        let mut color_surface = None;
        if using_color_fb {
            if let Some((surface, rect)) =
                self.get_surface_sub_rect(&color_params, ScaleMatch::Exact, false)
            {
                color_surface = Some(surface);
                color_rect = rect;
            }
        }

        let mut depth_rect = Rectangle::default();
        let mut depth_surface = None;
        if using_depth_fb {
            if let Some((surface, rect)) =
                self.get_surface_sub_rect(&depth_params, ScaleMatch::Exact, false)
            {
                depth_surface = Some(surface);
                depth_rect = rect;
            }
        }

        let mut fb_rect = Rectangle::default();
        match (&color_surface, &depth_surface) {
            (Some(_), Some(_)) => {
                fb_rect = color_rect;
                // Color and depth surfaces must have matching offsets.
                if color_rect != depth_rect {
                    color_surface = self.get_surface(&color_params, ScaleMatch::Exact, false);
                    depth_surface = self.get_surface(&depth_params, ScaleMatch::Exact, false);
                    if let Some(surface) = &color_surface {
                        fb_rect = surface.params.scaled_rect();
                    }
                }
            }
            (Some(_), None) => fb_rect = color_rect,
            (None, Some(_)) => fb_rect = depth_rect,
            (None, None) => {}
        }

        if let Some(surface) = color_surface.clone() {
            self.validate_surface(&surface, color_vp_interval.start, color_vp_interval.len());
            surface.invalidate_all_watchers();
        }
        if let Some(surface) = depth_surface.clone() {
            self.validate_surface(&surface, depth_vp_interval.start, depth_vp_interval.len());
            surface.invalidate_all_watchers();
        }

        (color_surface, depth_surface, fb_rect)
    }

    /// Register a surface standing in for a guest memory-fill.
    pub fn get_fill_surface(&mut self, config: &MemoryFillConfig) -> SurfaceRef {
        let mut params = SurfaceParams {
            addr: config.addr_start,
            end: config.addr_end,
            surface_type: SurfaceType::Fill,
            res_scale: u16::MAX,
            ..Default::default()
        };
        params.size = params.end - params.addr;

        let fill_size = if config.fill_32bit {
            4
        } else if config.fill_24bit {
            3
        } else {
            2
        };
        let surface = Surface::new_fill(params, config.value_32bit.to_le_bytes(), fill_size);
        self.register_surface(&surface);
        surface
    }

    /// Find a surface serving a display-transfer "texture copy" and the
    /// scaled rect the copy reads, reconstructing pixel dimensions from
    /// the byte-oriented copy parameters.
    pub fn get_tex_copy_surface(
        &mut self,
        params: &SurfaceParams,
    ) -> (Option<SurfaceRef>, Rectangle) {
        let match_surface = self.find_match(
            params,
            ScaleMatch::Ignore,
            None,
            MatchFlags::TEX_COPY | MatchFlags::INVALID,
        );

        let Some(match_surface) = match_surface else {
            return (None, Rectangle::default());
        };

        self.validate_surface(&match_surface, params.addr, params.size);

        let match_subrect = if params.width != params.stride {
            let tiled_size = if match_surface.params.is_tiled { 8 } else { 1 };
            let mut subrect = *params;
            subrect.width = match_surface.params.pixels_in_bytes(params.width) / tiled_size;
            subrect.stride = match_surface.params.pixels_in_bytes(params.stride) / tiled_size;
            subrect.height *= tiled_size;
            subrect
        } else {
            let subrect = match_surface.params.from_interval(params.interval());
            assert_eq!(subrect.interval(), params.interval());
            subrect
        };

        let rect = match_surface.params.scaled_sub_rect(&match_subrect);
        (Some(match_surface), rect)
    }

    // ── Validation ──────────────────────────────────────────────────────

    /// Bring the requested region of `surface` up to date, sourcing each
    /// stale piece from a cached copy, a reinterpreter, or guest memory.
    pub fn validate_surface(&mut self, surface: &SurfaceRef, addr: PAddr, size: u32) {
        if size == 0 {
            return;
        }

        let validate_interval = SurfaceInterval::new(addr, addr + size);

        if surface.params.surface_type == SurfaceType::Fill {
            // Fill surfaces are always valid when used.
            debug_assert!(surface.is_region_valid(validate_interval));
            return;
        }

        let mut validate_regions = surface.invalid_intersection(validate_interval);

        loop {
            let Some(piece) = validate_regions.first() else {
                break;
            };
            let interval = piece.intersect(validate_interval);
            let mut params = surface.params.from_interval(interval);

            // Look for a valid surface to copy from.
            if let Some(copy_surface) =
                self.find_match(&params, ScaleMatch::Ignore, Some(interval), MatchFlags::COPY)
            {
                let copy_interval = copy_surface.get_copyable_interval(&params);
                self.copy_surface(&copy_surface, surface, copy_interval);
                surface.mark_valid(copy_interval);
                validate_regions.erase(copy_interval);
                continue;
            }

            // Try surfaces of other formats that reinterpret to ours.
            if self.validate_by_reinterpretation(surface, &mut params, interval) {
                surface.mark_valid(interval);
                validate_regions.erase(interval);
                continue;
            }

            // No reinterpreter fits. If the data was produced entirely on
            // the GPU, guest memory is stale and uploading would destroy
            // it; leave the region to its eventual producer.
            if self.no_unimplemented_reinterpretations(surface, &mut params, interval)
                && !self.interval_has_invalid_pixel_format(&mut params, interval)
                && self.dirty_regions.contains_interval(interval)
            {
                debug!("Region created fully on GPU and reinterpretation is invalid; skipping");
                validate_regions.erase(interval);
                continue;
            }

            // Load from guest memory.
            self.flush_region(params.addr, params.size, None);
            if self.upload_surface(surface, interval) {
                surface.mark_valid(params.interval());
            }
            validate_regions.erase(params.interval());
        }
    }

    /// Whether every same-bit-width surface overlapping the interval has
    /// a reinterpreter to our format. Used purely as a skip heuristic.
    fn no_unimplemented_reinterpretations(
        &self,
        surface: &SurfaceRef,
        params: &mut SurfaceParams,
        interval: SurfaceInterval,
    ) -> bool {
        let mut implemented = true;
        for format in ALL_FORMATS {
            if format.bits_per_pixel() == surface.params.bits_per_pixel() {
                params.pixel_format = format;
                if self
                    .find_match(params, ScaleMatch::Ignore, Some(interval), MatchFlags::COPY)
                    .is_some()
                {
                    warn!(
                        "Missing pixel format reinterpreter: {} -> {}",
                        format.as_str(),
                        surface.params.pixel_format.as_str()
                    );
                    implemented = false;
                }
            }
        }
        implemented
    }

    /// Whether a surface with an invalid pixel format overlaps the
    /// interval.
    fn interval_has_invalid_pixel_format(
        &self,
        params: &mut SurfaceParams,
        interval: SurfaceInterval,
    ) -> bool {
        params.pixel_format = PixelFormat::Invalid;
        for surface in self.surface_cache.overlapping(interval) {
            if surface.params.pixel_format == PixelFormat::Invalid {
                debug!("Surface {:#x} found with invalid pixel format", surface.params.addr);
                return true;
            }
        }
        false
    }

    /// Search the registered reinterpreters for a cached source surface
    /// of a different format and re-encode it into `surface`.
    fn validate_by_reinterpretation(
        &mut self,
        surface: &SurfaceRef,
        params: &mut SurfaceParams,
        interval: SurfaceInterval,
    ) -> bool {
        let dest_format = surface.params.pixel_format;
        for reinterpreter in self.runtime.reinterpreters(dest_format) {
            params.pixel_format = reinterpreter.source_format();
            let Some(reinterpret_surface) =
                self.find_match(params, ScaleMatch::Ignore, Some(interval), MatchFlags::COPY)
            else {
                continue;
            };

            let reinterpret_interval = reinterpret_surface.get_copyable_interval(params);
            let reinterpret_params = surface.params.from_interval(reinterpret_interval);
            let src_rect = reinterpret_surface.params.scaled_sub_rect(&reinterpret_params);
            let dest_rect = surface.params.scaled_sub_rect(&reinterpret_params);

            reinterpreter.reinterpret(
                &mut self.runtime,
                &reinterpret_surface,
                src_rect,
                surface,
                dest_rect,
            );
            return true;
        }
        false
    }

    // ── Uploads and downloads ───────────────────────────────────────────

    /// Copy pixel data in `interval` from guest memory to the host image.
    /// Returns false when the guest range is unmapped.
    fn upload_surface(&mut self, surface: &SurfaceRef, interval: SurfaceInterval) -> bool {
        let load_info = surface.params.from_interval(interval);
        assert!(load_info.addr >= surface.params.addr && load_info.end <= surface.params.end);

        let mut guest_data = vec![0u8; (load_info.end - load_info.addr) as usize];
        if !self.memory.read(load_info.addr, &mut guest_data) {
            return false;
        }

        let staging_size = load_info.width
            * load_info.height
            * self.runtime.internal_bytes_per_pixel(load_info.pixel_format);
        let staging = self.runtime.find_staging(staging_size, true);
        {
            let mut mapped = staging.data.lock();
            if surface.params.is_tiled {
                if self.runtime.needs_conversion(load_info.pixel_format) {
                    let mut linear = vec![0u8; load_info.size as usize];
                    unswizzle_texture(
                        &load_info,
                        load_info.addr,
                        load_info.end,
                        &guest_data,
                        &mut linear,
                    );
                    self.runtime.format_convert(&load_info, true, &linear, &mut mapped);
                } else {
                    unswizzle_texture(
                        &load_info,
                        load_info.addr,
                        load_info.end,
                        &guest_data,
                        &mut mapped,
                    );
                }
            } else {
                self.runtime.format_convert(&load_info, true, &guest_data, &mut mapped);
            }
        }

        let upload = BufferTextureCopy {
            buffer_offset: 0,
            buffer_size: staging.size,
            texture_rect: surface.params.sub_rect(&load_info),
            texture_level: 0,
        };
        self.runtime.upload(surface, &upload, staging);
        true
    }

    /// Queue a download of `interval` from the host image; the guest
    /// write happens when the download queue drains after the barrier.
    fn download_surface(&mut self, surface: &SurfaceRef, interval: SurfaceInterval) {
        let flush_info = surface.params.from_interval(interval);
        assert!(interval.start >= surface.params.addr && interval.end <= surface.params.end);

        let staging_size = flush_info.width
            * flush_info.height
            * self.runtime.internal_bytes_per_pixel(flush_info.pixel_format);
        let staging = self.runtime.find_staging(staging_size, false);

        let download = BufferTextureCopy {
            buffer_offset: 0,
            buffer_size: staging.size,
            texture_rect: surface.params.sub_rect(&flush_info),
            texture_level: 0,
        };
        self.runtime.download(surface, &download, staging.clone());

        if !self.memory.is_valid_range(interval.start, interval.len()) {
            return;
        }

        self.download_queue.push(DownloadTask {
            flush_info,
            interval,
            staging,
        });
    }

    /// Write a fill surface's repeating pattern straight into guest
    /// memory, keeping the pattern phase relative to the surface base.
    fn download_fill_surface(&mut self, surface: &SurfaceRef, interval: SurfaceInterval) {
        assert!(interval.start >= surface.params.addr && interval.end <= surface.params.end);

        let fill_size = surface.fill_size as usize;
        let phase = ((interval.start - surface.params.addr) as usize) % fill_size;

        let mut pattern = vec![0u8; interval.len() as usize];
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = surface.fill_data[(phase + i) % fill_size];
        }
        self.memory.write(interval.start, &pattern);
    }

    // ── Flush and invalidate ────────────────────────────────────────────

    /// Write every dirty byte overlapping `[addr, addr+size)` back to
    /// guest memory. With `flush_surface` set, only that surface's dirty
    /// pieces are flushed.
    pub fn flush_region(&mut self, addr: PAddr, size: u32, flush_surface: Option<&SurfaceRef>) {
        if size == 0 {
            return;
        }

        let flush_interval = SurfaceInterval::new(addr, addr.saturating_add(size));
        let mut flushed_intervals = IntervalSet::new();

        let dirty: Vec<(SurfaceInterval, SurfaceRef)> = self
            .dirty_regions
            .iter_overlaps(flush_interval)
            .map(|(piece, owner)| (piece, owner.clone()))
            .collect();

        for (piece, surface) in dirty {
            // Small sizes imply the access comes from the CPU; flush the
            // whole dirty piece to avoid thousands of tiny flushes when
            // the CPU walks the region.
            let interval = if size <= 8 {
                piece
            } else {
                piece.intersect(flush_interval)
            };

            if let Some(only) = flush_surface {
                if only.id() != surface.id() {
                    continue;
                }
            }

            // The owner is the last writer, so it must consider the
            // region valid.
            assert!(surface.is_region_valid(interval));

            if surface.params.surface_type == SurfaceType::Fill {
                self.download_fill_surface(&surface, interval);
            } else {
                self.download_surface(&surface, interval);
            }

            flushed_intervals.insert(interval);
        }

        // Execute the batched downloads after one barrier, so a
        // multi-surface flush lands as a consistent snapshot.
        if !self.download_queue.is_empty() {
            self.runtime.finish();
            let queue = std::mem::take(&mut self.download_queue);
            for task in &queue {
                task.execute(&*self.memory, &self.runtime);
            }
        }

        self.dirty_regions.erase_set(&flushed_intervals);
    }

    /// Flush every dirty byte in the cache.
    pub fn flush_all(&mut self) {
        self.flush_region(0, u32::MAX, None);
    }

    /// Mark `[addr, addr+size)` as rewritten by `region_owner` (a cached
    /// surface) or by the CPU (None). Overlapping surfaces lose validity;
    /// fully invalidated ones are unregistered.
    pub fn invalidate_region(&mut self, addr: PAddr, size: u32, region_owner: Option<&SurfaceRef>) {
        if size == 0 {
            return;
        }

        let invalid_interval = SurfaceInterval::new(addr, addr.saturating_add(size));

        if let Some(owner) = region_owner {
            assert_ne!(owner.params.surface_type, SurfaceType::Texture);
            assert!(addr >= owner.params.addr && addr + size <= owner.params.end);
            // Surfaces can't have gaps.
            assert_eq!(owner.params.width, owner.params.stride);
            owner.mark_valid(invalid_interval);
        }

        for cached_surface in self.surface_cache.overlapping(invalid_interval) {
            if let Some(owner) = region_owner {
                if cached_surface.id() == owner.id() {
                    continue;
                }
            }

            // A small CPU write means the CPU is now working this memory;
            // drop the surface so the pages can stop trapping.
            if region_owner.is_none() && size <= 8 {
                let (surface_addr, surface_size) =
                    (cached_surface.params.addr, cached_surface.params.size);
                self.flush_region(surface_addr, surface_size, Some(&cached_surface));
                self.stage_remove(&cached_surface);
                continue;
            }

            let interval = cached_surface.interval().intersect(invalid_interval);
            cached_surface.mark_invalid(interval);
            cached_surface.invalidate_all_watchers();

            // Remove surfaces with no salvageable data from the cache so
            // they stop clogging the catalog.
            if cached_surface.is_fully_invalid() {
                self.stage_remove(&cached_surface);
            }
        }

        match region_owner {
            Some(owner) => self.dirty_regions.set(invalid_interval, owner.clone()),
            None => self.dirty_regions.erase(invalid_interval),
        }

        let staged = std::mem::take(&mut self.remove_surfaces);
        for remove_surface in staged {
            if let Some(owner) = region_owner {
                if remove_surface.id() == owner.id() {
                    // Salvage the owner into an encompassing surface when
                    // that surface would not lose any valid data.
                    let expanded = self.find_match(
                        &owner.params,
                        ScaleMatch::Ignore,
                        None,
                        MatchFlags::EXPAND | MatchFlags::INVALID,
                    );
                    let expanded = expanded.expect("invalidated owner has no successor surface");

                    if expanded.id() != owner.id() {
                        let mut owner_only_invalid = owner.invalid_regions();
                        owner_only_invalid.erase_set(&expanded.invalid_regions());
                        if owner_only_invalid.is_empty() {
                            self.duplicate_surface(owner, &expanded);
                        } else {
                            continue;
                        }
                    }
                }
            }
            self.unregister_surface(&remove_surface);
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    fn create_surface(&mut self, params: SurfaceParams) -> SurfaceRef {
        let surface = Surface::new(params);
        self.runtime.allocate_image(&surface);
        surface
    }

    fn stage_remove(&mut self, surface: &SurfaceRef) {
        if !self.remove_surfaces.iter().any(|s| s.id() == surface.id()) {
            self.remove_surfaces.push(surface.clone());
        }
    }

    fn register_surface(&mut self, surface: &SurfaceRef) {
        if surface.is_registered() {
            return;
        }
        surface.set_registered(true);
        self.surface_cache.insert(surface);
        self.page_tracker
            .update_pages_cached_count(surface.params.addr, surface.params.size, 1);
    }

    fn unregister_surface(&mut self, surface: &SurfaceRef) {
        if !surface.is_registered() {
            return;
        }
        surface.set_registered(false);
        self.page_tracker
            .update_pages_cached_count(surface.params.addr, surface.params.size, -1);
        self.surface_cache.remove(surface);
        self.runtime.destroy_image(surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null_backend::NullRuntime;
    use crate::memory::MemorySystem;
    use crate::pica::texture::TextureFormat;
    use citrus_common::types::VRAM_PADDR;

    fn make_cache() -> (RasterizerCache<NullRuntime>, Arc<MemorySystem>) {
        let memory = Arc::new(MemorySystem::new());
        let cache = RasterizerCache::new(memory.clone(), NullRuntime::new(), 1);
        (cache, memory)
    }

    fn linear_params(addr: PAddr, width: u32, height: u32, format: PixelFormat) -> SurfaceParams {
        let mut params = SurfaceParams {
            addr,
            width,
            height,
            pixel_format: format,
            ..Default::default()
        };
        params.update_params();
        params
    }

    fn tiled_params(addr: PAddr, width: u32, height: u32, format: PixelFormat) -> SurfaceParams {
        let mut params = SurfaceParams {
            addr,
            width,
            height,
            is_tiled: true,
            pixel_format: format,
            ..Default::default()
        };
        params.update_params();
        params
    }

    fn write_pattern(memory: &MemorySystem, addr: PAddr, size: u32) -> Vec<u8> {
        let pattern: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        assert!(memory.write(addr, &pattern));
        pattern
    }

    #[test]
    fn test_exact_match_returns_registered_surface() {
        let (mut cache, _memory) = make_cache();
        let mut params = linear_params(0x0010_0000, 64, 64, PixelFormat::Rgba8);
        params.res_scale = 2;

        let first = cache
            .get_surface(&params, ScaleMatch::Exact, false)
            .unwrap();
        assert_eq!(cache.surface_count(), 1);

        let second = cache
            .get_surface(&params, ScaleMatch::Exact, false)
            .unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(cache.surface_count(), 1);
    }

    #[test]
    fn test_page_counts_follow_registration() {
        let (mut cache, _memory) = make_cache();
        let params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);

        let surface = cache
            .get_surface(&params, ScaleMatch::Exact, false)
            .unwrap();
        assert_eq!(cache.page_tracker.page_count(VRAM_PADDR), 1);

        // A second surface over the same pages bumps the count.
        let params2 = linear_params(VRAM_PADDR, 64, 32, PixelFormat::Rgba8);
        let _other = cache
            .get_surface(&params2, ScaleMatch::Exact, false)
            .unwrap();
        assert_eq!(cache.page_tracker.page_count(VRAM_PADDR), 2);

        cache.unregister_surface(&surface);
        assert_eq!(cache.page_tracker.page_count(VRAM_PADDR), 1);
    }

    #[test]
    fn test_validate_uploads_and_flush_round_trips() {
        let (mut cache, memory) = make_cache();
        let params = tiled_params(VRAM_PADDR, 16, 16, PixelFormat::Rgba8);
        let pattern = write_pattern(&memory, params.addr, params.size);

        let surface = cache.get_surface(&params, ScaleMatch::Exact, true).unwrap();
        assert!(surface.is_region_valid(surface.interval()));
        assert_eq!(cache.runtime().upload_count, 1);

        // Scribble over guest memory, then flush the host copy back.
        assert!(memory.write(params.addr, &vec![0u8; params.size as usize]));
        cache.invalidate_region(params.addr, params.size, Some(&surface.clone()));
        cache.flush_region(params.addr, params.size, None);

        let mut readback = vec![0u8; params.size as usize];
        assert!(memory.read(params.addr, &mut readback));
        assert_eq!(readback, pattern);
        assert!(cache.dirty_regions.is_empty());
    }

    #[test]
    fn test_flush_idempotence() {
        let (mut cache, _memory) = make_cache();
        let params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        let surface = cache
            .get_surface(&params, ScaleMatch::Exact, false)
            .unwrap();

        cache.invalidate_region(params.addr, params.size, Some(&surface));
        cache.flush_region(params.addr, params.size, None);
        assert_eq!(cache.runtime().download_count, 1);
        assert_eq!(cache.runtime().finish_count, 1);

        // The second flush has nothing dirty and issues no downloads.
        cache.flush_region(params.addr, params.size, None);
        assert_eq!(cache.runtime().download_count, 1);
        assert_eq!(cache.runtime().finish_count, 1);
    }

    #[test]
    fn test_expand_with_duplicate() {
        let (mut cache, memory) = make_cache();
        let small_params = linear_params(VRAM_PADDR, 64, 32, PixelFormat::Rgba8);
        let pattern = write_pattern(&memory, small_params.addr, small_params.size);

        let small = cache
            .get_surface(&small_params, ScaleMatch::Exact, true)
            .unwrap();

        let big_params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        let (big, rect) = cache
            .get_surface_sub_rect(&big_params, ScaleMatch::Exact, false)
            .unwrap();

        assert_ne!(big.id(), small.id());
        assert_eq!(big.params.height, 64);
        assert_eq!(rect.width(), 64);

        // The old surface's contents moved over, and only its interval is
        // valid in the new surface.
        assert!(big.is_region_valid(small.interval()));
        assert!(!big.is_region_valid(big.interval()));
        let image = cache.runtime().image_bytes(&big).unwrap();
        assert_eq!(&image[..pattern.len()], &pattern[..]);

        // The expanded-away surface is staged for removal.
        assert!(cache
            .remove_surfaces
            .iter()
            .any(|s| s.id() == small.id()));
    }

    #[test]
    fn test_cpu_small_write_flushes_and_removes() {
        let (mut cache, _memory) = make_cache();
        let params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        let surface = cache
            .get_surface(&params, ScaleMatch::Exact, false)
            .unwrap();

        // The surface owns its range on the host side.
        cache.invalidate_region(params.addr, params.size, Some(&surface));
        assert!(!cache.dirty_regions.is_empty());

        // A 4-byte CPU write flushes the whole surface and evicts it.
        cache.invalidate_region(params.addr + 0x100, 4, None);
        assert_eq!(cache.surface_count(), 0);
        assert!(!surface.is_registered());
        assert_eq!(cache.runtime().download_count, 1);
        assert!(cache.dirty_regions.is_empty());
    }

    #[test]
    fn test_invalidate_idempotence() {
        let (mut cache, _memory) = make_cache();
        let params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        let surface = cache
            .get_surface(&params, ScaleMatch::Exact, false)
            .unwrap();
        surface.mark_valid(surface.interval());

        cache.invalidate_region(params.addr, params.size, None);
        assert_eq!(cache.surface_count(), 0);
        assert!(surface.is_fully_invalid());

        // Repeating the invalidation changes nothing observable.
        cache.invalidate_region(params.addr, params.size, None);
        assert_eq!(cache.surface_count(), 0);
        assert!(cache.dirty_regions.is_empty());
    }

    #[test]
    fn test_fill_surface_download_splat() {
        let (mut cache, memory) = make_cache();
        let config = MemoryFillConfig {
            addr_start: VRAM_PADDR,
            addr_end: VRAM_PADDR + 0x10,
            value_32bit: 0x0000_CDAB,
            fill_24bit: false,
            fill_32bit: false,
        };
        let fill = cache.get_fill_surface(&config);
        assert_eq!(fill.fill_size, 2);
        // P3: a registered fill surface is always fully valid.
        assert!(fill.is_region_valid(fill.interval()));

        cache.invalidate_region(VRAM_PADDR, 0x10, Some(&fill));
        cache.flush_region(VRAM_PADDR, 0x10, None);

        let mut readback = [0u8; 0x10];
        assert!(memory.read(VRAM_PADDR, &mut readback));
        for chunk in readback.chunks(2) {
            assert_eq!(chunk, &[0xAB, 0xCD]);
        }
    }

    #[test]
    fn test_validate_copies_from_cached_surface() {
        let (mut cache, memory) = make_cache();
        let big_params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        let pattern = write_pattern(&memory, big_params.addr, big_params.size);

        let _big = cache
            .get_surface(&big_params, ScaleMatch::Exact, true)
            .unwrap();
        assert_eq!(cache.runtime().upload_count, 1);

        // A smaller surface over the same bytes validates by blitting
        // from the cached surface instead of re-uploading.
        let half_params = linear_params(VRAM_PADDR, 64, 32, PixelFormat::Rgba8);
        let half = cache
            .get_surface(&half_params, ScaleMatch::Exact, true)
            .unwrap();
        assert!(half.is_region_valid(half.interval()));
        assert_eq!(cache.runtime().upload_count, 1);

        let image = cache.runtime().image_bytes(&half).unwrap();
        assert_eq!(image, &pattern[..half_params.size as usize]);
    }

    #[test]
    fn test_validate_by_reinterpretation() {
        let (mut cache, memory) = make_cache();
        let depth_params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::D24S8);
        let pattern = write_pattern(&memory, depth_params.addr, depth_params.size);

        let _depth = cache
            .get_surface(&depth_params, ScaleMatch::Exact, true)
            .unwrap();

        // An RGBA8 view of the same bytes is produced by the registered
        // D24S8 reinterpreter, not an upload.
        let color_params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        let color = cache
            .get_surface(&color_params, ScaleMatch::Exact, true)
            .unwrap();
        assert!(color.is_region_valid(color.interval()));
        assert_eq!(cache.runtime().upload_count, 1);

        let image = cache.runtime().image_bytes(&color).unwrap();
        assert_eq!(image, &pattern[..]);
    }

    #[test]
    fn test_gpu_produced_region_skips_upload() {
        let (mut cache, _memory) = make_cache();
        let color_params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        let color = cache
            .get_surface(&color_params, ScaleMatch::Exact, false)
            .unwrap();
        cache.invalidate_region(color_params.addr, color_params.size, Some(&color));

        // A 16-bit surface over GPU-produced data: no 16-bit source
        // exists and the bytes never reached guest memory, so validation
        // leaves the region alone rather than uploading stale data.
        let lowbpp_params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgb565);
        let lowbpp = cache
            .get_surface(&lowbpp_params, ScaleMatch::Exact, true)
            .unwrap();
        assert!(lowbpp.is_fully_invalid());
        assert_eq!(cache.runtime().upload_count, 0);
    }

    #[test]
    fn test_find_match_prefers_higher_scale() {
        let (mut cache, _memory) = make_cache();
        let mut params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        params.res_scale = 1;
        let low = cache
            .get_surface(&params, ScaleMatch::Exact, false)
            .unwrap();

        let mut high_params = params;
        high_params.res_scale = 2;
        let high = cache
            .get_surface(&high_params, ScaleMatch::Exact, false)
            .unwrap();
        assert_ne!(low.id(), high.id());

        let found = cache
            .find_match(
                &params,
                ScaleMatch::Upscale,
                None,
                MatchFlags::EXACT | MatchFlags::INVALID,
            )
            .unwrap();
        assert_eq!(found.id(), high.id());
    }

    #[test]
    fn test_find_match_prefers_valid_over_invalid() {
        let (mut cache, memory) = make_cache();
        let params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        write_pattern(&memory, params.addr, params.size);

        let invalid = cache
            .get_surface(&params, ScaleMatch::Exact, false)
            .unwrap();

        // A duplicate-interval surface that has been validated.
        let valid = Surface::new(params);
        cache.runtime.allocate_image(&valid);
        cache.register_surface(&valid);
        valid.mark_valid(valid.interval());

        let found = cache
            .find_match(
                &params,
                ScaleMatch::Exact,
                None,
                MatchFlags::EXACT | MatchFlags::INVALID,
            )
            .unwrap();
        assert_eq!(found.id(), valid.id());
        assert_ne!(found.id(), invalid.id());
    }

    #[test]
    fn test_get_texture_surface_with_mipmaps() {
        let (mut cache, memory) = make_cache();
        let base_size = 16 * 16 * 4;
        let level1_size = 8 * 8 * 4;
        write_pattern(&memory, VRAM_PADDR, base_size + level1_size);

        let info = TextureInfo {
            physical_address: VRAM_PADDR,
            width: 16,
            height: 16,
            stride: 16 * 4,
            format: TextureFormat::Rgba8,
        };
        let surface = cache.get_texture_surface(&info, 1).unwrap();
        assert_eq!(surface.max_level(), 1);

        let watcher = surface.level_watcher(0).unwrap();
        assert!(watcher.is_valid());
        let level_surface = watcher.get().unwrap();
        assert_eq!(level_surface.params.addr, VRAM_PADDR + base_size);
        assert_eq!(level_surface.params.width, 8);
        assert_eq!(cache.surface_count(), 2);
    }

    #[test]
    fn test_get_texture_surface_rejects_unaligned_mips() {
        let (mut cache, _memory) = make_cache();
        let info = TextureInfo {
            physical_address: VRAM_PADDR,
            width: 8,
            height: 8,
            stride: 8 * 4,
            format: TextureFormat::Rgba8,
        };
        // 8 >> 1 = 4, not a multiple of 8.
        assert!(cache.get_texture_surface(&info, 1).is_none());
        assert_eq!(cache.surface_count(), 0);
    }

    #[test]
    fn test_get_texture_cube_syncs_faces() {
        let (mut cache, memory) = make_cache();
        let face_size = 8 * 8 * 4;
        write_pattern(&memory, VRAM_PADDR, face_size * 6);

        let config = TextureCubeConfig {
            px: VRAM_PADDR,
            nx: VRAM_PADDR + face_size,
            py: VRAM_PADDR + face_size * 2,
            ny: VRAM_PADDR + face_size * 3,
            pz: VRAM_PADDR + face_size * 4,
            nz: VRAM_PADDR + face_size * 5,
            width: 8,
            format: TextureFormat::Rgba8,
        };
        let cube = cache.get_texture_cube(&config).unwrap();
        for face in 0..6 {
            let watcher = cube.level_watcher(face).unwrap();
            assert!(watcher.is_valid());
        }
        // Six face surfaces registered; the cube itself is not.
        assert_eq!(cache.surface_count(), 6);
        assert!(!cube.is_registered());

        // A second lookup reuses the cube.
        let again = cache.get_texture_cube(&config).unwrap();
        assert_eq!(again.id(), cube.id());
    }

    #[test]
    fn test_get_framebuffer_surfaces() {
        let (mut cache, _memory) = make_cache();
        let config = FramebufferConfig {
            width: 64,
            height: 64,
            color_format: PixelFormat::Rgba8,
            depth_format: PixelFormat::D16,
            color_addr: VRAM_PADDR,
            depth_addr: VRAM_PADDR + 0x10000,
        };
        let viewport = Viewport {
            left: 0,
            top: 64,
            right: 64,
            bottom: 0,
        };

        let (color, depth, fb_rect) =
            cache.get_framebuffer_surfaces(&config, true, true, viewport, 1);
        assert!(color.is_some());
        assert!(depth.is_some());
        assert_eq!(fb_rect.width(), 64);
        assert_eq!(fb_rect.height(), 64);
    }

    #[test]
    fn test_get_framebuffer_surfaces_rejects_overlap() {
        let (mut cache, _memory) = make_cache();
        let config = FramebufferConfig {
            width: 64,
            height: 64,
            color_format: PixelFormat::Rgba8,
            depth_format: PixelFormat::D24S8,
            color_addr: VRAM_PADDR,
            depth_addr: VRAM_PADDR,
        };
        let viewport = Viewport {
            left: 0,
            top: 64,
            right: 64,
            bottom: 0,
        };

        let (color, depth, _) = cache.get_framebuffer_surfaces(&config, true, true, viewport, 1);
        assert!(color.is_some());
        assert!(depth.is_none());
    }

    #[test]
    fn test_resolution_scale_change_resets_cache() {
        let (mut cache, _memory) = make_cache();
        let params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        let _surface = cache
            .get_surface(&params, ScaleMatch::Exact, false)
            .unwrap();
        assert_eq!(cache.surface_count(), 1);

        let config = FramebufferConfig {
            width: 64,
            height: 64,
            color_format: PixelFormat::Rgba8,
            depth_format: PixelFormat::D16,
            color_addr: VRAM_PADDR + 0x20000,
            depth_addr: 0,
        };
        let viewport = Viewport {
            left: 0,
            top: 64,
            right: 64,
            bottom: 0,
        };
        // Scale bump drops the previously registered surface.
        let (color, _, _) = cache.get_framebuffer_surfaces(&config, true, false, viewport, 2);
        assert!(color.is_some());
        assert_eq!(cache.page_tracker.page_count(VRAM_PADDR), 0);
    }

    #[test]
    fn test_get_tex_copy_surface_contiguous() {
        let (mut cache, memory) = make_cache();
        let params = linear_params(VRAM_PADDR, 64, 64, PixelFormat::Rgba8);
        write_pattern(&memory, params.addr, params.size);
        let surface = cache.get_surface(&params, ScaleMatch::Exact, true).unwrap();

        let row_bytes = 64 * 4;
        let mut copy_params = SurfaceParams {
            addr: params.addr,
            width: 16 * row_bytes,
            stride: 16 * row_bytes,
            height: 1,
            ..Default::default()
        };
        copy_params.end = copy_params.addr + 16 * row_bytes;
        copy_params.size = copy_params.end - copy_params.addr;

        let (found, rect) = cache.get_tex_copy_surface(&copy_params);
        assert_eq!(found.unwrap().id(), surface.id());
        assert_eq!(rect.width(), 64);
        assert_eq!(rect.height(), 16);
    }
}
