// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cached surfaces and their weak-validity watchers.
//!
//! A `Surface` pairs an immutable parameter block with the mutable cache
//! state (validity intervals, registration, mip watchers). Surfaces are
//! shared: the cache holds one strong reference per registered surface,
//! watchers hold weak ones, and transient draw handles keep a surface
//! alive past unregistration. All mutable state sits behind one mutex and
//! is only touched on the cache's mutating paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use citrus_common::types::{align_down, align_up};
use parking_lot::Mutex;

use super::interval::{IntervalSet, SurfaceInterval};
use super::pixel_format::SurfaceType;
use super::surface_params::SurfaceParams;

/// Shared handle to a cached surface.
pub type SurfaceRef = Arc<Surface>;

/// Number of mipmap level watchers (PICA textures span 8..1024 pixels, so
/// at most seven levels above the base).
pub const MAX_LEVEL_WATCHERS: usize = 7;

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity for a surface, used to key sets and dirty maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

/// A watcher that reports whether a surface collection member (mip level,
/// cube face) still exists and has been synced into its container.
pub struct SurfaceWatcher {
    surface: Mutex<Weak<Surface>>,
    valid: AtomicBool,
}

impl SurfaceWatcher {
    fn new(surface: Weak<Surface>) -> Self {
        Self {
            surface: Mutex::new(surface),
            valid: AtomicBool::new(false),
        }
    }

    /// The watched surface, or None if it has been destroyed.
    pub fn get(&self) -> Option<SurfaceRef> {
        self.surface.lock().upgrade()
    }

    /// Whether the watched surface still exists and its content has been
    /// synced since the last invalidation.
    pub fn is_valid(&self) -> bool {
        self.surface.lock().strong_count() > 0 && self.valid.load(Ordering::Acquire)
    }

    /// Mark the watcher's user as up to date with the watched surface.
    pub fn validate(&self) {
        debug_assert!(self.surface.lock().strong_count() > 0);
        self.valid.store(true, Ordering::Release);
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn unlink(&self) {
        self.valid.store(false, Ordering::Release);
        *self.surface.lock() = Weak::new();
    }
}

struct SurfaceState {
    registered: bool,
    invalid_regions: IntervalSet,
    max_level: u32,
    level_watchers: [Option<Arc<SurfaceWatcher>>; MAX_LEVEL_WATCHERS],
    watchers: Vec<Weak<SurfaceWatcher>>,
}

pub struct Surface {
    id: SurfaceId,
    pub params: SurfaceParams,
    /// Fill pattern for `SurfaceType::Fill`; the period is 2, 3 or 4 bytes.
    pub fill_data: [u8; 4],
    pub fill_size: u32,
    state: Mutex<SurfaceState>,
}

impl PartialEq for Surface {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Surface {}

impl Surface {
    /// Create a regular surface; the whole interval starts out invalid.
    pub fn new(params: SurfaceParams) -> SurfaceRef {
        Arc::new(Self {
            id: SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed)),
            params,
            fill_data: [0; 4],
            fill_size: 0,
            state: Mutex::new(SurfaceState {
                registered: false,
                invalid_regions: IntervalSet::from_interval(params.interval()),
                max_level: 0,
                level_watchers: Default::default(),
                watchers: Vec::new(),
            }),
        })
    }

    /// Create a fill surface. Fill surfaces are always valid.
    pub fn new_fill(params: SurfaceParams, fill_data: [u8; 4], fill_size: u32) -> SurfaceRef {
        debug_assert!(matches!(fill_size, 2..=4));
        Arc::new(Self {
            id: SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed)),
            params,
            fill_data,
            fill_size,
            state: Mutex::new(SurfaceState {
                registered: false,
                invalid_regions: IntervalSet::new(),
                max_level: 0,
                level_watchers: Default::default(),
                watchers: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn interval(&self) -> SurfaceInterval {
        self.params.interval()
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn set_registered(&self, registered: bool) {
        self.state.lock().registered = registered;
    }

    // ── Validity ────────────────────────────────────────────────────────

    /// True when no byte of `interval` is stale on the host.
    pub fn is_region_valid(&self, interval: SurfaceInterval) -> bool {
        self.state.lock().invalid_regions.is_disjoint(interval)
    }

    /// True when not a single byte of the surface is valid.
    pub fn is_fully_invalid(&self) -> bool {
        let interval = self.interval();
        match self.state.lock().invalid_regions.iter_overlaps(interval).next() {
            Some(piece) => piece.contains(interval),
            None => false,
        }
    }

    pub fn has_invalid_regions(&self) -> bool {
        !self.state.lock().invalid_regions.is_empty()
    }

    pub fn invalid_regions(&self) -> IntervalSet {
        self.state.lock().invalid_regions.clone()
    }

    /// The stale subset of `interval`.
    pub fn invalid_intersection(&self, interval: SurfaceInterval) -> IntervalSet {
        self.state.lock().invalid_regions.intersection(interval)
    }

    pub fn mark_invalid(&self, interval: SurfaceInterval) {
        self.state.lock().invalid_regions.insert(interval);
    }

    pub fn mark_valid(&self, interval: SurfaceInterval) {
        self.state.lock().invalid_regions.erase(interval);
    }

    /// Replace validity wholesale, used when duplicating into a container:
    /// `invalid := (invalid - transferred) ∪ source_invalid`.
    pub fn transfer_validity(&self, source: &Surface) {
        let source_invalid = source.invalid_regions();
        let mut state = self.state.lock();
        state.invalid_regions.erase(source.interval());
        state.invalid_regions.insert_set(&source_invalid);
    }

    // ── Fill and copy sources ───────────────────────────────────────────

    /// True when this fill surface can produce every byte of
    /// `fill_interval` inside `dest`, accounting for period mismatch
    /// between the fill pattern and the destination pixel size.
    pub fn can_fill(&self, dest: &SurfaceParams, fill_interval: SurfaceInterval) -> bool {
        if self.params.surface_type != SurfaceType::Fill
            || !self.is_region_valid(fill_interval)
            || fill_interval.start < self.params.addr
            || fill_interval.end > self.params.end
            || dest.from_interval(fill_interval).interval() != fill_interval
        {
            return false;
        }

        if self.fill_size * 8 != dest.bits_per_pixel() {
            // The pattern must repeat at the destination pixel period.
            let dest_bytes_per_pixel = (dest.bits_per_pixel() / 8).max(1) as usize;
            let fill_size = self.fill_size as usize;
            let mut fill_test = vec![0u8; fill_size * dest_bytes_per_pixel];
            for i in 0..dest_bytes_per_pixel {
                fill_test[i * fill_size..(i + 1) * fill_size]
                    .copy_from_slice(&self.fill_data[..fill_size]);
            }
            for i in 1..fill_size {
                let a = &fill_test[dest_bytes_per_pixel * i..dest_bytes_per_pixel * (i + 1)];
                if a != &fill_test[..dest_bytes_per_pixel] {
                    return false;
                }
            }
            if dest.bits_per_pixel() == 4 && (fill_test[0] & 0xF) != (fill_test[0] >> 4) {
                return false;
            }
        }
        true
    }

    /// True when `copy_interval` of a surface with params `dest` can be
    /// validated by copying from this surface.
    pub fn can_copy(&self, dest: &SurfaceParams, copy_interval: SurfaceInterval) -> bool {
        let subrect_params = dest.from_interval(copy_interval);
        debug_assert_eq!(subrect_params.interval(), copy_interval);
        self.params.can_sub_rect(&subrect_params) || self.can_fill(dest, copy_interval)
    }

    /// The biggest valid rectangle of this surface usable as a copy source
    /// for `params`, as a byte interval.
    pub fn get_copyable_interval(&self, params: &SurfaceParams) -> SurfaceInterval {
        let mut result = SurfaceInterval::default();
        let tile_align = params.bytes_in_pixels(if params.is_tiled { 8 * 8 } else { 1 });
        let stride_bytes =
            params.bytes_in_pixels(params.stride) * if params.is_tiled { 8 } else { 1 };

        let mut valid_regions =
            IntervalSet::from_interval(params.interval().intersect(self.interval()));
        valid_regions.erase_set(&self.state.lock().invalid_regions);

        for valid_interval in valid_regions.iter() {
            if tile_align > valid_interval.len() {
                continue;
            }
            let aligned_start =
                params.addr + align_up(valid_interval.start - params.addr, tile_align);
            let aligned_end =
                params.addr + align_down(valid_interval.end - params.addr, tile_align);
            if aligned_end <= aligned_start {
                continue;
            }
            let aligned = SurfaceInterval::new(aligned_start, aligned_end);

            // Shrink to whole rows within the aligned interval.
            let rect_start = params.addr + align_up(aligned.start - params.addr, stride_bytes);
            let rect_end = params.addr + align_down(aligned.end - params.addr, stride_bytes);

            let rect_interval = if rect_start > rect_end {
                // Entirely within one row.
                aligned
            } else if rect_start == rect_end {
                // Two partial rows that do not form a rectangle; keep the
                // longer one.
                let row1 = SurfaceInterval::new(aligned.start, rect_start);
                let row2 = SurfaceInterval::new(rect_start, aligned.end);
                if row1.len() > row2.len() {
                    row1
                } else {
                    row2
                }
            } else {
                SurfaceInterval::new(rect_start, rect_end)
            };

            if rect_interval.len() > result.len() {
                result = rect_interval;
            }
        }
        result
    }

    // ── Mip levels ──────────────────────────────────────────────────────

    pub fn max_level(&self) -> u32 {
        self.state.lock().max_level
    }

    pub fn set_max_level(&self, max_level: u32) {
        self.state.lock().max_level = max_level;
    }

    pub fn level_watcher(&self, index: usize) -> Option<Arc<SurfaceWatcher>> {
        self.state.lock().level_watchers[index].clone()
    }

    pub fn set_level_watcher(&self, index: usize, watcher: Option<Arc<SurfaceWatcher>>) {
        self.state.lock().level_watchers[index] = watcher;
    }

    // ── Watchers ────────────────────────────────────────────────────────

    /// Create a watcher following this surface.
    pub fn create_watcher(self: &SurfaceRef) -> Arc<SurfaceWatcher> {
        let watcher = Arc::new(SurfaceWatcher::new(Arc::downgrade(self)));
        self.state.lock().watchers.push(Arc::downgrade(&watcher));
        watcher
    }

    /// Mark every watcher as stale after the surface contents change.
    pub fn invalidate_all_watchers(&self) {
        for watcher in &self.state.lock().watchers {
            if let Some(watcher) = watcher.upgrade() {
                watcher.invalidate();
            }
        }
    }

    /// Detach every watcher, as if the surface were already destroyed.
    pub fn unlink_all_watchers(&self) {
        let mut state = self.state.lock();
        for watcher in &state.watchers {
            if let Some(watcher) = watcher.upgrade() {
                watcher.unlink();
            }
        }
        state.watchers.clear();
    }
}
