// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware-accelerated rasterizer state.
//!
//! Owns the PICA register mirror, the surface cache, the vertex batch and
//! the uniform block shadowing fixed-function register state for the
//! generated shaders. Register writes dispatch through a table built at
//! construction: each register id maps to a uniform sync, a LUT dirty
//! flag, a shader invalidation, or a combination; everything else is
//! forwarded to the backend's fixed-function handler.

use std::sync::Arc;

use citrus_common::types::{align_up, PAddr};
use log::trace;

use crate::backend::TextureRuntime;
use crate::memory::GuestMemory;
use crate::pica::regs::{self, PicaRegs, ProcTexLutTable, NUM_LIGHTING_LUTS, NUM_LIGHTS, NUM_PICA_REGS};
use crate::pica::shader::OutputVertex;
use crate::pica::Float20;
use crate::rasterizer_cache::RasterizerCache;

/// Per-light uniform state mirrored from the lighting registers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LightSrc {
    pub specular_0: [f32; 3],
    pub specular_1: [f32; 3],
    pub diffuse: [f32; 3],
    pub ambient: [f32; 3],
    pub position: [f32; 3],
    pub spot_direction: [f32; 3],
    pub dist_atten_bias: f32,
    pub dist_atten_scale: f32,
}

/// The uniform block contents consumed by the generated fragment shaders.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UniformData {
    pub fog_color: [f32; 3],
    pub proctex_noise_f: [f32; 2],
    pub proctex_noise_a: [f32; 2],
    pub proctex_noise_p: [f32; 2],
    pub proctex_bias: f32,
    pub alphatest_ref: u32,
    pub tev_combiner_buffer_color: [f32; 4],
    pub const_color: [[f32; 4]; 6],
    pub depth_scale: f32,
    pub depth_offset: f32,
    pub shadow_bias_constant: f32,
    pub shadow_bias_linear: f32,
    pub shadow_texture_bias: i32,
    pub lighting_global_ambient: [f32; 3],
    pub light_src: [LightSrc; NUM_LIGHTS],
}

/// Uniform shadow plus the dirty flags driving re-upload.
pub struct UniformBlockData {
    pub data: UniformData,
    pub dirty: bool,
    pub fog_lut_dirty: bool,
    pub proctex_noise_lut_dirty: bool,
    pub proctex_color_map_dirty: bool,
    pub proctex_alpha_map_dirty: bool,
    pub proctex_lut_dirty: bool,
    pub proctex_diff_lut_dirty: bool,
    pub lighting_lut_dirty: [bool; NUM_LIGHTING_LUTS],
    pub lighting_lut_dirty_any: bool,
}

impl Default for UniformBlockData {
    fn default() -> Self {
        Self {
            data: UniformData::default(),
            dirty: false,
            fog_lut_dirty: false,
            proctex_noise_lut_dirty: false,
            proctex_color_map_dirty: false,
            proctex_alpha_map_dirty: false,
            proctex_lut_dirty: false,
            proctex_diff_lut_dirty: false,
            // Every lighting LUT must be considered stale on startup.
            lighting_lut_dirty: [true; NUM_LIGHTING_LUTS],
            lighting_lut_dirty_any: true,
        }
    }
}

/// Which uniform a register write refreshes.
#[derive(Debug, Clone, Copy)]
enum UniformSync {
    DepthScale,
    DepthOffset,
    FogColor,
    ProcTexNoise,
    ProcTexBias,
    AlphaTest,
    CombinerColor,
    TevConstColor(usize),
    GlobalAmbient,
    ShadowBias,
    ShadowTextureBias,
    LightSpecular0(usize),
    LightSpecular1(usize),
    LightDiffuse(usize),
    LightAmbient(usize),
    LightPosition(usize),
    LightSpotDirection(usize),
    LightDistAttenBias(usize),
    LightDistAttenScale(usize),
}

/// Behavior of one register id in the dispatch table.
#[derive(Debug, Clone, Copy)]
enum RegAction {
    Uniform(UniformSync),
    UniformAndShader(UniformSync),
    DirtyFogLut,
    DirtyLightingLut,
    /// LUT data writes route by the currently selected reference table.
    ProcTexLutData,
    ShaderDirty,
    /// Consumed by the shader generator directly; nothing to sync here.
    Handled,
}

/// A vertex record in the hardware vertex batch, converted to host floats.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareVertex {
    pub position: [f32; 4],
    pub color: [f32; 4],
    pub tex_coord0: [f32; 2],
    pub tex_coord1: [f32; 2],
    pub tex_coord2: [f32; 2],
    pub tex_coord0_w: f32,
    pub normquat: [f32; 4],
    pub view: [f32; 3],
}

impl HardwareVertex {
    pub fn new(v: &OutputVertex, flip_quaternion: bool) -> Self {
        let mut vertex = Self {
            position: v.pos.map(|f| f.to_f32()),
            color: v.color.map(|f| f.to_f32()),
            tex_coord0: v.tc0.map(|f| f.to_f32()),
            tex_coord1: v.tc1.map(|f| f.to_f32()),
            tex_coord2: v.tc2.map(|f| f.to_f32()),
            tex_coord0_w: v.tc0_w.to_f32(),
            normquat: v.quat.map(|f| f.to_f32()),
            view: v.view.map(|f| f.to_f32()),
        };
        if flip_quaternion {
            for component in &mut vertex.normquat {
                *component = -*component;
            }
        }
        vertex
    }
}

/// There are two quaternions per rotation; interpolating between opposite
/// ones takes the long way around. The hardware flips the second operand
/// when the dot product is negative, and so do we.
fn are_quaternions_opposite(a: [f32; 4], b: [f32; 4]) -> bool {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f32>() < 0.0
}

/// Vertex range and input buffer size for a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexArrayInfo {
    pub vs_input_index_min: u32,
    pub vs_input_index_max: u32,
    pub vs_input_size: u32,
}

pub struct RasterizerAccelerated<R: TextureRuntime> {
    pub regs: PicaRegs,
    memory: Arc<dyn GuestMemory>,
    res_cache: RasterizerCache<R>,
    vertex_batch: Vec<HardwareVertex>,
    uniform_block_data: UniformBlockData,
    shader_dirty: bool,
    reg_table: Box<[Option<RegAction>]>,
    fixed_function_hook: Option<Box<dyn FnMut(u32) + Send>>,
}

impl<R: TextureRuntime> RasterizerAccelerated<R> {
    pub fn new(memory: Arc<dyn GuestMemory>, runtime: R, resolution_scale_factor: u16) -> Self {
        Self {
            regs: PicaRegs::new(),
            res_cache: RasterizerCache::new(memory.clone(), runtime, resolution_scale_factor),
            memory,
            vertex_batch: Vec::new(),
            uniform_block_data: UniformBlockData::default(),
            shader_dirty: true,
            reg_table: build_reg_table(),
            fixed_function_hook: None,
        }
    }

    pub fn res_cache(&self) -> &RasterizerCache<R> {
        &self.res_cache
    }

    pub fn res_cache_mut(&mut self) -> &mut RasterizerCache<R> {
        &mut self.res_cache
    }

    pub fn uniform_block_data(&self) -> &UniformBlockData {
        &self.uniform_block_data
    }

    pub fn uniform_block_data_mut(&mut self) -> &mut UniformBlockData {
        &mut self.uniform_block_data
    }

    pub fn shader_dirty(&self) -> bool {
        self.shader_dirty
    }

    pub fn clear_shader_dirty(&mut self) {
        self.shader_dirty = false;
    }

    pub fn vertex_batch(&self) -> &[HardwareVertex] {
        &self.vertex_batch
    }

    pub fn take_vertex_batch(&mut self) -> Vec<HardwareVertex> {
        std::mem::take(&mut self.vertex_batch)
    }

    /// Install the handler receiving register ids the mirror does not
    /// consume itself.
    pub fn set_fixed_function_hook(&mut self, hook: Box<dyn FnMut(u32) + Send>) {
        self.fixed_function_hook = Some(hook);
    }

    // ── Vertex batching ─────────────────────────────────────────────────

    /// Queue one shaded triangle, correcting quaternion winding against
    /// the provoking vertex.
    pub fn add_triangle(&mut self, v0: &OutputVertex, v1: &OutputVertex, v2: &OutputVertex) {
        let q0 = v0.quat.map(|f| f.to_f32());
        let q1 = v1.quat.map(|f| f.to_f32());
        let q2 = v2.quat.map(|f| f.to_f32());
        self.vertex_batch.push(HardwareVertex::new(v0, false));
        self.vertex_batch
            .push(HardwareVertex::new(v1, are_quaternions_opposite(q0, q1)));
        self.vertex_batch
            .push(HardwareVertex::new(v2, are_quaternions_opposite(q0, q2)));
    }

    // ── Vertex array analysis ───────────────────────────────────────────

    /// Determine the vertex index range a draw actually uses and the
    /// vertex shader input buffer size it needs, so unused vertices are
    /// never uploaded.
    pub fn analyze_vertex_array(
        &mut self,
        is_indexed: bool,
        stride_alignment: u32,
    ) -> VertexArrayInfo {
        let num_vertices = self.regs.num_vertices();

        let (vertex_min, vertex_max) = if is_indexed {
            let index_info = self.regs.index_array();
            let address = self.regs.attrib_physical_base_address() + index_info.offset;
            let index_bytes = if index_info.format_u16 { 2 } else { 1 };
            let size = num_vertices * index_bytes;

            // The index data may still live on the GPU.
            self.res_cache.flush_region(address, size, None);

            let mut buffer = vec![0u8; size as usize];
            self.memory.read(address, &mut buffer);

            let mut vertex_min = 0xFFFF;
            let mut vertex_max = 0;
            for index in 0..num_vertices as usize {
                let vertex = if index_info.format_u16 {
                    u16::from_le_bytes([buffer[index * 2], buffer[index * 2 + 1]]) as u32
                } else {
                    buffer[index] as u32
                };
                vertex_min = vertex_min.min(vertex);
                vertex_max = vertex_max.max(vertex);
            }
            (vertex_min, vertex_max)
        } else {
            let offset = self.regs.vertex_offset();
            (offset, offset + num_vertices - 1)
        };

        let vertex_num = vertex_max - vertex_min + 1;
        let mut vs_input_size = 0;
        for i in 0..regs::NUM_ATTRIB_LOADERS {
            let loader = self.regs.attribute_loader(i);
            if loader.component_count != 0 {
                let aligned_stride = align_up(loader.byte_count, stride_alignment);
                vs_input_size += align_up(aligned_stride * vertex_num, 4);
            }
        }

        VertexArrayInfo {
            vs_input_index_min: vertex_min,
            vs_input_index_max: vertex_max,
            vs_input_size,
        }
    }

    // ── Cache passthroughs ──────────────────────────────────────────────

    pub fn flush_region(&mut self, addr: PAddr, size: u32) {
        self.res_cache.flush_region(addr, size, None);
    }

    pub fn invalidate_region(&mut self, addr: PAddr, size: u32) {
        self.res_cache.invalidate_region(addr, size, None);
    }

    pub fn flush_and_invalidate_region(&mut self, addr: PAddr, size: u32) {
        self.res_cache.flush_region(addr, size, None);
        self.res_cache.invalidate_region(addr, size, None);
    }

    /// Drop every page trap, optionally flushing all host-side data out
    /// first.
    pub fn clear_all(&mut self, flush: bool) {
        if flush {
            self.res_cache.flush_region(0, 0xFFFF_FFFF, None);
        }
        self.res_cache.page_tracker_mut().clear_all();
    }

    // ── Register dispatch ───────────────────────────────────────────────

    /// Store a register write and sync the derived state.
    pub fn write_pica_register(&mut self, id: u32, value: u32) {
        self.regs.set(id, value);
        self.notify_pica_register_changed(id);
    }

    /// Re-derive any uniform, LUT or shader state depending on `id`.
    pub fn notify_pica_register_changed(&mut self, id: u32) {
        let Some(action) = self.reg_table.get(id as usize).copied().flatten() else {
            // Registers mapping to fixed-function API features go to the
            // video backend.
            if let Some(hook) = &mut self.fixed_function_hook {
                hook(id);
            } else {
                trace!("Unhandled PICA register write: 0x{:03X}", id);
            }
            return;
        };

        match action {
            RegAction::Uniform(sync) => self.sync_uniform(sync),
            RegAction::UniformAndShader(sync) => {
                self.sync_uniform(sync);
                self.shader_dirty = true;
            }
            RegAction::DirtyFogLut => self.uniform_block_data.fog_lut_dirty = true,
            RegAction::DirtyLightingLut => {
                let lut = self.regs.lighting_lut_type();
                self.uniform_block_data.lighting_lut_dirty[lut] = true;
                self.uniform_block_data.lighting_lut_dirty_any = true;
            }
            RegAction::ProcTexLutData => match self.regs.proctex_lut_ref_table() {
                Some(ProcTexLutTable::Noise) => {
                    self.uniform_block_data.proctex_noise_lut_dirty = true;
                }
                Some(ProcTexLutTable::ColorMap) => {
                    self.uniform_block_data.proctex_color_map_dirty = true;
                }
                Some(ProcTexLutTable::AlphaMap) => {
                    self.uniform_block_data.proctex_alpha_map_dirty = true;
                }
                Some(ProcTexLutTable::Color) => {
                    self.uniform_block_data.proctex_lut_dirty = true;
                }
                Some(ProcTexLutTable::ColorDiff) => {
                    self.uniform_block_data.proctex_diff_lut_dirty = true;
                }
                None => {}
            },
            RegAction::ShaderDirty => self.shader_dirty = true,
            RegAction::Handled => {}
        }
    }

    /// Copy one decoded register value into the uniform shadow, marking
    /// the block dirty only when the value actually changed.
    fn sync_uniform(&mut self, sync: UniformSync) {
        let data = &mut self.uniform_block_data.data;
        let regs = &self.regs;

        let changed = match sync {
            UniformSync::DepthScale => {
                update(&mut data.depth_scale, regs.viewport_depth_range().to_f32())
            }
            UniformSync::DepthOffset => update(
                &mut data.depth_offset,
                regs.viewport_depth_near_plane().to_f32(),
            ),
            UniformSync::FogColor => update(&mut data.fog_color, regs.fog_color()),
            UniformSync::ProcTexNoise => {
                update(&mut data.proctex_noise_f, regs.proctex_noise_frequency())
                    | update(&mut data.proctex_noise_a, regs.proctex_noise_amplitude())
                    | update(&mut data.proctex_noise_p, regs.proctex_noise_phase())
            }
            UniformSync::ProcTexBias => update(&mut data.proctex_bias, regs.proctex_bias()),
            UniformSync::AlphaTest => update(&mut data.alphatest_ref, regs.alpha_test_ref()),
            UniformSync::CombinerColor => update(
                &mut data.tev_combiner_buffer_color,
                regs.tev_combiner_buffer_color(),
            ),
            UniformSync::TevConstColor(stage) => {
                update(&mut data.const_color[stage], regs.tev_const_color(stage))
            }
            UniformSync::GlobalAmbient => update(
                &mut data.lighting_global_ambient,
                light_color(regs.global_ambient()),
            ),
            UniformSync::ShadowBias => {
                update(
                    &mut data.shadow_bias_constant,
                    regs.shadow_bias_constant().to_f32(),
                ) | update(
                    &mut data.shadow_bias_linear,
                    regs.shadow_bias_linear().to_f32(),
                )
            }
            UniformSync::ShadowTextureBias => {
                update(&mut data.shadow_texture_bias, regs.shadow_texture_bias())
            }
            UniformSync::LightSpecular0(i) => update(
                &mut data.light_src[i].specular_0,
                light_color(regs.light_color(i, regs::LIGHT_OFF_SPECULAR_0)),
            ),
            UniformSync::LightSpecular1(i) => update(
                &mut data.light_src[i].specular_1,
                light_color(regs.light_color(i, regs::LIGHT_OFF_SPECULAR_1)),
            ),
            UniformSync::LightDiffuse(i) => update(
                &mut data.light_src[i].diffuse,
                light_color(regs.light_color(i, regs::LIGHT_OFF_DIFFUSE)),
            ),
            UniformSync::LightAmbient(i) => update(
                &mut data.light_src[i].ambient,
                light_color(regs.light_color(i, regs::LIGHT_OFF_AMBIENT)),
            ),
            UniformSync::LightPosition(i) => {
                update(&mut data.light_src[i].position, regs.light_position(i))
            }
            UniformSync::LightSpotDirection(i) => update(
                &mut data.light_src[i].spot_direction,
                regs.light_spot_direction(i),
            ),
            UniformSync::LightDistAttenBias(i) => update(
                &mut data.light_src[i].dist_atten_bias,
                Float20::from_raw(regs.light_reg(i, regs::LIGHT_OFF_DIST_ATTEN_BIAS)).to_f32(),
            ),
            UniformSync::LightDistAttenScale(i) => update(
                &mut data.light_src[i].dist_atten_scale,
                Float20::from_raw(regs.light_reg(i, regs::LIGHT_OFF_DIST_ATTEN_SCALE)).to_f32(),
            ),
        };

        if changed {
            self.uniform_block_data.dirty = true;
        }
    }
}

/// Assign `value` to `slot`, reporting whether it differed.
fn update<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot != value {
        *slot = value;
        true
    } else {
        false
    }
}

fn light_color(color: regs::LightColor) -> [f32; 3] {
    [
        color.r as f32 / 255.0,
        color.g as f32 / 255.0,
        color.b as f32 / 255.0,
    ]
}

/// Build the register-id dispatch table.
fn build_reg_table() -> Box<[Option<RegAction>]> {
    let mut table: Vec<Option<RegAction>> = vec![None; NUM_PICA_REGS];
    let mut set = |id: u32, action: RegAction| {
        table[id as usize] = Some(action);
    };

    // Depth modifiers.
    set(
        regs::REG_VIEWPORT_DEPTH_RANGE,
        RegAction::Uniform(UniformSync::DepthScale),
    );
    set(
        regs::REG_VIEWPORT_DEPTH_NEAR_PLANE,
        RegAction::Uniform(UniformSync::DepthOffset),
    );
    set(regs::REG_DEPTHMAP_ENABLE, RegAction::ShaderDirty);

    // Scissor and texture unit configuration feed the shader generator.
    set(regs::REG_SCISSOR_TEST_MODE, RegAction::ShaderDirty);
    set(regs::REG_TEXUNIT_MAIN_CONFIG, RegAction::ShaderDirty);
    set(regs::REG_TEXTURE0_TYPE, RegAction::ShaderDirty);

    // Shadow biases.
    set(
        regs::REG_TEXUNIT0_SHADOW,
        RegAction::Uniform(UniformSync::ShadowTextureBias),
    );
    set(
        regs::REG_FRAMEBUFFER_SHADOW,
        RegAction::Uniform(UniformSync::ShadowBias),
    );

    // Fog.
    set(regs::REG_FOG_COLOR, RegAction::Uniform(UniformSync::FogColor));
    for id in regs::REG_FOG_LUT_DATA_FIRST..=regs::REG_FOG_LUT_DATA_LAST {
        set(id, RegAction::DirtyFogLut);
    }

    // ProcTex.
    set(
        regs::REG_PROCTEX,
        RegAction::UniformAndShader(UniformSync::ProcTexBias),
    );
    set(
        regs::REG_PROCTEX_LUT,
        RegAction::UniformAndShader(UniformSync::ProcTexBias),
    );
    set(
        regs::REG_PROCTEX_LUT_OFFSET,
        RegAction::UniformAndShader(UniformSync::ProcTexBias),
    );
    set(
        regs::REG_PROCTEX_NOISE_U,
        RegAction::Uniform(UniformSync::ProcTexNoise),
    );
    set(
        regs::REG_PROCTEX_NOISE_V,
        RegAction::Uniform(UniformSync::ProcTexNoise),
    );
    set(
        regs::REG_PROCTEX_NOISE_FREQUENCY,
        RegAction::Uniform(UniformSync::ProcTexNoise),
    );
    for id in regs::REG_PROCTEX_LUT_DATA_FIRST..=regs::REG_PROCTEX_LUT_DATA_LAST {
        set(id, RegAction::ProcTexLutData);
    }

    // Alpha test changes both the reference uniform and the shader.
    set(
        regs::REG_ALPHA_TEST,
        RegAction::UniformAndShader(UniformSync::AlphaTest),
    );

    // TEV stages: sources, modifiers, ops and scales are baked into the
    // shader; the const color is a uniform.
    for (stage, &base) in regs::REG_TEV_STAGE_BASES.iter().enumerate() {
        set(base + regs::TEV_OFF_COLOR_SOURCE, RegAction::ShaderDirty);
        set(base + regs::TEV_OFF_COLOR_MODIFIER, RegAction::ShaderDirty);
        set(base + regs::TEV_OFF_COLOR_OP, RegAction::ShaderDirty);
        set(base + regs::TEV_OFF_COLOR_SCALE, RegAction::ShaderDirty);
        set(
            base + regs::TEV_OFF_CONST_COLOR,
            RegAction::Uniform(UniformSync::TevConstColor(stage)),
        );
    }
    set(regs::REG_TEV_COMBINER_BUFFER_INPUT, RegAction::ShaderDirty);
    set(
        regs::REG_TEV_COMBINER_BUFFER_COLOR,
        RegAction::Uniform(UniformSync::CombinerColor),
    );

    // Lighting switches are read by the shader generator when it runs.
    for id in [
        regs::REG_LIGHTING_DISABLE,
        regs::REG_LIGHTING_NUM_LIGHTS,
        regs::REG_LIGHTING_CONFIG0,
        regs::REG_LIGHTING_CONFIG1,
        regs::REG_LIGHTING_ABS_LUT_INPUT,
        regs::REG_LIGHTING_LUT_INPUT,
        regs::REG_LIGHTING_LUT_SCALE,
        regs::REG_LIGHTING_LIGHT_ENABLE,
    ] {
        set(id, RegAction::Handled);
    }

    set(
        regs::REG_LIGHTING_GLOBAL_AMBIENT,
        RegAction::Uniform(UniformSync::GlobalAmbient),
    );
    for id in regs::REG_LIGHTING_LUT_DATA_FIRST..=regs::REG_LIGHTING_LUT_DATA_LAST {
        set(id, RegAction::DirtyLightingLut);
    }

    // Per-light state.
    for light in 0..NUM_LIGHTS {
        let base = regs::REG_LIGHT_BASE + light as u32 * regs::REG_LIGHT_STRIDE;
        set(
            base + regs::LIGHT_OFF_SPECULAR_0,
            RegAction::Uniform(UniformSync::LightSpecular0(light)),
        );
        set(
            base + regs::LIGHT_OFF_SPECULAR_1,
            RegAction::Uniform(UniformSync::LightSpecular1(light)),
        );
        set(
            base + regs::LIGHT_OFF_DIFFUSE,
            RegAction::Uniform(UniformSync::LightDiffuse(light)),
        );
        set(
            base + regs::LIGHT_OFF_AMBIENT,
            RegAction::Uniform(UniformSync::LightAmbient(light)),
        );
        set(
            base + regs::LIGHT_OFF_XY,
            RegAction::Uniform(UniformSync::LightPosition(light)),
        );
        set(
            base + regs::LIGHT_OFF_Z,
            RegAction::Uniform(UniformSync::LightPosition(light)),
        );
        set(
            base + regs::LIGHT_OFF_SPOT_XY,
            RegAction::Uniform(UniformSync::LightSpotDirection(light)),
        );
        set(
            base + regs::LIGHT_OFF_SPOT_Z,
            RegAction::Uniform(UniformSync::LightSpotDirection(light)),
        );
        set(base + regs::LIGHT_OFF_CONFIG, RegAction::ShaderDirty);
        set(
            base + regs::LIGHT_OFF_DIST_ATTEN_BIAS,
            RegAction::Uniform(UniformSync::LightDistAttenBias(light)),
        );
        set(
            base + regs::LIGHT_OFF_DIST_ATTEN_SCALE,
            RegAction::Uniform(UniformSync::LightDistAttenScale(light)),
        );
    }

    table.into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null_backend::NullRuntime;
    use crate::memory::MemorySystem;
    use citrus_common::types::VRAM_PADDR;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_rasterizer() -> RasterizerAccelerated<NullRuntime> {
        let memory = Arc::new(MemorySystem::new());
        RasterizerAccelerated::new(memory, NullRuntime::new(), 1)
    }

    fn make_rasterizer_with_memory() -> (RasterizerAccelerated<NullRuntime>, Arc<MemorySystem>) {
        let memory = Arc::new(MemorySystem::new());
        (
            RasterizerAccelerated::new(memory.clone(), NullRuntime::new(), 1),
            memory,
        )
    }

    #[test]
    fn test_quaternion_flip() {
        let mut rasterizer = make_rasterizer();
        let v0 = OutputVertex::with_pos_quat([0.0; 4], [1.0, 0.0, 0.0, 0.0]);
        let v1 = OutputVertex::with_pos_quat([0.0; 4], [-1.0, 0.0, 0.0, 0.0]);
        let v2 = OutputVertex::with_pos_quat([0.0; 4], [0.5, 0.0, 0.0, 0.0]);

        rasterizer.add_triangle(&v0, &v1, &v2);
        let batch = rasterizer.vertex_batch();
        assert_eq!(batch.len(), 3);

        // v1 was opposite and flipped; v2 was aligned and kept.
        assert_eq!(batch[1].normquat, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(batch[2].normquat, [0.5, 0.0, 0.0, 0.0]);

        for vertex in &batch[1..] {
            let dot: f32 = batch[0]
                .normquat
                .iter()
                .zip(vertex.normquat.iter())
                .map(|(a, b)| a * b)
                .sum();
            assert!(dot >= 0.0);
        }
    }

    #[test]
    fn test_uniform_update_sets_dirty_only_on_change() {
        let mut rasterizer = make_rasterizer();
        rasterizer.uniform_block_data.dirty = false;

        rasterizer.write_pica_register(regs::REG_FOG_COLOR, 0x0000_FF00);
        assert!(rasterizer.uniform_block_data().dirty);
        assert_eq!(rasterizer.uniform_block_data().data.fog_color[1], 1.0);

        // The same value again leaves the block clean.
        rasterizer.uniform_block_data.dirty = false;
        rasterizer.write_pica_register(regs::REG_FOG_COLOR, 0x0000_FF00);
        assert!(!rasterizer.uniform_block_data().dirty);
    }

    #[test]
    fn test_depth_scale_sync() {
        let mut rasterizer = make_rasterizer();
        // f24 encoding of -1.0: sign plus exponent bias 63.
        let raw = (1 << 23) | (63 << 16);
        rasterizer.write_pica_register(regs::REG_VIEWPORT_DEPTH_RANGE, raw);
        assert_eq!(rasterizer.uniform_block_data().data.depth_scale, -1.0);
        assert!(rasterizer.uniform_block_data().dirty);
    }

    #[test]
    fn test_tev_const_color_per_stage() {
        let mut rasterizer = make_rasterizer();
        let base = regs::REG_TEV_STAGE_BASES[3];
        rasterizer.write_pica_register(base + regs::TEV_OFF_CONST_COLOR, 0xFF00_00FF);
        let color = rasterizer.uniform_block_data().data.const_color[3];
        assert_eq!(color[0], 1.0);
        assert_eq!(color[3], 1.0);
        assert_eq!(color[1], 0.0);
        // Stage colors are independent.
        assert_eq!(rasterizer.uniform_block_data().data.const_color[0], [0.0; 4]);
    }

    #[test]
    fn test_fog_lut_write_marks_dirty() {
        let mut rasterizer = make_rasterizer();
        rasterizer.write_pica_register(regs::REG_FOG_LUT_DATA_FIRST + 3, 0x1234);
        assert!(rasterizer.uniform_block_data().fog_lut_dirty);
    }

    #[test]
    fn test_lighting_lut_routed_by_selected_table() {
        let mut rasterizer = make_rasterizer();
        rasterizer.uniform_block_data.lighting_lut_dirty = [false; NUM_LIGHTING_LUTS];
        rasterizer.uniform_block_data.lighting_lut_dirty_any = false;

        rasterizer.write_pica_register(regs::REG_LIGHTING_LUT_CONFIG, 5);
        rasterizer.write_pica_register(regs::REG_LIGHTING_LUT_DATA_FIRST, 0xABCD);

        assert!(rasterizer.uniform_block_data().lighting_lut_dirty[5]);
        assert!(rasterizer.uniform_block_data().lighting_lut_dirty_any);
        assert!(!rasterizer.uniform_block_data().lighting_lut_dirty[0]);
    }

    #[test]
    fn test_proctex_lut_data_second_tier() {
        let mut rasterizer = make_rasterizer();
        rasterizer.write_pica_register(regs::REG_PROCTEX_LUT_CONFIG, 2); // color map
        rasterizer.write_pica_register(regs::REG_PROCTEX_LUT_DATA_FIRST, 1);
        assert!(rasterizer.uniform_block_data().proctex_color_map_dirty);
        assert!(!rasterizer.uniform_block_data().proctex_noise_lut_dirty);

        rasterizer.write_pica_register(regs::REG_PROCTEX_LUT_CONFIG, 0); // noise
        rasterizer.write_pica_register(regs::REG_PROCTEX_LUT_DATA_FIRST + 1, 2);
        assert!(rasterizer.uniform_block_data().proctex_noise_lut_dirty);
    }

    #[test]
    fn test_shader_dirty_on_tev_source_write() {
        let mut rasterizer = make_rasterizer();
        rasterizer.clear_shader_dirty();
        rasterizer.write_pica_register(regs::REG_TEV_STAGE_BASES[0], 0x1111);
        assert!(rasterizer.shader_dirty());
    }

    #[test]
    fn test_alpha_test_updates_uniform_and_shader() {
        let mut rasterizer = make_rasterizer();
        rasterizer.clear_shader_dirty();
        rasterizer.uniform_block_data.dirty = false;

        rasterizer.write_pica_register(regs::REG_ALPHA_TEST, 0xAB << 8);
        assert!(rasterizer.shader_dirty());
        assert!(rasterizer.uniform_block_data().dirty);
        assert_eq!(rasterizer.uniform_block_data().data.alphatest_ref, 0xAB);
    }

    #[test]
    fn test_light_uniforms() {
        let mut rasterizer = make_rasterizer();
        let base = regs::REG_LIGHT_BASE + 2 * regs::REG_LIGHT_STRIDE;
        rasterizer.write_pica_register(base + regs::LIGHT_OFF_DIFFUSE, (0xFF << 20) | 0x80);
        let diffuse = rasterizer.uniform_block_data().data.light_src[2].diffuse;
        assert_eq!(diffuse[0], 1.0);
        assert_eq!(diffuse[2], 0x80 as f32 / 255.0);
        // Other lights stay untouched.
        assert_eq!(
            rasterizer.uniform_block_data().data.light_src[0].diffuse,
            [0.0; 3]
        );
    }

    #[test]
    fn test_unrecognized_register_forwards_to_hook() {
        let mut rasterizer = make_rasterizer();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_hook = seen.clone();
        rasterizer.set_fixed_function_hook(Box::new(move |id| {
            seen_in_hook.store(id, Ordering::Relaxed);
        }));

        // The cull-mode register is fixed-function state.
        rasterizer.write_pica_register(0x040, 1);
        assert_eq!(seen.load(Ordering::Relaxed), 0x040);
    }

    #[test]
    fn test_analyze_vertex_array_non_indexed() {
        let mut rasterizer = make_rasterizer();
        rasterizer.regs.set(regs::REG_NUM_VERTICES, 30);
        rasterizer.regs.set(regs::REG_VERTEX_OFFSET, 10);
        // One loader: 12 bytes per vertex, 3 components.
        rasterizer
            .regs
            .set(regs::REG_ATTRIB_LOADER_FIRST + 2, (3 << 28) | (12 << 16));

        let info = rasterizer.analyze_vertex_array(false, 4);
        assert_eq!(info.vs_input_index_min, 10);
        assert_eq!(info.vs_input_index_max, 39);
        assert_eq!(info.vs_input_size, 12 * 30);
    }

    #[test]
    fn test_analyze_vertex_array_indexed() {
        let (mut rasterizer, memory) = make_rasterizer_with_memory();
        // Index buffer with a hole: only vertices 5..=9 are used.
        let indices: [u8; 4] = [9, 5, 7, 6];
        assert!(memory.write(VRAM_PADDR, &indices));

        rasterizer
            .regs
            .set(regs::REG_ATTRIB_BUFFER_BASE, VRAM_PADDR >> 3);
        rasterizer.regs.set(regs::REG_INDEX_ARRAY_CONFIG, 0); // u8 indices at offset 0
        rasterizer.regs.set(regs::REG_NUM_VERTICES, 4);
        rasterizer
            .regs
            .set(regs::REG_ATTRIB_LOADER_FIRST + 2, (2 << 28) | (6 << 16));

        let info = rasterizer.analyze_vertex_array(true, 4);
        assert_eq!(info.vs_input_index_min, 5);
        assert_eq!(info.vs_input_index_max, 9);
        // 6 bytes aligned to 8, times 5 vertices, aligned to 4.
        assert_eq!(info.vs_input_size, align_up(8 * 5, 4));
    }

    #[test]
    fn test_clear_all_drops_page_traps() {
        let (mut rasterizer, memory) = make_rasterizer_with_memory();
        let mut params = crate::rasterizer_cache::surface_params::SurfaceParams {
            addr: VRAM_PADDR,
            width: 64,
            height: 64,
            pixel_format: crate::rasterizer_cache::pixel_format::PixelFormat::Rgba8,
            ..Default::default()
        };
        params.update_params();
        let _surface = rasterizer
            .res_cache_mut()
            .get_surface(&params, crate::rasterizer_cache::ScaleMatch::Exact, false)
            .unwrap();
        memory.take_cache_marks();

        rasterizer.clear_all(false);
        let marks = memory.take_cache_marks();
        assert_eq!(marks.len(), 1);
        assert!(!marks[0].cached);
        assert_eq!(marks[0].addr, VRAM_PADDR);
    }
}
