// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! PICA GPU state: register file mirror, float formats, shader outputs and
//! texture unit decoding.

pub mod float;
pub mod regs;
pub mod shader;
pub mod texture;

pub use float::{Float16, Float20, Float24};
pub use regs::PicaRegs;
