// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Global emulator settings, populated from a config INI.

use std::path::Path;

use ini::Ini;
use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(String),
}

/// Renderer backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererBackend {
    Vulkan,
    OpenGl,
    Null,
}

impl RendererBackend {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "0" | "opengl" => Self::OpenGl,
            "1" | "vulkan" => Self::Vulkan,
            "2" | "null" => Self::Null,
            _ => Self::Vulkan,
        }
    }
}

/// Global emulator settings.
#[derive(Debug, Clone)]
pub struct Settings {
    // Renderer
    pub renderer_backend: RendererBackend,
    pub vsync_enabled: bool,
    /// Integer upscale factor applied to render targets (1 = native).
    pub resolution_factor: u32,

    // Debug
    pub use_debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            renderer_backend: RendererBackend::Vulkan,
            vsync_enabled: true,
            resolution_factor: 1,
            use_debug_logging: false,
        }
    }
}

impl Settings {
    /// Load settings from an INI file. Missing keys keep their defaults.
    pub fn load_from_ini(path: &Path) -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        let conf = Ini::load_from_file(path).map_err(|e| SettingsError::Parse(e.to_string()))?;

        if let Some(section) = conf.section(Some("Renderer")) {
            if let Some(backend) = section.get("renderer_backend") {
                settings.renderer_backend = RendererBackend::from_str_or_default(backend);
                debug!("Renderer backend: {:?}", settings.renderer_backend);
            }
            if let Some(vsync) = section.get("use_vsync") {
                settings.vsync_enabled = vsync.trim() == "true" || vsync.trim() == "1";
            }
            if let Some(res) = section.get("resolution_factor") {
                settings.resolution_factor = res.trim().parse().unwrap_or_else(|_| {
                    warn!("Invalid resolution_factor '{}', using 1", res);
                    1
                });
            }
        }

        if let Some(section) = conf.section(Some("Debugging")) {
            if let Some(debug_log) = section.get("use_debug_logging") {
                settings.use_debug_logging =
                    debug_log.trim() == "true" || debug_log.trim() == "1";
            }
        }

        Ok(settings)
    }
}
