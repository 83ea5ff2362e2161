// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Texture unit configuration as decoded from the texturing registers.

use citrus_common::PAddr;

/// Guest texture formats, in register encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TextureFormat {
    Rgba8 = 0,
    Rgb8 = 1,
    Rgb5A1 = 2,
    Rgb565 = 3,
    Rgba4 = 4,
    Ia8 = 5,
    Rg8 = 6,
    I8 = 7,
    A8 = 8,
    Ia4 = 9,
    I4 = 10,
    A4 = 11,
    Etc1 = 12,
    Etc1A4 = 13,
}

impl TextureFormat {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Rgba8),
            1 => Some(Self::Rgb8),
            2 => Some(Self::Rgb5A1),
            3 => Some(Self::Rgb565),
            4 => Some(Self::Rgba4),
            5 => Some(Self::Ia8),
            6 => Some(Self::Rg8),
            7 => Some(Self::I8),
            8 => Some(Self::A8),
            9 => Some(Self::Ia4),
            10 => Some(Self::I4),
            11 => Some(Self::A4),
            12 => Some(Self::Etc1),
            13 => Some(Self::Etc1A4),
            _ => None,
        }
    }

    /// Bits per pixel in guest memory.
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8 => 32,
            Self::Rgb8 => 24,
            Self::Rgb5A1 | Self::Rgb565 | Self::Rgba4 | Self::Ia8 | Self::Rg8 => 16,
            Self::I8 | Self::A8 | Self::Ia4 | Self::Etc1A4 => 8,
            Self::I4 | Self::A4 | Self::Etc1 => 4,
        }
    }
}

/// Decoded texture parameters for one texture unit.
#[derive(Debug, Clone, Copy)]
pub struct TextureInfo {
    pub physical_address: PAddr,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes; zero means "derive from width and format".
    pub stride: u32,
    pub format: TextureFormat,
}

impl TextureInfo {
    /// Derive the stride of a tightly packed texture.
    pub fn set_default_stride(&mut self) {
        self.stride = self.width * self.format.bits_per_pixel() / 8;
    }
}

/// A texture unit configuration paired with its mipmap range.
#[derive(Debug, Clone, Copy)]
pub struct FullTextureConfig {
    pub info: TextureInfo,
    pub max_level: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bpp() {
        assert_eq!(TextureFormat::Rgba8.bits_per_pixel(), 32);
        assert_eq!(TextureFormat::Rgb8.bits_per_pixel(), 24);
        assert_eq!(TextureFormat::I4.bits_per_pixel(), 4);
        assert_eq!(TextureFormat::Etc1A4.bits_per_pixel(), 8);
    }

    #[test]
    fn test_default_stride() {
        let mut info = TextureInfo {
            physical_address: 0x1800_0000,
            width: 64,
            height: 64,
            stride: 0,
            format: TextureFormat::Rgb565,
        };
        info.set_default_stride();
        assert_eq!(info.stride, 128);
    }
}
