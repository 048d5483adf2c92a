// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Texture formats and share handles.
//!
//! Format values ARE the DXGI_FORMAT constants, so sender records written by
//! other tools keep their meaning and no translation table is needed.

use std::num::NonZeroU64;

use crate::{Result, TexlinkError};

/// Texture pixel formats that may cross the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum TextureFormat {
    /// 32-bit float RGBA. DXGI_FORMAT_R32G32B32A32_FLOAT
    Rgba32Float = 2,
    /// 16-bit float RGBA. DXGI_FORMAT_R16G16B16A16_FLOAT
    Rgba16Float = 10,
    /// 16-bit signed normalized RGBA. DXGI_FORMAT_R16G16B16A16_SNORM
    Rgba16Snorm = 13,
    /// 10-bit RGB + 2-bit alpha. DXGI_FORMAT_R10G10B10A2_UNORM
    Rgb10a2Unorm = 24,
    /// 8-bit RGBA. DXGI_FORMAT_R8G8B8A8_UNORM
    Rgba8Unorm = 28,
    /// 8-bit BGRA. DXGI_FORMAT_B8G8R8A8_UNORM
    #[default]
    Bgra8Unorm = 87,
    /// 8-bit BGR, alpha ignored. DXGI_FORMAT_B8G8R8X8_UNORM
    Bgrx8Unorm = 88,
}

impl TextureFormat {
    /// Raw DXGI code.
    #[inline]
    pub const fn code(&self) -> u32 {
        *self as u32
    }

    /// Parse a DXGI code. Zero means "unspecified" and resolves to the default.
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::default()),
            2 => Ok(Self::Rgba32Float),
            10 => Ok(Self::Rgba16Float),
            13 => Ok(Self::Rgba16Snorm),
            24 => Ok(Self::Rgb10a2Unorm),
            28 => Ok(Self::Rgba8Unorm),
            87 => Ok(Self::Bgra8Unorm),
            88 => Ok(Self::Bgrx8Unorm),
            other => Err(TexlinkError::UnsupportedTexture(format!(
                "unknown format code {}",
                other
            ))),
        }
    }

    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgba32Float => 16,
            Self::Rgba16Float | Self::Rgba16Snorm => 8,
            Self::Rgb10a2Unorm | Self::Rgba8Unorm | Self::Bgra8Unorm | Self::Bgrx8Unorm => 4,
        }
    }

    /// 32-bit 8-bit-per-channel formats that every consumer can open, including
    /// legacy ones. Wider formats are receiver-side only.
    pub const fn is_legacy_compatible(&self) -> bool {
        matches!(self, Self::Rgba8Unorm | Self::Bgra8Unorm | Self::Bgrx8Unorm)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rgba32Float => "rgba32float",
            Self::Rgba16Float => "rgba16float",
            Self::Rgba16Snorm => "rgba16snorm",
            Self::Rgb10a2Unorm => "rgb10a2unorm",
            Self::Rgba8Unorm => "rgba8unorm",
            Self::Bgra8Unorm => "bgra8unorm",
            Self::Bgrx8Unorm => "bgrx8unorm",
        }
    }
}

impl std::str::FromStr for TextureFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rgba32float" => Ok(Self::Rgba32Float),
            "rgba16float" => Ok(Self::Rgba16Float),
            "rgba16snorm" => Ok(Self::Rgba16Snorm),
            "rgb10a2unorm" => Ok(Self::Rgb10a2Unorm),
            "rgba8unorm" | "rgba" => Ok(Self::Rgba8Unorm),
            "bgra8unorm" | "bgra" => Ok(Self::Bgra8Unorm),
            "bgrx8unorm" | "bgrx" => Ok(Self::Bgrx8Unorm),
            _ => Err(format!(
                "Unknown format '{}'. Valid values: rgba, bgra, bgrx, rgba16float, rgba32float, rgba16snorm, rgb10a2unorm",
                s
            )),
        }
    }
}

impl std::fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque cross-process identifier of a shared texture. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShareHandle(NonZeroU64);

impl ShareHandle {
    /// Wrap a raw value; zero is the null handle.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }

    /// Draw a fresh random handle.
    pub(crate) fn generate() -> Self {
        loop {
            let (hi, lo) = uuid::Uuid::new_v4().as_u64_pair();
            if let Some(handle) = Self::new(hi ^ lo) {
                return handle;
            }
        }
    }
}

impl std::fmt::Display for ShareHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:016x}", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip_for_every_format() {
        for format in [
            TextureFormat::Rgba32Float,
            TextureFormat::Rgba16Float,
            TextureFormat::Rgba16Snorm,
            TextureFormat::Rgb10a2Unorm,
            TextureFormat::Rgba8Unorm,
            TextureFormat::Bgra8Unorm,
            TextureFormat::Bgrx8Unorm,
        ] {
            assert_eq!(TextureFormat::from_code(format.code()).unwrap(), format);
        }
    }

    #[test]
    fn test_zero_code_is_default_bgra() {
        assert_eq!(TextureFormat::from_code(0).unwrap(), TextureFormat::Bgra8Unorm);
        assert!(TextureFormat::from_code(71).is_err());
    }

    #[test]
    fn test_legacy_compatibility() {
        assert!(TextureFormat::Bgra8Unorm.is_legacy_compatible());
        assert!(TextureFormat::Rgba8Unorm.is_legacy_compatible());
        assert!(!TextureFormat::Rgba16Float.is_legacy_compatible());
        assert!(!TextureFormat::Rgb10a2Unorm.is_legacy_compatible());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("BGRA".parse::<TextureFormat>().unwrap(), TextureFormat::Bgra8Unorm);
        assert_eq!("rgba".parse::<TextureFormat>().unwrap(), TextureFormat::Rgba8Unorm);
        assert!("nv12".parse::<TextureFormat>().is_err());
    }

    #[test]
    fn test_share_handle_never_zero() {
        assert!(ShareHandle::new(0).is_none());
        for _ in 0..64 {
            assert_ne!(ShareHandle::generate().get(), 0);
        }
    }
}
