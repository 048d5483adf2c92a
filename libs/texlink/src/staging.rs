// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! CPU pixel path: channel swizzle, vertical flip, nearest-neighbour
//! resampling between mapped staging textures and caller buffers.

use crate::gpu::{MappedTexture, TextureFormat};
use crate::{Result, TexlinkError};

/// Byte order of a caller pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelLayout {
    #[default]
    Rgba,
    Bgra,
    Rgb,
    Bgr,
}

impl PixelLayout {
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgba | Self::Bgra => 4,
            Self::Rgb | Self::Bgr => 3,
        }
    }

    /// Bytes a tightly packed `width` x `height` image needs.
    pub fn buffer_len(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

impl std::str::FromStr for PixelLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rgba" => Ok(Self::Rgba),
            "bgra" => Ok(Self::Bgra),
            "rgb" => Ok(Self::Rgb),
            "bgr" => Ok(Self::Bgr),
            _ => Err(format!("Unknown pixel layout '{}'. Valid values: rgba, bgra, rgb, bgr", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channels {
    Rgba,
    Bgra,
    /// BGRA whose alpha byte is undefined.
    Bgrx,
    Rgb,
    Bgr,
}

impl Channels {
    const fn stride(&self) -> usize {
        match self {
            Self::Rgba | Self::Bgra | Self::Bgrx => 4,
            Self::Rgb | Self::Bgr => 3,
        }
    }

    #[inline]
    fn read(&self, px: &[u8]) -> [u8; 4] {
        match self {
            Self::Rgba => [px[0], px[1], px[2], px[3]],
            Self::Bgra => [px[2], px[1], px[0], px[3]],
            Self::Bgrx => [px[2], px[1], px[0], 255],
            Self::Rgb => [px[0], px[1], px[2], 255],
            Self::Bgr => [px[2], px[1], px[0], 255],
        }
    }
}

impl From<PixelLayout> for Channels {
    fn from(layout: PixelLayout) -> Self {
        match layout {
            PixelLayout::Rgba => Self::Rgba,
            PixelLayout::Bgra => Self::Bgra,
            PixelLayout::Rgb => Self::Rgb,
            PixelLayout::Bgr => Self::Bgr,
        }
    }
}

#[inline]
fn write(layout: PixelLayout, out: &mut [u8], [r, g, b, a]: [u8; 4]) {
    match layout {
        PixelLayout::Rgba => out.copy_from_slice(&[r, g, b, a]),
        PixelLayout::Bgra => out.copy_from_slice(&[b, g, r, a]),
        PixelLayout::Rgb => out.copy_from_slice(&[r, g, b]),
        PixelLayout::Bgr => out.copy_from_slice(&[b, g, r]),
    }
}

/// Borrowed source image for [`convert_pixels`].
#[derive(Debug, Clone, Copy)]
pub struct PixelSource<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    row_pitch: usize,
    channels: Channels,
}

impl<'a> PixelSource<'a> {
    /// Texel rows of an 8-bit-per-channel texture format.
    pub fn from_texture_data(
        data: &'a [u8],
        format: TextureFormat,
        width: u32,
        height: u32,
        row_pitch: usize,
    ) -> Result<Self> {
        let channels = match format {
            TextureFormat::Rgba8Unorm => Channels::Rgba,
            TextureFormat::Bgra8Unorm => Channels::Bgra,
            TextureFormat::Bgrx8Unorm => Channels::Bgrx,
            other => {
                return Err(TexlinkError::UnsupportedTexture(format!(
                    "{} is not convertible on the pixel path",
                    other
                )));
            }
        };
        Self::checked(data, width, height, row_pitch, channels)
    }

    /// Mapped staging texture.
    pub fn from_mapped(mapped: &'a MappedTexture<'_>) -> Result<Self> {
        Self::from_texture_data(
            mapped.data(),
            mapped.format(),
            mapped.width(),
            mapped.height(),
            mapped.row_pitch(),
        )
    }

    /// Tightly packed caller buffer.
    pub fn from_layout(data: &'a [u8], layout: PixelLayout, width: u32, height: u32) -> Result<Self> {
        Self::checked(
            data,
            width,
            height,
            width as usize * layout.bytes_per_pixel(),
            layout.into(),
        )
    }

    fn checked(
        data: &'a [u8],
        width: u32,
        height: u32,
        row_pitch: usize,
        channels: Channels,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(TexlinkError::InvalidArgument(format!(
                "empty source image {}x{}",
                width, height
            )));
        }
        let row_bytes = width as usize * channels.stride();
        if row_pitch < row_bytes {
            return Err(TexlinkError::InvalidArgument(format!(
                "row pitch {} is shorter than a {} byte row",
                row_pitch, row_bytes
            )));
        }
        let needed = row_pitch * (height as usize - 1) + row_bytes;
        if data.len() < needed {
            return Err(TexlinkError::InvalidArgument(format!(
                "source {}x{} needs {} bytes, got {}",
                width,
                height,
                needed,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            row_pitch,
            channels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Convert `src` into `dst` as a tightly packed `dst_width` x `dst_height`
/// image in `layout`. Sizes that differ are resampled nearest-neighbour;
/// `invert` flips rows top to bottom.
pub fn convert_pixels(
    src: &PixelSource<'_>,
    dst: &mut [u8],
    layout: PixelLayout,
    dst_width: u32,
    dst_height: u32,
    invert: bool,
) -> Result<()> {
    if dst_width == 0 || dst_height == 0 {
        return Err(TexlinkError::InvalidArgument(format!(
            "empty destination {}x{}",
            dst_width, dst_height
        )));
    }
    let out_bpp = layout.bytes_per_pixel();
    let out_row = dst_width as usize * out_bpp;
    let needed = out_row * dst_height as usize;
    if dst.len() < needed {
        return Err(TexlinkError::InvalidArgument(format!(
            "destination {}x{} {:?} needs {} bytes, got {}",
            dst_width,
            dst_height,
            layout,
            needed,
            dst.len()
        )));
    }

    let in_bpp = src.channels.stride();
    let same_size = src.width == dst_width && src.height == dst_height;
    let same_order = Channels::from(layout) == src.channels;

    for (y, out) in dst[..needed].chunks_exact_mut(out_row).enumerate() {
        let mut sy = if same_size {
            y
        } else {
            y * src.height as usize / dst_height as usize
        };
        if invert {
            sy = src.height as usize - 1 - sy;
        }
        let row = &src.data[sy * src.row_pitch..sy * src.row_pitch + src.width as usize * in_bpp];

        if same_size && same_order {
            out.copy_from_slice(row);
            continue;
        }

        for (x, texel) in out.chunks_exact_mut(out_bpp).enumerate() {
            let sx = if same_size {
                x
            } else {
                x * src.width as usize / dst_width as usize
            };
            write(layout, texel, src.channels.read(&row[sx * in_bpp..sx * in_bpp + in_bpp]));
        }
    }
    Ok(())
}
