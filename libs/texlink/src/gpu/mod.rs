// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device binding: textures, shared textures and the copy queue.

mod device;
mod format;
mod texture;

pub use device::{GpuDevice, MappedTexture, MAX_TEXTURE_DIMENSION};
pub use format::{ShareHandle, TextureFormat};
pub use texture::{Texture, TextureDescriptor, TextureUsage};
