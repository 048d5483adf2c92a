// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLockReadGuard};

use super::texture::{
    create_texture_file, open_texture_file, SharedRole, Storage, TextureInner,
};
use super::{ShareHandle, Texture, TextureDescriptor, TextureFormat, TextureUsage};
use crate::namespace::SharedNamespace;
use crate::{Result, TexlinkError};

/// Largest width or height a texture may have.
pub const MAX_TEXTURE_DIMENSION: u32 = 16384;

/// Row alignment for CPU-mappable staging textures.
const STAGING_ROW_ALIGNMENT: usize = 256;

/// Attempts at drawing an unused share handle before giving up.
const HANDLE_ATTEMPTS: usize = 8;

struct CopyCommand {
    src: Texture,
    dst: Texture,
}

struct DeviceInner {
    namespace: SharedNamespace,
    adapter: u32,
    pending: Mutex<Vec<CopyCommand>>,
    fence: AtomicU64,
    live: Arc<AtomicUsize>,
}

/// Device context with its own command queue.
///
/// Copies are recorded with [`copy`](Self::copy) and only take effect when
/// [`flush_and_wait`](Self::flush_and_wait) executes the queue. Textures
/// created here are independent of textures other devices open through a
/// [`ShareHandle`], even inside one process.
#[derive(Clone)]
pub struct GpuDevice {
    inner: Arc<DeviceInner>,
}

impl GpuDevice {
    /// Create a device on the default adapter.
    pub fn new(namespace: SharedNamespace) -> Result<Self> {
        Self::with_adapter(namespace, 0)
    }

    /// Create a device on a specific adapter. Shared textures only open on
    /// devices using the adapter they were created on.
    pub fn with_adapter(namespace: SharedNamespace, adapter: u32) -> Result<Self> {
        namespace.ensure().map_err(|e| {
            TexlinkError::Device(format!(
                "namespace {} unavailable: {}",
                namespace.root().display(),
                e
            ))
        })?;

        tracing::debug!(
            "GpuDevice: created on adapter {} ({})",
            adapter,
            namespace.root().display()
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                namespace,
                adapter,
                pending: Mutex::new(Vec::new()),
                fence: AtomicU64::new(0),
                live: Arc::new(AtomicUsize::new(0)),
            }),
        })
    }

    pub fn namespace(&self) -> &SharedNamespace {
        &self.inner.namespace
    }

    pub fn adapter(&self) -> u32 {
        self.inner.adapter
    }

    /// Fence value of the last completed flush.
    pub fn fence_value(&self) -> u64 {
        self.inner.fence.load(Ordering::Acquire)
    }

    /// Copies recorded but not yet executed.
    pub fn pending_copies(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Textures created or opened by this device that are still alive.
    pub fn live_textures(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    fn validate_dimensions(width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(TexlinkError::UnsupportedTexture(format!(
                "zero-sized texture {}x{}",
                width, height
            )));
        }
        if width > MAX_TEXTURE_DIMENSION || height > MAX_TEXTURE_DIMENSION {
            return Err(TexlinkError::UnsupportedTexture(format!(
                "{}x{} exceeds the {} texel limit",
                width, height, MAX_TEXTURE_DIMENSION
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn wrap(
        &self,
        label: String,
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsage,
        row_pitch: usize,
        share_handle: Option<ShareHandle>,
        role: SharedRole,
        storage: Storage,
    ) -> Texture {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        Texture {
            inner: Arc::new(TextureInner {
                label,
                width,
                height,
                format,
                usage,
                row_pitch,
                share_handle,
                role,
                storage: parking_lot::RwLock::new(storage),
                live: Arc::clone(&self.inner.live),
            }),
        }
    }

    /// Create a device-local or staging texture. `TextureUsage::Shared`
    /// delegates to [`create_shared_texture`](Self::create_shared_texture).
    pub fn create_texture(&self, desc: &TextureDescriptor<'_>) -> Result<Texture> {
        Self::validate_dimensions(desc.width, desc.height)?;

        let tight = desc.width as usize * desc.format.bytes_per_pixel();
        let row_pitch = match desc.usage {
            TextureUsage::Shared => {
                let (texture, _) =
                    self.create_shared_texture(desc.width, desc.height, desc.format)?;
                return Ok(texture);
            }
            TextureUsage::Default => tight,
            TextureUsage::Staging => tight.div_ceil(STAGING_ROW_ALIGNMENT) * STAGING_ROW_ALIGNMENT,
        };

        let label = desc
            .label
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{:?}", desc.usage).to_lowercase());

        Ok(self.wrap(
            label,
            desc.width,
            desc.height,
            desc.format,
            desc.usage,
            row_pitch,
            None,
            SharedRole::Local,
            Storage::Heap(vec![0u8; row_pitch * desc.height as usize]),
        ))
    }

    /// Create a texture other devices can open by handle. This device owns
    /// the memory: dropping the last reference removes it from the namespace.
    pub fn create_shared_texture(
        &self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<(Texture, ShareHandle)> {
        Self::validate_dimensions(width, height)?;

        for _ in 0..HANDLE_ATTEMPTS {
            let handle = ShareHandle::generate();
            let path = self.inner.namespace.texture_path(handle);
            let map = match create_texture_file(&path, width, height, format, self.inner.adapter) {
                Ok(map) => map,
                Err(TexlinkError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    continue;
                }
                Err(e) => return Err(e),
            };

            tracing::debug!(
                "GpuDevice: created shared texture {} {}x{} {}",
                handle,
                width,
                height,
                format
            );

            let texture = self.wrap(
                format!("shared {}", handle),
                width,
                height,
                format,
                TextureUsage::Shared,
                width as usize * format.bytes_per_pixel(),
                Some(handle),
                SharedRole::Owner { path },
                Storage::Mapped(map),
            );
            return Ok((texture, handle));
        }

        Err(TexlinkError::Device(
            "could not allocate an unused share handle".to_string(),
        ))
    }

    /// Open a texture created by another device. The returned view never
    /// owns the memory.
    pub fn open_shared_texture(&self, handle: ShareHandle) -> Result<Texture> {
        let path = self.inner.namespace.texture_path(handle);
        let (map, info) = open_texture_file(&path, self.inner.adapter)?;

        tracing::trace!(
            "GpuDevice: opened shared texture {} {}x{} {}",
            handle,
            info.width,
            info.height,
            info.format
        );

        Ok(self.wrap(
            format!("opened {}", handle),
            info.width,
            info.height,
            info.format,
            TextureUsage::Shared,
            info.row_pitch,
            Some(handle),
            SharedRole::Opener,
            Storage::Mapped(map),
        ))
    }

    /// Record a full-resource copy. Sizes must match and formats must have
    /// the same texel size.
    pub fn copy(&self, src: &Texture, dst: &Texture) -> Result<()> {
        if src.same_resource(dst) {
            return Err(TexlinkError::IncompatibleCopy(
                "source and destination are the same texture".to_string(),
            ));
        }
        if src.width() != dst.width() || src.height() != dst.height() {
            return Err(TexlinkError::IncompatibleCopy(format!(
                "{}x{} -> {}x{}",
                src.width(),
                src.height(),
                dst.width(),
                dst.height()
            )));
        }
        if src.format().bytes_per_pixel() != dst.format().bytes_per_pixel() {
            return Err(TexlinkError::IncompatibleCopy(format!(
                "{} -> {}",
                src.format(),
                dst.format()
            )));
        }

        self.inner.pending.lock().push(CopyCommand {
            src: src.clone(),
            dst: dst.clone(),
        });
        Ok(())
    }

    /// Execute every recorded copy and wait for completion. Returns the new
    /// fence value.
    pub fn flush_and_wait(&self) -> u64 {
        let commands = std::mem::take(&mut *self.inner.pending.lock());
        let count = commands.len();
        for command in commands {
            execute_copy(&command.src, &command.dst);
        }
        let fence = self.inner.fence.fetch_add(1, Ordering::AcqRel) + 1;
        if count > 0 {
            tracing::trace!("GpuDevice: flushed {} copies, fence {}", count, fence);
        }
        fence
    }

    /// Upload tightly packed texels into a texture.
    pub fn update_texture(&self, texture: &Texture, data: &[u8]) -> Result<()> {
        let row_bytes = texture.width() as usize * texture.format().bytes_per_pixel();
        let needed = row_bytes * texture.height() as usize;
        if data.len() < needed {
            return Err(TexlinkError::InvalidArgument(format!(
                "update of {} needs {} bytes, got {}",
                texture.label(),
                needed,
                data.len()
            )));
        }

        // Earlier copies into this texture must land first.
        if self.pending_copies() > 0 {
            self.flush_and_wait();
        }

        let pitch = texture.row_pitch();
        let mut storage = texture.write_storage();
        let pixels = storage.pixels_mut();
        for (row, src) in data[..needed].chunks_exact(row_bytes).enumerate() {
            pixels[row * pitch..row * pitch + row_bytes].copy_from_slice(src);
        }
        Ok(())
    }

    /// Map a staging texture for reading. Outstanding copies are flushed
    /// first; the texture is unmapped when the returned value drops.
    pub fn map_read<'t>(&self, texture: &'t Texture) -> Result<MappedTexture<'t>> {
        if texture.usage() != TextureUsage::Staging {
            return Err(TexlinkError::NotMappable(format!(
                "{} has {:?} usage",
                texture.label(),
                texture.usage()
            )));
        }
        if self.pending_copies() > 0 {
            self.flush_and_wait();
        }
        Ok(MappedTexture {
            guard: texture.read_storage(),
            width: texture.width(),
            height: texture.height(),
            format: texture.format(),
            row_pitch: texture.row_pitch(),
        })
    }

    /// Drop a texture reference and return how many remain elsewhere.
    pub fn release_texture(&self, texture: Texture) -> usize {
        let remaining = Arc::strong_count(&texture.inner) - 1;
        drop(texture);
        remaining
    }

    /// Drop this device handle and return how many other handles remain.
    pub fn release(self) -> usize {
        let remaining = Arc::strong_count(&self.inner) - 1;
        let live = self.live_textures();
        if remaining == 0 && live > 0 {
            tracing::warn!("GpuDevice: released with {} live textures", live);
        }
        remaining
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("namespace", &self.inner.namespace.root())
            .field("adapter", &self.inner.adapter)
            .field("fence", &self.fence_value())
            .finish()
    }
}

fn execute_copy(src: &Texture, dst: &Texture) {
    // Lock in address order so concurrent opposite-direction copies between
    // the same pair cannot deadlock.
    let src_first = Arc::as_ptr(&src.inner) < Arc::as_ptr(&dst.inner);
    let (src_guard, mut dst_guard) = if src_first {
        let s = src.read_storage();
        let d = dst.write_storage();
        (s, d)
    } else {
        let d = dst.write_storage();
        let s = src.read_storage();
        (s, d)
    };

    let row_bytes = src.width() as usize * src.format().bytes_per_pixel();
    let src_pitch = src.row_pitch();
    let dst_pitch = dst.row_pitch();
    let src_pixels = src_guard.pixels();
    let dst_pixels = dst_guard.pixels_mut();

    if src_pitch == dst_pitch {
        let len = src_pitch * src.height() as usize;
        dst_pixels[..len].copy_from_slice(&src_pixels[..len]);
        return;
    }
    for row in 0..src.height() as usize {
        let s = row * src_pitch;
        let d = row * dst_pitch;
        dst_pixels[d..d + row_bytes].copy_from_slice(&src_pixels[s..s + row_bytes]);
    }
}

/// CPU view of a mapped staging texture.
pub struct MappedTexture<'t> {
    guard: RwLockReadGuard<'t, Storage>,
    width: u32,
    height: u32,
    format: TextureFormat,
    row_pitch: usize,
}

impl MappedTexture<'_> {
    /// Texel rows, `row_pitch` bytes apart.
    pub fn data(&self) -> &[u8] {
        self.guard.pixels()
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Tightly packed bytes of one row.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.row_pitch;
        let len = self.width as usize * self.format.bytes_per_pixel();
        &self.data()[start..start + len]
    }
}
