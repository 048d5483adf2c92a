// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::MmapMut;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{ShareHandle, TextureFormat};
use crate::{Result, TexlinkError};

/// Shared texture file magic ("TXLT").
pub(crate) const TEXTURE_MAGIC: u32 = 0x544C_5854;
pub(crate) const TEXTURE_VERSION: u32 = 1;
/// Header: magic, version, width, height, format, adapter, row_pitch, reserved.
pub(crate) const TEXTURE_HEADER_SIZE: usize = 32;

const HDR_MAGIC: usize = 0;
const HDR_VERSION: usize = 1;
const HDR_WIDTH: usize = 2;
const HDR_HEIGHT: usize = 3;
const HDR_FORMAT: usize = 4;
const HDR_ADAPTER: usize = 5;
const HDR_ROW_PITCH: usize = 6;

/// How a texture may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureUsage {
    /// Device-local, copy source/destination.
    #[default]
    Default,
    /// Backed by namespace memory and reachable through a [`ShareHandle`].
    Shared,
    /// CPU readable copy destination.
    Staging,
}

/// Parameters for [`GpuDevice::create_texture`](super::GpuDevice::create_texture).
#[derive(Debug, Clone)]
pub struct TextureDescriptor<'a> {
    pub label: Option<&'a str>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl<'a> TextureDescriptor<'a> {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: None,
            width,
            height,
            format,
            usage: TextureUsage::Default,
        }
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_label(mut self, label: &'a str) -> Self {
        self.label = Some(label);
        self
    }
}

/// Backing memory of a texture.
pub(crate) enum Storage {
    Heap(Vec<u8>),
    /// Whole texture file including the header.
    Mapped(MmapMut),
}

impl Storage {
    pub(crate) fn pixels(&self) -> &[u8] {
        match self {
            Self::Heap(bytes) => bytes,
            Self::Mapped(map) => &map[TEXTURE_HEADER_SIZE..],
        }
    }

    pub(crate) fn pixels_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(bytes) => bytes,
            Self::Mapped(map) => &mut map[TEXTURE_HEADER_SIZE..],
        }
    }
}

/// Relationship of this texture object to shared memory.
pub(crate) enum SharedRole {
    Local,
    /// Created the file; unlinks it when the last reference drops.
    Owner { path: PathBuf },
    /// Opened someone else's file; never destroys it.
    Opener,
}

pub(crate) struct TextureInner {
    pub(crate) label: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: TextureFormat,
    pub(crate) usage: TextureUsage,
    pub(crate) row_pitch: usize,
    pub(crate) share_handle: Option<ShareHandle>,
    pub(crate) role: SharedRole,
    pub(crate) storage: RwLock<Storage>,
    pub(crate) live: Arc<AtomicUsize>,
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        if let SharedRole::Owner { path } = &self.role {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    tracing::trace!("Texture '{}': unlinked {}", self.label, path.display());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        "Texture '{}': failed to unlink {}: {}",
                        self.label,
                        path.display(),
                        e
                    );
                }
            }
        }
    }
}

/// Reference-counted texture handle. Clones refer to the same resource.
#[derive(Clone)]
pub struct Texture {
    pub(crate) inner: Arc<TextureInner>,
}

impl Texture {
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> TextureFormat {
        self.inner.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.inner.usage
    }

    /// Bytes between the starts of consecutive rows.
    pub fn row_pitch(&self) -> usize {
        self.inner.row_pitch
    }

    /// Handle other processes use to open this texture, if it is shared.
    pub fn share_handle(&self) -> Option<ShareHandle> {
        self.inner.share_handle
    }

    pub fn is_shared(&self) -> bool {
        self.inner.share_handle.is_some()
    }

    /// True for the process that created the shared memory.
    pub fn is_shared_owner(&self) -> bool {
        matches!(self.inner.role, SharedRole::Owner { .. })
    }

    /// Live references to this texture object, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles name the same texture object.
    pub fn same_resource(&self, other: &Texture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn read_storage(&self) -> RwLockReadGuard<'_, Storage> {
        self.inner.storage.read()
    }

    pub(crate) fn write_storage(&self) -> RwLockWriteGuard<'_, Storage> {
        self.inner.storage.write()
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("label", &self.inner.label)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("format", &self.inner.format)
            .field("usage", &self.inner.usage)
            .field("share_handle", &self.inner.share_handle)
            .finish()
    }
}

fn put_u32(header: &mut [u8], field: usize, value: u32) {
    header[field * 4..field * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(header: &[u8], field: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&header[field * 4..field * 4 + 4]);
    u32::from_le_bytes(raw)
}

/// Geometry read back from a shared texture file header.
pub(crate) struct SharedFileInfo {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: TextureFormat,
    pub(crate) row_pitch: usize,
}

/// Create a new texture file and map it. Fails if the path already exists.
pub(crate) fn create_texture_file(
    path: &Path,
    width: u32,
    height: u32,
    format: TextureFormat,
    adapter: u32,
) -> Result<MmapMut> {
    let row_pitch = width as usize * format.bytes_per_pixel();
    let len = TEXTURE_HEADER_SIZE + row_pitch * height as usize;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(len as u64)?;

    // SAFETY: the file was just created with the mapped length; every mapping
    // of it goes through this module and honours the header layout.
    let mut map = unsafe { MmapMut::map_mut(&file)? };
    let header = &mut map[..TEXTURE_HEADER_SIZE];
    put_u32(header, HDR_MAGIC, TEXTURE_MAGIC);
    put_u32(header, HDR_VERSION, TEXTURE_VERSION);
    put_u32(header, HDR_WIDTH, width);
    put_u32(header, HDR_HEIGHT, height);
    put_u32(header, HDR_FORMAT, format.code());
    put_u32(header, HDR_ADAPTER, adapter);
    put_u32(header, HDR_ROW_PITCH, row_pitch as u32);
    Ok(map)
}

/// Map an existing texture file and validate its header.
pub(crate) fn open_texture_file(path: &Path, adapter: u32) -> Result<(MmapMut, SharedFileInfo)> {
    let file: File = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| TexlinkError::SharedHandle(format!("{}: {}", path.display(), e)))?;
    let len = file.metadata()?.len() as usize;
    if len < TEXTURE_HEADER_SIZE {
        return Err(TexlinkError::SharedHandle(format!(
            "{}: truncated header ({} bytes)",
            path.display(),
            len
        )));
    }

    // SAFETY: see create_texture_file; the length was checked above and the
    // pixel extent is checked against the header before use.
    let map = unsafe { MmapMut::map_mut(&file)? };
    let header = &map[..TEXTURE_HEADER_SIZE];

    if get_u32(header, HDR_MAGIC) != TEXTURE_MAGIC {
        return Err(TexlinkError::SharedHandle(format!(
            "{}: bad magic",
            path.display()
        )));
    }
    let version = get_u32(header, HDR_VERSION);
    if version != TEXTURE_VERSION {
        return Err(TexlinkError::SharedHandle(format!(
            "{}: unsupported version {}",
            path.display(),
            version
        )));
    }
    let owner_adapter = get_u32(header, HDR_ADAPTER);
    if owner_adapter != adapter {
        return Err(TexlinkError::SharedHandle(format!(
            "{}: created on adapter {}, this device uses adapter {}",
            path.display(),
            owner_adapter,
            adapter
        )));
    }
    let format = TextureFormat::from_code(get_u32(header, HDR_FORMAT))
        .map_err(|e| TexlinkError::SharedHandle(format!("{}: {}", path.display(), e)))?;
    let width = get_u32(header, HDR_WIDTH);
    let height = get_u32(header, HDR_HEIGHT);
    let row_pitch = get_u32(header, HDR_ROW_PITCH) as usize;

    if row_pitch < width as usize * format.bytes_per_pixel()
        || len < TEXTURE_HEADER_SIZE + row_pitch * height as usize
    {
        return Err(TexlinkError::SharedHandle(format!(
            "{}: {}x{} {} does not fit in {} bytes",
            path.display(),
            width,
            height,
            format,
            len
        )));
    }

    Ok((
        map,
        SharedFileInfo {
            width,
            height,
            format,
            row_pitch,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_file_header_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tex");
        create_texture_file(&path, 16, 8, TextureFormat::Rgba8Unorm, 0).unwrap();

        let (map, info) = open_texture_file(&path, 0).unwrap();
        assert_eq!(info.width, 16);
        assert_eq!(info.height, 8);
        assert_eq!(info.format, TextureFormat::Rgba8Unorm);
        assert_eq!(info.row_pitch, 64);
        assert_eq!(map.len(), TEXTURE_HEADER_SIZE + 64 * 8);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tex");
        create_texture_file(&path, 4, 4, TextureFormat::Bgra8Unorm, 0).unwrap();
        assert!(create_texture_file(&path, 4, 4, TextureFormat::Bgra8Unorm, 0).is_err());
    }

    #[test]
    fn test_open_rejects_other_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tex");
        create_texture_file(&path, 4, 4, TextureFormat::Bgra8Unorm, 1).unwrap();
        assert!(matches!(
            open_texture_file(&path, 0),
            Err(TexlinkError::SharedHandle(_))
        ));
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tex");
        create_texture_file(&path, 32, 32, TextureFormat::Bgra8Unorm, 0).unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len((TEXTURE_HEADER_SIZE + 100) as u64).unwrap();
        drop(file);

        assert!(matches!(
            open_texture_file(&path, 0),
            Err(TexlinkError::SharedHandle(_))
        ));
    }

    #[test]
    fn test_open_missing_file_is_shared_handle_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            open_texture_file(&dir.path().join("nope.tex"), 0),
            Err(TexlinkError::SharedHandle(_))
        ));
    }
}
