// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Machine-wide sender directory.
//!
//! The directory is a single memory-mapped file shared by every process in a
//! namespace: a fixed header followed by `max_senders` fixed-size slots. All
//! access happens under the registry lock (an in-process mutex plus an
//! exclusive `flock` on the file), so a record's geometry and share handle
//! are always read and written together.
//!
//! ```text
//! header (32 bytes)
//!   0  magic         u32   "TXLR"
//!   4  version       u32
//!   8  max_senders   u32
//!  12  active        u32   slot index + 1, 0 = none
//! slot (288 bytes) x max_senders
//!   0  in_use        u32
//!   4  name_len      u32
//!   8  width         u32
//!  12  height        u32
//!  16  format        u32   DXGI code
//!  24  share_handle  u64   0 = none
//!  32  name          [u8; 256]
//! ```

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::{Mutex, MutexGuard};

use crate::file_lock;
use crate::gpu::{ShareHandle, TextureFormat};
use crate::namespace::SharedNamespace;
use crate::{Result, TexlinkError};

/// Longest sender name in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Slot count for a newly created directory.
pub const DEFAULT_MAX_SENDERS: usize = 10;

const REGISTRY_MAGIC: u32 = 0x524C_5854;
const REGISTRY_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;
const SLOT_SIZE: usize = 288;
const NAME_OFFSET: usize = 32;

const H_MAGIC: usize = 0;
const H_VERSION: usize = 4;
const H_MAX: usize = 8;
const H_ACTIVE: usize = 12;

const S_IN_USE: usize = 0;
const S_NAME_LEN: usize = 4;
const S_WIDTH: usize = 8;
const S_HEIGHT: usize = 12;
const S_FORMAT: usize = 16;
const S_HANDLE: usize = 24;

/// One published sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderRecord {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub share_handle: Option<ShareHandle>,
}

impl SenderRecord {
    pub fn new(
        name: impl Into<String>,
        width: u32,
        height: u32,
        format: TextureFormat,
        share_handle: Option<ShareHandle>,
    ) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            format,
            share_handle,
        }
    }
}

/// Reject names the slot table cannot hold.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TexlinkError::InvalidName("name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TexlinkError::InvalidName(format!(
            "{} bytes exceeds the {} byte limit",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

struct RegistryInner {
    namespace: SharedNamespace,
    path: PathBuf,
    file: File,
    map: Mutex<MmapMut>,
    max_senders: usize,
}

/// Handle to the sender directory. Cheap to clone; clones share one mapping.
#[derive(Clone)]
pub struct NameRegistry {
    inner: Arc<RegistryInner>,
}

/// Slot table access while the registry lock is held.
struct SlotTable<'a> {
    map: MutexGuard<'a, MmapMut>,
    file: &'a File,
    max_senders: usize,
}

impl Drop for SlotTable<'_> {
    fn drop(&mut self) {
        if let Err(e) = file_lock::unlock(self.file) {
            tracing::warn!("NameRegistry: failed to unlock: {}", e);
        }
    }
}

impl SlotTable<'_> {
    fn slot(&self, index: usize) -> &[u8] {
        let start = HEADER_SIZE + index * SLOT_SIZE;
        &self.map[start..start + SLOT_SIZE]
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let start = HEADER_SIZE + index * SLOT_SIZE;
        &mut self.map[start..start + SLOT_SIZE]
    }

    fn in_use(&self, index: usize) -> bool {
        read_u32(self.slot(index), S_IN_USE) != 0
    }

    fn name(&self, index: usize) -> Option<String> {
        let slot = self.slot(index);
        if read_u32(slot, S_IN_USE) == 0 {
            return None;
        }
        let len = (read_u32(slot, S_NAME_LEN) as usize).min(MAX_NAME_LEN);
        Some(String::from_utf8_lossy(&slot[NAME_OFFSET..NAME_OFFSET + len]).into_owned())
    }

    fn find_slot(&self, name: &str) -> Option<usize> {
        (0..self.max_senders).find(|&i| self.name(i).as_deref() == Some(name))
    }

    fn record(&self, index: usize) -> Result<Option<SenderRecord>> {
        let Some(name) = self.name(index) else {
            return Ok(None);
        };
        let slot = self.slot(index);
        let format = TextureFormat::from_code(read_u32(slot, S_FORMAT)).map_err(|_| {
            TexlinkError::Corrupt(format!(
                "sender '{}' has format code {}",
                name,
                read_u32(slot, S_FORMAT)
            ))
        })?;
        Ok(Some(SenderRecord {
            width: read_u32(slot, S_WIDTH),
            height: read_u32(slot, S_HEIGHT),
            format,
            share_handle: ShareHandle::new(read_u64(slot, S_HANDLE)),
            name,
        }))
    }

    fn write_record(&mut self, index: usize, record: &SenderRecord) {
        let slot = self.slot_mut(index);
        let name = record.name.as_bytes();
        slot.fill(0);
        write_u32(slot, S_IN_USE, 1);
        write_u32(slot, S_NAME_LEN, name.len() as u32);
        write_u32(slot, S_WIDTH, record.width);
        write_u32(slot, S_HEIGHT, record.height);
        write_u32(slot, S_FORMAT, record.format.code());
        write_u64(slot, S_HANDLE, record.share_handle.map_or(0, |h| h.get()));
        slot[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name);
    }

    fn clear(&mut self, index: usize) {
        self.slot_mut(index).fill(0);
    }

    fn active_slot(&self) -> Option<usize> {
        let raw = read_u32(&self.map, H_ACTIVE) as usize;
        if raw == 0 || raw > self.max_senders || !self.in_use(raw - 1) {
            return None;
        }
        Some(raw - 1)
    }

    fn set_active_slot(&mut self, index: Option<usize>) {
        let raw = index.map_or(0, |i| i as u32 + 1);
        write_u32(&mut self.map, H_ACTIVE, raw);
    }

    /// Occupied slots ordered by name.
    fn sorted(&self) -> Vec<(String, usize)> {
        let mut names: Vec<(String, usize)> = (0..self.max_senders)
            .filter_map(|i| self.name(i).map(|n| (n, i)))
            .collect();
        names.sort();
        names
    }
}

impl NameRegistry {
    /// Open the namespace's directory, creating it with `max_senders` slots
    /// if it does not exist yet. An existing directory keeps its capacity.
    pub fn open(namespace: &SharedNamespace, max_senders: usize) -> Result<Self> {
        if max_senders == 0 {
            return Err(TexlinkError::InvalidArgument(
                "max_senders must be at least 1".to_string(),
            ));
        }
        namespace.ensure()?;
        let path = namespace.registry_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        file_lock::lock_exclusive(&file)?;
        let opened = Self::map_locked(&file, &path, max_senders);
        if let Err(e) = file_lock::unlock(&file) {
            tracing::warn!("NameRegistry: failed to unlock {}: {}", path.display(), e);
        }
        let (map, max_senders) = opened?;

        Ok(Self {
            inner: Arc::new(RegistryInner {
                namespace: namespace.clone(),
                path,
                file,
                map: Mutex::new(map),
                max_senders,
            }),
        })
    }

    fn map_locked(file: &File, path: &Path, max_senders: usize) -> Result<(MmapMut, usize)> {
        let len = file.metadata()?.len() as usize;

        if len == 0 {
            file.set_len((HEADER_SIZE + max_senders * SLOT_SIZE) as u64)?;
            // SAFETY: the file is sized for the header and slot table and is
            // only ever accessed through this module under the registry lock.
            let mut map = unsafe { MmapMut::map_mut(file)? };
            write_u32(&mut map, H_MAGIC, REGISTRY_MAGIC);
            write_u32(&mut map, H_VERSION, REGISTRY_VERSION);
            write_u32(&mut map, H_MAX, max_senders as u32);
            write_u32(&mut map, H_ACTIVE, 0);
            tracing::info!(
                "NameRegistry: created {} with {} slots",
                path.display(),
                max_senders
            );
            return Ok((map, max_senders));
        }

        if len < HEADER_SIZE {
            return Err(TexlinkError::Corrupt(format!(
                "{}: {} bytes is shorter than the header",
                path.display(),
                len
            )));
        }

        // SAFETY: as above; the length is validated against the header below.
        let map = unsafe { MmapMut::map_mut(file)? };
        if read_u32(&map, H_MAGIC) != REGISTRY_MAGIC {
            return Err(TexlinkError::Corrupt(format!("{}: bad magic", path.display())));
        }
        let version = read_u32(&map, H_VERSION);
        if version != REGISTRY_VERSION {
            return Err(TexlinkError::Corrupt(format!(
                "{}: unsupported layout version {}",
                path.display(),
                version
            )));
        }
        let existing = read_u32(&map, H_MAX) as usize;
        if existing == 0 || len < HEADER_SIZE + existing * SLOT_SIZE {
            return Err(TexlinkError::Corrupt(format!(
                "{}: {} slots do not fit in {} bytes",
                path.display(),
                existing,
                len
            )));
        }
        if existing != max_senders {
            tracing::debug!(
                "NameRegistry: using existing capacity {} (requested {})",
                existing,
                max_senders
            );
        }
        Ok((map, existing))
    }

    fn lock(&self) -> Result<SlotTable<'_>> {
        let map = self.inner.map.lock();
        file_lock::lock_exclusive(&self.inner.file)?;
        Ok(SlotTable {
            map,
            file: &self.inner.file,
            max_senders: self.inner.max_senders,
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Namespace the directory lives in.
    pub fn namespace(&self) -> &SharedNamespace {
        &self.inner.namespace
    }

    /// Slot capacity of the directory.
    pub fn max_senders(&self) -> usize {
        self.inner.max_senders
    }

    /// Insert or update a sender. A newly inserted sender becomes active.
    pub fn publish(&self, record: &SenderRecord) -> Result<()> {
        validate_name(&record.name)?;
        let mut table = self.lock()?;

        if let Some(index) = table.find_slot(&record.name) {
            table.write_record(index, record);
            tracing::trace!(
                "NameRegistry: updated '{}' {}x{} {}",
                record.name,
                record.width,
                record.height,
                record.format
            );
            return Ok(());
        }

        let Some(free) = (0..table.max_senders).find(|&i| !table.in_use(i)) else {
            return Err(TexlinkError::RegistryFull(table.max_senders));
        };
        table.write_record(free, record);
        table.set_active_slot(Some(free));
        tracing::debug!(
            "NameRegistry: published '{}' {}x{} {}",
            record.name,
            record.width,
            record.height,
            record.format
        );
        Ok(())
    }

    /// Remove a sender. Returns whether it was registered. When the active
    /// sender goes away, the first remaining name (in sorted order) takes over.
    pub fn unpublish(&self, name: &str) -> Result<bool> {
        let mut table = self.lock()?;
        let Some(index) = table.find_slot(name) else {
            return Ok(false);
        };

        let was_active = table.active_slot() == Some(index);
        table.clear(index);
        if was_active {
            let next = table.sorted().into_iter().next().map(|(_, i)| i);
            table.set_active_slot(next);
        }
        tracing::debug!("NameRegistry: unpublished '{}'", name);
        Ok(true)
    }

    /// Look up a sender by exact name. The empty name means the active sender.
    pub fn find(&self, name: &str) -> Result<Option<SenderRecord>> {
        let table = self.lock()?;
        let index = if name.is_empty() {
            table.active_slot()
        } else {
            table.find_slot(name)
        };
        match index {
            Some(i) => table.record(i),
            None => Ok(None),
        }
    }

    /// Registered names in sorted order.
    pub fn list(&self) -> Result<Vec<String>> {
        let table = self.lock()?;
        Ok(table.sorted().into_iter().map(|(n, _)| n).collect())
    }

    /// All records in name order.
    pub fn records(&self) -> Result<Vec<SenderRecord>> {
        let table = self.lock()?;
        let mut records = Vec::new();
        for (_, index) in table.sorted() {
            if let Some(record) = table.record(index)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<usize> {
        let table = self.lock()?;
        Ok((0..table.max_senders).filter(|&i| table.in_use(i)).count())
    }

    /// Name at `index` in [`list`](Self::list) order.
    pub fn name_at(&self, index: usize) -> Result<Option<String>> {
        Ok(self.list()?.into_iter().nth(index))
    }

    pub fn set_active(&self, name: &str) -> Result<()> {
        let mut table = self.lock()?;
        let Some(index) = table.find_slot(name) else {
            return Err(TexlinkError::NotFound(format!("sender '{}'", name)));
        };
        table.set_active_slot(Some(index));
        tracing::debug!("NameRegistry: active sender is now '{}'", name);
        Ok(())
    }

    /// Name of the active sender, if it is still registered.
    pub fn active(&self) -> Result<Option<String>> {
        let table = self.lock()?;
        Ok(table.active_slot().and_then(|i| table.name(i)))
    }
}

impl std::fmt::Debug for NameRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameRegistry")
            .field("path", &self.inner.path)
            .field("max_senders", &self.inner.max_senders)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max: usize) -> (tempfile::TempDir, NameRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = NameRegistry::open(&SharedNamespace::at(dir.path()), max).unwrap();
        (dir, registry)
    }

    fn record(name: &str, width: u32, height: u32) -> SenderRecord {
        SenderRecord::new(
            name,
            width,
            height,
            TextureFormat::Bgra8Unorm,
            ShareHandle::new(0xABCD),
        )
    }

    #[test]
    fn test_publish_then_find() {
        let (_dir, registry) = registry(4);
        let published = record("Demo", 640, 480);
        registry.publish(&published).unwrap();

        assert_eq!(registry.find("Demo").unwrap(), Some(published.clone()));
        assert_eq!(registry.find("").unwrap(), Some(published));
        assert_eq!(registry.find("Other").unwrap(), None);
    }

    #[test]
    fn test_publish_is_upsert() {
        let (_dir, registry) = registry(4);
        registry.publish(&record("Demo", 640, 480)).unwrap();
        registry.publish(&record("Demo", 1280, 720)).unwrap();

        assert_eq!(registry.count().unwrap(), 1);
        let found = registry.find("Demo").unwrap().unwrap();
        assert_eq!((found.width, found.height), (1280, 720));
    }

    #[test]
    fn test_list_is_sorted() {
        let (_dir, registry) = registry(4);
        for name in ["zeta", "alpha", "Mid"] {
            registry.publish(&record(name, 1, 1)).unwrap();
        }
        assert_eq!(registry.list().unwrap(), vec!["Mid", "alpha", "zeta"]);
        assert_eq!(registry.name_at(1).unwrap().as_deref(), Some("alpha"));
        assert_eq!(registry.name_at(3).unwrap(), None);
    }

    #[test]
    fn test_full_registry() {
        let (_dir, registry) = registry(2);
        registry.publish(&record("a", 1, 1)).unwrap();
        registry.publish(&record("b", 1, 1)).unwrap();
        assert!(matches!(
            registry.publish(&record("c", 1, 1)),
            Err(TexlinkError::RegistryFull(2))
        ));
        // Updating an existing name still works when full.
        registry.publish(&record("a", 2, 2)).unwrap();
    }

    #[test]
    fn test_name_bounds() {
        let (_dir, registry) = registry(2);
        assert!(matches!(
            registry.publish(&record("", 1, 1)),
            Err(TexlinkError::InvalidName(_))
        ));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            registry.publish(&record(&long, 1, 1)),
            Err(TexlinkError::InvalidName(_))
        ));
        let longest = "y".repeat(MAX_NAME_LEN);
        registry.publish(&record(&longest, 1, 1)).unwrap();
        assert!(registry.find(&longest).unwrap().is_some());
    }

    #[test]
    fn test_newest_sender_is_active() {
        let (_dir, registry) = registry(4);
        registry.publish(&record("first", 1, 1)).unwrap();
        registry.publish(&record("second", 1, 1)).unwrap();
        assert_eq!(registry.active().unwrap().as_deref(), Some("second"));

        registry.set_active("first").unwrap();
        assert_eq!(registry.active().unwrap().as_deref(), Some("first"));
        assert!(matches!(
            registry.set_active("missing"),
            Err(TexlinkError::NotFound(_))
        ));
    }

    #[test]
    fn test_unpublish_active_promotes_first_remaining() {
        let (_dir, registry) = registry(4);
        registry.publish(&record("c", 1, 1)).unwrap();
        registry.publish(&record("b", 1, 1)).unwrap();
        registry.publish(&record("a", 1, 1)).unwrap();
        assert_eq!(registry.active().unwrap().as_deref(), Some("a"));

        assert!(registry.unpublish("a").unwrap());
        assert_eq!(registry.active().unwrap().as_deref(), Some("b"));
        assert!(!registry.unpublish("a").unwrap());

        registry.unpublish("b").unwrap();
        registry.unpublish("c").unwrap();
        assert_eq!(registry.active().unwrap(), None);
        assert_eq!(registry.find("").unwrap(), None);
    }

    #[test]
    fn test_independent_opens_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let ns = SharedNamespace::at(dir.path());
        let a = NameRegistry::open(&ns, 4).unwrap();
        let b = NameRegistry::open(&ns, 16).unwrap();

        assert_eq!(b.max_senders(), 4);
        a.publish(&record("Shared", 320, 240)).unwrap();
        assert_eq!(b.find("Shared").unwrap().unwrap().width, 320);
        b.unpublish("Shared").unwrap();
        assert_eq!(a.count().unwrap(), 0);
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ns = SharedNamespace::at(dir.path());
        ns.ensure().unwrap();
        std::fs::write(ns.registry_path(), vec![0xFFu8; 4096]).unwrap();
        assert!(matches!(
            NameRegistry::open(&ns, 4),
            Err(TexlinkError::Corrupt(_))
        ));
    }
}
