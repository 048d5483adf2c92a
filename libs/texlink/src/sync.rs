// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-sender access gate and frame counter.
//!
//! The gate is an exclusive `flock` on `gates/<key>.lock`. The frame counter
//! lives in a small shared mapping, `frames/<key>.frame`:
//!
//! ```text
//!  0  magic    u32  "TXLF"
//!  4  version  u32
//!  8  enabled  u32  (atomic) frame counting on/off
//! 16  counter  u64  (atomic) frames sent
//! ```
//!
//! Every failure is fail closed: a primitive whose gate could not be opened
//! never grants access, and one without a counter never reports a new frame.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use memmap2::MmapMut;

use crate::file_lock;
use crate::namespace::SharedNamespace;

/// Gate acquisition attempts per `check_access`.
pub const GATE_ATTEMPTS: u32 = 4;
/// Pause between gate attempts.
pub const GATE_RETRY_INTERVAL: Duration = Duration::from_micros(250);

const FRAME_MAGIC: u32 = 0x464C_5854;
const FRAME_VERSION: u32 = 1;
const FRAME_FILE_SIZE: usize = 32;
const F_MAGIC: usize = 0;
const F_VERSION: usize = 4;
const F_ENABLED: usize = 8;
const F_COUNTER: usize = 16;

const FPS_SMOOTHING: f64 = 0.85;

/// Gate and frame counter for one sender name, as seen by one session.
pub struct SyncPrimitive {
    name: String,
    gate_path: PathBuf,
    frame_path: PathBuf,
    gate: Option<File>,
    held: bool,
    frames: Option<MmapMut>,
    attempts: u32,
    retry_interval: Duration,
    last_seen: u64,
    frame: u64,
    fps: f64,
    last_frame_at: Option<Instant>,
    last_hold_at: Option<Instant>,
}

impl SyncPrimitive {
    /// Open (creating if needed) the gate and frame counter for `name`.
    /// Used by the sender that owns them.
    pub fn open(namespace: &SharedNamespace, name: &str) -> Self {
        if let Err(e) = namespace.ensure() {
            tracing::warn!("SyncPrimitive '{}': namespace unavailable: {}", name, e);
        }
        Self::open_with(namespace, name, true)
    }

    /// Open the gate and frame counter of an existing sender without
    /// creating anything. Missing files leave the primitive closed.
    pub fn attach(namespace: &SharedNamespace, name: &str) -> Self {
        Self::open_with(namespace, name, false)
    }

    fn open_with(namespace: &SharedNamespace, name: &str, create: bool) -> Self {
        let gate_path = namespace.gate_path(name);
        let frame_path = namespace.frame_path(name);

        let gate = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&gate_path)
        {
            Ok(file) => Some(file),
            Err(e) if !create && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("SyncPrimitive '{}': no gate yet", name);
                None
            }
            Err(e) => {
                tracing::warn!(
                    "SyncPrimitive '{}': gate {} unavailable: {}",
                    name,
                    gate_path.display(),
                    e
                );
                None
            }
        };

        let frames = match open_frame_map(&frame_path, create) {
            Ok(map) => Some(map),
            Err(e) if !create && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("SyncPrimitive '{}': no frame counter yet", name);
                None
            }
            Err(e) => {
                tracing::warn!(
                    "SyncPrimitive '{}': frame counter {} unavailable: {}",
                    name,
                    frame_path.display(),
                    e
                );
                None
            }
        };

        Self {
            name: name.to_string(),
            gate_path,
            frame_path,
            gate,
            held: false,
            frames,
            attempts: GATE_ATTEMPTS,
            retry_interval: GATE_RETRY_INTERVAL,
            last_seen: 0,
            frame: 0,
            fps: 0.0,
            last_frame_at: None,
            last_hold_at: None,
        }
    }

    /// Override the gate retry policy.
    pub fn with_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether both the gate and the frame counter were opened.
    pub fn is_open(&self) -> bool {
        self.gate.is_some() && self.frames.is_some()
    }

    /// Whether this primitive currently holds the gate.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Try to take the gate, retrying briefly. Never blocks indefinitely.
    pub fn check_access(&mut self) -> bool {
        if self.held {
            return true;
        }
        let Some(gate) = self.gate.as_ref() else {
            return false;
        };

        for attempt in 0..self.attempts {
            match file_lock::try_lock_exclusive(gate) {
                Ok(true) => {
                    self.held = true;
                    return true;
                }
                Ok(false) => {
                    if attempt + 1 < self.attempts {
                        std::thread::sleep(self.retry_interval);
                    }
                }
                Err(e) => {
                    tracing::warn!("SyncPrimitive '{}': gate error: {}", self.name, e);
                    return false;
                }
            }
        }
        tracing::trace!("SyncPrimitive '{}': gate busy", self.name);
        false
    }

    /// Release the gate if held.
    pub fn allow_access(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Some(gate) = self.gate.as_ref() {
            if let Err(e) = file_lock::unlock(gate) {
                tracing::warn!("SyncPrimitive '{}': gate release failed: {}", self.name, e);
            }
        }
    }

    /// Take the gate for the lifetime of the returned guard.
    pub fn lock(&mut self) -> Option<AccessGuard<'_>> {
        if self.check_access() {
            Some(AccessGuard { sync: self })
        } else {
            None
        }
    }

    fn field_u32(&self, offset: usize) -> Option<&AtomicU32> {
        let map = self.frames.as_ref()?;
        // SAFETY: the map is FRAME_FILE_SIZE bytes, page aligned, and the
        // offset is 4-byte aligned. Other processes only touch it atomically.
        Some(unsafe { &*(map.as_ptr().add(offset) as *const AtomicU32) })
    }

    fn counter(&self) -> Option<&AtomicU64> {
        let map = self.frames.as_ref()?;
        // SAFETY: as field_u32; the counter offset is 8-byte aligned.
        Some(unsafe { &*(map.as_ptr().add(F_COUNTER) as *const AtomicU64) })
    }

    fn observe_frame(&mut self) {
        let now = Instant::now();
        if let Some(previous) = self.last_frame_at {
            let elapsed = now.duration_since(previous).as_secs_f64();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.fps = if self.fps == 0.0 {
                    instant
                } else {
                    FPS_SMOOTHING * self.fps + (1.0 - FPS_SMOOTHING) * instant
                };
            }
        }
        self.last_frame_at = Some(now);
    }

    /// Advance the shared counter. Call while holding the gate.
    pub fn set_new_frame(&mut self) -> bool {
        if !self.held {
            tracing::debug!("SyncPrimitive '{}': set_new_frame without the gate", self.name);
        }
        let Some(counter) = self.counter() else {
            return false;
        };
        let value = counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.frame = value;
        self.last_seen = value;
        self.observe_frame();
        tracing::trace!("SyncPrimitive '{}': frame {}", self.name, value);
        true
    }

    /// True once per observed counter advance. Several sender ticks between
    /// calls collapse into one. A counter that went backwards (sender
    /// restarted) resynchronises and counts as new.
    pub fn get_new_frame(&mut self) -> bool {
        if self.frames.is_none() {
            return false;
        }
        if !self.is_frame_count_enabled() {
            self.observe_frame();
            return true;
        }
        let Some(value) = self.counter().map(|c| c.load(Ordering::Acquire)) else {
            return false;
        };
        if value == self.last_seen {
            return false;
        }
        if value < self.last_seen {
            tracing::debug!(
                "SyncPrimitive '{}': counter went back {} -> {}",
                self.name,
                self.last_seen,
                value
            );
        }
        self.last_seen = value;
        self.frame = value;
        self.observe_frame();
        true
    }

    /// Current shared counter value without consuming it.
    pub fn counter_value(&self) -> u64 {
        self.counter().map_or(0, |c| c.load(Ordering::Acquire))
    }

    pub fn enable_frame_count(&self) {
        if let Some(flag) = self.field_u32(F_ENABLED) {
            flag.store(1, Ordering::Release);
        }
    }

    pub fn disable_frame_count(&self) {
        if let Some(flag) = self.field_u32(F_ENABLED) {
            flag.store(0, Ordering::Release);
        }
    }

    pub fn is_frame_count_enabled(&self) -> bool {
        self.field_u32(F_ENABLED)
            .is_some_and(|flag| flag.load(Ordering::Acquire) != 0)
    }

    /// Sleep so consecutive calls are at least `1 / target` seconds apart.
    pub fn hold_fps(&mut self, target: u32) {
        if target == 0 {
            return;
        }
        let period = Duration::from_secs_f64(1.0 / f64::from(target));
        if let Some(previous) = self.last_hold_at {
            let elapsed = previous.elapsed();
            if elapsed < period {
                std::thread::sleep(period - elapsed);
            }
        }
        self.last_hold_at = Some(Instant::now());
    }

    /// Last frame number seen or sent by this session.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Smoothed frames per second.
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Release the gate and drop the shared handles.
    pub fn close(&mut self) {
        self.allow_access();
        self.gate = None;
        self.frames = None;
    }

    /// Unlink the gate and counter files. Owner only; open handles elsewhere
    /// stay valid.
    pub fn remove_files(&self) {
        for path in [&self.gate_path, &self.frame_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        "SyncPrimitive '{}': failed to remove {}: {}",
                        self.name,
                        path.display(),
                        e
                    );
                }
            }
        }
    }
}

impl Drop for SyncPrimitive {
    fn drop(&mut self) {
        self.allow_access();
    }
}

impl std::fmt::Debug for SyncPrimitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPrimitive")
            .field("name", &self.name)
            .field("held", &self.held)
            .field("frame", &self.frame)
            .field("fps", &self.fps)
            .finish()
    }
}

/// Holds the gate; releases it on drop.
pub struct AccessGuard<'a> {
    sync: &'a mut SyncPrimitive,
}

impl std::ops::Deref for AccessGuard<'_> {
    type Target = SyncPrimitive;

    fn deref(&self) -> &SyncPrimitive {
        &*self.sync
    }
}

impl std::ops::DerefMut for AccessGuard<'_> {
    fn deref_mut(&mut self) -> &mut SyncPrimitive {
        &mut *self.sync
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.sync.allow_access();
    }
}

fn open_frame_map(path: &std::path::Path, create: bool) -> std::io::Result<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(path)?;

    // Serialise first-time initialisation between processes.
    file_lock::lock_exclusive(&file)?;
    let result = init_frame_map(&file);
    if let Err(e) = file_lock::unlock(&file) {
        tracing::warn!("SyncPrimitive: unlock of {} failed: {}", path.display(), e);
    }
    result
}

fn init_frame_map(file: &File) -> std::io::Result<MmapMut> {
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        file.set_len(FRAME_FILE_SIZE as u64)?;
    } else if len < FRAME_FILE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame counter is {} bytes", len),
        ));
    }

    // SAFETY: the file is at least FRAME_FILE_SIZE bytes and is only shared
    // through this module; mutable fields are accessed atomically.
    let mut map = unsafe { MmapMut::map_mut(file)? };

    let magic = u32::from_le_bytes([map[0], map[1], map[2], map[3]]);
    if len == 0 {
        map[F_MAGIC..F_MAGIC + 4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        map[F_VERSION..F_VERSION + 4].copy_from_slice(&FRAME_VERSION.to_le_bytes());
    } else if magic != FRAME_MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame counter has a bad magic",
        ));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace() -> (tempfile::TempDir, SharedNamespace) {
        let dir = tempfile::tempdir().unwrap();
        let ns = SharedNamespace::at(dir.path());
        (dir, ns)
    }

    #[test]
    fn test_gate_excludes_second_opener() {
        let (_dir, ns) = namespace();
        let mut a = SyncPrimitive::open(&ns, "Demo");
        let mut b = SyncPrimitive::open(&ns, "Demo").with_retry(2, Duration::from_micros(10));

        assert!(a.check_access());
        assert!(a.check_access());
        assert!(!b.check_access());
        a.allow_access();
        a.allow_access();
        assert!(b.check_access());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (_dir, ns) = namespace();
        let mut a = SyncPrimitive::open(&ns, "Demo");
        let mut b = SyncPrimitive::open(&ns, "Demo").with_retry(1, Duration::ZERO);
        {
            let mut guard = a.lock().unwrap();
            assert!(guard.set_new_frame());
        }
        assert!(!a.is_held());
        assert!(b.lock().is_some());
    }

    #[test]
    fn test_attach_never_creates_files() {
        let (_dir, ns) = namespace();
        let mut late = SyncPrimitive::attach(&ns, "Gone");

        assert!(!late.is_open());
        assert!(!late.check_access());
        assert!(!late.get_new_frame());
        assert!(!ns.gate_path("Gone").exists());
        assert!(!ns.frame_path("Gone").exists());
    }

    #[test]
    fn test_attach_shares_owner_state() {
        let (_dir, ns) = namespace();
        let mut owner = SyncPrimitive::open(&ns, "Demo");
        owner.enable_frame_count();
        assert!(owner.lock().is_some_and(|mut g| g.set_new_frame()));

        let mut reader = SyncPrimitive::attach(&ns, "Demo").with_retry(1, Duration::ZERO);
        assert!(reader.is_open());
        assert_eq!(reader.counter_value(), 1);
        assert!(owner.check_access());
        assert!(!reader.check_access());
    }

    #[test]
    fn test_new_frame_is_edge_triggered() {
        let (_dir, ns) = namespace();
        let mut sender = SyncPrimitive::open(&ns, "Demo");
        let mut receiver = SyncPrimitive::open(&ns, "Demo");
        sender.enable_frame_count();

        assert!(!receiver.get_new_frame());
        sender.set_new_frame();
        assert!(receiver.get_new_frame());
        assert!(!receiver.get_new_frame());

        sender.set_new_frame();
        sender.set_new_frame();
        sender.set_new_frame();
        assert!(receiver.get_new_frame());
        assert_eq!(receiver.frame(), 4);
        assert!(!receiver.get_new_frame());
    }

    #[test]
    fn test_counter_reset_resynchronises() {
        let (_dir, ns) = namespace();
        let mut sender = SyncPrimitive::open(&ns, "Demo");
        let mut receiver = SyncPrimitive::open(&ns, "Demo");
        sender.enable_frame_count();
        for _ in 0..5 {
            sender.set_new_frame();
        }
        assert!(receiver.get_new_frame());
        assert_eq!(receiver.frame(), 5);

        // Sender restarts with fresh files.
        sender.remove_files();
        drop(sender);
        let mut restarted = SyncPrimitive::open(&ns, "Demo");
        restarted.enable_frame_count();
        restarted.set_new_frame();

        let mut reopened = SyncPrimitive::open(&ns, "Demo");
        reopened.last_seen = receiver.last_seen;
        assert!(reopened.get_new_frame());
        assert_eq!(reopened.frame(), 1);
    }

    #[test]
    fn test_disabled_counting_always_new() {
        let (_dir, ns) = namespace();
        let sender = SyncPrimitive::open(&ns, "Demo");
        let mut receiver = SyncPrimitive::open(&ns, "Demo");
        sender.disable_frame_count();
        assert!(!receiver.is_frame_count_enabled());
        assert!(receiver.get_new_frame());
        assert!(receiver.get_new_frame());

        sender.enable_frame_count();
        assert!(receiver.is_frame_count_enabled());
        assert!(!receiver.get_new_frame());
    }

    #[test]
    fn test_fail_closed_without_gate() {
        let (_dir, ns) = namespace();
        let mut sync = SyncPrimitive::open(&ns, "Demo");
        sync.close();
        assert!(!sync.is_open());
        assert!(!sync.check_access());
        assert!(!sync.get_new_frame());
        assert!(!sync.set_new_frame());
    }

    #[test]
    fn test_remove_files() {
        let (_dir, ns) = namespace();
        let sync = SyncPrimitive::open(&ns, "Demo");
        assert!(ns.gate_path("Demo").exists());
        assert!(ns.frame_path("Demo").exists());
        sync.remove_files();
        assert!(!ns.gate_path("Demo").exists());
        assert!(!ns.frame_path("Demo").exists());
    }

    #[test]
    fn test_hold_fps_paces_calls() {
        let (_dir, ns) = namespace();
        let mut sync = SyncPrimitive::open(&ns, "Demo");
        let start = Instant::now();
        for _ in 0..4 {
            sync.hold_fps(100);
        }
        assert!(start.elapsed() >= Duration::from_millis(29));
    }

    #[test]
    fn test_fps_estimate_tracks_rate() {
        let (_dir, ns) = namespace();
        let mut sync = SyncPrimitive::open(&ns, "Demo");
        sync.enable_frame_count();
        for _ in 0..5 {
            sync.set_new_frame();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(sync.fps() > 0.0);
        assert!(sync.fps() < 200.0);
    }
}
