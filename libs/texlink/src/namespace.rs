// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Shared namespace: the directory every process resolves to find the sender
//! registry, the per-sender gates and frame counters, and shared textures.
//!
//! Resolution order:
//! 1. `TEXLINK_SHM_DIR` environment variable (explicit override)
//! 2. `/dev/shm/texlink` when `/dev/shm` exists (tmpfs, never hits disk)
//! 3. `$TMPDIR/texlink`
//!
//! ```text
//! /dev/shm/texlink/
//! ├── registry.map               # sender directory (header + slot table)
//! ├── gates/{sha256(name)}.lock  # per-sender access gate
//! ├── frames/{sha256(name)}.frame# per-sender frame counter
//! └── textures/{handle}.tex      # shared texture memory
//! ```

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::gpu::ShareHandle;
use crate::Result;

/// Root directory for all cross-process state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedNamespace {
    root: PathBuf,
}

impl SharedNamespace {
    /// Environment variable for the namespace override.
    pub const ENV_VAR: &'static str = "TEXLINK_SHM_DIR";

    /// Resolve the machine-wide namespace.
    pub fn resolve() -> Self {
        if let Ok(dir) = std::env::var(Self::ENV_VAR) {
            if !dir.is_empty() {
                return Self::at(dir);
            }
        }

        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            return Self::at(shm.join("texlink"));
        }

        Self::at(std::env::temp_dir().join("texlink"))
    }

    /// Use an explicit root directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and standard subdirectories.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(self.gates_dir())?;
        std::fs::create_dir_all(self.frames_dir())?;
        std::fs::create_dir_all(self.textures_dir())?;
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join("registry.map")
    }

    pub fn gates_dir(&self) -> PathBuf {
        self.root.join("gates")
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.root.join("frames")
    }

    pub fn textures_dir(&self) -> PathBuf {
        self.root.join("textures")
    }

    pub fn gate_path(&self, sender_name: &str) -> PathBuf {
        self.gates_dir()
            .join(format!("{}.lock", name_key(sender_name)))
    }

    pub fn frame_path(&self, sender_name: &str) -> PathBuf {
        self.frames_dir()
            .join(format!("{}.frame", name_key(sender_name)))
    }

    pub fn texture_path(&self, handle: ShareHandle) -> PathBuf {
        self.textures_dir().join(format!("{:016x}.tex", handle.get()))
    }
}

impl Default for SharedNamespace {
    fn default() -> Self {
        Self::resolve()
    }
}

/// File stem for a sender name. Names are arbitrary UTF-8 (spaces, slashes),
/// so they are hashed rather than used verbatim.
pub fn name_key(sender_name: &str) -> String {
    let digest = Sha256::digest(sender_name.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
