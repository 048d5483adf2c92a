// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use texlink::{Config, ConfigStore, GpuDevice, NameRegistry, SharedNamespace};

pub mod config;
pub mod receive;
pub mod send;
pub mod senders;

/// Namespace and config location shared by every command.
pub struct Context {
    pub namespace: SharedNamespace,
    pub store: ConfigStore,
}

impl Context {
    pub fn new(shm_dir: Option<PathBuf>) -> Self {
        let namespace = match shm_dir {
            Some(dir) => SharedNamespace::at(dir),
            None => SharedNamespace::resolve(),
        };
        Self {
            namespace,
            store: ConfigStore::default_location(),
        }
    }

    pub fn config(&self) -> Result<Config> {
        self.store
            .load()
            .with_context(|| format!("Failed to read {}", self.store.path().display()))
    }

    pub fn registry(&self) -> Result<NameRegistry> {
        let config = self.config()?;
        NameRegistry::open(&self.namespace, config.sharing.max_senders).with_context(|| {
            format!(
                "Failed to open sender directory in {}",
                self.namespace.root().display()
            )
        })
    }

    pub fn device(&self) -> Result<GpuDevice> {
        let config = self.config()?;
        GpuDevice::with_adapter(self.namespace.clone(), config.sharing.adapter)
            .context("Failed to create device")
    }
}
