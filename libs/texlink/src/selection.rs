// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Out-of-band sender selection, polled by receivers once per receive call.

use crate::config::ConfigStore;
use crate::registry::NameRegistry;
use crate::Result;

/// Source of "switch to this sender" requests made outside the receiver.
pub trait SenderSelector {
    /// A newly selected sender name, reported once per selection.
    fn poll_selection(&mut self) -> Option<String>;
}

impl<F> SenderSelector for F
where
    F: FnMut() -> Option<String>,
{
    fn poll_selection(&mut self) -> Option<String> {
        self()
    }
}

/// Selection made through the `[selection]` config section, e.g. by
/// `texlink select <name>`.
///
/// Each selection bumps `serial`; a poller reports the name when the serial
/// differs from the one it last saw. Selections made before the poller was
/// created are not reported.
#[derive(Debug, Clone)]
pub struct PanelSelection {
    store: ConfigStore,
    last_serial: u64,
}

impl PanelSelection {
    pub fn new(store: ConfigStore) -> Self {
        let last_serial = match store.load() {
            Ok(config) => config.selection.serial,
            Err(e) => {
                tracing::warn!("PanelSelection: {}", e);
                0
            }
        };
        Self { store, last_serial }
    }

    /// Record a selection: make `name` the active sender and publish it to
    /// pollers. Returns the new serial.
    pub fn select(store: &ConfigStore, registry: &NameRegistry, name: &str) -> Result<u64> {
        registry.set_active(name)?;
        let config = store.update(|cfg| {
            cfg.selection.sender_name = name.to_string();
            cfg.selection.serial = cfg.selection.serial.wrapping_add(1);
        })?;
        tracing::info!(
            "PanelSelection: selected '{}' (serial {})",
            name,
            config.selection.serial
        );
        Ok(config.selection.serial)
    }
}

impl SenderSelector for PanelSelection {
    fn poll_selection(&mut self) -> Option<String> {
        let config = match self.store.load() {
            Ok(config) => config,
            Err(e) => {
                tracing::trace!("PanelSelection: {}", e);
                return None;
            }
        };
        if config.selection.serial == self.last_serial {
            return None;
        }
        self.last_serial = config.selection.serial;
        let name = config.selection.sender_name;
        if name.is_empty() { None } else { Some(name) }
    }
}
