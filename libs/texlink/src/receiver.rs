// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Receiving side: discovers a sender by name, follows it across resizes and
//! restarts, and copies new frames into a local texture or a pixel buffer.
//!
//! Every receive call runs the same cycle:
//!
//! 1. poll the external selector, retargeting on a new selection
//! 2. look the sender up (connected name, else requested name, else active)
//! 3. reconnect from scratch when the name or size changed
//! 4. on a fresh connection, create the destination and return without
//!    copying so the caller can resize first ([`ReceiverSession::is_updated`])
//! 5. otherwise copy under the gate when the frame counter advanced
//!
//! No error leaves the session: failures log, drop back to disconnected and
//! the next call rediscovers.

use crate::gpu::{GpuDevice, ShareHandle, Texture, TextureDescriptor, TextureFormat, TextureUsage};
use crate::registry::{NameRegistry, SenderRecord};
use crate::selection::SenderSelector;
use crate::staging::{convert_pixels, PixelLayout, PixelSource};
use crate::sync::SyncPrimitive;
use crate::{Result, TexlinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Texture,
    Staging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    /// No sender, or the cycle failed and the session is disconnected.
    Disconnected,
    /// Connected during this call; nothing copied yet.
    Connected,
    /// Connected; `frame_new` says whether a frame was copied.
    Ready,
    /// Connected, but the sender's format has no CPU pixel layout.
    Unreadable,
}

pub struct ReceiverSession {
    registry: NameRegistry,
    adapter: u32,
    device: Option<GpuDevice>,
    requested_name: String,
    connected_name: String,
    width: u32,
    height: u32,
    format: TextureFormat,
    share_handle: Option<ShareHandle>,
    connected: bool,
    updated: bool,
    frame_new: bool,
    unreadable_warned: bool,
    sync: Option<SyncPrimitive>,
    opened: Option<Texture>,
    local: Option<Texture>,
    staging: Option<Texture>,
    selector: Option<Box<dyn SenderSelector + Send>>,
}

impl ReceiverSession {
    /// Receiver for the active sender on adapter 0.
    pub fn new(registry: NameRegistry) -> Self {
        Self {
            registry,
            adapter: 0,
            device: None,
            requested_name: String::new(),
            connected_name: String::new(),
            width: 0,
            height: 0,
            format: TextureFormat::default(),
            share_handle: None,
            connected: false,
            updated: false,
            frame_new: false,
            unreadable_warned: false,
            sync: None,
            opened: None,
            local: None,
            staging: None,
            selector: None,
        }
    }

    pub fn with_adapter(mut self, adapter: u32) -> Self {
        self.adapter = adapter;
        self
    }

    /// Use an existing device instead of creating one on first receive.
    pub fn with_device(mut self, device: GpuDevice) -> Self {
        self.adapter = device.adapter();
        self.device = Some(device);
        self
    }

    pub fn with_selector(mut self, selector: impl SenderSelector + Send + 'static) -> Self {
        self.set_selector(selector);
        self
    }

    /// Install the external selection source polled on every receive.
    pub fn set_selector(&mut self, selector: impl SenderSelector + Send + 'static) {
        self.selector = Some(Box::new(selector));
    }

    /// Target a specific sender; empty means the active sender. Changing
    /// the target drops the current connection.
    pub fn set_receiver_name(&mut self, name: &str) {
        if name == self.requested_name {
            return;
        }
        self.requested_name = name.to_string();
        if self.connected && self.connected_name != name {
            self.release();
        }
    }

    pub fn receiver_name(&self) -> &str {
        &self.requested_name
    }

    /// Receive into the session's own texture, see [`received_texture`](Self::received_texture).
    /// Returns whether a sender is connected.
    pub fn receive_texture(&mut self) -> bool {
        self.cycle(Destination::Texture) != Cycle::Disconnected
    }

    /// Receive into a caller buffer of `width` x `height` pixels in
    /// `layout`, resampling if the sender size differs. Returns whether a
    /// sender is connected; on the connecting call the buffer is untouched.
    pub fn receive_pixels(
        &mut self,
        buffer: &mut [u8],
        width: u32,
        height: u32,
        layout: PixelLayout,
        invert: bool,
    ) -> bool {
        match self.cycle(Destination::Staging) {
            Cycle::Disconnected => false,
            Cycle::Connected => true,
            Cycle::Unreadable => {
                if !std::mem::replace(&mut self.unreadable_warned, true) {
                    tracing::warn!(
                        "Receiver '{}': {} frames cannot be received as pixels",
                        self.connected_name,
                        self.format
                    );
                }
                false
            }
            Cycle::Ready => match self.read_pixels(buffer, width, height, layout, invert) {
                Ok(()) => true,
                Err(e @ (TexlinkError::InvalidArgument(_) | TexlinkError::UnsupportedTexture(_))) => {
                    tracing::warn!("Receiver: {}", e);
                    false
                }
                Err(e) => {
                    tracing::warn!("Receiver '{}': pixel read failed: {}", self.connected_name, e);
                    self.release();
                    false
                }
            },
        }
    }

    fn read_pixels(
        &self,
        buffer: &mut [u8],
        width: u32,
        height: u32,
        layout: PixelLayout,
        invert: bool,
    ) -> Result<()> {
        let (Some(device), Some(staging)) = (self.device.as_ref(), self.staging.as_ref()) else {
            return Err(TexlinkError::NotMappable("no staging texture".to_string()));
        };
        let mapped = device.map_read(staging)?;
        let source = PixelSource::from_mapped(&mapped)?;
        convert_pixels(&source, buffer, layout, width, height, invert)
    }

    fn ensure_device(&mut self) -> Option<GpuDevice> {
        if self.device.is_none() {
            match GpuDevice::with_adapter(self.registry.namespace().clone(), self.adapter) {
                Ok(device) => self.device = Some(device),
                Err(e) => {
                    tracing::error!("Receiver: device creation failed: {}", e);
                    return None;
                }
            }
        }
        self.device.clone()
    }

    fn cycle(&mut self, destination: Destination) -> Cycle {
        // 0. external override
        let selected = self.selector.as_mut().and_then(|s| s.poll_selection());
        if let Some(name) = selected {
            tracing::debug!("Receiver: external selection '{}'", name);
            self.release();
            self.requested_name = name;
        }

        // 1. lazily create the device once
        let Some(device) = self.ensure_device() else {
            return Cycle::Disconnected;
        };

        // 2. discovery
        let lookup = if self.connected {
            self.connected_name.clone()
        } else {
            self.requested_name.clone()
        };
        let record = match self.registry.find(&lookup) {
            Ok(Some(record)) => record,
            Ok(None) => {
                if self.connected {
                    tracing::info!("Receiver: sender '{}' closed", self.connected_name);
                }
                self.release();
                return Cycle::Disconnected;
            }
            Err(e) => {
                tracing::warn!("Receiver: registry lookup failed: {}", e);
                self.release();
                return Cycle::Disconnected;
            }
        };

        // 3. identity and geometry
        if self.connected {
            if record.name != self.connected_name
                || record.width != self.width
                || record.height != self.height
            {
                tracing::debug!(
                    "Receiver: sender changed '{}' {}x{} -> '{}' {}x{}",
                    self.connected_name,
                    self.width,
                    self.height,
                    record.name,
                    record.width,
                    record.height
                );
                self.release();
                self.requested_name.clear();
            } else if record.share_handle != self.share_handle || record.format != self.format {
                self.accept_in_place(&record);
            }
        }

        // 4. fresh connection
        if !self.connected {
            return match self.connect(&device, &record, destination) {
                Ok(()) => Cycle::Connected,
                Err(e) => {
                    tracing::warn!("Receiver: connecting to '{}' failed: {}", record.name, e);
                    self.release();
                    Cycle::Disconnected
                }
            };
        }

        // 5. copy a new frame
        if destination == Destination::Staging && !self.format.is_legacy_compatible() {
            self.frame_new = false;
            return Cycle::Unreadable;
        }
        match self.copy_frame(&device, destination) {
            Ok(copied) => {
                self.frame_new = copied;
                Cycle::Ready
            }
            Err(e) => {
                tracing::warn!("Receiver '{}': {}", self.connected_name, e);
                self.release();
                Cycle::Disconnected
            }
        }
    }

    /// Same size, new backing texture: keep the connection, reopen the view
    /// and the frame counter (a restarted sender has a fresh one).
    fn accept_in_place(&mut self, record: &SenderRecord) {
        tracing::debug!(
            "Receiver: '{}' share handle {:?} -> {:?}",
            record.name,
            self.share_handle,
            record.share_handle
        );
        self.release_view();
        if record.format != self.format {
            self.release_destinations();
        }
        self.share_handle = record.share_handle;
        self.format = record.format;
        self.unreadable_warned = false;
        if let Some(mut sync) = self.sync.take() {
            sync.close();
        }
        self.sync = Some(SyncPrimitive::attach(self.registry.namespace(), &record.name));
    }

    fn connect(
        &mut self,
        device: &GpuDevice,
        record: &SenderRecord,
        destination: Destination,
    ) -> Result<()> {
        if record.share_handle.is_none() {
            return Err(TexlinkError::SharedHandle(format!(
                "sender '{}' has no share handle",
                record.name
            )));
        }
        self.connected_name = record.name.clone();
        self.width = record.width;
        self.height = record.height;
        self.format = record.format;
        self.share_handle = record.share_handle;

        self.ensure_destination(device, destination)?;
        self.sync = Some(SyncPrimitive::attach(self.registry.namespace(), &record.name));
        self.connected = true;
        self.updated = true;
        self.frame_new = false;

        tracing::info!(
            "Receiver: connected to '{}' {}x{} {}",
            record.name,
            record.width,
            record.height,
            record.format
        );
        Ok(())
    }

    fn ensure_destination(&mut self, device: &GpuDevice, destination: Destination) -> Result<()> {
        let (slot, usage, label) = match destination {
            Destination::Texture => (&mut self.local, TextureUsage::Default, "receiver texture"),
            Destination::Staging => (&mut self.staging, TextureUsage::Staging, "receiver staging"),
        };
        if slot.is_some()
            || (destination == Destination::Staging && !self.format.is_legacy_compatible())
        {
            return Ok(());
        }
        let desc = TextureDescriptor::new(self.width, self.height, self.format)
            .with_usage(usage)
            .with_label(label);
        *slot = Some(device.create_texture(&desc)?);
        Ok(())
    }

    /// Copy the shared texture into the destination if a new frame is
    /// available. Returns whether a frame was copied.
    fn copy_frame(&mut self, device: &GpuDevice, destination: Destination) -> Result<bool> {
        self.ensure_destination(device, destination)?;
        let dest = match destination {
            Destination::Texture => self.local.clone(),
            Destination::Staging => self.staging.clone(),
        };
        let Some(dest) = dest else {
            return Err(TexlinkError::Device("destination missing".to_string()));
        };

        if !self.sync.as_ref().is_some_and(SyncPrimitive::is_open) {
            // The sender may be mid-release; try again next call.
            self.sync = Some(SyncPrimitive::attach(
                self.registry.namespace(),
                &self.connected_name,
            ));
        }
        let Some(sync) = self.sync.as_mut() else {
            return Err(TexlinkError::Device("sync primitive missing".to_string()));
        };
        let Some(mut guard) = sync.lock() else {
            tracing::trace!("Receiver '{}': gate busy", self.connected_name);
            return Ok(false);
        };
        if !guard.get_new_frame() {
            return Ok(false);
        }

        if self.opened.is_none() {
            let Some(handle) = self.share_handle else {
                return Err(TexlinkError::SharedHandle("no share handle".to_string()));
            };
            self.opened = Some(device.open_shared_texture(handle)?);
        }
        if let Some(view) = self.opened.as_ref() {
            device.copy(view, &dest)?;
            device.flush_and_wait();
        }
        tracing::trace!("Receiver '{}': frame {}", self.connected_name, guard.frame());
        Ok(true)
    }

    fn release_view(&mut self) {
        if let (Some(view), Some(device)) = (self.opened.take(), self.device.as_ref()) {
            let remaining = device.release_texture(view);
            if remaining > 0 {
                tracing::warn!("Receiver: shared view still has {} references", remaining);
            }
        }
    }

    fn release_destinations(&mut self) {
        let Some(device) = self.device.as_ref() else {
            self.local = None;
            self.staging = None;
            return;
        };
        if let Some(local) = self.local.take() {
            let remaining = device.release_texture(local);
            if remaining > 0 {
                tracing::debug!("Receiver: caller still holds {} texture references", remaining);
            }
        }
        if let Some(staging) = self.staging.take() {
            let remaining = device.release_texture(staging);
            if remaining > 0 {
                tracing::warn!("Receiver: staging texture still has {} references", remaining);
            }
        }
    }

    /// Drop every connection resource. The device is kept for reuse.
    pub fn release(&mut self) {
        self.release_view();
        self.release_destinations();
        if let Some(mut sync) = self.sync.take() {
            sync.close();
        }
        if self.connected {
            tracing::debug!("Receiver: released '{}'", self.connected_name);
        }
        self.connected = false;
        self.frame_new = false;
        self.unreadable_warned = false;
        self.connected_name.clear();
        self.width = 0;
        self.height = 0;
        self.share_handle = None;
    }

    /// True once after each (re)connection.
    pub fn is_updated(&mut self) -> bool {
        std::mem::take(&mut self.updated)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the last receive copied a new frame.
    pub fn is_frame_new(&self) -> bool {
        self.frame_new
    }

    pub fn received_texture(&self) -> Option<&Texture> {
        self.local.as_ref()
    }

    pub fn device(&self) -> Option<&GpuDevice> {
        self.device.as_ref()
    }

    pub fn sender_name(&self) -> &str {
        &self.connected_name
    }

    pub fn sender_width(&self) -> u32 {
        self.width
    }

    pub fn sender_height(&self) -> u32 {
        self.height
    }

    pub fn sender_format(&self) -> TextureFormat {
        self.format
    }

    pub fn sender_handle(&self) -> Option<ShareHandle> {
        self.share_handle
    }

    pub fn sender_fps(&self) -> f64 {
        self.sync.as_ref().map_or(0.0, SyncPrimitive::fps)
    }

    pub fn sender_frame(&self) -> u64 {
        self.sync.as_ref().map_or(0, SyncPrimitive::frame)
    }

    pub fn sender_count(&self) -> usize {
        self.registry.count().unwrap_or_else(|e| {
            tracing::warn!("Receiver: {}", e);
            0
        })
    }

    pub fn sender_at(&self, index: usize) -> Option<String> {
        self.registry.name_at(index).unwrap_or_else(|e| {
            tracing::warn!("Receiver: {}", e);
            None
        })
    }

    pub fn active_sender(&self) -> Option<String> {
        self.registry.active().unwrap_or_else(|e| {
            tracing::warn!("Receiver: {}", e);
            None
        })
    }

    pub fn set_active_sender(&self, name: &str) -> bool {
        match self.registry.set_active(name) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Receiver: {}", e);
                false
            }
        }
    }

    pub fn sender_info(&self, name: &str) -> Option<SenderRecord> {
        self.registry.find(name).unwrap_or_else(|e| {
            tracing::warn!("Receiver: {}", e);
            None
        })
    }
}

impl Drop for ReceiverSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ReceiverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverSession")
            .field("requested_name", &self.requested_name)
            .field("connected_name", &self.connected_name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("connected", &self.connected)
            .finish()
    }
}
