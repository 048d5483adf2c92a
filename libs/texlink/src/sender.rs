// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Publishing side: one named shared texture, updated once per frame.

use crate::gpu::{GpuDevice, ShareHandle, Texture, TextureDescriptor, TextureFormat};
use crate::registry::{validate_name, NameRegistry, SenderRecord};
use crate::staging::{convert_pixels, PixelLayout, PixelSource};
use crate::sync::SyncPrimitive;

/// Publishes a texture under a name and signals a new frame on every send.
///
/// The session starts unpublished. The first [`send`](Self::send) (or an
/// explicit [`create`](Self::create)) publishes the sender; [`release`](Self::release)
/// or dropping the session withdraws it.
pub struct SenderSession {
    registry: NameRegistry,
    device: GpuDevice,
    name: String,
    width: u32,
    height: u32,
    format: TextureFormat,
    share_handle: Option<ShareHandle>,
    /// Shared texture this session allocated. `None` when publishing the
    /// caller's own shared texture or a handle passed to `create`.
    shared: Option<Texture>,
    sync: Option<SyncPrimitive>,
    frame_count: bool,
    upload: Option<Texture>,
    upload_buffer: Vec<u8>,
}

impl SenderSession {
    pub fn new(registry: NameRegistry, device: GpuDevice, name: impl Into<String>) -> Self {
        Self {
            registry,
            device,
            name: name.into(),
            width: 0,
            height: 0,
            format: TextureFormat::default(),
            share_handle: None,
            shared: None,
            sync: None,
            frame_count: true,
            upload: None,
            upload_buffer: Vec::new(),
        }
    }

    /// Whether the frame counter is enabled when the sender is created.
    pub fn with_frame_count(mut self, enabled: bool) -> Self {
        self.frame_count = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
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

    pub fn share_handle(&self) -> Option<ShareHandle> {
        self.share_handle
    }

    pub fn is_published(&self) -> bool {
        self.sync.is_some()
    }

    /// Shared texture allocated by this session, if any.
    pub fn shared_texture(&self) -> Option<&Texture> {
        self.shared.as_ref()
    }

    pub fn device(&self) -> &GpuDevice {
        &self.device
    }

    pub fn fps(&self) -> f64 {
        self.sync.as_ref().map_or(0.0, SyncPrimitive::fps)
    }

    pub fn frame(&self) -> u64 {
        self.sync.as_ref().map_or(0, SyncPrimitive::frame)
    }

    /// Pace the caller's loop to at most `fps` frames per second.
    pub fn hold_fps(&mut self, fps: u32) {
        if let Some(sync) = self.sync.as_mut() {
            sync.hold_fps(fps);
        }
    }

    /// Stop advancing the frame counter; receivers treat every poll as new.
    pub fn disable_frame_count(&mut self) {
        self.frame_count = false;
        if let Some(sync) = self.sync.as_ref() {
            sync.disable_frame_count();
        }
    }

    /// Allocate our own shared texture, falling back to BGRA when the
    /// requested format cannot be created.
    fn allocate_shared(&mut self, width: u32, height: u32, format: TextureFormat) -> bool {
        let created = match self.device.create_shared_texture(width, height, format) {
            Ok(pair) => Ok(pair),
            Err(e) if format != TextureFormat::Bgra8Unorm => {
                tracing::warn!(
                    "Sender '{}': {} unavailable ({}), falling back to {}",
                    self.name,
                    format,
                    e,
                    TextureFormat::Bgra8Unorm
                );
                self.device
                    .create_shared_texture(width, height, TextureFormat::Bgra8Unorm)
            }
            Err(e) => Err(e),
        };

        match created {
            Ok((texture, handle)) => {
                self.release_shared();
                self.format = texture.format();
                self.shared = Some(texture);
                self.share_handle = Some(handle);
                true
            }
            Err(e) => {
                tracing::error!(
                    "Sender '{}': could not create {}x{} shared texture: {}",
                    self.name,
                    width,
                    height,
                    e
                );
                false
            }
        }
    }

    fn release_shared(&mut self) {
        if let Some(texture) = self.shared.take() {
            let remaining = self.device.release_texture(texture);
            if remaining > 0 {
                tracing::warn!(
                    "Sender '{}': shared texture still has {} references",
                    self.name,
                    remaining
                );
            }
        }
    }

    fn publish_record(&self) -> bool {
        let record = SenderRecord::new(
            self.name.clone(),
            self.width,
            self.height,
            self.format,
            self.share_handle,
        );
        match self.registry.publish(&record) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Sender '{}': publish failed: {}", self.name, e);
                false
            }
        }
    }

    /// Publish a sender. Without a share handle the session allocates the
    /// shared texture itself.
    pub fn create(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        share_handle: Option<ShareHandle>,
        format: TextureFormat,
    ) -> bool {
        if let Err(e) = validate_name(name) {
            tracing::warn!("Sender: {}", e);
            return false;
        }
        if width == 0 || height == 0 {
            tracing::warn!("Sender '{}': cannot create a {}x{} sender", name, width, height);
            return false;
        }
        if self.is_published() {
            self.release();
        }

        self.name = name.to_string();
        self.width = width;
        self.height = height;
        self.format = format;
        match share_handle {
            Some(handle) => {
                self.share_handle = Some(handle);
            }
            None => {
                if !self.allocate_shared(width, height, format) {
                    return false;
                }
            }
        }

        // Receivers attach to the gate and counter without creating them,
        // so both exist before the record becomes visible.
        let mut sync = SyncPrimitive::open(self.registry.namespace(), name);
        if self.frame_count {
            sync.enable_frame_count();
        } else {
            sync.disable_frame_count();
        }

        if !self.publish_record() {
            sync.close();
            sync.remove_files();
            self.release_shared();
            self.share_handle = None;
            return false;
        }
        self.sync = Some(sync);

        tracing::info!(
            "Sender '{}': created {}x{} {}",
            self.name,
            self.width,
            self.height,
            self.format
        );
        true
    }

    /// Republish with new geometry. Creates the sender if it is not
    /// published yet or the name changed.
    pub fn update(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        share_handle: Option<ShareHandle>,
        format: TextureFormat,
    ) -> bool {
        if !self.is_published() || name != self.name {
            return self.create(name, width, height, share_handle, format);
        }
        if width == 0 || height == 0 {
            tracing::warn!("Sender '{}': cannot update to {}x{}", name, width, height);
            return false;
        }

        match share_handle {
            Some(handle) => {
                self.release_shared();
                self.share_handle = Some(handle);
                self.format = format;
            }
            None => {
                let own_fits = self.shared.as_ref().is_some_and(|t| {
                    t.width() == width && t.height() == height && t.format() == format
                });
                if !own_fits && !self.allocate_shared(width, height, format) {
                    return false;
                }
            }
        }
        self.width = width;
        self.height = height;

        tracing::debug!(
            "Sender '{}': updated to {}x{} {}",
            self.name,
            width,
            height,
            self.format
        );
        self.publish_record()
    }

    /// Publish one frame of `texture`.
    ///
    /// Returns false only on failure. A frame skipped because a receiver
    /// holds the gate still counts as success.
    pub fn send(&mut self, texture: &Texture) -> bool {
        if texture.width() == 0 || texture.height() == 0 {
            tracing::warn!("Sender '{}': zero-sized texture", self.name);
            return false;
        }

        let name = self.name.clone();
        let adopt = texture.share_handle();

        if !self.is_published() {
            if !self.create(&name, texture.width(), texture.height(), adopt, texture.format()) {
                return false;
            }
        } else {
            let resized = texture.width() != self.width || texture.height() != self.height;
            let rehandled = adopt.is_some() && adopt != self.share_handle;
            let reformatted = adopt.is_some() && texture.format() != self.format;
            // A local texture needs a shared copy target of our own.
            let unbacked = adopt.is_none() && self.shared.is_none();
            if (resized || rehandled || reformatted || unbacked)
                && !self.update(&name, texture.width(), texture.height(), adopt, texture.format())
            {
                return false;
            }
        }

        let Some(sync) = self.sync.as_mut() else {
            return false;
        };
        let Some(mut guard) = sync.lock() else {
            tracing::trace!("Sender '{}': gate busy, frame skipped", self.name);
            return true;
        };

        if let Some(shared) = self.shared.as_ref() {
            if !shared.same_resource(texture) {
                if let Err(e) = self.device.copy(texture, shared) {
                    tracing::warn!("Sender '{}': copy failed: {}", self.name, e);
                    return false;
                }
                self.device.flush_and_wait();
            }
        }
        guard.set_new_frame();
        true
    }

    /// Publish one frame from a CPU pixel buffer, uploaded through a local
    /// texture in the sender's pixel order.
    pub fn send_image(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        layout: PixelLayout,
        invert: bool,
    ) -> bool {
        let source = match PixelSource::from_layout(pixels, layout, width, height) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("Sender '{}': {}", self.name, e);
                return false;
            }
        };

        let reuse = self
            .upload
            .as_ref()
            .is_some_and(|t| t.width() == width && t.height() == height);
        if !reuse {
            if let Some(old) = self.upload.take() {
                self.device.release_texture(old);
            }
            let desc = TextureDescriptor::new(width, height, TextureFormat::Bgra8Unorm)
                .with_label("sender upload");
            match self.device.create_texture(&desc) {
                Ok(texture) => self.upload = Some(texture),
                Err(e) => {
                    tracing::warn!("Sender '{}': {}", self.name, e);
                    return false;
                }
            }
        }

        self.upload_buffer
            .resize(PixelLayout::Bgra.buffer_len(width, height), 0);
        if let Err(e) = convert_pixels(
            &source,
            &mut self.upload_buffer,
            PixelLayout::Bgra,
            width,
            height,
            invert,
        ) {
            tracing::warn!("Sender '{}': {}", self.name, e);
            return false;
        }

        let Some(upload) = self.upload.clone() else {
            return false;
        };
        if let Err(e) = self.device.update_texture(&upload, &self.upload_buffer) {
            tracing::warn!("Sender '{}': upload failed: {}", self.name, e);
            return false;
        }
        self.send(&upload)
    }

    /// Withdraw the sender: release the shared texture, unpublish and remove
    /// the gate and frame counter.
    pub fn release(&mut self) {
        let Some(mut sync) = self.sync.take() else {
            self.release_shared();
            return;
        };

        self.release_shared();
        if let Some(upload) = self.upload.take() {
            self.device.release_texture(upload);
        }
        if let Err(e) = self.registry.unpublish(&self.name) {
            tracing::warn!("Sender '{}': unpublish failed: {}", self.name, e);
        }
        sync.close();
        sync.remove_files();

        tracing::info!("Sender '{}': released", self.name);
        self.width = 0;
        self.height = 0;
        self.share_handle = None;
    }
}

impl Drop for SenderSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SenderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderSession")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("share_handle", &self.share_handle)
            .field("published", &self.is_published())
            .finish()
    }
}
