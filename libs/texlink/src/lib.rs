// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Cross-process named texture sharing.
//!
//! A [`SenderSession`] publishes a texture under a name; any number of
//! [`ReceiverSession`]s in other processes find it through the
//! [`NameRegistry`], open it by [`ShareHandle`] and copy new frames under a
//! per-sender gate ([`SyncPrimitive`]). All shared state lives in a
//! [`SharedNamespace`] directory.

pub mod camera;
pub mod config;
pub mod error;
mod file_lock;
pub mod gpu;
pub mod namespace;
pub mod receiver;
pub mod registry;
pub mod selection;
pub mod sender;
pub mod staging;
pub mod sync;

pub use camera::{CameraFeed, CameraSettings, FillOutcome};
pub use config::{Config, ConfigStore, texlink_home};
pub use error::{Result, TexlinkError};
pub use gpu::{
    GpuDevice, MappedTexture, ShareHandle, Texture, TextureDescriptor, TextureFormat, TextureUsage,
};
pub use namespace::SharedNamespace;
pub use receiver::ReceiverSession;
pub use registry::{NameRegistry, SenderRecord};
pub use selection::{PanelSelection, SenderSelector};
pub use sender::SenderSession;
pub use staging::{PixelLayout, PixelSource, convert_pixels};
pub use sync::{AccessGuard, SyncPrimitive};
