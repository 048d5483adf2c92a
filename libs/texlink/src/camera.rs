// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Frame source for a virtual camera shell.
//!
//! The shell owns timing and media negotiation and calls
//! [`CameraFeed::fill_buffer`] once per output frame. Without a sender the
//! buffer is filled with noise so the camera never shows a frozen frame.

use crate::config::{CameraConfig, ConfigStore};
use crate::receiver::ReceiverSession;
use crate::registry::NameRegistry;
use crate::staging::PixelLayout;
use crate::Result;

/// Frame rates selectable by index.
pub const FPS_TABLE: [u32; 6] = [10, 15, 25, 30, 50, 60];

/// Frame intervals in 100 ns units, matching [`FPS_TABLE`].
pub const FRAME_INTERVALS: [u64; 6] = [1_000_000, 666_667, 400_000, 333_333, 200_000, 166_667];

pub const DEFAULT_FPS_INDEX: u32 = 3;

/// Resolutions selectable by index. Index 0 follows the active sender.
pub const RESOLUTION_TABLE: [(u32, u32); 11] = [
    (0, 0),
    (320, 240),
    (640, 360),
    (640, 480),
    (800, 600),
    (1024, 720),
    (1024, 768),
    (1280, 720),
    (1280, 960),
    (1280, 1024),
    (1920, 1080),
];

pub const FALLBACK_RESOLUTION: (u32, u32) = (640, 480);

/// Frame rate for a table index. Unknown indices use the default.
pub fn camera_fps(index: u32) -> u32 {
    FPS_TABLE
        .get(index as usize)
        .copied()
        .unwrap_or(FPS_TABLE[DEFAULT_FPS_INDEX as usize])
}

/// Frame interval (100 ns units) for a table index.
pub fn frame_interval(index: u32) -> u64 {
    FRAME_INTERVALS
        .get(index as usize)
        .copied()
        .unwrap_or(FRAME_INTERVALS[DEFAULT_FPS_INDEX as usize])
}

/// Output size for a table index. Index 0 takes `sender` when known.
pub fn camera_resolution(index: u32, sender: Option<(u32, u32)>) -> (u32, u32) {
    match index {
        0 => sender
            .filter(|&(w, h)| w > 0 && h > 0)
            .unwrap_or(FALLBACK_RESOLUTION),
        i => RESOLUTION_TABLE
            .get(i as usize)
            .copied()
            .unwrap_or(FALLBACK_RESOLUTION),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraSettings {
    pub fps_index: u32,
    pub resolution_index: u32,
    /// Deliver RGB instead of BGR.
    pub swap: bool,
    /// Deliver rows top-down. Capture buffers are bottom-up, so frames are
    /// inverted unless this is set.
    pub flip: bool,
    pub sender_name: String,
}

impl CameraSettings {
    pub fn fps(&self) -> u32 {
        camera_fps(self.fps_index)
    }

    pub fn frame_interval(&self) -> u64 {
        frame_interval(self.fps_index)
    }

    pub fn layout(&self) -> PixelLayout {
        if self.swap {
            PixelLayout::Rgb
        } else {
            PixelLayout::Bgr
        }
    }
}

impl From<&CameraConfig> for CameraSettings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            fps_index: config.fps,
            resolution_index: config.resolution,
            swap: config.swap,
            flip: config.flip,
            sender_name: config.sender_name.clone(),
        }
    }
}

/// What [`CameraFeed::fill_buffer`] wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// A received sender frame.
    Live,
    /// Noise; no sender was available.
    Static,
}

pub struct CameraFeed {
    receiver: ReceiverSession,
    registry: NameRegistry,
    settings: CameraSettings,
    store: Option<ConfigStore>,
    seed: u32,
}

impl CameraFeed {
    pub fn new(registry: NameRegistry, receiver: ReceiverSession, settings: CameraSettings) -> Self {
        Self {
            receiver,
            registry,
            settings,
            store: None,
            seed: 0x1234_5678,
        }
    }

    /// Build from the `[camera]` section. The last sender name is used when
    /// that sender still exists; otherwise the feed follows the active sender.
    pub fn from_config(registry: NameRegistry, store: ConfigStore) -> Result<Self> {
        let config = store.load()?;
        let settings = CameraSettings::from(&config.camera);

        let mut receiver = ReceiverSession::new(registry.clone()).with_adapter(config.sharing.adapter);
        if !settings.sender_name.is_empty() && registry.find(&settings.sender_name)?.is_some() {
            receiver.set_receiver_name(&settings.sender_name);
        }

        let mut feed = Self::new(registry, receiver, settings);
        feed.store = Some(store);
        Ok(feed)
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    pub fn receiver(&self) -> &ReceiverSession {
        &self.receiver
    }

    /// Negotiated output size.
    pub fn resolution(&self) -> (u32, u32) {
        let sender = self
            .registry
            .find("")
            .ok()
            .flatten()
            .map(|record| (record.width, record.height));
        camera_resolution(self.settings.resolution_index, sender)
    }

    /// Fill `dest` with one `width` x `height` frame in the camera's 3-byte
    /// layout.
    pub fn fill_buffer(&mut self, dest: &mut [u8], width: u32, height: u32) -> FillOutcome {
        let any_sender = self.registry.count().map(|n| n > 0).unwrap_or(false);
        if any_sender && self.receive(dest, width, height) {
            return FillOutcome::Live;
        }

        self.receiver.release();
        self.fill_static(dest);
        FillOutcome::Static
    }

    fn receive(&mut self, dest: &mut [u8], width: u32, height: u32) -> bool {
        let layout = self.settings.layout();
        let invert = !self.settings.flip;
        if !self.receiver.receive_pixels(dest, width, height, layout, invert) {
            return false;
        }
        if !self.receiver.is_updated() {
            return true;
        }

        // Connected during this call: remember the sender, then fetch the
        // frame the connecting call skipped.
        let name = self.receiver.sender_name().to_string();
        if name != self.settings.sender_name {
            self.settings.sender_name = name.clone();
            if let Some(store) = &self.store {
                if let Err(e) = store.update(|cfg| cfg.camera.sender_name = name.clone()) {
                    tracing::warn!("CameraFeed: could not save sender name: {}", e);
                }
            }
            tracing::info!("CameraFeed: now showing '{}'", name);
        }
        self.receiver.receive_pixels(dest, width, height, layout, invert)
    }

    fn fill_static(&mut self, dest: &mut [u8]) {
        let mut state = self.seed;
        for px in dest.chunks_mut(3) {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let v = (state & 0xFF) as u8;
            px.fill(v);
        }
        self.seed = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuDevice, TextureDescriptor, TextureFormat};
    use crate::namespace::SharedNamespace;
    use crate::sender::SenderSession;

    #[test]
    fn test_fps_table() {
        assert_eq!(camera_fps(0), 10);
        assert_eq!(camera_fps(3), 30);
        assert_eq!(camera_fps(5), 60);
        assert_eq!(camera_fps(99), 30);
        assert_eq!(frame_interval(1), 666_667);
        assert_eq!(frame_interval(3), 333_333);
        assert_eq!(frame_interval(42), 333_333);
    }

    #[test]
    fn test_resolution_table() {
        assert_eq!(camera_resolution(0, None), (640, 480));
        assert_eq!(camera_resolution(0, Some((1280, 720))), (1280, 720));
        assert_eq!(camera_resolution(1, Some((1280, 720))), (320, 240));
        assert_eq!(camera_resolution(5, None), (1024, 720));
        assert_eq!(camera_resolution(10, None), (1920, 1080));
        assert_eq!(camera_resolution(11, None), (640, 480));
    }

    #[test]
    fn test_settings_layout() {
        let mut settings = CameraSettings::default();
        assert_eq!(settings.layout(), PixelLayout::Bgr);
        settings.swap = true;
        assert_eq!(settings.layout(), PixelLayout::Rgb);
    }

    #[test]
    fn test_static_without_sender() {
        let dir = tempfile::tempdir().unwrap();
        let registry = NameRegistry::open(&SharedNamespace::at(dir.path()), 4).unwrap();
        let receiver = ReceiverSession::new(registry.clone());
        let mut feed = CameraFeed::new(registry, receiver, CameraSettings::default());

        let mut frame = vec![0u8; 8 * 8 * 3];
        assert_eq!(feed.fill_buffer(&mut frame, 8, 8), FillOutcome::Static);
        assert!(frame.iter().any(|&b| b != 0));
        let first = frame.clone();
        feed.fill_buffer(&mut frame, 8, 8);
        assert_ne!(frame, first);
    }

    fn two_band_feed(flip: bool) -> (tempfile::TempDir, SenderSession, CameraFeed) {
        let dir = tempfile::tempdir().unwrap();
        let ns = SharedNamespace::at(dir.path());
        let registry = NameRegistry::open(&ns, 4).unwrap();
        let device = GpuDevice::new(ns).unwrap();

        // Top row red, bottom row blue (BGRA texels).
        let texture = device
            .create_texture(&TextureDescriptor::new(2, 2, TextureFormat::Bgra8Unorm))
            .unwrap();
        let mut texels = [0u8, 0, 255, 255].repeat(2);
        texels.extend([255u8, 0, 0, 255].repeat(2));
        device.update_texture(&texture, &texels).unwrap();

        let mut sender = SenderSession::new(registry.clone(), device, "Bands");
        assert!(sender.send(&texture));

        let receiver = ReceiverSession::new(registry.clone());
        let settings = CameraSettings {
            flip,
            ..CameraSettings::default()
        };
        (dir, sender, CameraFeed::new(registry, receiver, settings))
    }

    #[test]
    fn test_default_frames_are_bottom_up() {
        let (_dir, _sender, mut feed) = two_band_feed(false);
        let mut frame = vec![0u8; 2 * 2 * 3];
        assert_eq!(feed.fill_buffer(&mut frame, 2, 2), FillOutcome::Live);
        assert_eq!(&frame[..3], &[255, 0, 0]);
        assert_eq!(&frame[9..], &[0, 0, 255]);
    }

    #[test]
    fn test_flip_delivers_top_down() {
        let (_dir, _sender, mut feed) = two_band_feed(true);
        let mut frame = vec![0u8; 2 * 2 * 3];
        assert_eq!(feed.fill_buffer(&mut frame, 2, 2), FillOutcome::Live);
        assert_eq!(&frame[..3], &[0, 0, 255]);
        assert_eq!(&frame[9..], &[255, 0, 0]);
    }

    #[test]
    fn test_live_frame_and_persisted_name() {
        let dir = tempfile::tempdir().unwrap();
        let ns = SharedNamespace::at(dir.path().join("ns"));
        let store = ConfigStore::at(dir.path().join("config.toml"));
        let registry = NameRegistry::open(&ns, 4).unwrap();
        let device = GpuDevice::new(ns).unwrap();

        let texture = device
            .create_texture(&TextureDescriptor::new(4, 4, TextureFormat::Bgra8Unorm))
            .unwrap();
        device
            .update_texture(&texture, &[10u8, 20, 30, 255].repeat(16))
            .unwrap();
        let mut sender = SenderSession::new(registry.clone(), device, "Cam Source");
        assert!(sender.send(&texture));

        let mut feed = CameraFeed::from_config(registry, store.clone()).unwrap();
        assert_eq!(feed.resolution(), (4, 4));

        let mut frame = vec![0u8; 4 * 4 * 3];
        assert_eq!(feed.fill_buffer(&mut frame, 4, 4), FillOutcome::Live);
        assert_eq!(&frame[..3], &[10, 20, 30]);
        assert_eq!(store.load().unwrap().camera.sender_name, "Cam Source");

        sender.release();
        assert_eq!(feed.fill_buffer(&mut frame, 4, 4), FillOutcome::Static);
        assert!(!feed.receiver().is_connected());
    }
}
