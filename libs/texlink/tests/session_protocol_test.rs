// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! End-to-end sender/receiver behaviour over one namespace, with the two
//! sides on independent devices as they would be in separate processes.

use texlink::{
    GpuDevice, NameRegistry, PixelLayout, ReceiverSession, SenderRecord, SenderSession,
    SharedNamespace, Texture, TextureDescriptor, TextureFormat,
};

struct Fixture {
    _dir: tempfile::TempDir,
    ns: SharedNamespace,
    registry: NameRegistry,
    sender_device: GpuDevice,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ns = SharedNamespace::at(dir.path());
    let registry = NameRegistry::open(&ns, 10).unwrap();
    let sender_device = GpuDevice::new(ns.clone()).unwrap();
    Fixture {
        _dir: dir,
        ns,
        registry,
        sender_device,
    }
}

impl Fixture {
    fn sender(&self, name: &str) -> SenderSession {
        SenderSession::new(self.registry.clone(), self.sender_device.clone(), name)
    }

    /// Receiver with its own device, like a separate process would have.
    fn receiver(&self) -> ReceiverSession {
        let registry = NameRegistry::open(&self.ns, 10).unwrap();
        ReceiverSession::new(registry)
    }

    fn solid(&self, width: u32, height: u32, format: TextureFormat, texel: [u8; 4]) -> Texture {
        let texture = self
            .sender_device
            .create_texture(&TextureDescriptor::new(width, height, format))
            .unwrap();
        self.sender_device
            .update_texture(&texture, &texel.repeat((width * height) as usize))
            .unwrap();
        texture
    }
}

#[test]
fn test_create_then_find_returns_geometry() {
    let f = fixture();
    for (name, width, height, format) in [
        ("Plain", 640, 480, TextureFormat::Bgra8Unorm),
        ("Wide", 1920, 1080, TextureFormat::Rgba8Unorm),
        ("Float", 256, 256, TextureFormat::Rgba16Float),
    ] {
        let mut sender = f.sender(name);
        assert!(sender.create(name, width, height, None, format));
        let record = f.registry.find(name).unwrap().unwrap();
        assert_eq!((record.width, record.height, record.format), (width, height, format));
    }
}

#[test]
fn test_receiver_before_any_sender() {
    let f = fixture();
    let mut receiver = f.receiver();
    for _ in 0..3 {
        assert!(!receiver.receive_texture());
        assert!(!receiver.is_connected());
        assert!(receiver.received_texture().is_none());
    }
    let mut buffer = vec![0xAAu8; 16];
    assert!(!receiver.receive_pixels(&mut buffer, 2, 2, PixelLayout::Rgba, false));
    assert!(buffer.iter().all(|&b| b == 0xAA));
}

#[test]
fn test_frame_counter_advances_once_per_send() {
    let f = fixture();
    let texture = f.solid(32, 32, TextureFormat::Bgra8Unorm, [1, 2, 3, 255]);
    let mut sender = f.sender("Counter");
    assert!(sender.send(&texture));

    let mut receiver = f.receiver();
    assert!(receiver.receive_texture());
    assert!(receiver.receive_texture());
    assert!(receiver.is_frame_new());
    let start = receiver.sender_frame();

    const N: u64 = 25;
    for i in 1..=N {
        assert!(sender.send(&texture));
        assert!(receiver.receive_texture());
        assert!(receiver.is_frame_new());
        assert_eq!(receiver.sender_frame(), start + i);
    }

    // Missed sends collapse into one new frame, never a decrease.
    for _ in 0..3 {
        assert!(sender.send(&texture));
    }
    assert!(receiver.receive_texture());
    assert!(receiver.is_frame_new());
    assert_eq!(receiver.sender_frame(), start + N + 3);
    assert!(receiver.receive_texture());
    assert!(!receiver.is_frame_new());
    assert_eq!(receiver.sender_frame(), start + N + 3);
}

#[test]
fn test_is_updated_once_per_change() {
    let f = fixture();
    let small = f.solid(64, 64, TextureFormat::Bgra8Unorm, [0, 0, 0, 255]);
    let large = f.solid(128, 64, TextureFormat::Bgra8Unorm, [0, 0, 0, 255]);
    let mut sender = f.sender("Updates");
    assert!(sender.send(&small));

    let mut receiver = f.receiver();
    assert!(receiver.receive_texture());
    assert!(receiver.is_updated());
    for _ in 0..5 {
        assert!(sender.send(&small));
        assert!(receiver.receive_texture());
        assert!(!receiver.is_updated());
    }

    assert!(sender.send(&large));
    assert!(receiver.receive_texture());
    assert!(receiver.is_updated());
    assert!(!receiver.is_updated());
    assert_eq!(receiver.sender_width(), 128);
}

#[test]
fn test_resize_reconnects_without_leaking() {
    let f = fixture();
    let small = f.solid(640, 480, TextureFormat::Bgra8Unorm, [9, 9, 9, 255]);
    let large = f.solid(1280, 720, TextureFormat::Bgra8Unorm, [7, 7, 7, 255]);
    let mut sender = f.sender("Resizer");
    let mut receiver = f.receiver();

    assert!(sender.send(&small));
    assert!(receiver.receive_texture());
    assert!(receiver.receive_texture());

    let mut after_first_cycle = None;
    for _ in 0..5 {
        assert!(sender.send(&large));
        assert!(receiver.receive_texture());
        assert!(receiver.is_updated());
        assert_eq!((receiver.sender_width(), receiver.sender_height()), (1280, 720));
        assert_eq!(receiver.received_texture().unwrap().width(), 1280);
        assert!(receiver.receive_texture());
        assert!(receiver.is_frame_new());

        assert!(sender.send(&small));
        assert!(receiver.receive_texture());
        assert!(receiver.is_updated());
        assert_eq!((receiver.sender_width(), receiver.sender_height()), (640, 480));
        assert!(receiver.receive_texture());

        let live = (
            receiver.device().unwrap().live_textures(),
            f.sender_device.live_textures(),
        );
        match after_first_cycle {
            None => after_first_cycle = Some(live),
            Some(first) => assert_eq!(live, first),
        }
    }

    // Only the receiver's texture and its shared view remain.
    assert_eq!(after_first_cycle.unwrap().0, 2);
    let shared_files = std::fs::read_dir(f.ns.textures_dir()).unwrap().count();
    assert_eq!(shared_files, 1);
}

fn round_trip(format: TextureFormat, texel: [u8; 4], layout: PixelLayout, expected: &[u8]) {
    let f = fixture();
    let texture = f.solid(48, 24, format, texel);
    let mut sender = f.sender("Colour");
    assert!(sender.send(&texture));

    let mut receiver = f.receiver();
    let mut pixels = vec![0u8; layout.buffer_len(48, 24)];
    assert!(receiver.receive_pixels(&mut pixels, 48, 24, layout, false));
    assert!(receiver.is_updated());
    assert!(receiver.receive_pixels(&mut pixels, 48, 24, layout, false));
    assert!(receiver.is_frame_new());

    for px in pixels.chunks_exact(layout.bytes_per_pixel()) {
        assert_eq!(px, expected);
    }
}

#[test]
fn test_solid_colour_round_trip_bgra() {
    round_trip(
        TextureFormat::Bgra8Unorm,
        [0x10, 0x20, 0x30, 0xFF],
        PixelLayout::Bgra,
        &[0x10, 0x20, 0x30, 0xFF],
    );
}

#[test]
fn test_solid_colour_round_trip_swizzled() {
    round_trip(
        TextureFormat::Bgra8Unorm,
        [0x10, 0x20, 0x30, 0xFF],
        PixelLayout::Rgba,
        &[0x30, 0x20, 0x10, 0xFF],
    );
    round_trip(
        TextureFormat::Rgba8Unorm,
        [0x40, 0x50, 0x60, 0x80],
        PixelLayout::Rgba,
        &[0x40, 0x50, 0x60, 0x80],
    );
    round_trip(
        TextureFormat::Rgba8Unorm,
        [0x40, 0x50, 0x60, 0x80],
        PixelLayout::Bgr,
        &[0x60, 0x50, 0x40],
    );
}

#[test]
fn test_receive_pixels_resamples_to_caller_size() {
    let f = fixture();
    let texture = f.solid(64, 32, TextureFormat::Bgra8Unorm, [1, 2, 3, 4]);
    let mut sender = f.sender("Scaled");
    assert!(sender.send(&texture));

    let mut receiver = f.receiver();
    let mut pixels = vec![0u8; PixelLayout::Rgb.buffer_len(16, 16)];
    assert!(receiver.receive_pixels(&mut pixels, 16, 16, PixelLayout::Rgb, true));
    assert!(receiver.receive_pixels(&mut pixels, 16, 16, PixelLayout::Rgb, true));
    assert!(pixels.chunks_exact(3).all(|px| px == [3, 2, 1]));
}

#[test]
fn test_receiver_follows_active_sender_after_release() {
    let f = fixture();
    let texture = f.solid(8, 8, TextureFormat::Bgra8Unorm, [0, 0, 0, 255]);
    let mut first = f.sender("First");
    let mut second = f.sender("Second");
    assert!(first.send(&texture));
    assert!(second.send(&texture));

    let mut receiver = f.receiver();
    assert!(receiver.receive_texture());
    assert_eq!(receiver.sender_name(), "Second");

    second.release();
    assert!(!receiver.receive_texture());
    assert!(receiver.receive_texture());
    assert_eq!(receiver.sender_name(), "First");
}

#[test]
fn test_float_sender_stays_connected_for_pixel_receivers() {
    let f = fixture();
    let texture = f
        .sender_device
        .create_texture(&TextureDescriptor::new(32, 32, TextureFormat::Rgba16Float))
        .unwrap();
    let mut sender = f.sender("Float");
    let mut receiver = f.receiver();
    let mut pixels = vec![0u8; PixelLayout::Rgba.buffer_len(32, 32)];

    let mut observed = Vec::new();
    for _ in 0..6 {
        assert!(sender.send(&texture));
        let ok = receiver.receive_pixels(&mut pixels, 32, 32, PixelLayout::Rgba, false);
        observed.push((ok, receiver.is_updated(), receiver.is_connected()));
    }

    assert_eq!(observed[0], (true, true, true));
    assert!(observed[1..].iter().all(|&o| o == (false, false, true)));
    assert_eq!(receiver.sender_format(), TextureFormat::Rgba16Float);

    // The texture path still delivers frames from the same sender.
    let mut textured = f.receiver();
    assert!(textured.receive_texture());
    assert!(sender.send(&texture));
    assert!(textured.receive_texture());
    assert!(textured.is_frame_new());
}

#[test]
fn test_resize_drops_fixed_name() {
    let f = fixture();
    let small = f.solid(64, 64, TextureFormat::Bgra8Unorm, [1, 1, 1, 255]);
    let large = f.solid(128, 64, TextureFormat::Bgra8Unorm, [2, 2, 2, 255]);
    let mut fixed = f.sender("Fixed");
    let mut other = f.sender("Other");
    assert!(fixed.send(&small));
    assert!(other.send(&small));
    assert_eq!(f.registry.active().unwrap().as_deref(), Some("Other"));

    let mut receiver = f.receiver();
    receiver.set_receiver_name("Fixed");
    assert!(receiver.receive_texture());
    assert_eq!(receiver.sender_name(), "Fixed");
    assert_eq!(receiver.receiver_name(), "Fixed");

    assert!(fixed.send(&large));
    assert!(receiver.receive_texture());
    assert!(receiver.is_updated());
    assert_eq!((receiver.sender_name(), receiver.sender_width()), ("Fixed", 128));
    assert_eq!(receiver.receiver_name(), "");

    // Once the fixed sender goes, discovery falls back to the active one.
    fixed.release();
    assert!(!receiver.receive_texture());
    assert!(receiver.receive_texture());
    assert_eq!(receiver.sender_name(), "Other");
}

#[test]
fn test_receiver_never_recreates_sync_files() {
    let f = fixture();
    let (shared, handle) = f
        .sender_device
        .create_shared_texture(16, 16, TextureFormat::Bgra8Unorm)
        .unwrap();
    // A record whose sender already removed its gate and counter.
    f.registry
        .publish(&SenderRecord::new(
            "Leaving",
            16,
            16,
            TextureFormat::Bgra8Unorm,
            Some(handle),
        ))
        .unwrap();

    let mut receiver = f.receiver();
    assert!(receiver.receive_texture());
    assert!(receiver.receive_texture());
    assert!(!receiver.is_frame_new());
    assert!(!f.ns.gate_path("Leaving").exists());
    assert!(!f.ns.frame_path("Leaving").exists());
    drop(shared);
}
