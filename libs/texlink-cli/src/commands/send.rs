// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{Result, bail};
use texlink::{PixelLayout, SenderSession};

use super::Context;

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

/// Colour bars scrolling one column per frame, RGBA.
fn test_pattern(pixels: &mut [u8], width: u32, height: u32, frame: u64) {
    let width = width as usize;
    let bar_width = (width / BARS.len()).max(1);
    let shift = (frame % width as u64) as usize;
    for (y, row) in pixels.chunks_exact_mut(width * 4).enumerate() {
        // Bottom eighth is a grey ramp that shows vertical orientation.
        let ramp = y * 8 >= height as usize * 7;
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            if ramp {
                let v = (x * 255 / width.max(1)) as u8;
                px.copy_from_slice(&[v, v, v, 255]);
            } else {
                let bar = ((x + shift) % width / bar_width).min(BARS.len() - 1);
                let [r, g, b] = BARS[bar];
                px.copy_from_slice(&[r, g, b, 255]);
            }
        }
    }
}

pub fn run(ctx: &Context, name: &str, width: u32, height: u32, fps: u32, frames: u64) -> Result<()> {
    if width == 0 || height == 0 {
        bail!("Width and height must be non-zero");
    }

    let config = ctx.config()?;
    let registry = ctx.registry()?;
    let device = ctx.device()?;
    let mut sender =
        SenderSession::new(registry, device, name).with_frame_count(config.sharing.frame_count);

    let mut pixels = vec![0u8; PixelLayout::Rgba.buffer_len(width, height)];
    let mut frame = 0u64;

    println!("Sending '{}' {}x{} at {} fps", name, width, height, fps);
    while frames == 0 || frame < frames {
        test_pattern(&mut pixels, width, height, frame);
        if !sender.send_image(&pixels, width, height, PixelLayout::Rgba, false) {
            bail!("Sender '{}' failed to publish", name);
        }
        frame += 1;

        if fps > 0 && frame % u64::from(fps) == 0 {
            println!("frame {:>8}  {:6.2} fps", sender.frame(), sender.fps());
        }
        sender.hold_fps(fps);
    }

    sender.release();
    println!("Sent {} frames", frame);
    Ok(())
}
