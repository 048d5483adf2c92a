// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use anyhow::Result;
use texlink::{PanelSelection, ReceiverSession};

use super::Context;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Follow a sender and print what arrives. Without a name the receiver
/// tracks the active sender and `texlink select`.
pub fn run(ctx: &Context, name: Option<&str>, frames: u64) -> Result<()> {
    let config = ctx.config()?;
    let registry = ctx.registry()?;
    let mut receiver = ReceiverSession::new(registry).with_adapter(config.sharing.adapter);

    match name {
        Some(name) => receiver.set_receiver_name(name),
        None => receiver.set_selector(PanelSelection::new(ctx.store.clone())),
    }

    let mut received = 0u64;
    let mut waiting = false;
    while frames == 0 || received < frames {
        if !receiver.receive_texture() {
            if !waiting {
                println!("Waiting for {}", name.unwrap_or("a sender"));
                waiting = true;
            }
            std::thread::sleep(POLL_INTERVAL);
            continue;
        }
        waiting = false;

        if receiver.is_updated() {
            println!(
                "Connected to '{}' {}x{} {}",
                receiver.sender_name(),
                receiver.sender_width(),
                receiver.sender_height(),
                receiver.sender_format()
            );
        }

        if receiver.is_frame_new() {
            received += 1;
            println!(
                "frame {:>8}  {:6.2} fps",
                receiver.sender_frame(),
                receiver.sender_fps()
            );
        } else {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    receiver.release();
    println!("Received {} frames", received);
    Ok(())
}
