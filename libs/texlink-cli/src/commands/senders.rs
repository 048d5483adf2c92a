// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{Result, bail};
use texlink::{PanelSelection, SenderRecord, SyncPrimitive};

use super::Context;

fn describe(record: &SenderRecord) -> String {
    let handle = record
        .share_handle
        .map_or_else(|| "-".to_string(), |h| h.to_string());
    format!(
        "{}x{} {} handle {}",
        record.width, record.height, record.format, handle
    )
}

/// List every published sender, marking the active one.
pub fn list(ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let records = registry.records()?;

    if records.is_empty() {
        println!("No senders.");
        return Ok(());
    }

    let active = registry.active()?;
    println!("Senders ({}/{}):\n", records.len(), registry.max_senders());
    for record in &records {
        let marker = if active.as_deref() == Some(record.name.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {}", marker, record.name);
        println!("    {}", describe(record));
    }

    Ok(())
}

pub fn show_active(ctx: &Context) -> Result<()> {
    match ctx.registry()?.active()? {
        Some(name) => println!("{}", name),
        None => println!("No active sender."),
    }
    Ok(())
}

pub fn set_active(ctx: &Context, name: &str) -> Result<()> {
    ctx.registry()?.set_active(name)?;
    println!("Active sender: {}", name);
    Ok(())
}

pub fn select(ctx: &Context, name: &str) -> Result<()> {
    let registry = ctx.registry()?;
    let serial = PanelSelection::select(&ctx.store, &registry, name)?;
    println!("Selected {} (serial {})", name, serial);
    Ok(())
}

pub fn info(ctx: &Context, name: &str) -> Result<()> {
    let registry = ctx.registry()?;
    let Some(record) = registry.find(name)? else {
        bail!("No sender named '{}'", name);
    };

    let sync = SyncPrimitive::attach(&ctx.namespace, name);
    let active = registry.active()?.as_deref() == Some(name);

    println!("Name:        {}", record.name);
    println!("Size:        {}x{}", record.width, record.height);
    println!("Format:      {} ({})", record.format, record.format.code());
    match record.share_handle {
        Some(handle) => println!("Handle:      {}", handle),
        None => println!("Handle:      -"),
    }
    println!("Active:      {}", if active { "yes" } else { "no" });
    if sync.is_frame_count_enabled() {
        println!("Frame:       {}", sync.counter_value());
    } else {
        println!("Frame:       counting disabled");
    }

    Ok(())
}

/// Drop a sender entry and its gate files.
pub fn remove(ctx: &Context, name: &str) -> Result<()> {
    let registry = ctx.registry()?;
    if !registry.unpublish(name)? {
        bail!("No sender named '{}'", name);
    }
    SyncPrimitive::attach(&ctx.namespace, name).remove_files();
    println!("Removed {}", name);
    Ok(())
}
