// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{Context as _, Result};

use super::Context;

pub fn show(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    println!("# {}", ctx.store.path().display());
    println!("# namespace: {}\n", ctx.namespace.root().display());
    print!(
        "{}",
        toml::to_string_pretty(&config).context("Failed to serialize config")?
    );
    Ok(())
}

pub fn set(ctx: &Context, key: &str, value: &str) -> Result<()> {
    ctx.store
        .set_value(key, value)
        .with_context(|| format!("Failed to set {}", key))?;
    println!("{} = {}", key, ctx.store.get_value(key)?);
    Ok(())
}
