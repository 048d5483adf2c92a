// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! texlink CLI
//!
//! Inspect the sender directory, pick the active sender, edit settings and
//! run test senders and receivers.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "texlink")]
#[command(author, version, about = "Named texture sharing CLI", long_about = None)]
struct Cli {
    /// Shared namespace directory (default: $TEXLINK_SHM_DIR or /dev/shm/texlink)
    #[arg(long, global = true, value_name = "DIR")]
    shm_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List published senders
    List,

    /// Show or change the active sender
    Active {
        #[command(subcommand)]
        action: Option<ActiveCommands>,
    },

    /// Select a sender for receivers that follow the selection panel
    Select {
        /// Sender name
        name: String,
    },

    /// Show one sender's details
    Info {
        /// Sender name
        name: String,
    },

    /// Remove a sender entry left behind by a process that did not exit cleanly
    Remove {
        /// Sender name
        name: String,
    },

    /// Show or edit config.toml
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Publish a moving test pattern
    Send {
        /// Sender name
        #[arg(long, default_value = "texlink test")]
        name: String,

        #[arg(long, default_value = "640")]
        width: u32,

        #[arg(long, default_value = "360")]
        height: u32,

        /// Frames per second
        #[arg(long, default_value = "30")]
        fps: u32,

        /// Frames to send before exiting (0 = until interrupted)
        #[arg(long, default_value = "0")]
        frames: u64,
    },

    /// Receive from a sender and report frame numbers and rate
    Receive {
        /// Sender name (default: follow the active sender)
        #[arg(long)]
        name: Option<String>,

        /// New frames to receive before exiting (0 = until interrupted)
        #[arg(long, default_value = "0")]
        frames: u64,
    },
}

#[derive(Subcommand)]
enum ActiveCommands {
    /// Make a sender active
    Set {
        /// Sender name
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Set one value, e.g. `camera.fps 4`
    Set {
        /// Dotted key
        key: String,

        value: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let ctx = commands::Context::new(cli.shm_dir);

    match cli.command {
        Commands::List => commands::senders::list(&ctx)?,
        Commands::Active { action } => match action {
            None => commands::senders::show_active(&ctx)?,
            Some(ActiveCommands::Set { name }) => commands::senders::set_active(&ctx, &name)?,
        },
        Commands::Select { name } => commands::senders::select(&ctx, &name)?,
        Commands::Info { name } => commands::senders::info(&ctx, &name)?,
        Commands::Remove { name } => commands::senders::remove(&ctx, &name)?,
        Commands::Config { action } => match action {
            ConfigCommands::Show => commands::config::show(&ctx)?,
            ConfigCommands::Set { key, value } => commands::config::set(&ctx, &key, &value)?,
        },
        Commands::Send {
            name,
            width,
            height,
            fps,
            frames,
        } => commands::send::run(&ctx, &name, width, height, fps, frames)?,
        Commands::Receive { name, frames } => {
            commands::receive::run(&ctx, name.as_deref(), frames)?
        }
    }

    Ok(())
}
