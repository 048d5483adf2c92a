// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TexlinkError {
    #[error("Invalid sender name: {0}")]
    InvalidName(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Sender registry is full ({0} slots in use)")]
    RegistryFull(usize),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Shared state is corrupt: {0}")]
    Corrupt(String),

    #[error("Unsupported texture: {0}")]
    UnsupportedTexture(String),

    #[error("Shared handle could not be opened: {0}")]
    SharedHandle(String),

    #[error("Incompatible copy: {0}")]
    IncompatibleCopy(String),

    #[error("Texture is not CPU mappable: {0}")]
    NotMappable(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TexlinkError>;
