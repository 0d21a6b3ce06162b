// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StillpostError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("Queue error: {0}")]
    Queue(#[from] sqlx::Error),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GPIO error: {0}")]
    Gpio(String),
}

/// Failures local to a single frame grab. Counted, never retried here.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera '{name}' is disabled")]
    Disabled { name: String },

    #[error("camera unreachable: {0}")]
    Unreachable(String),

    #[error("frame grab timed out after {0:?}")]
    Timeout(Duration),

    #[error("no frame decoded: {0}")]
    DecodeFailed(String),

    #[error("frame grab tool '{0}' not found")]
    ToolMissing(String),
}

/// Per-item upload failures. `Http`/`Transport` are retriable; `Oversize`
/// and `MissingFile` are terminal.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("http {0}")]
    Http(u16),

    #[error("transport: {0}")]
    Transport(String),

    #[error("file exceeds upload limit ({0} bytes)")]
    Oversize(u64),

    #[error("backing file missing")]
    MissingFile,
}

pub type Result<T> = std::result::Result<T, StillpostError>;
