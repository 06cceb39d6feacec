use std::io;

use thiserror::Error;

/// Failures reported by a frame source or its stream.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No devices found")]
    NoDevices,

    #[error("Failed to open device {id}: {source}")]
    Open {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to configure {setting}: {source}")]
    Configure {
        setting: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Unsupported setting: {0}")]
    Unsupported(String),

    #[error("Stream error: {0}")]
    Stream(#[source] io::Error),

    /// Every acquisition buffer is outside the stream; nothing can be filled.
    #[error("Stream has no queued buffers")]
    Starved,

    #[error("Device is closed")]
    Closed,
}

/// Failures while turning a raw frame into an encoded payload.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Frame is {width}x{height} but carries {actual} bytes (expected {expected})")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Failures on the request-side parameter path.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Device lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Device(#[from] DeviceError),
}
