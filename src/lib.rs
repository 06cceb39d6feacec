//! Live camera feed served over HTTP as the most recent encoded frame.
//!
//! A producer thread pulls frames from the device, encodes them and
//! publishes the result; request handlers read whatever was published last.
//!
//! - `capture`: device traits, acquisition buffers, v4l2 and synthetic sources.
//! - `encode`: PNG/JPEG encoders.
//! - `output`: the double-buffered published frame.
//! - `acquisition`: the producer loop.
//! - `control`: exposure/gain changes requested by clients.
//! - `server`: axum routes.
//! - `lifecycle`: startup, signals and bounded shutdown.

pub mod acquisition;
pub mod camera;
pub mod capture;
pub mod config;
pub mod control;
pub mod encode;
pub mod error;
pub mod lifecycle;
pub mod output;
pub mod server;

pub use camera::{Camera, CameraHandle};
pub use config::{CameraConfig, ServeConfig};
pub use lifecycle::{Coordinator, Exit};
