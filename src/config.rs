//! Plain configuration values handed to the core at startup.

use std::net::SocketAddr;
use std::time::Duration;

use crate::capture::{AcquisitionMode, DeviceSettings, ExposureMode, Region};
use crate::encode::{Compression, OutputFormat};

/// Per-camera settings.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device id (path, index or `stub://` name). `None` picks the first device found.
    pub device: Option<String>,
    pub exposure_us: f64,
    pub gain_db: f64,
    /// 0 lets the device run as fast as it can.
    pub frame_rate: u32,
    pub buffers: usize,
    pub acquire_timeout: Duration,
    /// Pause between starting acquisition and the first acquire.
    pub settle: Duration,
    pub format: OutputFormat,
    pub compression: Compression,
    pub jpeg_quality: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: None,
            exposure_us: 103_656.0,
            gain_db: 10.000_000_15,
            frame_rate: 0,
            buffers: 2,
            acquire_timeout: Duration::from_secs(1),
            settle: Duration::from_secs(1),
            format: OutputFormat::Png,
            compression: Compression::Fast,
            jpeg_quality: 90,
        }
    }
}

impl CameraConfig {
    /// Device settings for a sensor of the given size: full-frame region,
    /// manual exposure, continuous acquisition.
    pub fn device_settings(&self, sensor: (u32, u32)) -> DeviceSettings {
        DeviceSettings {
            region: Region::full(sensor.0, sensor.1),
            exposure_mode: ExposureMode::Manual,
            exposure_us: self.exposure_us,
            gain_db: self.gain_db,
            frame_rate: self.frame_rate,
            acquisition_mode: AcquisitionMode::Continuous,
        }
    }
}

/// Everything the process needs besides the device itself.
#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub camera: CameraConfig,
    pub listen: SocketAddr,
    /// Bound on how long shutdown waits for in-flight work.
    pub grace: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            grace: Duration::from_secs(5),
        }
    }
}
