mod buffer;
mod synthetic;
mod v4l_capture;

pub use buffer::{AcquisitionBuffer, Frame};
pub use synthetic::{Outcome, SyntheticProbe, SyntheticSource};
pub use v4l_capture::V4lSource;

use std::time::Duration;

use crate::error::DeviceError;

/// Rectangular part of the sensor being read out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Whether the region lies completely inside a sensor of the given size.
    pub fn fits(&self, sensor: (u32, u32)) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.saturating_add(self.width) <= sensor.0
            && self.y.saturating_add(self.height) <= sensor.1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExposureMode {
    Manual,
    Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionMode {
    Continuous,
    SingleFrame,
}

/// Settings applied once before streaming starts.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSettings {
    pub region: Region,
    pub exposure_mode: ExposureMode,
    /// Microseconds
    pub exposure_us: f64,
    /// Decibels
    pub gain_db: f64,
    /// Frames per second, 0 for unconstrained
    pub frame_rate: u32,
    pub acquisition_mode: AcquisitionMode,
}

/// What the device reports back after configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    /// Bytes needed to hold one frame.
    pub payload_size: usize,
}

/// State of a buffer handed out by [`FrameStream::acquire_next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    Success,
    Timeout,
    /// The device delivered the buffer but flagged its content as bad.
    DeviceStatusError,
}

/// An enumerated device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
}

/// Trait for camera devices
///
/// The source keeps the device handle and its runtime parameters. Frames are
/// pulled from a separate [`FrameStream`] so the producer never has to share
/// the source with parameter updates.
pub trait FrameSource: Send {
    fn id(&self) -> &str;

    /// Largest region the sensor can read out
    fn sensor_size(&self) -> (u32, u32);

    /// Apply startup settings and return the effective geometry
    fn configure(&mut self, settings: &DeviceSettings) -> Result<Geometry, DeviceError>;

    /// Create the stream frames are acquired from
    fn create_stream(&mut self) -> Result<Box<dyn FrameStream>, DeviceError>;

    fn set_exposure(&mut self, exposure_us: f64) -> Result<(), DeviceError>;

    fn set_gain(&mut self, gain_db: f64) -> Result<(), DeviceError>;

    /// Release the device handle
    fn close(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Trait for the buffer hand-off between a device and its reader
///
/// Buffers pushed into the stream belong to the device until returned by
/// `acquire_next`; after that they belong to the caller until recycled.
pub trait FrameStream: Send {
    /// Give a buffer to the device
    fn push_buffer(&mut self, buffer: AcquisitionBuffer);

    fn start(&mut self) -> Result<(), DeviceError>;

    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for the next filled buffer
    ///
    /// A buffer comes back for every status, including `Timeout`, and must be
    /// recycled by the caller. `Err` means no buffer left the stream.
    fn acquire_next(
        &mut self,
        timeout: Duration,
    ) -> Result<(AcquisitionBuffer, BufferStatus), DeviceError>;

    /// Return a buffer to the device once its contents are consumed
    fn recycle(&mut self, buffer: AcquisitionBuffer) {
        self.push_buffer(buffer);
    }

    /// Seed the stream with `count` buffers of `payload_size` bytes
    fn allocate_buffers(&mut self, count: usize, payload_size: usize) {
        for _ in 0..count {
            self.push_buffer(AcquisitionBuffer::new(payload_size));
        }
    }
}

/// List every capture device visible to the process.
pub fn list_devices() -> Vec<DeviceInfo> {
    v4l_capture::enumerate()
}

/// Open a device by id
///
/// Ids starting with `stub://` open a [`SyntheticSource`]; anything else is
/// handed to Video4Linux (`/dev/videoN` path or bare index).
pub fn open_device(id: &str) -> Result<Box<dyn FrameSource>, DeviceError> {
    if id.starts_with(synthetic::SCHEME) {
        return Ok(Box::new(SyntheticSource::from_id(id)?));
    }
    Ok(Box::new(V4lSource::open(id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_region_fits_its_sensor() {
        let region = Region::full(640, 480);
        assert!(region.fits((640, 480)));
        assert!(!region.fits((320, 240)));
    }

    #[test]
    fn offset_region_must_stay_inside() {
        let region = Region {
            x: 100,
            y: 100,
            width: 600,
            height: 100,
        };
        assert!(!region.fits((640, 480)));
        assert!(Region { width: 540, ..region }.fits((640, 480)));
        assert!(!Region { width: 0, ..region }.fits((640, 480)));
    }

    #[test]
    fn stub_ids_open_synthetic_sources() {
        let source = open_device("stub://640x480").unwrap();
        assert_eq!(source.id(), "stub://640x480");
        assert_eq!(source.sensor_size(), (640, 480));
    }
}
