use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::Duration;

use v4l::buffer::{Flags, Metadata, Type};
use v4l::control::{Control, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use super::{
    AcquisitionBuffer, AcquisitionMode, BufferStatus, DeviceInfo, DeviceSettings, ExposureMode,
    FrameSource, FrameStream, Geometry, Region,
};
use crate::error::DeviceError;

const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const V4L2_CID_GAIN: u32 = 0x0098_0913;
const V4L2_EXPOSURE_MANUAL: i64 = 1;
const V4L2_EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// Kernel-side mmap buffers behind the stream
const KERNEL_BUFFERS: u32 = 4;

const GREY: &[u8; 4] = b"GREY";

/// Wait for the first frame when turning streaming on
const START_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed dequeue so a broken stream does not spin
const FAILURE_BACKOFF: Duration = Duration::from_millis(50);

const FAILURE_LOG_EVERY: u32 = 100;

const EINVAL: i32 = 22;

pub(super) fn enumerate() -> Vec<DeviceInfo> {
    v4l::context::enum_devices()
        .into_iter()
        .map(|node| DeviceInfo {
            id: node.path().display().to_string(),
            name: node
                .name()
                .unwrap_or_else(|| format!("video{}", node.index())),
        })
        .collect()
}

/// Video4Linux camera delivering 8-bit grayscale frames
pub struct V4lSource {
    id: String,
    device: Option<Device>,
    sensor: (u32, u32),
    region: Region,
    stride: u32,
}

impl V4lSource {
    /// Open by `/dev/videoN` path or bare index
    pub fn open(id: &str) -> Result<Self, DeviceError> {
        tracing::info!("Opening v4l2 device {}", id);

        let device = match id.parse::<usize>() {
            Ok(index) => Device::new(index),
            Err(_) => Device::with_path(id),
        }
        .map_err(|source| DeviceError::Open {
            id: id.to_string(),
            source,
        })?;

        let sensor = probe_sensor_size(&device).map_err(|source| DeviceError::Open {
            id: id.to_string(),
            source,
        })?;

        if let Ok(caps) = device.query_caps() {
            tracing::debug!("{}: {} ({})", id, caps.card, caps.driver);
        }

        Ok(Self {
            id: id.to_string(),
            device: Some(device),
            sensor,
            region: Region::full(sensor.0, sensor.1),
            stride: sensor.0,
        })
    }

    fn device(&self) -> Result<&Device, DeviceError> {
        self.device.as_ref().ok_or(DeviceError::Closed)
    }

    fn set_control(&self, id: u32, value: i64) -> io::Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device closed"))?;
        device.set_control(Control {
            id,
            value: Value::Integer(value),
        })
    }
}

/// Largest GREY frame the device advertises, or its current format if it
/// does not enumerate sizes.
fn probe_sensor_size(device: &Device) -> io::Result<(u32, u32)> {
    let largest = device
        .enum_framesizes(FourCC::new(GREY))
        .unwrap_or_default()
        .into_iter()
        .map(|size| match size.size {
            FrameSizeEnum::Discrete(d) => (d.width, d.height),
            FrameSizeEnum::Stepwise(s) => (s.max_width, s.max_height),
        })
        .max_by_key(|(w, h)| u64::from(*w) * u64::from(*h));

    match largest {
        Some(size) => Ok(size),
        None => {
            let format = device.format()?;
            Ok((format.width, format.height))
        }
    }
}

/// UVC exposure is expressed in 100 µs units
fn exposure_units(exposure_us: f64) -> i64 {
    ((exposure_us / 100.0).round() as i64).max(1)
}

fn gain_units(gain_db: f64) -> i64 {
    gain_db.round().max(0.0) as i64
}

impl FrameSource for V4lSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn sensor_size(&self) -> (u32, u32) {
        self.sensor
    }

    fn configure(&mut self, settings: &DeviceSettings) -> Result<Geometry, DeviceError> {
        if settings.acquisition_mode != AcquisitionMode::Continuous {
            return Err(DeviceError::Unsupported(format!(
                "{:?} acquisition on v4l2",
                settings.acquisition_mode
            )));
        }

        let device = self.device()?;
        let requested = Format::new(self.sensor.0, self.sensor.1, FourCC::new(GREY));
        let format = device
            .set_format(&requested)
            .map_err(|source| DeviceError::Configure {
                setting: "format",
                source,
            })?;
        if format.fourcc != FourCC::new(GREY) {
            return Err(DeviceError::Unsupported(format!(
                "pixel format {} (need GREY)",
                format.fourcc
            )));
        }
        if !settings.region.fits((format.width, format.height)) {
            return Err(DeviceError::Unsupported(format!(
                "region {:?} outside {}x{} frame",
                settings.region, format.width, format.height
            )));
        }

        if settings.frame_rate > 0 {
            device
                .set_params(&Parameters::with_fps(settings.frame_rate))
                .map_err(|source| DeviceError::Configure {
                    setting: "frame rate",
                    source,
                })?;
        }

        let exposure_mode = match settings.exposure_mode {
            ExposureMode::Manual => V4L2_EXPOSURE_MANUAL,
            ExposureMode::Auto => V4L2_EXPOSURE_APERTURE_PRIORITY,
        };
        self.set_control(V4L2_CID_EXPOSURE_AUTO, exposure_mode)
            .map_err(|source| DeviceError::Configure {
                setting: "exposure mode",
                source,
            })?;
        if settings.exposure_mode == ExposureMode::Manual {
            self.set_control(V4L2_CID_EXPOSURE_ABSOLUTE, exposure_units(settings.exposure_us))
                .map_err(|source| DeviceError::Configure {
                    setting: "exposure",
                    source,
                })?;
        }
        self.set_control(V4L2_CID_GAIN, gain_units(settings.gain_db))
            .map_err(|source| DeviceError::Configure {
                setting: "gain",
                source,
            })?;

        self.stride = if format.stride > 0 {
            format.stride
        } else {
            format.width
        };
        self.region = settings.region;

        Ok(Geometry {
            width: self.region.width,
            height: self.region.height,
            payload_size: self.region.width as usize * self.region.height as usize,
        })
    }

    fn create_stream(&mut self) -> Result<Box<dyn FrameStream>, DeviceError> {
        let device = self.device()?;
        let stream = MmapStream::with_buffers(device, Type::VideoCapture, KERNEL_BUFFERS)
            .map_err(DeviceError::Stream)?;

        Ok(Box::new(V4lStream::new(stream, self.region, self.stride)))
    }

    fn set_exposure(&mut self, exposure_us: f64) -> Result<(), DeviceError> {
        self.device()?;
        self.set_control(V4L2_CID_EXPOSURE_ABSOLUTE, exposure_units(exposure_us))
            .map_err(|source| DeviceError::Configure {
                setting: "exposure",
                source,
            })
    }

    fn set_gain(&mut self, gain_db: f64) -> Result<(), DeviceError> {
        self.device()?;
        self.set_control(V4L2_CID_GAIN, gain_units(gain_db))
            .map_err(|source| DeviceError::Configure {
                setting: "gain",
                source,
            })
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.device.take().is_some() {
            tracing::info!("Closed v4l2 device {}", self.id);
        }
        Ok(())
    }
}

/// The calls the capture path makes on a kernel buffer queue.
///
/// `next` follows `v4l`'s mmap stream: it hands back the buffer returned by
/// the previous call before waiting for the next filled one, and queues every
/// buffer and turns streaming on the first time.
trait KernelQueue: Send {
    fn set_timeout(&mut self, timeout: Duration);

    fn next(&mut self) -> io::Result<(&[u8], Metadata)>;

    /// Take one filled buffer off the driver without handing one back
    fn dequeue(&mut self) -> io::Result<()>;

    fn stop(&mut self) -> io::Result<()>;
}

impl KernelQueue for MmapStream<'static> {
    fn set_timeout(&mut self, timeout: Duration) {
        MmapStream::set_timeout(self, timeout);
    }

    fn next(&mut self) -> io::Result<(&[u8], Metadata)> {
        let (data, meta) = CaptureStream::next(self)?;
        Ok((data, *meta))
    }

    fn dequeue(&mut self) -> io::Result<()> {
        CaptureStream::dequeue(self).map(|_| ())
    }

    fn stop(&mut self) -> io::Result<()> {
        Stream::stop(self)
    }
}

/// Copies each dequeued kernel buffer into a pooled [`AcquisitionBuffer`].
///
/// The kernel buffer goes back to the driver on the following dequeue, the
/// pooled buffer when the caller recycles it.
struct V4lStream<Q> {
    queue: Q,
    pool: VecDeque<AcquisitionBuffer>,
    region: Region,
    stride: u32,
    running: bool,
    /// Every kernel buffer is queued in the driver, so the next fetch must
    /// dequeue before anything can be handed back.
    driver_holds_all: bool,
    failures: u32,
}

impl<Q: KernelQueue> V4lStream<Q> {
    fn new(queue: Q, region: Region, stride: u32) -> Self {
        Self {
            queue,
            pool: VecDeque::new(),
            region,
            stride,
            running: false,
            driver_holds_all: false,
            failures: 0,
        }
    }

    fn fetch(&mut self, buffer: &mut AcquisitionBuffer, timeout: Duration) -> BufferStatus {
        if self.driver_holds_all {
            // Its contents are not reachable through the mmap stream; it is
            // handed back by the `next` below.
            if let Err(err) = self.queue.dequeue() {
                return self.failed(err, timeout);
            }
            self.driver_holds_all = false;
        }

        let (region, stride) = (self.region, self.stride);
        let fetched = match self.queue.next() {
            Ok((_, meta)) if meta.flags.contains(Flags::ERROR) => {
                tracing::debug!("Buffer {} flagged by driver", meta.sequence);
                Ok(BufferStatus::DeviceStatusError)
            }
            Ok((data, meta)) => Ok(copy_region(
                data,
                meta.bytesused as usize,
                region,
                stride,
                buffer,
            )),
            Err(err) => Err(err),
        };
        match fetched {
            Ok(status) => {
                self.failures = 0;
                status
            }
            Err(err) => self.failed(err, timeout),
        }
    }

    fn failed(&mut self, err: io::Error, timeout: Duration) -> BufferStatus {
        if err.kind() == io::ErrorKind::TimedOut {
            // The buffer handed back before the wait stays queued
            self.driver_holds_all = true;
            self.failures = 0;
            return BufferStatus::Timeout;
        }
        if err.raw_os_error() == Some(EINVAL) {
            // Queueing a buffer the driver already holds
            self.driver_holds_all = true;
        }

        self.failures += 1;
        if self.failures == 1 || self.failures % FAILURE_LOG_EVERY == 0 {
            tracing::warn!("Dequeue failed ({} in a row): {}", self.failures, err);
        }
        thread::sleep(FAILURE_BACKOFF.min(timeout));
        BufferStatus::DeviceStatusError
    }
}

/// Copy the region of interest out of a strided frame.
fn copy_region(
    data: &[u8],
    bytes_used: usize,
    region: Region,
    stride: u32,
    buffer: &mut AcquisitionBuffer,
) -> BufferStatus {
    let data = &data[..bytes_used.min(data.len())];
    let Some(pixels) = buffer.prepare(region.width, region.height) else {
        return BufferStatus::DeviceStatusError;
    };
    let width = region.width as usize;
    for (row, line) in pixels.chunks_mut(width).enumerate() {
        let start = (region.y as usize + row) * stride as usize + region.x as usize;
        match data.get(start..start + width) {
            Some(src) => line.copy_from_slice(src),
            None => return BufferStatus::DeviceStatusError,
        }
    }
    BufferStatus::Success
}

impl<Q: KernelQueue> FrameStream for V4lStream<Q> {
    fn push_buffer(&mut self, mut buffer: AcquisitionBuffer) {
        buffer.clear();
        self.pool.push_back(buffer);
    }

    /// Queue the kernel buffers and turn streaming on. The first frame is
    /// waited for and dropped; a failure other than a timeout is returned.
    fn start(&mut self) -> Result<(), DeviceError> {
        self.queue.set_timeout(START_TIMEOUT);
        match self.queue.next() {
            Ok(_) => self.driver_holds_all = false,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                tracing::debug!("No frame within {:?} of stream start", START_TIMEOUT);
                self.driver_holds_all = true;
            }
            Err(err) => return Err(DeviceError::Stream(err)),
        }
        self.failures = 0;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        // Streaming off returns every kernel buffer; the next start queues them again
        self.driver_holds_all = false;
        self.queue.stop().map_err(DeviceError::Stream)
    }

    fn acquire_next(
        &mut self,
        timeout: Duration,
    ) -> Result<(AcquisitionBuffer, BufferStatus), DeviceError> {
        if !self.running {
            return Err(DeviceError::Stream(io::Error::new(
                io::ErrorKind::NotConnected,
                "acquisition not started",
            )));
        }
        let mut buffer = self.pool.pop_front().ok_or(DeviceError::Starved)?;

        self.queue.set_timeout(timeout);
        let status = self.fetch(&mut buffer, timeout);
        Ok((buffer, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(5);

    #[derive(Clone, Copy)]
    enum Dequeue {
        Frame,
        Timeout,
        Fail,
    }

    /// Kernel queue with the mmap stream's hand-back rules: a buffer the
    /// driver already holds cannot be queued again.
    struct DriverModel {
        frame: Vec<u8>,
        queued: Vec<bool>,
        last: usize,
        active: bool,
        refuse_streamon: bool,
        stopped: bool,
        script: VecDeque<Dequeue>,
    }

    impl DriverModel {
        fn new(script: impl IntoIterator<Item = Dequeue>) -> Self {
            Self {
                frame: (0..16).collect(),
                queued: vec![false; 3],
                last: 0,
                active: false,
                refuse_streamon: false,
                stopped: false,
                script: script.into_iter().collect(),
            }
        }

        fn queue(&mut self, index: usize) -> io::Result<()> {
            if self.queued[index] {
                return Err(io::Error::from_raw_os_error(EINVAL));
            }
            self.queued[index] = true;
            Ok(())
        }

        fn take(&mut self) -> io::Result<usize> {
            let timed_out = || io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF");
            match self.script.pop_front().unwrap_or(Dequeue::Timeout) {
                Dequeue::Timeout => Err(timed_out()),
                Dequeue::Fail => Err(io::Error::from_raw_os_error(5)),
                Dequeue::Frame => {
                    let index = self.queued.iter().position(|&q| q).ok_or_else(timed_out)?;
                    self.queued[index] = false;
                    self.last = index;
                    Ok(index)
                }
            }
        }
    }

    impl KernelQueue for DriverModel {
        fn set_timeout(&mut self, _timeout: Duration) {}

        fn next(&mut self) -> io::Result<(&[u8], Metadata)> {
            if self.active {
                self.queue(self.last)?;
            } else {
                for index in 0..self.queued.len() {
                    self.queue(index)?;
                }
                if self.refuse_streamon {
                    return Err(io::Error::from_raw_os_error(16));
                }
                self.active = true;
            }
            self.take()?;
            let meta = Metadata {
                bytesused: self.frame.len() as u32,
                ..Metadata::default()
            };
            Ok((self.frame.as_slice(), meta))
        }

        fn dequeue(&mut self) -> io::Result<()> {
            self.take().map(|_| ())
        }

        fn stop(&mut self) -> io::Result<()> {
            self.active = false;
            self.queued.fill(false);
            self.stopped = true;
            Ok(())
        }
    }

    fn stream(model: DriverModel) -> V4lStream<DriverModel> {
        let mut stream = V4lStream::new(model, Region::full(4, 4), 4);
        stream.allocate_buffers(2, 16);
        stream
    }

    fn acquire(stream: &mut V4lStream<DriverModel>) -> BufferStatus {
        let (buffer, status) = stream.acquire_next(TIMEOUT).unwrap();
        stream.recycle(buffer);
        status
    }

    #[test]
    fn frames_resume_after_a_timeout() {
        use Dequeue::*;
        let mut stream = stream(DriverModel::new([Frame, Timeout, Frame, Frame, Frame]));
        stream.start().unwrap();

        assert_eq!(acquire(&mut stream), BufferStatus::Timeout);
        assert_eq!(acquire(&mut stream), BufferStatus::Success);
        assert_eq!(acquire(&mut stream), BufferStatus::Success);
    }

    #[test]
    fn timeout_streak_ends_with_the_next_frame() {
        use Dequeue::*;
        let mut stream = stream(DriverModel::new([
            Frame, Timeout, Timeout, Timeout, Frame, Frame,
        ]));
        stream.start().unwrap();

        for _ in 0..3 {
            assert_eq!(acquire(&mut stream), BufferStatus::Timeout);
        }
        let (buffer, status) = stream.acquire_next(TIMEOUT).unwrap();
        assert_eq!(status, BufferStatus::Success);
        assert_eq!(buffer.frame().pixels, &(0..16).collect::<Vec<u8>>()[..]);
    }

    #[test]
    fn rejected_hand_back_recovers() {
        use Dequeue::*;
        // The failed dequeue leaves the handed-back buffer with the driver
        let mut stream = stream(DriverModel::new([Frame, Fail, Frame, Frame]));
        stream.start().unwrap();

        assert_eq!(acquire(&mut stream), BufferStatus::DeviceStatusError);
        assert_eq!(acquire(&mut stream), BufferStatus::DeviceStatusError);
        assert_eq!(acquire(&mut stream), BufferStatus::Success);
    }

    #[test]
    fn stream_on_failure_is_returned_from_start() {
        let mut model = DriverModel::new([Dequeue::Frame]);
        model.refuse_streamon = true;
        let mut stream = stream(model);

        assert!(matches!(stream.start(), Err(DeviceError::Stream(_))));
        assert!(stream.acquire_next(TIMEOUT).is_err());
    }

    #[test]
    fn start_without_a_first_frame_still_streams() {
        use Dequeue::*;
        let mut stream = stream(DriverModel::new([Timeout, Frame, Frame]));
        stream.start().unwrap();
        assert_eq!(acquire(&mut stream), BufferStatus::Success);

        stream.stop().unwrap();
        assert!(stream.queue.stopped);
        assert!(stream.acquire_next(TIMEOUT).is_err());

        // Streaming off returned every buffer, so a restart queues them all again
        stream.queue.script.extend([Frame, Frame]);
        stream.start().unwrap();
        assert_eq!(acquire(&mut stream), BufferStatus::Success);
    }

    #[test]
    fn exposure_is_sent_in_hundred_microsecond_units() {
        assert_eq!(exposure_units(10_000.0), 100);
        assert_eq!(exposure_units(103_656.0), 1037);
        assert_eq!(exposure_units(0.0), 1);
    }

    #[test]
    fn gain_is_rounded_and_non_negative() {
        assert_eq!(gain_units(10.000_000_15), 10);
        assert_eq!(gain_units(-3.0), 0);
    }

    #[test]
    fn copy_region_honours_stride_and_offset() {
        // 4x3 frame with 6-byte stride, pixel value = row * 10 + col
        let mut data = vec![0u8; 18];
        for row in 0..3 {
            for col in 0..4 {
                data[row * 6 + col] = (row * 10 + col) as u8;
            }
        }
        let region = Region {
            x: 1,
            y: 1,
            width: 2,
            height: 2,
        };
        let mut buffer = AcquisitionBuffer::new(4);
        let status = copy_region(&data, data.len(), region, 6, &mut buffer);
        assert_eq!(status, BufferStatus::Success);
        assert_eq!(buffer.frame().pixels, &[11, 12, 21, 22]);
    }

    #[test]
    fn short_buffers_are_reported_as_bad() {
        let data = vec![0u8; 10];
        let mut buffer = AcquisitionBuffer::new(16);
        let status = copy_region(&data, data.len(), Region::full(4, 4), 4, &mut buffer);
        assert_eq!(status, BufferStatus::DeviceStatusError);
    }
}
