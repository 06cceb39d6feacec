//! Synthetic frame source for `stub://` device ids.
//!
//! Produces a moving gray gradient at the configured region size and keeps
//! counters of every device call, so the acquisition and control paths can be
//! exercised without hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::{
    AcquisitionBuffer, AcquisitionMode, BufferStatus, DeviceSettings, FrameSource, FrameStream,
    Geometry, Region,
};
use crate::error::DeviceError;

pub(crate) const SCHEME: &str = "stub://";

const DEFAULT_SIZE: (u32, u32) = (640, 480);

/// Scripted result of one `acquire_next` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Frame,
    Timeout,
    BadStatus,
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<Outcome>>,
    acquired: AtomicUsize,
    recycled: AtomicUsize,
    queued: AtomicUsize,
    frames: AtomicUsize,
    started: AtomicBool,
    stopped: AtomicBool,
    closed: AtomicBool,
    fail_parameters: AtomicBool,
    fail_start: AtomicBool,
    gain_calls: Mutex<Vec<f64>>,
    exposure_calls: Mutex<Vec<f64>>,
}

/// Read-only view of a synthetic device's call counters.
#[derive(Clone)]
pub struct SyntheticProbe {
    shared: Arc<Shared>,
}

impl SyntheticProbe {
    /// Buffers handed out by `acquire_next`, whatever their status
    pub fn acquired(&self) -> usize {
        self.shared.acquired.load(Ordering::SeqCst)
    }

    pub fn recycled(&self) -> usize {
        self.shared.recycled.load(Ordering::SeqCst)
    }

    /// Buffers currently owned by the device
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Buffers acquired and not yet recycled
    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.recycled())
    }

    /// Successful frames generated so far
    pub fn frames(&self) -> usize {
        self.shared.frames.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn gain_calls(&self) -> Vec<f64> {
        lock(&self.shared.gain_calls).clone()
    }

    pub fn exposure_calls(&self) -> Vec<f64> {
        lock(&self.shared.exposure_calls).clone()
    }

    /// Queue outcomes for upcoming acquisitions; frames follow once drained
    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        lock(&self.shared.script).extend(outcomes);
    }

    /// Make `start` fail until switched back
    pub fn fail_start(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make parameter calls fail until switched back
    pub fn fail_parameters(&self, fail: bool) {
        self.shared.fail_parameters.store(fail, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SyntheticSource {
    id: String,
    sensor: (u32, u32),
    settings: Option<DeviceSettings>,
    shared: Arc<Shared>,
}

impl SyntheticSource {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            sensor: (width, height),
            settings: None,
            shared: Arc::default(),
        }
    }

    /// Parse `stub://WIDTHxHEIGHT`; any other name gets 640x480.
    pub fn from_id(id: &str) -> Result<Self, DeviceError> {
        let name = id.strip_prefix(SCHEME).unwrap_or(id);
        let (width, height) = match name.split_once('x') {
            Some((w, h)) => match (w.parse::<u32>(), h.parse::<u32>()) {
                (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
                _ => return Err(DeviceError::Unsupported(format!("synthetic size {name:?}"))),
            },
            None => DEFAULT_SIZE,
        };
        Ok(Self::new(id, width, height))
    }

    pub fn probe(&self) -> SyntheticProbe {
        SyntheticProbe {
            shared: self.shared.clone(),
        }
    }

    fn region(&self) -> Region {
        self.settings
            .as_ref()
            .map(|s| s.region)
            .unwrap_or_else(|| Region::full(self.sensor.0, self.sensor.1))
    }

    fn check_open(&self) -> Result<(), DeviceError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed);
        }
        Ok(())
    }

    fn parameter_call(&self, calls: &Mutex<Vec<f64>>, value: f64) -> Result<(), DeviceError> {
        self.check_open()?;
        lock(calls).push(value);
        if self.shared.fail_parameters.load(Ordering::SeqCst) {
            return Err(DeviceError::Unsupported("parameter rejected by device".into()));
        }
        Ok(())
    }
}

impl FrameSource for SyntheticSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn sensor_size(&self) -> (u32, u32) {
        self.sensor
    }

    fn configure(&mut self, settings: &DeviceSettings) -> Result<Geometry, DeviceError> {
        self.check_open()?;
        if !settings.region.fits(self.sensor) {
            return Err(DeviceError::Unsupported(format!(
                "region {:?} outside {}x{} sensor",
                settings.region, self.sensor.0, self.sensor.1
            )));
        }
        self.settings = Some(settings.clone());
        let region = settings.region;
        Ok(Geometry {
            width: region.width,
            height: region.height,
            payload_size: region.width as usize * region.height as usize,
        })
    }

    fn create_stream(&mut self) -> Result<Box<dyn FrameStream>, DeviceError> {
        self.check_open()?;
        let region = self.region();
        let (mode, frame_rate) = self
            .settings
            .as_ref()
            .map(|s| (s.acquisition_mode, s.frame_rate))
            .unwrap_or((AcquisitionMode::Continuous, 0));
        let interval = (frame_rate > 0).then(|| Duration::from_secs_f64(1.0 / frame_rate as f64));

        Ok(Box::new(SyntheticStream {
            width: region.width,
            height: region.height,
            mode,
            interval,
            queue: VecDeque::new(),
            running: false,
            sequence: 0,
            shared: self.shared.clone(),
        }))
    }

    fn set_exposure(&mut self, exposure_us: f64) -> Result<(), DeviceError> {
        self.parameter_call(&self.shared.exposure_calls, exposure_us)
    }

    fn set_gain(&mut self, gain_db: f64) -> Result<(), DeviceError> {
        self.parameter_call(&self.shared.gain_calls, gain_db)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct SyntheticStream {
    width: u32,
    height: u32,
    mode: AcquisitionMode,
    interval: Option<Duration>,
    queue: VecDeque<AcquisitionBuffer>,
    running: bool,
    sequence: u64,
    shared: Arc<Shared>,
}

impl SyntheticStream {
    fn next_outcome(&mut self) -> Outcome {
        if let Some(outcome) = lock(&self.shared.script).pop_front() {
            return outcome;
        }
        if self.mode == AcquisitionMode::SingleFrame && self.sequence > 0 {
            Outcome::Timeout
        } else {
            Outcome::Frame
        }
    }

    fn render(&mut self, buffer: &mut AcquisitionBuffer) -> BufferStatus {
        let (width, height) = (self.width, self.height);
        let shift = self.sequence;
        let Some(pixels) = buffer.prepare(width, height) else {
            return BufferStatus::DeviceStatusError;
        };
        for (row, line) in pixels.chunks_mut(width as usize).enumerate() {
            for (col, pixel) in line.iter_mut().enumerate() {
                *pixel = ((col as u64 + row as u64 + shift) % 256) as u8;
            }
        }
        self.sequence += 1;
        self.shared.frames.fetch_add(1, Ordering::SeqCst);
        BufferStatus::Success
    }
}

impl FrameStream for SyntheticStream {
    fn push_buffer(&mut self, mut buffer: AcquisitionBuffer) {
        buffer.clear();
        self.queue.push_back(buffer);
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if self.shared.fail_start.load(Ordering::SeqCst) {
            return Err(DeviceError::Stream(std::io::Error::new(
                std::io::ErrorKind::Other,
                "acquisition refused to start",
            )));
        }
        self.running = true;
        self.shared.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.running = false;
        self.shared.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn acquire_next(
        &mut self,
        timeout: Duration,
    ) -> Result<(AcquisitionBuffer, BufferStatus), DeviceError> {
        if !self.running {
            return Err(DeviceError::Stream(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "acquisition not started",
            )));
        }
        let mut buffer = self.queue.pop_front().ok_or(DeviceError::Starved)?;
        self.shared.queued.fetch_sub(1, Ordering::SeqCst);
        self.shared.acquired.fetch_add(1, Ordering::SeqCst);

        let status = match self.next_outcome() {
            Outcome::Frame => {
                if let Some(interval) = self.interval {
                    thread::sleep(interval.min(timeout));
                }
                self.render(&mut buffer)
            }
            Outcome::Timeout => {
                thread::sleep(timeout);
                BufferStatus::Timeout
            }
            Outcome::BadStatus => BufferStatus::DeviceStatusError,
        };
        Ok((buffer, status))
    }

    fn recycle(&mut self, buffer: AcquisitionBuffer) {
        self.shared.recycled.fetch_add(1, Ordering::SeqCst);
        self.push_buffer(buffer);
    }
}
