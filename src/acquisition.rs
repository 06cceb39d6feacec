//! Producer side: acquire, encode, publish, recycle.

use std::ops::Deref;
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::capture::{AcquisitionBuffer, BufferStatus, FrameStream};
use crate::encode::FrameEncoder;
use crate::error::DeviceError;
use crate::output::FrameWriter;

/// Log throughput every this many published frames
const STATS_EVERY: u64 = 100;

/// Granularity of the cancellable settle wait
const SETTLE_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    Stopped,
}

/// Result of one loop iteration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// A frame was published with this sequence number
    Published(u64),
    Timeout,
    BadStatus,
    EncodeFailed,
    /// No buffer came out of the stream at all
    StreamError,
}

#[derive(Clone, Debug, Default)]
pub struct LoopStats {
    pub published: u64,
    pub timeouts: u64,
    pub bad_buffers: u64,
    pub encode_errors: u64,
    pub stream_errors: u64,
    pub encode_time: Duration,
}

impl LoopStats {
    pub fn avg_encode_ms(&self) -> f64 {
        if self.published == 0 {
            return 0.0;
        }
        self.encode_time.as_secs_f64() * 1000.0 / self.published as f64
    }
}

/// A buffer on loan from the stream, recycled when dropped.
struct Lease<'s> {
    stream: &'s mut dyn FrameStream,
    buffer: Option<AcquisitionBuffer>,
}

impl<'s> Lease<'s> {
    fn new(stream: &'s mut dyn FrameStream, buffer: AcquisitionBuffer) -> Self {
        Self {
            stream,
            buffer: Some(buffer),
        }
    }
}

impl Deref for Lease<'_> {
    type Target = AcquisitionBuffer;

    fn deref(&self) -> &AcquisitionBuffer {
        // Only taken in drop
        self.buffer.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.stream.recycle(buffer);
        }
    }
}

pub struct AcquisitionLoop {
    stream: Box<dyn FrameStream>,
    encoder: Box<dyn FrameEncoder>,
    writer: FrameWriter,
    timeout: Duration,
    settle: Duration,
    state: LoopState,
    stats: LoopStats,
}

impl AcquisitionLoop {
    pub fn new(
        stream: Box<dyn FrameStream>,
        encoder: Box<dyn FrameEncoder>,
        writer: FrameWriter,
        timeout: Duration,
    ) -> Self {
        Self {
            stream,
            encoder,
            writer,
            timeout,
            settle: Duration::ZERO,
            state: LoopState::Starting,
            stats: LoopStats::default(),
        }
    }

    /// Pause after starting acquisition before the first acquire
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Run until `cancel` fires. Only a failure to start acquisition is an
    /// error; per-frame problems are logged and skipped.
    pub fn run(&mut self, cancel: &CancellationToken) -> Result<(), DeviceError> {
        self.state = LoopState::Starting;
        if let Err(err) = self.stream.start() {
            self.state = LoopState::Stopped;
            return Err(err);
        }
        tracing::debug!("Acquisition started");

        let settle_until = Instant::now() + self.settle;
        while !cancel.is_cancelled() && Instant::now() < settle_until {
            thread::sleep(SETTLE_SLICE.min(settle_until.saturating_duration_since(Instant::now())));
        }

        self.state = LoopState::Running;
        while !cancel.is_cancelled() {
            self.step();
        }

        if let Err(err) = self.stream.stop() {
            tracing::warn!("Failed to stop acquisition: {}", err);
        }
        self.state = LoopState::Stopped;
        tracing::info!(
            "Acquisition stopped: published={}, timeouts={}, bad={}, encode_errors={}",
            self.stats.published,
            self.stats.timeouts,
            self.stats.bad_buffers,
            self.stats.encode_errors
        );
        Ok(())
    }

    /// One acquire / encode / publish / recycle cycle.
    pub fn step(&mut self) -> Step {
        let (buffer, status) = match self.stream.acquire_next(self.timeout) {
            Ok(acquired) => acquired,
            Err(err) => {
                self.stats.stream_errors += 1;
                tracing::warn!("Acquire failed: {}", err);
                // Nothing to recycle; avoid spinning on a dead stream
                thread::sleep(self.timeout);
                return Step::StreamError;
            }
        };
        let lease = Lease::new(self.stream.as_mut(), buffer);

        match status {
            BufferStatus::Success => {}
            BufferStatus::Timeout => {
                self.stats.timeouts += 1;
                tracing::debug!("Acquire timed out after {:?}", self.timeout);
                return Step::Timeout;
            }
            BufferStatus::DeviceStatusError => {
                self.stats.bad_buffers += 1;
                tracing::debug!("Bad buffer status, frame dropped");
                return Step::BadStatus;
            }
        }

        let encode_start = Instant::now();
        let mut handle = self.writer.begin_write();
        let encoded = self.encoder.encode(&lease.frame(), &mut handle);
        drop(lease);

        match encoded {
            Ok(()) => {
                let sequence = handle.commit();
                self.stats.published += 1;
                self.stats.encode_time += encode_start.elapsed();
                if self.stats.published % STATS_EVERY == 0 {
                    tracing::info!(
                        "Frame {}: encode={:.1}ms, timeouts={}, bad={}, encode_errors={}",
                        sequence,
                        self.stats.avg_encode_ms(),
                        self.stats.timeouts,
                        self.stats.bad_buffers,
                        self.stats.encode_errors
                    );
                }
                Step::Published(sequence)
            }
            Err(err) => {
                drop(handle);
                self.stats.encode_errors += 1;
                tracing::warn!("Encode error, frame dropped: {}", err);
                Step::EncodeFailed
            }
        }
    }
}
