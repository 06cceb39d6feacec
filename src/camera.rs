//! One camera instance: the device, its published frame and the producer.

use std::sync::Arc;

use crate::acquisition::AcquisitionLoop;
use crate::capture::{self, FrameSource, Geometry};
use crate::config::CameraConfig;
use crate::control::ParameterController;
use crate::encode::{self, OutputFormat};
use crate::error::DeviceError;
use crate::output::PublishedFrame;

/// A configured camera ready to stream
///
/// Everything the producer and the request handlers share lives here and is
/// handed out by [`Camera::split`]; nothing is global.
pub struct Camera {
    id: String,
    geometry: Geometry,
    acquisition: AcquisitionLoop,
    handle: CameraHandle,
}

/// The request-side half of a camera
#[derive(Clone)]
pub struct CameraHandle {
    pub index: usize,
    pub format: OutputFormat,
    pub controller: Arc<ParameterController>,
    pub published: Arc<PublishedFrame>,
}

impl CameraHandle {
    /// Route path serving this camera's frames, e.g. `/0.png`
    pub fn route(&self) -> String {
        format!("/{}.{}", self.index, self.format.extension())
    }
}

impl Camera {
    /// Open the configured device, or the first one found.
    pub fn open(config: &CameraConfig) -> Result<Self, DeviceError> {
        let id = match &config.device {
            Some(id) => id.clone(),
            None => {
                let devices = capture::list_devices();
                for device in &devices {
                    tracing::debug!("Found device {} ({})", device.id, device.name);
                }
                devices
                    .into_iter()
                    .next()
                    .map(|device| device.id)
                    .ok_or(DeviceError::NoDevices)?
            }
        };
        let source = capture::open_device(&id)?;
        Self::from_source(source, config)
    }

    /// Configure `source` and prepare its stream.
    pub fn from_source(
        mut source: Box<dyn FrameSource>,
        config: &CameraConfig,
    ) -> Result<Self, DeviceError> {
        let settings = config.device_settings(source.sensor_size());
        let geometry = source.configure(&settings)?;
        let id = source.id().to_string();

        tracing::info!(
            "Found camera: {} {}x{} Exposure: {}, Gain: {}",
            id,
            geometry.width,
            geometry.height,
            config.exposure_us,
            config.gain_db
        );

        let mut stream = source.create_stream()?;
        stream.allocate_buffers(config.buffers.max(1), geometry.payload_size);

        let (published, writer) = PublishedFrame::with_writer();
        let encoder = encode::encoder_for(config.format, config.compression, config.jpeg_quality);
        let acquisition = AcquisitionLoop::new(stream, encoder, writer, config.acquire_timeout)
            .with_settle(config.settle);

        let controller = Arc::new(ParameterController::new(
            source,
            config.gain_db,
            config.exposure_us,
        ));

        Ok(Self {
            id,
            geometry,
            acquisition,
            handle: CameraHandle {
                index: 0,
                format: config.format,
                controller,
                published,
            },
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn handle(&self) -> CameraHandle {
        self.handle.clone()
    }

    /// Separate the producer from the request-side handle.
    pub fn split(self) -> (AcquisitionLoop, CameraHandle) {
        (self.acquisition, self.handle)
    }
}
