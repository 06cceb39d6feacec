//! Runtime exposure/gain changes requested over HTTP.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::capture::FrameSource;
use crate::error::{ControlError, DeviceError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parameter {
    Gain,
    Exposure,
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::Gain => write!(f, "Gain"),
            Parameter::Exposure => write!(f, "Exposure"),
        }
    }
}

/// Parameter values carried by one request
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ParameterRequest {
    pub gain_db: Option<f64>,
    pub exposure_us: Option<f64>,
}

impl ParameterRequest {
    /// Read `gain` and `exposure` from query parameters. Values that are
    /// missing, unparsable or not finite count as "no change".
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let parse = |key: &str| {
            query
                .get(key)
                .and_then(|raw| raw.trim().parse::<f64>().ok())
                .filter(|value| value.is_finite())
        };
        Self {
            gain_db: parse("gain"),
            exposure_us: parse("exposure"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gain_db.is_none() && self.exposure_us.is_none()
    }
}

struct DeviceState {
    source: Box<dyn FrameSource>,
    gain_db: f64,
    exposure_us: f64,
}

impl DeviceState {
    fn apply_if_changed(
        &mut self,
        parameter: Parameter,
        requested: f64,
    ) -> Result<f64, DeviceError> {
        let current = match parameter {
            Parameter::Gain => &mut self.gain_db,
            Parameter::Exposure => &mut self.exposure_us,
        };
        apply_if_changed(current, requested, |value| match parameter {
            Parameter::Gain => self.source.set_gain(value),
            Parameter::Exposure => self.source.set_exposure(value),
        })
    }
}

/// Issue `set` only when `requested` differs from `current`, and record the
/// new value once the device accepted it.
fn apply_if_changed(
    current: &mut f64,
    requested: f64,
    set: impl FnOnce(f64) -> Result<(), DeviceError>,
) -> Result<f64, DeviceError> {
    if *current == requested {
        return Ok(*current);
    }
    set(requested)?;
    *current = requested;
    Ok(requested)
}

/// Owns the device handle and the last values applied to it.
///
/// Every change goes through one lock, so concurrent requests apply their
/// parameters one after another and an identical value is never sent twice.
pub struct ParameterController {
    device: Mutex<DeviceState>,
}

impl ParameterController {
    pub fn new(source: Box<dyn FrameSource>, gain_db: f64, exposure_us: f64) -> Self {
        Self {
            device: Mutex::new(DeviceState {
                source,
                gain_db,
                exposure_us,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DeviceState>, ControlError> {
        self.device.lock().map_err(|_| ControlError::Poisoned)
    }

    /// Last value applied for `parameter`
    pub fn current(&self, parameter: Parameter) -> Result<f64, ControlError> {
        let device = self.lock()?;
        Ok(match parameter {
            Parameter::Gain => device.gain_db,
            Parameter::Exposure => device.exposure_us,
        })
    }

    pub fn apply_if_changed(&self, parameter: Parameter, requested: f64) -> Result<f64, ControlError> {
        let mut device = self.lock()?;
        let previous = match parameter {
            Parameter::Gain => device.gain_db,
            Parameter::Exposure => device.exposure_us,
        };
        let value = device.apply_if_changed(parameter, requested)?;
        if value != previous {
            tracing::info!("{}: {}", parameter, value);
        }
        Ok(value)
    }

    /// Apply everything a request asks for under a single lock hold.
    ///
    /// Device failures are logged and leave the recorded value unchanged;
    /// only a poisoned lock is returned as an error.
    pub fn apply(&self, request: &ParameterRequest) -> Result<(), ControlError> {
        if request.is_empty() {
            return Ok(());
        }
        let mut device = self.lock()?;
        let changes = [
            (Parameter::Gain, request.gain_db),
            (Parameter::Exposure, request.exposure_us),
        ];
        for (parameter, requested) in changes {
            let Some(requested) = requested else {
                continue;
            };
            let previous = match parameter {
                Parameter::Gain => device.gain_db,
                Parameter::Exposure => device.exposure_us,
            };
            match device.apply_if_changed(parameter, requested) {
                Ok(value) if value != previous => tracing::info!("{}: {}", parameter, value),
                Ok(_) => {}
                Err(err) => tracing::warn!("Failed to set {} to {}: {}", parameter, requested, err),
            }
        }
        Ok(())
    }

    /// Release the device handle
    pub fn close(&self) -> Result<(), ControlError> {
        let mut device = self.lock()?;
        device.source.close()?;
        Ok(())
    }
}
