mod jpeg;
mod png;

pub use self::jpeg::JpegFrameEncoder;
pub use self::png::PngFrameEncoder;

use crate::capture::Frame;
use crate::error::EncodeError;

/// Container format served to clients
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Png,
    Jpeg,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }
}

/// PNG compression effort
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Compression {
    Fast,
    Default,
    Best,
}

/// Trait for frame encoders
///
/// Called once per frame at the device's rate, so implementations write
/// into a caller-owned buffer whose capacity survives between frames.
pub trait FrameEncoder: Send {
    /// Encode `frame` into `out`, replacing its previous contents
    fn encode(&mut self, frame: &Frame<'_>, out: &mut Vec<u8>) -> Result<(), EncodeError>;

    fn format(&self) -> OutputFormat;
}

/// Build the encoder for a format.
pub fn encoder_for(
    format: OutputFormat,
    compression: Compression,
    jpeg_quality: u8,
) -> Box<dyn FrameEncoder> {
    match format {
        OutputFormat::Png => Box::new(PngFrameEncoder::new(compression)),
        OutputFormat::Jpeg => Box::new(JpegFrameEncoder::new(jpeg_quality)),
    }
}

/// Reject frames whose pixel count disagrees with their dimensions.
fn check_frame(frame: &Frame<'_>) -> Result<(), EncodeError> {
    let expected = frame.width as usize * frame.height as usize;
    if frame.is_empty() || frame.pixels.len() != expected {
        return Err(EncodeError::SizeMismatch {
            width: frame.width,
            height: frame.height,
            expected,
            actual: frame.pixels.len(),
        });
    }
    Ok(())
}
