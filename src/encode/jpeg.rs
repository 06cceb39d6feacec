use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use super::{check_frame, FrameEncoder, OutputFormat};
use crate::capture::Frame;
use crate::error::EncodeError;

/// Grayscale baseline JPEG encoder
pub struct JpegFrameEncoder {
    quality: u8,
}

impl JpegFrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&mut self, frame: &Frame<'_>, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        check_frame(frame)?;
        out.clear();
        JpegEncoder::new_with_quality(&mut *out, self.quality).write_image(
            frame.pixels,
            frame.width,
            frame.height,
            ExtendedColorType::L8,
        )?;
        Ok(())
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Jpeg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_decodable_jpeg() {
        let pixels = vec![128u8; 40 * 30];
        let frame = Frame {
            width: 40,
            height: 30,
            pixels: &pixels,
        };
        let mut out = Vec::new();
        JpegFrameEncoder::new(90).encode(&frame, &mut out).unwrap();

        assert_eq!(&out[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(JpegFrameEncoder::new(0).quality, 1);
        assert_eq!(JpegFrameEncoder::new(255).quality, 100);
    }
}
