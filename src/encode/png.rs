use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};

use super::{check_frame, Compression, FrameEncoder, OutputFormat};
use crate::capture::Frame;
use crate::error::EncodeError;

/// Grayscale PNG encoder
pub struct PngFrameEncoder {
    compression: CompressionType,
    filter: FilterType,
}

impl PngFrameEncoder {
    pub fn new(compression: Compression) -> Self {
        let (compression, filter) = match compression {
            // Sub filtering is the cheapest filter that still helps on sensor noise
            Compression::Fast => (CompressionType::Fast, FilterType::Sub),
            Compression::Default => (CompressionType::Default, FilterType::Adaptive),
            Compression::Best => (CompressionType::Best, FilterType::Adaptive),
        };
        Self {
            compression,
            filter,
        }
    }
}

impl FrameEncoder for PngFrameEncoder {
    fn encode(&mut self, frame: &Frame<'_>, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        check_frame(frame)?;
        out.clear();
        PngEncoder::new_with_quality(&mut *out, self.compression, self.filter).write_image(
            frame.pixels,
            frame.width,
            frame.height,
            ExtendedColorType::L8,
        )?;
        Ok(())
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Png
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        (0..width * height).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn encodes_decodable_grayscale_png() {
        let pixels = gradient(64, 48);
        let frame = Frame {
            width: 64,
            height: 48,
            pixels: &pixels,
        };
        let mut out = Vec::new();
        PngFrameEncoder::new(Compression::Fast)
            .encode(&frame, &mut out)
            .unwrap();

        let decoded = image::load_from_memory(&out).unwrap().into_luma8();
        assert_eq!(decoded.dimensions(), (64, 48));
        assert_eq!(decoded.as_raw(), &pixels);
    }

    #[test]
    fn output_buffer_is_reused() {
        let pixels = gradient(32, 32);
        let frame = Frame {
            width: 32,
            height: 32,
            pixels: &pixels,
        };
        let mut encoder = PngFrameEncoder::new(Compression::Best);
        let mut out = Vec::new();
        encoder.encode(&frame, &mut out).unwrap();
        let first = out.clone();
        let capacity = out.capacity();

        encoder.encode(&frame, &mut out).unwrap();
        assert_eq!(out, first);
        assert_eq!(out.capacity(), capacity);
    }

    #[test]
    fn mismatched_frame_is_an_error() {
        let pixels = vec![0u8; 10];
        let frame = Frame {
            width: 4,
            height: 4,
            pixels: &pixels,
        };
        let mut out = vec![1, 2, 3];
        let err = PngFrameEncoder::new(Compression::Fast)
            .encode(&frame, &mut out)
            .unwrap_err();
        assert!(matches!(err, EncodeError::SizeMismatch { expected: 16, actual: 10, .. }));
        assert_eq!(out, vec![1, 2, 3]);
    }
}
