/// Fixed-capacity byte region lent to a device for one frame.
///
/// The capacity never changes after allocation, so recycling a buffer keeps
/// the pool the same size.
#[derive(Debug)]
pub struct AcquisitionBuffer {
    data: Box<[u8]>,
    len: usize,
    width: u32,
    height: u32,
}

impl AcquisitionBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            width: 0,
            height: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Size the buffer for a `width` x `height` single-channel frame and
    /// return the bytes to fill, or `None` if it does not fit.
    pub fn prepare(&mut self, width: u32, height: u32) -> Option<&mut [u8]> {
        let len = (width as usize).checked_mul(height as usize)?;
        if len > self.capacity() {
            return None;
        }
        self.len = len;
        self.width = width;
        self.height = height;
        Some(&mut self.data[..len])
    }

    /// Forget the previous contents
    pub fn clear(&mut self) {
        self.len = 0;
        self.width = 0;
        self.height = 0;
    }

    pub fn frame(&self) -> Frame<'_> {
        Frame {
            width: self.width,
            height: self.height,
            pixels: &self.data[..self.len],
        }
    }
}

/// Borrowed view of a raw single-channel frame
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    pub width: u32,
    pub height: u32,
    pub pixels: &'a [u8],
}

impl Frame<'_> {
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_rejects_frames_larger_than_capacity() {
        let mut buffer = AcquisitionBuffer::new(16);
        assert!(buffer.prepare(5, 5).is_none());
        assert!(buffer.frame().is_empty());

        let pixels = buffer.prepare(4, 4).unwrap();
        pixels.fill(7);
        let frame = buffer.frame();
        assert_eq!((frame.width, frame.height), (4, 4));
        assert!(frame.pixels.iter().all(|&p| p == 7));
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buffer = AcquisitionBuffer::new(64);
        buffer.prepare(8, 8);
        buffer.clear();
        assert_eq!(buffer.capacity(), 64);
        assert!(buffer.frame().is_empty());
    }
}
