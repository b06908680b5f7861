//! Image frames handed to the backends

use std::fmt;

use bytes::Bytes;

use common::error::InferError;

/// An RGB8 image, row-major, three bytes per pixel
///
/// Pixel data is reference counted, so cloning a frame to move it onto a
/// blocking worker is cheap.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl Frame {
    /// Creates a frame from packed RGB8 pixels
    pub fn from_rgb8(width: u32, height: u32, pixels: impl Into<Bytes>) -> Result<Self, InferError> {
        let pixels = pixels.into();
        let expected = width as usize * height as usize * 3;

        if width == 0 || height == 0 {
            return Err(InferError::InvalidFrame(format!("empty frame {}x{}", width, height)));
        }

        if pixels.len() != expected {
            return Err(InferError::InvalidFrame(format!(
                "{}x{} frame needs {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }

        Ok(Self { width, height, pixels })
    }

    /// Creates a frame filled with a single colour
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let count = width.max(1) as usize * height.max(1) as usize;
        let pixels: Vec<u8> = rgb.iter().copied().cycle().take(count * 3).collect();

        Self {
            width: width.max(1),
            height: height.max(1),
            pixels: Bytes::from(pixels),
        }
    }

    /// Gets the width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Gets the height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Gets the packed RGB8 pixels
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Computes a normalised colour histogram with `bins` buckets per channel
    ///
    /// The result has `bins³` entries summing to one, indexed as
    /// `r_bin * bins² + g_bin * bins + b_bin`.
    pub fn color_histogram(&self, bins: usize) -> Vec<f32> {
        let bins = bins.max(1);
        let mut histogram = vec![0f32; bins * bins * bins];

        for pixel in self.pixels.chunks_exact(3) {
            histogram[histogram_index(pixel[0], pixel[1], pixel[2], bins)] += 1.0;
        }

        let total = (self.pixels.len() / 3) as f32;
        if total > 0.0 {
            for value in histogram.iter_mut() {
                *value /= total;
            }
        }

        histogram
    }
}

/// Gets the histogram bucket of one pixel
pub fn histogram_index(r: u8, g: u8, b: u8, bins: usize) -> usize {
    let bucket = |channel: u8| channel as usize * bins / 256;
    bucket(r) * bins * bins + bucket(g) * bins + bucket(b)
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb8_validates_length() {
        assert!(Frame::from_rgb8(2, 2, vec![0u8; 12]).is_ok());
        assert!(matches!(
            Frame::from_rgb8(2, 2, vec![0u8; 11]),
            Err(InferError::InvalidFrame(_))
        ));
        assert!(matches!(
            Frame::from_rgb8(0, 2, Vec::<u8>::new()),
            Err(InferError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_histogram_of_solid_frame() {
        let frame = Frame::solid(4, 4, [255, 0, 0]);
        let histogram = frame.color_histogram(4);

        assert_eq!(histogram.len(), 64);
        assert_eq!(histogram[histogram_index(255, 0, 0, 4)], 1.0);
        assert_eq!(histogram.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn test_histogram_of_split_frame() {
        // Left half black, right half white
        let mut pixels = Vec::new();
        for _ in 0..2 {
            pixels.extend_from_slice(&[0, 0, 0, 255, 255, 255]);
        }
        let frame = Frame::from_rgb8(2, 2, pixels).unwrap();
        let histogram = frame.color_histogram(2);

        assert_eq!(histogram[histogram_index(0, 0, 0, 2)], 0.5);
        assert_eq!(histogram[histogram_index(255, 255, 255, 2)], 0.5);
    }
}
