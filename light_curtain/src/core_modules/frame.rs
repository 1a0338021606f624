// THEORY:
// The `Frame` is the most fundamental unit the safety pipeline reads. It is a
// "dumb" data container around one RGB camera image plus a single scalar
// heuristic computed from the pixels alone: its luminance summary.
//
// Key principles:
// 1.  **Immutable, shared pixels**: the pixel buffer sits behind an `Arc`. A frame
//     handed to the background cache and to the background slot is the same
//     allocation, so keeping up to a cache-full of history costs no copies.
// 2.  **HSV value as brightness**: luminance is the mean of the HSV value channel,
//     `max(R, G, B)`, over every pixel. It is computed once at construction since
//     the refresh policy reads it on every cycle for both frame and background.
// 3.  **Quantization**: the background cache buckets frames by luminance rounded
//     half-to-even, so two frames whose brightness differs by less than half a
//     level land in the same bucket.

use image::RgbImage;
use std::sync::Arc;

pub type Luminance = f64;
pub type LuminanceKey = i32;

/// A camera frame with its precomputed luminance summary.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The RGB pixels, shared between every holder of this frame.
    pixels: Arc<RgbImage>,
    /// Mean HSV value over all pixels (0.0-255.0).
    luminance: Luminance,
}

impl Frame {
    pub fn new(pixels: RgbImage) -> Self {
        let luminance = average_value_hsv(&pixels);
        Self {
            pixels: Arc::new(pixels),
            luminance,
        }
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn luminance(&self) -> Luminance {
        self.luminance
    }

    /// The cache bucket this frame belongs to.
    pub fn luminance_key(&self) -> LuminanceKey {
        quantize(self.luminance)
    }

    /// True when both handles point at the same pixel allocation.
    pub fn shares_pixels_with(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl From<RgbImage> for Frame {
    fn from(pixels: RgbImage) -> Self {
        Self::new(pixels)
    }
}

/// Rounds a luminance to its cache bucket (ties to even).
pub fn quantize(luminance: Luminance) -> LuminanceKey {
    luminance.round_ties_even() as LuminanceKey
}

fn average_value_hsv(image: &RgbImage) -> Luminance {
    let pixel_count = image.width() as u64 * image.height() as u64;
    if pixel_count == 0 {
        return 0.0;
    }
    let sum: u64 = image
        .pixels()
        .map(|p| p.0[0].max(p.0[1]).max(p.0[2]) as u64)
        .sum();
    sum as Luminance / pixel_count as Luminance
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn luminance_is_mean_of_max_channel() {
        let mut image = RgbImage::from_pixel(2, 1, Rgb([10, 200, 30]));
        image.put_pixel(1, 0, Rgb([100, 0, 0]));
        let frame = Frame::new(image);
        assert_eq!(frame.luminance(), 150.0);
        assert_eq!(frame.luminance_key(), 150);
    }

    #[test]
    fn quantization_rounds_half_to_even() {
        assert_eq!(quantize(100.5), 100);
        assert_eq!(quantize(101.5), 102);
        assert_eq!(quantize(99.49), 99);
    }

    #[test]
    fn empty_image_has_zero_luminance() {
        let frame = Frame::new(RgbImage::new(0, 0));
        assert_eq!(frame.luminance(), 0.0);
    }

    #[test]
    fn clones_share_pixels() {
        let frame = Frame::new(RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])));
        let copy = frame.clone();
        let other = Frame::new(RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])));
        assert!(frame.shares_pixels_with(&copy));
        assert!(!frame.shares_pixels_with(&other));
    }
}
