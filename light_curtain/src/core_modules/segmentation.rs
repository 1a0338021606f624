// THEORY:
// The `SegmentationPipeline` turns a camera frame into a binary foreground mask
// of skin-coloured regions that are not part of the background. It owns no pixel
// algorithm itself; its contract is the sequencing and the thresholds:
//
// 1.  **Background suppression**: `absdiff(frame, background)` is inverted and
//     thresholded to the near-white band, marking pixels that still look like the
//     background. Those pixels are painted white on a copy of the frame, which
//     puts them outside any plausible skin range.
// 2.  **Contrast normalisation**: the luma histogram of that copy is equalized.
// 3.  **Skin range**: the copy is converted to YCrCb and every pixel inside the
//     current `SkinBounds` is kept.
// 4.  **Cleanup**: an elliptical erode + dilate removes speckle, and a
//     many-iteration rectangular closing fuses fragments of the same limb.

use crate::config::{SegmentationConfig, SkinConfig};
use crate::core_modules::frame::Frame;
use crate::core_modules::vision_ops::{StructuringElement, VisionOps};
use image::{GrayImage, Rgb};

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// A YCrCb range, channel order `[Y, Cr, Cb]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkinBounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Default for SkinBounds {
    fn default() -> Self {
        Self {
            min: [0.0, 129.0, 76.0],
            max: [255.0, 176.0, 144.0],
        }
    }
}

impl From<&SkinConfig> for SkinBounds {
    fn from(config: &SkinConfig) -> Self {
        Self {
            min: config.min,
            max: config.max,
        }
    }
}

impl SkinBounds {
    pub fn cr_min(&self) -> f64 {
        self.min[1]
    }

    pub fn set_cr_min(&mut self, cr_min: f64) {
        self.min[1] = cr_min;
    }
}

#[derive(Debug, Clone)]
pub struct SegmentationPipeline {
    background_match: (u8, u8),
    denoise: StructuringElement,
    close: StructuringElement,
    close_iterations: u32,
}

impl Default for SegmentationPipeline {
    fn default() -> Self {
        Self::new(&SegmentationConfig::default())
    }
}

impl SegmentationPipeline {
    pub fn new(config: &SegmentationConfig) -> Self {
        Self {
            background_match: (config.background_match_low, config.background_match_high),
            denoise: StructuringElement::ellipse(config.denoise_kernel),
            close: StructuringElement::rect(config.close_kernel),
            close_iterations: config.close_iterations,
        }
    }

    /// Produces the foreground mask for `frame`. Frame and background must share dimensions.
    pub fn segment<V: VisionOps + ?Sized>(
        &self,
        ops: &V,
        frame: &Frame,
        background: &Frame,
        bounds: &SkinBounds,
    ) -> GrayImage {
        let (low, high) = self.background_match;

        let difference = ops.invert(&ops.abs_diff(frame.pixels(), background.pixels()));
        let matches_background = ops.in_range_gray(&ops.to_gray(&difference), low, high);

        let mut suppressed = frame.pixels().clone();
        ops.set_masked(&mut suppressed, &matches_background, WHITE);
        let equalized = ops.equalize_histogram(&suppressed);

        let skin = ops.in_range(&ops.to_ycrcb(&equalized), &bounds.min, &bounds.max);

        let skin = ops.erode(&skin, self.denoise, 1);
        let skin = ops.dilate(&skin, self.denoise, 1);
        ops.close(&skin, self.close, self.close_iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::vision_ops::{ImageprocOps, rgb_to_ycrcb};
    use image::RgbImage;

    const BACKGROUND: Rgb<u8> = Rgb([90, 90, 90]);
    // A typical skin tone: Cr ~ 150, Cb ~ 110.
    const SKIN: Rgb<u8> = Rgb([200, 140, 110]);

    fn scene(width: u32, height: u32, patch: Option<(u32, u32, u32)>) -> Frame {
        let image = RgbImage::from_fn(width, height, |x, y| match patch {
            Some((x0, y0, side)) if x >= x0 && x < x0 + side && y >= y0 && y < y0 + side => SKIN,
            _ => BACKGROUND,
        });
        Frame::new(image)
    }

    #[test]
    fn skin_sample_is_inside_default_bounds() {
        let [_, cr, cb] = rgb_to_ycrcb(SKIN.0);
        let bounds = SkinBounds::default();
        assert!((cr as f64) >= bounds.min[1] && (cr as f64) <= bounds.max[1]);
        assert!((cb as f64) >= bounds.min[2] && (cb as f64) <= bounds.max[2]);
    }

    #[test]
    fn unchanged_scene_yields_empty_mask() {
        let background = scene(64, 64, None);
        let frame = scene(64, 64, None);
        let mask = SegmentationPipeline::default().segment(&ImageprocOps, &frame, &background, &SkinBounds::default());
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn skin_patch_over_background_is_foreground() {
        let background = scene(64, 64, None);
        let frame = scene(64, 64, Some((16, 16, 32)));
        let mask = SegmentationPipeline::default().segment(&ImageprocOps, &frame, &background, &SkinBounds::default());
        assert_eq!(mask.get_pixel(32, 32).0[0], 255);
        assert_eq!(mask.get_pixel(2, 2).0[0], 0);
    }

    #[test]
    fn raising_cr_floor_above_the_patch_hides_it() {
        let background = scene(64, 64, None);
        let frame = scene(64, 64, Some((16, 16, 32)));
        let mut bounds = SkinBounds::default();
        bounds.set_cr_min(170.0);
        let mask = SegmentationPipeline::default().segment(&ImageprocOps, &frame, &background, &bounds);
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }
}
