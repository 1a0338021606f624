// THEORY:
// `VisionOps` is the seam between the safety logic and the pixel algorithms.
// Segmentation and contour analysis only decide *which* primitive runs, in what
// order, with which thresholds and kernels; the primitives themselves live here.
//
// Every operation has a default body built on `image` buffers and `imageproc`, so
// `ImageprocOps` is an empty implementation and a backend that accelerates one
// stage (or a test double that scripts contours) overrides only that method.
//
// Conventions follow the camera-vision library the calibration was done with:
// - colour images are RGB, the skin space is YCrCb with channel order [Y, Cr, Cb]
// - masks are `GrayImage`s holding 0 or 255
// - out-of-image neighbours never influence erosion or dilation

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{BorderType, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::map::map_colors;

pub type Point = imageproc::point::Point<i32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelShape {
    Rect,
    Ellipse,
}

/// A square structuring element of odd side `size`, anchored at its centre.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuringElement {
    pub shape: KernelShape,
    pub size: u32,
}

impl StructuringElement {
    pub fn rect(size: u32) -> Self {
        Self {
            shape: KernelShape::Rect,
            size,
        }
    }

    pub fn ellipse(size: u32) -> Self {
        Self {
            shape: KernelShape::Ellipse,
            size,
        }
    }

    fn radius(&self) -> u32 {
        self.size / 2
    }

    /// Offsets `(dx, dy)` covered by the element.
    pub fn offsets(&self) -> Vec<(i32, i32)> {
        let r = self.radius() as i32;
        match self.shape {
            KernelShape::Rect => (-r..=r)
                .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
                .collect(),
            KernelShape::Ellipse => {
                // Same rasterisation as the reference `getStructuringElement`:
                // row half-width is round(r * sqrt(1 - dy^2 / r^2)).
                let inv_r2 = if r > 0 { 1.0 / (r * r) as f64 } else { 0.0 };
                let mut offsets = Vec::new();
                for dy in -r..=r {
                    let half = (r as f64 * (((r * r - dy * dy) as f64) * inv_r2).sqrt()).round() as i32;
                    offsets.extend((-half..=half).map(|dx| (dx, dy)));
                }
                offsets
            }
        }
    }
}

/// A minimum-area rotated rectangle given by its corners and centre.
#[derive(Debug, Clone, PartialEq)]
pub struct RotatedRect {
    pub vertices: [Point; 4],
    pub center: (f32, f32),
}

impl RotatedRect {
    fn from_vertices(vertices: [Point; 4]) -> Self {
        let cx = vertices.iter().map(|p| p.x as f32).sum::<f32>() / 4.0;
        let cy = vertices.iter().map(|p| p.y as f32).sum::<f32>() / 4.0;
        Self {
            vertices,
            center: (cx, cy),
        }
    }
}

/// The vision primitives the safety pipeline is built from.
pub trait VisionOps {
    /// Per-channel `|a - b|`. Both images must share dimensions.
    fn abs_diff(&self, a: &RgbImage, b: &RgbImage) -> RgbImage {
        RgbImage::from_fn(a.width(), a.height(), |x, y| {
            let p = a.get_pixel(x, y).0;
            let q = b.get_pixel(x, y).0;
            Rgb([p[0].abs_diff(q[0]), p[1].abs_diff(q[1]), p[2].abs_diff(q[2])])
        })
    }

    fn invert(&self, image: &RgbImage) -> RgbImage {
        let mut inverted = image.clone();
        image::imageops::invert(&mut inverted);
        inverted
    }

    /// BT.601 luma.
    fn to_gray(&self, image: &RgbImage) -> GrayImage {
        map_colors(image, |p| Luma([rgb_to_ycrcb(p.0)[0]]))
    }

    /// 255 where `low <= v <= high`, 0 elsewhere.
    fn in_range_gray(&self, image: &GrayImage, low: u8, high: u8) -> GrayImage {
        map_colors(image, |p| Luma([if (low..=high).contains(&p.0[0]) { 255 } else { 0 }]))
    }

    /// Paints `color` wherever `mask` is non-zero.
    fn set_masked(&self, image: &mut RgbImage, mask: &GrayImage, color: Rgb<u8>) {
        for (x, y, m) in mask.enumerate_pixels() {
            if m.0[0] != 0 {
                image.put_pixel(x, y, color);
            }
        }
    }

    /// Equalizes the luma histogram, leaving chroma untouched.
    fn equalize_histogram(&self, image: &RgbImage) -> RgbImage {
        let ycrcb = self.to_ycrcb(image);
        let luma = map_colors(&ycrcb, |p| Luma([p.0[0]]));
        let equalized = imageproc::contrast::equalize_histogram(&luma);
        RgbImage::from_fn(image.width(), image.height(), |x, y| {
            let [_, cr, cb] = ycrcb.get_pixel(x, y).0;
            Rgb(ycrcb_to_rgb([equalized.get_pixel(x, y).0[0], cr, cb]))
        })
    }

    fn to_ycrcb(&self, image: &RgbImage) -> RgbImage {
        map_colors(image, |p| Rgb(rgb_to_ycrcb(p.0)))
    }

    /// 255 where every channel lies within `[min, max]`, 0 elsewhere.
    fn in_range(&self, image: &RgbImage, min: &[f64; 3], max: &[f64; 3]) -> GrayImage {
        map_colors(image, |p| {
            let inside = p
                .0
                .iter()
                .zip(min.iter().zip(max.iter()))
                .all(|(&v, (&lo, &hi))| (v as f64) >= lo && (v as f64) <= hi);
            Luma([if inside { 255 } else { 0 }])
        })
    }

    fn erode(&self, mask: &GrayImage, element: StructuringElement, iterations: u32) -> GrayImage {
        match element.shape {
            KernelShape::Rect => imageproc::morphology::erode(mask, Norm::LInf, chebyshev_reach(element, iterations)),
            KernelShape::Ellipse => repeat_with_offsets(mask, &element.offsets(), iterations, Extremum::Min),
        }
    }

    fn dilate(&self, mask: &GrayImage, element: StructuringElement, iterations: u32) -> GrayImage {
        match element.shape {
            KernelShape::Rect => imageproc::morphology::dilate(mask, Norm::LInf, chebyshev_reach(element, iterations)),
            KernelShape::Ellipse => repeat_with_offsets(mask, &element.offsets(), iterations, Extremum::Max),
        }
    }

    /// `iterations` dilations followed by as many erosions.
    fn close(&self, mask: &GrayImage, element: StructuringElement, iterations: u32) -> GrayImage {
        match element.shape {
            KernelShape::Rect => imageproc::morphology::close(mask, Norm::LInf, chebyshev_reach(element, iterations)),
            KernelShape::Ellipse => {
                let dilated = self.dilate(mask, element, iterations);
                self.erode(&dilated, element, iterations)
            }
        }
    }

    /// The outer borders of every foreground region, in scan order.
    fn find_outer_contours(&self, mask: &GrayImage) -> Vec<Vec<Point>> {
        find_contours::<i32>(mask)
            .into_iter()
            .filter(|contour| contour.border_type == BorderType::Outer)
            .map(|contour| contour.points)
            .collect()
    }

    /// Enclosed area of a closed contour (shoelace formula).
    fn contour_area(&self, contour: &[Point]) -> f64 {
        if contour.len() < 3 {
            return 0.0;
        }
        let twice_signed: i64 = contour
            .iter()
            .zip(contour.iter().cycle().skip(1))
            .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
            .sum();
        (twice_signed as f64 / 2.0).abs()
    }

    fn arc_length(&self, contour: &[Point], closed: bool) -> f64 {
        imageproc::geometry::arc_length(contour, closed)
    }

    fn approx_poly(&self, contour: &[Point], epsilon: f64, closed: bool) -> Vec<Point> {
        imageproc::geometry::approximate_polygon_dp(contour, epsilon, closed)
    }

    fn convex_hull(&self, points: &[Point]) -> Vec<Point> {
        if points.is_empty() {
            return Vec::new();
        }
        imageproc::geometry::convex_hull(points)
    }

    fn min_area_rect(&self, points: &[Point]) -> RotatedRect {
        let hull = self.convex_hull(points);
        if hull.len() < 3 {
            return RotatedRect::from_vertices(bounding_box(points));
        }
        RotatedRect::from_vertices(imageproc::geometry::min_area_rect(hull.as_slice()))
    }
}

/// The default backend: `image` buffers processed with `imageproc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageprocOps;

impl VisionOps for ImageprocOps {}

/// RGB to YCrCb with the 8-bit BT.601 coefficients.
pub fn rgb_to_ycrcb([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cr = (r - y) * 0.713 + 128.0;
    let cb = (b - y) * 0.564 + 128.0;
    [saturate(y), saturate(cr), saturate(cb)]
}

pub fn ycrcb_to_rgb([y, cr, cb]: [u8; 3]) -> [u8; 3] {
    let (y, cr, cb) = (y as f64, cr as f64 - 128.0, cb as f64 - 128.0);
    let r = y + 1.403 * cr;
    let g = y - 0.714 * cr - 0.344 * cb;
    let b = y + 1.773 * cb;
    [saturate(r), saturate(g), saturate(b)]
}

fn saturate(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Repeating a square element `n` times reaches `n * radius` pixels in the Chebyshev norm.
fn chebyshev_reach(element: StructuringElement, iterations: u32) -> u8 {
    (element.radius() * iterations).min(u8::MAX as u32) as u8
}

#[derive(Clone, Copy)]
enum Extremum {
    Min,
    Max,
}

fn repeat_with_offsets(mask: &GrayImage, offsets: &[(i32, i32)], iterations: u32, extremum: Extremum) -> GrayImage {
    let mut current = mask.clone();
    for _ in 0..iterations {
        current = apply_offsets(&current, offsets, extremum);
    }
    current
}

fn apply_offsets(mask: &GrayImage, offsets: &[(i32, i32)], extremum: Extremum) -> GrayImage {
    let (width, height) = (mask.width() as i32, mask.height() as i32);
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let neighbours = offsets.iter().filter_map(|&(dx, dy)| {
            let (nx, ny) = (x as i32 + dx, y as i32 + dy);
            (nx >= 0 && nx < width && ny >= 0 && ny < height).then(|| mask.get_pixel(nx as u32, ny as u32).0[0])
        });
        let value = match extremum {
            Extremum::Min => neighbours.min(),
            Extremum::Max => neighbours.max(),
        };
        Luma([value.unwrap_or(0)])
    })
}

fn bounding_box(points: &[Point]) -> [Point; 4] {
    let min_x = points.iter().map(|p| p.x).min().unwrap_or(0);
    let max_x = points.iter().map(|p| p.x).max().unwrap_or(0);
    let min_y = points.iter().map(|p| p.y).min().unwrap_or(0);
    let max_y = points.iter().map(|p| p.y).max().unwrap_or(0);
    [
        Point::new(min_x, min_y),
        Point::new(max_x, min_y),
        Point::new(max_x, max_y),
        Point::new(min_x, max_y),
    ]
}
