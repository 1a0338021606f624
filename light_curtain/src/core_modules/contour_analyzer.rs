// THEORY:
// The `ContourAnalyzer` is the decision point of a monitoring cycle. It looks at
// the foreground mask produced by segmentation and answers one question: is there
// a blob large enough to be a limb inside the guarded zone?
//
// Key principles:
// 1.  **Largest qualifying blob only**: of all outer contours, the one with the
//     greatest enclosed area wins, provided that area exceeds the minimum. Equal
//     areas keep the first contour met, since only a strictly larger area replaces
//     the current candidate.
// 2.  **Occupancy drives the verdict**: a qualifying blob while `Safe` ends the
//     safe period (`End`); no blob while `NotSafe` begins one (`Begin`).
// 3.  **Frozen while paused**: when lighting made the background untrustworthy the
//     analyzer does not look at the mask at all and reports nothing.
// 4.  **Geometry for presentation**: the winning blob is summarised as an
//     approximated polygon, its convex hull and its minimum-area rectangle, which
//     the host may draw. The analyzer draws nothing itself.

use crate::config::ContourConfig;
use crate::core_modules::state_machine::{Command, ProcessState, StateMachine};
use crate::core_modules::vision_ops::{Point, RotatedRect, VisionOps};
use crate::error::InvalidTransition;
use image::GrayImage;
use tracing::debug;

/// Geometry of the winning blob, ready to be drawn by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Enclosed area of the raw contour.
    pub area: f64,
    /// The contour approximated at `approx_epsilon * perimeter`.
    pub polygon: Vec<Point>,
    /// Convex hull of the approximated polygon.
    pub hull: Vec<Point>,
    /// Minimum-area rectangle around the approximated polygon.
    pub rect: RotatedRect,
}

impl Annotation {
    pub fn center(&self) -> (f32, f32) {
        self.rect.center
    }
}

/// The analyzer's finding for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// No blob exceeded the minimum area.
    Clear,
    /// A qualifying blob occupies the zone.
    Obstructed(Annotation),
    /// Analysis was skipped because monitoring is paused.
    Frozen,
}

impl Detection {
    pub fn is_detected(&self) -> bool {
        matches!(self, Detection::Obstructed(_))
    }

    pub fn annotation(&self) -> Option<&Annotation> {
        match self {
            Detection::Obstructed(annotation) => Some(annotation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContourAnalyzer {
    min_area: f64,
    approx_epsilon: f64,
}

impl Default for ContourAnalyzer {
    fn default() -> Self {
        Self::new(&ContourConfig::default())
    }
}

impl ContourAnalyzer {
    pub fn new(config: &ContourConfig) -> Self {
        Self {
            min_area: config.min_area,
            approx_epsilon: config.approx_epsilon,
        }
    }

    /// Analyzes `mask` and issues `End`/`Begin` on `machine` as the finding demands.
    pub fn analyze<V: VisionOps + ?Sized>(
        &self,
        ops: &V,
        mask: &GrayImage,
        machine: &mut StateMachine,
    ) -> Result<Detection, InvalidTransition> {
        if machine.current() == ProcessState::Paused {
            return Ok(Detection::Frozen);
        }

        let contours = ops.find_outer_contours(mask);
        let Some((largest, area)) = self.largest_qualifying(ops, &contours) else {
            debug!(contours = contours.len(), "zone clear");
            if machine.current() == ProcessState::NotSafe {
                machine.move_next(Command::Begin)?;
            }
            return Ok(Detection::Clear);
        };

        let perimeter = ops.arc_length(largest, true);
        let polygon = ops.approx_poly(largest, perimeter * self.approx_epsilon, true);
        let hull = ops.convex_hull(&polygon);
        let rect = ops.min_area_rect(&polygon);
        debug!(area, center = ?rect.center, "zone obstructed");

        if machine.current() == ProcessState::Safe {
            machine.move_next(Command::End)?;
        }

        Ok(Detection::Obstructed(Annotation {
            area,
            polygon,
            hull,
            rect,
        }))
    }

    fn largest_qualifying<'c, V: VisionOps + ?Sized>(
        &self,
        ops: &V,
        contours: &'c [Vec<Point>],
    ) -> Option<(&'c [Point], f64)> {
        let mut best: Option<(&'c [Point], f64)> = None;
        for contour in contours {
            let area = ops.contour_area(contour);
            let biggest = best.map_or(0.0, |(_, a)| a);
            if area > biggest && area > self.min_area {
                best = Some((contour.as_slice(), area));
            }
        }
        best
    }
}
