// THEORY:
// The `BackgroundRefreshPolicy` keeps the background model honest as ambient
// light changes. It owns the single background slot, the `BackgroundCache` of
// past backgrounds and the skin bounds whose Cr floor follows the background's
// brightness.
//
// Every cycle it measures drift, the absolute luminance difference between the
// live frame and the background, and compares it against a hysteresis
// threshold:
// 1.  **Learning while safe**: a frame seen while the zone is `Safe` is a clean
//     view of the background under the current light, so it is cached under its
//     luminance bucket. An empty cache is first seeded with the background.
// 2.  **Large drift**: from `Safe` the verdict can no longer be trusted, so
//     monitoring pauses. From `NotSafe` or `Paused` the policy looks for a cached
//     background from similar light and swaps it in if one exists.
// 3.  **Small drift while paused**: the background fits the light again, so
//     monitoring resumes.
//
// Only `Pause` and `Resume` are issued here. `Begin` and `End` belong to the
// seeding path and the contour analyzer.

use crate::config::SafetyConfig;
use crate::core_modules::background_cache::BackgroundCache;
use crate::core_modules::frame::{Frame, Luminance};
use crate::core_modules::segmentation::SkinBounds;
use crate::core_modules::state_machine::{Command, ProcessState, StateMachine};
use crate::error::InvalidTransition;
use tracing::debug;

/// What one refresh observed and did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshOutcome {
    pub luminance: Luminance,
    pub background_luminance: Luminance,
    pub drift: Luminance,
    /// The background slot now holds a cached frame.
    pub background_replaced: bool,
    /// The live frame was offered to the cache.
    pub cached: bool,
}

#[derive(Debug)]
pub struct BackgroundRefreshPolicy {
    background: Option<Frame>,
    cache: BackgroundCache,
    bounds: SkinBounds,
    cr_slope: f64,
    cr_offset: f64,
    refresh_count: u64,
}

impl Default for BackgroundRefreshPolicy {
    fn default() -> Self {
        Self::new(&SafetyConfig::default())
    }
}

impl BackgroundRefreshPolicy {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            background: None,
            cache: BackgroundCache::new(config.cache.capacity, config.cache.search_radius),
            bounds: SkinBounds::from(&config.skin),
            cr_slope: config.skin.cr_slope,
            cr_offset: config.skin.cr_offset,
            refresh_count: 0,
        }
    }

    pub fn background(&self) -> Option<&Frame> {
        self.background.as_ref()
    }

    pub fn skin_bounds(&self) -> &SkinBounds {
        &self.bounds
    }

    pub fn cache(&self) -> &BackgroundCache {
        &self.cache
    }

    /// Number of times monitoring resumed after a pause.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }

    /// Installs `frame` as the background.
    pub fn seed(&mut self, frame: Frame) {
        debug!(luminance = frame.luminance(), "background seeded");
        self.background = Some(frame);
    }

    /// Runs one refresh against `frame`. Returns `None` when no background exists yet.
    pub fn refresh(
        &mut self,
        frame: &Frame,
        threshold: f64,
        machine: &mut StateMachine,
    ) -> Result<Option<RefreshOutcome>, InvalidTransition> {
        let Some(background) = self.background.as_ref() else {
            return Ok(None);
        };

        let background_luminance = background.luminance();
        let drift = (frame.luminance() - background_luminance).abs();
        self.bounds
            .set_cr_min(background_luminance * self.cr_slope + self.cr_offset);

        let state = machine.current();
        let mut cached = false;
        if state == ProcessState::Safe {
            if self.cache.is_empty() {
                self.cache.insert(background.luminance_key(), background.clone());
            }
            self.cache.insert(frame.luminance_key(), frame.clone());
            cached = true;
        }

        let mut background_replaced = false;
        if drift > threshold {
            match state {
                ProcessState::Safe => {
                    machine.move_next(Command::Pause)?;
                }
                ProcessState::NotSafe | ProcessState::Paused => {
                    if let Some(nearest) = self.cache.find_nearest(frame.luminance_key()) {
                        debug!(from = background_luminance, to = nearest.luminance(), "background replaced");
                        self.background = Some(nearest.clone());
                        background_replaced = true;
                    }
                }
                ProcessState::Init | ProcessState::Terminated => {}
            }
        } else if state == ProcessState::Paused {
            machine.move_next(Command::Resume)?;
            self.refresh_count += 1;
        }

        debug!(luminance = frame.luminance(), drift, threshold, background_replaced, "refresh");
        Ok(Some(RefreshOutcome {
            luminance: frame.luminance(),
            background_luminance,
            drift,
            background_replaced,
            cached,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn grey(value: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(4, 4, Rgb([value, value, value])))
    }

    fn machine_in(commands: &[Command]) -> StateMachine {
        let mut machine = StateMachine::new();
        for &command in commands {
            machine.move_next(command).unwrap();
        }
        machine
    }

    const TO_SAFE: [Command; 2] = [Command::Begin, Command::Begin];

    #[test]
    fn no_background_is_a_no_op() {
        let mut policy = BackgroundRefreshPolicy::default();
        let mut machine = machine_in(&TO_SAFE);
        assert_eq!(policy.refresh(&grey(100), 20.0, &mut machine), Ok(None));
        assert!(policy.cache().is_empty());
        assert_eq!(machine.current(), ProcessState::Safe);
    }

    #[test]
    fn cr_floor_tracks_background_luminance() {
        let mut policy = BackgroundRefreshPolicy::default();
        policy.seed(grey(90));
        let mut machine = machine_in(&[Command::Begin]);
        policy.refresh(&grey(90), 20.0, &mut machine).unwrap();
        assert!((policy.skin_bounds().cr_min() - (90.0 * 6.0 / 90.0 + 122.31)).abs() < 1e-9);
        assert_eq!(policy.skin_bounds().max, [255.0, 176.0, 144.0]);
    }

    #[test]
    fn safe_frame_seeds_empty_cache_with_background_first() {
        let mut policy = BackgroundRefreshPolicy::default();
        let background = grey(100);
        policy.seed(background.clone());
        let mut machine = machine_in(&TO_SAFE);
        let outcome = policy.refresh(&grey(110), 20.0, &mut machine).unwrap().unwrap();
        assert!(outcome.cached);
        assert_eq!(policy.cache().len(), 2);
        assert!(policy.cache().get(100).unwrap().shares_pixels_with(&background));
        assert!(policy.cache().contains(110));
        assert_eq!(machine.current(), ProcessState::Safe);
    }

    #[test]
    fn not_safe_frames_are_never_cached() {
        let mut policy = BackgroundRefreshPolicy::default();
        policy.seed(grey(100));
        let mut machine = machine_in(&[Command::Begin]);
        let outcome = policy.refresh(&grey(104), 20.0, &mut machine).unwrap().unwrap();
        assert!(!outcome.cached);
        assert!(policy.cache().is_empty());
    }

    #[test]
    fn large_drift_while_safe_pauses_without_swapping() {
        let mut policy = BackgroundRefreshPolicy::default();
        let background = grey(100);
        policy.seed(background.clone());
        let mut machine = machine_in(&TO_SAFE);
        let outcome = policy.refresh(&grey(125), 20.0, &mut machine).unwrap().unwrap();
        assert_eq!(outcome.drift, 25.0);
        assert!(!outcome.background_replaced);
        assert_eq!(machine.current(), ProcessState::Paused);
        assert!(policy.background().unwrap().shares_pixels_with(&background));
    }

    #[test]
    fn large_drift_while_paused_swaps_in_nearest_cached_background() {
        let mut policy = BackgroundRefreshPolicy::default();
        policy.seed(grey(100));
        let mut machine = machine_in(&TO_SAFE);
        let bright = grey(125);
        policy.refresh(&bright, 20.0, &mut machine).unwrap();
        assert_eq!(machine.current(), ProcessState::Paused);

        let outcome = policy.refresh(&grey(126), 20.0, &mut machine).unwrap().unwrap();
        assert!(outcome.background_replaced);
        assert!(policy.background().unwrap().shares_pixels_with(&bright));
        assert_eq!(machine.current(), ProcessState::Paused);
    }

    #[test]
    fn large_drift_without_cache_match_keeps_background() {
        let mut policy = BackgroundRefreshPolicy::default();
        let background = grey(100);
        policy.seed(background.clone());
        let mut machine = machine_in(&[Command::Begin]);
        let outcome = policy.refresh(&grey(160), 20.0, &mut machine).unwrap().unwrap();
        assert!(!outcome.background_replaced);
        assert!(policy.background().unwrap().shares_pixels_with(&background));
        assert_eq!(machine.current(), ProcessState::NotSafe);
    }

    #[test]
    fn small_drift_while_paused_resumes_and_counts_once() {
        let mut policy = BackgroundRefreshPolicy::default();
        policy.seed(grey(100));
        let mut machine = machine_in(&[Command::Begin, Command::Begin, Command::Pause]);
        policy.refresh(&grey(105), 20.0, &mut machine).unwrap();
        assert_eq!(machine.current(), ProcessState::Safe);
        assert_eq!(policy.refresh_count(), 1);
        policy.refresh(&grey(105), 20.0, &mut machine).unwrap();
        assert_eq!(policy.refresh_count(), 1);
    }

    #[test]
    fn drift_equal_to_threshold_is_not_large() {
        let mut policy = BackgroundRefreshPolicy::default();
        policy.seed(grey(100));
        let mut machine = machine_in(&TO_SAFE);
        policy.refresh(&grey(120), 20.0, &mut machine).unwrap();
        assert_eq!(machine.current(), ProcessState::Safe);
    }
}
