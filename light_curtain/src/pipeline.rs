// THEORY:
// The `pipeline` module is the top-level API of the safety engine. A
// `SafetyModule` owns one monitoring session: the state machine, the background
// model and the analysis stages, and it turns each camera frame into one
// published verdict.
//
// A cycle runs the stages in a fixed order:
// 1.  **Seed**: the first frame after start-up (and after the optional settle
//     frames) becomes the background and opens the session with `Begin`. Nothing
//     is analysed on that frame.
// 2.  **Segment**: the frame is compared against the current background and a
//     skin mask is produced.
// 3.  **Analyze**: the mask decides occupancy and may issue `End` or `Begin`.
// 4.  **Refresh**: the background model reacts to luminance drift and may issue
//     `Pause` or `Resume`, or swap the background.
// 5.  **Publish**: the verdict is `Safe` after all of the above, nothing else.
//
// The module is synchronous and single-owner. The `monitor` runtime is what puts
// it on a task and feeds it from a camera.

use crate::config::SafetyConfig;
use crate::core_modules::contour_analyzer::{ContourAnalyzer, Detection};
use crate::core_modules::frame::{Frame, Luminance, LuminanceKey};
use crate::core_modules::interlock::Interlock;
use crate::core_modules::refresh_policy::BackgroundRefreshPolicy;
use crate::core_modules::segmentation::{SegmentationPipeline, SkinBounds};
use crate::core_modules::state_machine::{Command, ProcessState, StateMachine};
use crate::core_modules::vision_ops::{ImageprocOps, VisionOps};
use crate::error::SafetyError;
use tracing::{debug, info};

/// Which path a frame took through the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Discarded while the camera settles.
    Settling,
    /// Became the background.
    Seeded,
    /// Segmented and analysed against the background.
    Analyzed,
}

/// Diagnostics for one processed frame.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub phase: CyclePhase,
    pub state_before: ProcessState,
    pub state_after: ProcessState,
    /// `None` unless the frame was analysed.
    pub detection: Option<Detection>,
    /// The verdict as published after this cycle.
    pub is_safe: bool,
    pub luminance: Luminance,
    pub drift: Option<Luminance>,
    pub background_replaced: bool,
    pub refresh_count: u64,
}

impl CycleReport {
    pub fn detected(&self) -> bool {
        self.detection.as_ref().is_some_and(Detection::is_detected)
    }
}

/// One monitoring session, from `Init` to `Terminated`.
pub struct SafetyModule<V: VisionOps = ImageprocOps> {
    ops: V,
    machine: StateMachine,
    segmentation: SegmentationPipeline,
    analyzer: ContourAnalyzer,
    policy: BackgroundRefreshPolicy,
    interlock: Interlock,
    seed_threshold: f64,
    steady_threshold: f64,
    settle_remaining: u32,
}

impl SafetyModule<ImageprocOps> {
    pub fn new(config: &SafetyConfig, interlock: Interlock) -> Self {
        Self::with_ops(config, ImageprocOps, interlock)
    }
}

impl<V: VisionOps> SafetyModule<V> {
    /// Starts a session on `interlock`, clearing any device-loss latch left by a previous one.
    pub fn with_ops(config: &SafetyConfig, ops: V, interlock: Interlock) -> Self {
        interlock.rearm();
        info!(
            settle_frames = config.runtime.settle_frames,
            cache_capacity = config.cache.capacity,
            "safety session started"
        );
        Self {
            ops,
            machine: StateMachine::new(),
            segmentation: SegmentationPipeline::new(&config.segmentation),
            analyzer: ContourAnalyzer::new(&config.contour),
            policy: BackgroundRefreshPolicy::new(config),
            interlock,
            seed_threshold: config.hysteresis.seed_threshold,
            steady_threshold: config.hysteresis.steady_threshold,
            settle_remaining: config.runtime.settle_frames,
        }
    }

    pub fn is_safe(&self) -> bool {
        self.interlock.is_safe()
    }

    pub fn current_state(&self) -> ProcessState {
        self.machine.current()
    }

    /// A handle on the verdict this session publishes to.
    pub fn interlock(&self) -> &Interlock {
        &self.interlock
    }

    /// Issues `command` directly, outside any frame cycle.
    pub fn move_next(&mut self, command: Command) -> Result<ProcessState, SafetyError> {
        let next = self.machine.move_next(command)?;
        self.publish_verdict();
        if next == ProcessState::Terminated {
            info!("safety session terminated");
        }
        Ok(next)
    }

    pub fn refresh_count(&self) -> u64 {
        self.policy.refresh_count()
    }

    pub fn cache_len(&self) -> usize {
        self.policy.cache().len()
    }

    pub fn cache_luminance_range(&self) -> Option<(LuminanceKey, LuminanceKey)> {
        self.policy.cache().luminance_range()
    }

    pub fn skin_bounds(&self) -> &SkinBounds {
        self.policy.skin_bounds()
    }

    pub fn background(&self) -> Option<&Frame> {
        self.policy.background()
    }

    /// Runs one full cycle on `frame`.
    ///
    /// Fails without touching the session when it has terminated or when `frame`
    /// does not match the background's dimensions.
    pub fn process_frame(&mut self, frame: Frame) -> Result<CycleReport, SafetyError> {
        let state_before = self.machine.current();
        if state_before == ProcessState::Terminated {
            return Err(SafetyError::SessionTerminated);
        }

        let Some(background) = self.policy.background().cloned() else {
            return self.seed_from(frame, state_before);
        };
        if frame.dimensions() != background.dimensions() {
            return Err(SafetyError::FrameSizeMismatch {
                expected: background.dimensions(),
                actual: frame.dimensions(),
            });
        }

        let mask = self
            .segmentation
            .segment(&self.ops, &frame, &background, self.policy.skin_bounds());
        let detection = self.analyzer.analyze(&self.ops, &mask, &mut self.machine)?;
        let refresh = self
            .policy
            .refresh(&frame, self.steady_threshold, &mut self.machine)?;
        let is_safe = self.publish_verdict();

        let report = CycleReport {
            phase: CyclePhase::Analyzed,
            state_before,
            state_after: self.machine.current(),
            detection: Some(detection),
            is_safe,
            luminance: frame.luminance(),
            drift: refresh.map(|r| r.drift),
            background_replaced: refresh.is_some_and(|r| r.background_replaced),
            refresh_count: self.policy.refresh_count(),
        };
        debug!(
            state = %report.state_after,
            detected = report.detected(),
            luminance = report.luminance,
            drift = ?report.drift,
            "frame analysed"
        );
        Ok(report)
    }

    fn seed_from(&mut self, frame: Frame, state_before: ProcessState) -> Result<CycleReport, SafetyError> {
        let luminance = frame.luminance();
        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            debug!(remaining = self.settle_remaining, "settle frame discarded");
            return Ok(CycleReport {
                phase: CyclePhase::Settling,
                state_before,
                state_after: state_before,
                detection: None,
                is_safe: self.publish_verdict(),
                luminance,
                drift: None,
                background_replaced: false,
                refresh_count: self.policy.refresh_count(),
            });
        }

        self.policy.seed(frame.clone());
        let refresh = self
            .policy
            .refresh(&frame, self.seed_threshold, &mut self.machine)?;
        if self.machine.current() == ProcessState::Init {
            self.machine.move_next(Command::Begin)?;
        }
        let is_safe = self.publish_verdict();

        Ok(CycleReport {
            phase: CyclePhase::Seeded,
            state_before,
            state_after: self.machine.current(),
            detection: None,
            is_safe,
            luminance,
            drift: refresh.map(|r| r.drift),
            background_replaced: false,
            refresh_count: self.policy.refresh_count(),
        })
    }

    /// Publishes the current verdict and returns what readers now see.
    fn publish_verdict(&self) -> bool {
        self.interlock.publish(self.machine.current() == ProcessState::Safe);
        self.interlock.is_safe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn grey(value: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(32, 32, Rgb([value, value, value])))
    }

    #[test]
    fn first_frame_seeds_and_begins() {
        let mut module = SafetyModule::new(&SafetyConfig::default(), Interlock::new());
        let report = module.process_frame(grey(100)).unwrap();
        assert_eq!(report.phase, CyclePhase::Seeded);
        assert_eq!(report.state_before, ProcessState::Init);
        assert_eq!(report.state_after, ProcessState::NotSafe);
        assert_eq!(report.drift, Some(0.0));
        assert!(!report.is_safe);
        assert!(module.background().is_some());
    }

    #[test]
    fn settle_frames_are_discarded_before_seeding() {
        let mut config = SafetyConfig::default();
        config.runtime.settle_frames = 2;
        let mut module = SafetyModule::new(&config, Interlock::new());
        for _ in 0..2 {
            let report = module.process_frame(grey(100)).unwrap();
            assert_eq!(report.phase, CyclePhase::Settling);
            assert_eq!(module.current_state(), ProcessState::Init);
        }
        assert_eq!(module.process_frame(grey(100)).unwrap().phase, CyclePhase::Seeded);
    }

    #[test]
    fn empty_scene_becomes_safe_on_second_frame() {
        let interlock = Interlock::new();
        let mut module = SafetyModule::new(&SafetyConfig::default(), interlock.clone());
        module.process_frame(grey(100)).unwrap();
        let report = module.process_frame(grey(100)).unwrap();
        assert_eq!(report.phase, CyclePhase::Analyzed);
        assert!(!report.detected());
        assert_eq!(report.state_after, ProcessState::Safe);
        assert!(report.is_safe);
        assert!(interlock.is_safe());
    }

    #[test]
    fn exit_from_init_terminates_and_rejects_frames() {
        let mut module = SafetyModule::new(&SafetyConfig::default(), Interlock::new());
        assert_eq!(module.move_next(Command::Exit).unwrap(), ProcessState::Terminated);
        assert!(matches!(
            module.process_frame(grey(100)),
            Err(SafetyError::SessionTerminated)
        ));
    }

    #[test]
    fn invalid_command_is_surfaced() {
        let mut module = SafetyModule::new(&SafetyConfig::default(), Interlock::new());
        let err = module.move_next(Command::Resume).unwrap_err();
        assert!(matches!(err, SafetyError::InvalidTransition(_)));
        assert_eq!(module.current_state(), ProcessState::Init);
    }

    #[test]
    fn new_session_rearms_a_latched_interlock() {
        let interlock = Interlock::new();
        interlock.force_unsafe();
        let mut module = SafetyModule::new(&SafetyConfig::default(), interlock.clone());
        module.process_frame(grey(100)).unwrap();
        module.process_frame(grey(100)).unwrap();
        assert!(interlock.is_safe());
    }
}
