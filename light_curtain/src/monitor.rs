// THEORY:
// The `monitor` module puts a `SafetyModule` on a tokio runtime and connects it
// to its two producers: a camera delivering frames, and the host's device
// notifications.
//
// Key principles:
// 1.  **One frame at a time**: a frame is accepted only while no other frame is
//     pending or in flight. Anything submitted in between is dropped on the spot,
//     never queued, so the verdict always describes a recent frame.
// 2.  **Single owner**: the processor task is the only owner of the session.
//     Commands from other tasks travel as messages and get their answer back on
//     a oneshot channel.
// 3.  **Device loss bypasses the queue**: the watcher holds its own handle on
//     the interlock and latches it unsafe with one store the moment the camera
//     goes away, however busy the processor is.
// 4.  **CPU work off the reactor**: each cycle moves the session onto the
//     blocking pool and back, so segmentation never stalls other tasks.
// 5.  **Stopping is unsafe**: however the processor ends, the last thing it does
//     is publish an unsafe verdict. A monitor that no longer looks cannot vouch
//     for the zone.

use crate::core_modules::frame::Frame;
use crate::core_modules::interlock::Interlock;
use crate::core_modules::state_machine::{Command, ProcessState};
use crate::core_modules::vision_ops::VisionOps;
use crate::error::SafetyError;
use crate::pipeline::{CycleReport, SafetyModule};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONTROL_QUEUE: usize = 8;
const DEVICE_QUEUE: usize = 16;
const BROADCAST_CAPACITY: usize = 16;

/// What happened to a submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// A frame was already pending or being processed.
    Dropped,
    /// The processor has stopped.
    Closed,
}

/// A notification from the host's device layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Removed { descriptor: String },
}

/// Broadcast when the monitored camera disappears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNotice {
    pub descriptor: String,
    pub message: String,
}

/// Counters maintained by the processor task.
#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    refreshes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorStats {
    pub processed: u64,
    pub dropped: u64,
    /// Frames refused by the session, e.g. for a size mismatch.
    pub rejected: u64,
    pub refreshes: u64,
}

impl Counters {
    fn snapshot(&self) -> MonitorStats {
        MonitorStats {
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
        }
    }
}

struct ControlMessage {
    command: Command,
    reply: oneshot::Sender<Result<ProcessState, SafetyError>>,
}

/// Feeds frames to a running monitor. Cheap to clone.
#[derive(Clone)]
pub struct FrameSubmitter {
    frames: mpsc::Sender<Frame>,
    /// Set from acceptance until the processor has finished the cycle.
    busy: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl FrameSubmitter {
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        if self.frames.is_closed() {
            return SubmitOutcome::Closed;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("frame dropped, processor busy");
            return SubmitOutcome::Dropped;
        }
        match self.frames.try_send(frame) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.busy.store(false, Ordering::Release);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.busy.store(false, Ordering::Release);
                SubmitOutcome::Closed
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

/// Reacts to device events for one camera identity.
#[derive(Clone)]
pub struct DeviceWatcher {
    camera_identity: String,
    interlock: Interlock,
    notices: broadcast::Sender<DeviceNotice>,
}

impl DeviceWatcher {
    pub fn new(camera_identity: impl Into<String>, interlock: Interlock, notices: broadcast::Sender<DeviceNotice>) -> Self {
        Self {
            camera_identity: camera_identity.into(),
            interlock,
            notices,
        }
    }

    /// Handles one event synchronously. Returns true when the monitored camera was lost.
    pub fn on_event(&self, event: &DeviceEvent) -> bool {
        let DeviceEvent::Removed { descriptor } = event;
        if *descriptor != self.camera_identity {
            debug!(%descriptor, "ignoring removal of unrelated device");
            return false;
        }

        self.interlock.force_unsafe();
        warn!(%descriptor, "monitored camera removed, verdict latched unsafe");
        // No subscribers is fine.
        let _ = self.notices.send(DeviceNotice {
            descriptor: descriptor.clone(),
            message: "Camera removed, check the connection".into(),
        });
        true
    }

    /// Consumes events until every sender is gone or `stop` fires. Events already
    /// queued when `stop` fires are still handled.
    pub async fn run(self, mut events: mpsc::Receiver<DeviceEvent>, mut stop: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(event) => {
                        self.on_event(&event);
                    }
                    None => return,
                },
                _ = &mut stop => break,
            }
        }
        events.close();
        while let Ok(event) = events.try_recv() {
            self.on_event(&event);
        }
    }
}

/// Entry point for the async runtime.
pub struct Monitor;

impl Monitor {
    /// Spawns the processor and device-watcher tasks for `module`.
    pub fn spawn<V>(module: SafetyModule<V>, camera_identity: impl Into<String>) -> MonitorHandle
    where
        V: VisionOps + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(1);
        let (control_tx, control_rx) = mpsc::channel::<ControlMessage>(CONTROL_QUEUE);
        let (device_tx, device_rx) = mpsc::channel::<DeviceEvent>(DEVICE_QUEUE);
        let (notice_tx, _) = broadcast::channel::<DeviceNotice>(BROADCAST_CAPACITY);
        let (report_tx, _) = broadcast::channel::<CycleReport>(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(module.current_state());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (watcher_stop_tx, watcher_stop_rx) = oneshot::channel::<()>();

        let interlock = module.interlock().clone();
        let counters = Arc::new(Counters::default());
        let busy = Arc::new(AtomicBool::new(false));
        let watcher = DeviceWatcher::new(camera_identity, interlock.clone(), notice_tx.clone());

        let watcher_task = tokio::spawn(watcher.clone().run(device_rx, watcher_stop_rx));
        let processor = tokio::spawn(run_processor(
            module,
            frame_rx,
            control_rx,
            shutdown_rx,
            state_tx,
            report_tx.clone(),
            busy.clone(),
            counters.clone(),
        ));
        info!("monitor started");

        MonitorHandle {
            submitter: FrameSubmitter {
                frames: frame_tx,
                busy,
                counters: counters.clone(),
            },
            control: control_tx,
            devices: device_tx,
            watcher,
            notices: notice_tx,
            reports: report_tx,
            state: state_rx,
            interlock,
            counters,
            shutdown: Some(shutdown_tx),
            watcher_stop: Some(watcher_stop_tx),
            processor,
            watcher_task,
        }
    }
}

/// The host's view of a running monitor.
pub struct MonitorHandle {
    submitter: FrameSubmitter,
    control: mpsc::Sender<ControlMessage>,
    devices: mpsc::Sender<DeviceEvent>,
    watcher: DeviceWatcher,
    notices: broadcast::Sender<DeviceNotice>,
    reports: broadcast::Sender<CycleReport>,
    state: watch::Receiver<ProcessState>,
    interlock: Interlock,
    counters: Arc<Counters>,
    shutdown: Option<oneshot::Sender<()>>,
    watcher_stop: Option<oneshot::Sender<()>>,
    processor: JoinHandle<Result<(), SafetyError>>,
    watcher_task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        self.submitter.submit(frame)
    }

    pub fn submitter(&self) -> FrameSubmitter {
        self.submitter.clone()
    }

    /// Issues `command` on the processor task and waits for the resulting state.
    pub async fn command(&self, command: Command) -> Result<ProcessState, SafetyError> {
        let (reply, answer) = oneshot::channel();
        self.control
            .send(ControlMessage { command, reply })
            .await
            .map_err(|_| SafetyError::SessionTerminated)?;
        answer.await.map_err(|_| SafetyError::SessionTerminated)?
    }

    pub fn is_safe(&self) -> bool {
        self.interlock.is_safe()
    }

    /// A handle on the verdict, readable after the monitor is gone.
    pub fn interlock(&self) -> Interlock {
        self.interlock.clone()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// A receiver that observes every state the processor publishes.
    pub fn state_changes(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    pub fn stats(&self) -> MonitorStats {
        self.counters.snapshot()
    }

    /// Sender for the host's device notifications.
    pub fn device_events(&self) -> mpsc::Sender<DeviceEvent> {
        self.devices.clone()
    }

    /// The watcher itself, for hosts that deliver device events from a synchronous callback.
    pub fn device_watcher(&self) -> DeviceWatcher {
        self.watcher.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<DeviceNotice> {
        self.notices.subscribe()
    }

    pub fn reports(&self) -> broadcast::Receiver<CycleReport> {
        self.reports.subscribe()
    }

    /// Stops both tasks and returns the processor's exit status. The verdict
    /// reads unsafe afterwards.
    pub async fn shutdown(mut self) -> Result<(), SafetyError> {
        // Either task may already have stopped on its own.
        if let Some(signal) = self.shutdown.take() {
            let _ = signal.send(());
        }
        if let Some(signal) = self.watcher_stop.take() {
            let _ = signal.send(());
        }
        if let Err(join_error) = (&mut self.watcher_task).await {
            error!(%join_error, "device watcher task failed");
        }
        let result = match (&mut self.processor).await {
            Ok(result) => result,
            Err(join_error) => {
                error!(%join_error, "processor task failed");
                self.interlock.publish(false);
                Err(SafetyError::CycleAborted(join_error.to_string()))
            }
        };
        info!(stats = ?self.counters.snapshot(), "monitor stopped");
        result
    }
}

async fn run_processor<V>(
    module: SafetyModule<V>,
    frames: mpsc::Receiver<Frame>,
    control: mpsc::Receiver<ControlMessage>,
    shutdown: oneshot::Receiver<()>,
    state: watch::Sender<ProcessState>,
    reports: broadcast::Sender<CycleReport>,
    busy: Arc<AtomicBool>,
    counters: Arc<Counters>,
) -> Result<(), SafetyError>
where
    V: VisionOps + Send + 'static,
{
    let interlock = module.interlock().clone();
    let result = process_until_stopped(module, frames, control, shutdown, &state, &reports, &busy, &counters).await;
    interlock.publish(false);
    let last_state = *state.borrow();
    match &result {
        Ok(()) => info!(state = %last_state, "processor stopped, verdict unsafe"),
        Err(err) => error!(%err, "processor failed, verdict unsafe"),
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn process_until_stopped<V>(
    mut module: SafetyModule<V>,
    mut frames: mpsc::Receiver<Frame>,
    mut control: mpsc::Receiver<ControlMessage>,
    mut shutdown: oneshot::Receiver<()>,
    state: &watch::Sender<ProcessState>,
    reports: &broadcast::Sender<CycleReport>,
    busy: &AtomicBool,
    counters: &Counters,
) -> Result<(), SafetyError>
where
    V: VisionOps + Send + 'static,
{
    loop {
        tokio::select! {
            biased;

            Some(ControlMessage { command, reply }) = control.recv() => {
                let result = module.move_next(command);
                state.send_replace(module.current_state());
                let terminated = module.current_state() == ProcessState::Terminated;
                // The caller may have stopped waiting.
                let _ = reply.send(result);
                if terminated {
                    return Ok(());
                }
            }
            _ = &mut shutdown => return Ok(()),
            next = frames.recv() => {
                let Some(frame) = next else { return Ok(()) };
                let (returned, result) = tokio::task::spawn_blocking(move || {
                    let result = module.process_frame(frame);
                    (module, result)
                })
                .await
                .map_err(|join_error| SafetyError::CycleAborted(join_error.to_string()))?;
                module = returned;
                state.send_replace(module.current_state());
                busy.store(false, Ordering::Release);

                match result {
                    Ok(report) => {
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                        counters.refreshes.store(report.refresh_count, Ordering::Relaxed);
                        let _ = reports.send(report);
                    }
                    Err(SafetyError::FrameSizeMismatch { expected, actual }) => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(?expected, ?actual, "frame rejected, size differs from background");
                    }
                    Err(SafetyError::SessionTerminated) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyConfig;
    use crate::core_modules::vision_ops::ImageprocOps;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    /// Default pixel stages, slowed down so a cycle is observably in flight.
    struct SlowOps;

    impl VisionOps for SlowOps {
        fn abs_diff(&self, a: &RgbImage, b: &RgbImage) -> RgbImage {
            std::thread::sleep(Duration::from_millis(300));
            ImageprocOps.abs_diff(a, b)
        }
    }

    /// Panics inside a cycle once `armed` is set.
    struct FaultyOps {
        armed: Arc<AtomicBool>,
    }

    impl VisionOps for FaultyOps {
        fn abs_diff(&self, a: &RgbImage, b: &RgbImage) -> RgbImage {
            assert!(!self.armed.load(Ordering::Acquire), "sensor buffer corrupted");
            ImageprocOps.abs_diff(a, b)
        }
    }

    const CAMERA: &str = "bench-cam";

    fn grey(value: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(16, 16, Rgb([value, value, value])))
    }

    fn spawn_monitor() -> MonitorHandle {
        spawn_monitor_with(ImageprocOps)
    }

    fn spawn_monitor_with<V: VisionOps + Send + 'static>(ops: V) -> MonitorHandle {
        let module = SafetyModule::with_ops(&SafetyConfig::default(), ops, Interlock::new());
        Monitor::spawn(module, CAMERA)
    }

    async fn drive_to_safe(monitor: &MonitorHandle) {
        let mut states = monitor.state_changes();
        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Accepted);
        states.wait_for(|s| *s == ProcessState::NotSafe).await.unwrap();
        wait_for_processed(monitor, 1).await;
        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Accepted);
        states.wait_for(|s| *s == ProcessState::Safe).await.unwrap();
        wait_for_processed(monitor, 2).await;
        assert!(monitor.is_safe());
    }

    async fn wait_for_processed(monitor: &MonitorHandle, count: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.stats().processed < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn frames_submitted_while_one_is_pending_are_dropped() {
        let monitor = spawn_monitor();
        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Accepted);
        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Dropped);
        assert_eq!(monitor.stats().dropped, 1);
        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn processed_frames_reach_safe() {
        let monitor = spawn_monitor();
        let mut states = monitor.state_changes();

        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Accepted);
        states.wait_for(|s| *s == ProcessState::NotSafe).await.unwrap();
        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Accepted);
        states.wait_for(|s| *s == ProcessState::Safe).await.unwrap();

        assert!(monitor.is_safe());
        assert_eq!(monitor.stats().processed, 2);
        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn exit_command_terminates_and_closes_submission() {
        let monitor = spawn_monitor();
        assert_eq!(monitor.command(Command::Exit).await.unwrap(), ProcessState::Terminated);
        assert_eq!(monitor.state(), ProcessState::Terminated);

        let submitter = monitor.submitter();
        tokio::task::yield_now().await;
        assert!(matches!(
            monitor.command(Command::Begin).await,
            Err(SafetyError::SessionTerminated)
        ));
        assert_eq!(submitter.submit(grey(100)), SubmitOutcome::Closed);
        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_command_is_answered_with_the_error() {
        let monitor = spawn_monitor();
        let err = monitor.command(Command::Pause).await.unwrap_err();
        assert!(matches!(err, SafetyError::InvalidTransition(_)));
        assert_eq!(monitor.state(), ProcessState::Init);
        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn removal_of_monitored_camera_latches_unsafe_and_notifies() {
        let monitor = spawn_monitor();
        let mut notices = monitor.notices();
        let mut states = monitor.state_changes();

        monitor.submit(grey(100));
        states.wait_for(|s| *s == ProcessState::NotSafe).await.unwrap();
        monitor.submit(grey(100));
        states.wait_for(|s| *s == ProcessState::Safe).await.unwrap();
        assert!(monitor.is_safe());

        monitor
            .device_events()
            .send(DeviceEvent::Removed {
                descriptor: CAMERA.into(),
            })
            .await
            .unwrap();
        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.descriptor, CAMERA);
        assert!(!monitor.is_safe());

        monitor.submit(grey(100));
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while monitor.stats().processed < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(monitor.state(), ProcessState::Safe);
        assert!(!monitor.is_safe());
        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn frames_submitted_during_an_in_flight_cycle_are_dropped() {
        let monitor = spawn_monitor_with(SlowOps);
        let mut states = monitor.state_changes();
        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Accepted);
        states.wait_for(|s| *s == ProcessState::NotSafe).await.unwrap();
        wait_for_processed(&monitor, 1).await;

        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Accepted);
        // Give the processor time to take the frame and start the slow cycle.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.submit(grey(101)), SubmitOutcome::Dropped);
        assert_eq!(monitor.submit(grey(102)), SubmitOutcome::Dropped);

        wait_for_processed(&monitor, 2).await;
        assert_eq!(monitor.stats().dropped, 2);
        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Accepted);
        wait_for_processed(&monitor, 3).await;
        assert_eq!(monitor.stats().processed, 3);
        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_leaves_the_verdict_unsafe() {
        let monitor = spawn_monitor();
        drive_to_safe(&monitor).await;
        let interlock = monitor.interlock();

        monitor.shutdown().await.unwrap();
        assert!(!interlock.is_safe());
    }

    #[tokio::test]
    async fn exit_leaves_the_verdict_unsafe() {
        let monitor = spawn_monitor();
        let interlock = monitor.interlock();
        monitor.command(Command::Exit).await.unwrap();
        monitor.shutdown().await.unwrap();
        assert!(!interlock.is_safe());
    }

    #[tokio::test]
    async fn panicking_cycle_is_reported_and_leaves_the_verdict_unsafe() {
        let armed = Arc::new(AtomicBool::new(false));
        let monitor = spawn_monitor_with(FaultyOps { armed: armed.clone() });
        drive_to_safe(&monitor).await;
        let interlock = monitor.interlock();

        armed.store(true, Ordering::Release);
        assert_eq!(monitor.submit(grey(100)), SubmitOutcome::Accepted);
        let err = monitor.shutdown().await.unwrap_err();
        assert!(matches!(err, SafetyError::CycleAborted(_)));
        assert!(!interlock.is_safe());
    }

    #[tokio::test]
    async fn device_events_queued_before_shutdown_are_still_handled() {
        let monitor = spawn_monitor();
        let interlock = monitor.interlock();
        monitor
            .device_events()
            .try_send(DeviceEvent::Removed {
                descriptor: CAMERA.into(),
            })
            .unwrap();

        monitor.shutdown().await.unwrap();
        assert!(interlock.is_device_lost());
    }

    #[test]
    fn unrelated_device_is_ignored() {
        let interlock = Interlock::new();
        interlock.publish(true);
        let (notices, _) = broadcast::channel(4);
        let watcher = DeviceWatcher::new(CAMERA, interlock.clone(), notices);
        assert!(!watcher.on_event(&DeviceEvent::Removed {
            descriptor: "usb-keyboard".into()
        }));
        assert!(interlock.is_safe());
        assert!(watcher.on_event(&DeviceEvent::Removed {
            descriptor: CAMERA.into()
        }));
        assert!(!interlock.is_safe());
    }
}
