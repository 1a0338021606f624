// THEORY:
// A `FrameSource` is anything that can hand the monitor one camera frame on
// request. It is deliberately blocking: real camera SDKs wait on the sensor, and
// the acquisition loop runs on tokio's blocking pool so that wait never touches
// the reactor.
//
// A failed read means "no frame this cycle" and is skipped. Only `Exhausted`
// or a closed monitor end acquisition.

use crate::core_modules::frame::Frame;
use crate::error::FrameSourceError;
use crate::monitor::{FrameSubmitter, SubmitOutcome};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tiff"];

pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, FrameSourceError>;
}

/// Replays the still images of a directory in file-name order.
#[derive(Debug)]
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    position: usize,
    interval: Option<Duration>,
    last_delivery: Option<Instant>,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> Result<Self, FrameSourceError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| FrameSourceError::Unavailable(format!("{}: {e}", dir.display())))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        paths.sort();
        info!(dir = %dir.display(), frames = paths.len(), "image directory opened");
        Ok(Self {
            paths,
            position: 0,
            interval: None,
            last_delivery: None,
        })
    }

    /// Paces delivery to at most one frame per `interval`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last_delivery) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_delivery = Some(Instant::now());
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
        let path = self.paths.get(self.position).ok_or(FrameSourceError::Exhausted)?.clone();
        self.position += 1;
        self.pace();
        let image = image::open(&path)
            .map_err(|e| FrameSourceError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(Frame::new(image.to_rgb8()))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Totals for one acquisition run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionSummary {
    pub accepted: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Pulls frames from `source` on the blocking pool and submits them until the
/// source is exhausted or the monitor closes.
pub fn spawn_acquisition<S>(mut source: S, submitter: FrameSubmitter) -> JoinHandle<AcquisitionSummary>
where
    S: FrameSource + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut summary = AcquisitionSummary::default();
        loop {
            let frame = match source.next_frame() {
                Ok(frame) => frame,
                Err(FrameSourceError::Exhausted) => break,
                Err(FrameSourceError::Unavailable(reason)) => {
                    summary.failed += 1;
                    warn!(%reason, "frame read failed, skipping cycle");
                    continue;
                }
            };
            match submitter.submit(frame) {
                SubmitOutcome::Accepted => summary.accepted += 1,
                SubmitOutcome::Dropped => summary.dropped += 1,
                SubmitOutcome::Closed => {
                    debug!("monitor closed, acquisition stopping");
                    break;
                }
            }
        }
        info!(?summary, "acquisition finished");
        summary
    })
}
