use crate::core_modules::state_machine::{Command, ProcessState};

/// A command was issued in a state that has no entry for it in the transition table.
///
/// This is a usage error: the caller asked the lifecycle for something it never allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {from} -> {command}")]
pub struct InvalidTransition {
    pub from: ProcessState,
    pub command: Command,
}

#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("frame is {actual:?} but the background is {expected:?}")]
    FrameSizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("session terminated, no further frames are accepted")]
    SessionTerminated,
    #[error("frame cycle aborted: {0}")]
    CycleAborted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameSourceError {
    #[error("no frame available: {0}")]
    Unavailable(String),
    #[error("frame source exhausted")]
    Exhausted,
}
