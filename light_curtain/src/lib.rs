// THEORY:
// This file is the main entry point for the `light_curtain` library crate.
// It defines the public API that an interlock host (a PLC bridge, a machine
// controller, the bundled replay binary) consumes.
//
// The primary export is the `SafetyModule` (`pipeline`), which turns one camera
// frame into one safety verdict, plus the `monitor` runtime that feeds it from a
// camera on a single consumer task and wires in device-removal events. The
// analysis stages themselves live in `core_modules` and are reachable for hosts
// that want to drive or inspect a single stage.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod source;

pub use config::SafetyConfig;
pub use core_modules::frame::Frame;
pub use core_modules::interlock::Interlock;
pub use core_modules::state_machine::{Command, ProcessState};
pub use error::{FrameSourceError, InvalidTransition, SafetyError};
pub use pipeline::{CycleReport, SafetyModule};
