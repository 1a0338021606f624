// THEORY:
// The `StateMachine` governs the monitoring lifecycle. It is the only place the
// current `ProcessState` can change, and it only changes through a lookup in a
// fixed transition table. Every other module asks for a transition by issuing a
// `Command`; none of them ever assigns a state directly.
//
// The table is a `match`, so it is immutable by construction and exhaustively
// checked by the compiler. Anything not listed is an `InvalidTransition`, which
// callers must propagate: it means the lifecycle was driven in a way it never
// allows, not that the scene was unusual.

use crate::error::InvalidTransition;
use std::fmt;
use tracing::info;

/// The lifecycle state of a monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Session created, no background seeded yet.
    Init,
    /// The guarded zone is free.
    Safe,
    /// Something occupies the guarded zone, or monitoring has not yet confirmed it is free.
    NotSafe,
    /// Ambient light drifted too far from the background; live verdicts are not trusted.
    Paused,
    /// Session closed. Terminal.
    Terminated,
}

/// An input to the lifecycle. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Begin,
    End,
    Pause,
    Resume,
    Exit,
}

impl ProcessState {
    pub const ALL: [ProcessState; 5] = [
        ProcessState::Init,
        ProcessState::Safe,
        ProcessState::NotSafe,
        ProcessState::Paused,
        ProcessState::Terminated,
    ];
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Begin,
        Command::End,
        Command::Pause,
        Command::Resume,
        Command::Exit,
    ];
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Holds the current lifecycle state and applies commands through the transition table.
#[derive(Debug)]
pub struct StateMachine {
    current: ProcessState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: ProcessState::Init,
        }
    }

    pub fn current(&self) -> ProcessState {
        self.current
    }

    /// Pure table lookup.
    pub fn get_next(state: ProcessState, command: Command) -> Result<ProcessState, InvalidTransition> {
        use Command::*;
        use ProcessState::*;

        match (state, command) {
            (Init, Exit) => Ok(Terminated),
            (Init, Begin) => Ok(NotSafe),
            (NotSafe, Begin) => Ok(Safe),
            (Safe, Pause) => Ok(Paused),
            (Safe, End) => Ok(NotSafe),
            (Paused, End) => Ok(NotSafe),
            (Paused, Resume) => Ok(Safe),
            (from, command) => Err(InvalidTransition { from, command }),
        }
    }

    /// Looks up the transition for the current state and commits it.
    pub fn move_next(&mut self, command: Command) -> Result<ProcessState, InvalidTransition> {
        let next = Self::get_next(self.current, command)?;
        info!(from = %self.current, %command, to = %next, "state transition");
        self.current = next;
        Ok(next)
    }
}
