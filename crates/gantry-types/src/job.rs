//! Job phases and pause reasons.
//!
//! # State Machine
//!
//! ```text
//! Idle ──select──► Selected ──start──► Running
//! Running ──pause(pos,reason)──► Paused ──resume──► Running
//! Running ──cancel──► Cancelling ──drain──► Finished
//! Running ──abort──► Aborting ──drain──► Finished
//! Paused ──cancel──► Cancelling    Paused ──abort──► Aborting
//! Finished ──select──► Selected
//! ```
//!
//! Transitions are enforced by the job service in `gantry-runtime`; no
//! observer ever sees a phase outside this set.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Observable state of the job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    /// No file selected.
    Idle,
    /// A file is selected but not started.
    Selected,
    /// Codes are being read and dispatched.
    Running,
    /// Execution is suspended; a resume offset has been committed.
    Paused,
    /// A cancel was requested; in-flight codes are draining.
    Cancelling,
    /// An abort was requested; in-flight codes are draining.
    Aborting,
    /// The job ended (ran to completion, was cancelled, or was aborted).
    Finished,
}

impl JobPhase {
    /// Returns true in the two draining phases.
    #[must_use]
    pub fn is_draining(self) -> bool {
        matches!(self, JobPhase::Cancelling | JobPhase::Aborting)
    }

    /// Returns true once a file is selected, in any phase that still
    /// refers to it.
    #[must_use]
    pub fn has_file(self) -> bool {
        !matches!(self, JobPhase::Idle)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Idle => "idle",
            JobPhase::Selected => "selected",
            JobPhase::Running => "running",
            JobPhase::Paused => "paused",
            JobPhase::Cancelling => "cancelling",
            JobPhase::Aborting => "aborting",
            JobPhase::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Why a job was paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PauseReason {
    /// A user or client requested the pause.
    User = 0,
    /// A `M226`-style code in the job stream paused it.
    Gcode = 1,
    /// A filament monitor tripped.
    Filament = 2,
    /// A motion-driver fault.
    Driver = 3,
    /// A heater fault.
    Heater = 4,
    /// Any other firmware-initiated pause.
    Firmware = 5,
}

impl TryFrom<u8> for PauseReason {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(PauseReason::User),
            1 => Ok(PauseReason::Gcode),
            2 => Ok(PauseReason::Filament),
            3 => Ok(PauseReason::Driver),
            4 => Ok(PauseReason::Heater),
            5 => Ok(PauseReason::Firmware),
            other => Err(other),
        }
    }
}
