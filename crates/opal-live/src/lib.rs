//! Live voice session: owns the capture and playback paths, the remote
//! session handles, and the conversation state machine.

pub mod controller;
pub mod state;

pub use controller::{LiveController, LiveEvent, SessionPhase};
pub use state::{SessionState, TURN_CLEAR_DELAY};
