//! Door state machine.
//!
//! A door aggregates several signals into a boolean formula evaluated over
//! a time window and fires its own signal on each rising edge.

pub mod host;
pub mod machine;

pub use host::{DoorHost, DoorOutcome, DoorSubscriber, DOOR_ACTIVATION_TYPE, DOOR_SCOPE};
pub use machine::{CompiledDoor, DoorTransition};
