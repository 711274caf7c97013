//! Autonomous per-application improvement loops.
//!
//! Each application gets a loop record that moves through
//! `idle → working → resting → paused`. A working loop has exactly one turn
//! in flight through the deployment pipeline; failures back off
//! exponentially and five in a row pause the loop until it is started again.

pub mod controller;
pub mod dimensions;
pub mod state;
pub mod store;

pub use controller::{FleetConfig, FleetController, IterationSubmitter, StationStats};
pub use dimensions::{Dimension, build_iteration_prompt};
pub use state::{IterationRecord, LoopState, LoopStatus, backoff_delay};
pub use store::{JsonFileStore, LoopStates, MemoryStore, StateStore};
