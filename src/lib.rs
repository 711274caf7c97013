//! ideaforge: turns natural-language ideas into running web applications
//! by driving an external coding agent, and keeps improving them.
//!
//! Ideas enter a priority [`queue`]; the [`orchestrator`] dispatches each to
//! the [`deploy`] pipeline, which leases an agent [`session`], runs one
//! [`rpc`] turn against a staged copy of the application and promotes it
//! atomically. The [`fleet`] controller feeds applications back through the
//! same pipeline with self-critique prompts.

pub mod apps;
pub mod config;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod fleet;
pub mod logging;
pub mod orchestrator;
pub mod ports;
pub mod queue;
pub mod rpc;
pub mod server;
pub mod session;
