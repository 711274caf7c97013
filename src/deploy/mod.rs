//! Applying ideas to generated applications.
//!
//! A deployment copies the live tree into `.staging/<app>`, runs one agent
//! turn against the copy, validates it, and swaps it into place.

pub mod pipeline;
pub mod promote;
pub mod prompt;
pub mod staging;

pub use pipeline::{DeployOutcome, DeployRequest, DeploymentPipeline, PipelineConfig, PipelineDeps};
pub use promote::{AtomicSwap, FsOps, PromoteOutcome, Promoter, RealFs, RetryPolicy};
pub use prompt::{PromptContext, build_prompt};
