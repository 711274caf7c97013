//! Agent RPC protocol.
//!
//! A turn is one `send_prompt` followed by a stream of [`ProtocolEvent`]s
//! ending in an explicit `TurnFinished`. Channel closure before that is an
//! error, never a completion. Pending tool calls must be answered with
//! `approve`/`reject` before the agent continues.
//!
//! - `protocol`: JSON-RPC framing and update mapping
//! - `ws`: WebSocket transport (`WsConnector`, `WsChannel`)
//! - `approval`: tool-call approval policy
//! - `turn`: `TurnDriver`, the timeout-layered state machine over a channel

pub mod approval;
pub mod protocol;
pub mod turn;
pub mod ws;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::RpcError;
use crate::events::{PlanEntry, ToolCallStatus};
use crate::session::AgentEndpoint;

pub use approval::{ApprovalDecision, ApprovalMode, ApprovalPolicy, ToolApprover};
pub use turn::{ToolCallRecord, TurnDriver, TurnOutcome, TurnTimeouts};
pub use ws::WsConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallUpdate {
    pub call_id: String,
    pub tool_name: Option<String>,
    pub kind: String,
    pub status: ToolCallStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    AssistantChunk(String),
    Plan(Vec<PlanEntry>),
    /// `status == Pending` means the agent is blocked on an answer.
    ToolCall(ToolCallUpdate),
    Error(String),
    TurnFinished { stop_reason: String },
}

/// One live duplex channel to an agent.
#[async_trait]
pub trait AgentChannel: Send {
    async fn send_prompt(&mut self, prompt: &str, context_files: &[PathBuf]) -> Result<(), RpcError>;

    /// Next event, or `None` once the channel is closed.
    async fn next_event(&mut self) -> Result<Option<ProtocolEvent>, RpcError>;

    async fn approve(&mut self, call_id: &str) -> Result<(), RpcError>;

    async fn reject(&mut self, call_id: &str) -> Result<(), RpcError>;

    /// Ask the agent to abandon the current turn.
    async fn cancel(&mut self) -> Result<(), RpcError>;
}

#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Open a channel whose agent works inside `cwd`.
    async fn connect(&self, endpoint: &AgentEndpoint, cwd: &Path) -> Result<Box<dyn AgentChannel>, RpcError>;
}
