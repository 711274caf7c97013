//! Driving a single agent turn.
//!
//! Timeouts are layered tightest to loosest: connect, send, idle (a longer
//! limit applies until the first message arrives), overall.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::approval::{ApprovalDecision, ApprovalMode, ApprovalPolicy, ToolApprover};
use super::{AgentChannel, AgentConnector, ProtocolEvent, ToolCallUpdate};
use crate::errors::RpcError;
use crate::events::{Event, EventScope, PlanEntry, ToolCallStatus};
use crate::session::AgentEndpoint;

/// Floor for a single wait on the channel.
const MIN_WAIT_SLICE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TurnTimeouts {
    pub connect: Duration,
    pub send: Duration,
    pub idle: Duration,
    pub first_idle: Duration,
    pub overall: Duration,
}

impl Default for TurnTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            send: Duration::from_secs(120),
            idle: Duration::from_secs(30),
            first_idle: Duration::from_secs(300),
            overall: Duration::from_secs(300),
        }
    }
}

impl TurnTimeouts {
    pub fn first_idle_limit(&self) -> Duration {
        self.idle.max(self.first_idle)
    }

    /// How long the next wait on the channel may block.
    pub fn wait_slice(idle_limit: Duration, idle_elapsed: Duration, overall_remaining: Duration) -> Duration {
        idle_limit
            .saturating_sub(idle_elapsed)
            .min(overall_remaining)
            .max(MIN_WAIT_SLICE)
    }
}

pub async fn connect_with_timeout(
    connector: &dyn AgentConnector,
    endpoint: &AgentEndpoint,
    cwd: &Path,
    timeout: Duration,
) -> Result<Box<dyn AgentChannel>, RpcError> {
    tokio::time::timeout(timeout, connector.connect(endpoint, cwd))
        .await
        .map_err(|_| RpcError::ConnectTimeout(timeout))?
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: Option<String>,
    pub kind: String,
    pub status: ToolCallStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    /// Concatenated assistant text.
    pub text: String,
    pub plans: Vec<PlanEntry>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub errors: Vec<String>,
    pub stop_reason: String,
}

impl TurnOutcome {
    pub fn summary(&self) -> String {
        let count = |status: ToolCallStatus| {
            self.tool_calls
                .iter()
                .filter(|c| c.status == status)
                .count()
        };
        format!(
            "{} chars of output, {} plan entries, {} tool calls ({} rejected), {} errors, stop: {}",
            self.text.chars().count(),
            self.plans.len(),
            self.tool_calls.len(),
            count(ToolCallStatus::Rejected),
            self.errors.len(),
            self.stop_reason
        )
    }

    fn record_tool_call(&mut self, update: &ToolCallUpdate) {
        if let Some(existing) = self
            .tool_calls
            .iter_mut()
            .find(|c| c.call_id == update.call_id)
        {
            // A rejection is final regardless of later status reports
            if existing.status != ToolCallStatus::Rejected {
                existing.status = update.status;
            }
            if update.tool_name.is_some() {
                existing.tool_name = update.tool_name.clone();
            }
            return;
        }
        self.tool_calls.push(ToolCallRecord {
            call_id: update.call_id.clone(),
            tool_name: update.tool_name.clone(),
            kind: update.kind.clone(),
            status: update.status,
        });
    }
}

enum Step {
    Event(ProtocolEvent),
    Tick,
    Closed,
    Failed(RpcError),
    Cancelled,
}

/// Runs turns over an already connected channel.
#[derive(Clone)]
pub struct TurnDriver {
    timeouts: TurnTimeouts,
    policy: ApprovalPolicy,
    approver: Option<Arc<dyn ToolApprover>>,
}

impl TurnDriver {
    pub fn new(timeouts: TurnTimeouts, policy: ApprovalPolicy) -> Self {
        Self {
            timeouts,
            policy,
            approver: None,
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn ToolApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn timeouts(&self) -> &TurnTimeouts {
        &self.timeouts
    }

    /// Send `prompt` and consume events until the agent finishes the turn.
    pub async fn run(
        &self,
        channel: &mut dyn AgentChannel,
        prompt: &str,
        context_files: &[PathBuf],
        scope: &EventScope,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, RpcError> {
        let t = &self.timeouts;
        scope.emit(Event::status_line("Sending prompt to agent"));
        tokio::time::timeout(t.send, channel.send_prompt(prompt, context_files))
            .await
            .map_err(|_| RpcError::SendTimeout(t.send))??;

        let started = Instant::now();
        let mut last_message = started;
        let mut idle_limit = t.first_idle_limit();
        let mut outcome = TurnOutcome::default();

        loop {
            let elapsed = started.elapsed();
            if elapsed >= t.overall {
                abandon(channel).await;
                return Err(RpcError::OverallTimeout(t.overall));
            }
            let idle_elapsed = last_message.elapsed();
            if idle_elapsed >= idle_limit {
                abandon(channel).await;
                return Err(RpcError::IdleTimeout(idle_limit));
            }
            let slice = TurnTimeouts::wait_slice(idle_limit, idle_elapsed, t.overall - elapsed);

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                next = tokio::time::timeout(slice, channel.next_event()) => match next {
                    Err(_) => Step::Tick,
                    Ok(Err(e)) => Step::Failed(e),
                    Ok(Ok(None)) => Step::Closed,
                    Ok(Ok(Some(event))) => Step::Event(event),
                },
            };

            let event = match step {
                Step::Event(event) => event,
                Step::Tick => continue,
                Step::Closed => return Err(RpcError::ChannelClosed),
                Step::Failed(e) => return Err(e),
                Step::Cancelled => {
                    info!(task_id = scope.task_id(), "cancelling agent turn");
                    abandon(channel).await;
                    return Err(RpcError::Cancelled);
                }
            };

            last_message = Instant::now();
            idle_limit = t.idle;

            match event {
                ProtocolEvent::AssistantChunk(text) => {
                    outcome.text.push_str(&text);
                    scope.emit(Event::assistant_chunk(text));
                }
                ProtocolEvent::Plan(entries) => {
                    outcome.plans.extend(entries.iter().cloned());
                    scope.emit(Event::plan_update(entries));
                }
                ProtocolEvent::ToolCall(update) if update.status == ToolCallStatus::Pending => {
                    outcome.record_tool_call(&update);
                    let answered = self.answer(channel, &update, scope).await?;
                    outcome.record_tool_call(&answered);
                    if answered.status == ToolCallStatus::Rejected {
                        outcome
                            .errors
                            .push(format!("tool call {} ({}) rejected", answered.call_id, answered.kind));
                    }
                    last_message = Instant::now();
                }
                ProtocolEvent::ToolCall(update) => {
                    outcome.record_tool_call(&update);
                    scope.emit(tool_event(&update));
                }
                ProtocolEvent::Error(message) => {
                    warn!(task_id = scope.task_id(), %message, "agent reported an error");
                    scope.emit(Event::error(message.clone()));
                    outcome.errors.push(message);
                }
                ProtocolEvent::TurnFinished { stop_reason } => {
                    debug!(task_id = scope.task_id(), %stop_reason, "turn finished");
                    outcome.stop_reason = stop_reason;
                    return Ok(outcome);
                }
            }
        }
    }

    /// Answer a pending call. Returns the call with its final status.
    async fn answer(
        &self,
        channel: &mut dyn AgentChannel,
        call: &ToolCallUpdate,
        scope: &EventScope,
    ) -> Result<ToolCallUpdate, RpcError> {
        scope.emit(tool_event(call));

        let approve = match self.policy.decide(&call.kind) {
            ApprovalDecision::Approve => true,
            ApprovalDecision::Reject => false,
            ApprovalDecision::Escalate => match &self.approver {
                Some(approver) => approver.approve(scope.app_id(), call).await,
                None => {
                    let message = format!(
                        "Tool call of kind '{}' needs manual approval; set approval to selective or auto, or extend the safelist",
                        call.kind
                    );
                    scope.emit(Event::error(message));
                    let _ = channel.reject(&call.call_id).await;
                    abandon(channel).await;
                    return Err(RpcError::ApprovalRequired {
                        call_id: call.call_id.clone(),
                        kind: call.kind.clone(),
                    });
                }
            },
        };

        let status = if approve {
            channel.approve(&call.call_id).await?;
            ToolCallStatus::Approved
        } else {
            channel.reject(&call.call_id).await?;
            ToolCallStatus::Rejected
        };
        debug!(
            call_id = %call.call_id,
            kind = %call.kind,
            mode = %self.policy.mode,
            ?status,
            "answered tool call"
        );

        let answered = ToolCallUpdate {
            status,
            ..call.clone()
        };
        scope.emit(tool_event(&answered));
        Ok(answered)
    }
}

impl Default for TurnDriver {
    fn default() -> Self {
        Self::new(TurnTimeouts::default(), ApprovalPolicy::default())
    }
}

impl std::fmt::Debug for TurnDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnDriver")
            .field("timeouts", &self.timeouts)
            .field("mode", &self.policy.mode)
            .field("has_approver", &self.approver.is_some())
            .finish()
    }
}

fn tool_event(call: &ToolCallUpdate) -> Event {
    Event::tool_call(call.call_id.clone(), call.tool_name.clone(), call.kind.clone(), call.status)
}

/// Best-effort cancel of the agent side of the turn.
async fn abandon(channel: &mut dyn AgentChannel) {
    if let Err(e) = channel.cancel().await {
        debug!(error = %e, "agent cancel failed");
    }
}

/// Whether manual approval is configured without anyone to ask.
pub fn approval_unavailable(policy: &ApprovalPolicy, approver: Option<&Arc<dyn ToolApprover>>) -> bool {
    policy.mode == ApprovalMode::Manual && approver.is_none()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::EventBus;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// What a scripted channel does on the next `next_event` call.
    #[derive(Debug, Clone)]
    pub(crate) enum Scripted {
        Event(ProtocolEvent),
        Stall(Duration),
        Close,
    }

    #[derive(Debug, Default)]
    pub(crate) struct ChannelLog {
        pub prompts: Vec<String>,
        pub approved: Vec<String>,
        pub rejected: Vec<String>,
        pub cancelled: bool,
    }

    pub(crate) struct ScriptedChannel {
        script: VecDeque<Scripted>,
        pub(crate) log: Arc<Mutex<ChannelLog>>,
    }

    impl ScriptedChannel {
        pub(crate) fn new(script: Vec<Scripted>) -> (Self, Arc<Mutex<ChannelLog>>) {
            let log = Arc::new(Mutex::new(ChannelLog::default()));
            (
                Self {
                    script: script.into(),
                    log: log.clone(),
                },
                log,
            )
        }
    }

    #[async_trait]
    impl AgentChannel for ScriptedChannel {
        async fn send_prompt(&mut self, prompt: &str, _files: &[PathBuf]) -> Result<(), RpcError> {
            self.log.lock().unwrap().prompts.push(prompt.to_string());
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Option<ProtocolEvent>, RpcError> {
            match self.script.pop_front() {
                Some(Scripted::Event(event)) => Ok(Some(event)),
                Some(Scripted::Stall(d)) => {
                    tokio::time::sleep(d).await;
                    Ok(None)
                }
                Some(Scripted::Close) | None => Ok(None),
            }
        }

        async fn approve(&mut self, call_id: &str) -> Result<(), RpcError> {
            self.log.lock().unwrap().approved.push(call_id.to_string());
            Ok(())
        }

        async fn reject(&mut self, call_id: &str) -> Result<(), RpcError> {
            self.log.lock().unwrap().rejected.push(call_id.to_string());
            Ok(())
        }

        async fn cancel(&mut self) -> Result<(), RpcError> {
            self.log.lock().unwrap().cancelled = true;
            Ok(())
        }
    }

    pub(crate) fn pending(call_id: &str, kind: &str) -> Scripted {
        Scripted::Event(ProtocolEvent::ToolCall(ToolCallUpdate {
            call_id: call_id.to_string(),
            tool_name: Some(format!("{} tool", kind)),
            kind: kind.to_string(),
            status: ToolCallStatus::Pending,
        }))
    }

    pub(crate) fn chunk(text: &str) -> Scripted {
        Scripted::Event(ProtocolEvent::AssistantChunk(text.to_string()))
    }

    pub(crate) fn finished() -> Scripted {
        Scripted::Event(ProtocolEvent::TurnFinished {
            stop_reason: "end_turn".to_string(),
        })
    }

    fn scope() -> EventScope {
        EventBus::default().scoped("task_1", "app_1")
    }

    struct Always(bool);

    #[async_trait]
    impl ToolApprover for Always {
        async fn approve(&self, _app_id: &str, _call: &ToolCallUpdate) -> bool {
            self.0
        }
    }

    #[test]
    fn test_wait_slice_bounds() {
        let s = Duration::from_secs;
        assert_eq!(TurnTimeouts::wait_slice(s(30), s(10), s(100)), s(20));
        assert_eq!(TurnTimeouts::wait_slice(s(30), s(10), s(5)), s(5));
        assert_eq!(TurnTimeouts::wait_slice(s(30), s(29), s(100)), s(2));
        assert_eq!(TurnTimeouts::wait_slice(s(30), s(40), s(100)), s(2));
    }

    #[test]
    fn test_first_idle_limit_never_below_idle() {
        let t = TurnTimeouts {
            idle: Duration::from_secs(60),
            first_idle: Duration::from_secs(10),
            ..TurnTimeouts::default()
        };
        assert_eq!(t.first_idle_limit(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_turn_collects_text_and_answers_by_policy() {
        let (mut channel, log) = ScriptedChannel::new(vec![
            chunk("Hello "),
            pending("c1", "edit"),
            pending("c2", "execute"),
            chunk("world"),
            finished(),
        ]);
        let driver = TurnDriver::default();
        let outcome = driver
            .run(&mut channel, "build it", &[], &scope(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.text, "Hello world");
        assert_eq!(outcome.stop_reason, "end_turn");
        assert_eq!(outcome.tool_calls.len(), 2);
        assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Approved);
        assert_eq!(outcome.tool_calls[1].status, ToolCallStatus::Rejected);
        assert_eq!(outcome.errors.len(), 1);

        let log = log.lock().unwrap();
        assert_eq!(log.prompts, vec!["build it"]);
        assert_eq!(log.approved, vec!["c1"]);
        assert_eq!(log.rejected, vec!["c2"]);
    }

    #[tokio::test]
    async fn test_manual_without_approver_fails_turn() {
        let (mut channel, log) = ScriptedChannel::new(vec![pending("c1", "edit"), finished()]);
        let driver = TurnDriver::new(
            TurnTimeouts::default(),
            ApprovalPolicy::new(ApprovalMode::Manual, []),
        );
        let err = driver
            .run(&mut channel, "p", &[], &scope(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ApprovalRequired { ref kind, .. } if kind == "edit"));
        assert!(log.lock().unwrap().cancelled);
    }

    #[tokio::test]
    async fn test_manual_with_approver() {
        let (mut channel, log) = ScriptedChannel::new(vec![pending("c1", "delete"), finished()]);
        let driver = TurnDriver::new(
            TurnTimeouts::default(),
            ApprovalPolicy::new(ApprovalMode::Manual, []),
        )
        .with_approver(Arc::new(Always(true)));
        let outcome = driver
            .run(&mut channel, "p", &[], &scope(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Approved);
        assert_eq!(log.lock().unwrap().approved, vec!["c1"]);
    }

    #[tokio::test]
    async fn test_closure_before_finish_is_error() {
        let (mut channel, _log) = ScriptedChannel::new(vec![chunk("partial"), Scripted::Close]);
        let err = TurnDriver::default()
            .run(&mut channel, "p", &[], &scope(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::ChannelClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_after_first_message() {
        let (mut channel, log) = ScriptedChannel::new(vec![
            chunk("hi"),
            Scripted::Stall(Duration::from_secs(3600)),
        ]);
        let driver = TurnDriver::new(
            TurnTimeouts {
                idle: Duration::from_secs(5),
                first_idle: Duration::from_secs(100),
                overall: Duration::from_secs(1000),
                ..TurnTimeouts::default()
            },
            ApprovalPolicy::default(),
        );
        let err = driver
            .run(&mut channel, "p", &[], &scope(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::IdleTimeout(Duration::from_secs(5)));
        assert!(err.is_terminal());
        assert!(log.lock().unwrap().cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout() {
        let (mut channel, _log) =
            ScriptedChannel::new(vec![Scripted::Stall(Duration::from_secs(3600))]);
        let driver = TurnDriver::new(
            TurnTimeouts {
                idle: Duration::from_secs(30),
                first_idle: Duration::from_secs(300),
                overall: Duration::from_secs(60),
                ..TurnTimeouts::default()
            },
            ApprovalPolicy::default(),
        );
        let err = driver
            .run(&mut channel, "p", &[], &scope(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::OverallTimeout(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_token_ends_turn() {
        let (mut channel, log) =
            ScriptedChannel::new(vec![Scripted::Stall(Duration::from_secs(3600))]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = TurnDriver::default()
            .run(&mut channel, "p", &[], &scope(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Cancelled);
        assert!(log.lock().unwrap().cancelled);
    }

    #[test]
    fn test_approval_unavailable() {
        let manual = ApprovalPolicy::new(ApprovalMode::Manual, []);
        assert!(approval_unavailable(&manual, None));
        assert!(!approval_unavailable(&ApprovalPolicy::default(), None));
    }

    #[test]
    fn test_summary_mentions_counts() {
        let outcome = TurnOutcome {
            text: "abc".to_string(),
            stop_reason: "end_turn".to_string(),
            ..TurnOutcome::default()
        };
        let summary = outcome.summary();
        assert!(summary.contains("3 chars"));
        assert!(summary.contains("end_turn"));
    }
}
