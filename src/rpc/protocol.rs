//! JSON-RPC 2.0 framing for the agent channel.
//!
//! Client → agent: `initialize`, `session/new`, `session/prompt` requests and
//! the `session/cancel` notification. Agent → client: `session/update`
//! notifications and `session/request_permission` requests. The response to
//! `session/prompt` ends the turn.

use serde::Serialize;
use serde_json::{Value, json};

use super::{ProtocolEvent, ToolCallUpdate};
use crate::errors::RpcError;
use crate::events::{PlanEntry, ToolCallStatus};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: u64 = 1;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_NEW_SESSION: &str = "session/new";
pub const METHOD_PROMPT: &str = "session/prompt";
pub const METHOD_CANCEL: &str = "session/cancel";
pub const METHOD_UPDATE: &str = "session/update";
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Serialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params: Some(params),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        }
    }
}

/// Our answer to a request the agent made.
#[derive(Serialize, Debug, Clone)]
pub struct JsonRpcReply {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcReply {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(json!({ "code": code, "message": message })),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<Value>,
    },
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

pub fn parse_incoming(text: &str) -> Result<Incoming, RpcError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| RpcError::Protocol(format!("invalid JSON: {}", e)))?;
    let obj = value
        .as_object()
        .ok_or_else(|| RpcError::Protocol("message is not an object".to_string()))?;

    let id = obj.get("id").filter(|id| !id.is_null()).cloned();
    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    match (obj.get("method").and_then(Value::as_str), id) {
        (Some(method), Some(id)) => Ok(Incoming::Request {
            id,
            method: method.to_string(),
            params,
        }),
        (Some(method), None) => Ok(Incoming::Notification {
            method: method.to_string(),
            params,
        }),
        (None, Some(id)) => {
            let id = id
                .as_u64()
                .ok_or_else(|| RpcError::Protocol(format!("unexpected response id {}", id)))?;
            Ok(Incoming::Response {
                id,
                result: obj.get("result").cloned(),
                error: obj.get("error").cloned(),
            })
        }
        (None, None) => Err(RpcError::Protocol("message has neither method nor id".to_string())),
    }
}

/// Human-readable text of a JSON-RPC error object.
pub fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn tool_status(raw: Option<&str>) -> ToolCallStatus {
    match raw {
        Some("completed") => ToolCallStatus::Completed,
        Some("failed") => ToolCallStatus::Failed,
        // Announcements are informational; answers go through permission requests
        _ => ToolCallStatus::InProgress,
    }
}

fn tool_call_from(value: &Value, status: ToolCallStatus) -> Option<ToolCallUpdate> {
    let call_id = value.get("toolCallId").and_then(Value::as_str)?;
    Some(ToolCallUpdate {
        call_id: call_id.to_string(),
        tool_name: value
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string),
        kind: value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("other")
            .to_string(),
        status,
    })
}

/// Map a `session/update` notification. Updates we do not surface yield `None`.
pub fn map_session_update(params: &Value) -> Option<ProtocolEvent> {
    let update = params.get("update")?;
    match update.get("sessionUpdate").and_then(Value::as_str)? {
        "agent_message_chunk" => {
            let content = update.get("content")?;
            let text = content.get("text").and_then(Value::as_str)?;
            Some(ProtocolEvent::AssistantChunk(text.to_string()))
        }
        "plan" => {
            let entries: Vec<PlanEntry> = update
                .get("entries")
                .and_then(|e| serde_json::from_value(e.clone()).ok())
                .unwrap_or_default();
            Some(ProtocolEvent::Plan(entries))
        }
        "tool_call" | "tool_call_update" => {
            let status = tool_status(update.get("status").and_then(Value::as_str));
            tool_call_from(update, status).map(ProtocolEvent::ToolCall)
        }
        "error" => {
            let message = update
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown agent error");
            Some(ProtocolEvent::Error(message.to_string()))
        }
        _ => None,
    }
}

/// A permission request waiting for our answer.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub call: ToolCallUpdate,
    pub allow_option: String,
    pub reject_option: String,
}

pub fn parse_permission_request(params: &Value) -> Result<PermissionRequest, RpcError> {
    let tool_call = params
        .get("toolCall")
        .ok_or_else(|| RpcError::Protocol("permission request without toolCall".to_string()))?;
    let call = tool_call_from(tool_call, ToolCallStatus::Pending)
        .ok_or_else(|| RpcError::Protocol("permission request without toolCallId".to_string()))?;

    let options: Vec<(String, String)> = params
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| {
                    Some((
                        o.get("optionId")?.as_str()?.to_string(),
                        o.get("kind")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    let pick = |prefix: &str, fallback: &str| {
        options
            .iter()
            .find(|(_, kind)| kind == &format!("{}_once", prefix))
            .or_else(|| options.iter().find(|(_, kind)| kind.starts_with(prefix)))
            .map(|(id, _)| id.clone())
            .unwrap_or_else(|| fallback.to_string())
    };

    Ok(PermissionRequest {
        call,
        allow_option: pick("allow", "allow"),
        reject_option: pick("reject", "reject"),
    })
}

pub fn selected_outcome(option_id: &str) -> Value {
    json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
}

pub fn cancelled_outcome() -> Value {
    json!({ "outcome": { "outcome": "cancelled" } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let msg = parse_incoming(r#"{"jsonrpc":"2.0","id":3,"result":{"stopReason":"end_turn"}}"#).unwrap();
        match msg {
            Incoming::Response { id, result, error } => {
                assert_eq!(id, 3);
                assert_eq!(result.unwrap()["stopReason"], "end_turn");
                assert!(error.is_none());
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_request_vs_notification() {
        let req = parse_incoming(r#"{"jsonrpc":"2.0","id":"p1","method":"session/request_permission","params":{}}"#).unwrap();
        assert!(matches!(req, Incoming::Request { ref method, .. } if method == METHOD_REQUEST_PERMISSION));

        let note = parse_incoming(r#"{"jsonrpc":"2.0","method":"session/update","params":{}}"#).unwrap();
        assert!(matches!(note, Incoming::Notification { ref method, .. } if method == METHOD_UPDATE));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_incoming("not json"), Err(RpcError::Protocol(_))));
        assert!(matches!(parse_incoming(r#"{"jsonrpc":"2.0"}"#), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_map_message_chunk() {
        let params = json!({
            "sessionId": "s1",
            "update": {"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "Hello"}}
        });
        assert_eq!(
            map_session_update(&params),
            Some(ProtocolEvent::AssistantChunk("Hello".to_string()))
        );
    }

    #[test]
    fn test_map_plan_entries() {
        let params = json!({
            "update": {"sessionUpdate": "plan", "entries": [
                {"content": "Create server.js", "status": "pending", "priority": "high"}
            ]}
        });
        match map_session_update(&params) {
            Some(ProtocolEvent::Plan(entries)) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].content, "Create server.js");
                assert_eq!(entries[0].priority.as_deref(), Some("high"));
            }
            other => panic!("Expected Plan, got {:?}", other),
        }
    }

    #[test]
    fn test_map_tool_call_update_status() {
        let params = json!({
            "update": {"sessionUpdate": "tool_call_update", "toolCallId": "c1", "status": "completed"}
        });
        match map_session_update(&params) {
            Some(ProtocolEvent::ToolCall(update)) => {
                assert_eq!(update.call_id, "c1");
                assert_eq!(update.status, ToolCallStatus::Completed);
                assert_eq!(update.kind, "other");
            }
            other => panic!("Expected ToolCall, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_update_ignored() {
        let params = json!({"update": {"sessionUpdate": "agent_thought_chunk", "content": {"text": "hmm"}}});
        assert_eq!(map_session_update(&params), None);
    }

    #[test]
    fn test_permission_request_picks_once_options() {
        let params = json!({
            "sessionId": "s1",
            "toolCall": {"toolCallId": "c7", "title": "Write server.js", "kind": "edit"},
            "options": [
                {"optionId": "always", "kind": "allow_always", "name": "Always"},
                {"optionId": "yes", "kind": "allow_once", "name": "Yes"},
                {"optionId": "no", "kind": "reject_once", "name": "No"}
            ]
        });
        let request = parse_permission_request(&params).unwrap();
        assert_eq!(request.call.call_id, "c7");
        assert_eq!(request.call.kind, "edit");
        assert_eq!(request.call.status, ToolCallStatus::Pending);
        assert_eq!(request.allow_option, "yes");
        assert_eq!(request.reject_option, "no");
    }

    #[test]
    fn test_permission_request_defaults_options() {
        let params = json!({"toolCall": {"toolCallId": "c8"}});
        let request = parse_permission_request(&params).unwrap();
        assert_eq!(request.allow_option, "allow");
        assert_eq!(request.reject_option, "reject");
    }

    #[test]
    fn test_reply_serialization() {
        let reply = JsonRpcReply::result(json!(5), selected_outcome("yes"));
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["id"], 5);
        assert_eq!(value["result"]["outcome"]["optionId"], "yes");
        assert!(value.get("error").is_none());
    }
}
