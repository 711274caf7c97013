//! WebSocket transport for the agent channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::protocol::{
    self, Incoming, JsonRpcNotification, JsonRpcReply, JsonRpcRequest, METHOD_CANCEL,
    METHOD_INITIALIZE, METHOD_NEW_SESSION, METHOD_NOT_FOUND, METHOD_PROMPT,
    METHOD_REQUEST_PERMISSION, METHOD_UPDATE, PROTOCOL_VERSION,
};
use super::{AgentChannel, AgentConnector, ProtocolEvent};
use crate::errors::RpcError;
use crate::session::AgentEndpoint;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens [`WsChannel`]s.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl AgentConnector for WsConnector {
    async fn connect(&self, endpoint: &AgentEndpoint, cwd: &Path) -> Result<Box<dyn AgentChannel>, RpcError> {
        let (socket, _) = connect_async(endpoint.url.as_str())
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        debug!(url = %endpoint.url, "connected to agent");

        let mut channel = WsChannel::new(socket);
        channel.open_session(cwd).await?;
        Ok(Box::new(channel))
    }
}

struct PendingPermission {
    rpc_id: Value,
    allow_option: String,
    reject_option: String,
}

pub struct WsChannel {
    socket: Socket,
    next_id: u64,
    session_id: Option<String>,
    prompt_id: Option<u64>,
    permissions: HashMap<String, PendingPermission>,
}

impl WsChannel {
    fn new(socket: Socket) -> Self {
        Self {
            socket,
            next_id: 1,
            session_id: None,
            prompt_id: None,
            permissions: HashMap::new(),
        }
    }

    async fn send_json(&mut self, message: &impl Serialize) -> Result<(), RpcError> {
        let text = serde_json::to_string(message).map_err(|e| RpcError::Protocol(e.to_string()))?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    async fn send_request(&mut self, method: &str, params: Value) -> Result<u64, RpcError> {
        let id = self.next_id;
        self.next_id += 1;
        self.send_json(&JsonRpcRequest::new(id, method, params)).await?;
        Ok(id)
    }

    /// Next decoded message, or `None` on close.
    async fn recv(&mut self) -> Result<Option<Incoming>, RpcError> {
        loop {
            match self.socket.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(e)) => return Err(RpcError::Transport(e.to_string())),
                Some(Ok(Message::Text(text))) => return protocol::parse_incoming(text.as_str()).map(Some),
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn refuse(&mut self, id: Value, method: &str) -> Result<(), RpcError> {
        debug!(method, "refusing unsupported agent request");
        self.send_json(&JsonRpcReply::error(id, METHOD_NOT_FOUND, "method not supported"))
            .await
    }

    /// Request/response round trip used during setup, before any turn runs.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.send_request(method, params).await?;
        loop {
            match self.recv().await? {
                None => return Err(RpcError::ChannelClosed),
                Some(Incoming::Response { id: got, result, error }) if got == id => {
                    if let Some(error) = error {
                        return Err(RpcError::Agent(protocol::error_message(&error)));
                    }
                    return Ok(result.unwrap_or(Value::Null));
                }
                Some(Incoming::Request { id, method, .. }) => self.refuse(id, &method).await?,
                Some(_) => {}
            }
        }
    }

    async fn open_session(&mut self, cwd: &Path) -> Result<(), RpcError> {
        self.call(
            METHOD_INITIALIZE,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientCapabilities": {"fs": {"readTextFile": false, "writeTextFile": false}}
            }),
        )
        .await?;

        let result = self
            .call(
                METHOD_NEW_SESSION,
                json!({ "cwd": cwd.to_string_lossy(), "mcpServers": [] }),
            )
            .await?;
        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Protocol("session/new returned no sessionId".to_string()))?;
        self.session_id = Some(session_id.to_string());
        Ok(())
    }

    fn session_id(&self) -> Result<String, RpcError> {
        self.session_id
            .clone()
            .ok_or_else(|| RpcError::Protocol("no agent session open".to_string()))
    }

    async fn answer(&mut self, call_id: &str, allow: bool) -> Result<(), RpcError> {
        let pending = self.permissions.remove(call_id).ok_or_else(|| {
            RpcError::Protocol(format!("no pending permission request for {}", call_id))
        })?;
        let option = if allow {
            pending.allow_option
        } else {
            pending.reject_option
        };
        self.send_json(&JsonRpcReply::result(
            pending.rpc_id,
            protocol::selected_outcome(&option),
        ))
        .await
    }
}

#[async_trait]
impl AgentChannel for WsChannel {
    async fn send_prompt(&mut self, prompt: &str, context_files: &[PathBuf]) -> Result<(), RpcError> {
        let session_id = self.session_id()?;
        let mut blocks = vec![json!({ "type": "text", "text": prompt })];
        for path in context_files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            blocks.push(json!({
                "type": "resource_link",
                "uri": format!("file://{}", path.display()),
                "name": name,
            }));
        }
        let id = self
            .send_request(METHOD_PROMPT, json!({ "sessionId": session_id, "prompt": blocks }))
            .await?;
        self.prompt_id = Some(id);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ProtocolEvent>, RpcError> {
        loop {
            let Some(message) = self.recv().await? else {
                return Ok(None);
            };
            match message {
                Incoming::Response { id, result, error } if Some(id) == self.prompt_id => {
                    self.prompt_id = None;
                    if let Some(error) = error {
                        return Err(RpcError::Agent(protocol::error_message(&error)));
                    }
                    let stop_reason = result
                        .as_ref()
                        .and_then(|r| r.get("stopReason"))
                        .and_then(Value::as_str)
                        .unwrap_or("end_turn")
                        .to_string();
                    return Ok(Some(ProtocolEvent::TurnFinished { stop_reason }));
                }
                Incoming::Response { id, .. } => debug!(id, "ignoring stray response"),
                Incoming::Request { id, method, params } if method == METHOD_REQUEST_PERMISSION => {
                    let request = protocol::parse_permission_request(&params)?;
                    self.permissions.insert(
                        request.call.call_id.clone(),
                        PendingPermission {
                            rpc_id: id,
                            allow_option: request.allow_option,
                            reject_option: request.reject_option,
                        },
                    );
                    return Ok(Some(ProtocolEvent::ToolCall(request.call)));
                }
                Incoming::Request { id, method, .. } => self.refuse(id, &method).await?,
                Incoming::Notification { method, params } if method == METHOD_UPDATE => {
                    if let Some(event) = protocol::map_session_update(&params) {
                        return Ok(Some(event));
                    }
                }
                Incoming::Notification { method, .. } => debug!(method, "ignoring notification"),
            }
        }
    }

    async fn approve(&mut self, call_id: &str) -> Result<(), RpcError> {
        self.answer(call_id, true).await
    }

    async fn reject(&mut self, call_id: &str) -> Result<(), RpcError> {
        self.answer(call_id, false).await
    }

    async fn cancel(&mut self) -> Result<(), RpcError> {
        let pending: Vec<Value> = self.permissions.drain().map(|(_, p)| p.rpc_id).collect();
        for rpc_id in pending {
            self.send_json(&JsonRpcReply::result(rpc_id, protocol::cancelled_outcome()))
                .await?;
        }
        let Some(session_id) = self.session_id.clone() else {
            return Ok(());
        };
        if let Err(e) = self
            .send_json(&JsonRpcNotification::new(
                METHOD_CANCEL,
                json!({ "sessionId": session_id }),
            ))
            .await
        {
            warn!(error = %e, "failed to send cancel to agent");
            return Err(e);
        }
        Ok(())
    }
}
