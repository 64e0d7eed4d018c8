//! WebSocket frame types.
//!
//! Every frame is a JSON object with a `"type"` discriminator. Inbound frames
//! decode into [`ClientMessage`]; UI-bound frames are [`ServerMessage`];
//! frames for a runner worker are [`WorkerMessage`]. UI frame fields are
//! camelCase, runner frames use the runner's own names.
//!
//! Frames that fail to decode, or carry an unknown `type`, are dropped by the
//! connection loop without closing the socket.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executions::events::EventEntry;
use crate::executions::{ExecutionStatus, ExecutionSummary};
use crate::runner::launch::ExecutionMode;

/// Frames received from UI clients and runner workers.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    RegisterUi,
    StartExecution(StartExecution),
    StopExecution {
        execution_id: String,
    },
    AttachExecution {
        execution_id: String,
        #[serde(default)]
        since: u64,
    },
    ListExecutions,
    SendWebhook {
        port: u16,
        #[serde(default)]
        payload: Value,
        path: Option<String>,
    },
    CheckBinary {
        path: Option<String>,
    },
    CheckPrerequisites {
        execution_mode: Option<ExecutionMode>,
        ansible_rulebook_path: Option<String>,
        container_image: Option<String>,
    },
    InstallAnsibleRulebook,
    GetAnsibleVersion {
        path: Option<String>,
    },
    GetCollectionList,
    TestTunnel {
        url: String,
        #[serde(default)]
        payload: Value,
    },
    CreateTunnel {
        port: u16,
        #[serde(default)]
        public: bool,
        forward_to: Option<u16>,
    },
    DeleteTunnel {
        port: u16,
    },
    UpdateTunnelForwarding {
        port: u16,
        forward_to: Option<u16>,
    },
    GetTunnelState,
    Heartbeat,

    /// Runner handshake: the dial-back from a spawned worker.
    #[serde(rename = "Worker")]
    Worker {
        #[serde(rename = "activation_id")]
        activation_id: String,
    },
    #[serde(rename = "Job")]
    Job,
    #[serde(rename = "AnsibleEvent")]
    AnsibleEvent,
    #[serde(rename = "Action")]
    Action,
    #[serde(rename = "Shutdown")]
    Shutdown,
    #[serde(rename = "SessionStats")]
    SessionStats,

    #[serde(other)]
    Unknown,
}

/// Body of `start_execution`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecution {
    pub rulebook: Option<String>,
    pub extra_vars: Option<Value>,
    pub env_vars: Option<BTreeMap<String, String>>,
    pub execution_mode: Option<ExecutionMode>,
    pub container_image: Option<String>,
    pub ansible_rulebook_path: Option<String>,
    pub working_directory: Option<String>,
    pub heartbeat: Option<u64>,
    pub extra_cli_args: Option<String>,
}

/// Decode a text frame. Returns the typed message and the raw object (runner
/// events are relayed verbatim). `None` for anything that is not a
/// well-formed frame.
pub fn parse_frame(text: &str) -> Option<(ClientMessage, Value)> {
    let raw: Value = serde_json::from_str(text).ok()?;
    raw.get("type")?.as_str()?;
    let msg = ClientMessage::deserialize(&raw).ok()?;
    Some((msg, raw))
}

/// Result of an outbound HTTP request (`send_webhook`, `test_tunnel`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryStatus {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisitesStatus {
    pub mode: ExecutionMode,
    pub ready: bool,
    pub checks: Vec<PrerequisiteCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collection {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionReport {
    pub success: bool,
    pub collections: Vec<Collection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply to `create_tunnel`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelCreated {
    pub success: bool,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_to: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One port's tunnel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub port: u16,
    pub public_url: Option<String>,
    pub tunnel_id: Option<String>,
    pub forward_to: Option<u16>,
}

/// Normalized record of a webhook received on a tunnel ingress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceived {
    pub port: u16,
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub timestamp: u64,
    pub forwarded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_to: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_failed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_error: Option<String>,
}

/// Frames sent to UI clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Registered {
        client_id: String,
    },
    ExecutionStarted {
        execution_id: String,
        ws_url: String,
    },
    ExecutionStopped {
        execution_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    ExecutionAttached {
        execution_id: String,
        status: ExecutionStatus,
        events: Vec<EventEntry>,
        dropped: u64,
    },
    ExecutionList {
        executions: Vec<ExecutionSummary>,
    },
    WorkerConnected {
        execution_id: String,
    },
    RulebookEvent {
        execution_id: String,
        event: Value,
    },
    SessionStats {
        execution_id: String,
        stats: Value,
    },
    ProcessOutput {
        execution_id: String,
        stream: String,
        data: String,
    },
    ProcessError {
        execution_id: String,
        error: String,
    },
    ProcessExited {
        execution_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    WebhookResponse(HttpOutcome),
    BinaryStatus(BinaryStatus),
    PrerequisitesStatus(PrerequisitesStatus),
    InstallationProgress {
        line: String,
    },
    InstallationComplete {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AnsibleVersionResponse(VersionReport),
    CollectionListResponse(CollectionReport),
    TestTunnelResponse(HttpOutcome),
    TunnelCreated(TunnelCreated),
    TunnelDeleted {
        success: bool,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TunnelForwardingUpdated {
        success: bool,
        port: u16,
        forward_to: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TunnelState {
        tunnels: Vec<TunnelInfo>,
    },
    TunnelWebhookReceived(WebhookReceived),
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Frames sent to a runner worker in answer to its `Worker` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Base64-encoded rulebook YAML.
    Rulebook { data: String },
    /// Base64-encoded extra vars YAML.
    ExtraVars { data: String },
    EndOfResponse,
}

/// Anything a connection's writer task can send.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Ui(ServerMessage),
    Worker(WorkerMessage),
}

impl From<ServerMessage> for Outbound {
    fn from(msg: ServerMessage) -> Self {
        Self::Ui(msg)
    }
}

impl From<WorkerMessage> for Outbound {
    fn from(msg: WorkerMessage) -> Self {
        Self::Worker(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start_execution() {
        let (msg, _) = parse_frame(
            r#"{"type":"start_execution","rulebook":"- hosts: all","executionMode":"container",
                "envVars":{"A":"1"},"heartbeat":5,"extraCliArgs":"-v"}"#,
        )
        .unwrap();
        let ClientMessage::StartExecution(start) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(start.rulebook.as_deref(), Some("- hosts: all"));
        assert_eq!(start.execution_mode, Some(ExecutionMode::Container));
        assert_eq!(start.env_vars.unwrap()["A"], "1");
        assert_eq!(start.heartbeat, Some(5));
        assert!(start.working_directory.is_none());
    }

    #[test]
    fn test_parse_camel_case_fields() {
        let (msg, _) =
            parse_frame(r#"{"type":"update_tunnel_forwarding","port":5000,"forwardTo":null}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::UpdateTunnelForwarding { port: 5000, forward_to: None }
        ));
        let (msg, _) = parse_frame(r#"{"type":"stop_execution","executionId":"abc"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::StopExecution { execution_id } if execution_id == "abc"));
    }

    #[test]
    fn test_runner_frames_keep_raw_payload() {
        let (msg, raw) =
            parse_frame(r#"{"type":"Job","job_id":"j1","ansible_rulebook_id":"x"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Job));
        assert_eq!(raw["job_id"], "j1");

        let (msg, _) = parse_frame(r#"{"type":"Worker","activation_id":"exec-1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Worker { activation_id } if activation_id == "exec-1"));
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        let (msg, _) = parse_frame(r#"{"type":"something_new","x":1}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));
        assert!(parse_frame("not json").is_none());
        assert!(parse_frame(r#"{"no_type":true}"#).is_none());
        assert!(parse_frame(r#"{"type":"create_tunnel","port":"abc"}"#).is_none());
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::ExecutionStarted {
            execution_id: "e1".to_string(),
            ws_url: "ws://127.0.0.1:5555/api/ws".to_string(),
        };
        assert_eq!(
            serde_json::to_value(Outbound::from(msg)).unwrap(),
            json!({"type": "execution_started", "executionId": "e1", "wsUrl": "ws://127.0.0.1:5555/api/ws"})
        );

        let msg = ServerMessage::TunnelCreated(TunnelCreated {
            success: true,
            port: 5000,
            forward_to: Some(8080),
            ..TunnelCreated::default()
        });
        assert_eq!(
            serde_json::to_value(msg).unwrap(),
            json!({"type": "tunnel_created", "success": true, "port": 5000, "forwardTo": 8080})
        );
    }

    #[test]
    fn test_worker_message_wire_shape() {
        assert_eq!(
            serde_json::to_value(Outbound::from(WorkerMessage::EndOfResponse)).unwrap(),
            json!({"type": "EndOfResponse"})
        );
        assert_eq!(
            serde_json::to_value(WorkerMessage::Rulebook { data: "LS0t".to_string() }).unwrap(),
            json!({"type": "Rulebook", "data": "LS0t"})
        );
    }
}
