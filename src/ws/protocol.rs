//! WebSocket wire protocol
//!
//! Every frame on the wire is one JSON object `{"type": ..., "data": ...}`.
//! Inbound frames come from browser clients; outbound events are produced
//! by the session engine and fanned out to every attachment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clients::suggestion::RiskLevel;
use crate::clients::vulnerability::{VulnerabilityAlert, VulnerabilitySummary};
use crate::session::types::{SessionMode, WindowSize};

/// Frames a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    TerminalInput {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    KeyboardShortcut {
        name: String,
        #[serde(default)]
        key: Option<String>,
    },
    ModeChange {
        new_mode: SessionMode,
        #[serde(default)]
        area_id: Option<String>,
    },
    RagQuery {
        query: String,
        #[serde(default)]
        area_id: Option<String>,
        #[serde(default)]
        include_terminal_context: bool,
    },
    ExecuteSuggestion {
        suggestion_id: String,
        #[serde(default)]
        acknowledge_risk: bool,
    },
    SessionControl {
        action: ControlAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    /// Detach this socket; the session keeps running for other clients.
    Terminate,
    /// Tear the whole session down (owner only).
    TerminateSession,
}

impl ClientFrame {
    /// Parse one wire frame. Trailing newline delimiters are tolerated.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw.trim_end_matches(['\r', '\n']))
    }
}

/// Status labels carried by `session_status` events. Wider than the
/// session lifecycle enum: it also covers transient notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Connecting,
    Connected,
    Paused,
    Resumed,
    Disconnected,
    Failed,
    OsDetected,
    Error,
}

/// Audit payload for suggested-command execution events.
#[derive(Debug, Clone, Serialize)]
pub struct CommandAudit {
    pub session_id: String,
    pub suggestion_id: String,
    pub command: String,
    pub risk_level: RiskLevel,
    pub initiated_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionOutcome {
    RequiresApproval,
    Executed,
    Error,
}

/// Events the gateway pushes to attached clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    TerminalOutput {
        data: String,
    },
    SessionStatus {
        status: StatusKind,
        message: String,
    },
    SessionEvent {
        event: String,
        client_id: String,
        timestamp: DateTime<Utc>,
    },
    ModeChangeAck {
        new_mode: SessionMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        area_id: Option<String>,
    },
    RagResponse(Value),
    SuggestionStatus {
        suggestion_id: String,
        status: SuggestionOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CommandStarting(CommandAudit),
    CommandExecuted(CommandAudit),
    CommandFailed(CommandAudit),
    VulnerabilityAlert(VulnerabilityAlert),
    VulnerabilitySummary(VulnerabilitySummary),
    /// Window-size echo so late joiners can mirror the pty dimensions.
    WindowSize(WindowSize),
}

impl ServerEvent {
    pub fn status(status: StatusKind, message: impl Into<String>) -> Self {
        ServerEvent::SessionStatus {
            status,
            message: message.into(),
        }
    }

    pub fn session_event(event: impl Into<String>, client_id: impl Into<String>) -> Self {
        ServerEvent::SessionEvent {
            event: event.into(),
            client_id: client_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Serialize for the wire. Output is a single line of JSON.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            // A serialization failure here is a programming error; send
            // a well-formed error frame instead of dropping the socket.
            format!(
                "{{\"type\":\"session_status\",\"data\":{{\"status\":\"error\",\"message\":\"internal serialization error: {e}\"}}}}"
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_terminal_input() {
        let frame =
            ClientFrame::parse(r#"{"type":"terminal_input","data":{"data":"ls -la\n"}}"#).unwrap();
        assert!(matches!(frame, ClientFrame::TerminalInput { data } if data == "ls -la\n"));
    }

    #[test]
    fn parses_with_trailing_newline() {
        let frame = ClientFrame::parse("{\"type\":\"resize\",\"data\":{\"cols\":120,\"rows\":40}}\n")
            .unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Resize {
                cols: 120,
                rows: 40
            }
        ));
    }

    #[test]
    fn parses_session_control_actions() {
        for (raw, expected) in [
            ("pause", ControlAction::Pause),
            ("resume", ControlAction::Resume),
            ("terminate", ControlAction::Terminate),
            ("terminate_session", ControlAction::TerminateSession),
        ] {
            let frame = ClientFrame::parse(&format!(
                r#"{{"type":"session_control","data":{{"action":"{raw}"}}}}"#
            ))
            .unwrap();
            assert!(matches!(
                frame,
                ClientFrame::SessionControl { action } if action == expected
            ));
        }
    }

    #[test]
    fn execute_suggestion_defaults_acknowledge_to_false() {
        let frame = ClientFrame::parse(
            r#"{"type":"execute_suggestion","data":{"suggestion_id":"s1"}}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            ClientFrame::ExecuteSuggestion {
                acknowledge_risk: false,
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_frame_type() {
        assert!(ClientFrame::parse(r#"{"type":"format_disk","data":{}}"#).is_err());
    }

    #[test]
    fn server_event_wire_shape() {
        let wire = ServerEvent::TerminalOutput {
            data: "hello".into(),
        }
        .to_wire();
        let value: Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(value["type"], "terminal_output");
        assert_eq!(value["data"]["data"], "hello");
    }

    #[test]
    fn status_event_wire_shape() {
        let wire = ServerEvent::status(StatusKind::Paused, "paused by 10.0.0.5").to_wire();
        let value: Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(value["type"], "session_status");
        assert_eq!(value["data"]["status"], "paused");
    }

    #[test]
    fn mode_change_ack_wire_shape() {
        let wire = ServerEvent::ModeChangeAck {
            new_mode: SessionMode::Query,
            area_id: Some("area-1".into()),
        }
        .to_wire();
        let value: Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(value["type"], "mode_change_ack");
        assert_eq!(value["data"]["new_mode"], "query");
        assert_eq!(value["data"]["area_id"], "area-1");
    }
}
