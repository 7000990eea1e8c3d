//! Session data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ssh::AuthMethod;

/// Lifecycle state of a session.
///
/// The state machine only moves toward a terminal state: a Disconnected
/// or Failed session never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Paused,
    Disconnected,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Disconnected | SessionStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Connecting, Connected) => true,
            (Connected, Paused) | (Paused, Connected) => true,
            (_, Disconnected) | (_, Failed) => !self.is_terminal(),
            _ => false,
        }
    }
}

/// Input routing mode. Query diverts typed input to the RAG pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Normal,
    Query,
}

/// What an attached WebSocket client may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Owner,
    Collaborator,
    Observer,
}

impl AccessLevel {
    /// Observers may watch but never type or steer the session.
    pub fn can_write(self) -> bool {
        !matches!(self, AccessLevel::Observer)
    }
}

/// Terminal dimensions. Last write wins; resize is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Operating-system family detected by the fingerprinter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Windows,
    Linux,
    Macos,
    Freebsd,
    Unknown,
}

/// Detected remote OS details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    pub family: OsFamily,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<String>,
}

impl OsInfo {
    pub fn unknown() -> Self {
        Self {
            family: OsFamily::Unknown,
            version: String::new(),
            distribution: None,
        }
    }

    /// Human-readable label for status events, e.g. "Ubuntu 22.04".
    pub fn label(&self) -> String {
        let name = match (&self.distribution, self.family) {
            (Some(distro), _) => distro.clone(),
            (None, OsFamily::Windows) => "Windows".to_string(),
            (None, OsFamily::Linux) => "Linux".to_string(),
            (None, OsFamily::Macos) => "macOS".to_string(),
            (None, OsFamily::Freebsd) => "FreeBSD".to_string(),
            (None, OsFamily::Unknown) => "Unknown".to_string(),
        };
        if self.version.is_empty() {
            name
        } else {
            format!("{} {}", name, self.version)
        }
    }
}

/// Parameters for creating a session, as accepted by `POST /sessions`.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub target_host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    pub terminal_type: String,
    pub window: WindowSize,
    pub client_ip: Option<String>,
}

/// Plain copy of a session's observable state.
///
/// Materialized under the registry/state locks and handed out for
/// queries, so readers never race live status transitions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub user_id: String,
    pub target_host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: &'static str,
    pub status: SessionStatus,
    pub mode: SessionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_area_id: Option<String>,
    pub window_size: WindowSize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_info: Option<OsInfo>,
    pub terminal_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_stdout: u64,
    pub bytes_stderr: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        use SessionStatus::*;
        for terminal in [Disconnected, Failed] {
            for next in [Connecting, Connected, Paused, Disconnected, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn pause_resume_cycle_is_legal() {
        use SessionStatus::*;
        assert!(Connected.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Connecting));
    }

    #[test]
    fn os_info_label() {
        let ubuntu = OsInfo {
            family: OsFamily::Linux,
            version: "22.04".into(),
            distribution: Some("Ubuntu".into()),
        };
        assert_eq!(ubuntu.label(), "Ubuntu 22.04");

        assert_eq!(OsInfo::unknown().label(), "Unknown");
    }
}
