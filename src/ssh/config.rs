//! SSH dial parameters

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ssh::KnownHostsStore;

/// Authentication material for a dial.
///
/// Key material arrives inline (PEM) from the session create request;
/// nothing is read from the operator's home directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// Private-key authentication
    Key {
        /// PEM-encoded private key
        private_key: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    /// Short descriptor for logs and session snapshots. Never includes
    /// the secret itself.
    pub fn descriptor(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
        }
    }
}

/// Everything the dialer needs to reach one remote target.
#[derive(Clone)]
pub struct DialConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    pub terminal_type: String,
    pub cols: u16,
    pub rows: u16,
    pub connect_timeout: Duration,
    /// Shared TOFU store; all dialers verify against the same file.
    pub known_hosts: Arc<KnownHostsStore>,
}

impl std::fmt::Debug for DialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth.descriptor())
            .field("terminal_type", &self.terminal_type)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish()
    }
}
