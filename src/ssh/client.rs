//! SSH dialer
//!
//! Dials the remote target within the configured timeout, verifies the
//! host key through the TOFU store, authenticates, and allocates a pty
//! running a login shell. The returned controller keeps the underlying
//! `Handle` usable for auxiliary channels (fingerprint probes) after the
//! interactive channel has been handed to the pty loop.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{Channel, Pty};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, DialConfig};
use super::error::SshError;
use super::exec::{spawn_handle_owner, HandleController};
use super::known_hosts::{HostKeyVerification, KnownHostsStore};

/// A successfully dialed session: the interactive pty channel plus a
/// controller for opening auxiliary channels on the same connection.
pub struct DialOutcome {
    pub channel: Channel<client::Msg>,
    pub controller: HandleController,
}

pub struct SshClient {
    config: DialConfig,
}

impl SshClient {
    pub fn new(config: DialConfig) -> Self {
        Self { config }
    }

    /// Connect, authenticate, and start an interactive shell on a pty.
    pub async fn connect(self, session_id: &str) -> Result<DialOutcome, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("Session {}: connecting to {}", session_id, addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("failed to resolve {addr}: {e}")))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed(format!("no address found for {addr}")))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler {
            host: self.config.host.clone(),
            port: self.config.port,
            known_hosts: self.config.known_hosts.clone(),
        };

        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("connection to {addr} timed out")))?
        .map_err(|e| match e {
            // Preserve the host-key error instead of wrapping it
            SshError::HostKeyMismatch { .. } => e,
            other => SshError::ConnectionFailed(other.to_string()),
        })?;

        debug!("Session {}: SSH handshake completed", session_id);

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                private_key,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "authentication rejected by server".to_string(),
            ));
        }

        info!(
            "Session {}: authenticated as {}@{}",
            session_id, self.config.username, self.config.host
        );

        let controller = spawn_handle_owner(handle, session_id.to_string());

        let mut channel = controller.open_session_channel().await?;

        channel
            .request_pty(
                false,
                &self.config.terminal_type,
                self.config.cols as u32,
                self.config.rows as u32,
                0,
                0,
                // Echo on plus standard baud modes, like an interactive login
                &[
                    (Pty::ECHO, 1),
                    (Pty::TTY_OP_ISPEED, 14400),
                    (Pty::TTY_OP_OSPEED, 14400),
                ],
            )
            .await
            .map_err(|e| SshError::ChannelError(format!("pty request failed: {e}")))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("shell request failed: {e}")))?;

        info!("Session {}: interactive shell started", session_id);

        Ok(DialOutcome {
            channel,
            controller,
        })
    }
}

/// russh callback handler; the only callback this gateway cares about is
/// host-key verification.
struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Arc<KnownHostsStore>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                // First contact: record and continue
                warn!(
                    "First contact with {}:{} (fingerprint: {}), trusting on first use",
                    self.host, self.port, fingerprint
                );
                self.known_hosts
                    .add_host(&self.host, self.port, server_public_key)?;
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}. Aborting connection.",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyMismatch {
                    host: self.host.clone(),
                    port: self.port,
                    expected: expected_fingerprint,
                    actual: actual_fingerprint,
                })
            }
        }
    }
}
