//! Handle owner task and auxiliary command execution
//!
//! Only one task owns the russh `Handle`. Everything else - the dialer
//! opening the interactive channel, the fingerprinter opening probe
//! channels - goes through a `HandleController`, which sends commands
//! over an mpsc channel. This avoids holding a lock across `.await` and
//! serializes all protocol-level operations on the connection.

use std::time::Duration;

use russh::client::{Handle, Handler, Msg};
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Commands understood by the handle owner task.
pub enum HandleCommand {
    /// Open a session channel (interactive pty or one-shot exec)
    OpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    /// Disconnect the SSH connection
    Disconnect,
}

/// Cloneable controller for the handle owner task.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Build a controller around an existing command channel. Production
    /// code goes through `spawn_handle_owner`; this is for tests.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a session channel on the shared connection.
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection and stop the owner task.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the owner task is still alive.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Run one command on an auxiliary channel and collect its output.
    ///
    /// Used by the fingerprinter; never touches the interactive pty.
    /// Stdout and stderr are concatenated - probe parsers only look for
    /// markers, and some probes (e.g. `ssh -V`) report on stderr.
    pub async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SshError> {
        let mut channel = self.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("exec failed: {e}")))?;

        let mut output = Vec::new();
        let mut exit_status = None;

        let collect = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => output.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext: 1 } => output.extend_from_slice(&data),
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => {}
                }
            }
        };

        if tokio::time::timeout(timeout, collect).await.is_err() {
            debug!("Command timed out after {:?}: {}", timeout, command);
            return Err(SshError::Timeout(format!("command timed out: {command}")));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output).into_owned(),
            exit_status: exit_status.unwrap_or(0),
        })
    }
}

/// Collected output of an auxiliary command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_status: u32,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// Spawn the owner task for `handle` and return its controller.
pub fn spawn_handle_owner<H>(handle: Handle<H>, session_id: String) -> HandleController
where
    H: Handler + Send + 'static,
{
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let mut handle = handle;
        debug!("Handle owner task started for session {}", session_id);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::OpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }
                HandleCommand::Disconnect => {
                    info!("Disconnect requested for session {}", session_id);
                    break;
                }
            }
        }

        // Drain queued commands so callers see Disconnected instead of
        // hanging on the reply channel.
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let HandleCommand::OpenSession { reply_tx } = cmd {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
        }

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
            .await;
        debug!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx }
}
