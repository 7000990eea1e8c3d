//! A single live session
//!
//! A `Session` owns everything belonging to one SSH connection: the
//! command channel into the pty loop, the controller for auxiliary
//! channels, the attachment list, byte counters, and the mode/status
//! state machine. Mutable state sits behind short-lived parking_lot
//! locks; nothing async ever runs while one is held.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::output_ring::OutputRing;
use super::pty::{PtyCommand, PumpKind};
use super::types::{
    OsInfo, SessionMode, SessionParams, SessionSnapshot, SessionStatus, WindowSize,
};
use crate::ssh::HandleController;
use crate::ws::mux::Attachments;
use crate::ws::protocol::ServerEvent;

/// Bounded wait for each pump's pause confirmation.
const PAUSE_ACK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("session input channel closed")]
    ChannelClosed,

    #[error("query mode requires a connected session")]
    ModeRequiresConnected,
}

/// Live plumbing installed once the SSH connection is up. Every field is
/// cheaply cloneable so callers can copy it out of the session lock and
/// do their I/O outside.
#[derive(Clone)]
pub struct SessionRuntime {
    pub cmd_tx: mpsc::Sender<PtyCommand>,
    pub controller: HandleController,
    pub pause_tx: Arc<watch::Sender<bool>>,
    pub pause_ack_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PumpKind>>>,
}

struct State {
    status: SessionStatus,
    mode: SessionMode,
    active_area_id: Option<String>,
    window: WindowSize,
    os_info: Option<OsInfo>,
    last_activity: DateTime<Utc>,
    paused_at: Option<Instant>,
    keep_alive_secs: Option<u64>,
}

pub struct Session {
    pub id: String,
    pub user_id: String,
    pub target_host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: &'static str,
    pub terminal_type: String,
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,

    state: Mutex<State>,
    runtime: Mutex<Option<SessionRuntime>>,

    pub bytes_stdout: AtomicU64,
    pub bytes_stderr: AtomicU64,

    pub attachments: Attachments,
    pub output_ring: OutputRing,

    consumed_suggestions: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("target_host", &self.target_host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("terminal_type", &self.terminal_type)
            .field("client_ip", &self.client_ip)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(id: String, user_id: String, params: &SessionParams) -> Self {
        Self {
            id,
            user_id,
            target_host: params.target_host.clone(),
            port: params.port,
            username: params.username.clone(),
            auth_method: params.auth.descriptor(),
            terminal_type: params.terminal_type.clone(),
            client_ip: params.client_ip.clone(),
            created_at: Utc::now(),
            state: Mutex::new(State {
                status: SessionStatus::Connecting,
                mode: SessionMode::Normal,
                active_area_id: None,
                window: params.window,
                os_info: None,
                last_activity: Utc::now(),
                paused_at: None,
                keep_alive_secs: None,
            }),
            runtime: Mutex::new(None),
            bytes_stdout: AtomicU64::new(0),
            bytes_stderr: AtomicU64::new(0),
            attachments: Attachments::new(),
            output_ring: OutputRing::default(),
            consumed_suggestions: Mutex::new(HashSet::new()),
        }
    }

    // ---- status ----------------------------------------------------

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Apply a status transition if it is legal. Terminal states are
    /// absorbing; illegal transitions are ignored and reported false.
    pub fn set_status(&self, next: SessionStatus) -> bool {
        let mut state = self.state.lock();
        if !state.status.can_transition_to(next) {
            debug!(
                "Session {}: ignoring illegal transition {:?} -> {:?}",
                self.id, state.status, next
            );
            return false;
        }
        state.status = next;
        state.last_activity = Utc::now();
        true
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Utc::now();
    }

    /// Copy out the observable state. Taken under the state lock so a
    /// concurrent transition can never produce a torn read.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            target_host: self.target_host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth_method: self.auth_method,
            status: state.status,
            mode: state.mode,
            active_area_id: state.active_area_id.clone(),
            window_size: state.window,
            os_info: state.os_info.clone(),
            terminal_type: self.terminal_type.clone(),
            client_ip: self.client_ip.clone(),
            created_at: self.created_at,
            last_activity: state.last_activity,
            bytes_stdout: self.bytes_stdout.load(Ordering::Relaxed),
            bytes_stderr: self.bytes_stderr.load(Ordering::Relaxed),
        }
    }

    // ---- runtime ---------------------------------------------------

    pub fn install_runtime(&self, runtime: SessionRuntime) {
        *self.runtime.lock() = Some(runtime);
    }

    pub fn runtime(&self) -> Option<SessionRuntime> {
        self.runtime.lock().clone()
    }

    fn runtime_or_err(&self) -> Result<SessionRuntime, SessionError> {
        self.runtime().ok_or(SessionError::NotConnected)
    }

    // ---- terminal input --------------------------------------------

    /// Forward bytes to remote stdin through the session's single
    /// writer. Arrival order at the command channel is the order the
    /// remote sees.
    pub async fn write_stdin(&self, data: Vec<u8>) -> Result<(), SessionError> {
        if self.status().is_terminal() {
            return Err(SessionError::NotConnected);
        }
        let runtime = self.runtime_or_err()?;
        runtime
            .cmd_tx
            .send(PtyCommand::Input(data))
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        self.touch();
        Ok(())
    }

    /// Update the window size and push a window-change to the remote
    /// pty. Last value wins; repeating the same size is harmless.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            state.window = WindowSize { cols, rows };
            state.last_activity = Utc::now();
        }
        let runtime = self.runtime_or_err()?;
        runtime
            .cmd_tx
            .send(PtyCommand::Resize(cols, rows))
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        Ok(())
    }

    pub fn window(&self) -> WindowSize {
        self.state.lock().window
    }

    // ---- mode ------------------------------------------------------

    pub fn mode(&self) -> (SessionMode, Option<String>) {
        let state = self.state.lock();
        (state.mode, state.active_area_id.clone())
    }

    /// Switch between Normal and Query input routing.
    ///
    /// Every transition (including a repeated request for the current
    /// mode) broadcasts `mode_change_ack` so all attached UIs converge,
    /// regardless of whether a shortcut or an explicit message triggered
    /// it.
    pub fn set_mode(
        &self,
        new_mode: SessionMode,
        area_id: Option<String>,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if new_mode == SessionMode::Query && state.status != SessionStatus::Connected {
                return Err(SessionError::ModeRequiresConnected);
            }
            state.mode = new_mode;
            state.active_area_id = match new_mode {
                SessionMode::Query => area_id.clone().or(Some("default".to_string())),
                SessionMode::Normal => None,
            };
            state.last_activity = Utc::now();
        }

        let (mode, area) = self.mode();
        info!("Session {}: mode -> {:?} (area {:?})", self.id, mode, area);
        self.broadcast(&ServerEvent::ModeChangeAck {
            new_mode: mode,
            area_id: area,
        });
        Ok(())
    }

    // ---- pause / resume --------------------------------------------

    /// Suspend both output pumps. Returns true if this call performed
    /// the transition; a second pause while paused changes nothing and
    /// broadcasts nothing.
    pub async fn pause(&self) -> Result<bool, SessionError> {
        {
            let mut state = self.state.lock();
            match state.status {
                SessionStatus::Paused => return Ok(false),
                SessionStatus::Connected => {}
                _ => return Err(SessionError::NotConnected),
            }
            state.status = SessionStatus::Paused;
            state.paused_at = Some(Instant::now());
            state.last_activity = Utc::now();
        }

        let runtime = self.runtime_or_err()?;

        // Drop stale confirmations from a previous cycle before
        // signaling, so an old ack cannot satisfy this pause.
        {
            let mut ack_rx = runtime.pause_ack_rx.lock().await;
            while ack_rx.try_recv().is_ok() {}
        }

        let _ = runtime.pause_tx.send(true);

        // Each pump checks the pause flag at least once per read
        // deadline; a pump that misses the bounded window is logged as a
        // dead reader rather than wedging the control path.
        let mut ack_rx = runtime.pause_ack_rx.lock().await;
        for _ in 0..2 {
            match tokio::time::timeout(PAUSE_ACK_TIMEOUT, ack_rx.recv()).await {
                Ok(Some(kind)) => debug!("Session {}: {:?} pump paused", self.id, kind),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Session {}: pump did not confirm pause within {:?}",
                        self.id, PAUSE_ACK_TIMEOUT
                    );
                    break;
                }
            }
        }

        Ok(true)
    }

    /// Resume a paused session. Returns the pause duration, or None if
    /// the session was not paused (duplicate resume is a no-op).
    pub async fn resume(&self) -> Result<Option<Duration>, SessionError> {
        let paused_for = {
            let mut state = self.state.lock();
            if state.status != SessionStatus::Paused {
                return Ok(None);
            }
            state.status = SessionStatus::Connected;
            state.last_activity = Utc::now();
            state.paused_at.take().map(|t| t.elapsed())
        };

        let runtime = self.runtime_or_err()?;
        let _ = runtime.pause_tx.send(false);

        Ok(Some(paused_for.unwrap_or_default()))
    }

    // ---- keep-alive ------------------------------------------------

    /// Per-session override of the WebSocket ping interval.
    pub fn set_keep_alive_secs(&self, secs: u64) {
        self.state.lock().keep_alive_secs = Some(secs.max(1));
    }

    pub fn keep_alive_override(&self) -> Option<Duration> {
        self.state.lock().keep_alive_secs.map(Duration::from_secs)
    }

    // ---- fingerprint results ---------------------------------------

    pub fn set_os_info(&self, info: OsInfo) {
        self.state.lock().os_info = Some(info);
    }

    pub fn os_info(&self) -> Option<OsInfo> {
        self.state.lock().os_info.clone()
    }

    // ---- suggestion replay guard -----------------------------------

    /// Claim a suggestion id for execution. Returns false when the id
    /// was already consumed during this session's lifetime.
    pub fn consume_suggestion(&self, suggestion_id: &str) -> bool {
        self.consumed_suggestions
            .lock()
            .insert(suggestion_id.to_string())
    }

    /// Release a claim after a failed execution so the user may retry.
    pub fn release_suggestion(&self, suggestion_id: &str) {
        self.consumed_suggestions.lock().remove(suggestion_id);
    }

    // ---- fan-out ---------------------------------------------------

    pub fn broadcast(&self, event: &ServerEvent) {
        self.attachments.broadcast(event);
    }

    pub fn broadcast_except(&self, exclude: &str, event: &ServerEvent) {
        self.attachments.broadcast_except(exclude, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::AuthMethod;

    fn params() -> SessionParams {
        SessionParams {
            target_host: "203.0.113.7".into(),
            port: 22,
            username: "ops".into(),
            auth: AuthMethod::Password {
                password: "hunter2".into(),
            },
            terminal_type: "xterm-256color".into(),
            window: WindowSize::default(),
            client_ip: Some("198.51.100.9".into()),
        }
    }

    fn session() -> Session {
        Session::new("sess-1".into(), "user-1".into(), &params())
    }

    #[test]
    fn starts_connecting_with_normal_mode() {
        let s = session();
        assert_eq!(s.status(), SessionStatus::Connecting);
        assert_eq!(s.mode().0, SessionMode::Normal);
        assert_eq!(s.auth_method, "password");
    }

    #[test]
    fn status_is_monotonic_toward_terminal() {
        let s = session();
        assert!(s.set_status(SessionStatus::Connected));
        assert!(s.set_status(SessionStatus::Disconnected));
        // Terminal state is absorbing
        assert!(!s.set_status(SessionStatus::Connected));
        assert!(!s.set_status(SessionStatus::Failed));
        assert_eq!(s.status(), SessionStatus::Disconnected);
    }

    #[test]
    fn query_mode_requires_connected() {
        let s = session();
        assert!(matches!(
            s.set_mode(SessionMode::Query, None),
            Err(SessionError::ModeRequiresConnected)
        ));

        s.set_status(SessionStatus::Connected);
        s.set_mode(SessionMode::Query, Some("net-ops".into())).unwrap();
        assert_eq!(
            s.mode(),
            (SessionMode::Query, Some("net-ops".to_string()))
        );

        s.set_mode(SessionMode::Normal, None).unwrap();
        assert_eq!(s.mode(), (SessionMode::Normal, None));
    }

    #[test]
    fn query_mode_defaults_area() {
        let s = session();
        s.set_status(SessionStatus::Connected);
        s.set_mode(SessionMode::Query, None).unwrap();
        assert_eq!(s.mode().1.as_deref(), Some("default"));
    }

    #[test]
    fn suggestion_ids_consumed_at_most_once() {
        let s = session();
        assert!(s.consume_suggestion("s1"));
        assert!(!s.consume_suggestion("s1"));

        s.release_suggestion("s1");
        assert!(s.consume_suggestion("s1"));
    }

    #[tokio::test]
    async fn write_stdin_without_runtime_is_rejected() {
        let s = session();
        s.set_status(SessionStatus::Connected);
        assert!(matches!(
            s.write_stdin(b"ls\n".to_vec()).await,
            Err(SessionError::NotConnected)
        ));
    }

    /// Fake runtime: commands land in the returned receiver, nothing is
    /// connected to the pause/ack plumbing.
    fn fake_runtime() -> (SessionRuntime, mpsc::Receiver<PtyCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (owner_tx, _owner_rx) = mpsc::channel(4);
        let (pause_tx, _pause_rx) = watch::channel(false);
        let (_ack_tx, ack_rx) = mpsc::channel(4);

        (
            SessionRuntime {
                cmd_tx,
                controller: crate::ssh::HandleController::new(owner_tx),
                pause_tx: Arc::new(pause_tx),
                pause_ack_rx: Arc::new(tokio::sync::Mutex::new(ack_rx)),
            },
            cmd_rx,
        )
    }

    #[tokio::test]
    async fn stdin_writes_preserve_order() {
        let s = session();
        s.set_status(SessionStatus::Connected);
        let (runtime, mut cmd_rx) = fake_runtime();
        s.install_runtime(runtime);

        s.write_stdin(b"first".to_vec()).await.unwrap();
        s.write_stdin(b"second".to_vec()).await.unwrap();

        assert!(matches!(cmd_rx.recv().await, Some(PtyCommand::Input(d)) if d == b"first"));
        assert!(matches!(cmd_rx.recv().await, Some(PtyCommand::Input(d)) if d == b"second"));
    }

    #[tokio::test]
    async fn resize_is_idempotent_last_value_wins() {
        let s = session();
        s.set_status(SessionStatus::Connected);
        let (runtime, mut cmd_rx) = fake_runtime();
        s.install_runtime(runtime);

        s.resize(120, 40).await.unwrap();
        s.resize(120, 40).await.unwrap();
        assert_eq!(s.window(), WindowSize { cols: 120, rows: 40 });

        s.resize(132, 43).await.unwrap();
        assert_eq!(s.window(), WindowSize { cols: 132, rows: 43 });

        for expected in [(120, 40), (120, 40), (132, 43)] {
            assert!(matches!(
                cmd_rx.recv().await,
                Some(PtyCommand::Resize(c, r)) if (c, r) == expected
            ));
        }
    }

    #[tokio::test]
    async fn pause_twice_pauses_exactly_once() {
        let s = session();
        s.set_status(SessionStatus::Connected);
        let (runtime, _cmd_rx) = fake_runtime();
        s.install_runtime(runtime);

        assert!(s.pause().await.unwrap());
        assert_eq!(s.status(), SessionStatus::Paused);
        // Second pause changes nothing (and signals no broadcast)
        assert!(!s.pause().await.unwrap());

        let paused_for = s.resume().await.unwrap();
        assert!(paused_for.is_some());
        assert_eq!(s.status(), SessionStatus::Connected);

        // Resume while running is a no-op
        assert!(s.resume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pause_before_connect_is_rejected() {
        let s = session();
        assert!(matches!(s.pause().await, Err(SessionError::NotConnected)));
    }

    #[test]
    fn snapshot_copies_state() {
        let s = session();
        s.set_status(SessionStatus::Connected);
        s.bytes_stdout.store(42, Ordering::Relaxed);

        let snap = s.snapshot();
        assert_eq!(snap.status, SessionStatus::Connected);
        assert_eq!(snap.bytes_stdout, 42);
        assert_eq!(snap.target_host, "203.0.113.7");
        assert_eq!(snap.window_size, WindowSize { cols: 80, rows: 24 });
    }
}
