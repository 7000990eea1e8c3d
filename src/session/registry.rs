//! Session registry
//!
//! Central map of live sessions behind a read-write lock. The lock is
//! held only to swap pointers: every snapshot is materialized under it
//! and all I/O - dialing, broadcasting, collaborator calls - happens
//! after it is released. A create lock makes the capacity check atomic
//! with the insert.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::pty::{spawn_pty_loop, PtyCommand};
use super::session::Session;
use super::types::{SessionParams, SessionSnapshot, SessionStatus, WindowSize};
use crate::auth::AuthUser;
use crate::clients::Collaborators;
use crate::config::Config;
use crate::fingerprint;
use crate::ssh::{DialConfig, KnownHostsStore, SshClient, SshError};
use crate::ws::protocol::{ServerEvent, StatusKind};

/// Concurrent fingerprint/vulnerability workers across all sessions.
const FINGERPRINT_POOL_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("session limit reached ({current}/{max})")]
    CapacityReached { current: usize, max: usize },

    #[error("session {0} not found")]
    NotFound(String),
}

/// Mutable fields accepted by `update`.
#[derive(Debug, Default, Clone)]
pub struct SessionUpdate {
    pub window_size: Option<WindowSize>,
    pub keep_alive_secs: Option<u64>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Makes the cap check atomic with the insert
    create_lock: Mutex<()>,
    max_sessions: usize,
    config: Config,
    known_hosts: Arc<KnownHostsStore>,
    collaborators: Arc<Collaborators>,
    fingerprint_pool: Arc<Semaphore>,
}

impl SessionRegistry {
    pub fn new(
        config: Config,
        known_hosts: Arc<KnownHostsStore>,
        collaborators: Arc<Collaborators>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            max_sessions: config.max_sessions,
            config,
            known_hosts,
            collaborators,
            fingerprint_pool: Arc::new(Semaphore::new(FINGERPRINT_POOL_SIZE)),
        }
    }

    /// Allocate a session in Connecting state and start the async
    /// connect task. The descriptor is returned immediately; status
    /// changes are observable through `get`/WebSocket events.
    pub fn create(
        self: Arc<Self>,
        user_id: &str,
        params: SessionParams,
    ) -> Result<SessionSnapshot, RegistryError> {
        let session = self.register_session(user_id, &params)?;
        let snapshot = session.snapshot();

        tokio::spawn(async move {
            self.connect_task(session, params).await;
        });

        Ok(snapshot)
    }

    /// Insert a Connecting session, enforcing the cap. No I/O.
    fn register_session(
        &self,
        user_id: &str,
        params: &SessionParams,
    ) -> Result<Arc<Session>, RegistryError> {
        let _guard = self.create_lock.lock();

        let current = self.sessions.read().len();
        if current >= self.max_sessions {
            return Err(RegistryError::CapacityReached {
                current,
                max: self.max_sessions,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone(), user_id.to_string(), params));

        info!(
            "Creating session {}: {}@{}:{} ({} auth)",
            id, params.username, params.target_host, params.port, session.auth_method
        );

        self.sessions.write().insert(id, session.clone());
        Ok(session)
    }

    /// Dial the target and wire up the pty loop; on failure the session
    /// ends in Failed and leaves the registry.
    async fn connect_task(self: Arc<Self>, session: Arc<Session>, params: SessionParams) {
        // Best-effort registration with the durable session store
        if let Err(e) = self.collaborators.session.register(&session.snapshot()).await {
            warn!("Session {}: session service registration failed: {}", session.id, e);
        }

        let dial = DialConfig {
            host: params.target_host.clone(),
            port: params.port,
            username: params.username.clone(),
            auth: params.auth.clone(),
            terminal_type: params.terminal_type.clone(),
            cols: params.window.cols,
            rows: params.window.rows,
            connect_timeout: self.config.connect_timeout,
            known_hosts: self.known_hosts.clone(),
        };

        match SshClient::new(dial).connect(&session.id).await {
            Ok(outcome) => {
                let runtime = spawn_pty_loop(
                    session.clone(),
                    self.clone(),
                    outcome.channel,
                    outcome.controller,
                );
                session.install_runtime(runtime.clone());

                if !session.set_status(SessionStatus::Connected) {
                    // Terminated while the dial was in flight: tear the
                    // fresh connection back down
                    info!("Session {}: terminated during connect, closing", session.id);
                    let _ = runtime.cmd_tx.try_send(PtyCommand::Close);
                    runtime.controller.disconnect().await;
                    return;
                }

                session.broadcast(&ServerEvent::status(
                    StatusKind::Connected,
                    format!("connected to {}:{}", session.target_host, session.port),
                ));
                self.persist_status(&session.id, SessionStatus::Connected);

                fingerprint::spawn(
                    session,
                    self.collaborators.clone(),
                    self.fingerprint_pool.clone(),
                );
            }
            Err(e) => {
                if matches!(e, SshError::HostKeyMismatch { .. }) {
                    // Security event; the store has already refused the key
                    warn!("Session {}: {}", session.id, e);
                } else {
                    info!("Session {}: connect failed: {}", session.id, e);
                }

                session.set_status(SessionStatus::Failed);
                session.broadcast(&ServerEvent::status(
                    StatusKind::Error,
                    format!("connection failed: {e}"),
                ));
                session.attachments.clear();
                self.persist_status(&session.id, SessionStatus::Failed);
                self.remove(&session.id);
            }
        }
    }

    /// Live handle, for the WebSocket layer.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Plain-copy descriptor for REST queries.
    pub fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        self.get(id).map(|s| s.snapshot())
    }

    /// Paginated listing scoped to the caller (admins see everything).
    /// Returns the page plus the total number of matches.
    pub fn list(
        &self,
        user: &AuthUser,
        status: Option<SessionStatus>,
        limit: usize,
        offset: usize,
    ) -> (Vec<SessionSnapshot>, usize) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();

        let mut snapshots: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|s| s.snapshot())
            .filter(|snap| user.can_access(&snap.user_id))
            .filter(|snap| status.map_or(true, |wanted| snap.status == wanted))
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = snapshots.len();
        let page = snapshots.into_iter().skip(offset).take(limit).collect();
        (page, total)
    }

    /// Apply window-size / keep-alive changes.
    pub async fn update(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionSnapshot, RegistryError> {
        let session = self.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if let Some(secs) = update.keep_alive_secs {
            session.set_keep_alive_secs(secs);
        }

        if let Some(window) = update.window_size {
            if session.resize(window.cols, window.rows).await.is_err() {
                warn!("Session {}: resize on update failed (not connected)", id);
            }
        }

        Ok(session.snapshot())
    }

    /// Tear a session down on request.
    pub async fn terminate(&self, id: &str, reason: &str) -> Result<(), RegistryError> {
        let session = self.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.finish_session(&session, SessionStatus::Disconnected, reason)
            .await;
        Ok(())
    }

    /// Drive a session into its terminal state exactly once: close the
    /// SSH side, deliver the final status event, detach every client,
    /// and drop the registry entry. Safe to call from both pumps and
    /// the control path concurrently.
    pub async fn finish_session(
        &self,
        session: &Arc<Session>,
        status: SessionStatus,
        message: &str,
    ) {
        debug_assert!(status.is_terminal());
        if !session.set_status(status) {
            // Someone else already finished it
            return;
        }

        info!("Session {}: finished ({:?}: {})", session.id, status, message);

        if let Some(runtime) = session.runtime() {
            // Unwedge pumps that are parked on the pause flag
            let _ = runtime.pause_tx.send(false);
            let _ = runtime.cmd_tx.try_send(PtyCommand::Close);
            runtime.controller.disconnect().await;
        }

        let kind = match status {
            SessionStatus::Failed => StatusKind::Failed,
            _ => StatusKind::Disconnected,
        };
        session.broadcast(&ServerEvent::status(kind, message));
        session.attachments.clear();

        self.remove(&session.id);
        self.persist_status(&session.id, status);
    }

    fn remove(&self, id: &str) {
        self.sessions.write().remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Fire-and-forget persistence of a status transition.
    fn persist_status(&self, session_id: &str, status: SessionStatus) {
        let collaborators = self.collaborators.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = collaborators.session.update_status(&session_id, status).await {
                warn!("Session {}: status persistence failed: {}", session_id, e);
            }
        });
    }

    /// Graceful shutdown: finish every live session with a final event.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            self.finish_session(&session, SessionStatus::Disconnected, "gateway shutting down")
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::AuthMethod;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path, max_sessions: usize) -> Config {
        Config {
            server_port: 0,
            jwt_secret: "secret".into(),
            jwt_issuer: "aiss-api".into(),
            jwt_audience: "aiss-terminal".into(),
            allowed_origins: vec![],
            ssh_key_dir: dir.to_path_buf(),
            max_sessions,
            connect_timeout: std::time::Duration::from_secs(1),
            keep_alive_interval: std::time::Duration::from_secs(30),
            write_deadline: std::time::Duration::from_secs(3),
            session_service_url: "http://127.0.0.1:1".into(),
            suggestion_service_url: "http://127.0.0.1:1".into(),
            vuln_service_url: "http://127.0.0.1:1".into(),
            rag_agent_url: "http://127.0.0.1:1".into(),
        }
    }

    fn test_registry(max_sessions: usize) -> (SessionRegistry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), max_sessions);
        let known_hosts =
            Arc::new(KnownHostsStore::open(config.known_hosts_path()).unwrap());
        let collaborators = Arc::new(Collaborators::new(&config));
        (
            SessionRegistry::new(config, known_hosts, collaborators),
            dir,
        )
    }

    fn params(host: &str) -> SessionParams {
        SessionParams {
            target_host: host.into(),
            port: 22,
            username: "ops".into(),
            auth: AuthMethod::Password {
                password: "pw".into(),
            },
            terminal_type: "xterm-256color".into(),
            window: WindowSize::default(),
            client_ip: None,
        }
    }

    fn user(id: &str) -> AuthUser {
        AuthUser {
            user_id: id.into(),
            role: "user".into(),
        }
    }

    fn admin() -> AuthUser {
        AuthUser {
            user_id: "root".into(),
            role: "admin".into(),
        }
    }

    #[test]
    fn capacity_cap_is_enforced_without_partial_entries() {
        let (registry, _dir) = test_registry(2);

        registry.register_session("u1", &params("h1")).unwrap();
        registry.register_session("u1", &params("h2")).unwrap();

        let err = registry.register_session("u1", &params("h3")).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::CapacityReached { current: 2, max: 2 }
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn list_scopes_to_owner_and_filters_status() {
        let (registry, _dir) = test_registry(10);

        let s1 = registry.register_session("u1", &params("h1")).unwrap();
        registry.register_session("u2", &params("h2")).unwrap();
        s1.set_status(SessionStatus::Connected);

        let (mine, total) = registry.list(&user("u1"), None, 20, 0);
        assert_eq!(total, 1);
        assert_eq!(mine[0].user_id, "u1");

        let (connected, _) =
            registry.list(&user("u1"), Some(SessionStatus::Connected), 20, 0);
        assert_eq!(connected.len(), 1);
        let (connecting, _) =
            registry.list(&user("u1"), Some(SessionStatus::Connecting), 20, 0);
        assert!(connecting.is_empty());

        let (all, _) = registry.list(&admin(), None, 20, 0);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn list_paginates() {
        let (registry, _dir) = test_registry(10);
        for i in 0..5 {
            registry
                .register_session("u1", &params(&format!("h{i}")))
                .unwrap();
        }

        let (page, total) = registry.list(&user("u1"), None, 2, 0);
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);

        let (page, _) = registry.list(&user("u1"), None, 2, 4);
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn finish_session_is_idempotent_and_removes_entry() {
        let (registry, _dir) = test_registry(10);
        let session = registry.register_session("u1", &params("h1")).unwrap();
        session.set_status(SessionStatus::Connected);

        registry
            .finish_session(&session, SessionStatus::Disconnected, "test")
            .await;
        assert!(registry.is_empty());
        assert_eq!(session.status(), SessionStatus::Disconnected);

        // Second finish (e.g. the sibling pump) is a no-op
        registry
            .finish_session(&session, SessionStatus::Failed, "late")
            .await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn terminate_unknown_session_is_not_found() {
        let (registry, _dir) = test_registry(10);
        assert!(matches!(
            registry.terminate("nope", "test").await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
