//! WebSocket connection handling
//!
//! One task triple per attached client: this read loop, a writer task
//! that serializes all outbound traffic under the write deadline, and a
//! keep-alive pinger with a small failure budget. The read loop parses
//! typed JSON frames and routes them through the session - including the
//! query-mode diversion that keeps typed input away from SSH stdin.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::mux::{Attachment, Outbound};
use super::protocol::{ClientFrame, ControlAction, ServerEvent, StatusKind};
use crate::api::AppState;
use crate::auth::AuthUser;
use crate::query::{self, QueryLineBuffer, QUERY_EXIT_COMMAND, QUERY_SHORTCUT};
use crate::session::types::{AccessLevel, SessionMode, SessionStatus};
use crate::session::Session;
use crate::suggest;

/// Consecutive keep-alive enqueue failures before forced detach.
const PING_FAILURE_BUDGET: u32 = 3;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Attach read-only regardless of identity.
    #[serde(default)]
    observer: bool,
}

/// `GET /sessions/{id}/connect` - upgrade to the session WebSocket.
pub async fn session_connect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    user: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if !state.config.origin_allowed(origin.as_deref()) {
        warn!(
            "Rejected WebSocket upgrade for session {} from disallowed origin {:?}",
            id, origin
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some(session) = state.registry.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // The session owner drives; admins may collaborate; everyone else
    // watches. An explicit observer request always wins.
    let access = if params.observer {
        AccessLevel::Observer
    } else if user.user_id == session.user_id {
        AccessLevel::Owner
    } else if user.is_admin() {
        AccessLevel::Collaborator
    } else {
        AccessLevel::Observer
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, session, user, access, addr))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session: Arc<Session>,
    user: AuthUser,
    access: AccessLevel,
    addr: SocketAddr,
) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (attachment, out_rx) = Attachment::new(addr.to_string(), access);

    info!(
        "Session {}: client {} attached as {:?}",
        session.id, addr, access
    );

    // Status snapshot is enqueued before registration, so this client
    // sees its `session_status` before any broadcast terminal_output.
    attachment.send_event(&ServerEvent::status(
        status_kind(session.status()),
        format!("attached to {}@{}", session.username, session.target_host),
    ));
    attachment.send_event(&ServerEvent::WindowSize(session.window()));

    session.attachments.register(attachment.clone());
    session.broadcast_except(
        &attachment.id,
        &ServerEvent::session_event("client_connected", addr.to_string()),
    );

    let writer = tokio::spawn(run_writer(ws_sink, out_rx, state.config.write_deadline));
    let keepalive = tokio::spawn(run_keepalive(
        attachment.clone(),
        session.clone(),
        state.config.keep_alive_interval,
    ));

    let mut query_buffer = QueryLineBuffer::new();

    while let Some(message) = ws_stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Session {}: dropping non-UTF8 binary frame", session.id);
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue, // ping/pong handled by the stack
            Err(e) => {
                debug!("Session {}: read error from {}: {}", session.id, addr, e);
                break;
            }
        };

        let frame = match ClientFrame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                attachment.send_event(&ServerEvent::status(
                    StatusKind::Error,
                    format!("malformed frame: {e}"),
                ));
                continue;
            }
        };

        let flow = handle_frame(
            frame,
            &session,
            &attachment,
            &state,
            &user,
            &mut query_buffer,
        )
        .await;
        if flow.is_break() {
            break;
        }
    }

    // Detach: idempotent against the mux having already dropped us
    session.attachments.unregister(&attachment.id);
    keepalive.abort();
    attachment.request_close();
    // Bounded wait for the writer to drain; a wedged socket is left to
    // its own write deadline rather than stalling this cleanup
    let _ = tokio::time::timeout(state.config.write_deadline, writer).await;

    session.broadcast_except(
        &attachment.id,
        &ServerEvent::session_event("client_disconnected", addr.to_string()),
    );
    info!("Session {}: client {} detached", session.id, addr);
}

/// The per-socket writer: sole task touching the sink, every write
/// bounded by the deadline.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
    write_deadline: Duration,
) {
    while let Some(item) = out_rx.recv().await {
        let message = match item {
            Outbound::Frame(frame) => Message::Text(frame.to_string()),
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Close => break,
        };

        match tokio::time::timeout(write_deadline, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("WebSocket write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("WebSocket write exceeded {:?} deadline", write_deadline);
                break;
            }
        }
    }

    let _ = tokio::time::timeout(write_deadline, sink.send(Message::Close(None))).await;
}

/// Keep-alive pings with a small failure budget; a client whose queue
/// stays full for several intervals is forcibly detached.
async fn run_keepalive(
    attachment: Arc<Attachment>,
    session: Arc<Session>,
    default_interval: Duration,
) {
    let mut failures = 0u32;

    loop {
        let interval = session.keep_alive_override().unwrap_or(default_interval);
        tokio::time::sleep(interval).await;

        if session.status().is_terminal() {
            break;
        }

        if attachment.send_ping() {
            failures = 0;
        } else {
            failures += 1;
            if failures >= PING_FAILURE_BUDGET {
                warn!(
                    "Session {}: client {} missed {} pings, detaching",
                    session.id, attachment.remote_addr, failures
                );
                session.attachments.unregister(&attachment.id);
                attachment.request_close();
                break;
            }
        }
    }
}

fn status_kind(status: SessionStatus) -> StatusKind {
    match status {
        SessionStatus::Connecting => StatusKind::Connecting,
        SessionStatus::Connected => StatusKind::Connected,
        SessionStatus::Paused => StatusKind::Paused,
        SessionStatus::Disconnected => StatusKind::Disconnected,
        SessionStatus::Failed => StatusKind::Failed,
    }
}

fn reject_observer(attachment: &Attachment) {
    attachment.send_event(&ServerEvent::status(
        StatusKind::Error,
        "observer cannot write",
    ));
}

/// Route one parsed frame. `Break` detaches this socket.
async fn handle_frame(
    frame: ClientFrame,
    session: &Arc<Session>,
    attachment: &Arc<Attachment>,
    state: &AppState,
    user: &AuthUser,
    query_buffer: &mut QueryLineBuffer,
) -> ControlFlow<()> {
    match frame {
        ClientFrame::TerminalInput { data } => {
            if !attachment.access.can_write() {
                reject_observer(attachment);
                return ControlFlow::Continue(());
            }

            match session.mode() {
                (SessionMode::Normal, _) => {
                    if let Err(e) = session.write_stdin(data.into_bytes()).await {
                        attachment.send_event(&ServerEvent::status(
                            StatusKind::Error,
                            format!("input rejected: {e}"),
                        ));
                    }
                }
                (SessionMode::Query, area_id) => {
                    // Typed characters never reach SSH stdin in query
                    // mode; whole lines become RAG queries.
                    for line in query_buffer.feed(&data) {
                        if line == QUERY_EXIT_COMMAND {
                            query_buffer.clear();
                            if let Err(e) = session.set_mode(SessionMode::Normal, None) {
                                warn!("Session {}: mode change failed: {}", session.id, e);
                            }
                            break;
                        }
                        tokio::spawn(query::dispatch(
                            session.clone(),
                            state.collaborators.clone(),
                            line,
                            area_id.clone(),
                            true,
                        ));
                    }
                }
            }
        }

        ClientFrame::Resize { cols, rows } => {
            if !attachment.access.can_write() {
                reject_observer(attachment);
                return ControlFlow::Continue(());
            }
            if cols == 0 || rows == 0 {
                attachment.send_event(&ServerEvent::status(
                    StatusKind::Error,
                    "resize dimensions must be positive",
                ));
                return ControlFlow::Continue(());
            }
            if let Err(e) = session.resize(cols, rows).await {
                debug!("Session {}: resize failed: {}", session.id, e);
            }
        }

        ClientFrame::KeyboardShortcut { name, .. } => {
            if !attachment.access.can_write() {
                reject_observer(attachment);
                return ControlFlow::Continue(());
            }
            if name.eq_ignore_ascii_case(QUERY_SHORTCUT) {
                let target = match session.mode().0 {
                    SessionMode::Normal => SessionMode::Query,
                    SessionMode::Query => SessionMode::Normal,
                };
                query_buffer.clear();
                if let Err(e) = session.set_mode(target, None) {
                    attachment.send_event(&ServerEvent::status(
                        StatusKind::Error,
                        e.to_string(),
                    ));
                }
            } else {
                debug!("Session {}: ignoring shortcut {}", session.id, name);
            }
        }

        ClientFrame::ModeChange { new_mode, area_id } => {
            if !attachment.access.can_write() {
                reject_observer(attachment);
                return ControlFlow::Continue(());
            }
            query_buffer.clear();
            if let Err(e) = session.set_mode(new_mode, area_id) {
                attachment.send_event(&ServerEvent::status(StatusKind::Error, e.to_string()));
            }
        }

        ClientFrame::RagQuery {
            query,
            area_id,
            include_terminal_context,
        } => {
            if !attachment.access.can_write() {
                reject_observer(attachment);
                return ControlFlow::Continue(());
            }
            let area = area_id.or_else(|| session.mode().1);
            tokio::spawn(query::dispatch(
                session.clone(),
                state.collaborators.clone(),
                query,
                area,
                include_terminal_context,
            ));
        }

        ClientFrame::ExecuteSuggestion {
            suggestion_id,
            acknowledge_risk,
        } => {
            if !attachment.access.can_write() {
                reject_observer(attachment);
                return ControlFlow::Continue(());
            }
            tokio::spawn(suggest::execute(
                session.clone(),
                state.collaborators.clone(),
                suggestion_id,
                acknowledge_risk,
                attachment.clone(),
            ));
        }

        ClientFrame::SessionControl { action } => {
            return handle_control(action, session, attachment, state, user).await;
        }
    }

    ControlFlow::Continue(())
}

async fn handle_control(
    action: ControlAction,
    session: &Arc<Session>,
    attachment: &Arc<Attachment>,
    state: &AppState,
    user: &AuthUser,
) -> ControlFlow<()> {
    if !attachment.access.can_write() {
        reject_observer(attachment);
        return ControlFlow::Continue(());
    }

    match action {
        ControlAction::Pause => match session.pause().await {
            // Everyone, including the initiator, learns who paused
            Ok(true) => session.broadcast(&ServerEvent::status(
                StatusKind::Paused,
                format!("paused by {}", attachment.remote_addr),
            )),
            Ok(false) => {} // already paused: no duplicate broadcast
            Err(e) => {
                attachment.send_event(&ServerEvent::status(StatusKind::Error, e.to_string()));
            }
        },

        ControlAction::Resume => match session.resume().await {
            Ok(Some(paused_for)) => session.broadcast(&ServerEvent::status(
                StatusKind::Resumed,
                format!(
                    "resumed by {} after {}s",
                    attachment.remote_addr,
                    paused_for.as_secs()
                ),
            )),
            Ok(None) => {} // was not paused
            Err(e) => {
                attachment.send_event(&ServerEvent::status(StatusKind::Error, e.to_string()));
            }
        },

        ControlAction::Terminate => {
            // Detach this socket only; peers keep the session
            return ControlFlow::Break(());
        }

        ControlAction::TerminateSession => {
            if attachment.access != AccessLevel::Owner && !user.is_admin() {
                attachment.send_event(&ServerEvent::status(
                    StatusKind::Error,
                    "only the session owner may terminate the session",
                ));
                return ControlFlow::Continue(());
            }
            if let Err(e) = state
                .registry
                .terminate(&session.id, "terminated by owner")
                .await
            {
                debug!("Session {}: terminate failed: {}", session.id, e);
            }
            return ControlFlow::Break(());
        }
    }

    ControlFlow::Continue(())
}
