//! PTY I/O loop
//!
//! Three cooperating tasks per session:
//!
//! 1. The channel owner holds the russh channel. It is the only writer
//!    to remote stdin (total order over all clients' input) and demuxes
//!    incoming channel messages into bounded stdout/stderr queues.
//! 2. The stdout pump drains its queue through an adaptive buffer and
//!    broadcasts `terminal_output` frames.
//! 3. The stderr pump does the same with a smaller buffer cap.
//!
//! Pump reads run under a short deadline so a pause signal is observed
//! within one deadline period even when the remote is quiet. Either pump
//! finishing (EOF or error upstream) tears the whole session down.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::registry::SessionRegistry;
use super::session::{Session, SessionRuntime};
use super::types::SessionStatus;
use crate::ssh::HandleController;
use crate::ws::protocol::ServerEvent;

/// Deadline on each pump read; bounds how stale a pause signal can get.
const READ_DEADLINE: Duration = Duration::from_millis(100);
/// How often buffer sizing is revisited.
const MEMORY_RESET_INTERVAL: Duration = Duration::from_secs(300);
/// Starting buffer size for both pumps.
const INITIAL_BUFFER: usize = 1024;
/// Stdout buffer ceiling.
const STDOUT_MAX_BUFFER: usize = 16 * 1024;
/// Stderr buffer ceiling.
const STDERR_MAX_BUFFER: usize = 8 * 1024;
/// Cumulative transfer that triggers a buffer shrink and counter reset.
const MEMORY_SHRINK_THRESHOLD: u64 = 50 * 1024 * 1024;
/// Queue depth between the channel owner and each pump.
const PUMP_QUEUE_CAPACITY: usize = 64;
/// Command queue depth into the channel owner.
const CMD_QUEUE_CAPACITY: usize = 1024;

/// Commands accepted by the channel owner task.
#[derive(Debug)]
pub enum PtyCommand {
    /// Bytes for remote stdin
    Input(Vec<u8>),
    /// Window change (cols, rows)
    Resize(u16, u16),
    /// Close the channel
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpKind {
    Stdout,
    Stderr,
}

/// Start the channel owner and both pumps; returns the runtime handles
/// the session needs to steer them.
pub fn spawn_pty_loop(
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    channel: Channel<Msg>,
    controller: HandleController,
) -> SessionRuntime {
    let (cmd_tx, cmd_rx) = mpsc::channel::<PtyCommand>(CMD_QUEUE_CAPACITY);
    let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(PUMP_QUEUE_CAPACITY);
    let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(PUMP_QUEUE_CAPACITY);
    let (pause_tx, pause_rx) = watch::channel(false);
    let (ack_tx, ack_rx) = mpsc::channel(4);

    tokio::spawn(run_channel_owner(
        session.id.clone(),
        channel,
        cmd_rx,
        stdout_tx,
        stderr_tx,
    ));

    tokio::spawn(run_pump(
        PumpKind::Stdout,
        stdout_rx,
        session.clone(),
        registry.clone(),
        pause_rx.clone(),
        ack_tx.clone(),
        STDOUT_MAX_BUFFER,
    ));

    tokio::spawn(run_pump(
        PumpKind::Stderr,
        stderr_rx,
        session,
        registry,
        pause_rx,
        ack_tx,
        STDERR_MAX_BUFFER,
    ));

    SessionRuntime {
        cmd_tx,
        controller,
        pause_tx: Arc::new(pause_tx),
        pause_ack_rx: Arc::new(tokio::sync::Mutex::new(ack_rx)),
    }
}

/// Single owner of the russh channel: serializes stdin writes and
/// resizes, and feeds the pump queues.
///
/// Output forwarding never blocks the command path. A chunk that does
/// not fit its pump queue is parked in `pending`, and the loop stops
/// reading further channel messages (so the SSH flow-control window
/// throttles the remote) while it keeps servicing `cmd_rx` - typed
/// input and resizes go through even when both pumps are paused with
/// full queues.
async fn run_channel_owner(
    session_id: String,
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<PtyCommand>,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
) {
    debug!("Channel owner started for session {}", session_id);

    let mut pending: Option<(PumpKind, Vec<u8>)> = None;

    loop {
        if let Some((kind, _)) = pending {
            let tx = match kind {
                PumpKind::Stdout => &stdout_tx,
                PumpKind::Stderr => &stderr_tx,
            };

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    if !apply_command(&session_id, &mut channel, cmd).await {
                        break;
                    }
                }

                // reserve() leaves the chunk in `pending` if the command
                // arm wins the race; nothing is lost to a dropped future
                permit = tx.reserve() => {
                    match permit {
                        Ok(permit) => {
                            if let Some((_, chunk)) = pending.take() {
                                permit.send(chunk);
                            }
                        }
                        // Pump side is gone
                        Err(_) => break,
                    }
                }
            }
        } else {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    if !apply_command(&session_id, &mut channel, cmd).await {
                        break;
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if !forward(&stdout_tx, PumpKind::Stdout, data.to_vec(), &mut pending) {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            if !forward(&stderr_tx, PumpKind::Stderr, data.to_vec(), &mut pending) {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("Session {}: shell exited with status {}", session_id, exit_status);
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            info!("Session {}: pty channel closed", session_id);
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    }

    // Dropping the pump senders delivers EOF to both pumps
    debug!("Channel owner terminated for session {}", session_id);
}

/// Apply one command to the channel. Returns false when the owner loop
/// should stop.
async fn apply_command(
    session_id: &str,
    channel: &mut Channel<Msg>,
    cmd: Option<PtyCommand>,
) -> bool {
    match cmd {
        Some(PtyCommand::Input(data)) => {
            if let Err(e) = channel.data(&data[..]).await {
                error!("Session {}: stdin write failed: {}", session_id, e);
                return false;
            }
            true
        }
        Some(PtyCommand::Resize(cols, rows)) => {
            if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                // Resize failures do not kill the session
                error!("Session {}: window change failed: {}", session_id, e);
            } else {
                debug!("Session {}: pty resized to {}x{}", session_id, cols, rows);
            }
            true
        }
        Some(PtyCommand::Close) | None => {
            let _ = channel.eof().await;
            false
        }
    }
}

/// Hand a chunk to a pump without waiting: queue it if there is room,
/// otherwise park it as the pending chunk. Returns false when the pump
/// is gone.
fn forward(
    tx: &mpsc::Sender<Vec<u8>>,
    kind: PumpKind,
    chunk: Vec<u8>,
    pending: &mut Option<(PumpKind, Vec<u8>)>,
) -> bool {
    match tx.try_send(chunk) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(chunk)) => {
            *pending = Some((kind, chunk));
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Buffer that tracks an adaptive capacity between a floor and a
/// per-stream ceiling. The pump flushes it whenever it fills.
struct AdaptiveBuffer {
    data: Vec<u8>,
    capacity: usize,
    initial: usize,
    max: usize,
}

impl AdaptiveBuffer {
    fn new(initial: usize, max: usize) -> Self {
        Self {
            data: Vec::with_capacity(initial),
            capacity: initial,
            initial,
            max,
        }
    }

    fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append bytes; the caller never pushes more than `remaining()`.
    fn push(&mut self, chunk: &[u8]) {
        debug_assert!(chunk.len() <= self.remaining());
        self.data.extend_from_slice(chunk);
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.data, Vec::with_capacity(self.capacity))
    }

    /// Must only be called while empty (right after a flush).
    fn set_capacity(&mut self, capacity: usize) {
        let capacity = capacity.clamp(self.initial, self.max);
        if capacity != self.capacity {
            self.capacity = capacity;
            self.data = Vec::with_capacity(capacity);
        }
    }

    fn shrink(&mut self) {
        self.set_capacity(self.initial);
    }
}

/// Pick a capacity tracking the observed per-second transfer rate,
/// rounded up to a power of two within [initial, max].
fn target_capacity(bytes_since_reset: u64, elapsed: Duration, initial: usize, max: usize) -> usize {
    let secs = elapsed.as_secs().max(1);
    let per_second = (bytes_since_reset / secs) as usize;

    let mut capacity = initial;
    while capacity < per_second && capacity < max {
        capacity *= 2;
    }
    capacity.min(max)
}

/// One output pump: drains its queue into the adaptive buffer, fans out
/// `terminal_output`, and honors the pause flag between reads.
async fn run_pump(
    kind: PumpKind,
    mut rx: mpsc::Receiver<Vec<u8>>,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    mut pause_rx: watch::Receiver<bool>,
    ack_tx: mpsc::Sender<PumpKind>,
    max_buffer: usize,
) {
    let mut buf = AdaptiveBuffer::new(INITIAL_BUFFER, max_buffer);
    let mut window_started = Instant::now();
    let mut bytes_since_reset: u64 = 0;
    let mut cumulative: u64 = 0;

    debug!("Session {}: {:?} pump started", session.id, kind);

    loop {
        // Pause gate: acknowledge, then sleep until resumed. The queue
        // keeps its backlog, which stops the channel owner's output
        // reads (command processing stays live) until resume drains it.
        if *pause_rx.borrow() {
            let _ = ack_tx.try_send(kind);
            loop {
                if pause_rx.changed().await.is_err() {
                    // Control side gone; treat as resumed and drain out
                    break;
                }
                if !*pause_rx.borrow() {
                    break;
                }
            }
            continue;
        }

        match tokio::time::timeout(READ_DEADLINE, rx.recv()).await {
            // Deadline expired: loop around and revisit the pause flag
            Err(_) => {}
            // Upstream closed: EOF
            Ok(None) => break,
            Ok(Some(chunk)) => {
                feed(&session, kind, &mut buf, &chunk, &mut bytes_since_reset, &mut cumulative);

                // Coalesce whatever is already queued, within capacity
                while buf.remaining() > 0 {
                    match rx.try_recv() {
                        Ok(more) => feed(
                            &session,
                            kind,
                            &mut buf,
                            &more,
                            &mut bytes_since_reset,
                            &mut cumulative,
                        ),
                        Err(_) => break,
                    }
                }

                flush(&session, kind, &mut buf);
            }
        }

        if window_started.elapsed() >= MEMORY_RESET_INTERVAL {
            if cumulative > MEMORY_SHRINK_THRESHOLD {
                info!(
                    "Session {}: {:?} pump moved {} bytes, shrinking buffer and resetting counters",
                    session.id, kind, cumulative
                );
                buf.shrink();
                cumulative = 0;
                match kind {
                    PumpKind::Stdout => session.bytes_stdout.store(0, Ordering::Relaxed),
                    PumpKind::Stderr => session.bytes_stderr.store(0, Ordering::Relaxed),
                }
            } else {
                let target =
                    target_capacity(bytes_since_reset, window_started.elapsed(), INITIAL_BUFFER, max_buffer);
                buf.set_capacity(target);
            }
            bytes_since_reset = 0;
            window_started = Instant::now();
        }
    }

    flush(&session, kind, &mut buf);
    debug!("Session {}: {:?} pump stopped", session.id, kind);

    // Either pump ending takes the session with it; finish() is
    // idempotent so the second pump's call is a no-op.
    registry
        .finish_session(&session, SessionStatus::Disconnected, "connection closed")
        .await;
}

/// Push a chunk through the buffer, flushing every time it fills so no
/// single buffer ever exceeds its capacity.
fn feed(
    session: &Session,
    kind: PumpKind,
    buf: &mut AdaptiveBuffer,
    chunk: &[u8],
    bytes_since_reset: &mut u64,
    cumulative: &mut u64,
) {
    let counter = match kind {
        PumpKind::Stdout => &session.bytes_stdout,
        PumpKind::Stderr => &session.bytes_stderr,
    };
    counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    *bytes_since_reset += chunk.len() as u64;
    *cumulative += chunk.len() as u64;

    let mut offset = 0;
    while offset < chunk.len() {
        let take = (chunk.len() - offset).min(buf.remaining());
        buf.push(&chunk[offset..offset + take]);
        offset += take;
        if buf.remaining() == 0 {
            flush(session, kind, buf);
        }
    }
}

fn flush(session: &Session, _kind: PumpKind, buf: &mut AdaptiveBuffer) {
    if buf.is_empty() {
        return;
    }
    let data = buf.take();
    session.output_ring.append_chunk(&data);
    session.broadcast(&ServerEvent::TerminalOutput {
        data: String::from_utf8_lossy(&data).into_owned(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_buffer_flushes_never_exceed_capacity() {
        let mut buf = AdaptiveBuffer::new(4, 16);
        assert_eq!(buf.remaining(), 4);

        buf.push(b"abc");
        assert_eq!(buf.remaining(), 1);
        buf.push(b"d");
        assert_eq!(buf.remaining(), 0);

        let taken = buf.take();
        assert_eq!(taken, b"abcd");
        assert_eq!(buf.remaining(), 4);
    }

    #[test]
    fn set_capacity_clamps_to_bounds() {
        let mut buf = AdaptiveBuffer::new(1024, 16 * 1024);

        buf.set_capacity(1);
        assert_eq!(buf.capacity, 1024);

        buf.set_capacity(1 << 20);
        assert_eq!(buf.capacity, 16 * 1024);

        buf.set_capacity(4096);
        assert_eq!(buf.capacity, 4096);

        buf.shrink();
        assert_eq!(buf.capacity, 1024);
    }

    #[tokio::test]
    async fn forward_parks_overflow_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);
        let mut pending = None;

        // Fits: goes straight to the queue
        assert!(forward(&tx, PumpKind::Stdout, b"one".to_vec(), &mut pending));
        assert!(pending.is_none());

        // Queue full: parked, not awaited
        assert!(forward(&tx, PumpKind::Stdout, b"two".to_vec(), &mut pending));
        assert!(matches!(&pending, Some((PumpKind::Stdout, chunk)) if chunk == b"two"));

        // Receiver gone: reports the pump as closed
        drop(rx);
        assert!(!forward(&tx, PumpKind::Stderr, b"three".to_vec(), &mut pending));
    }

    #[test]
    fn target_capacity_tracks_throughput() {
        let interval = Duration::from_secs(300);

        // Idle stream stays at the floor
        assert_eq!(target_capacity(0, interval, 1024, 16 * 1024), 1024);

        // ~2 KiB/s working set rounds up to 2 KiB
        assert_eq!(
            target_capacity(2048 * 300, interval, 1024, 16 * 1024),
            2048
        );

        // A firehose is capped at the stream maximum
        assert_eq!(
            target_capacity(u64::MAX / 2, interval, 1024, 16 * 1024),
            16 * 1024
        );
    }
}
