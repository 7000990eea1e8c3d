//! Query-mode input handling
//!
//! While a session is in Query mode, typed input is buffered per client
//! and never reaches SSH stdin. A completed line becomes a RAG query
//! (with the active knowledge area and, optionally, the tail of the
//! output ring as context); typing `exit` drops back to Normal mode.
//! Remote output keeps streaming throughout - only the input path is
//! diverted.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clients::rag::RagQueryRequest;
use crate::clients::Collaborators;
use crate::session::Session;
use crate::ws::protocol::{ServerEvent, StatusKind};

/// Shortcut name that toggles query mode.
pub const QUERY_SHORTCUT: &str = "ctrl_alt_q";
/// Typing this as a whole line leaves query mode.
pub const QUERY_EXIT_COMMAND: &str = "exit";
/// Output-ring lines attached to a query as terminal context.
pub const TERMINAL_CONTEXT_LINES: usize = 20;

/// Per-client line editor for query mode. Each attachment gets its own
/// buffer so collaborators' half-typed queries do not interleave.
#[derive(Default)]
pub struct QueryLineBuffer {
    pending: String,
}

impl QueryLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed typed input; returns the lines completed by this chunk.
    /// Handles backspace and both newline conventions; empty lines are
    /// swallowed rather than dispatched.
    pub fn feed(&mut self, input: &str) -> Vec<String> {
        let mut completed = Vec::new();

        for ch in input.chars() {
            match ch {
                '\r' | '\n' => {
                    let line = std::mem::take(&mut self.pending);
                    let line = line.trim().to_string();
                    if !line.is_empty() {
                        completed.push(line);
                    }
                }
                // Backspace / delete
                '\u{8}' | '\u{7f}' => {
                    self.pending.pop();
                }
                c if !c.is_control() => self.pending.push(c),
                _ => {}
            }
        }

        completed
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Dispatch one query to the RAG agent and fan the answer out.
///
/// Collaborator failures degrade to a non-fatal status event; the
/// session is never affected.
pub async fn dispatch(
    session: Arc<Session>,
    collaborators: Arc<Collaborators>,
    query: String,
    area_id: Option<String>,
    include_terminal_context: bool,
) {
    let context = if include_terminal_context && !session.output_ring.is_empty() {
        Some(session.output_ring.tail(TERMINAL_CONTEXT_LINES))
    } else {
        None
    };

    debug!(
        "Session {}: dispatching query to area {:?} ({} context lines)",
        session.id,
        area_id,
        context.as_ref().map_or(0, |c| c.len())
    );

    let request = RagQueryRequest {
        query: &query,
        user_id: &session.user_id,
        area_id: area_id.as_deref(),
        terminal_context: context,
    };

    match collaborators.rag.query(&request).await {
        Ok(response) => {
            session.broadcast(&ServerEvent::RagResponse(response));
        }
        Err(e) => {
            warn!("Session {}: RAG query failed: {}", session.id, e);
            session.broadcast(&ServerEvent::status(
                StatusKind::Error,
                format!("query failed: {e}"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_until_newline() {
        let mut buf = QueryLineBuffer::new();
        assert!(buf.feed("what is my ").is_empty());
        assert_eq!(buf.pending(), "what is my ");

        let lines = buf.feed("disk usage?\n");
        assert_eq!(lines, vec!["what is my disk usage?"]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn carriage_return_completes_a_line() {
        let mut buf = QueryLineBuffer::new();
        let lines = buf.feed("how much memory?\r");
        assert_eq!(lines, vec!["how much memory?"]);

        // The \n of a \r\n pair produces no phantom empty line
        assert!(buf.feed("\n").is_empty());
    }

    #[test]
    fn backspace_edits_the_pending_line() {
        let mut buf = QueryLineBuffer::new();
        buf.feed("lss");
        buf.feed("\u{7f}");
        let lines = buf.feed("\n");
        assert_eq!(lines, vec!["ls"]);
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut buf = QueryLineBuffer::new();
        let lines = buf.feed("first\nsecond\nthird");
        assert_eq!(lines, vec!["first", "second"]);
        assert_eq!(buf.pending(), "third");
    }

    #[test]
    fn empty_lines_are_swallowed() {
        let mut buf = QueryLineBuffer::new();
        assert!(buf.feed("\n\n\r\n").is_empty());
    }
}
