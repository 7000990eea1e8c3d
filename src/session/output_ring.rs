//! Recent-output ring
//!
//! Keeps the last N plain-text lines of pty output per session. Used as
//! optional terminal context for RAG queries. ANSI escape sequences are
//! stripped through a vte state machine so the context reads like what
//! the user actually saw.

use std::collections::VecDeque;

use parking_lot::Mutex;
use vte::{Params, Parser, Perform};

/// Default maximum lines retained per session.
pub const DEFAULT_MAX_LINES: usize = 200;

struct LineAccumulator {
    current: String,
    completed: Vec<String>,
}

impl Perform for LineAccumulator {
    fn print(&mut self, c: char) {
        self.current.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.completed.push(std::mem::take(&mut self.current)),
            b'\t' => self.current.push_str("    "),
            b'\x08' => {
                self.current.pop();
            }
            // \r is usually paired with \n; dropping it preserves content
            _ => {}
        }
    }

    fn hook(&mut self, _: &Params, _: &[u8], _: bool, _: char) {}
    fn put(&mut self, _: u8) {}
    fn unhook(&mut self) {}
    fn osc_dispatch(&mut self, _: &[&[u8]], _: bool) {}
    fn csi_dispatch(&mut self, _: &Params, _: &[u8], _: bool, _: char) {}
    fn esc_dispatch(&mut self, _: &[u8], _: bool, _: u8) {}
}

struct RingState {
    lines: VecDeque<String>,
    parser: Parser,
    accumulator: LineAccumulator,
}

/// Thread-safe ring of recent terminal lines.
pub struct OutputRing {
    state: Mutex<RingState>,
    max_lines: usize,
}

impl OutputRing {
    pub fn new(max_lines: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                lines: VecDeque::with_capacity(max_lines.min(64)),
                parser: Parser::new(),
                accumulator: LineAccumulator {
                    current: String::new(),
                    completed: Vec::new(),
                },
            }),
            max_lines,
        }
    }

    /// Feed a raw pty chunk. Partial lines carry over to the next chunk.
    pub fn append_chunk(&self, data: &[u8]) {
        let mut state = self.state.lock();
        let RingState {
            parser,
            accumulator,
            lines,
        } = &mut *state;

        parser.advance(accumulator, data);

        for line in accumulator.completed.drain(..) {
            if line.is_empty() {
                continue;
            }
            if lines.len() >= self.max_lines {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    /// Last `count` completed lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<String> {
        let state = self.state.lock();
        let len = state.lines.len();
        let start = len.saturating_sub(count);
        state.lines.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OutputRing {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_and_strips_ansi() {
        let ring = OutputRing::default();
        ring.append_chunk(b"\x1b[32muser@host\x1b[0m:~$ ls\r\nREADME.md  src\r\n");

        let tail = ring.tail(10);
        assert_eq!(tail, vec!["user@host:~$ ls", "README.md  src"]);
    }

    #[test]
    fn partial_lines_carry_across_chunks() {
        let ring = OutputRing::default();
        ring.append_chunk(b"hello ");
        ring.append_chunk(b"world\n");

        assert_eq!(ring.tail(1), vec!["hello world"]);
    }

    #[test]
    fn ring_is_bounded() {
        let ring = OutputRing::new(3);
        for i in 0..10 {
            ring.append_chunk(format!("line{i}\n").as_bytes());
        }

        assert_eq!(ring.tail(10), vec!["line7", "line8", "line9"]);
    }

    #[test]
    fn tail_returns_requested_count() {
        let ring = OutputRing::default();
        for i in 0..5 {
            ring.append_chunk(format!("l{i}\n").as_bytes());
        }

        assert_eq!(ring.tail(2), vec!["l3", "l4"]);
    }
}
