//! Byte-capped, line-oriented capture buffer for child stdio.

use std::collections::VecDeque;

/// Keeps the most recent whole lines of output within a byte budget.
/// Eviction drops whole lines oldest-first; a line is never split.
#[derive(Debug)]
pub struct RingBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            capacity,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        let cost = line.len() + 1;
        self.lines.push_back(line.to_string());
        self.bytes += cost;
        // An oversized single line is kept alone rather than split.
        while self.bytes > self.capacity && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
            }
        }
    }

    /// Take the buffered output, joined by newlines, leaving the buffer empty.
    pub fn drain(&mut self) -> String {
        let joined = self
            .lines
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.lines.clear();
        self.bytes = 0;
        joined
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }
}
