//! Captured service output.
//!
//! `LogBuffer` is the per-key ring behind `get_logs`; `LogLine` is what
//! subscribers receive.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Written by the supervisor: start header, spawn errors, exit and stop notes.
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub stream: StreamKind,
}

impl LogLine {
    pub fn new(text: impl Into<String>, stream: StreamKind) -> Self {
        Self {
            text: text.into(),
            stream,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(text, StreamKind::System)
    }
}

/// Last `capacity` lines of one service, oldest first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    capacity: usize,
    ring: VecDeque<LogLine>,
}

impl LogBuffer {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Appends `line`, evicting the oldest line when full. Returns whether
    /// anything was evicted.
    pub fn push(&mut self, line: LogLine) -> bool {
        let evicted = self.ring.len() >= self.capacity;
        if evicted {
            self.ring.pop_front();
        }
        self.ring.push_back(line);
        evicted
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.ring.iter()
    }

    pub fn texts(&self) -> Vec<String> {
        self.ring.iter().map(|line| line.text.clone()).collect()
    }
}

/// Removes ANSI escapes when `strip_ansi` is set; invalid UTF-8 becomes U+FFFD.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if strip_ansi {
        String::from_utf8_lossy(&strip(text.as_bytes())).into_owned()
    } else {
        text.to_string()
    }
}

/// Decodes a raw line read from a child pipe, trimming the line terminator.
pub fn decode_line(raw: &[u8], strip_ansi: bool) -> String {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    let text = String::from_utf8_lossy(&raw[..end]);
    sanitize_text(&text, strip_ansi)
}
