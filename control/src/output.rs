use std::collections::VecDeque;

pub const DEFAULT_HISTORY_LINES: usize = 500;
pub const MIN_HISTORY_LINES: usize = 16;

/// Which pipe of the daemon a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One line of daemon output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Sequential line number, 0-based from the start of the daemon process.
    pub seq: u64,
    pub stream: OutputStream,
    pub text: String,
}

/// Bounded history of the most recent daemon output lines.
///
/// Holds at most `capacity` lines; when full the oldest line is evicted.
/// The log sink receives every line regardless of this bound.
pub struct OutputHistory {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    next_seq: u64,
}

impl OutputHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(MIN_HISTORY_LINES),
            next_seq: 0,
        }
    }

    /// Appends a line, evicting the oldest if at capacity, and returns the stored copy.
    pub fn push(&mut self, stream: OutputStream, text: String) -> OutputLine {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        let line = OutputLine {
            seq: self.next_seq,
            stream,
            text,
        };
        self.next_seq += 1;
        self.lines.push_back(line.clone());
        line
    }

    /// Copies out the retained lines in arrival order.
    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lines.iter().cloned().collect()
    }

    /// Total lines ever pushed, including evicted ones.
    pub fn total(&self) -> u64 {
        self.next_seq
    }
}

impl Default for OutputHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(h: &mut OutputHistory, n: usize) {
        for i in 0..n {
            h.push(OutputStream::Stdout, format!("line {i}"));
        }
    }

    #[test]
    fn new_clamps_below_min() {
        let mut h = OutputHistory::new(0);
        fill(&mut h, MIN_HISTORY_LINES + 1);
        assert_eq!(h.snapshot().len(), MIN_HISTORY_LINES);
        assert_eq!(h.snapshot()[0].seq, 1);
    }

    #[test]
    fn push_evicts_oldest_line() {
        let mut h = OutputHistory::new(MIN_HISTORY_LINES);
        fill(&mut h, MIN_HISTORY_LINES + 3);
        let snap = h.snapshot();
        assert_eq!(snap.first().unwrap().text, "line 3");
        assert_eq!(snap.last().unwrap().text, format!("line {}", MIN_HISTORY_LINES + 2));
        assert_eq!(h.total(), (MIN_HISTORY_LINES + 3) as u64);
    }

    #[test]
    fn snapshot_preserves_arrival_order_across_streams() {
        let mut h = OutputHistory::default();
        h.push(OutputStream::Stderr, "opening port".into());
        h.push(OutputStream::Stdout, "listening".into());
        let snap = h.snapshot();
        assert_eq!(snap[0].stream, OutputStream::Stderr);
        assert_eq!(snap[1].text, "listening");
        assert!(snap[0].seq < snap[1].seq);
    }

    #[test]
    fn empty_history() {
        let h = OutputHistory::default();
        assert_eq!(h.total(), 0);
        assert!(h.snapshot().is_empty());
    }
}
