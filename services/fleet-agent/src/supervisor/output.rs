//! Bounded output capture with a fetch watermark.

use std::collections::VecDeque;

/// Ring buffer of recent output lines.
///
/// `fetch_new` advances a watermark so repeated calls deliver each line
/// at most once; lines evicted before they were fetched are simply gone.
#[derive(Debug)]
pub struct OutputRing {
    capacity: usize,
    lines: VecDeque<String>,
    /// Sequence number of the front element.
    head_seq: u64,
    /// Sequence number the next pushed line will get.
    next_seq: u64,
    /// First sequence number not yet delivered.
    fetch_seq: u64,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::with_capacity(capacity.max(1)),
            head_seq: 0,
            next_seq: 0,
            fetch_seq: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.head_seq += 1;
        }
        self.lines.push_back(line);
        self.next_seq += 1;
    }

    /// Lines pushed since the last fetch, oldest first.
    pub fn fetch_new(&mut self) -> Vec<String> {
        let start = self.fetch_seq.max(self.head_seq);
        let new: Vec<String> = self
            .lines
            .iter()
            .skip((start - self.head_seq) as usize)
            .cloned()
            .collect();
        self.fetch_seq = self.next_seq;
        new
    }

    /// Everything currently buffered, without moving the watermark.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_never_redelivers() {
        let mut ring = OutputRing::new(8);
        ring.push("a".to_string());
        ring.push("b".to_string());

        assert_eq!(ring.fetch_new(), vec!["a", "b"]);
        assert!(ring.fetch_new().is_empty());

        ring.push("c".to_string());
        assert_eq!(ring.fetch_new(), vec!["c"]);
    }

    #[test]
    fn eviction_drops_unfetched_lines() {
        let mut ring = OutputRing::new(2);
        for line in ["a", "b", "c", "d"] {
            ring.push(line.to_string());
        }

        // a and b were evicted before anyone fetched them.
        assert_eq!(ring.fetch_new(), vec!["c", "d"]);
        assert_eq!(ring.snapshot(), vec!["c", "d"]);
    }

    #[test]
    fn snapshot_does_not_advance_watermark() {
        let mut ring = OutputRing::new(4);
        ring.push("a".to_string());

        assert_eq!(ring.snapshot(), vec!["a"]);
        assert_eq!(ring.fetch_new(), vec!["a"]);
    }
}
