//! Bounded buffer of recent dialogue lines for one conversation.

use std::collections::VecDeque;

/// Most recent dialogue lines, oldest first. Kept in memory only.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    lines: VecDeque<String>,
    capacity: usize,
    last_used: u64,
}

impl ConversationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            last_used: 0,
        }
    }

    /// Mark the history as used at logical time `stamp`.
    pub fn touch(&mut self, stamp: u64) {
        self.last_used = stamp;
    }

    pub fn last_used(&self) -> u64 {
        self.last_used
    }

    /// Append a line, dropping the oldest once full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = ConversationHistory::new(3);
        for i in 0..5 {
            history.push(format!("line {}", i));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.lines(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(history.tail(2), vec!["line 3", "line 4"]);
        assert_eq!(history.tail(10).len(), 3);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut history = ConversationHistory::new(0);
        history.push("a");
        history.push("b");
        assert_eq!(history.lines(), vec!["b"]);
    }
}
