//! Fixed-capacity log ring buffer, one per module (spec §4.I). Newest-wins
//! eviction, monotonically increasing sequence numbers, single writer (the
//! module's stderr reader task) and multi-reader (API snapshots copy under
//! a short critical section, per §5's shared-resource policy).

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub seq: u64,
    pub line: String,
}

struct State {
    capacity: usize,
    lines: VecDeque<LogEntry>,
    next_seq: u64,
}

/// Cloneable handle onto a module's log ring buffer.
#[derive(Clone)]
pub struct LogBuffer {
    state: Arc<Mutex<State>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        LogBuffer {
            state: Arc::new(Mutex::new(State {
                capacity: capacity.max(1),
                lines: VecDeque::new(),
                next_seq: 0,
            })),
        }
    }

    /// Append one line, evicting the oldest entry if at capacity.
    pub async fn push(&self, line: impl Into<String>) {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        if state.lines.len() >= state.capacity {
            state.lines.pop_front();
        }
        state.lines.push_back(LogEntry {
            seq,
            line: line.into(),
        });
    }

    /// A snapshot of the currently buffered lines, oldest first.
    pub async fn snapshot(&self) -> Vec<LogEntry> {
        self.state.lock().await.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let logs = LogBuffer::new(2);
        logs.push("a").await;
        logs.push("b").await;
        logs.push("c").await;
        let snap = logs.snapshot().await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].line, "b");
        assert_eq!(snap[1].line, "c");
    }

    #[tokio::test]
    async fn sequence_numbers_increase_monotonically_across_eviction() {
        let logs = LogBuffer::new(1);
        logs.push("a").await;
        logs.push("b").await;
        let snap = logs.snapshot().await;
        assert_eq!(snap[0].seq, 1);
    }
}
