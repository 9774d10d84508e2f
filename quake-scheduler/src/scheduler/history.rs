//! Bounded in-memory history of executions, in tick order.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::executor::Execution;

#[derive(Debug)]
pub struct ExecutionHistory {
    capacity: usize,
    entries: RwLock<VecDeque<Execution>>,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(128))),
        }
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&self, execution: Execution) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(execution);
    }

    /// Every retained execution, oldest first.
    pub fn all(&self) -> Vec<Execution> {
        self.entries.read().iter().cloned().collect()
    }

    /// The newest `limit` executions, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Execution> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<Execution> {
        self.entries.read().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Share of failed executions among the newest `window` that had an
    /// outcome. `None` until something has finished.
    pub fn failure_rate(&self, window: usize) -> Option<f64> {
        let entries = self.entries.read();
        let (failed, decided) = entries
            .iter()
            .rev()
            .filter(|e| !e.is_cancelled())
            .take(window)
            .fold((0usize, 0usize), |(failed, decided), e| {
                (failed + usize::from(e.is_failure()), decided + 1)
            });
        (decided > 0).then(|| failed as f64 / decided as f64)
    }
}
