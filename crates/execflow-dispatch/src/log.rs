use std::sync::{Arc, PoisonError, RwLock};

use chrono::{Local, SubsecRound};

use execflow_core::types::LogEntry;

/// Append-only record of inbound events, in arrival order.
///
/// Cloning yields another handle to the same log. Only the owning session
/// appends; every other holder reads snapshots.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Arc<RwLock<Vec<LogEntry>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `raw_content` with the local receipt time and append it.
    ///
    /// Timestamps are truncated to milliseconds and never go backwards, even
    /// if the wall clock does.
    pub(crate) fn append(&self, raw_content: String) -> LogEntry {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let now = Local::now().trunc_subsecs(3);
        let timestamp = match entries.last() {
            Some(prev) if prev.timestamp > now => prev.timestamp,
            _ => now,
        };
        let entry = LogEntry::new(timestamp, raw_content);
        entries.push(entry.clone());
        entry
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
