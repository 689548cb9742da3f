use chrono::{DateTime, Utc};
use comet_core::{ActionId, ActionRequest};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub action: ActionId,
    pub undo: ActionRequest,
    pub recorded_at: DateTime<Utc>,
}

/// Completed actions that can still be undone, oldest first.
#[derive(Debug)]
pub(crate) struct UndoHistory {
    entries: VecDeque<(Instant, HistoryEntry)>,
    limit: usize,
    window: Duration,
}

impl UndoHistory {
    pub(crate) fn new(limit: usize, window: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            window,
        }
    }

    /// Records an entry and returns the actions evicted to make room.
    pub(crate) fn push(&mut self, action: ActionId, undo: ActionRequest) -> Vec<ActionId> {
        let mut evicted = self.expire();
        self.entries.push_back((
            Instant::now(),
            HistoryEntry {
                action,
                undo,
                recorded_at: Utc::now(),
            },
        ));
        while self.entries.len() > self.limit {
            if let Some((_, entry)) = self.entries.pop_front() {
                evicted.push(entry.action);
            }
        }
        evicted
    }

    /// Removes and returns the undo of `action`, if it is still held.
    pub(crate) fn take(&mut self, action: ActionId) -> Option<ActionRequest> {
        self.expire();
        let index = self
            .entries
            .iter()
            .position(|(_, entry)| entry.action == action)?;
        self.entries.remove(index).map(|(_, entry)| entry.undo)
    }

    pub(crate) fn contains(&mut self, action: ActionId) -> bool {
        self.expire();
        self.entries.iter().any(|(_, entry)| entry.action == action)
    }

    pub(crate) fn entries(&mut self) -> Vec<HistoryEntry> {
        self.expire();
        self.entries
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    fn expire(&mut self) -> Vec<ActionId> {
        let mut expired = Vec::new();
        while let Some((at, _)) = self.entries.front() {
            if at.elapsed() < self.window {
                break;
            }
            if let Some((_, entry)) = self.entries.pop_front() {
                expired.push(entry.action);
            }
        }
        expired
    }
}
