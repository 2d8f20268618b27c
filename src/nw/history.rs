use chrono::Local;
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<T> {
    /// Wall-clock seconds since the UNIX epoch.
    pub timestamp: i64,
    pub value: T,
}

/// Fixed-capacity log of timestamped values. Once full, every append evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct History<T> {
    max: usize,
    entries: VecDeque<Entry<T>>,
}

impl<T: Copy> History<T> {
    /// `max` of zero is bumped to one; a log that can never hold anything is useless.
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            entries: VecDeque::with_capacity(max),
        }
    }

    pub fn append(&mut self, value: T) {
        self.append_at(Local::now().timestamp(), value);
    }

    pub fn append_at(&mut self, timestamp: i64, value: T) {
        if self.entries.len() == self.max {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry { timestamp, value });
    }

    pub fn oldest(&self) -> Option<T> {
        self.entries.front().map(|e| e.value)
    }

    pub fn newest(&self) -> Option<T> {
        self.entries.back().map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Keeps the allocated storage.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries_newest_first(&self) -> impl Iterator<Item = Entry<T>> + '_ {
        self.entries.iter().rev().copied()
    }

    /// Newest entry first; each value is rendered by `writer`.
    pub fn dump<F>(&self, mut writer: F) -> Vec<String>
    where
        F: FnMut(T) -> String,
    {
        self.entries_newest_first().map(|e| writer(e.value)).collect()
    }
}
