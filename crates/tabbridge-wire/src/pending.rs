//! Tables of in-flight requests keyed by a locally allocated id.

use std::collections::HashMap;

/// In-flight entries keyed by a monotonic id.
///
/// Ids increase until they wrap; an id still held by an outstanding entry
/// is never handed out again.
#[derive(Debug)]
pub struct PendingTable<T> {
    next_id: u64,
    entries: HashMap<u64, T>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: u64) -> Self {
        Self {
            next_id: first_id,
            entries: HashMap::new(),
        }
    }

    /// Store `entry` under a fresh id.
    pub fn insert(&mut self, entry: T) -> u64 {
        let id = loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        self.entries.insert(id, entry);
        id
    }

    pub fn get(&self, id: u64) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every entry matching `pred`, in id order.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<(u64, T)> {
        let mut ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    pub fn drain_all(&mut self) -> Vec<(u64, T)> {
        self.drain_where(|_| true)
    }
}
