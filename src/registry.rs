//! Connection registry
//!
//! Owned map of live connections keyed by a stable id. The bound is explicit
//! and optional; removing an entry runs its teardown, which is where open
//! transfer files get closed.

use std::collections::HashMap;

use crate::error::RegistryFull;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Release whatever an entry owns when it leaves the registry.
pub trait Teardown {
    fn teardown(&mut self) {}
}

#[derive(Debug)]
pub struct Registry<T: Teardown> {
    entries: HashMap<ConnId, T>,
    next_id: u64,
    bound: Option<usize>,
}

impl<T: Teardown> Registry<T> {
    /// `bound` of `None` means unbounded.
    pub fn new(bound: Option<usize>) -> Self {
        Registry {
            entries: HashMap::new(),
            next_id: 1,
            bound,
        }
    }

    /// Registry bound taken from a config value where 0 means unbounded.
    pub fn with_limit(limit: usize) -> Self {
        Self::new((limit > 0).then_some(limit))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.bound.is_some_and(|b| self.entries.len() >= b)
    }

    pub fn bound(&self) -> Option<usize> {
        self.bound
    }

    /// Insert a connection. At the bound the entry is handed back with the
    /// error so the caller can refuse it; nothing is queued.
    pub fn add(&mut self, entry: T) -> Result<ConnId, (RegistryFull, T)> {
        if let Some(bound) = self.bound.filter(|&b| self.entries.len() >= b) {
            return Err((RegistryFull(bound), entry));
        }
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, entry);
        Ok(id)
    }

    pub fn get(&self, id: ConnId) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    /// First entry matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<ConnId> {
        self.entries
            .iter()
            .find(|(_, e)| pred(e))
            .map(|(id, _)| *id)
    }

    /// Remove an entry, running its teardown.
    pub fn remove(&mut self, id: ConnId) -> Option<T> {
        let mut entry = self.entries.remove(&id)?;
        entry.teardown();
        Some(entry)
    }

    /// Ids in ascending (registration) order.
    pub fn ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &T)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    /// Remove every entry, tearing each down.
    pub fn clear(&mut self) {
        for id in self.ids() {
            self.remove(id);
        }
    }
}

impl<T: Teardown> Drop for Registry<T> {
    fn drop(&mut self) {
        self.clear();
    }
}
