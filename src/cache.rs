use parking_lot::RwLock;

use crate::models::RosterSnapshot;

/// Last-known roster snapshot.
#[derive(Debug)]
pub struct ChangeDetectingCache<T> {
    current: RwLock<RosterSnapshot<T>>,
}

impl<T> Default for ChangeDetectingCache<T> {
    fn default() -> Self {
        Self {
            current: RwLock::new(RosterSnapshot::empty()),
        }
    }
}

impl<T: Clone + PartialEq> ChangeDetectingCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, snapshot: RosterSnapshot<T>) {
        *self.current.write() = snapshot;
    }

    pub fn get(&self) -> RosterSnapshot<T> {
        self.current.read().clone()
    }

    /// Returns whether `candidate` differed and replaced the stored snapshot.
    pub fn update(&self, candidate: RosterSnapshot<T>) -> bool {
        let mut current = self.current.write();
        if *current == candidate {
            return false;
        }
        *current = candidate;
        true
    }
}
