//! Thread-safe set of archive paths seen during a single Consumer invocation, used to drop
//! in-run duplicate reports before they reach the aggregator.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct ArchivePathSet {
    paths: Mutex<HashSet<String>>,
}

impl ArchivePathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `path`, returning `true` iff it was not already present.
    pub fn insert(&self, path: impl Into<String>) -> bool {
        let mut guard = self.paths.lock().expect("archive path set mutex poisoned");
        guard.insert(path.into())
    }

    pub fn contains(&self, path: &str) -> bool {
        let guard = self.paths.lock().expect("archive path set mutex poisoned");
        guard.contains(path)
    }

    pub fn remove(&self, path: &str) -> bool {
        let mut guard = self.paths.lock().expect("archive path set mutex poisoned");
        guard.remove(path)
    }

    pub fn len(&self) -> usize {
        let guard = self.paths.lock().expect("archive path set mutex poisoned");
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current contents. Does not hold the lock across iteration, so it is safe
    /// to call while another thread is concurrently inserting.
    pub fn snapshot(&self) -> Vec<String> {
        let guard = self.paths.lock().expect("archive path set mutex poisoned");
        guard.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_first_occurrence() {
        let set = ArchivePathSet::new();
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.insert("b"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn remove_and_contains() {
        let set = ArchivePathSet::new();
        set.insert("a");
        assert!(set.contains("a"));
        assert!(set.remove("a"));
        assert!(!set.contains("a"));
        assert!(!set.remove("a"));
    }
}
