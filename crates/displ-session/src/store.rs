use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("control-plane store unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied for {0}")]
    Denied(String),
}

/// A XenStore-like tree of `/`-separated paths holding string values.
pub trait ControlPlaneStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Option<String>, StoreError>;

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `path` and everything below it.
    fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Names of the direct children of `path`, sorted.
    fn list(&self, path: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
struct Tree {
    values: BTreeMap<String, String>,
    denied: BTreeSet<String>,
}

/// In-memory [`ControlPlaneStore`].
#[derive(Default)]
pub struct MemStore {
    tree: Mutex<Tree>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        match self.tree.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current value at `path`.
    pub fn get(&self, path: &str) -> Option<String> {
        self.lock().values.get(path).cloned()
    }

    /// Make reads and writes of `path` fail with [`StoreError::Denied`].
    pub fn deny(&self, path: &str) {
        self.lock().denied.insert(path.to_owned());
    }

    fn check(tree: &Tree, path: &str) -> Result<(), StoreError> {
        if tree.denied.contains(path) {
            return Err(StoreError::Denied(path.to_owned()));
        }
        Ok(())
    }
}

impl ControlPlaneStore for MemStore {
    fn read(&self, path: &str) -> Result<Option<String>, StoreError> {
        let tree = self.lock();
        Self::check(&tree, path)?;
        Ok(tree.values.get(path).cloned())
    }

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError> {
        let mut tree = self.lock();
        Self::check(&tree, path)?;
        tree.values.insert(path.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StoreError> {
        let mut tree = self.lock();
        Self::check(&tree, path)?;
        let prefix = format!("{path}/");
        tree.values.retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let tree = self.lock();
        Self::check(&tree, path)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let children: BTreeSet<String> = tree
            .values
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(children.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_returns_direct_children() {
        let store = MemStore::new();
        store.write("/fe/0/req-ring-ref", "8").unwrap();
        store.write("/fe/0/evt-ring-ref", "9").unwrap();
        store.write("/fe/1/req-ring-ref", "10").unwrap();
        store.write("/fe/state", "1").unwrap();
        store.write("/fel/x", "1").unwrap();

        assert_eq!(store.list("/fe").unwrap(), vec!["0", "1", "state"]);
        assert_eq!(store.list("/fe/0").unwrap(), vec!["evt-ring-ref", "req-ring-ref"]);
        assert!(store.list("/nothing").unwrap().is_empty());
    }

    #[test]
    fn remove_drops_subtree_only() {
        let store = MemStore::new();
        store.write("/fe/0/a", "1").unwrap();
        store.write("/fe/0", "x").unwrap();
        store.write("/fe/01", "y").unwrap();
        store.remove("/fe/0").unwrap();
        assert_eq!(store.read("/fe/0/a").unwrap(), None);
        assert_eq!(store.read("/fe/0").unwrap(), None);
        assert_eq!(store.get("/fe/01").as_deref(), Some("y"));
    }

    #[test]
    fn denied_paths_fail() {
        let store = MemStore::new();
        store.deny("/fe/id");
        assert_eq!(store.read("/fe/id"), Err(StoreError::Denied("/fe/id".into())));
        assert!(store.write("/fe/id", "K:a").is_err());
    }
}
