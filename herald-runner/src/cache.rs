use ahash::AHashMap;
use herald_list::{ListStore, MailList, Result};
use tracing::warn;

/// The list handles one runner has opened, keyed by list name
///
/// Owned by the runner and torn down with it. With caching disabled every
/// lookup opens the list afresh and only the most recent handle is kept.
#[derive(Debug)]
pub struct ListCache {
    store: ListStore,
    lists: AHashMap<String, MailList>,
    enabled: bool,
}

impl ListCache {
    #[must_use]
    pub fn new(store: ListStore, enabled: bool) -> Self {
        Self {
            store,
            lists: AHashMap::new(),
            enabled,
        }
    }

    pub const fn store(&self) -> &ListStore {
        &self.store
    }

    /// The handle for `name`, opening the list on first use
    ///
    /// # Errors
    /// If the list does not exist or cannot be read
    pub async fn open(&mut self, name: &str) -> Result<&mut MailList> {
        if !self.enabled {
            self.clear();
        }

        if !self.lists.contains_key(name) {
            let list = self.store.open(name).await?;
            self.lists.insert(name.to_string(), list);
        }

        self.lists
            .get_mut(name)
            .ok_or_else(|| herald_list::ListError::UnknownList(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut MailList> {
        self.lists.get_mut(name)
    }

    /// Drop the handle for `name`, releasing its lock if it still holds one
    pub fn evict(&mut self, name: &str) -> Option<MailList> {
        self.lists.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lists.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn clear(&mut self) {
        for (name, list) in self.lists.drain() {
            if list.is_locked() {
                warn!(list = %name, "Dropping a list handle that still holds its lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use herald_list::ListConfig;

    use super::*;

    #[tokio::test]
    async fn test_handles_are_reused_when_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ListStore::new(dir.path());
        store
            .create(ListConfig::new("x", "example.com"))
            .await
            .expect("create");

        let mut cache = ListCache::new(store.clone(), true);
        cache.open("x").await.expect("open").config_mut().moderated = true;
        assert!(cache.open("x").await.expect("open").config().moderated);

        let mut uncached = ListCache::new(store, false);
        uncached.open("x").await.expect("open").config_mut().moderated = true;
        assert!(!uncached.open("x").await.expect("open").config().moderated);
        assert_eq!(uncached.len(), 1);

        assert!(cache.open("missing").await.is_err());
        assert!(cache.evict("x").is_some());
        assert!(cache.is_empty());
    }
}
