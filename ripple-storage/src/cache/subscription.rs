//! RAII subscription guard.

use std::sync::Weak;

use ripple_core::CacheKey;

use super::store::{EntityStore, StoreInner};

/// Keeps a listener attached to a key. Dropping the guard (or calling
/// [`unsubscribe`](Self::unsubscribe)) detaches it; when the last listener
/// of a record detaches, the record's GC timer starts.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: Weak<StoreInner>,
    key: CacheKey,
    id: u64,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(store: Weak<StoreInner>, key: CacheKey, id: u64) -> Self {
        Self {
            store,
            key,
            id,
            active: true,
        }
    }

    /// A guard that was never attached, returned by a disposed store.
    pub(crate) fn detached(key: CacheKey) -> Self {
        Self {
            store: Weak::new(),
            key,
            id: 0,
            active: false,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active && self.store.strong_count() > 0
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.store.upgrade() {
            EntityStore::from_inner(inner).remove_listener(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ripple_core::cache_key;

    use super::super::store::SetOptions;
    use super::*;

    #[test]
    fn test_drop_detaches_listener() {
        let store = EntityStore::default();
        let key = cache_key!["todos", "list"];
        let sub = store.subscribe(key.clone(), |_| {});
        assert!(sub.is_active());
        assert_eq!(store.get(&key).unwrap().subscriber_count, 1);

        drop(sub);
        assert_eq!(store.get(&key).unwrap().subscriber_count, 0);
    }

    #[test]
    fn test_subscription_outliving_store_is_inert() {
        let store = EntityStore::default();
        let sub = store.subscribe(cache_key!["a"], |_| {});
        store.set(cache_key!["a"], 1u8, SetOptions::fresh());
        drop(store);
        assert!(!sub.is_active());
        sub.unsubscribe();
    }

    #[test]
    fn test_disposed_store_hands_out_detached_guards() {
        let store = EntityStore::default();
        store.dispose();
        let sub = store.subscribe(cache_key!["a"], |_| {});
        assert!(!sub.is_active());
        assert!(store.is_empty());
    }
}
