use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, PoisonError, RwLock, Weak},
};

use crate::connection::{Connection, ConnectionRef};

/// A thread-safe map from application keys to live connections.
///
/// Entries do not keep connections alive: a dropped connection simply stops
/// resolving through [`get`](Registry::get), while its key stays joined until
/// it is removed. [`contains`](Registry::contains), [`keys`](Registry::keys)
/// and [`len`](Registry::len) all report joined keys. Applications typically
/// [`join`](Registry::join) in `on_connect` and [`quit`](Registry::quit) in
/// `on_close`.
pub struct Registry<K, M, P = ()> {
    conns: RwLock<HashMap<K, Weak<Connection<M, P>>>>,
}

impl<K, M, P> Default for Registry<K, M, P> {
    fn default() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, M, P> Registry<K, M, P>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<ConnectionRef<M, P>> {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(Weak::upgrade)
    }

    /// Inserts or replaces the entry for `key`. Returns true if an entry was
    /// replaced.
    pub fn join(&self, key: K, conn: &ConnectionRef<M, P>) -> bool {
        self.conns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::downgrade(conn))
            .is_some()
    }

    /// Whether `key` is joined, whether or not its connection is still alive.
    pub fn contains(&self, key: &K) -> bool {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<ConnectionRef<M, P>> {
        self.conns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .and_then(|conn| conn.upgrade())
    }

    /// Removes `key` only while it still refers to `conn`, so a connection
    /// leaving late cannot evict a newer one registered under the same key.
    pub fn quit(&self, key: &K, conn: &ConnectionRef<M, P>) -> bool {
        let mut conns = self.conns.write().unwrap_or_else(PoisonError::into_inner);
        match conns.get(key) {
            Some(current) if current.as_ptr() == Arc::as_ptr(conn) => {
                conns.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the joined keys.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of joined keys.
    pub fn len(&self) -> usize {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
