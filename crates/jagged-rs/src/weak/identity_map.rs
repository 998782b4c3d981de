use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Address of the shared allocation behind `key`.
///
/// An entry keeps a `Weak` to its key, and a live `Weak` pins the allocation,
/// so an address cannot be reused by a new object while an entry for the old
/// one is still in the table.
fn identity<K>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key) as *const () as usize
}

/// Stored entries (live or dead) below which no automatic sweep runs.
const MIN_SWEEP_LEN: usize = 32;

struct Entry<K, V> {
    key: Weak<K>,
    value: V,
}

impl<K, V> Entry<K, V> {
    fn is_live(&self) -> bool {
        self.key.strong_count() > 0
    }
}

/// Map keyed by object identity that forgets entries whose key died.
///
/// Keys are compared by `Arc` allocation, never by value. The map only holds
/// keys weakly; once the last strong owner of a key is dropped the entry is
/// no longer reported by any query. Dead entries are physically removed by
/// an explicit [`WeakIdentityMap::purge`], or by a mutating call once the
/// table has doubled since the last sweep, which keeps mutation amortized
/// O(1).
pub struct WeakIdentityMap<K, V> {
    entries: HashMap<usize, Entry<K, V>>,
    sweep_at: usize,
    sweeps: usize,
}

impl<K, V> WeakIdentityMap<K, V> {
    pub fn new() -> Self {
        WeakIdentityMap {
            entries: HashMap::new(),
            sweep_at: MIN_SWEEP_LEN,
            sweeps: 0,
        }
    }

    /// Drops every entry whose key has no strong owner left.
    ///
    /// Dropping a value can release the last owner of another key (a value
    /// may hold a key strongly), so the sweep repeats until nothing changes.
    pub fn purge(&mut self) {
        loop {
            let before = self.entries.len();
            self.entries.retain(|_, entry| entry.is_live());
            if self.entries.len() == before {
                break;
            }
        }
        self.sweep_at = (self.entries.len() * 2).max(MIN_SWEEP_LEN);
        self.sweeps += 1;
    }

    fn maybe_purge(&mut self) {
        if self.entries.len() >= self.sweep_at {
            self.purge();
        }
    }

    pub fn contains(&self, key: &Arc<K>) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &Arc<K>) -> Option<&V> {
        self.entries
            .get(&identity(key))
            .filter(|entry| entry.is_live())
            .map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, key: &Arc<K>) -> Option<&mut V> {
        self.entries
            .get_mut(&identity(key))
            .filter(|entry| entry.is_live())
            .map(|entry| &mut entry.value)
    }

    /// Associates `value` with `key`, returning the previous value if any.
    pub fn insert(&mut self, key: &Arc<K>, value: V) -> Option<V> {
        self.maybe_purge();
        self.entries
            .insert(
                identity(key),
                Entry {
                    key: Arc::downgrade(key),
                    value,
                },
            )
            .map(|previous| previous.value)
    }

    /// Returns the value for `key`, inserting `default()` first when absent.
    pub fn get_or_insert_with<F>(&mut self, key: &Arc<K>, default: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        self.maybe_purge();
        &mut self
            .entries
            .entry(identity(key))
            .or_insert_with(|| Entry {
                key: Arc::downgrade(key),
                value: default(),
            })
            .value
    }

    pub fn remove(&mut self, key: &Arc<K>) -> Option<V> {
        self.maybe_purge();
        self.entries
            .remove(&identity(key))
            .map(|entry| entry.value)
    }

    /// Snapshot of the live entries.
    ///
    /// Keys are upgraded up front, so every returned key stays alive for as
    /// long as the caller holds the snapshot.
    pub fn items(&self) -> Vec<(Arc<K>, &V)> {
        self.entries
            .values()
            .filter_map(|entry| entry.key.upgrade().map(|key| (key, &entry.value)))
            .collect()
    }

    /// Snapshot of the live keys.
    pub fn keys(&self) -> Vec<Arc<K>> {
        self.entries
            .values()
            .filter_map(|entry| entry.key.upgrade())
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored entries including dead ones awaiting a purge.
    #[cfg(test)]
    pub(crate) fn entries_len(&self) -> usize {
        self.entries.len()
    }

    /// Number of sweeps run so far, explicit or automatic.
    pub fn sweeps(&self) -> usize {
        self.sweeps
    }
}

impl<K, V: Default> WeakIdentityMap<K, V> {
    /// Returns the value for `key`, inserting `V::default()` first when absent.
    pub fn get_or_default(&mut self, key: &Arc<K>) -> &mut V {
        self.get_or_insert_with(key, V::default)
    }
}

impl<K, V> Default for WeakIdentityMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
